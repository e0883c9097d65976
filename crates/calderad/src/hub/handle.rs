//! Client interface for the hub actor.
//!
//! `HubHandle` is cheap to clone and shared by every connection task,
//! the liveness monitor and the diagnostics task. Channel failures are
//! mapped to `HubError::ChannelClosed`.

use caldera_core::NodeId;
use caldera_protocol::{InboundFrame, Registration};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::commands::{DisconnectReason, HubCommand, HubError, HubSnapshot, HubStats, NodeView};
use crate::peer::{ConnectionHandle, Peer};

/// Handle for interacting with the hub actor.
#[derive(Clone)]
pub struct HubHandle {
    sender: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    pub fn new(sender: mpsc::Sender<HubCommand>) -> Self {
        Self { sender }
    }

    /// Registers a connection that completed its handshake.
    ///
    /// The acknowledgment and any catch-up frames are queued on `handle`
    /// before this returns.
    ///
    /// # Errors
    ///
    /// - `HubError::RoleConflict` if a bound id is claimed with the wrong role
    /// - `HubError::AckFailed` if the connection is already closed
    /// - `HubError::ChannelClosed` if the actor has shut down
    pub async fn register(
        &self,
        handle: ConnectionHandle,
        registration: Registration,
        address: Option<String>,
    ) -> Result<Peer, HubError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(HubCommand::Register {
                handle,
                registration,
                address,
                respond_to: tx,
            })
            .await
            .map_err(|_| HubError::ChannelClosed)?;

        rx.await.map_err(|_| HubError::ChannelClosed)?
    }

    /// Hands a parsed frame to the router.
    pub async fn dispatch(&self, peer: Peer, frame: InboundFrame) -> Result<(), HubError> {
        self.sender
            .send(HubCommand::Inbound {
                peer,
                frame: Box::new(frame),
            })
            .await
            .map_err(|_| HubError::ChannelClosed)
    }

    /// Reports that a connection's read loop ended.
    pub async fn disconnect(&self, peer: Peer, reason: DisconnectReason) -> Result<(), HubError> {
        self.sender
            .send(HubCommand::Disconnect { peer, reason })
            .await
            .map_err(|_| HubError::ChannelClosed)
    }

    /// Reports a disconnect from a synchronous context such as `Drop`.
    ///
    /// Falls back to a spawned send when the command queue is full.
    pub fn disconnect_detached(&self, peer: Peer, reason: DisconnectReason) {
        match self.sender.try_send(HubCommand::Disconnect { peer, reason }) {
            Ok(()) => {}
            Err(TrySendError::Closed(_)) => {
                debug!("Hub closed before disconnect could be reported");
            }
            Err(TrySendError::Full(cmd)) => match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let sender = self.sender.clone();
                    runtime.spawn(async move {
                        let _ = sender.send(cmd).await;
                    });
                }
                Err(_) => {
                    warn!("Disconnect lost: hub queue full and no runtime available");
                }
            },
        }
    }

    /// Triggers one liveness tick.
    pub async fn probe_tick(&self) -> Result<(), HubError> {
        self.sender
            .send(HubCommand::ProbeTick)
            .await
            .map_err(|_| HubError::ChannelClosed)
    }

    /// Returns the global state and bound node connectivity.
    ///
    /// Returns `None` if the actor has shut down.
    pub async fn snapshot(&self) -> Option<HubSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(HubCommand::GetSnapshot { respond_to: tx })
            .await
            .ok()?;
        rx.await.ok()
    }

    pub async fn stats(&self) -> Option<HubStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(HubCommand::GetStats { respond_to: tx })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Lists registered hardware nodes.
    ///
    /// Returns an empty vector if the actor has shut down.
    pub async fn nodes(&self) -> Vec<NodeView> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(HubCommand::GetNodes { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Reads one cached channel.
    pub async fn cache_lookup(
        &self,
        node_id: NodeId,
        device: &str,
        channel: u32,
    ) -> Option<serde_json::Value> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(HubCommand::CacheLookup {
                node_id,
                device: device.to_string(),
                channel,
                respond_to: tx,
            })
            .await
            .ok()?;
        rx.await.ok()?
    }

    /// Whether the actor has shut down.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
