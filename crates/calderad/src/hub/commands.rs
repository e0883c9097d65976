//! Hub actor commands, errors, and read-only views.
//!
//! - `HubCommand`: messages sent to the actor
//! - `HubError`: failures reported back to callers
//! - `HubStats`, `NodeView`, `HubSnapshot`: data returned by queries

use std::collections::BTreeMap;
use std::fmt;

use caldera_core::{ClientRole, ConnectionStatus, GlobalState, NodeId, NodeRole};
use caldera_protocol::{InboundFrame, Registration};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::peer::{ConnectionHandle, ConnectionId, Peer};
use crate::registry::{PeerMetadata, RegistryCounts};

// ============================================================================
// Hub Commands
// ============================================================================

/// Commands processed sequentially by the hub actor.
#[derive(Debug)]
pub enum HubCommand {
    /// Register a connection that completed its handshake.
    ///
    /// # Errors
    /// - `HubError::RoleConflict` if a bound id is claimed with the wrong role
    /// - `HubError::AckFailed` if the acknowledgment could not be queued
    Register {
        handle: ConnectionHandle,
        registration: Registration,
        /// Remote address, echoed in the acknowledgment
        address: Option<String>,
        respond_to: oneshot::Sender<Result<Peer, HubError>>,
    },

    /// A parsed frame from a registered connection. Fire-and-forget.
    Inbound {
        peer: Peer,
        /// Boxed to keep the enum small
        frame: Box<InboundFrame>,
    },

    /// The connection's read loop ended. Fire-and-forget.
    Disconnect {
        peer: Peer,
        reason: DisconnectReason,
    },

    /// One liveness monitor tick. Fire-and-forget.
    ProbeTick,

    GetSnapshot {
        respond_to: oneshot::Sender<HubSnapshot>,
    },

    GetStats {
        respond_to: oneshot::Sender<HubStats>,
    },

    /// List registered hardware nodes.
    GetNodes {
        respond_to: oneshot::Sender<Vec<NodeView>>,
    },

    /// Read one cached channel.
    CacheLookup {
        node_id: NodeId,
        device: String,
        channel: u32,
        respond_to: oneshot::Sender<Option<serde_json::Value>>,
    },
}

// ============================================================================
// Hub Errors
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq)]
pub enum HubError {
    /// The hub actor has shut down.
    #[error("hub channel closed")]
    ChannelClosed,

    /// A bound node id was claimed with the other hardware role.
    #[error("node {id} is bound to the {bound} role, not {claimed}")]
    RoleConflict {
        id: NodeId,
        bound: NodeRole,
        claimed: NodeRole,
    },

    #[error("hardware registration without a node id")]
    MissingNodeId,

    /// The connection was already gone when the hub tried to acknowledge it.
    #[error("failed to acknowledge registration: {0}")]
    AckFailed(String),
}

// ============================================================================
// Reasons
// ============================================================================

/// Why a connection's read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Client sent a close frame or the stream ended
    Closed,

    /// Socket read or write failed
    TransportError,

    /// Writer task gave up on the connection
    WriterClosed,

    /// Daemon shutdown
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed by client"),
            Self::TransportError => write!(f, "transport error"),
            Self::WriterClosed => write!(f, "writer closed"),
            Self::Shutdown => write!(f, "daemon shutdown"),
        }
    }
}

/// Why an entry was removed from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    Disconnected(DisconnectReason),

    /// The liveness probe could not be queued
    ProbeFailed,

    /// Threshold of consecutive probes went unanswered
    MissedProbes(u32),

    /// A command or query could not be forwarded
    ForwardFailed,

    /// A broadcast frame could not be queued
    BroadcastFailed,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected(reason) => write!(f, "disconnected ({reason})"),
            Self::ProbeFailed => write!(f, "liveness probe send failed"),
            Self::MissedProbes(n) => write!(f, "{n} liveness probes unanswered"),
            Self::ForwardFailed => write!(f, "forwarding failed"),
            Self::BroadcastFailed => write!(f, "broadcast send failed"),
        }
    }
}

// ============================================================================
// Views
// ============================================================================

/// Snapshot of the global state and bound node connectivity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HubSnapshot {
    pub connection_status: BTreeMap<NodeId, ConnectionStatus>,
    pub state: GlobalState,
}

/// Registry and cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub actuators: usize,
    pub sensors: usize,
    pub observers: usize,
    pub cached_channels: usize,
}

impl HubStats {
    pub fn from_counts(counts: RegistryCounts, cached_channels: usize) -> Self {
        Self {
            actuators: counts.actuators,
            sensors: counts.sensors,
            observers: counts.observers,
            cached_channels,
        }
    }

    pub fn connections(&self) -> usize {
        self.actuators + self.sensors + self.observers
    }
}

/// Read-only view of a registered hardware node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeView {
    pub id: NodeId,
    pub role: ClientRole,
    /// Whether the node is one of the two bound control nodes
    pub bound: bool,
    #[serde(skip)]
    pub connection: ConnectionId,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub missed_probes: u32,
    pub metadata: PeerMetadata,
}
