//! Fan-out of snapshots and events to observers.
//!
//! A message is encoded once and the same frame is queued on every
//! observer handle. Iteration runs over a copy of the observer set taken
//! before the loop; observers whose queue rejected the frame are evicted
//! after the loop, so one slow dashboard never stalls the others.

use std::collections::BTreeMap;

use caldera_core::{ConnectionStatus, ControlBinding, NodeId};
use caldera_protocol::ServerMessage;
use tracing::{debug, error, warn};

use crate::peer::{Frame, PeerKey};
use crate::registry::ConnectionRegistry;
use crate::store::StateStore;

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub evicted: usize,
}

/// Connectivity of the two bound control nodes.
pub fn connection_status(
    registry: &ConnectionRegistry,
    binding: &ControlBinding,
) -> BTreeMap<NodeId, ConnectionStatus> {
    [&binding.actuator, &binding.sensor]
        .into_iter()
        .map(|id| {
            (
                id.clone(),
                ConnectionStatus::from_connected(registry.contains_node(id)),
            )
        })
        .collect()
}

/// Builds a full snapshot message from the current state.
pub fn snapshot_message(
    registry: &ConnectionRegistry,
    store: &StateStore,
    binding: &ControlBinding,
) -> ServerMessage {
    ServerMessage::full_state(connection_status(registry, binding), store.snapshot())
}

/// Sends a full snapshot to every observer.
pub fn broadcast_snapshot(
    registry: &mut ConnectionRegistry,
    store: &StateStore,
    binding: &ControlBinding,
) -> BroadcastReport {
    let message = snapshot_message(registry, store, binding);
    broadcast_event(registry, &message)
}

/// Sends one message to every observer.
pub fn broadcast_event(
    registry: &mut ConnectionRegistry,
    message: &ServerMessage,
) -> BroadcastReport {
    let frame = match message.to_frame() {
        Ok(frame) => Frame::from(frame),
        Err(e) => {
            error!(
                message_type = message.type_name(),
                error = %e,
                "Failed to encode broadcast"
            );
            return BroadcastReport::default();
        }
    };

    let observers = registry.observer_handles();
    let mut delivered = 0;
    let mut failed = Vec::new();

    for handle in &observers {
        match handle.send_frame(Frame::clone(&frame)) {
            Ok(()) => delivered += 1,
            Err(e) => {
                debug!(connection = %handle.id(), error = %e, "Broadcast send failed");
                failed.push(handle.id());
            }
        }
    }

    let mut evicted = 0;
    for connection in failed {
        if let Some(entry) = registry.evict_connection(&PeerKey::Observer(connection), connection) {
            entry.handle.close();
            evicted += 1;
            warn!(
                connection = %connection,
                message_type = message.type_name(),
                "Observer evicted after failed broadcast"
            );
        }
    }

    debug!(
        message_type = message.type_name(),
        delivered,
        evicted,
        "Broadcast complete"
    );

    BroadcastReport { delivered, evicted }
}
