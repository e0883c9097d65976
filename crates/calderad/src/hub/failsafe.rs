//! Fail-safe handling of lost connections.
//!
//! Every removal from the registry goes through [`HubActor::remove_peer`].
//! Losing a bound control node forces the output OFF before observers
//! hear about it. This module is the only place that forces the global
//! state into its safe configuration.

use caldera_core::NodeId;
use caldera_protocol::ServerMessage;
use tracing::{debug, info, warn};

use super::actor::HubActor;
use super::commands::RemovalReason;
use crate::peer::{ConnectionId, PeerKey};

impl HubActor {
    /// Removes an entry still owned by `connection` and runs loss handling.
    ///
    /// Returns false when the entry was already gone or belongs to a newer
    /// connection; nothing is broadcast in that case.
    pub(super) fn remove_peer(
        &mut self,
        key: &PeerKey,
        connection: ConnectionId,
        reason: RemovalReason,
    ) -> bool {
        let Some(entry) = self.registry.evict_connection(key, connection) else {
            return false;
        };
        entry.handle.close();

        match key {
            PeerKey::Observer(_) => {
                info!(
                    connection = %connection,
                    reason = %reason,
                    observers = self.registry.counts().observers,
                    "Observer removed"
                );
            }
            PeerKey::Node(node_id) => self.handle_node_lost(node_id, reason),
        }
        true
    }

    fn handle_node_lost(&mut self, node_id: &NodeId, reason: RemovalReason) {
        if self.binding.is_actuator(node_id) {
            let was_on = self.store.force_output_off();
            warn!(
                node = %node_id,
                reason = %reason,
                was_on,
                "FAIL-SAFE: actuator lost, output forced OFF"
            );
            self.broadcast_snapshot();
            self.broadcast_event(&ServerMessage::node_offline(node_id.clone()));
        } else if self.binding.is_sensor(node_id) {
            self.store.clear_measurement();
            let was_on = self.store.force_output_off();
            warn!(
                node = %node_id,
                reason = %reason,
                was_on,
                "FAIL-SAFE: sensor lost, measurement cleared and output forced OFF"
            );
            self.broadcast_snapshot();
            self.broadcast_event(&ServerMessage::node_offline(node_id.clone()));
            self.send_manual_directive();
        } else {
            info!(node = %node_id, reason = %reason, "Node removed");
            self.broadcast_event(&ServerMessage::node_offline(node_id.clone()));
        }
    }

    /// Tells the actuator to stop acting on readings it no longer gets.
    fn send_manual_directive(&self) {
        let Some(actuator) = self.registry.node(&self.binding.actuator) else {
            debug!("No actuator registered for manual-mode directive");
            return;
        };

        let target = self.store.state().target_value;
        if actuator
            .handle
            .send_best_effort(&ServerMessage::manual_mode(target))
        {
            info!(
                actuator = %self.binding.actuator,
                target,
                "FAIL-SAFE: manual-mode directive sent to actuator"
            );
        }
    }

    /// Re-asserts OFF while either bound node is missing.
    ///
    /// Runs after every actuator report, so a report claiming ON cannot
    /// bring the output back while the loop is incomplete.
    pub(super) fn enforce_interlock(&mut self) {
        let actuator_present = self.registry.contains_node(&self.binding.actuator);
        let sensor_present = self.registry.contains_node(&self.binding.sensor);

        if actuator_present && sensor_present {
            return;
        }

        if self.store.force_output_off() {
            warn!(
                actuator_present,
                sensor_present,
                "FAIL-SAFE: output report ignored while a control node is offline, forced OFF"
            );
        }
    }
}
