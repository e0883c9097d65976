//! Routing of frames from registered connections.
//!
//! | role     | message          | effect                                          |
//! |----------|------------------|-------------------------------------------------|
//! | actuator | state_report     | update state, cache, interlock, snapshot        |
//! | sensor   | telemetry_report | update measurement, cache, snapshot, forward    |
//! | observer | command          | forward verbatim to the addressed node          |
//! | observer | get_state        | answer from cache, else ask the live node       |
//! | observer | config_update    | forward verbatim to the bound actuator          |
//! | any      | ping / pong      | answer / liveness only                          |

use caldera_core::{ClientRole, NodeId, NodeRole};
use caldera_protocol::{
    ClientMessage, InboundFrame, RawCommand, RawStateQuery, RawStateReport, RawTelemetryReport,
    ServerMessage,
};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::actor::HubActor;
use super::commands::RemovalReason;
use crate::peer::{Frame, Peer, PeerKey};

impl HubActor {
    /// Routes one frame. Every frame first counts as liveness traffic.
    pub(super) fn handle_inbound(&mut self, peer: Peer, frame: InboundFrame) {
        if !self.registry.touch(&peer.key, peer.connection) {
            debug!(peer = %peer, "Ignoring frame from superseded connection");
            return;
        }

        let InboundFrame { message, raw } = frame;
        debug!(peer = %peer, message_type = message.type_name(), "Routing frame");

        match (peer.role, message) {
            (_, ClientMessage::Pong) => {}
            (_, ClientMessage::Ping) => self.reply(&peer, &ServerMessage::Pong),
            (_, ClientMessage::Register(_)) => {
                warn!(peer = %peer, "Duplicate registration");
                self.reply(&peer, &ServerMessage::error("already registered"));
            }
            (ClientRole::Actuator, ClientMessage::StateReport(report)) => {
                self.route_state_report(&peer, &report, raw);
            }
            (ClientRole::Sensor, ClientMessage::TelemetryReport(report)) => {
                self.route_telemetry(&peer, &report, raw);
            }
            (ClientRole::Observer, ClientMessage::Command(command)) => {
                self.route_command(&peer, &command, &raw);
            }
            (ClientRole::Observer, ClientMessage::GetState(query)) => {
                self.route_state_query(&peer, &query);
            }
            (ClientRole::Observer, ClientMessage::ConfigUpdate(_)) => {
                self.route_config_update(&peer, &raw);
            }
            (role, message) => {
                warn!(
                    peer = %peer,
                    message_type = message.type_name(),
                    "Unsupported message for role"
                );
                let text = format!("{} is not accepted from {role} clients", message.type_name());
                self.reply(&peer, &ServerMessage::error(&text));
            }
        }
    }

    fn route_state_report(&mut self, peer: &Peer, report: &RawStateReport, raw: Value) {
        let Some(node_id) = peer.node_id() else {
            return;
        };

        if !self.binding.is_actuator(node_id) {
            self.store.record_report(
                node_id,
                NodeRole::Actuator,
                report.device.as_deref(),
                report.channel,
                raw,
            );
            debug!(node = %node_id, "Cached report from unbound actuator");
            return;
        }

        if let Some(previous) = self.store.apply_actuator_report(node_id, report, raw) {
            let state = self.store.state();
            info!(
                node = %node_id,
                from = %previous,
                to = %state.output_state,
                mode = %state.mode,
                target = state.target_value,
                "Output state changed"
            );
        }

        self.enforce_interlock();
        self.broadcast_snapshot();
    }

    fn route_telemetry(&mut self, peer: &Peer, report: &RawTelemetryReport, raw: Value) {
        let Some(node_id) = peer.node_id() else {
            return;
        };

        if !self.binding.is_sensor(node_id) {
            self.store.record_report(
                node_id,
                NodeRole::Sensor,
                report.device.as_deref(),
                report.channel,
                raw,
            );
            debug!(node = %node_id, "Cached report from unbound sensor");
            return;
        }

        let frame = Frame::from(raw.to_string());
        self.store.apply_sensor_report(node_id, report, raw);
        debug!(
            node = %node_id,
            temperature = ?report.temperature,
            humidity = ?report.humidity,
            "Telemetry applied"
        );

        self.broadcast_snapshot();

        // The actuator runs its own thermostat loop on the raw reading
        if let Some(actuator) = self.registry.node(&self.binding.actuator) {
            if let Err(e) = actuator.handle.send_frame(frame) {
                warn!(
                    actuator = %self.binding.actuator,
                    error = %e,
                    "Failed to forward telemetry to actuator"
                );
            }
        }
    }

    fn route_command(&mut self, peer: &Peer, command: &RawCommand, raw: &Value) {
        let target = match self.store.command_target(command) {
            Ok(target) => target,
            Err(e) => {
                self.reply(peer, &ServerMessage::error(&e.to_string()));
                return;
            }
        };

        if self.forward_to_node(peer, &target, Frame::from(raw.to_string())) {
            self.record_commander(peer, &target);
            info!(
                from = %peer,
                to = %target,
                action = %command.action,
                device = ?command.device,
                channel = ?command.channel,
                "Command forwarded"
            );
        }
    }

    fn route_state_query(&mut self, peer: &Peer, query: &RawStateQuery) {
        let target = match NodeId::parse(&query.to) {
            Ok(target) => target,
            Err(e) => {
                self.reply(peer, &ServerMessage::error(&e.to_string()));
                return;
            }
        };

        let answers = self.cached_answers(&target, query);
        if !answers.is_empty() {
            debug!(peer = %peer, target = %target, answers = answers.len(), "State answered from cache");
            for answer in &answers {
                self.reply(peer, answer);
            }
            return;
        }

        let request = ServerMessage::StateRequest {
            device: query.device.clone(),
            channel: query.channel,
        };
        match request.to_frame() {
            Ok(frame) => {
                if self.forward_to_node(peer, &target, Frame::from(frame)) {
                    debug!(peer = %peer, target = %target, "State requested from node");
                }
            }
            Err(e) => error!(error = %e, "Failed to encode state request"),
        }
    }

    fn route_config_update(&mut self, peer: &Peer, raw: &Value) {
        let target = self.binding.actuator.clone();
        if self.forward_to_node(peer, &target, Frame::from(raw.to_string())) {
            self.record_commander(peer, &target);
            info!(from = %peer, to = %target, "Config update forwarded");
        }
    }

    /// Cached `state` answers matching a query's optional filters.
    fn cached_answers(&self, target: &NodeId, query: &RawStateQuery) -> Vec<ServerMessage> {
        let state = |from: &NodeId, device: &str, channel: u32, payload: &Value| {
            ServerMessage::State {
                from: from.clone(),
                device: device.to_string(),
                channel,
                payload: payload.clone(),
            }
        };

        match (query.device.as_deref(), query.channel) {
            (Some(device), Some(channel)) => self
                .store
                .cache_lookup(target, device, channel)
                .map(|cached| state(target, device, channel, &cached.payload))
                .into_iter()
                .collect(),
            (device, channel) => self
                .store
                .cache_entries(target)
                .filter(|(key, _)| device.map_or(true, |d| key.device == d))
                .filter(|(key, _)| channel.map_or(true, |c| key.channel == c))
                .map(|(key, cached)| state(&key.node_id, &key.device, key.channel, &cached.payload))
                .collect(),
        }
    }

    /// Queues a frame on a hardware node.
    ///
    /// When the node is absent, or its queue rejects the frame, the sender
    /// gets a `node_offline` notice and a stale entry is evicted.
    fn forward_to_node(&mut self, peer: &Peer, target: &NodeId, frame: Frame) -> bool {
        let Some(handle) = self.registry.node(target).map(|entry| entry.handle.clone()) else {
            warn!(from = %peer, target = %target, "Forward target not registered");
            self.reply(peer, &ServerMessage::node_offline(target.clone()));
            return false;
        };

        match handle.send_frame(frame) {
            Ok(()) => true,
            Err(e) => {
                warn!(from = %peer, target = %target, error = %e, "Forwarding failed");
                self.reply(peer, &ServerMessage::node_offline(target.clone()));
                self.remove_peer(
                    &PeerKey::Node(target.clone()),
                    handle.id(),
                    RemovalReason::ForwardFailed,
                );
                false
            }
        }
    }

    fn record_commander(&mut self, peer: &Peer, target: &NodeId) {
        let commander = self
            .registry
            .lookup(&peer.key)
            .and_then(|entry| entry.metadata.address.clone())
            .unwrap_or_else(|| peer.connection.to_string());
        self.registry.record_commander(target, commander);
    }
}
