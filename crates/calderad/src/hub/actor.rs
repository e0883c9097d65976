//! Hub actor - owns the connection registry and the state store.
//!
//! The actor is the single owner of all relay state. Connection tasks,
//! the liveness monitor and diagnostics talk to it through `HubCommand`s
//! on an mpsc channel; commands are processed one at a time, so routing,
//! fail-safe handling and broadcasts always see a consistent view.
//!
//! Message routing lives in `router.rs` and loss handling in
//! `failsafe.rs`; both extend this type.

use caldera_core::{ClientRole, ControlBinding, NodeId, NodeRole};
use caldera_protocol::{ChannelState, Registration, ServerMessage};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::commands::{HubCommand, HubError, HubSnapshot, HubStats, NodeView, RemovalReason};
use super::HubSettings;
use crate::broadcast::{self, BroadcastReport};
use crate::peer::{ConnectionHandle, Peer, PeerKey};
use crate::registry::{ConnectionRegistry, PeerMetadata, RegistrationOutcome};
use crate::store::StateStore;

/// The hub actor.
///
/// # Ownership
///
/// - `registry`: every registered connection and its outbound handle
/// - `store`: the global state and the per-channel report cache
pub struct HubActor {
    receiver: mpsc::Receiver<HubCommand>,
    pub(super) registry: ConnectionRegistry,
    pub(super) store: StateStore,
    pub(super) binding: ControlBinding,
    missed_probe_threshold: u32,
}

impl HubActor {
    pub fn new(receiver: mpsc::Receiver<HubCommand>, settings: HubSettings) -> Self {
        Self {
            receiver,
            registry: ConnectionRegistry::new(),
            store: StateStore::new(settings.default_target),
            binding: settings.binding,
            missed_probe_threshold: settings.missed_probe_threshold.max(1),
        }
    }

    /// Runs the actor until every handle is dropped.
    pub async fn run(mut self) {
        info!(
            actuator = %self.binding.actuator,
            sensor = %self.binding.sensor,
            missed_probe_threshold = self.missed_probe_threshold,
            "Hub actor starting"
        );

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(connections = self.registry.len(), "Hub actor stopped");
    }

    /// Dispatches a command to its handler.
    pub(super) fn handle_command(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register {
                handle,
                registration,
                address,
                respond_to,
            } => {
                let result = self.handle_register(handle, registration, address);
                // The connection task may be gone; its guard cleans up
                respond_to.send(result).ok();
            }
            HubCommand::Inbound { peer, frame } => {
                self.handle_inbound(peer, *frame);
            }
            HubCommand::Disconnect { peer, reason } => {
                let removed =
                    self.remove_peer(&peer.key, peer.connection, RemovalReason::Disconnected(reason));
                if !removed {
                    debug!(peer = %peer, "Disconnect for entry already removed or replaced");
                }
            }
            HubCommand::ProbeTick => {
                self.handle_probe_tick();
            }
            // Query replies are dropped when the requester stopped waiting
            HubCommand::GetSnapshot { respond_to } => {
                respond_to.send(self.snapshot()).ok();
            }
            HubCommand::GetStats { respond_to } => {
                respond_to.send(self.stats()).ok();
            }
            HubCommand::GetNodes { respond_to } => {
                respond_to.send(self.node_views()).ok();
            }
            HubCommand::CacheLookup {
                node_id,
                device,
                channel,
                respond_to,
            } => {
                let payload = self
                    .store
                    .cache_lookup(&node_id, &device, channel)
                    .map(|cached| cached.payload.clone());
                respond_to.send(payload).ok();
            }
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================

    fn handle_register(
        &mut self,
        handle: ConnectionHandle,
        registration: Registration,
        address: Option<String>,
    ) -> Result<Peer, HubError> {
        let metadata = PeerMetadata {
            address,
            hardware_id: registration.hardware_id.clone(),
            ..PeerMetadata::default()
        };

        match registration.node_role() {
            Some(role) => {
                let node_id = registration.node_id.ok_or(HubError::MissingNodeId)?;
                self.register_node(node_id, role, handle, metadata)
            }
            None => self.register_observer(handle, metadata),
        }
    }

    fn register_node(
        &mut self,
        node_id: NodeId,
        role: NodeRole,
        handle: ConnectionHandle,
        metadata: PeerMetadata,
    ) -> Result<Peer, HubError> {
        if let Some(bound) = self.binding.bound_role(&node_id) {
            if bound != role {
                warn!(
                    node = %node_id,
                    bound = %bound,
                    claimed = %role,
                    "Registration rejected: role conflicts with binding"
                );
                return Err(HubError::RoleConflict {
                    id: node_id,
                    bound,
                    claimed: role,
                });
            }
        }

        let ack = ServerMessage::registered(Some(node_id.clone()), metadata.address.clone());
        handle
            .send(&ack)
            .map_err(|e| HubError::AckFailed(e.to_string()))?;

        let connection = handle.id();
        let key = PeerKey::Node(node_id.clone());
        let outcome = self
            .registry
            .register(key.clone(), ClientRole::from(role), handle, metadata);

        match outcome {
            RegistrationOutcome::Created => info!(
                node = %node_id,
                role = %role,
                connection = %connection,
                bound = self.binding.bound_role(&node_id).is_some(),
                "Node registered"
            ),
            RegistrationOutcome::Replaced { previous } => info!(
                node = %node_id,
                role = %role,
                connection = %connection,
                previous = %previous,
                "Node re-registered, previous connection superseded"
            ),
        }

        self.broadcast_event(&ServerMessage::node_online(node_id, role));
        self.broadcast_snapshot();

        Ok(Peer {
            key,
            role: ClientRole::from(role),
            connection,
        })
    }

    fn register_observer(
        &mut self,
        handle: ConnectionHandle,
        metadata: PeerMetadata,
    ) -> Result<Peer, HubError> {
        let ack = ServerMessage::registered(None, metadata.address.clone());
        handle
            .send(&ack)
            .map_err(|e| HubError::AckFailed(e.to_string()))?;

        let connection = handle.id();
        let key = PeerKey::Observer(connection);
        let catch_up = self.catch_up_messages();

        for message in &catch_up {
            if let Err(e) = handle.send(message) {
                warn!(
                    connection = %connection,
                    error = %e,
                    "Observer could not take catch-up, dropping it"
                );
                handle.close();
                return Err(HubError::AckFailed(e.to_string()));
            }
        }

        self.registry
            .register(key.clone(), ClientRole::Observer, handle, metadata);

        info!(
            connection = %connection,
            catch_up = catch_up.len(),
            observers = self.registry.counts().observers,
            "Observer registered"
        );

        Ok(Peer {
            key,
            role: ClientRole::Observer,
            connection,
        })
    }

    /// Snapshot, then one online notice per registered node carrying its
    /// cached channels.
    fn catch_up_messages(&self) -> Vec<ServerMessage> {
        let mut messages = vec![self.snapshot_message()];

        for (node_id, entry) in self.registry.nodes() {
            let Some(role) = entry.role.node_role() else {
                continue;
            };
            let channels = self
                .store
                .cache_entries(node_id)
                .map(|(key, cached)| ChannelState {
                    device: key.device.clone(),
                    channel: key.channel,
                    payload: cached.payload.clone(),
                })
                .collect();
            messages.push(ServerMessage::node_catch_up(node_id.clone(), role, channels));
        }

        messages
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    /// Probes every entry once.
    ///
    /// An entry that already missed `missed_probe_threshold` probes is
    /// evicted instead of probed again. A probe that cannot be queued
    /// evicts immediately.
    fn handle_probe_tick(&mut self) {
        let targets = self.registry.probe_targets();
        let mut evictions = Vec::new();
        let mut probed = 0;

        for target in targets {
            let connection = target.handle.id();

            if target.missed_probes >= self.missed_probe_threshold {
                evictions.push((
                    target.key,
                    connection,
                    RemovalReason::MissedProbes(target.missed_probes),
                ));
                continue;
            }

            match target.handle.send(&ServerMessage::Ping) {
                Ok(()) => {
                    self.registry.record_probe(&target.key, connection);
                    probed += 1;
                }
                Err(e) => {
                    debug!(peer = %target.key, error = %e, "Liveness probe could not be queued");
                    evictions.push((target.key, connection, RemovalReason::ProbeFailed));
                }
            }
        }

        if evictions.is_empty() {
            debug!(probed, "Liveness tick complete");
            return;
        }

        info!(probed, evicting = evictions.len(), "Liveness tick found dead connections");
        for (key, connection, reason) in evictions {
            self.remove_peer(&key, connection, reason);
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    fn snapshot(&self) -> HubSnapshot {
        HubSnapshot {
            connection_status: broadcast::connection_status(&self.registry, &self.binding),
            state: self.store.snapshot(),
        }
    }

    fn stats(&self) -> HubStats {
        HubStats::from_counts(self.registry.counts(), self.store.cached_channels())
    }

    fn node_views(&self) -> Vec<NodeView> {
        self.registry
            .nodes()
            .into_iter()
            .map(|(id, entry)| NodeView {
                id: id.clone(),
                role: entry.role,
                bound: self.binding.bound_role(id).is_some(),
                connection: entry.connection(),
                registered_at: entry.registered_at,
                last_seen: entry.last_seen,
                missed_probes: entry.missed_probes,
                metadata: entry.metadata.clone(),
            })
            .collect()
    }

    // ========================================================================
    // Outbound helpers
    // ========================================================================

    pub(super) fn snapshot_message(&self) -> ServerMessage {
        broadcast::snapshot_message(&self.registry, &self.store, &self.binding)
    }

    pub(super) fn broadcast_snapshot(&mut self) -> BroadcastReport {
        broadcast::broadcast_snapshot(&mut self.registry, &self.store, &self.binding)
    }

    pub(super) fn broadcast_event(&mut self, message: &ServerMessage) -> BroadcastReport {
        broadcast::broadcast_event(&mut self.registry, message)
    }

    /// Sends a message back to the connection a frame came from.
    ///
    /// Dropped when that connection no longer owns its entry; a full
    /// queue is left for the liveness monitor to deal with.
    pub(super) fn reply(&self, peer: &Peer, message: &ServerMessage) {
        let Some(entry) = self
            .registry
            .lookup(&peer.key)
            .filter(|entry| entry.connection() == peer.connection)
        else {
            debug!(peer = %peer, "Reply dropped: peer no longer registered");
            return;
        };

        if let Err(e) = entry.handle.send(message) {
            debug!(
                peer = %peer,
                message_type = message.type_name(),
                error = %e,
                "Reply could not be queued"
            );
        }
    }

    // ========================================================================
    // Accessors (for testing)
    // ========================================================================

    #[cfg(test)]
    pub(super) fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    #[cfg(test)]
    pub(super) fn store(&self) -> &StateStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::commands::DisconnectReason;
    use crate::peer::{ConnectionId, Frame};
    use caldera_core::OutputState;
    use caldera_protocol::parse_frame;
    use tokio::sync::oneshot;

    fn create_actor() -> HubActor {
        let (_tx, rx) = mpsc::channel(16);
        HubActor::new(rx, HubSettings::default())
    }

    fn connect(id: u64) -> (ConnectionHandle, mpsc::Receiver<Frame>) {
        ConnectionHandle::channel(ConnectionId::new(id), 32)
    }

    fn register(
        actor: &mut HubActor,
        handle: ConnectionHandle,
        role: &str,
        node: Option<&str>,
    ) -> Result<Peer, HubError> {
        let registration = Registration::from_message(
            caldera_protocol::ClientMessage::register(role, node),
        )
        .unwrap();
        let (tx, mut rx) = oneshot::channel();
        actor.handle_command(HubCommand::Register {
            handle,
            registration,
            address: Some("127.0.0.1:5000".to_string()),
            respond_to: tx,
        });
        rx.try_recv().unwrap()
    }

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<serde_json::Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    fn types(frames: &[serde_json::Value]) -> Vec<String> {
        frames
            .iter()
            .map(|f| f["type"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn test_register_actuator_acknowledges() {
        let mut actor = create_actor();
        let (handle, mut rx) = connect(1);

        let peer = register(&mut actor, handle, "actuator", Some("esp32_02")).unwrap();

        assert_eq!(peer.role, ClientRole::Actuator);
        assert_eq!(actor.registry().counts().actuators, 1);
        let frames = drain(&mut rx);
        assert_eq!(frames[0]["type"], "registered");
        assert_eq!(frames[0]["id"], "esp32_02");
        assert_eq!(frames[0]["address"], "127.0.0.1:5000");
    }

    #[test]
    fn test_bound_id_with_wrong_role_is_rejected() {
        let mut actor = create_actor();
        let (handle, mut rx) = connect(1);

        let err = register(&mut actor, handle, "sensor", Some("esp32_02")).unwrap_err();

        assert!(matches!(err, HubError::RoleConflict { .. }));
        assert!(actor.registry().is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_node_registration_notifies_observers() {
        let mut actor = create_actor();
        let (observer, mut observer_rx) = connect(1);
        register(&mut actor, observer, "observer", None).unwrap();
        drain(&mut observer_rx);

        let (sensor, _sensor_rx) = connect(2);
        register(&mut actor, sensor, "sensor", Some("esp32_03")).unwrap();

        let frames = drain(&mut observer_rx);
        assert_eq!(types(&frames), vec!["node_online", "full_state_update"]);
        assert_eq!(frames[0]["id"], "esp32_03");
        assert_eq!(frames[1]["connection_status"]["esp32_03"], "connected");
    }

    #[test]
    fn test_observer_catch_up() {
        let mut actor = create_actor();
        let (actuator, _actuator_rx) = connect(1);
        let peer = register(&mut actor, actuator, "actuator", Some("esp32_02")).unwrap();
        let frame = parse_frame(r#"{"type":"state_report","relay_state":"on"}"#).unwrap();
        actor.handle_command(HubCommand::Inbound {
            peer,
            frame: Box::new(frame),
        });

        let (observer, mut observer_rx) = connect(2);
        register(&mut actor, observer, "observer", None).unwrap();

        let frames = drain(&mut observer_rx);
        assert_eq!(
            types(&frames),
            vec!["registered", "full_state_update", "node_online"]
        );
        assert_eq!(frames[2]["id"], "esp32_02");
        assert_eq!(frames[2]["channels"][0]["device"], "relay");
    }

    #[test]
    fn test_catch_up_fits_queue_with_many_cached_channels() {
        let mut actor = create_actor();
        let (node, _node_rx) = connect(1);
        let peer = register(&mut actor, node, "actuator", Some("esp32_77")).unwrap();
        for channel in 0..100 {
            let json = format!(r#"{{"type":"state_report","channel":{channel},"output":"ON"}}"#);
            actor.handle_command(HubCommand::Inbound {
                peer: peer.clone(),
                frame: Box::new(parse_frame(&json).unwrap()),
            });
        }

        // Smaller than the number of reported channels
        let (observer, mut observer_rx) = ConnectionHandle::channel(ConnectionId::new(2), 8);
        register(&mut actor, observer, "observer", None).unwrap();

        let frames = drain(&mut observer_rx);
        assert_eq!(
            types(&frames),
            vec!["registered", "full_state_update", "node_online"]
        );
        let channels = frames[2]["channels"].as_array().unwrap();
        assert_eq!(channels.len(), caldera_core::MAX_CHANNELS_PER_NODE);
        assert_eq!(actor.registry().counts().observers, 1);
    }

    #[test]
    fn test_probe_tick_counts_and_evicts() {
        let mut actor = create_actor();
        let (actuator, mut rx) = connect(1);
        register(&mut actor, actuator, "actuator", Some("esp32_02")).unwrap();
        drain(&mut rx);

        for expected in 1..=3 {
            actor.handle_command(HubCommand::ProbeTick);
            let key = PeerKey::Node(NodeId::new("esp32_02"));
            assert_eq!(actor.registry().lookup(&key).unwrap().missed_probes, expected);
        }
        assert_eq!(types(&drain(&mut rx)), vec!["ping", "ping", "ping"]);

        actor.handle_command(HubCommand::ProbeTick);
        assert!(actor.registry().is_empty());
        assert_eq!(actor.store().state().output_state, OutputState::Off);
    }

    #[test]
    fn test_probe_send_failure_evicts_immediately() {
        let mut actor = create_actor();
        let (observer, rx) = connect(1);
        register(&mut actor, observer, "observer", None).unwrap();
        drop(rx);

        actor.handle_command(HubCommand::ProbeTick);

        assert!(actor.registry().is_empty());
    }

    #[test]
    fn test_stale_disconnect_keeps_replacement() {
        let mut actor = create_actor();
        let (first, _first_rx) = connect(1);
        let old_peer = register(&mut actor, first, "actuator", Some("esp32_02")).unwrap();
        let (second, _second_rx) = connect(2);
        register(&mut actor, second, "actuator", Some("esp32_02")).unwrap();

        actor.handle_command(HubCommand::Disconnect {
            peer: old_peer,
            reason: DisconnectReason::Closed,
        });

        let entry = actor.registry().node(&NodeId::new("esp32_02")).unwrap();
        assert_eq!(entry.connection(), ConnectionId::new(2));
    }

    #[tokio::test]
    async fn test_queries() {
        let mut actor = create_actor();
        let (sensor, _rx) = connect(1);
        let peer = register(&mut actor, sensor, "sensor", Some("esp32_03")).unwrap();
        let frame = parse_frame(r#"{"type":"telemetry_report","temperature":19.0}"#).unwrap();
        actor.handle_command(HubCommand::Inbound {
            peer,
            frame: Box::new(frame),
        });

        let (tx, rx) = oneshot::channel();
        actor.handle_command(HubCommand::GetStats { respond_to: tx });
        let stats = rx.await.unwrap();
        assert_eq!(stats.sensors, 1);
        assert_eq!(stats.cached_channels, 1);

        let (tx, rx) = oneshot::channel();
        actor.handle_command(HubCommand::CacheLookup {
            node_id: NodeId::new("esp32_03"),
            device: "sensor".to_string(),
            channel: 0,
            respond_to: tx,
        });
        let payload = rx.await.unwrap().unwrap();
        assert_eq!(payload["temperature"], 19.0);

        let (tx, rx) = oneshot::channel();
        actor.handle_command(HubCommand::GetSnapshot { respond_to: tx });
        let snapshot = rx.await.unwrap();
        assert_eq!(snapshot.state.current_measurement, Some(19.0));

        let (tx, rx) = oneshot::channel();
        actor.handle_command(HubCommand::GetNodes { respond_to: tx });
        let nodes = rx.await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].bound);
        assert_eq!(nodes[0].metadata.address.as_deref(), Some("127.0.0.1:5000"));
    }
}
