//! State store: the global state plus the per-channel report cache.
//!
//! Only the hub actor owns a `StateStore`, so every mutation is
//! serialized with respect to snapshots taken for broadcast.

use caldera_core::{
    CachedPayload, ChannelKey, DomainResult, GlobalState, NodeId, NodeRole, OutputState, StateCache,
    MAX_CHANNELS_PER_NODE,
};
use caldera_protocol::{RawCommand, RawStateReport, RawTelemetryReport};
use serde_json::Value;
use tracing::warn;

/// Global state and report cache.
#[derive(Debug, Clone)]
pub struct StateStore {
    state: GlobalState,
    cache: StateCache,
}

impl StateStore {
    pub fn new(default_target: f64) -> Self {
        Self {
            state: GlobalState::new(default_target),
            cache: StateCache::new(),
        }
    }

    /// Applies a report from the bound actuator and caches it.
    ///
    /// Returns the previous output state when the report changed it.
    pub fn apply_actuator_report(
        &mut self,
        node_id: &NodeId,
        report: &RawStateReport,
        raw: Value,
    ) -> Option<OutputState> {
        self.record_report(
            node_id,
            NodeRole::Actuator,
            report.device.as_deref(),
            report.channel,
            raw,
        );
        self.state.apply_actuator_update(&report.to_update())
    }

    /// Applies a report from the bound sensor and caches it.
    ///
    /// Only the measurement changes; mode and output are untouched.
    pub fn apply_sensor_report(
        &mut self,
        node_id: &NodeId,
        report: &RawTelemetryReport,
        raw: Value,
    ) {
        self.record_report(
            node_id,
            NodeRole::Sensor,
            report.device.as_deref(),
            report.channel,
            raw,
        );
        if let Some(temperature) = report.temperature {
            self.state.set_measurement(temperature);
        }
    }

    /// Caches a report without touching the global state.
    ///
    /// Missing device and channel fall back to the role's default device
    /// and channel 0. Reports for a new channel beyond the per-node limit
    /// are not cached.
    pub fn record_report(
        &mut self,
        node_id: &NodeId,
        role: NodeRole,
        device: Option<&str>,
        channel: Option<u32>,
        raw: Value,
    ) {
        let key = ChannelKey::new(
            node_id.clone(),
            device.unwrap_or(role.default_device()),
            channel.unwrap_or(0),
        );
        if !self.cache.record(key, raw) {
            warn!(
                node = %node_id,
                device = device.unwrap_or(role.default_device()),
                channel = channel.unwrap_or(0),
                limit = MAX_CHANNELS_PER_NODE,
                "Channel limit reached, report not cached"
            );
        }
    }

    /// Resolves the node a command must be forwarded to.
    ///
    /// Commands never mutate state; the actuator's next report does.
    pub fn command_target(&self, command: &RawCommand) -> DomainResult<NodeId> {
        NodeId::parse(&command.to)
    }

    /// Copy of the current global state.
    pub fn snapshot(&self) -> GlobalState {
        self.state.clone()
    }

    pub fn state(&self) -> &GlobalState {
        &self.state
    }

    pub fn cache_lookup(
        &self,
        node_id: &NodeId,
        device: &str,
        channel: u32,
    ) -> Option<&CachedPayload> {
        self.cache.get(&ChannelKey::new(node_id.clone(), device, channel))
    }

    /// Every cached channel of a node, ordered by device then channel.
    pub fn cache_entries<'a>(
        &'a self,
        node_id: &'a NodeId,
    ) -> impl Iterator<Item = (&'a ChannelKey, &'a CachedPayload)> + 'a {
        self.cache.entries_for(node_id)
    }

    pub fn has_reported(&self, node_id: &NodeId) -> bool {
        self.cache.contains_node(node_id)
    }

    pub fn cached_channels(&self) -> usize {
        self.cache.len()
    }

    pub(crate) fn force_output_off(&mut self) -> bool {
        self.state.force_output_off()
    }

    pub(crate) fn clear_measurement(&mut self) {
        self.state.clear_measurement();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caldera_core::Mode;
    use serde_json::json;

    fn actuator() -> NodeId {
        NodeId::new("esp32_02")
    }

    #[test]
    fn test_actuator_report_updates_state_and_cache() {
        let mut store = StateStore::new(21.5);
        let report = RawStateReport {
            output: Some(OutputState::On),
            mode: Some(Mode::Auto),
            ..Default::default()
        };

        let previous = store.apply_actuator_report(
            &actuator(),
            &report,
            json!({"type": "state_report", "output": "ON"}),
        );

        assert_eq!(previous, Some(OutputState::Off));
        assert_eq!(store.state().output_state, OutputState::On);
        assert_eq!(store.state().mode, Mode::Auto);
        assert_eq!(store.state().target_value, 21.5);
        assert!(store.cache_lookup(&actuator(), "relay", 0).is_some());
    }

    #[test]
    fn test_partial_report_keeps_other_fields() {
        let mut store = StateStore::new(21.5);
        store.apply_actuator_report(
            &actuator(),
            &RawStateReport {
                output: Some(OutputState::On),
                ..Default::default()
            },
            json!({}),
        );

        let previous = store.apply_actuator_report(
            &actuator(),
            &RawStateReport {
                target: Some(23.0),
                ..Default::default()
            },
            json!({}),
        );

        assert_eq!(previous, None);
        assert_eq!(store.state().output_state, OutputState::On);
        assert_eq!(store.state().target_value, 23.0);
    }

    #[test]
    fn test_sensor_report_only_touches_measurement() {
        let mut store = StateStore::new(21.5);
        let sensor = NodeId::new("esp32_03");
        store.apply_sensor_report(
            &sensor,
            &RawTelemetryReport {
                temperature: Some(20.5),
                ..Default::default()
            },
            json!({"temperature": 20.5}),
        );

        assert_eq!(store.state().current_measurement, Some(20.5));
        assert_eq!(store.state().output_state, OutputState::Off);
        assert_eq!(
            store.cache_lookup(&sensor, "sensor", 0).unwrap().payload["temperature"],
            20.5
        );
    }

    #[test]
    fn test_cache_only_holds_reporting_nodes() {
        let mut store = StateStore::new(21.5);
        let other = NodeId::new("esp32_07");
        store.record_report(&other, NodeRole::Actuator, Some("relay"), Some(2), json!({}));

        assert!(store.has_reported(&other));
        assert!(!store.has_reported(&actuator()));
        assert_eq!(store.cached_channels(), 1);
        assert_eq!(store.state().output_state, OutputState::Off);
    }

    #[test]
    fn test_unbound_node_cache_is_capped() {
        let mut store = StateStore::new(21.5);
        let other = NodeId::new("esp32_77");
        for channel in 0..100 {
            store.record_report(&other, NodeRole::Actuator, Some("relay"), Some(channel), json!({}));
        }

        assert_eq!(store.cached_channels(), MAX_CHANNELS_PER_NODE);
        assert_eq!(store.cache_entries(&other).count(), MAX_CHANNELS_PER_NODE);
    }

    #[test]
    fn test_command_target_does_not_mutate() {
        let store = StateStore::new(21.5);
        let before = store.snapshot();
        let command = RawCommand {
            to: " esp32_02 ".to_string(),
            device: None,
            channel: None,
            action: "on".to_string(),
        };

        assert_eq!(store.command_target(&command).unwrap(), actuator());
        assert_eq!(store.snapshot(), before);

        let blank = RawCommand {
            to: String::new(),
            ..command
        };
        assert!(store.command_target(&blank).is_err());
    }
}
