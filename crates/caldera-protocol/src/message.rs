//! Protocol message types exchanged over the WebSocket.

use std::collections::BTreeMap;

use caldera_core::{ConnectionStatus, GlobalState, Mode, NodeId, NodeRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::parse::{
    RawCommand, RawConfigUpdate, RawRegister, RawStateQuery, RawStateReport, RawTelemetryReport,
};

/// Messages sent by clients (hardware nodes and observers) to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Registration handshake; must be the first frame of a connection
    Register(RawRegister),

    /// Actuator state report
    #[serde(alias = "status_report", alias = "status_update")]
    StateReport(RawStateReport),

    /// Sensor telemetry report
    #[serde(alias = "sensor_update")]
    TelemetryReport(RawTelemetryReport),

    /// Observer command addressed to a node
    Command(RawCommand),

    /// Observer query for the current state of a node
    GetState(RawStateQuery),

    /// Observer mode/setpoint change for the bound actuator
    ConfigUpdate(RawConfigUpdate),

    /// Client-initiated liveness probe
    #[serde(alias = "liveness_probe")]
    Ping,

    /// Answer to a daemon liveness probe
    #[serde(alias = "liveness_ack")]
    Pong,
}

impl ClientMessage {
    /// Wire name of the message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Register(_) => "register",
            Self::StateReport(_) => "state_report",
            Self::TelemetryReport(_) => "telemetry_report",
            Self::Command(_) => "command",
            Self::GetState(_) => "get_state",
            Self::ConfigUpdate(_) => "config_update",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    /// Creates a registration message.
    pub fn register(role: &str, id: Option<&str>) -> Self {
        Self::Register(RawRegister {
            role: Some(role.to_string()),
            id: id.map(str::to_string),
            hardware_id: None,
        })
    }

    /// Creates an on/off command for channel 0 of a relay.
    pub fn relay_command(to: &str, action: &str) -> Self {
        Self::Command(RawCommand {
            to: to.to_string(),
            device: Some("relay".to_string()),
            channel: Some(0),
            action: action.to_string(),
        })
    }

    /// Creates a state query for every cached channel of a node.
    pub fn get_state(to: &str) -> Self {
        Self::GetState(RawStateQuery {
            to: to.to_string(),
            device: None,
            channel: None,
        })
    }

    /// Encodes the message as a text frame.
    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

/// One cached channel inside a catch-up notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelState {
    pub device: String,
    pub channel: u32,
    pub payload: serde_json::Value,
}

/// Messages sent by the daemon to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Registration accepted
    Registered {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<NodeId>,
        /// Peer address as seen by the daemon
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },

    /// Full snapshot pushed to observers
    FullStateUpdate {
        connection_status: BTreeMap<NodeId, ConnectionStatus>,
        system_state: GlobalState,
        timestamp: DateTime<Utc>,
    },

    /// Node joined; carries its cached channels when sent as catch-up
    NodeOnline {
        id: NodeId,
        role: NodeRole,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        channels: Vec<ChannelState>,
    },

    /// Node left, or a command/query addressed a node that is not registered
    NodeOffline {
        id: NodeId,
    },

    /// Last cached payload of one channel
    State {
        from: NodeId,
        device: String,
        channel: u32,
        payload: serde_json::Value,
    },

    /// Asks a node to report its current state
    #[serde(rename = "get_state")]
    StateRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<u32>,
    },

    /// Mode/setpoint directive for an actuator
    ConfigUpdate {
        mode: Mode,
        /// Firmware reads the setpoint as `target_temp`
        #[serde(rename = "target_temp", alias = "target")]
        target: f64,
    },

    /// Daemon liveness probe
    Ping,

    /// Answer to a client liveness probe
    Pong,

    Error {
        message: String,
    },
}

impl ServerMessage {
    /// Creates a registration acknowledgment.
    pub fn registered(id: Option<NodeId>, address: Option<String>) -> Self {
        Self::Registered { id, address }
    }

    /// Creates a snapshot stamped with the current time.
    pub fn full_state(
        connection_status: BTreeMap<NodeId, ConnectionStatus>,
        system_state: GlobalState,
    ) -> Self {
        Self::FullStateUpdate {
            connection_status,
            system_state,
            timestamp: Utc::now(),
        }
    }

    pub fn node_online(id: NodeId, role: NodeRole) -> Self {
        Self::NodeOnline {
            id,
            role,
            channels: Vec::new(),
        }
    }

    /// Online notice bundling every cached channel of the node.
    pub fn node_catch_up(id: NodeId, role: NodeRole, channels: Vec<ChannelState>) -> Self {
        Self::NodeOnline { id, role, channels }
    }

    pub fn node_offline(id: NodeId) -> Self {
        Self::NodeOffline { id }
    }

    /// Creates the fail-safe directive: manual mode at the given setpoint.
    pub fn manual_mode(target: f64) -> Self {
        Self::ConfigUpdate {
            mode: Mode::Manual,
            target,
        }
    }

    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
        }
    }

    /// Wire name of the message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "registered",
            Self::FullStateUpdate { .. } => "full_state_update",
            Self::NodeOnline { .. } => "node_online",
            Self::NodeOffline { .. } => "node_offline",
            Self::State { .. } => "state",
            Self::StateRequest { .. } => "get_state",
            Self::ConfigUpdate { .. } => "config_update",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error { .. } => "error",
        }
    }

    /// Encodes the message as a text frame.
    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caldera_core::OutputState;

    #[test]
    fn test_registered_omits_missing_fields() {
        let json = ServerMessage::registered(None, None).to_frame().unwrap();
        assert_eq!(json, r#"{"type":"registered"}"#);

        let json = ServerMessage::registered(Some(NodeId::new("esp32_02")), None)
            .to_frame()
            .unwrap();
        assert!(json.contains("\"id\":\"esp32_02\""));
    }

    #[test]
    fn test_full_state_update_shape() {
        let mut status = BTreeMap::new();
        status.insert(NodeId::new("esp32_02"), ConnectionStatus::Connected);
        status.insert(NodeId::new("esp32_03"), ConnectionStatus::Disconnected);

        let msg = ServerMessage::full_state(status, GlobalState::default());
        let value: serde_json::Value = serde_json::from_str(&msg.to_frame().unwrap()).unwrap();

        assert_eq!(value["type"], "full_state_update");
        assert_eq!(value["connection_status"]["esp32_02"], "connected");
        assert_eq!(value["connection_status"]["esp32_03"], "disconnected");
        assert_eq!(value["system_state"]["output_state"], "OFF");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_server_message_round_trip_for_clients() {
        let msg = ServerMessage::manual_mode(21.5);
        let decoded: ServerMessage = serde_json::from_str(&msg.to_frame().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.type_name(), "config_update");
    }

    #[test]
    fn test_manual_mode_uses_firmware_setpoint_name() {
        let json = ServerMessage::manual_mode(23.0).to_frame().unwrap();
        assert_eq!(
            json,
            r#"{"type":"config_update","mode":"MANUAL","target_temp":23.0}"#
        );

        let decoded: ServerMessage =
            serde_json::from_str(r#"{"type":"config_update","mode":"AUTO","target":20.0}"#)
                .unwrap();
        assert_eq!(
            decoded,
            ServerMessage::ConfigUpdate {
                mode: Mode::Auto,
                target: 20.0
            }
        );
    }

    #[test]
    fn test_node_online_channels_only_in_catch_up() {
        let plain = ServerMessage::node_online(NodeId::new("esp32_03"), NodeRole::Sensor);
        assert_eq!(
            plain.to_frame().unwrap(),
            r#"{"type":"node_online","id":"esp32_03","role":"sensor"}"#
        );

        let catch_up = ServerMessage::node_catch_up(
            NodeId::new("esp32_03"),
            NodeRole::Sensor,
            vec![ChannelState {
                device: "sensor".to_string(),
                channel: 0,
                payload: serde_json::json!({"temperature": 20.5}),
            }],
        );
        let value: serde_json::Value =
            serde_json::from_str(&catch_up.to_frame().unwrap()).unwrap();
        assert_eq!(value["channels"][0]["payload"]["temperature"], 20.5);
    }

    #[test]
    fn test_state_request_uses_get_state_type() {
        let msg = ServerMessage::StateRequest {
            device: None,
            channel: None,
        };
        assert_eq!(msg.to_frame().unwrap(), r#"{"type":"get_state"}"#);
    }

    #[test]
    fn test_client_message_helpers() {
        let json = ClientMessage::register("actuator", Some("esp32_02"))
            .to_frame()
            .unwrap();
        assert!(json.contains("\"type\":\"register\""));
        assert!(json.contains("\"role\":\"actuator\""));

        let json = ClientMessage::relay_command("esp32_02", "on").to_frame().unwrap();
        assert!(json.contains("\"to\":\"esp32_02\""));
        assert!(json.contains("\"action\":\"on\""));
    }

    #[test]
    fn test_state_report_serializes_canonical_names() {
        let msg = ClientMessage::StateReport(RawStateReport {
            output: Some(OutputState::On),
            ..Default::default()
        });
        assert_eq!(
            msg.to_frame().unwrap(),
            r#"{"type":"state_report","output":"ON"}"#
        );
    }
}
