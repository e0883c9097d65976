//! Parsing of inbound frames and the raw report shapes sent by firmware.
//!
//! Field names accept the aliases used by the deployed firmware
//! (`relay_state`, `target_temp`, `sensor_update`, ...). All report
//! fields are optional to handle partial updates.

use caldera_core::{ActuatorUpdate, ClientRole, Mode, NodeId, NodeRole, OutputState};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ProtocolError;
use crate::message::ClientMessage;

/// Maximum accepted frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

// ============================================================================
// Raw Message Bodies
// ============================================================================

/// Registration handshake body.
///
/// `role` is kept as a string so an unknown role produces a precise
/// protocol violation instead of a generic decode error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRegister {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Hardware identifier (MAC address or chip id), advisory only
    #[serde(default, alias = "mac", skip_serializing_if = "Option::is_none")]
    pub hardware_id: Option<String>,
}

/// State report from an actuator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawStateReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(
        default,
        alias = "id",
        deserialize_with = "lenient_channel",
        skip_serializing_if = "Option::is_none"
    )]
    pub channel: Option<u32>,
    #[serde(
        default,
        alias = "relay_state",
        alias = "state",
        skip_serializing_if = "Option::is_none"
    )]
    pub output: Option<OutputState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(default, alias = "target_temp", skip_serializing_if = "Option::is_none")]
    pub target: Option<f64>,
}

impl RawStateReport {
    /// Converts to a partial global-state update.
    pub fn to_update(&self) -> ActuatorUpdate {
        ActuatorUpdate {
            mode: self.mode,
            output: self.output,
            target: self.target,
        }
    }
}

/// Telemetry report from a sensor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawTelemetryReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_channel",
        skip_serializing_if = "Option::is_none"
    )]
    pub channel: Option<u32>,
    #[serde(default, alias = "value", skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
}

/// Command from an observer addressed to one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCommand {
    /// Target node id
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(
        default,
        alias = "id",
        deserialize_with = "lenient_channel",
        skip_serializing_if = "Option::is_none"
    )]
    pub channel: Option<u32>,
    pub action: String,
}

/// "Give me current state" query from an observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawStateQuery {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(
        default,
        alias = "id",
        deserialize_with = "lenient_channel",
        skip_serializing_if = "Option::is_none"
    )]
    pub channel: Option<u32>,
}

/// Mode/setpoint change from an observer, forwarded to the bound actuator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawConfigUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(default, alias = "target_temp", skip_serializing_if = "Option::is_none")]
    pub target: Option<f64>,
}

/// Accepts a channel index as a number or numeric string.
///
/// Anything else (e.g. a node id sent in an `id` field by older
/// firmware) is treated as "no channel" rather than failing the frame.
fn lenient_channel<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

// ============================================================================
// Frames
// ============================================================================

/// A decoded inbound frame together with its raw JSON, kept for
/// verbatim forwarding and for the state cache.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub message: ClientMessage,
    pub raw: serde_json::Value,
}

/// Decodes one text frame.
///
/// # Errors
///
/// - `ProtocolError::FrameTooLarge` above `MAX_FRAME_SIZE`
/// - `ProtocolError::MissingField("type")` for objects without a discriminator
/// - `ProtocolError::Malformed` for invalid JSON or unknown message shapes
pub fn parse_frame(text: &str) -> Result<InboundFrame, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: text.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let raw: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let Some(object) = raw.as_object() else {
        return Err(ProtocolError::Malformed(
            "frame must be a JSON object".to_string(),
        ));
    };
    if !object.contains_key("type") {
        return Err(ProtocolError::MissingField("type"));
    }

    let message =
        ClientMessage::deserialize(&raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    Ok(InboundFrame { message, raw })
}

// ============================================================================
// Registration
// ============================================================================

/// A validated registration handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub role: ClientRole,
    /// Present for hardware roles, always `None` for observers
    pub node_id: Option<NodeId>,
    pub hardware_id: Option<String>,
}

impl Registration {
    /// Validates the first message of a connection.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::ExpectedRegister` if the message is not `register`
    /// - `ProtocolError::MissingField("role")` / `InvalidRole` for a bad role
    /// - `ProtocolError::MissingField("id")` / `EmptyNodeId` for a hardware
    ///   role without a usable id
    pub fn from_message(message: ClientMessage) -> Result<Self, ProtocolError> {
        match message {
            ClientMessage::Register(raw) => Self::from_raw(raw),
            other => Err(ProtocolError::ExpectedRegister(other.type_name())),
        }
    }

    fn from_raw(raw: RawRegister) -> Result<Self, ProtocolError> {
        let role_str = raw.role.ok_or(ProtocolError::MissingField("role"))?;
        let role: ClientRole = role_str
            .parse()
            .map_err(|_| ProtocolError::InvalidRole(role_str.clone()))?;

        let node_id = match role {
            ClientRole::Observer => None,
            ClientRole::Actuator | ClientRole::Sensor => {
                let id = raw.id.ok_or(ProtocolError::MissingField("id"))?;
                Some(NodeId::parse(&id).map_err(|_| ProtocolError::EmptyNodeId)?)
            }
        };

        Ok(Self {
            role,
            node_id,
            hardware_id: raw.hardware_id.filter(|h| !h.trim().is_empty()),
        })
    }

    pub fn node_role(&self) -> Option<NodeRole> {
        self.role.node_role()
    }
}

/// Decodes and validates a handshake frame.
pub fn parse_registration(text: &str) -> Result<Registration, ProtocolError> {
    let frame = parse_frame(text)?;
    Registration::from_message(frame.message)
}
