//! Node identities, roles and the control binding.

use crate::error::{DomainError, DomainResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Actuator id used by the deployed relay firmware.
pub const DEFAULT_ACTUATOR_ID: &str = "esp32_02";

/// Sensor id used by the deployed probe firmware.
pub const DEFAULT_SENSOR_ID: &str = "esp32_03";

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Stable identifier of a hardware node (e.g. "esp32_02").
///
/// Chosen by the firmware and sent in the registration handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id without validation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a node id, rejecting empty or whitespace-only input.
    ///
    /// Surrounding whitespace is trimmed.
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DomainError::EmptyNodeId);
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Roles
// ============================================================================

/// Role of a hardware node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Drives the physical output (the boiler relay) and reports its state
    Actuator,

    /// Reports a measured quantity (temperature, humidity)
    Sensor,
}

impl NodeRole {
    /// Device type assumed when a report does not name one.
    pub fn default_device(&self) -> &'static str {
        match self {
            Self::Actuator => "relay",
            Self::Sensor => "sensor",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Actuator => "actuator",
            Self::Sensor => "sensor",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role declared by a client in the registration handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientRole {
    Actuator,
    Sensor,
    /// Human-facing client that reads state and issues commands
    Observer,
}

impl ClientRole {
    /// Returns the hardware role, or `None` for observers.
    pub fn node_role(&self) -> Option<NodeRole> {
        match self {
            Self::Actuator => Some(NodeRole::Actuator),
            Self::Sensor => Some(NodeRole::Sensor),
            Self::Observer => None,
        }
    }

    /// Returns true for actuator and sensor roles.
    pub fn is_hardware(&self) -> bool {
        self.node_role().is_some()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Actuator => "actuator",
            Self::Sensor => "sensor",
            Self::Observer => "observer",
        }
    }
}

impl From<NodeRole> for ClientRole {
    fn from(role: NodeRole) -> Self {
        match role {
            NodeRole::Actuator => Self::Actuator,
            NodeRole::Sensor => Self::Sensor,
        }
    }
}

impl FromStr for ClientRole {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "actuator" => Ok(Self::Actuator),
            "sensor" => Ok(Self::Sensor),
            "observer" => Ok(Self::Observer),
            _ => Err(DomainError::invalid(
                "role",
                s,
                "actuator, sensor or observer",
            )),
        }
    }
}

impl fmt::Display for ClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection status of a bound node as shown to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

impl ConnectionStatus {
    pub fn from_connected(connected: bool) -> Self {
        if connected {
            Self::Connected
        } else {
            Self::Disconnected
        }
    }
}

// ============================================================================
// Control Binding
// ============================================================================

/// The actuator and sensor whose reports drive the global state.
///
/// Other hardware nodes may register, but only the bound pair mutates
/// `GlobalState` and only their loss triggers the fail-safe path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlBinding {
    pub actuator: NodeId,
    pub sensor: NodeId,
}

impl ControlBinding {
    pub fn new(actuator: NodeId, sensor: NodeId) -> Self {
        Self { actuator, sensor }
    }

    /// Returns the role a bound id is reserved for, if any.
    pub fn bound_role(&self, id: &NodeId) -> Option<NodeRole> {
        if *id == self.actuator {
            Some(NodeRole::Actuator)
        } else if *id == self.sensor {
            Some(NodeRole::Sensor)
        } else {
            None
        }
    }

    pub fn is_actuator(&self, id: &NodeId) -> bool {
        *id == self.actuator
    }

    pub fn is_sensor(&self, id: &NodeId) -> bool {
        *id == self.sensor
    }
}

impl Default for ControlBinding {
    fn default() -> Self {
        Self::new(
            NodeId::new(DEFAULT_ACTUATOR_ID),
            NodeId::new(DEFAULT_SENSOR_ID),
        )
    }
}
