//! Canonical global state of the heating system.

use crate::error::DomainError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Setpoint used until the actuator reports its own.
pub const DEFAULT_TARGET_VALUE: f64 = 21.5;

// ============================================================================
// Mode / Output State
// ============================================================================

/// Control mode of the actuator.
///
/// Serialized upper-case; parsed case-insensitively since firmware
/// revisions disagree on casing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    /// Output follows explicit commands
    #[default]
    Manual,

    /// Actuator-side thermostat logic drives the output
    Auto,
}

impl FromStr for Mode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MANUAL" => Ok(Self::Manual),
            "AUTO" => Ok(Self::Auto),
            _ => Err(DomainError::invalid("mode", s, "MANUAL or AUTO")),
        }
    }
}

impl<'de> Deserialize<'de> for Mode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => f.write_str("MANUAL"),
            Self::Auto => f.write_str("AUTO"),
        }
    }
}

/// Commanded/reported state of the physical output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutputState {
    On,
    /// The safe state
    #[default]
    Off,
}

impl OutputState {
    pub fn is_on(&self) -> bool {
        matches!(self, Self::On)
    }
}

impl FromStr for OutputState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ON" => Ok(Self::On),
            "OFF" => Ok(Self::Off),
            _ => Err(DomainError::invalid("output state", s, "ON or OFF")),
        }
    }
}

impl<'de> Deserialize<'de> for OutputState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for OutputState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => f.write_str("ON"),
            Self::Off => f.write_str("OFF"),
        }
    }
}

// ============================================================================
// Global State
// ============================================================================

/// Partial update carried by an actuator state report.
///
/// `None` fields keep their previous value.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ActuatorUpdate {
    pub mode: Option<Mode>,
    pub output: Option<OutputState>,
    pub target: Option<f64>,
}

impl ActuatorUpdate {
    pub fn is_empty(&self) -> bool {
        self.mode.is_none() && self.output.is_none() && self.target.is_none()
    }
}

/// The single canonical record of system state.
///
/// Cloning yields an immutable snapshot; all mutation goes through the
/// methods below so `last_update` is always maintained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalState {
    pub mode: Mode,
    pub output_state: OutputState,
    /// Last trusted sensor reading; `None` while the sensor is not trusted
    #[serde(default)]
    pub current_measurement: Option<f64>,
    pub target_value: f64,
    pub last_update: DateTime<Utc>,
}

impl GlobalState {
    /// Creates the initial state: manual mode, output off, no measurement.
    pub fn new(target_value: f64) -> Self {
        Self {
            mode: Mode::Manual,
            output_state: OutputState::Off,
            current_measurement: None,
            target_value,
            last_update: Utc::now(),
        }
    }

    /// Applies a (possibly partial) actuator report.
    ///
    /// Returns the previous output state when the report changed it.
    pub fn apply_actuator_update(&mut self, update: &ActuatorUpdate) -> Option<OutputState> {
        let previous = self.output_state;

        if let Some(mode) = update.mode {
            self.mode = mode;
        }
        if let Some(output) = update.output {
            self.output_state = output;
        }
        if let Some(target) = update.target {
            if target.is_finite() {
                self.target_value = target;
            }
        }
        self.last_update = Utc::now();

        (previous != self.output_state).then_some(previous)
    }

    /// Records a new sensor reading. Non-finite readings are discarded.
    pub fn set_measurement(&mut self, value: f64) {
        if value.is_finite() {
            self.current_measurement = Some(value);
            self.last_update = Utc::now();
        }
    }

    /// Marks the measurement as untrusted.
    pub fn clear_measurement(&mut self) {
        self.current_measurement = None;
        self.last_update = Utc::now();
    }

    /// Forces the output into its safe state.
    ///
    /// Returns true if the output was on.
    pub fn force_output_off(&mut self) -> bool {
        let was_on = self.output_state.is_on();
        self.output_state = OutputState::Off;
        self.last_update = Utc::now();
        was_on
    }
}

impl Default for GlobalState {
    fn default() -> Self {
        Self::new(DEFAULT_TARGET_VALUE)
    }
}
