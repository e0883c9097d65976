//! Daemon configuration.
//!
//! Settings come from three layers, lowest precedence first:
//! built-in defaults, an optional TOML file, and command-line
//! overrides applied by the binary.
//!
//! ```toml
//! listen = "0.0.0.0:8000"
//! actuator_id = "esp32_02"
//! sensor_id = "esp32_03"
//! probe_interval_secs = 15
//! missed_probe_threshold = 3
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use caldera_core::{
    ControlBinding, DomainError, NodeId, DEFAULT_ACTUATOR_ID, DEFAULT_SENSOR_ID,
    DEFAULT_TARGET_VALUE,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hub::HubSettings;
use crate::server::ServerSettings;

/// Directory under the platform config dir holding the daemon config.
pub const CONFIG_DIR_NAME: &str = "caldera";

/// File name of the daemon config.
pub const CONFIG_FILE_NAME: &str = "calderad.toml";

/// Default listen address.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8000";

/// Effective daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Address the WebSocket endpoint binds to
    pub listen: SocketAddr,

    /// Node id whose state drives the global output
    pub actuator_id: String,

    /// Node id whose measurement feeds the global state
    pub sensor_id: String,

    /// Setpoint used until the actuator reports one
    pub default_target: f64,

    pub probe_interval_secs: u64,

    /// Consecutive unanswered probes before a connection is evicted
    pub missed_probe_threshold: u32,

    /// Capacity of each connection's outbound queue, in frames
    pub outbound_buffer: usize,

    pub write_timeout_secs: u64,

    pub diagnostics_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8000)),
            actuator_id: DEFAULT_ACTUATOR_ID.to_string(),
            sensor_id: DEFAULT_SENSOR_ID.to_string(),
            default_target: DEFAULT_TARGET_VALUE,
            probe_interval_secs: 15,
            missed_probe_threshold: 3,
            outbound_buffer: 64,
            write_timeout_secs: 10,
            diagnostics_interval_secs: 60,
        }
    }
}

impl RelayConfig {
    /// Returns the platform config file location, if the platform has one.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Loads the configuration.
    ///
    /// An explicit path must exist. Without one, the platform default
    /// location is read when present, otherwise built-in defaults apply.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path().filter(|path| path.exists()),
        };

        match path {
            Some(path) => Self::from_file(&path),
            None => Ok(Self::default()),
        }
    }

    /// Reads and validates a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Checks invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("probe_interval_secs", self.probe_interval_secs),
            ("missed_probe_threshold", u64::from(self.missed_probe_threshold)),
            ("outbound_buffer", self.outbound_buffer as u64),
            ("write_timeout_secs", self.write_timeout_secs),
            ("diagnostics_interval_secs", self.diagnostics_interval_secs),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::MustBePositive(*field));
        }

        if !self.default_target.is_finite() {
            return Err(ConfigError::InvalidTarget(self.default_target));
        }

        self.binding().map(|_| ())
    }

    /// Resolves the bound actuator and sensor ids.
    pub fn binding(&self) -> Result<ControlBinding, ConfigError> {
        let actuator = NodeId::parse(&self.actuator_id).map_err(|source| {
            ConfigError::InvalidNodeId {
                field: "actuator_id",
                source,
            }
        })?;
        let sensor =
            NodeId::parse(&self.sensor_id).map_err(|source| ConfigError::InvalidNodeId {
                field: "sensor_id",
                source,
            })?;

        if actuator == sensor {
            return Err(ConfigError::SharedNodeId(actuator.to_string()));
        }

        Ok(ControlBinding::new(actuator, sensor))
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn diagnostics_interval(&self) -> Duration {
        Duration::from_secs(self.diagnostics_interval_secs)
    }

    /// Settings for the hub actor.
    pub fn hub_settings(&self) -> Result<HubSettings, ConfigError> {
        Ok(HubSettings {
            binding: self.binding()?,
            default_target: self.default_target,
            missed_probe_threshold: self.missed_probe_threshold,
        })
    }

    /// Settings for per-connection tasks.
    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            outbound_buffer: self.outbound_buffer,
            write_timeout: self.write_timeout(),
            ..ServerSettings::default()
        }
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Render(e.to_string()))
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("{0} must be greater than zero")]
    MustBePositive(&'static str),

    #[error("default_target must be a finite number, got {0}")]
    InvalidTarget(f64),

    #[error("Invalid {field}: {source}")]
    InvalidNodeId {
        field: &'static str,
        #[source]
        source: DomainError,
    },

    /// Actuator and sensor must be distinct nodes
    #[error("actuator_id and sensor_id must differ (both are {0})")]
    SharedNodeId(String),

    #[error("Failed to render config: {0}")]
    Render(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.listen.to_string(), DEFAULT_LISTEN);
        assert_eq!(config.actuator_id, "esp32_02");
        assert_eq!(config.sensor_id, "esp32_03");
        assert_eq!(config.default_target, 21.5);
        assert_eq!(config.probe_interval(), Duration::from_secs(15));
        assert_eq!(config.missed_probe_threshold, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "listen = \"127.0.0.1:9100\"").unwrap();
        writeln!(file, "missed_probe_threshold = 5").unwrap();

        let config = RelayConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.listen.port(), 9100);
        assert_eq!(config.missed_probe_threshold, 5);
        assert_eq!(config.sensor_id, "esp32_03");
        assert_eq!(config.outbound_buffer, 64);
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = RelayConfig::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "probe_interval = 5").unwrap();

        let err = RelayConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_zero_values_rejected() {
        let config = RelayConfig {
            missed_probe_threshold: 0,
            ..RelayConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MustBePositive("missed_probe_threshold"))
        ));

        let config = RelayConfig {
            probe_interval_secs: 0,
            ..RelayConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MustBePositive("probe_interval_secs"))
        ));
    }

    #[test]
    fn test_identical_ids_rejected() {
        let config = RelayConfig {
            sensor_id: "esp32_02".to_string(),
            ..RelayConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SharedNodeId(_))
        ));
    }

    #[test]
    fn test_blank_id_rejected() {
        let config = RelayConfig {
            actuator_id: "  ".to_string(),
            ..RelayConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidNodeId {
                field: "actuator_id",
                ..
            })
        ));
    }

    #[test]
    fn test_rendered_toml_loads_back() {
        let config = RelayConfig {
            actuator_id: "boiler".to_string(),
            ..RelayConfig::default()
        };
        let rendered = config.to_toml().unwrap();
        let parsed: RelayConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
