//! Relay hub using the actor pattern.
//!
//! The hub is the single owner of the connection registry and the state
//! store. Connection tasks feed it commands over an mpsc channel; it
//! routes frames, runs fail-safe handling and fans out to observers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  HubCommand   ┌──────────────────┐  frames   ┌─────────────┐
//! │ ConnectionHandler│──────────────▶│     HubActor     │──────────▶│  observers  │
//! │  (per socket)    │   (mpsc)      │ registry + store │           │  & nodes    │
//! └──────────────────┘               └──────────────────┘           └─────────────┘
//!          ▲                                  ▲
//!          │ ConnectionHandle                 │ ProbeTick
//!          │ (bounded queue)                  │
//!     writer task                     liveness monitor
//! ```

use caldera_core::{ControlBinding, DEFAULT_TARGET_VALUE};
use tokio::sync::mpsc;

mod actor;
mod commands;
mod failsafe;
mod handle;
mod router;

pub use actor::HubActor;
pub use commands::{
    DisconnectReason, HubCommand, HubError, HubSnapshot, HubStats, NodeView, RemovalReason,
};
pub use handle::HubHandle;

/// Command channel buffer size.
const COMMAND_BUFFER: usize = 256;

/// Settings the hub needs from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct HubSettings {
    /// Which node ids drive the global state
    pub binding: ControlBinding,

    /// Setpoint before the actuator reports one
    pub default_target: f64,

    pub missed_probe_threshold: u32,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            binding: ControlBinding::default(),
            default_target: DEFAULT_TARGET_VALUE,
            missed_probe_threshold: 3,
        }
    }
}

/// Spawns the hub actor and returns a handle to it.
///
/// The actor stops once every handle has been dropped.
pub fn spawn_hub(settings: HubSettings) -> HubHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);

    let actor = HubActor::new(cmd_rx, settings);
    tokio::spawn(actor.run());

    HubHandle::new(cmd_tx)
}
