//! Periodic diagnostics for the relay daemon.
//!
//! Every interval the task builds a [`DiagnosticsReport`] from the hub's
//! stats and snapshot plus a sample of the daemon's own footprint, logs
//! it, and logs each [`Concern`] the report raises at `warn`.

use std::process;
use std::time::Duration;

use caldera_core::{ConnectionStatus, NodeId, OutputState};
use sysinfo::{Pid, System};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hub::{HubHandle, HubSnapshot, HubStats};

/// Resident memory above which the daemon warns, in MB.
pub const MEMORY_WARN_MB: u64 = 100;

/// Process CPU above which the daemon warns, as percent of one core.
pub const CPU_WARN_PERCENT: f32 = 80.0;

/// Something in a report worth a warning.
#[derive(Debug, Clone, PartialEq)]
pub enum Concern {
    /// Bound control nodes that are not connected
    ControlLoopIncomplete(Vec<NodeId>),
    /// A bound node is missing but the output is not OFF
    OutputNotSafe,
    MemoryHigh { memory_mb: u64 },
    CpuHigh { cpu_percent: f32 },
}

/// One diagnostics tick.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticsReport {
    pub stats: HubStats,
    pub snapshot: HubSnapshot,
    pub memory_mb: u64,
    pub cpu_percent: f32,
}

impl DiagnosticsReport {
    /// Bound nodes reported as disconnected in the snapshot.
    pub fn offline_control_nodes(&self) -> Vec<NodeId> {
        self.snapshot
            .connection_status
            .iter()
            .filter(|(_, status)| **status == ConnectionStatus::Disconnected)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Concerns raised by this report, control loop first.
    pub fn concerns(&self) -> Vec<Concern> {
        let mut concerns = Vec::new();

        let offline = self.offline_control_nodes();
        if !offline.is_empty() {
            if self.snapshot.state.output_state != OutputState::Off {
                concerns.push(Concern::OutputNotSafe);
            }
            concerns.push(Concern::ControlLoopIncomplete(offline));
        }
        if self.memory_mb > MEMORY_WARN_MB {
            concerns.push(Concern::MemoryHigh {
                memory_mb: self.memory_mb,
            });
        }
        if self.cpu_percent > CPU_WARN_PERCENT {
            concerns.push(Concern::CpuHigh {
                cpu_percent: self.cpu_percent,
            });
        }

        concerns
    }

    fn log(&self) {
        for concern in self.concerns() {
            match concern {
                Concern::ControlLoopIncomplete(offline) => warn!(
                    offline = ?offline,
                    output = %self.snapshot.state.output_state,
                    "Control loop incomplete: bound node offline"
                ),
                Concern::OutputNotSafe => warn!(
                    output = %self.snapshot.state.output_state,
                    "Output not OFF while a bound node is offline"
                ),
                Concern::MemoryHigh { memory_mb } => warn!(
                    memory_mb,
                    threshold_mb = MEMORY_WARN_MB,
                    "Daemon memory above threshold"
                ),
                Concern::CpuHigh { cpu_percent } => warn!(
                    cpu_percent = format!("{cpu_percent:.1}"),
                    threshold_percent = CPU_WARN_PERCENT,
                    "Daemon CPU above threshold"
                ),
            }
        }

        info!(
            actuators = self.stats.actuators,
            sensors = self.stats.sensors,
            observers = self.stats.observers,
            cached_channels = self.stats.cached_channels,
            mode = %self.snapshot.state.mode,
            output = %self.snapshot.state.output_state,
            measurement = ?self.snapshot.state.current_measurement,
            memory_mb = self.memory_mb,
            cpu_percent = format!("{:.1}", self.cpu_percent),
            "Relay status"
        );
    }
}

/// Reads memory and CPU of the daemon process.
struct SelfFootprint {
    system: System,
    pid: Pid,
}

impl SelfFootprint {
    fn new() -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(process::id()),
        }
    }

    /// Memory in MB and CPU since the previous read.
    fn read(&mut self) -> (u64, f32) {
        // CPU of one process needs the global CPU times refreshed too
        self.system.refresh_all();

        self.system
            .process(self.pid)
            .map_or((0, 0.0), |p| (p.memory() / (1024 * 1024), p.cpu_usage()))
    }
}

/// Spawns the diagnostics task.
pub fn spawn_diagnostics_task(
    hub: HubHandle,
    period: Duration,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut footprint = SelfFootprint::new();
        let mut tick = interval(period);

        // First read only sets the CPU baseline
        footprint.read();
        info!(interval_secs = period.as_secs(), "Diagnostics started");

        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    info!("Diagnostics shutting down");
                    break;
                }

                _ = tick.tick() => {
                    let (Some(stats), Some(snapshot)) = (hub.stats().await, hub.snapshot().await) else {
                        debug!("Diagnostics stopping: hub channel closed");
                        break;
                    };
                    let (memory_mb, cpu_percent) = footprint.read();
                    DiagnosticsReport {
                        stats,
                        snapshot,
                        memory_mb,
                        cpu_percent,
                    }
                    .log();
                }
            }
        }

        debug!("Diagnostics task completed");
    })
}
