//! Liveness monitor task.
//!
//! Drives the hub's probe cycle at a fixed interval. The probing itself
//! runs inside the hub actor, so a tick always sees a stable registry.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::hub::HubHandle;

/// Spawns the periodic liveness task.
///
/// The first tick fires one full interval after start, so freshly
/// registered clients are not probed immediately.
pub fn spawn_liveness_monitor(
    hub: HubHandle,
    period: Duration,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        info!(interval_secs = period.as_secs(), "Liveness monitor started");

        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    info!("Liveness monitor shutting down");
                    break;
                }

                _ = ticker.tick() => {
                    if hub.probe_tick().await.is_err() {
                        // Actor stopped - nothing left to probe
                        debug!("Liveness monitor stopping: hub channel closed");
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubCommand;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_after_each_interval() {
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = spawn_liveness_monitor(
            HubHandle::new(tx),
            Duration::from_secs(15),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_secs(14)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(matches!(rx.recv().await, Some(HubCommand::ProbeTick)));

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(matches!(rx.recv().await, Some(HubCommand::ProbeTick)));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stops_when_hub_closed() {
        let (tx, rx) = mpsc::channel(8);
        drop(rx);

        let task = spawn_liveness_monitor(
            HubHandle::new(tx),
            Duration::from_millis(10),
            CancellationToken::new(),
        );

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
