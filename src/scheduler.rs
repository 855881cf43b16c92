//! Background loops for restart ticks and quota sweeps
//!
//! Both loops stop once the shutdown watch flips to `true`. A tick or sweep
//! that already started runs to completion first.

use crate::quota::QuotaSweeper;
use crate::restart::{ProcessRestarter, RestartCoordinator};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Run `coordinator.tick` every `interval`
pub fn spawn_restart_loop(
    coordinator: Arc<RestartCoordinator>,
    restarter: Arc<dyn ProcessRestarter>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let outcome = coordinator.tick(restarter.as_ref()).await;
                    debug!(?outcome, "Restart tick finished");
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Restart loop stopped");
    })
}

/// Disable exhausted inbounds every `interval` and request a restart when
/// anything was disabled
pub fn spawn_quota_sweep_loop(
    sweeper: QuotaSweeper,
    coordinator: Arc<RestartCoordinator>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match sweeper.disable_expired_or_over_quota() {
                        Ok(0) => {}
                        Ok(disabled) => {
                            info!(disabled, "Disabled inbounds over quota or past expiry");
                            coordinator.mark_dirty();
                        }
                        Err(e) => {
                            error!(error = %e, "Quota sweep failed");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Quota sweep loop stopped");
    })
}
