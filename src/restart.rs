//! Debounced restarts of the supervised proxy process
//!
//! Every configuration change marks the coordinator dirty. A periodic tick
//! reads and clears the flag in one atomic step and, if it was set, restarts
//! the process once. Any number of changes between two ticks therefore cost
//! a single restart.
//!
//! A separate restarting flag keeps two restarts from overlapping. Changes
//! that arrive while a restart is running leave the flag dirty for the next
//! tick. A failed restart is not retried on its own; the next change (or an
//! operator) re-arms it.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Blocking restart of the supervised process
#[async_trait]
pub trait ProcessRestarter: Send + Sync {
    /// Restart the process with the current configuration.
    ///
    /// Without `force_full_reload` an implementation may skip the restart
    /// when the process already runs the current configuration.
    async fn restart(&self, force_full_reload: bool) -> Result<()>;
}

/// What a single tick did
#[derive(Debug)]
pub enum TickOutcome {
    /// Nothing changed since the last tick
    Clean,
    /// Another restart was still running; the dirty flag was left alone
    Busy,
    /// The process was restarted
    Restarted,
    /// The restart failed or timed out; it will not be retried automatically
    Failed(Error),
}

/// Owns the dirty and restarting flags
pub struct RestartCoordinator {
    dirty: AtomicBool,
    restarting: AtomicBool,
    restart_timeout: Duration,
}

/// Releases the restarting flag when the restart ends, even on panic
struct RestartingGuard<'a>(&'a AtomicBool);

impl Drop for RestartingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RestartCoordinator {
    pub fn new(restart_timeout: Duration) -> Self {
        Self {
            dirty: AtomicBool::new(false),
            restarting: AtomicBool::new(false),
            restart_timeout,
        }
    }

    /// Record that the configuration changed
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::SeqCst)
    }

    fn try_begin_restart(&self) -> Option<RestartingGuard<'_>> {
        self.restarting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RestartingGuard(&self.restarting))
    }

    /// Restart the process if anything changed since the previous tick
    pub async fn tick(&self, restarter: &dyn ProcessRestarter) -> TickOutcome {
        let Some(_guard) = self.try_begin_restart() else {
            debug!("Restart still in progress, skipping tick");
            return TickOutcome::Busy;
        };

        if !self.dirty.swap(false, Ordering::SeqCst) {
            return TickOutcome::Clean;
        }

        info!("Configuration changed, restarting proxy process");
        match self.run_restart(restarter, false).await {
            Ok(()) => TickOutcome::Restarted,
            Err(e) => {
                error!(error = %e, "Restarting proxy process failed");
                TickOutcome::Failed(e)
            }
        }
    }

    /// Restart immediately on operator request
    ///
    /// Fails when another restart is already running. The pending dirty flag
    /// is consumed because this restart applies the latest configuration.
    pub async fn restart_now(&self, restarter: &dyn ProcessRestarter, force: bool) -> Result<()> {
        let Some(_guard) = self.try_begin_restart() else {
            warn!("Manual restart rejected, another restart is in progress");
            return Err(Error::process("restart already in progress"));
        };

        self.dirty.store(false, Ordering::SeqCst);
        info!(force, "Manual restart of proxy process");
        self.run_restart(restarter, force).await
    }

    async fn run_restart(&self, restarter: &dyn ProcessRestarter, force: bool) -> Result<()> {
        match tokio::time::timeout(self.restart_timeout, restarter.restart(force)).await {
            Ok(result) => result,
            Err(_) => Err(Error::process(format!(
                "restart timed out after {:?}",
                self.restart_timeout
            ))),
        }
    }
}
