//! Shutdown signalling and task health for the daemon.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Owns the shutdown signal and counts tasks that ended abnormally.
pub struct Supervisor {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    /// Tasks that panicked or were cancelled.
    failure_count: AtomicU64,
    started: Instant,
}

impl Supervisor {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            shutdown_tx: tx,
            shutdown_rx: rx,
            failure_count: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// A receiver that flips to `true` on shutdown.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Trigger a graceful shutdown.
    pub fn shutdown(&self) {
        info!("Supervisor: initiating graceful shutdown");
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Record `count` tasks that ended abnormally.
    pub fn record_failures(&self, count: u64) {
        if count == 0 {
            return;
        }
        let total = self.failure_count.fetch_add(count, Ordering::Relaxed) + count;
        warn!(total_failures = total, "Task failure recorded");
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// Wait for a task to finish, recording a panic as a failure.
    pub async fn reap(&self, name: &str, handle: JoinHandle<()>) {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "Task ended abnormally");
            self.record_failures(1);
        }
    }

    pub fn health(&self) -> SupervisorHealth {
        SupervisorHealth {
            is_shutting_down: self.is_shutting_down(),
            failure_count: self.failure_count(),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Health report from the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorHealth {
    pub is_shutting_down: bool,
    pub failure_count: u64,
    pub uptime_secs: u64,
}
