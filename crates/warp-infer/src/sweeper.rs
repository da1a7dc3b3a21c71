//! Background eviction task

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::manager::Shared;

/// Handle to a running sweeper task
pub(crate) struct Sweeper {
    handle: JoinHandle<()>,
    shutdown: broadcast::Sender<()>,
}

impl Sweeper {
    /// Spawn the sweep loop on `runtime`
    ///
    /// Every `poll_interval` the loop runs one [`Shared::sweep_expired`]
    /// pass. Late ticks are skipped rather than bursted.
    pub(crate) fn spawn(runtime: &Handle, shared: Arc<Shared>, poll_interval: Duration) -> Self {
        let (shutdown, mut rx) = broadcast::channel(1);

        let handle = runtime.spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(poll_interval = ?poll_interval, "Session sweeper started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let evicted = shared.sweep_expired(Instant::now());
                        if !evicted.is_empty() {
                            debug!(evicted = evicted.len(), "Sweep pass evicted sessions");
                        }
                    }
                    _ = rx.recv() => {
                        info!("Session sweeper shutting down");
                        break;
                    }
                }
            }
        });

        Self { handle, shutdown }
    }

    /// Ask the task to stop without waiting for it
    pub(crate) fn signal(&self) {
        // Err only means the task already exited
        let _ = self.shutdown.send(());
    }

    /// Stop the task and wait for it to exit
    pub(crate) async fn stop(self) {
        self.signal();
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                tracing::error!(error = %e, "Session sweeper panicked");
            }
        }
    }

    /// Whether the task is still running
    pub(crate) fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}
