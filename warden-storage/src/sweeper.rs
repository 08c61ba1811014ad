//! Background TTL sweep.

use crate::engine::StorageEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Handle to the periodic expiry sweep. Stops the task when dropped.
pub struct Sweeper {
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Spawns the sweep on the current tokio runtime.
    ///
    /// The first sweep runs one full `interval` after spawning; reads
    /// in between still expire entries lazily.
    pub fn spawn(engine: Arc<StorageEngine>, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let engine = Arc::clone(&engine);
                match tokio::task::spawn_blocking(move || engine.sweep_expired()).await {
                    Ok(Ok(0)) => {}
                    Ok(Ok(removed)) => debug!(removed, "TTL sweep removed expired entries"),
                    Ok(Err(e)) => warn!(error = %e, "TTL sweep failed"),
                    Err(e) => warn!("TTL sweep task panicked: {}", e),
                }
            }
        });
        Self { handle }
    }

    /// Spawns the sweep with the interval from the engine's config.
    pub fn spawn_configured(engine: Arc<StorageEngine>) -> Self {
        let interval = engine.config().sweep_interval();
        Self::spawn(engine, interval)
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stops the sweep.
    pub fn shutdown(self) {
        self.handle.abort();
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
