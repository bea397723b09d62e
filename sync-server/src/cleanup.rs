//! Background maintenance task.
//!
//! Runs periodically to evict idle rate-limiter keys and unused entries
//! from the group lock registry.

use crate::config::CleanupConfig;
use crate::server::SyncServer;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// One maintenance pass.
///
/// Returns the number of lock registry entries evicted.
pub fn run_cleanup(server: &SyncServer) -> usize {
    server.rate_limits().shrink();
    let pruned = server.service().locks().prune();

    if pruned > 0 {
        tracing::info!(
            pruned,
            locked = server.service().locks().len(),
            "Cleanup: evicted idle group locks"
        );
    } else {
        tracing::debug!(
            locked = server.service().locks().len(),
            device_keys = server.rate_limits().request_keys_count(),
            "Cleanup: nothing to evict"
        );
    }
    pruned
}

/// Spawn the background maintenance task.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_cleanup_task(
    server: Arc<SyncServer>,
    config: CleanupConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("Cleanup task disabled");
            return;
        }

        let interval_secs = config.interval_secs.max(1);
        tracing::info!(interval_secs, "Cleanup task started");

        let mut timer = interval(Duration::from_secs(interval_secs));

        loop {
            timer.tick().await;
            run_cleanup(&server);
        }
    })
}
