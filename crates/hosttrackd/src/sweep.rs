//! Periodic expiration sweep task.

use crate::entity::now_millis;
use crate::manager::DeviceTracker;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Spawns the expiration sweep.
///
/// Runs are strictly serialized: the next delay starts only after the
/// previous pass completes, so a slow pass never overlaps the next one.
/// Cancelling `shutdown` stops the task after at most one interval.
pub fn spawn(tracker: Arc<DeviceTracker>, shutdown: CancellationToken) -> JoinHandle<()> {
    let interval = tracker.config().cleanup_interval();
    tokio::spawn(async move {
        info!(?interval, "expiration sweep started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("expiration sweep stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            let removed = tracker.cleanup_expired(now_millis());
            debug!(removed, "expiration sweep pass complete");
        }
    })
}
