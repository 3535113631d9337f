//! Background correlation sweep task.
//!
//! Periodically evicts expired login attempts from the store.

use std::sync::Weak;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info};

use super::store::CorrelationStore;

/// Default sweep interval in seconds, used by `SamlConfig`.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Spawn a background task that periodically sweeps expired entries.
///
/// The task holds only a weak reference and exits once the store is dropped.
/// Returns a `JoinHandle` that can be used to abort the task.
pub fn spawn_sweep_task(
    store: Weak<CorrelationStore>,
    sweep_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(sweep_interval.max(Duration::from_millis(10)));

        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(store) = store.upgrade() else {
                debug!("Correlation store dropped, stopping sweep");
                break;
            };

            let evicted = store.sweep();
            if evicted > 0 {
                info!(evicted, "Correlation sweep completed");
            } else {
                debug!("Correlation sweep: no expired entries");
            }

            debug!(
                pending = store.pending_count(),
                asserted = store.asserted_count(),
                "Correlation store status"
            );
        }
    })
}
