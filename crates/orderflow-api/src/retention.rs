//! Periodic compaction of fully delivered events.

use std::sync::Arc;

use orderflow_core::clock::Clock;
use orderflow_core::error::DomainError;
use orderflow_core::repository::EventStore;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::RetentionConfig;

/// Removes events older than `horizon` whose deliveries were all delivered.
/// Returns the number of events removed.
///
/// # Errors
///
/// Returns `DomainError::Storage` if the store fails.
pub async fn compact_once(
    events: &dyn EventStore,
    clock: &dyn Clock,
    horizon: std::time::Duration,
) -> Result<u64, DomainError> {
    let Some(cutoff) = chrono::Duration::from_std(horizon)
        .ok()
        .and_then(|horizon| clock.now().checked_sub_signed(horizon))
    else {
        debug!("retention horizon exceeds representable time; nothing to compact");
        return Ok(0);
    };

    let removed = events.compact(cutoff).await?;
    if removed > 0 {
        info!(removed, %cutoff, "compacted events");
    }
    Ok(removed)
}

/// Compacts every `compaction_interval` until `shutdown` becomes `true` or
/// its sender is dropped. Failures are logged and retried on the next pass.
pub async fn run_compaction(
    events: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    config: RetentionConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.compaction_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = compact_once(events.as_ref(), clock.as_ref(), config.horizon).await {
                    warn!(error = %e, "compaction failed");
                }
            }
        }
    }
    debug!("compaction stopped");
}
