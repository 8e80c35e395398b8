use chrono::Utc;
use tracing::{debug, warn};

use super::Coordinator;
use crate::config::SnapshotMode;

/// One tick of the periodic snapshot worker
///
/// Eager mode always drains. Lazy mode piggy-backs on the next drain,
/// unless the last snapshot is older than the configured maximum.
pub(crate) fn tick(coordinator: &Coordinator) {
    let config = coordinator.config();
    let overdue = coordinator
        .last_snapshot()
        .map(|last| {
            Utc::now().signed_duration_since(last).to_std().unwrap_or_default()
                >= config.max_snapshot_interval()
        })
        .unwrap_or(false);

    let outcome = match config.snapshot.mode {
        SnapshotMode::Eager => coordinator.snapshot(false, false).map(|_| true),
        SnapshotMode::Lazy if overdue => {
            debug!("lazy snapshot overdue, forcing");
            coordinator.snapshot(false, false).map(|_| true)
        }
        SnapshotMode::Lazy => coordinator.request_lazy_snapshot(),
    };
    if let Err(err) = outcome {
        warn!(%err, "scheduled snapshot failed, retrying next tick");
    }
}
