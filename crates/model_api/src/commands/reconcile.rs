//! Reconcile command - settles records left by interrupted writes.

use anyhow::Result;
use config::Config;
use tracing::info;

use super::open_stores;

/// Runs one reconciliation pass and logs what it repaired.
///
/// # Errors
///
/// Returns an error if the stores cannot be opened or a repair fails.
pub async fn run(config: &Config) -> Result<()> {
    let (records, artifacts) = open_stores(config).await?;
    let report = database::reconcile(&records, &artifacts).await?;

    info!(
        committed = ?report.committed,
        removed_orphans = ?report.removed_orphans,
        purged = ?report.purged,
        completed_updates = ?report.completed_updates,
        rolled_back_updates = ?report.rolled_back_updates,
        cleared_staging = ?report.cleared_staging,
        stray_artifacts = ?report.stray_artifacts,
        "Reconciliation report"
    );
    Ok(())
}
