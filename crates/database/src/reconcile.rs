//! Repairs records left unsettled by an interrupted two-phase write.

use serde::Serialize;
use tracing::{info, warn};

use crate::artifacts::ArtifactStore;
use crate::error::{Result, StoreError};
use crate::models::RecordState;
use crate::records::ModelRepository;

/// What a reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Pending records whose artifact existed; now committed.
    pub committed: Vec<String>,
    /// Pending records without an artifact; removed.
    pub removed_orphans: Vec<String>,
    /// Records tagged `deleting`; purged from both stores.
    pub purged: Vec<String>,
    /// Staged updates with a complete staging; promoted and applied.
    pub completed_updates: Vec<String>,
    /// Staged updates with an incomplete staging; dropped.
    pub rolled_back_updates: Vec<String>,
    /// Committed records with leftover staged objects; staging cleared.
    pub cleared_staging: Vec<String>,
    /// Artifact ids with no record at all. Reported, not touched.
    pub stray_artifacts: Vec<String>,
}

impl ReconcileReport {
    /// Returns true if the pass found nothing to repair.
    pub fn is_clean(&self) -> bool {
        self.committed.is_empty()
            && self.removed_orphans.is_empty()
            && self.purged.is_empty()
            && self.completed_updates.is_empty()
            && self.rolled_back_updates.is_empty()
            && self.cleared_staging.is_empty()
            && self.stray_artifacts.is_empty()
    }
}

/// Settles every non-committed record.
///
/// - `pending` with artifact metadata: the metadata is rewritten from the
///   record and the record committed.
/// - `pending` without artifact metadata: the record is deleted.
/// - `deleting`: leftover artifact objects and the record are deleted.
/// - `committed` with a staged update and a complete artifact staging: the
///   staging is promoted and the update committed.
/// - `committed` with a staged update and no complete staging: the update and
///   any partial staging are dropped, leaving the record as it was.
///
/// Staged objects left behind by an already committed update are removed.
///
/// # Errors
///
/// Returns the first store error encountered. Repairs made before it stay
/// applied.
pub async fn reconcile(records: &ModelRepository, artifacts: &ArtifactStore) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();

    for record in records.list_unsettled().await? {
        let model_id = record.model_id.as_str();
        match record.state {
            RecordState::Pending => {
                if artifacts.get_metadata(model_id).await?.is_some() {
                    artifacts.put_metadata(model_id, &record.metadata).await?;
                    records.commit(model_id).await?;
                    report.committed.push(record.model_id.clone());
                } else {
                    purge_artifact(artifacts, model_id).await?;
                    records.delete(model_id).await?;
                    report.removed_orphans.push(record.model_id.clone());
                }
            }
            RecordState::Deleting => {
                purge_artifact(artifacts, model_id).await?;
                records.delete(model_id).await?;
                report.purged.push(record.model_id.clone());
            }
            RecordState::Committed if record.staged.is_some() => {
                if artifacts.is_staged(model_id).await? {
                    artifacts.promote(model_id).await?;
                    records.commit_update(model_id).await?;
                    artifacts.discard_staged(model_id).await?;
                    report.completed_updates.push(record.model_id.clone());
                } else {
                    artifacts.discard_staged(model_id).await?;
                    records.discard_update(model_id).await?;
                    report.rolled_back_updates.push(record.model_id.clone());
                }
            }
            RecordState::Committed => {}
        }
    }

    for model_id in artifacts.list().await? {
        match records.get_any(&model_id).await? {
            None => {
                warn!(model_id, "Artifact has no model record");
                report.stray_artifacts.push(model_id);
            }
            Some(record) if record.state == RecordState::Committed && record.staged.is_none() => {
                if artifacts.discard_staged(&model_id).await? {
                    report.cleared_staging.push(model_id);
                }
            }
            Some(_) => {}
        }
    }

    info!(
        committed = report.committed.len(),
        removed_orphans = report.removed_orphans.len(),
        purged = report.purged.len(),
        completed_updates = report.completed_updates.len(),
        rolled_back_updates = report.rolled_back_updates.len(),
        cleared_staging = report.cleared_staging.len(),
        stray_artifacts = report.stray_artifacts.len(),
        "Reconciliation finished"
    );

    Ok(report)
}

/// Deletes whatever is left under the model's prefix.
async fn purge_artifact(artifacts: &ArtifactStore, model_id: &str) -> Result<()> {
    match artifacts.delete(model_id).await {
        Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
        Err(error) => Err(error),
    }
}
