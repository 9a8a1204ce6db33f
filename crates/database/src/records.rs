//! SQLite-backed model record store.

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Map, Value};
use sqlx::{Sqlite, SqlitePool, Transaction};
use sqlx::types::Json;
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::models::{ModelFilter, ModelMetadata, ModelRecord, RecordState, validate_model_id};

/// Records scanned by [`ModelRepository::query`] unless configured otherwise.
pub const DEFAULT_SCAN_LIMIT: u32 = 100;

const COLUMNS: &str = "model_id, state, created_at, updated_at, metadata, staged_metadata";

#[derive(Debug, sqlx::FromRow)]
struct ModelRow {
    model_id: String,
    state: RecordState,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    metadata: Json<ModelMetadata>,
    staged_metadata: Option<Json<ModelMetadata>>,
}

impl From<ModelRow> for ModelRecord {
    fn from(row: ModelRow) -> Self {
        Self {
            model_id: row.model_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            state: row.state,
            metadata: row.metadata.0,
            staged: row.staged_metadata.map(|staged| staged.0),
        }
    }
}

/// Repository for model records.
///
/// Creates move through `pending -> committed` and removals through
/// `deleting`. Updates never leave `committed`: the merged metadata is staged
/// in `staged_metadata` first and applied by [`ModelRepository::commit_update`].
/// Readers only see committed records.
#[derive(Debug, Clone)]
pub struct ModelRepository {
    pool: SqlitePool,
    scan_limit: u32,
}

impl ModelRepository {
    /// Wraps a migrated pool.
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            scan_limit: DEFAULT_SCAN_LIMIT,
        }
    }

    /// Sets how many records a filter query scans.
    #[must_use]
    pub const fn with_scan_limit(mut self, scan_limit: u32) -> Self {
        self.scan_limit = scan_limit;
        self
    }

    /// Inserts a new `pending` record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] if a record with this id exists
    /// in any state, or [`StoreError::Schema`] for an invalid id.
    pub async fn create(&self, model_id: &str, metadata: ModelMetadata) -> Result<ModelRecord> {
        validate_model_id(model_id)?;
        if self.get_any(model_id).await?.is_some() {
            return Err(StoreError::AlreadyExists(model_id.to_string()));
        }

        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO models (model_id, state, created_at, updated_at, metadata) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(model_id)
        .bind(RecordState::Pending)
        .bind(now)
        .bind(now)
        .bind(Json(&metadata))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                return Err(StoreError::AlreadyExists(model_id.to_string()));
            }
            Err(error) => return Err(error.into()),
        }

        debug!(model_id, "Created pending model record");

        Ok(ModelRecord {
            model_id: model_id.to_string(),
            created_at: now,
            updated_at: now,
            state: RecordState::Pending,
            metadata,
            staged: None,
        })
    }

    /// Publishes a `pending` record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no pending record has this id.
    pub async fn commit(&self, model_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE models SET state = ? WHERE model_id = ? AND state = ?")
            .bind(RecordState::Committed)
            .bind(model_id)
            .bind(RecordState::Pending)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(model_id.to_string()));
        }
        debug!(model_id, "Committed model record");
        Ok(())
    }

    /// Finds a committed record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn get(&self, model_id: &str) -> Result<Option<ModelRecord>> {
        Ok(self
            .get_any(model_id)
            .await?
            .filter(|record| record.state == RecordState::Committed))
    }

    /// Finds a record in any state.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn get_any(&self, model_id: &str) -> Result<Option<ModelRecord>> {
        let row = sqlx::query_as::<_, ModelRow>(&format!(
            "SELECT {COLUMNS} FROM models WHERE model_id = ?"
        ))
        .bind(model_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ModelRecord::from))
    }

    /// Merges a patch into a committed record in one step.
    ///
    /// `model_id`, `created_at` and `updated_at` cannot be overwritten;
    /// `updated_at` always moves forward.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no committed record has this id,
    /// [`StoreError::Schema`] if the patch does not fit the metadata, or
    /// [`StoreError::UpdateInProgress`] if another update is staged.
    pub async fn update(&self, model_id: &str, patch: &Map<String, Value>) -> Result<ModelRecord> {
        self.stage_update(model_id, patch).await?;
        self.commit_update(model_id).await
    }

    /// Records the merged metadata of an update without applying it.
    ///
    /// The record stays committed and keeps serving its current metadata.
    /// Returns the record as it will read once the update is committed.
    ///
    /// # Errors
    ///
    /// Same as [`ModelRepository::update`].
    pub async fn stage_update(&self, model_id: &str, patch: &Map<String, Value>) -> Result<ModelRecord> {
        let mut tx = self.pool.begin().await?;

        let mut record = fetch_committed(&mut tx, model_id).await?;
        if record.staged.is_some() {
            return Err(StoreError::UpdateInProgress(model_id.to_string()));
        }
        let merged = record.metadata.merged(patch)?;

        sqlx::query("UPDATE models SET staged_metadata = ? WHERE model_id = ?")
            .bind(Json(&merged))
            .bind(model_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(model_id, keys = patch.len(), "Staged model update");
        record.metadata = merged;
        record.updated_at = advance(record.updated_at);
        Ok(record)
    }

    /// Applies a staged update and advances `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no committed record with a staged
    /// update has this id.
    pub async fn commit_update(&self, model_id: &str) -> Result<ModelRecord> {
        let mut tx = self.pool.begin().await?;

        let mut record = fetch_committed(&mut tx, model_id).await?;
        let staged = record
            .staged
            .take()
            .ok_or_else(|| StoreError::NotFound(model_id.to_string()))?;
        record.metadata = staged;
        record.updated_at = advance(record.updated_at);

        sqlx::query(
            "UPDATE models SET metadata = ?, updated_at = ?, staged_metadata = NULL WHERE model_id = ?",
        )
        .bind(Json(&record.metadata))
        .bind(record.updated_at)
        .bind(model_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(model_id, "Committed model update");
        Ok(record)
    }

    /// Drops a staged update. Returns false if none was staged.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn discard_update(&self, model_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE models SET staged_metadata = NULL WHERE model_id = ? AND staged_metadata IS NOT NULL",
        )
        .bind(model_id)
        .execute(&self.pool)
        .await?;

        let discarded = result.rows_affected() > 0;
        if discarded {
            debug!(model_id, "Discarded staged model update");
        }
        Ok(discarded)
    }

    /// Tags a record for removal.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the record does not exist.
    pub async fn mark_deleting(&self, model_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE models SET state = ? WHERE model_id = ?")
            .bind(RecordState::Deleting)
            .bind(model_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(model_id.to_string()));
        }
        Ok(())
    }

    /// Removes a record in any state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the record does not exist.
    pub async fn delete(&self, model_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM models WHERE model_id = ?")
            .bind(model_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(model_id.to_string()));
        }
        info!(model_id, "Deleted model record");
        Ok(true)
    }

    /// Lists committed records ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn list(&self, limit: u32) -> Result<Vec<ModelRecord>> {
        let rows = sqlx::query_as::<_, ModelRow>(&format!(
            "SELECT {COLUMNS} FROM models WHERE state = ? ORDER BY model_id LIMIT ?"
        ))
        .bind(RecordState::Committed)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ModelRecord::from).collect())
    }

    /// Lists every record that is not committed or has a staged update.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn list_unsettled(&self) -> Result<Vec<ModelRecord>> {
        let rows = sqlx::query_as::<_, ModelRow>(&format!(
            "SELECT {COLUMNS} FROM models WHERE state != ? OR staged_metadata IS NOT NULL ORDER BY model_id"
        ))
        .bind(RecordState::Committed)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ModelRecord::from).collect())
    }

    /// Returns committed records matching every filter.
    ///
    /// Scans at most the configured scan limit.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub async fn query(&self, filters: &[ModelFilter]) -> Result<Vec<ModelRecord>> {
        let records = self.list(self.scan_limit).await?;
        Ok(records
            .into_iter()
            .filter(|record| filters.iter().all(|filter| filter.matches(record)))
            .collect())
    }

    /// Checks that the database answers.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is unreachable.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

async fn fetch_committed(
    tx: &mut Transaction<'_, Sqlite>,
    model_id: &str,
) -> Result<ModelRecord> {
    let row = sqlx::query_as::<_, ModelRow>(&format!(
        "SELECT {COLUMNS} FROM models WHERE model_id = ? AND state = ?"
    ))
    .bind(model_id)
    .bind(RecordState::Committed)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| StoreError::NotFound(model_id.to_string()))?;
    Ok(ModelRecord::from(row))
}

/// Next `updated_at` value, strictly after `previous`.
fn advance(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    let floor = previous + TimeDelta::milliseconds(1);
    if now > floor { now } else { floor }
}
