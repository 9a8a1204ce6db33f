//! Errors raised by the record and artifact stores.

use thiserror::Error;

/// Failure of a store operation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("model '{0}' not found")]
    NotFound(String),

    #[error("model '{0}' already exists")]
    AlreadyExists(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("model '{0}' has an update in progress")]
    UpdateInProgress(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias for store operations.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;
