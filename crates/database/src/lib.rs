//! Model record store (SQLite) and artifact store (`object_store`).

use std::str::FromStr;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::info;

pub mod artifacts;
mod error;
pub mod models;
pub mod reconcile;
pub mod records;

pub use artifacts::ArtifactStore;
pub use error::{Result, StoreError};
pub use models::{
    FilterError, ModelFilter, ModelMetadata, ModelRecord, RecordState, validate_model_id,
};
pub use reconcile::{ReconcileReport, reconcile};
pub use records::ModelRepository;

/// Creates a connection pool to the `SQLite` database.
///
/// The database file and its parent directory are created if missing. A
/// single long-lived connection is kept so `sqlite::memory:` databases
/// survive for the pool's lifetime.
///
/// # Errors
///
/// Returns an error if the URL is invalid or the connection fails.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));

    let parent = options.get_filename().parent().map(std::path::Path::to_path_buf);
    if let Some(parent) = parent.filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(&parent).map_err(sqlx::Error::Io)?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Runs all pending migrations.
///
/// # Errors
///
/// Returns an error if running migrations fails.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Record store migrations applied");
    Ok(())
}

/// Creates a pool and migrates it.
///
/// # Errors
///
/// See [`create_pool`] and [`run_migrations`].
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let pool = create_pool(database_url).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}
