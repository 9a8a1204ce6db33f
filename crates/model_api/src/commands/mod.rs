//! CLI command implementations.

pub mod reconcile;
pub mod serve;

use anyhow::{Context, Result};
use config::Config;
use database::{ArtifactStore, ModelRepository};

/// Connects to both stores, running record store migrations first.
///
/// # Errors
///
/// Returns an error if either store cannot be opened.
pub async fn open_stores(config: &Config) -> Result<(ModelRepository, ArtifactStore)> {
    let pool = database::connect(&config.database_url)
        .await
        .with_context(|| format!("Failed to open record store at {}", config.database_url))?;
    let records = ModelRepository::new(pool).with_scan_limit(config.scan_limit);
    let artifacts = ArtifactStore::new(config.object_store()?);
    Ok((records, artifacts))
}
