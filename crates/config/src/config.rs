//! Service configuration loaded from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use object_store::ObjectStore;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use tracing::info;

/// Default `SQLite` database holding model records.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://data/models.db?mode=rwc";

/// Default dataset used when a request does not name one.
pub const DEFAULT_DATA_PATH: &str = "data/iris_simple.csv";

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Record store connection URL.
    pub database_url: String,

    /// Root directory of the local artifact store.
    pub artifact_root: PathBuf,

    /// S3 bucket for artifacts. When set, the local root is ignored.
    pub artifact_bucket: Option<String>,

    /// Address the HTTP server binds to.
    pub bind_addr: String,

    /// Dataset used when a request omits `data_path`.
    pub default_data_path: PathBuf,

    /// Name of the label column in training data.
    pub target_column: String,

    /// Fraction of rows held out for evaluation.
    pub test_fraction: f64,

    /// Upper bound on records scanned by filter queries.
    pub scan_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            artifact_root: PathBuf::from("data/artifacts"),
            artifact_bucket: None,
            bind_addr: "0.0.0.0:5001".to_string(),
            default_data_path: PathBuf::from(DEFAULT_DATA_PATH),
            target_column: "target".to_string(),
            test_fraction: 0.3,
            scan_limit: 100,
        }
    }
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// Optional environment variables (defaults in parentheses):
    /// - `DATABASE_URL`: record store URL (`sqlite://data/models.db?mode=rwc`)
    /// - `ARTIFACT_ROOT`: local artifact directory (`data/artifacts`)
    /// - `ARTIFACT_BUCKET`: S3 bucket; switches the artifact store to S3
    /// - `BIND_ADDR`: listen address (`0.0.0.0:5001`)
    /// - `DEFAULT_DATA_PATH`: fallback dataset (`data/iris_simple.csv`)
    /// - `TARGET_COLUMN`: label column (`target`)
    /// - `TEST_FRACTION`: held-out fraction (`0.3`)
    /// - `SCAN_LIMIT`: records scanned per query (`100`)
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric variable cannot be parsed.
    pub fn from_env() -> Result<Self> {
        // Load .env file
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        Ok(Self {
            database_url: env_or("DATABASE_URL", defaults.database_url),
            artifact_root: env_or("ARTIFACT_ROOT", defaults.artifact_root),
            artifact_bucket: std::env::var("ARTIFACT_BUCKET")
                .ok()
                .filter(|bucket| !bucket.is_empty()),
            bind_addr: env_or("BIND_ADDR", defaults.bind_addr),
            default_data_path: env_or("DEFAULT_DATA_PATH", defaults.default_data_path),
            target_column: env_or("TARGET_COLUMN", defaults.target_column),
            test_fraction: env_parse("TEST_FRACTION", defaults.test_fraction)?,
            scan_limit: env_parse("SCAN_LIMIT", defaults.scan_limit)?,
        })
    }

    /// Builds the artifact object store described by this configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the local root cannot be created or the S3 client
    /// cannot be configured.
    pub fn object_store(&self) -> Result<Arc<dyn ObjectStore>> {
        if let Some(bucket) = &self.artifact_bucket {
            info!(bucket, "Using S3 artifact store");
            let store = AmazonS3Builder::from_env()
                .with_bucket_name(bucket)
                .build()
                .context("Failed to configure S3 artifact store")?;
            return Ok(Arc::new(store));
        }

        std::fs::create_dir_all(&self.artifact_root).with_context(|| {
            format!(
                "Failed to create artifact directory {}",
                self.artifact_root.display()
            )
        })?;

        info!(root = %self.artifact_root.display(), "Using local artifact store");
        let store = LocalFileSystem::new_with_prefix(&self.artifact_root)
            .context("Failed to create local artifact store")?;
        Ok(Arc::new(store))
    }
}

fn env_or<T: From<String>>(key: &str, default: T) -> T {
    std::env::var(key).map_or(default, T::from)
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} environment variable is not valid: {raw:?}")),
        Err(_) => Ok(default),
    }
}
