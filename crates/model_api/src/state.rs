//! Settings shared by both services and the blocking pipeline runners.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use config::Config;
use ml_model::{ForestConfig, Holdout, Pipeline, PipelineConfig, PipelineError, TrainingReport};

use crate::error::ApiError;

/// Request-independent pipeline settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Dataset used when a request names none.
    pub default_data_path: PathBuf,
    /// Base pipeline configuration; the forest part is overridden per model.
    pub pipeline: PipelineConfig,
}

impl Settings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_data_path: config.default_data_path.clone(),
            pipeline: PipelineConfig {
                target_column: config.target_column.clone(),
                test_fraction: config.test_fraction,
                ..PipelineConfig::default()
            },
        }
    }

    /// Pipeline configuration with the given forest hyperparameters.
    #[must_use]
    pub fn pipeline_with(&self, forest: ForestConfig, target_column: Option<&str>) -> PipelineConfig {
        PipelineConfig {
            target_column: target_column.map_or_else(
                || self.pipeline.target_column.clone(),
                str::to_string,
            ),
            forest,
            ..self.pipeline.clone()
        }
    }

    /// Resolves the dataset of a request, falling back to the default.
    #[must_use]
    pub fn data_path(&self, requested: Option<&str>) -> PathBuf {
        requested.map_or_else(|| self.default_data_path.clone(), PathBuf::from)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Trains a fresh pipeline on a blocking worker.
///
/// # Errors
///
/// A missing dataset maps to a 400; other pipeline failures to a 500
/// labelled "Training failed".
pub async fn train(config: PipelineConfig, path: &Path) -> Result<(Pipeline, TrainingReport), ApiError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut pipeline = Pipeline::new(config);
        let report = pipeline.run(&path)?;
        Ok::<_, PipelineError>((pipeline, report))
    })
    .await?
    .map_err(|error| ApiError::pipeline("Training failed", error))
}

/// Re-derives the held-out partition of a dataset and predicts it.
///
/// # Errors
///
/// A missing dataset maps to a 400; other pipeline failures to a 500
/// labelled "Prediction failed".
pub async fn holdout(pipeline: Arc<Pipeline>, path: &Path) -> Result<Holdout, ApiError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || pipeline.holdout(&path))
        .await?
        .map_err(|error| ApiError::pipeline("Prediction failed", error))
}
