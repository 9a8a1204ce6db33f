//! Errors raised by the tabular pipeline.

use std::path::PathBuf;

/// Failure modes of the tabular pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The dataset file does not exist.
    #[error("data file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The data does not have the shape the pipeline needs.
    #[error("schema error: {0}")]
    Schema(String),

    /// Scoring was requested before the classifier was fitted.
    #[error("classifier has not been fitted")]
    NotFitted,

    /// The file could not be read.
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid CSV.
    #[error("failed to parse CSV: {0}")]
    Csv(#[from] csv::Error),

    /// The classifier could not be encoded or decoded.
    #[error("classifier serialization failed: {0}")]
    Serialization(String),
}

impl PipelineError {
    /// Shorthand for [`PipelineError::Schema`].
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema(message.into())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PipelineError>;
