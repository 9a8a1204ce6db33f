//! Tabular classification pipeline.
//!
//! Loads a CSV file, drops incomplete rows, separates the label column,
//! standardizes features, splits train/test partitions with a fixed seed and
//! fits a random forest. The fitted forest can be encoded as an opaque blob
//! and rehydrated into a pipeline later.

pub mod dataset;
mod error;
pub mod forest;
pub mod scaler;
pub mod training;
pub mod tree;

pub use dataset::{Features, Partitions, Table, Target, label_value};
pub use error::{PipelineError, Result};
pub use forest::{ForestConfig, MaxFeatures, RandomForest};
pub use scaler::StandardScaler;
pub use training::{Holdout, Pipeline, PipelineConfig, TrainingReport};
