//! Load, clean, split, scale, train and evaluate.

use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::dataset::{self, Features, Partitions, Table, Target};
use crate::error::{PipelineError, Result};
use crate::forest::{ForestConfig, RandomForest, accuracy};
use crate::scaler::StandardScaler;

/// Settings shared by every pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Label column name.
    pub target_column: String,
    /// Fraction of rows held out for evaluation.
    pub test_fraction: f64,
    /// Seed of the train/test shuffle.
    pub split_seed: u64,
    /// Classifier hyperparameters.
    pub forest: ForestConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_column: "target".to_string(),
            test_fraction: 0.3,
            split_seed: 42,
            forest: ForestConfig::default(),
        }
    }
}

/// Outcome of a full training run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingReport {
    pub train_accuracy: f64,
    pub test_accuracy: f64,
    pub training_samples: usize,
    pub test_samples: usize,
    pub features: Vec<String>,
}

/// Predictions on a re-derived test partition.
#[derive(Debug, Clone, PartialEq)]
pub struct Holdout {
    pub predictions: Vec<String>,
    pub actual: Vec<String>,
    pub accuracy: f64,
}

/// Holds the scaler and classifier fitted by one training run.
///
/// `prepare` and `train` mutate the held instances, so a pipeline must not be
/// trained from two threads at once.
#[derive(Debug, Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    scaler: StandardScaler,
    forest: RandomForest,
}

impl Pipeline {
    /// Creates an untrained pipeline.
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        let forest = RandomForest::new(config.forest);
        Self {
            config,
            scaler: StandardScaler::new(),
            forest,
        }
    }

    /// Wraps an already fitted classifier, e.g. one loaded from storage.
    #[must_use]
    pub fn from_classifier(mut config: PipelineConfig, forest: RandomForest) -> Self {
        config.forest = *forest.config();
        Self {
            config,
            scaler: StandardScaler::new(),
            forest,
        }
    }

    /// Returns the held classifier.
    pub const fn classifier(&self) -> &RandomForest {
        &self.forest
    }

    /// Returns true once the classifier is fitted.
    pub fn is_fitted(&self) -> bool {
        self.forest.is_fitted()
    }

    /// Loads a CSV dataset.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::NotFound`] if the file does not exist.
    pub fn load(&self, path: &Path) -> Result<Table> {
        dataset::load(path)
    }

    /// Drops rows with missing values.
    #[must_use]
    pub fn clean(&self, table: Table) -> Table {
        dataset::clean(table)
    }

    /// Separates the configured target column from the features.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Schema`] if the target column is absent.
    pub fn split(&self, table: &Table) -> Result<(Features, Target)> {
        dataset::split_features_target(table, &self.config.target_column)
    }

    /// Fits the scaler on all features, applies it and partitions the rows.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Schema`] on empty input or a degenerate split.
    pub fn prepare(
        &mut self,
        features: &Features,
        target: &[String],
        test_fraction: f64,
    ) -> Result<Partitions> {
        let scaled = Features {
            columns: features.columns.clone(),
            values: self.scaler.fit_transform(&features.values)?,
        };
        dataset::train_test_split(&scaled, target, test_fraction, self.config.split_seed)
    }

    /// Fits the classifier and returns its in-sample accuracy.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Schema`] on empty or mismatched input.
    pub fn train(&mut self, features: &Features, target: &[String]) -> Result<f64> {
        self.forest.fit(features.values.view(), target)?;
        self.forest.score(features.values.view(), target)
    }

    /// Returns the classifier's accuracy on held-out rows.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::NotFitted`] before `train`.
    pub fn evaluate(&self, features: &Features, target: &[String]) -> Result<f64> {
        self.forest.score(features.values.view(), target)
    }

    /// Predicts labels for already scaled features.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::NotFitted`] before `train`.
    pub fn predict(&self, features: &Features) -> Result<Vec<String>> {
        self.forest.predict(features.values.view())
    }

    /// Runs the whole sequence on a dataset and keeps the fitted state.
    ///
    /// # Errors
    ///
    /// Propagates any step's error.
    pub fn run(&mut self, path: &Path) -> Result<TrainingReport> {
        let table = self.clean(self.load(path)?);
        let (features, target) = self.split(&table)?;
        let partitions = self.prepare(&features, &target, self.config.test_fraction)?;

        let train_accuracy = self.train(&partitions.train_features, &partitions.train_target)?;
        let test_accuracy = self.evaluate(&partitions.test_features, &partitions.test_target)?;

        let report = TrainingReport {
            train_accuracy,
            test_accuracy,
            training_samples: partitions.train_features.len(),
            test_samples: partitions.test_features.len(),
            features: features.columns,
        };

        info!(
            path = %path.display(),
            train_accuracy,
            test_accuracy,
            training_samples = report.training_samples,
            test_samples = report.test_samples,
            "Pipeline trained"
        );

        Ok(report)
    }

    /// Re-loads a dataset, re-derives the seeded test partition and predicts it.
    ///
    /// A fresh scaler is fitted on the reloaded data, so the held instances are
    /// left untouched and a shared pipeline can serve concurrent requests.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::NotFitted`] if the classifier is untrained, or
    /// any loading error.
    pub fn holdout(&self, path: &Path) -> Result<Holdout> {
        if !self.is_fitted() {
            return Err(PipelineError::NotFitted);
        }

        let table = self.clean(self.load(path)?);
        let (features, target) = self.split(&table)?;
        let scaled = Features {
            columns: features.columns,
            values: StandardScaler::new().fit_transform(&features.values)?,
        };
        let partitions = dataset::train_test_split(
            &scaled,
            &target,
            self.config.test_fraction,
            self.config.split_seed,
        )?;

        let predictions = self.predict(&partitions.test_features)?;
        let accuracy = accuracy(&predictions, &partitions.test_target)?;

        Ok(Holdout {
            predictions,
            actual: partitions.test_target,
            accuracy,
        })
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}
