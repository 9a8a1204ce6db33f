//! Random forest classifier.

use std::collections::BTreeSet;

use ndarray::ArrayView2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::tree::{DecisionTree, TreeParams, majority_class};

/// How many features each split may consider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MaxFeatures {
    /// `floor(sqrt(n_features))`, at least one.
    #[default]
    Sqrt,
}

impl MaxFeatures {
    fn resolve(self, n_features: usize) -> usize {
        match self {
            Self::Sqrt => {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let root = (n_features as f64).sqrt().floor() as usize;
                root.max(1)
            }
        }
    }
}

/// Hyperparameters of the forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForestConfig {
    /// Number of trees.
    pub n_estimators: usize,
    /// Seed for bootstrap sampling and feature selection.
    pub random_state: u64,
    /// Maximum tree depth.
    pub max_depth: Option<usize>,
    /// Minimum samples a node needs before it may split.
    pub min_samples_split: usize,
    /// Candidate features per split.
    pub max_features: MaxFeatures,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_estimators: 10,
            random_state: 42,
            max_depth: None,
            min_samples_split: 2,
            max_features: MaxFeatures::Sqrt,
        }
    }
}

impl ForestConfig {
    /// Creates a config with the given size and seed and default growth limits.
    #[must_use]
    pub fn new(n_estimators: usize, random_state: u64) -> Self {
        Self {
            n_estimators,
            random_state,
            ..Self::default()
        }
    }
}

/// Bagged ensemble of decision trees voting on class labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    config: ForestConfig,
    classes: Vec<String>,
    n_features: usize,
    trees: Vec<DecisionTree>,
}

impl RandomForest {
    /// Creates an unfitted forest.
    #[must_use]
    pub const fn new(config: ForestConfig) -> Self {
        Self {
            config,
            classes: Vec::new(),
            n_features: 0,
            trees: Vec::new(),
        }
    }

    /// Returns the hyperparameters.
    pub const fn config(&self) -> &ForestConfig {
        &self.config
    }

    /// Class labels in index order.
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// Returns true once trees have been grown.
    pub fn is_fitted(&self) -> bool {
        !self.trees.is_empty()
    }

    /// Grows `n_estimators` trees on bootstrap samples.
    ///
    /// Tree `i` draws from a generator seeded with `random_state + i`, so a
    /// given config and input always produce the same forest.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Schema`] on empty input, mismatched lengths or
    /// a zero-sized forest.
    pub fn fit(&mut self, features: ArrayView2<'_, f64>, target: &[String]) -> Result<()> {
        let rows = features.nrows();
        if rows == 0 || features.ncols() == 0 {
            return Err(PipelineError::schema("cannot fit a forest on an empty feature set"));
        }
        if rows != target.len() {
            return Err(PipelineError::schema(format!(
                "{rows} feature rows but {} target values",
                target.len()
            )));
        }
        if self.config.n_estimators == 0 {
            return Err(PipelineError::schema("n_estimators must be at least 1"));
        }

        let classes: Vec<String> = target
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let labels: Vec<usize> = target
            .iter()
            .map(|label| classes.binary_search(label).unwrap_or_default())
            .collect();

        let params = TreeParams {
            max_depth: self.config.max_depth,
            min_samples_split: self.config.min_samples_split,
            max_features: self.config.max_features.resolve(features.ncols()),
        };

        let trees = (0..self.config.n_estimators)
            .map(|index| {
                let mut rng = StdRng::seed_from_u64(self.config.random_state.wrapping_add(index as u64));
                let sample: Vec<usize> = (0..rows).map(|_| rng.random_range(0..rows)).collect();
                DecisionTree::fit(features, &labels, classes.len(), &sample, &params, &mut rng)
            })
            .collect();

        debug!(
            trees = self.config.n_estimators,
            classes = classes.len(),
            rows,
            "Fitted random forest"
        );

        self.trees = trees;
        self.classes = classes;
        self.n_features = features.ncols();
        Ok(())
    }

    /// Predicts a label for every row by majority vote.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::NotFitted`] before `fit`, or
    /// [`PipelineError::Schema`] if the column count differs from training.
    pub fn predict(&self, features: ArrayView2<'_, f64>) -> Result<Vec<String>> {
        if !self.is_fitted() {
            return Err(PipelineError::NotFitted);
        }
        if features.ncols() != self.n_features {
            return Err(PipelineError::schema(format!(
                "forest was fitted on {} features, got {}",
                self.n_features,
                features.ncols()
            )));
        }

        Ok(features
            .rows()
            .into_iter()
            .map(|row| {
                let mut votes = vec![0; self.classes.len()];
                for tree in &self.trees {
                    votes[tree.predict_row(row)] += 1;
                }
                self.classes[majority_class(&votes)].clone()
            })
            .collect())
    }

    /// Fraction of rows whose predicted label equals the target.
    ///
    /// # Errors
    ///
    /// See [`RandomForest::predict`]. Also fails on mismatched lengths or
    /// empty input.
    pub fn score(&self, features: ArrayView2<'_, f64>, target: &[String]) -> Result<f64> {
        let predictions = self.predict(features)?;
        accuracy(&predictions, target)
    }

    /// Encodes the fitted forest as an opaque blob.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Serialization`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|error| PipelineError::Serialization(error.to_string()))
    }

    /// Decodes a blob produced by [`RandomForest::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Serialization`] if the blob is not a forest.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (forest, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|error| PipelineError::Serialization(error.to_string()))?;
        Ok(forest)
    }
}

/// Share of equal labels between predictions and ground truth.
///
/// # Errors
///
/// Returns [`PipelineError::Schema`] on mismatched lengths or empty input.
pub fn accuracy(predictions: &[String], target: &[String]) -> Result<f64> {
    if predictions.len() != target.len() {
        return Err(PipelineError::schema(format!(
            "{} predictions but {} target values",
            predictions.len(),
            target.len()
        )));
    }
    if target.is_empty() {
        return Err(PipelineError::schema("cannot score an empty partition"));
    }

    let correct = predictions
        .iter()
        .zip(target)
        .filter(|(predicted, actual)| predicted == actual)
        .count();
    Ok(correct as f64 / target.len() as f64)
}
