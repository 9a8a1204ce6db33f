//! Per-column standardization.

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Centres each column on zero and scales it to unit variance.
///
/// Uses the population standard deviation. A zero-variance column is centred
/// and left unscaled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    mean: Option<Array1<f64>>,
    scale: Option<Array1<f64>>,
}

impl StandardScaler {
    /// Creates an unfitted scaler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once [`StandardScaler::fit`] has run.
    pub const fn is_fitted(&self) -> bool {
        self.mean.is_some()
    }

    /// Learns column means and deviations.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Schema`] if the matrix has no rows.
    pub fn fit(&mut self, values: &Array2<f64>) -> Result<()> {
        let mean = values
            .mean_axis(Axis(0))
            .ok_or_else(|| PipelineError::schema("cannot fit scaler on an empty feature set"))?;
        let scale = values
            .std_axis(Axis(0), 0.0)
            .mapv(|deviation| if deviation > f64::EPSILON { deviation } else { 1.0 });

        self.mean = Some(mean);
        self.scale = Some(scale);
        Ok(())
    }

    /// Applies the learned standardization.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::NotFitted`] before `fit`, or
    /// [`PipelineError::Schema`] when the column count differs.
    pub fn transform(&self, values: &Array2<f64>) -> Result<Array2<f64>> {
        let (Some(mean), Some(scale)) = (&self.mean, &self.scale) else {
            return Err(PipelineError::NotFitted);
        };
        if values.ncols() != mean.len() {
            return Err(PipelineError::schema(format!(
                "scaler was fitted on {} columns, got {}",
                mean.len(),
                values.ncols()
            )));
        }

        Ok((values - mean) / scale)
    }

    /// Fits on `values` and returns them standardized.
    ///
    /// # Errors
    ///
    /// See [`StandardScaler::fit`].
    pub fn fit_transform(&mut self, values: &Array2<f64>) -> Result<Array2<f64>> {
        self.fit(values)?;
        self.transform(values)
    }
}
