//! Tabular data loading, cleaning and splitting.

use std::path::Path;

use csv::ReaderBuilder;
use ndarray::{Array2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::debug;

use crate::error::{PipelineError, Result};

/// Cell values treated as missing, compared after trimming.
const MISSING_MARKERS: &[&str] = &[
    "", "NA", "N/A", "n/a", "NaN", "nan", "null", "NULL", "None", "#N/A",
];

/// A delimited file held in memory with its header.
///
/// `None` cells are missing values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl Table {
    /// Builds a table from a header and rows of optional cells.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Schema`] if a row's width differs from the header.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Result<Self> {
        if let Some(index) = rows.iter().position(|row| row.len() != columns.len()) {
            return Err(PipelineError::schema(format!(
                "row {index} has {} cells, expected {}",
                rows[index].len(),
                columns.len()
            )));
        }
        Ok(Self { columns, rows })
    }

    /// Column names in file order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Row cells in file order.
    pub fn rows(&self) -> &[Vec<Option<String>>] {
        &self.rows
    }

    /// Returns the number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if there are no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Returns true if any cell is missing.
    pub fn has_missing(&self) -> bool {
        self.rows.iter().flatten().any(Option::is_none)
    }
}

/// Numeric feature matrix with its column names.
#[derive(Debug, Clone, PartialEq)]
pub struct Features {
    pub columns: Vec<String>,
    pub values: Array2<f64>,
}

impl Features {
    /// Returns the number of rows.
    pub fn len(&self) -> usize {
        self.values.nrows()
    }

    /// Returns true if there are no rows.
    pub fn is_empty(&self) -> bool {
        self.values.nrows() == 0
    }

    /// Keeps only the given rows, in the given order.
    #[must_use]
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        Self {
            columns: self.columns.clone(),
            values: self.values.select(Axis(0), rows),
        }
    }
}

/// Class labels, one per row.
pub type Target = Vec<String>;

/// Train and test partitions produced by [`train_test_split`].
#[derive(Debug, Clone)]
pub struct Partitions {
    pub train_features: Features,
    pub test_features: Features,
    pub train_target: Target,
    pub test_target: Target,
}

/// Loads a CSV file with a header row.
///
/// # Errors
///
/// Returns [`PipelineError::NotFound`] if the path does not exist and a CSV
/// error if the file is malformed.
pub fn load(path: &Path) -> Result<Table> {
    if !path.exists() {
        return Err(PipelineError::NotFound(path.to_path_buf()));
    }

    let file = std::fs::File::open(path).map_err(|source| PipelineError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(file);

    let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row = record
            .iter()
            .map(|cell| (!MISSING_MARKERS.contains(&cell)).then(|| cell.to_string()))
            .collect();
        rows.push(row);
    }

    debug!(path = %path.display(), rows = rows.len(), columns = columns.len(), "Loaded table");
    Table::new(columns, rows)
}

/// Removes every row containing a missing value.
#[must_use]
pub fn clean(table: Table) -> Table {
    let before = table.rows.len();
    let rows: Vec<_> = table
        .rows
        .into_iter()
        .filter(|row| row.iter().all(Option::is_some))
        .collect();

    debug!(dropped = before - rows.len(), kept = rows.len(), "Dropped rows with missing values");
    Table {
        columns: table.columns,
        rows,
    }
}

/// Separates the target column from the numeric feature columns.
///
/// # Errors
///
/// Returns [`PipelineError::Schema`] if the target column is absent, if no
/// feature columns remain, or if a feature cell is missing or not numeric.
pub fn split_features_target(table: &Table, target_column: &str) -> Result<(Features, Target)> {
    let target_index = table
        .columns
        .iter()
        .position(|column| column == target_column)
        .ok_or_else(|| {
            PipelineError::schema(format!("target column '{target_column}' not found"))
        })?;

    let columns: Vec<String> = table
        .columns
        .iter()
        .enumerate()
        .filter(|&(index, _)| index != target_index)
        .map(|(_, column)| column.clone())
        .collect();

    if columns.is_empty() {
        return Err(PipelineError::schema("table has no feature columns"));
    }

    let mut values = Array2::zeros((table.rows.len(), columns.len()));
    let mut target = Vec::with_capacity(table.rows.len());

    for (row_index, row) in table.rows.iter().enumerate() {
        let mut feature_index = 0;
        for (column_index, cell) in row.iter().enumerate() {
            let name = &table.columns[column_index];
            let cell = cell.as_deref().ok_or_else(|| {
                PipelineError::schema(format!("missing value in column '{name}' row {row_index}"))
            })?;

            if column_index == target_index {
                target.push(cell.to_string());
                continue;
            }

            values[[row_index, feature_index]] = cell.parse().map_err(|_| {
                PipelineError::schema(format!(
                    "column '{name}' has non-numeric value '{cell}' at row {row_index}"
                ))
            })?;
            feature_index += 1;
        }
    }

    Ok((Features { columns, values }, target))
}

/// Number of rows placed in the test partition.
///
/// `round(n * test_fraction)` with halves rounded away from zero.
#[must_use]
pub fn test_partition_size(rows: usize, test_fraction: f64) -> usize {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let size = (rows as f64 * test_fraction).round() as usize;
    size.min(rows)
}

/// Shuffles rows with a seeded generator and splits off the test partition.
///
/// The first `test_partition_size(n, test_fraction)` shuffled rows form the
/// test partition; the rest form the train partition.
///
/// # Errors
///
/// Returns [`PipelineError::Schema`] if the fraction is outside (0, 1), if the
/// inputs disagree in length, or if either partition would be empty.
pub fn train_test_split(
    features: &Features,
    target: &[String],
    test_fraction: f64,
    seed: u64,
) -> Result<Partitions> {
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(PipelineError::schema(format!(
            "test fraction must be in (0, 1), got {test_fraction}"
        )));
    }
    if features.len() != target.len() {
        return Err(PipelineError::schema(format!(
            "{} feature rows but {} target values",
            features.len(),
            target.len()
        )));
    }

    let rows = features.len();
    let test_size = test_partition_size(rows, test_fraction);
    if test_size == 0 || test_size == rows {
        return Err(PipelineError::schema(format!(
            "cannot split {rows} rows with test fraction {test_fraction}"
        )));
    }

    let mut indices: Vec<usize> = (0..rows).collect();
    indices.shuffle(&mut StdRng::seed_from_u64(seed));
    let (test_rows, train_rows) = indices.split_at(test_size);

    let pick = |selected: &[usize]| -> Target {
        selected.iter().map(|&index| target[index].clone()).collect()
    };

    Ok(Partitions {
        train_features: features.select_rows(train_rows),
        test_features: features.select_rows(test_rows),
        train_target: pick(train_rows),
        test_target: pick(test_rows),
    })
}

/// Renders a label as a JSON number when it looks like one.
#[must_use]
pub fn label_value(label: &str) -> serde_json::Value {
    if let Ok(integer) = label.parse::<i64>() {
        return integer.into();
    }
    label
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map_or_else(|| label.into(), serde_json::Value::Number)
}
