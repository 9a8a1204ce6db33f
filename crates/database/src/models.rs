//! Model record and metadata types.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;

/// Keys owned by the record itself. Patches never overwrite them.
pub const PROTECTED_KEYS: &[&str] = &["model_id", "created_at", "updated_at"];

/// Keys of the typed metadata core.
pub const CORE_KEYS: &[&str] = &[
    "model_type",
    "train_accuracy",
    "test_accuracy",
    "training_samples",
    "test_samples",
    "features",
    "data_path",
    "target_column",
    "n_estimators",
    "random_state",
    "last_trained",
];

/// Default value of `model_type`.
pub const DEFAULT_MODEL_TYPE: &str = "RandomForest";

/// Longest accepted model identifier.
const MAX_MODEL_ID_LEN: usize = 128;

/// Write-protocol tag of a record.
///
/// Only `Committed` records are visible to readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
pub enum RecordState {
    /// Written to the record store; artifact write not yet confirmed.
    Pending,
    /// Both stores agree.
    #[default]
    Committed,
    /// Removal in progress.
    Deleting,
}

/// Metadata describing a trained model.
///
/// Serialized flat: core keys and caller-supplied keys share one JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    #[serde(default = "default_model_type")]
    pub model_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training_samples: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_samples: Option<u64>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_estimators: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random_state: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_trained: Option<DateTime<Utc>>,
    /// Caller-supplied fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_model_type() -> String {
    DEFAULT_MODEL_TYPE.to_string()
}

impl Default for ModelMetadata {
    fn default() -> Self {
        Self {
            model_type: default_model_type(),
            train_accuracy: None,
            test_accuracy: None,
            training_samples: None,
            test_samples: None,
            features: Vec::new(),
            data_path: None,
            target_column: None,
            n_estimators: None,
            random_state: None,
            last_trained: None,
            extra: Map::new(),
        }
    }
}

impl ModelMetadata {
    /// Adds caller-supplied fields, skipping record and core keys.
    #[must_use]
    pub fn with_extra(mut self, fields: Map<String, Value>) -> Self {
        for (key, value) in fields {
            if !PROTECTED_KEYS.contains(&key.as_str()) && !CORE_KEYS.contains(&key.as_str()) {
                self.extra.insert(key, value);
            }
        }
        self
    }

    /// Returns the metadata as a flat JSON object.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_map(&self) -> Result<Map<String, Value>, StoreError> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(StoreError::Schema(format!(
                "metadata serialized to a non-object: {other}"
            ))),
        }
    }

    /// Applies a shallow patch.
    ///
    /// Keys in [`PROTECTED_KEYS`] are ignored. Core keys must keep their
    /// types; a `null` clears an optional core key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Schema`] if the patched document no longer fits
    /// the typed core. `self` is left unchanged.
    pub fn merged(&self, patch: &Map<String, Value>) -> Result<Self, StoreError> {
        let mut document = self.to_map()?;
        for (key, value) in patch {
            if PROTECTED_KEYS.contains(&key.as_str()) {
                continue;
            }
            document.insert(key.clone(), value.clone());
        }

        serde_json::from_value(Value::Object(document))
            .map_err(|error| StoreError::Schema(format!("invalid metadata update: {error}")))
    }
}

/// A persisted model record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRecord {
    pub model_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub state: RecordState,
    #[serde(flatten)]
    pub metadata: ModelMetadata,
    /// Metadata of an update that has been staged but not yet applied.
    #[serde(skip)]
    pub staged: Option<ModelMetadata>,
}

/// Checks that an identifier is usable as a key and a single path segment.
///
/// # Errors
///
/// Returns [`StoreError::Schema`] for empty, overlong or unsafe identifiers.
pub fn validate_model_id(model_id: &str) -> Result<(), StoreError> {
    let valid_chars = model_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if model_id.is_empty()
        || model_id.len() > MAX_MODEL_ID_LEN
        || !valid_chars
        || model_id.chars().all(|c| c == '.')
    {
        return Err(StoreError::Schema(format!(
            "invalid model id {model_id:?}: use 1-{MAX_MODEL_ID_LEN} characters from [A-Za-z0-9._-]"
        )));
    }
    Ok(())
}

/// A typed query filter, one variant per allowed field.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelFilter {
    /// Exact identifier.
    ModelId(String),
    /// Exact `model_type`.
    ModelType(String),
    /// `test_accuracy` at or above the threshold.
    AccuracyThreshold(f64),
    /// Created strictly after the instant.
    CreatedAfter(DateTime<Utc>),
}

/// Why a query parameter could not become a [`ModelFilter`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("unknown filter '{0}'")]
    Unknown(String),
    #[error("invalid value {value:?} for filter '{field}': {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

impl ModelFilter {
    /// Query parameter names accepted by [`ModelFilter::parse`].
    pub const FIELDS: [&'static str; 4] = [
        "model_id",
        "model_type",
        "accuracy_threshold",
        "created_after",
    ];

    /// Builds a filter from a query parameter.
    ///
    /// `created_after` accepts RFC 3339 timestamps or `YYYY-MM-DD` dates
    /// (midnight UTC).
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Unknown`] for names outside [`ModelFilter::FIELDS`]
    /// and [`FilterError::InvalidValue`] for unparsable values.
    pub fn parse(field: &str, value: &str) -> Result<Self, FilterError> {
        let invalid = |reason: String| FilterError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason,
        };

        match field {
            "model_id" => Ok(Self::ModelId(value.to_string())),
            "model_type" => Ok(Self::ModelType(value.to_string())),
            "accuracy_threshold" => {
                let threshold: f64 = value
                    .trim()
                    .parse()
                    .map_err(|error: std::num::ParseFloatError| invalid(error.to_string()))?;
                if !threshold.is_finite() {
                    return Err(invalid("threshold must be finite".to_string()));
                }
                Ok(Self::AccuracyThreshold(threshold))
            }
            "created_after" => parse_instant(value.trim())
                .map(Self::CreatedAfter)
                .ok_or_else(|| invalid("expected RFC 3339 timestamp or YYYY-MM-DD".to_string())),
            other => Err(FilterError::Unknown(other.to_string())),
        }
    }

    /// Returns true if the record satisfies this filter.
    pub fn matches(&self, record: &ModelRecord) -> bool {
        match self {
            Self::ModelId(id) => &record.model_id == id,
            Self::ModelType(model_type) => &record.metadata.model_type == model_type,
            Self::AccuracyThreshold(threshold) => record
                .metadata
                .test_accuracy
                .is_some_and(|accuracy| accuracy >= *threshold),
            Self::CreatedAfter(instant) => record.created_at > *instant,
        }
    }
}

fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(value) {
        return Some(instant.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record(metadata: ModelMetadata) -> ModelRecord {
        let created_at = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc);
        ModelRecord {
            model_id: "m1".to_string(),
            created_at,
            updated_at: created_at,
            state: RecordState::Committed,
            metadata,
            staged: None,
        }
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_record_serializes_flat() {
        let metadata = ModelMetadata {
            train_accuracy: Some(0.9),
            ..ModelMetadata::default()
        }
        .with_extra(object(json!({"version": "1.0", "model_id": "spoofed"})));

        let value = serde_json::to_value(record(metadata)).expect("serialize");

        assert_eq!(value["model_id"], "m1");
        assert_eq!(value["model_type"], "RandomForest");
        assert_eq!(value["train_accuracy"], 0.9);
        assert_eq!(value["version"], "1.0");
        assert!(value.get("state").is_none());
    }

    #[test]
    fn test_merge_updates_and_protects_keys() {
        let metadata = ModelMetadata::default();
        let patch = object(json!({
            "version": "2.0",
            "model_type": "Forest",
            "created_at": "1999-01-01T00:00:00Z",
            "model_id": "other",
        }));

        let merged = metadata.merged(&patch).expect("merge");

        assert_eq!(merged.model_type, "Forest");
        assert_eq!(merged.extra.get("version"), Some(&json!("2.0")));
        assert!(!merged.extra.contains_key("created_at"));
        assert!(!merged.extra.contains_key("model_id"));
    }

    #[test]
    fn test_merge_rejects_mistyped_core_key() {
        let metadata = ModelMetadata::default();
        let patch = object(json!({"train_accuracy": "high"}));

        assert!(matches!(metadata.merged(&patch), Err(StoreError::Schema(_))));
    }

    #[test]
    fn test_metadata_round_trips_through_json() {
        let metadata = ModelMetadata {
            test_accuracy: Some(0.75),
            training_samples: Some(105),
            features: vec!["a".into(), "b".into()],
            ..ModelMetadata::default()
        }
        .with_extra(object(json!({"experiment": "baseline"})));

        let text = serde_json::to_string(&metadata).expect("serialize");
        let restored: ModelMetadata = serde_json::from_str(&text).expect("deserialize");

        assert_eq!(restored, metadata);
    }

    #[test]
    fn test_validate_model_id() {
        assert!(validate_model_id("model_1a2b3c4d").is_ok());
        assert!(validate_model_id("m-1.v2").is_ok());
        assert!(validate_model_id("").is_err());
        assert!(validate_model_id("..").is_err());
        assert!(validate_model_id("a/b").is_err());
        assert!(validate_model_id(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_filter_parse() {
        assert_eq!(
            ModelFilter::parse("model_type", "RandomForest"),
            Ok(ModelFilter::ModelType("RandomForest".into()))
        );
        assert_eq!(
            ModelFilter::parse("accuracy_threshold", "0.8"),
            Ok(ModelFilter::AccuracyThreshold(0.8))
        );
        assert!(matches!(
            ModelFilter::parse("created_after", "2024-01-01"),
            Ok(ModelFilter::CreatedAfter(_))
        ));
        assert!(matches!(
            ModelFilter::parse("accuracy_threshold", "high"),
            Err(FilterError::InvalidValue { .. })
        ));
        assert_eq!(
            ModelFilter::parse("owner", "me"),
            Err(FilterError::Unknown("owner".into()))
        );
    }

    #[test]
    fn test_filter_matches() {
        let candidate = record(ModelMetadata {
            test_accuracy: Some(0.8),
            ..ModelMetadata::default()
        });

        assert!(ModelFilter::ModelType("RandomForest".into()).matches(&candidate));
        assert!(ModelFilter::AccuracyThreshold(0.8).matches(&candidate));
        assert!(!ModelFilter::AccuracyThreshold(0.81).matches(&candidate));
        assert!(
            ModelFilter::parse("created_after", "2024-04-30")
                .expect("filter")
                .matches(&candidate)
        );
        assert!(
            !ModelFilter::parse("created_after", "2024-05-01T12:00:00Z")
                .expect("filter")
                .matches(&candidate)
        );
    }
}
