//! HTTP error responses.

use axum::Json;
use axum::extract::rejection::{PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use database::StoreError;
use ml_model::PipelineError;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::error;

/// An error rendered as `{"error": ..., ...context}`.
#[derive(Debug, Error)]
#[error("{status}: {error}")]
pub struct ApiError {
    status: StatusCode,
    error: String,
    context: Map<String, Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            context: Map::new(),
        }
    }

    pub fn bad_request(error: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error)
    }

    pub fn not_found(error: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, error)
    }

    pub fn conflict(error: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, error)
    }

    /// A 500 carrying the underlying failure in `details`.
    pub fn internal(error: impl Into<String>, details: impl ToString) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error).with("details", details.to_string())
    }

    /// Adds a context field to the body.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Maps a pipeline failure, using `error` as the label for server-side
    /// failures. A missing dataset is a client error.
    pub fn pipeline(error: &str, source: PipelineError) -> Self {
        match source {
            PipelineError::NotFound(path) => {
                Self::bad_request("Data file not found").with("path", path.display().to_string())
            }
            other => Self::internal(error, other),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(source: StoreError) -> Self {
        match source {
            StoreError::NotFound(model_id) => {
                Self::not_found("Model not found").with("model_id", model_id)
            }
            StoreError::AlreadyExists(model_id) => {
                Self::conflict("Duplicate model ID").with("model_id", model_id)
            }
            StoreError::Schema(details) => {
                Self::bad_request("Invalid model data").with("details", details)
            }
            StoreError::UpdateInProgress(model_id) => Self::conflict("Model update in progress")
                .with("model_id", model_id)
                .with("message", "Retry once the current update finishes"),
            other => Self::internal("Storage failure", other),
        }
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::new(rejection.status(), "Invalid path parameter").with("details", rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::new(rejection.status(), "Invalid query string").with("details", rejection.body_text())
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(source: tokio::task::JoinError) -> Self {
        Self::internal("Worker task failed", source)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, error = %self.error, context = ?self.context, "Request failed");
        }

        let mut body = Map::new();
        body.insert("error".to_string(), Value::String(self.error));
        body.extend(self.context);
        (self.status, Json(Value::Object(body))).into_response()
    }
}
