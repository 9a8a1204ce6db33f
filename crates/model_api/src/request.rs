//! Request body parsing and shared fallback handlers.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::{Map, Value, json};

use crate::error::ApiError;

/// Parses a JSON object body.
///
/// An empty body, `null` and `{}` all yield `None`.
///
/// # Errors
///
/// Returns a 400 for malformed JSON or a non-object document.
pub fn json_object(body: &Bytes) -> Result<Option<Map<String, Value>>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    let value: Value = serde_json::from_slice(body)
        .map_err(|error| ApiError::bad_request("Invalid JSON").with("details", error.to_string()))?;

    match value {
        Value::Null => Ok(None),
        Value::Object(map) if map.is_empty() => Ok(None),
        Value::Object(map) => Ok(Some(map)),
        _ => Err(ApiError::bad_request("JSON body must be an object")),
    }
}

/// Reads an optional string field.
///
/// # Errors
///
/// Returns a 400 if the field is present with a non-string value.
pub fn optional_str(fields: &Map<String, Value>, key: &str) -> Result<Option<String>, ApiError> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(other) => Err(invalid_field(key, "a string", other)),
    }
}

/// Reads an optional non-negative integer field.
///
/// # Errors
///
/// Returns a 400 if the field is present with another type.
pub fn optional_u64(fields: &Map<String, Value>, key: &str) -> Result<Option<u64>, ApiError> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| invalid_field(key, "a non-negative integer", value)),
    }
}

fn invalid_field(key: &str, expected: &str, got: &Value) -> ApiError {
    ApiError::bad_request("Invalid field value")
        .with("field", key)
        .with("details", format!("expected {expected}, got {got}"))
}

/// Python-style truthiness of a JSON value.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// 404 body listing the routes a service exposes.
pub fn endpoint_not_found(endpoints: &[&str]) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Endpoint not found",
            "available_endpoints": endpoints,
        })),
    )
        .into_response()
}

/// 405 body for a known route hit with the wrong method.
pub async fn method_not_allowed() -> impl IntoResponse {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({"error": "Method not allowed for this endpoint"})),
    )
}
