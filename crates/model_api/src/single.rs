//! Single-model service: one in-process pipeline, nothing persisted.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use bytes::Bytes;
use ml_model::{ForestConfig, Pipeline, TrainingReport, label_value};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ApiError;
use crate::request::{endpoint_not_found, json_object, method_not_allowed, optional_str};
use crate::state::{self, Settings};

/// Routes served by the single-model variant.
pub const ENDPOINTS: [&str; 5] = [
    "GET /health",
    "POST /train",
    "GET /predict",
    "PUT /model",
    "DELETE /model",
];

#[derive(Debug)]
struct ModelSlot {
    pipeline: Arc<Pipeline>,
    forest: ForestConfig,
    report: Option<TrainingReport>,
    data_path: Option<PathBuf>,
}

impl ModelSlot {
    fn fresh(settings: &Settings, forest: ForestConfig) -> Self {
        Self {
            pipeline: Arc::new(Pipeline::new(settings.pipeline_with(forest, None))),
            forest,
            report: None,
            data_path: None,
        }
    }
}

/// Shared context of the single-model service.
///
/// The slot mutex is held for the whole of train, reconfigure and reset.
/// `trained` is only written under that lock but read without it.
#[derive(Debug, Clone)]
pub struct SingleState {
    settings: Arc<Settings>,
    slot: Arc<Mutex<ModelSlot>>,
    trained: Arc<AtomicBool>,
}

impl SingleState {
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        let slot = ModelSlot::fresh(&settings, ForestConfig::default());
        Self {
            settings: Arc::new(settings),
            slot: Arc::new(Mutex::new(slot)),
            trained: Arc::new(AtomicBool::new(false)),
        }
    }

    fn is_trained(&self) -> bool {
        self.trained.load(Ordering::Acquire)
    }

    fn set_trained(&self, trained: bool) {
        self.trained.store(trained, Ordering::Release);
    }
}

/// Builds the single-model router.
pub fn router(state: SingleState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/train", post(train))
        .route("/predict", get(predict))
        .route("/model", put(configure).delete(reset))
        .fallback(|| async { endpoint_not_found(&ENDPOINTS) })
        .method_not_allowed_fallback(method_not_allowed)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<SingleState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "message": "ML API is running",
        "model_trained": state.is_trained(),
    }))
}

async fn train(State(state): State<SingleState>, body: Bytes) -> Result<impl IntoResponse, ApiError> {
    let fields = json_object(&body)?.unwrap_or_default();
    let requested = optional_str(&fields, "data_path")?;
    let data_path = state.settings.data_path(requested.as_deref());

    let mut slot = state.slot.lock().await;
    let config = state.settings.pipeline_with(slot.forest, None);
    let (pipeline, report) = state::train(config, &data_path).await?;

    info!(
        data_path = %data_path.display(),
        test_accuracy = report.test_accuracy,
        "Single model trained"
    );

    slot.pipeline = Arc::new(pipeline);
    state.set_trained(true);
    slot.data_path = Some(data_path);
    slot.report = Some(report.clone());

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Model trained successfully",
            "train_accuracy": report.train_accuracy,
            "test_accuracy": report.test_accuracy,
            "training_samples": report.training_samples,
            "test_samples": report.test_samples,
        })),
    ))
}

async fn predict(State(state): State<SingleState>) -> Result<Json<Value>, ApiError> {
    let (pipeline, data_path, report) = {
        let slot = state.slot.lock().await;
        if !state.is_trained() {
            return Err(ApiError::bad_request("Model not trained yet")
                .with("message", "Please train the model first using POST /train"));
        }
        (
            Arc::clone(&slot.pipeline),
            slot.data_path
                .clone()
                .unwrap_or_else(|| state.settings.default_data_path.clone()),
            slot.report.clone(),
        )
    };

    let holdout = state::holdout(pipeline, &data_path).await?;
    let predictions: Vec<Value> = holdout.predictions.iter().map(|label| label_value(label)).collect();
    let actual: Vec<Value> = holdout.actual.iter().map(|label| label_value(label)).collect();

    Ok(Json(json!({
        "predictions": predictions,
        "actual": actual,
        "model_info": report,
        "prediction_count": predictions.len(),
    })))
}

async fn configure(State(state): State<SingleState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let Some(fields) = json_object(&body)? else {
        return Err(ApiError::bad_request("No configuration provided"));
    };

    let defaults = ForestConfig::default();
    let n_estimators = match fields.get("n_estimators") {
        None | Some(Value::Null) => defaults.n_estimators,
        Some(value) => value
            .as_u64()
            .filter(|&n| n >= 1)
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| {
                ApiError::bad_request("Invalid configuration")
                    .with("details", format!("n_estimators must be an integer >= 1, got {value}"))
            })?,
    };
    let random_state = match fields.get("random_state") {
        None | Some(Value::Null) => defaults.random_state,
        Some(value) => value.as_u64().ok_or_else(|| {
            ApiError::bad_request("Invalid configuration")
                .with("details", format!("random_state must be a non-negative integer, got {value}"))
        })?,
    };

    let forest = ForestConfig::new(n_estimators, random_state);
    let mut slot = state.slot.lock().await;
    *slot = ModelSlot::fresh(&state.settings, forest);
    state.set_trained(false);
    drop(slot);

    info!(n_estimators, random_state, "Single model reconfigured");

    Ok(Json(json!({
        "message": "Model configuration updated",
        "config": {
            "n_estimators": n_estimators,
            "random_state": random_state,
        },
        "note": "Model needs retraining",
    })))
}

async fn reset(State(state): State<SingleState>) -> StatusCode {
    let mut slot = state.slot.lock().await;
    *slot = ModelSlot::fresh(&state.settings, ForestConfig::default());
    state.set_trained(false);
    drop(slot);
    info!("Single model reset");
    StatusCode::NO_CONTENT
}
