//! Multi-model service backed by the record and artifact stores.
//!
//! Creates and deletes are two-phase writes: the record is tagged `pending`
//! (or `deleting`), the artifact store is written, then the record is
//! committed (or removed). Updates stage their record change and artifacts
//! first and only touch live state once both stagings exist.

use std::sync::Arc;

use axum::extract::rejection::{PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, put};
use axum::{Json, Router};
use bytes::Bytes;
use chrono::Utc;
use database::{
    ArtifactStore, FilterError, ModelFilter, ModelMetadata, ModelRecord, ModelRepository,
    StoreError, validate_model_id,
};
use ml_model::{ForestConfig, Pipeline, RandomForest, label_value};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::request::{
    endpoint_not_found, json_object, method_not_allowed, optional_str, optional_u64, truthy,
};
use crate::state::{self, Settings};

/// Routes served by the persistent variant.
pub const ENDPOINTS: [&str; 6] = [
    "GET /health",
    "GET /models",
    "POST /models",
    "PUT /models/{model_id}",
    "DELETE /models/{model_id}",
    "GET /models/{model_id}/predict",
];

/// Filters advertised when `GET /models` has no parameters.
const AVAILABLE_FILTERS: [&str; 3] = ["model_type", "accuracy_threshold", "created_after"];

#[derive(Debug)]
struct CachedModel {
    model_id: String,
    pipeline: Arc<Pipeline>,
}

/// Shared context of the persistent service.
#[derive(Debug, Clone)]
pub struct AppState {
    records: ModelRepository,
    artifacts: ArtifactStore,
    settings: Arc<Settings>,
    current: Arc<Mutex<Option<CachedModel>>>,
}

impl AppState {
    #[must_use]
    pub fn new(records: ModelRepository, artifacts: ArtifactStore, settings: Settings) -> Self {
        Self {
            records,
            artifacts,
            settings: Arc::new(settings),
            current: Arc::new(Mutex::new(None)),
        }
    }

    async fn cached(&self, model_id: &str) -> Option<Arc<Pipeline>> {
        self.current
            .lock()
            .await
            .as_ref()
            .filter(|cached| cached.model_id == model_id)
            .map(|cached| Arc::clone(&cached.pipeline))
    }

    async fn cache(&self, model_id: &str, pipeline: Arc<Pipeline>) {
        *self.current.lock().await = Some(CachedModel {
            model_id: model_id.to_string(),
            pipeline,
        });
    }

    /// Replaces the cached pipeline only if it belongs to `model_id`.
    async fn refresh(&self, model_id: &str, pipeline: Arc<Pipeline>) {
        let mut current = self.current.lock().await;
        if let Some(cached) = current.as_mut().filter(|cached| cached.model_id == model_id) {
            cached.pipeline = pipeline;
        }
    }

    async fn evict(&self, model_id: &str) {
        let mut current = self.current.lock().await;
        if current.as_ref().is_some_and(|cached| cached.model_id == model_id) {
            *current = None;
        }
    }
}

/// Builds the persistent router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/models", get(list_models).post(create_model))
        .route("/models/{model_id}", put(update_model).delete(delete_model))
        .route("/models/{model_id}/predict", get(predict))
        .fallback(|| async { endpoint_not_found(&ENDPOINTS) })
        .method_not_allowed_fallback(method_not_allowed)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn model_not_found(model_id: &str) -> ApiError {
    ApiError::not_found("Model not found")
        .with("model_id", model_id)
        .with("message", format!("No model with ID {model_id}"))
}

fn hyperparameters(metadata: &ModelMetadata) -> ForestConfig {
    let defaults = ForestConfig::default();
    ForestConfig::new(
        metadata
            .n_estimators
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(defaults.n_estimators),
        metadata.random_state.unwrap_or(defaults.random_state),
    )
}

fn encode(pipeline: &Pipeline) -> Result<Bytes, ApiError> {
    pipeline
        .classifier()
        .to_bytes()
        .map(Bytes::from)
        .map_err(|error| ApiError::internal("Failed to encode model", error))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(|error| ApiError::internal("Failed to encode response", error))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let records = state.records.health_check().await;
    let artifacts = state.artifacts.health_check().await;

    let describe = |service: &str, result: &Result<(), StoreError>| match result {
        Ok(()) => "connected",
        Err(error) => {
            warn!(service, error = %error, "Health check failed");
            "unavailable"
        }
    };
    let services = json!({
        "records": describe("records", &records),
        "artifacts": describe("artifacts", &artifacts),
    });

    if records.is_ok() && artifacts.is_ok() {
        (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "message": "Model API is running",
                "services": services,
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "degraded",
                "message": "One or more storage services are unavailable",
                "services": services,
            })),
        )
    }
}

async fn list_models(
    State(state): State<AppState>,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(params) = query?;
    if params.is_empty() {
        return Err(ApiError::bad_request("No query parameters provided")
            .with("message", "Please provide query parameters to filter models")
            .with("available_filters", AVAILABLE_FILTERS.to_vec()));
    }

    let mut invalid: Vec<&str> = Vec::new();
    for (name, _) in &params {
        if !ModelFilter::FIELDS.contains(&name.as_str()) && !invalid.contains(&name.as_str()) {
            invalid.push(name);
        }
    }
    if !invalid.is_empty() {
        return Err(ApiError::bad_request("Invalid query parameters")
            .with("invalid_parameters", invalid)
            .with("valid_parameters", ModelFilter::FIELDS.to_vec()));
    }

    let mut filters = Map::new();
    for (name, value) in &params {
        filters.insert(name.clone(), Value::String(value.clone()));
    }

    if let Some(Value::String(model_id)) = filters.get("model_id") {
        let record = state
            .records
            .get(model_id)
            .await?
            .ok_or_else(|| ApiError::not_found("Model not found").with("model_id", model_id.as_str()))?;
        return Ok(Json(to_json(&record)?));
    }

    let parsed = params
        .iter()
        .map(|(name, value)| ModelFilter::parse(name, value))
        .collect::<Result<Vec<_>, FilterError>>()
        .map_err(|error| {
            ApiError::bad_request("Invalid query parameter value").with("details", error.to_string())
        })?;

    let results = state.records.query(&parsed).await?;
    if results.is_empty() {
        return Ok(Json(json!({
            "message": "No models found matching criteria",
            "filters": filters,
            "results": [],
        })));
    }

    Ok(Json(json!({
        "filters": filters,
        "count": results.len(),
        "results": to_json(&results)?,
    })))
}

async fn create_model(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let Some(mut fields) = json_object(&body)? else {
        return Err(ApiError::bad_request("No JSON data provided"));
    };

    let model_id = match fields.remove("model_id") {
        None | Some(Value::Null) => format!("model_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
        Some(Value::String(model_id)) => model_id,
        Some(other) => {
            return Err(ApiError::bad_request("Invalid model ID")
                .with("details", format!("expected a string, got {other}")));
        }
    };
    validate_model_id(&model_id).map_err(|error| {
        ApiError::bad_request("Invalid model ID").with("details", error.to_string())
    })?;

    if let Some(existing) = state.records.get_any(&model_id).await? {
        return Err(ApiError::conflict("Duplicate model ID")
            .with("message", format!("Model {model_id} already exists"))
            .with("existing_model", to_json(&existing)?));
    }

    let data_path = state
        .settings
        .data_path(optional_str(&fields, "data_path")?.as_deref());
    fields.remove("data_path");
    let target_column = optional_str(&fields, "target_column")?;
    let defaults = ForestConfig::default();
    let n_estimators = optional_u64(&fields, "n_estimators")?
        .and_then(|n| usize::try_from(n).ok())
        .unwrap_or(defaults.n_estimators);
    if n_estimators == 0 {
        return Err(ApiError::bad_request("Invalid field value")
            .with("field", "n_estimators")
            .with("details", "n_estimators must be at least 1"));
    }
    let random_state = optional_u64(&fields, "random_state")?.unwrap_or(defaults.random_state);
    let model_type = optional_str(&fields, "model_type")?;

    let config = state.settings.pipeline_with(
        ForestConfig::new(n_estimators, random_state),
        target_column.as_deref(),
    );
    let target_column = config.target_column.clone();
    let (pipeline, report) = state::train(config, &data_path).await?;
    let blob = encode(&pipeline)?;

    let metadata = ModelMetadata {
        model_type: model_type.unwrap_or_else(|| database::models::DEFAULT_MODEL_TYPE.to_string()),
        train_accuracy: Some(report.train_accuracy),
        test_accuracy: Some(report.test_accuracy),
        training_samples: Some(report.training_samples as u64),
        test_samples: Some(report.test_samples as u64),
        features: report.features,
        data_path: Some(data_path.display().to_string()),
        target_column: Some(target_column),
        n_estimators: Some(n_estimators as u64),
        random_state: Some(random_state),
        last_trained: None,
        extra: Map::new(),
    }
    .with_extra(fields);

    let mut record = state.records.create(&model_id, metadata).await?;
    let artifact_key = match state.artifacts.upload(&model_id, blob, &record.metadata).await {
        Ok(key) => key,
        Err(error) => {
            if let Err(cleanup) = state.records.delete(&model_id).await {
                warn!(model_id, error = %cleanup, "Failed to remove pending record");
            }
            return Err(error.into());
        }
    };
    state.records.commit(&model_id).await?;
    record.state = database::RecordState::Committed;

    state.cache(&model_id, Arc::new(pipeline)).await;
    info!(model_id, artifact_key = %artifact_key, "Model created");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Model created successfully",
            "model_id": model_id,
            "record": to_json(&record)?,
            "artifact_key": artifact_key,
            "metadata": to_json(&record.metadata)?,
        })),
    ))
}

async fn update_model(
    State(state): State<AppState>,
    path: Result<Path<String>, PathRejection>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let Path(model_id) = path?;
    let existing = state
        .records
        .get(&model_id)
        .await?
        .ok_or_else(|| model_not_found(&model_id))?;

    let Some(mut updates) = json_object(&body)? else {
        return Err(ApiError::bad_request("No JSON data provided"));
    };
    let retrain = updates.remove("retrain").is_some_and(|value| truthy(&value));
    updates.remove("model_id");

    let mut retrained = None;
    if retrain {
        let requested = optional_str(&updates, "data_path")?;
        let data_path = state.settings.data_path(
            requested
                .as_deref()
                .or(existing.metadata.data_path.as_deref()),
        );
        let config = state.settings.pipeline_with(
            hyperparameters(&existing.metadata),
            existing.metadata.target_column.as_deref(),
        );
        let (pipeline, report) = state::train(config, &data_path).await?;

        updates.insert("train_accuracy".into(), json!(report.train_accuracy));
        updates.insert("test_accuracy".into(), json!(report.test_accuracy));
        updates.insert("training_samples".into(), json!(report.training_samples));
        updates.insert("test_samples".into(), json!(report.test_samples));
        updates.insert("features".into(), json!(report.features));
        updates.insert("data_path".into(), json!(data_path.display().to_string()));
        updates.insert("last_trained".into(), json!(Utc::now().to_rfc3339()));
        retrained = Some(pipeline);
    }

    let blob = retrained.as_ref().map(encode).transpose()?;

    let target = state.records.stage_update(&model_id, &updates).await?;
    if let Err(error) = state.artifacts.stage(&model_id, blob, &target.metadata).await {
        abandon_update(&state, &model_id).await;
        return Err(error.into());
    }

    let applied = match state.artifacts.promote(&model_id).await {
        Ok(_) => state.records.commit_update(&model_id).await,
        Err(error) => Err(error),
    };
    let record = match applied {
        Ok(record) => record,
        Err(error) => {
            state.evict(&model_id).await;
            return Err(ApiError::internal("Model update incomplete", error)
                .with("model_id", model_id.as_str())
                .with("message", "The staged update will be applied by the next reconciliation"));
        }
    };
    if let Err(error) = state.artifacts.discard_staged(&model_id).await {
        warn!(model_id, error = %error, "Failed to clear staged artifact");
    }

    if let Some(pipeline) = retrained {
        state.refresh(&model_id, Arc::new(pipeline)).await;
    }
    info!(model_id, retrain, keys = updates.len(), "Model updated");

    Ok(Json(json!({
        "message": "Model updated successfully",
        "model_id": model_id,
        "updates": updates,
        "record": to_json(&record)?,
    })))
}

/// Drops a staged update whose artifacts could not be staged.
async fn abandon_update(state: &AppState, model_id: &str) {
    if let Err(error) = state.artifacts.discard_staged(model_id).await {
        warn!(model_id, error = %error, "Failed to clear partial staging");
    }
    if let Err(error) = state.records.discard_update(model_id).await {
        warn!(model_id, error = %error, "Failed to discard staged update");
    }
}

async fn delete_model(
    State(state): State<AppState>,
    path: Result<Path<String>, PathRejection>,
) -> Result<Json<Value>, ApiError> {
    let Path(model_id) = path?;
    if state.records.get(&model_id).await?.is_none() {
        return Err(model_not_found(&model_id));
    }

    state.records.mark_deleting(&model_id).await?;
    match state.artifacts.delete(&model_id).await {
        Ok(_) => {}
        Err(StoreError::NotFound(_)) => warn!(model_id, "Model had no artifact to delete"),
        Err(error) => return Err(error.into()),
    }
    state.records.delete(&model_id).await?;
    state.evict(&model_id).await;

    info!(model_id, "Model deleted");
    Ok(Json(json!({
        "message": "Model deleted successfully",
        "model_id": model_id,
    })))
}

#[derive(Debug, Deserialize)]
struct PredictParams {
    data_path: Option<String>,
}

async fn predict(
    State(state): State<AppState>,
    path: Result<Path<String>, PathRejection>,
    query: Result<Query<PredictParams>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Path(model_id) = path?;
    let Query(params) = query?;
    let record: ModelRecord = state
        .records
        .get(&model_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Model not found").with("model_id", model_id.as_str()))?;

    let pipeline = if let Some(pipeline) = state.cached(&model_id).await {
        pipeline
    } else {
        let blob = state.artifacts.download(&model_id).await?.ok_or_else(|| {
            ApiError::not_found("Model artifact not found").with("model_id", model_id.as_str())
        })?;
        let forest = RandomForest::from_bytes(&blob)
            .map_err(|error| ApiError::internal("Prediction failed", error))?;
        let config = state.settings.pipeline_with(
            *forest.config(),
            record.metadata.target_column.as_deref(),
        );
        let pipeline = Arc::new(Pipeline::from_classifier(config, forest));
        state.cache(&model_id, Arc::clone(&pipeline)).await;
        pipeline
    };

    let data_path = state.settings.data_path(
        params
            .data_path
            .as_deref()
            .or(record.metadata.data_path.as_deref()),
    );
    let holdout = state::holdout(pipeline, &data_path).await?;

    let predictions: Vec<Value> = holdout.predictions.iter().map(|label| label_value(label)).collect();
    let actual: Vec<Value> = holdout.actual.iter().map(|label| label_value(label)).collect();

    Ok(Json(json!({
        "model_id": model_id,
        "predictions": predictions,
        "actual": actual,
        "accuracy": holdout.accuracy,
    })))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use database::RecordState;
    use futures::StreamExt;
    use futures::stream::BoxStream;
    use http_body_util::BodyExt;
    use object_store::memory::InMemory;
    use object_store::path::Path as ObjectPath;
    use object_store::{
        CopyOptions, GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore,
        PutMultipartOptions, PutOptions, PutPayload, PutResult,
    };
    use tower::ServiceExt;

    use super::*;

    fn write_dataset() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "sepal_length,sepal_width,target").expect("header");
        for i in 0..40 {
            let class = i % 2;
            let base = if class == 0 { 1.0 } else { 6.0 };
            writeln!(file, "{},{},{}", base + f64::from(i % 5) * 0.1, base * 0.5, class).expect("row");
        }
        file
    }

    /// Failures to inject, matched against object paths.
    #[derive(Debug, Default, Clone, Copy)]
    struct Faults {
        put: Option<&'static str>,
        copy_to: Option<&'static str>,
        delete: bool,
    }

    /// In-memory store that fails selected writes.
    #[derive(Debug, Default)]
    struct FaultyStore {
        inner: InMemory,
        faults: std::sync::Mutex<Faults>,
    }

    impl FaultyStore {
        fn inject(&self, faults: Faults) {
            *self.faults.lock().expect("faults") = faults;
        }

        fn current(&self) -> Faults {
            *self.faults.lock().expect("faults")
        }
    }

    fn injected(location: &ObjectPath) -> object_store::Error {
        object_store::Error::Generic {
            store: "FaultyStore",
            source: format!("injected failure at {location}").into(),
        }
    }

    fn hits(pattern: Option<&str>, location: &ObjectPath) -> bool {
        pattern.is_some_and(|pattern| location.as_ref().contains(pattern))
    }

    impl std::fmt::Display for FaultyStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "FaultyStore({})", self.inner)
        }
    }

    #[async_trait]
    impl ObjectStore for FaultyStore {
        async fn put_opts(
            &self,
            location: &ObjectPath,
            payload: PutPayload,
            opts: PutOptions,
        ) -> object_store::Result<PutResult> {
            if hits(self.current().put, location) {
                return Err(injected(location));
            }
            self.inner.put_opts(location, payload, opts).await
        }

        async fn put_multipart_opts(
            &self,
            location: &ObjectPath,
            opts: PutMultipartOptions,
        ) -> object_store::Result<Box<dyn MultipartUpload>> {
            self.inner.put_multipart_opts(location, opts).await
        }

        async fn get_opts(&self, location: &ObjectPath, options: GetOptions) -> object_store::Result<GetResult> {
            self.inner.get_opts(location, options).await
        }

        fn delete_stream(
            &self,
            locations: BoxStream<'static, object_store::Result<ObjectPath>>,
        ) -> BoxStream<'static, object_store::Result<ObjectPath>> {
            if !self.current().delete {
                return self.inner.delete_stream(locations);
            }
            locations
                .map(|location| location.and_then(|location| Err::<ObjectPath, _>(injected(&location))))
                .boxed()
        }

        fn list(&self, prefix: Option<&ObjectPath>) -> BoxStream<'static, object_store::Result<ObjectMeta>> {
            self.inner.list(prefix)
        }

        async fn list_with_delimiter(&self, prefix: Option<&ObjectPath>) -> object_store::Result<ListResult> {
            self.inner.list_with_delimiter(prefix).await
        }

        async fn copy_opts(
            &self,
            from: &ObjectPath,
            to: &ObjectPath,
            options: CopyOptions,
        ) -> object_store::Result<()> {
            if hits(self.current().copy_to, to) {
                return Err(injected(to));
            }
            self.inner.copy_opts(from, to, options).await
        }
    }

    struct Harness {
        app: Router,
        records: ModelRepository,
        artifacts: ArtifactStore,
    }

    async fn harness() -> Harness {
        harness_with(Arc::new(InMemory::new())).await
    }

    async fn harness_with(store: Arc<dyn ObjectStore>) -> Harness {
        let pool = database::connect("sqlite::memory:").await.expect("database");
        let records = ModelRepository::new(pool);
        let artifacts = ArtifactStore::new(store);
        let state = AppState::new(records.clone(), artifacts.clone(), Settings::default());
        Harness {
            app: router(state),
            records,
            artifacts,
        }
    }

    async fn faulty_harness() -> (Harness, Arc<FaultyStore>) {
        let store = Arc::new(FaultyStore::default());
        (harness_with(store.clone()).await, store)
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let body = body.map_or_else(Body::empty, |value| Body::from(value.to_string()));
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .expect("request");

        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let harness = harness().await;
        let (status, body) = send(&harness.app, Method::GET, "/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["services"]["records"], "connected");
        assert_eq!(body["services"]["artifacts"], "connected");
    }

    #[tokio::test]
    async fn test_model_lifecycle() {
        let harness = harness().await;
        let file = write_dataset();
        let path = file.path().display().to_string();
        let app = &harness.app;

        let create = json!({"model_id": "m1", "data_path": path, "owner": "ml-team"});
        let (status, body) = send(app, Method::POST, "/models", Some(create.clone())).await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        assert_eq!(body["model_id"], "m1");
        assert_eq!(body["artifact_key"], "artifacts/m1/model");
        assert_eq!(body["metadata"]["owner"], "ml-team");

        let record = harness.records.get("m1").await.expect("get").expect("record");
        let artifact = harness
            .artifacts
            .get_metadata("m1")
            .await
            .expect("metadata")
            .expect("artifact metadata");
        assert_eq!(record.metadata.model_type, artifact.model_type);
        assert_eq!(record.metadata.train_accuracy, artifact.train_accuracy);
        assert!(harness.artifacts.exists("m1").await.expect("exists"));

        let (status, body) = send(app, Method::POST, "/models", Some(create)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "Duplicate model ID");
        assert_eq!(body["existing_model"]["model_id"], "m1");

        let (status, body) = send(app, Method::PUT, "/models/m1", Some(json!({"version": "2.0"}))).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["record"]["version"], "2.0");
        let artifact = harness
            .artifacts
            .get_metadata("m1")
            .await
            .expect("metadata")
            .expect("artifact metadata");
        assert_eq!(artifact.extra.get("version"), Some(&json!("2.0")));

        let (status, body) = send(app, Method::GET, "/models/m1/predict", None).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let accuracy = body["accuracy"].as_f64().expect("accuracy");
        assert!((0.0..=1.0).contains(&accuracy));
        assert_eq!(body["predictions"].as_array().map(Vec::len), Some(12));

        let (status, body) = send(app, Method::DELETE, "/models/m1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["model_id"], "m1");
        assert!(!harness.artifacts.exists("m1").await.expect("exists"));

        let (status, _) = send(app, Method::GET, "/models?model_id=m1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_generates_id_and_rejects_bad_input() {
        let harness = harness().await;
        let file = write_dataset();
        let path = file.path().display().to_string();
        let app = &harness.app;

        let (status, body) = send(app, Method::POST, "/models", Some(json!({"data_path": path}))).await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        let model_id = body["model_id"].as_str().expect("id");
        assert!(model_id.starts_with("model_"));
        assert_eq!(model_id.len(), "model_".len() + 8);

        let (status, body) = send(app, Method::POST, "/models", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No JSON data provided");

        let (status, body) = send(
            app,
            Method::POST,
            "/models",
            Some(json!({"model_id": "m2", "data_path": "missing.csv"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Data file not found");
        assert!(harness.records.get_any("m2").await.expect("get_any").is_none());

        let (status, _) = send(app, Method::POST, "/models", Some(json!({"model_id": "a/b"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_query_parameters() {
        let harness = harness().await;
        let file = write_dataset();
        let path = file.path().display().to_string();
        let app = &harness.app;
        send(app, Method::POST, "/models", Some(json!({"model_id": "m1", "data_path": path}))).await;

        let (status, body) = send(app, Method::GET, "/models", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No query parameters provided");

        let (status, body) = send(app, Method::GET, "/models?owner=me&model_type=x", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["invalid_parameters"], json!(["owner"]));

        let (status, _) = send(app, Method::GET, "/models?accuracy_threshold=high", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(app, Method::GET, "/models?model_type=RandomForest", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["results"][0]["model_id"], "m1");

        let (status, body) = send(app, Method::GET, "/models?model_type=Linear", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "No models found matching criteria");
        assert_eq!(body["results"], json!([]));

        let (status, body) = send(app, Method::GET, "/models?model_id=m1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["model_id"], "m1");
    }

    #[tokio::test]
    async fn test_retrain_updates_accuracy() {
        let harness = harness().await;
        let file = write_dataset();
        let path = file.path().display().to_string();
        let app = &harness.app;
        send(app, Method::POST, "/models", Some(json!({"model_id": "m1", "data_path": path}))).await;

        let (status, body) = send(app, Method::PUT, "/models/m1", Some(json!({"retrain": true}))).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert!(body["updates"]["test_accuracy"].is_number());
        assert!(body["record"]["last_trained"].is_string());

        let record = harness.records.get("m1").await.expect("get").expect("record");
        assert!(record.metadata.last_trained.is_some());
    }

    #[tokio::test]
    async fn test_missing_models() {
        let harness = harness().await;
        let app = &harness.app;

        let (status, _) = send(app, Method::PUT, "/models/ghost", Some(json!({"a": 1}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(app, Method::DELETE, "/models/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(app, Method::GET, "/models/ghost/predict", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_requires_body() {
        let harness = harness().await;
        let file = write_dataset();
        let path = file.path().display().to_string();
        let app = &harness.app;
        send(app, Method::POST, "/models", Some(json!({"model_id": "m1", "data_path": path}))).await;

        let (status, body) = send(app, Method::PUT, "/models/m1", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No JSON data provided");
    }

    #[tokio::test]
    async fn test_unknown_route_and_wrong_method() {
        let harness = harness().await;

        let (status, body) = send(&harness.app, Method::GET, "/train", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["available_endpoints"].as_array().map(Vec::len), Some(6));

        let (status, body) = send(&harness.app, Method::DELETE, "/models", None).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body["error"], "Method not allowed for this endpoint");
    }

    #[tokio::test]
    async fn test_failed_upload_removes_pending_record() {
        let (harness, store) = faulty_harness().await;
        let file = write_dataset();
        let path = file.path().display().to_string();
        let app = &harness.app;
        let create = json!({"model_id": "m1", "data_path": path});

        store.inject(Faults {
            put: Some("artifacts/m1/"),
            ..Faults::default()
        });
        let (status, body) = send(app, Method::POST, "/models", Some(create.clone())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Storage failure");
        assert!(harness.records.get_any("m1").await.expect("get_any").is_none());

        store.inject(Faults::default());
        let (status, body) = send(app, Method::POST, "/models", Some(create)).await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
    }

    #[tokio::test]
    async fn test_failed_staging_leaves_model_unchanged() {
        let (harness, store) = faulty_harness().await;
        let file = write_dataset();
        let path = file.path().display().to_string();
        let app = &harness.app;
        send(app, Method::POST, "/models", Some(json!({"model_id": "m1", "data_path": path}))).await;
        let before = harness.records.get("m1").await.expect("get").expect("record");
        let blob = harness.artifacts.download("m1").await.expect("download");

        store.inject(Faults {
            put: Some("/staged/"),
            ..Faults::default()
        });
        let update = json!({"version": "2.0", "retrain": true});
        let (status, _) = send(app, Method::PUT, "/models/m1", Some(update.clone())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let (status, body) = send(app, Method::GET, "/models?model_id=m1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["version"].is_null());
        let after = harness.records.get_any("m1").await.expect("get_any").expect("record");
        assert_eq!(after, before);
        assert_eq!(after.state, RecordState::Committed);
        assert!(after.staged.is_none());
        assert_eq!(harness.artifacts.download("m1").await.expect("download"), blob);
        assert!(!harness.artifacts.is_staged("m1").await.expect("staged"));

        store.inject(Faults::default());
        let (status, body) = send(app, Method::PUT, "/models/m1", Some(update)).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["record"]["version"], "2.0");
    }

    #[tokio::test]
    async fn test_interrupted_promotion_is_completed_by_reconcile() {
        let (harness, store) = faulty_harness().await;
        let file = write_dataset();
        let path = file.path().display().to_string();
        let app = &harness.app;
        send(app, Method::POST, "/models", Some(json!({"model_id": "m1", "data_path": path}))).await;
        let before = harness.records.get("m1").await.expect("get").expect("record");

        store.inject(Faults {
            copy_to: Some("artifacts/m1/metadata"),
            ..Faults::default()
        });
        let update = json!({"version": "2.0", "retrain": true});
        let (status, body) = send(app, Method::PUT, "/models/m1", Some(update.clone())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Model update incomplete");

        let visible = harness.records.get("m1").await.expect("get").expect("still visible");
        assert_eq!(visible.metadata, before.metadata);
        assert_eq!(visible.updated_at, before.updated_at);
        assert!(visible.staged.is_some());

        let (status, body) = send(app, Method::PUT, "/models/m1", Some(update)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "Model update in progress");

        store.inject(Faults::default());
        let report = database::reconcile(&harness.records, &harness.artifacts)
            .await
            .expect("reconcile");
        assert_eq!(report.completed_updates, ["m1"]);

        let record = harness.records.get("m1").await.expect("get").expect("record");
        assert_eq!(record.metadata.extra.get("version"), Some(&json!("2.0")));
        assert!(record.metadata.last_trained.is_some());
        assert!(record.updated_at > before.updated_at);
        assert_eq!(
            harness.artifacts.get_metadata("m1").await.expect("metadata"),
            Some(record.metadata)
        );
    }

    #[tokio::test]
    async fn test_failed_artifact_delete_leaves_record_deleting() {
        let (harness, store) = faulty_harness().await;
        let file = write_dataset();
        let path = file.path().display().to_string();
        let app = &harness.app;
        send(app, Method::POST, "/models", Some(json!({"model_id": "m1", "data_path": path}))).await;

        store.inject(Faults {
            delete: true,
            ..Faults::default()
        });
        let (status, _) = send(app, Method::DELETE, "/models/m1", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let record = harness.records.get_any("m1").await.expect("get_any").expect("record");
        assert_eq!(record.state, RecordState::Deleting);
        let (status, _) = send(app, Method::GET, "/models?model_id=m1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        store.inject(Faults::default());
        let report = database::reconcile(&harness.records, &harness.artifacts)
            .await
            .expect("reconcile");
        assert_eq!(report.purged, ["m1"]);
        assert!(!harness.artifacts.exists("m1").await.expect("exists"));
    }

    #[tokio::test]
    async fn test_malformed_path_and_query_are_json_errors() {
        let harness = harness().await;
        let app = &harness.app;

        let (status, body) = send(app, Method::GET, "/models/%FF/predict", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid path parameter");
        assert!(body["details"].is_string());

        let (status, body) = send(app, Method::DELETE, "/models/%FF", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid path parameter");

        let (status, body) = send(
            app,
            Method::GET,
            "/models/m1/predict?data_path=a.csv&data_path=b.csv",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid query string");
    }
}
