//! Training and model endpoints.
//!
//! - `POST /model/train`          : queue a training job, returns `202 {"job_id"}`
//! - `GET  /model/train/{job_id}` : poll a job record
//! - `GET  /model`                : the active model, or `null`
//! - `PUT  /model`                : load a model reference and swap it in

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use colloquy_agent::{JobId, JobRecord, ModelInfo, ModelServer, TrainingCoordinator, TrainingData};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct ApiState {
    pub models: ModelServer,
    pub training: Arc<TrainingCoordinator>,
}

#[derive(Debug, Deserialize)]
pub struct TrainRequest {
    pub training_data: TrainingData,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TrainAccepted {
    pub job_id: JobId,
}

#[derive(Debug, Deserialize)]
pub struct LoadModelRequest {
    pub model_reference: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub correlation_id: String,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/model/train", post(submit_training))
        .route("/model/train/{job_id}", get(training_status))
        .route("/model", get(active_model).put(load_model))
        .with_state(state)
}

fn correlation_id() -> String {
    Uuid::new_v4().simple().to_string()
}

async fn submit_training(
    State(state): State<ApiState>,
    Json(request): Json<TrainRequest>,
) -> (StatusCode, Json<TrainAccepted>) {
    let job_id = state.training.submit(request.training_data);
    info!(
        event_name = "api.training.submitted",
        correlation_id = %correlation_id(),
        job_id = %job_id,
        "training job accepted"
    );
    (StatusCode::ACCEPTED, Json(TrainAccepted { job_id }))
}

async fn training_status(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobRecord>> {
    state.training.get_status(&JobId(job_id.clone())).map(Json).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ApiError {
                error: format!("training job `{job_id}` not found"),
                correlation_id: correlation_id(),
            }),
        )
    })
}

async fn active_model(State(state): State<ApiState>) -> Json<Option<ModelInfo>> {
    Json(state.models.current().map(|model| model.info()))
}

async fn load_model(
    State(state): State<ApiState>,
    Json(request): Json<LoadModelRequest>,
) -> ApiResult<Json<ModelInfo>> {
    let correlation_id = correlation_id();
    match state.models.load_from(&request.model_reference).await {
        Ok(model) => {
            info!(
                event_name = "api.model.loaded",
                correlation_id = %correlation_id,
                reference = %model.reference,
                "model replaced on request"
            );
            Ok(Json(model.info()))
        }
        Err(error) => {
            warn!(
                event_name = "api.model.load_failed",
                correlation_id = %correlation_id,
                reference = %request.model_reference,
                error = %error,
                "requested model could not be loaded"
            );
            let body = ApiError { error: error.to_string(), correlation_id };
            Err((StatusCode::BAD_GATEWAY, Json(body)))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
        Router,
    };
    use colloquy_agent::{
        CommandTrainer, CoordinatorSettings, JobRecord, JobStatus, ModelServer,
        PlatformModelLoader, TrainingCoordinator,
    };
    use colloquy_db::InMemoryTrackerStore;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::{router, ApiState, TrainAccepted};

    struct Harness {
        dir: TempDir,
        models: ModelServer,
        training: Arc<TrainingCoordinator>,
        app: Router,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let loader = PlatformModelLoader::new(Duration::from_secs(1), None).expect("loader");
        let models = ModelServer::new(Arc::new(loader));

        // $2 is the data reference, $4 the output path.
        let trainer = CommandTrainer::new(
            "sh",
            vec![
                "-c".to_string(),
                "printf 'trained on %s' \"$2\" > \"$4\"".to_string(),
                "train".to_string(),
            ],
            dir.path().join("models"),
        );
        let training = Arc::new(TrainingCoordinator::spawn(
            CoordinatorSettings {
                heartbeat_interval: Duration::from_millis(50),
                liveness_timeout: Duration::from_secs(30),
            },
            Arc::new(trainer),
            Arc::new(InMemoryTrackerStore::default()),
            models.clone(),
        ));

        let app = router(ApiState { models: models.clone(), training: Arc::clone(&training) });
        Harness { dir, models, training, app }
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .expect("request");

        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        // Extractor rejections answer in plain text.
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn training_job_is_accepted_polled_and_published() {
        let harness = harness();

        let (status, body) = call(
            &harness.app,
            Method::POST,
            "/model/train",
            Some(json!({"training_data": {"reference": "d1"}})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let accepted: TrainAccepted = serde_json::from_value(body).expect("job id");

        let uri = format!("/model/train/{}", accepted.job_id);
        let mut record = None;
        for _ in 0..300 {
            let (status, polled) = call(&harness.app, Method::GET, &uri, None).await;
            assert_eq!(status, StatusCode::OK);
            if polled["status"] == json!("succeeded") || polled["status"] == json!("failed") {
                record = Some(polled);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let record = record.expect("job finished");
        assert_eq!(record["status"], json!("succeeded"), "{record}");
        assert_eq!(record["training_data"], json!({"reference": "d1"}));

        let (status, active) = call(&harness.app, Method::GET, "/model", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(active["reference"], record["result_model_reference"]);
        assert_eq!(
            harness.models.current().map(|model| model.artifact().to_vec()),
            Some(b"trained on d1".to_vec())
        );
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let harness = harness();

        let (status, body) = call(&harness.app, Method::GET, "/model/train/nope", None).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], json!("training job `nope` not found"));
    }

    #[tokio::test]
    async fn put_model_swaps_or_keeps_the_active_model() {
        let harness = harness();
        let (_, empty) = call(&harness.app, Method::GET, "/model", None).await;
        assert_eq!(empty, Value::Null);

        let path = harness.dir.path().join("m1.model");
        std::fs::write(&path, b"weights").expect("write model");
        let reference = path.display().to_string();

        let (status, loaded) =
            call(&harness.app, Method::PUT, "/model", Some(json!({"model_reference": reference})))
                .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(loaded["reference"], json!(reference));

        let missing = harness.dir.path().join("missing.model").display().to_string();
        let (status, error) =
            call(&harness.app, Method::PUT, "/model", Some(json!({"model_reference": missing})))
                .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(error["error"].as_str().is_some_and(|message| message.contains("does not exist")));

        let (_, active) = call(&harness.app, Method::GET, "/model", None).await;
        assert_eq!(active["reference"], json!(reference), "failed load keeps the old model");
    }

    #[tokio::test]
    async fn jobs_are_reported_with_their_records() {
        let harness = harness();
        let (status, _) = call(
            &harness.app,
            Method::POST,
            "/model/train",
            Some(json!({"training_data": {"inline": {"nlu": []}}})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, _) = call(
            &harness.app,
            Method::POST,
            "/model/train",
            Some(json!({"training_data": "unsupported"})),
        )
        .await;
        assert!(status.is_client_error(), "unknown training data shapes are rejected");

        let mut records: Vec<JobRecord> = Vec::new();
        for _ in 0..300 {
            records = harness.training.jobs();
            if records.iter().all(|job| job.status.is_terminal()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, JobStatus::Succeeded);
    }
}
