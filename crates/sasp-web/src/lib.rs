//! Axum surface for reading stats and triggering pipeline passes by hand.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use sasp_pipeline::{PipelineError, StatsAggregator, StatsWorker};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sasp-web";

#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<StatsAggregator>,
    pub worker: Arc<StatsWorker>,
}

impl AppState {
    pub fn new(aggregator: Arc<StatsAggregator>, worker: Arc<StatsWorker>) -> Self {
        Self { aggregator, worker }
    }
}

struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(error = %self.0, "request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"status": "error", "message": self.0.to_string()})),
        )
            .into_response()
    }
}

fn envelope(data: impl serde::Serialize) -> Response {
    Json(json!({"status": "ok", "data": data})).into_response()
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats/{student_id}", get(stats_handler))
        .route("/stats/{student_id}/full", get(full_profile_handler))
        .route("/stats/{student_id}/refresh", post(refresh_handler))
        .route("/worker/run-fetch", post(run_fetch_handler))
        .route("/worker/run-process", post(run_process_handler))
        .route("/worker/run-certificates", post(run_certificates_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, bind_addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!(addr = %listener.local_addr()?, "web server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    envelope(json!({"service": CRATE_NAME}))
}

async fn stats_handler(
    State(state): State<Arc<AppState>>,
    Path(student_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let statistics = state.aggregator.get_user_statistics(student_id).await?;
    Ok(envelope(statistics))
}

async fn full_profile_handler(
    State(state): State<Arc<AppState>>,
    Path(student_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let profile = state.aggregator.get_full_profile(student_id).await?;
    Ok(envelope(profile))
}

/// Drop cached entries and recompute from canonical attempts.
async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    Path(student_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    state.aggregator.invalidate(student_id).await;
    let stats = state.aggregator.refresh_user_stats(student_id).await?;
    Ok(envelope(stats))
}

// Manual triggers run the same passes the scheduler does.

async fn run_fetch_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let summary = state.worker.run_fetch().await?;
    Ok(envelope(summary))
}

async fn run_process_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let summary = state.worker.run_process().await?;
    Ok(envelope(summary))
}

async fn run_certificates_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let issued = state.worker.run_certificate_scan().await?;
    Ok(envelope(json!({"issued": issued})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use sasp_contracts::ContractManager;
    use sasp_pipeline::{
        LocalCertificateIssuer, PipelineConfig, SourceClient, StatsProcessor,
    };
    use sasp_store::{MemoryStore, RawStore, StatsCache};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn write_schema(dir: &std::path::Path, contract: &str, schema: &Value) {
        let contract_dir = dir.join(contract);
        tokio::fs::create_dir_all(&contract_dir).await.unwrap();
        tokio::fs::write(
            contract_dir.join("v1.json"),
            serde_json::to_vec_pretty(schema).unwrap(),
        )
        .await
        .unwrap();
    }

    async fn test_state() -> (AppState, Arc<MemoryStore>, TempDir) {
        let schemas = tempfile::tempdir().unwrap();
        write_schema(
            schemas.path(),
            "attempt_detail",
            &json!({
                "type": "object",
                "properties": {
                    "attempt_id": {"type": "string"},
                    "student_id": {"type": "string"},
                    "date_of_attempt": {"type": "string"}
                },
                "required": ["attempt_id", "student_id", "date_of_attempt"]
            }),
        )
        .await;
        write_schema(schemas.path(), "user_stats", &json!({"type": "object"})).await;
        write_schema(schemas.path(), "attempts_list", &json!({"type": "object"})).await;

        let store = Arc::new(MemoryStore::new());
        let contracts = Arc::new(ContractManager::new(schemas.path()));
        let cache = StatsCache::new(1024, Duration::from_secs(60));
        let aggregator = Arc::new(StatsAggregator::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            cache,
        ));
        let mut config = PipelineConfig::from_env();
        config.source_base_url = "http://127.0.0.1:9".to_string();
        let processor = Arc::new(StatsProcessor::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            contracts.clone(),
            aggregator.clone(),
            Arc::new(LocalCertificateIssuer),
            &config,
        ));
        let source = Arc::new(SourceClient::new(&config, contracts, store.clone()).unwrap());
        let worker = Arc::new(StatsWorker::new(config, source, processor, store.clone()));
        (AppState::new(aggregator, worker), store, schemas)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok_envelope() {
        let (state, _store, _schemas) = test_state().await;
        let response = app(state)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn stats_endpoint_returns_zeroed_stats_for_new_student() {
        let (state, _store, _schemas) = test_state().await;
        let student = Uuid::new_v4();
        let response = app(state)
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/stats/{student}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["statistics"]["total_attempts"], 0);
        assert_eq!(body["data"]["statistics"]["student_id"], student.to_string());
    }

    #[tokio::test]
    async fn process_trigger_drains_staging_and_refresh_updates_stats() {
        let (state, store, _schemas) = test_state().await;
        let student = Uuid::new_v4();
        store.add_student(student).await;
        let attempt = Uuid::new_v4();
        store
            .upsert_attempt(
                attempt,
                student,
                None,
                json!({
                    "attempt_id": attempt.to_string(),
                    "student_id": student.to_string(),
                    "date_of_attempt": "2026-03-01",
                    "point": 82.0,
                    "completed": true,
                    "passed": true
                }),
            )
            .await
            .unwrap();

        let router = app(state);
        let response = router
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/worker/run-process")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["processed"], 1);

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/stats/{student}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["data"]["statistics"]["total_attempts"], 1);
        assert_eq!(body["data"]["statistics"]["passed_attempts"], 1);
    }

    #[tokio::test]
    async fn certificate_trigger_reports_issued_count() {
        let (state, store, _schemas) = test_state().await;
        let student = Uuid::new_v4();
        store.add_student(student).await;
        let attempt = Uuid::new_v4();
        store
            .upsert_attempt(
                attempt,
                student,
                None,
                json!({
                    "attempt_id": attempt.to_string(),
                    "student_id": student.to_string(),
                    "date_of_attempt": "2026-03-01",
                    "point": 95.0,
                    "completed": true,
                    "passed": true
                }),
            )
            .await
            .unwrap();

        let router = app(state);
        for uri in ["/worker/run-process", "/worker/run-certificates"] {
            let response = router
                .clone()
                .oneshot(
                    axum::http::Request::builder()
                        .method("POST")
                        .uri(uri)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/stats/{student}/full"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["data"]["certificates"]["uncategorized"].as_array().unwrap().len(), 1);
    }
}
