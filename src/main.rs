mod acquire;
mod config;
mod finalize;
mod http;
mod indexer;
mod ingest;
mod jobs;
mod metrics;
mod models;
mod pipeline;
mod resolver;
mod search;
mod sidecar;
#[cfg(test)]
mod testing;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use config::PipelineConfig;
use jobs::{RunController, RunStatus};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, RunRequest};
use pipeline::{Pipeline, PipelineError, PipelineErrorKind};
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "imagery.api", "server crashed: {err:?}");
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = PipelineConfig::from_env();
    info!(
        target = "imagery.api",
        output_dir = %config.output_dir.display(),
        indexing = config.metadata_store.is_some(),
        perceptual_hash = config.perceptual_hash,
        "pipeline_configured"
    );
    let controller = RunController::new(Pipeline::new(config));
    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;
    let app = router(AppState {
        controller,
        prometheus_handle,
    });

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "imagery.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    controller: RunController,
    prometheus_handle: PrometheusHandle,
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/runs", post(start_run))
        .route("/runs/stop", post(stop_run))
        .route("/runs/status", get(run_status))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "sku-imagery-rs",
    }))
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct StartRunResponse {
    run_id: String,
}

/// Start an acquisition run on the background worker.
///
/// - Method: `POST`
/// - Path: `/runs`
/// - Body: `RunRequest`
/// - Response: `202 {run_id}`, or `409` while another run is active
async fn start_run(
    State(state): State<AppState>,
    Json(payload): Json<RunRequest>,
) -> Result<(StatusCode, Json<StartRunResponse>), AppError> {
    crate::metrics::inc_requests("/runs");
    info!(
        target = "imagery.api",
        entries = %payload.entries_path.display(),
        hosts = %payload.context_hosts_path.display(),
        range_start = payload.range_start.unwrap_or(0),
        range_end = payload.range_end.unwrap_or(0),
        "run_requested"
    );
    let (run_id, _worker) = state.controller.start(payload)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StartRunResponse {
            run_id: run_id.to_string(),
        }),
    ))
}

async fn stop_run(State(state): State<AppState>) -> Json<serde_json::Value> {
    crate::metrics::inc_requests("/runs/stop");
    let stopping = state.controller.stop();
    Json(json!({ "stopping": stopping }))
}

async fn run_status(State(state): State<AppState>) -> Json<RunStatus> {
    crate::metrics::inc_requests("/runs/status");
    Json(state.controller.status())
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::Conflict => StatusCode::CONFLICT,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
