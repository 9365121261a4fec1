// Main entry point for the CT diagnostic service

use ct_diagnosis::{
    core::{types::*, Config, PipelineError, UploadError},
    orchestration::PipelineOrchestrator,
    services::{
        ArtifactStore, BroadcastProgress, FsArtifactStore, ModelStore, TeeProgress,
        TracingProgress, UploadStore,
    },
    utils::{png_data_url_async, Metrics},
};

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json,
    },
    routing::{get, post},
    Router,
};
use futures::Stream;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::{error, info, warn};

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    orchestrator: Arc<PipelineOrchestrator>,
    models: Arc<ModelStore>,
    uploads: Arc<UploadStore>,
    progress: BroadcastProgress,
    metrics: Metrics,
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, kind: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(serde_json::json!({ "error": kind, "message": message.into() })),
    )
}

fn pipeline_error(e: &PipelineError) -> ApiError {
    let status = match e {
        PipelineError::Decode { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::ModelUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({
            "error": e.kind(),
            "message": e.to_string(),
            "caseId": e.case_id(),
            "state": e.state(),
        })),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::new()?);

    // Initialize logging
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(format!(
        "ct_diagnosis={},ort=off,tower_http=info",
        match config.log_level() {
            tracing::Level::TRACE => "trace",
            tracing::Level::DEBUG => "debug",
            tracing::Level::INFO => "info",
            tracing::Level::WARN => "warn",
            tracing::Level::ERROR => "error",
        }
    ));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== CT DIAGNOSTIC PIPELINE ===");
    info!(
        "Config: model={} size={} pool={} policy={:?}",
        config.model.model_path.display(),
        config.model.input_size,
        config.model.onnx_pool_size,
        config.fallback_policy()
    );

    tokio::fs::create_dir_all(config.artifact_dir()).await?;
    tokio::fs::create_dir_all(config.upload_dir()).await?;

    // Initialize metrics and stores
    let metrics = Metrics::new();
    let store: Arc<dyn ArtifactStore> = Arc::new(FsArtifactStore::new(config.artifact_dir()));
    let models = Arc::new(ModelStore::new(config.model.clone()));

    info!("Loading segmentation model...");
    let loader = Arc::clone(&models);
    match tokio::task::spawn_blocking(move || loader.load_configured()).await? {
        Ok(model) => info!("✓ Model '{}' ready on {}", model.name(), model.backend()),
        Err(e) if config.model.require_model => return Err(e.into()),
        Err(e) => warn!(
            "Starting without a segmentation model ({}); runs follow the {:?} policy",
            e,
            config.fallback_policy()
        ),
    }

    let orchestrator = Arc::new(PipelineOrchestrator::from_config(
        &config,
        store,
        metrics.clone(),
    ));
    let state = AppState {
        config: config.clone(),
        orchestrator,
        models,
        uploads: Arc::new(UploadStore::new(config.upload_dir())),
        progress: BroadcastProgress::new(256),
        metrics,
    };

    // Setup CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats_endpoint))
        .route("/upload", post(upload_scan))
        .route("/predict", post(predict))
        .route("/progress", get(progress_stream))
        .route("/model", get(model_status).delete(unload_model))
        .route("/model/reload", post(reload_model))
        .nest_service("/tmp", ServeDir::new(config.artifact_dir()))
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.server.max_upload_mb * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    info!("{}", "=".repeat(70));
    info!("Server starting on http://{}", addr);
    info!("{}", "-".repeat(70));
    info!("Endpoints:");
    info!("  GET    /              - Root endpoint");
    info!("  GET    /health        - Health check");
    info!("  GET    /metrics       - Prometheus metrics");
    info!("  GET    /stats         - Detailed statistics");
    info!("  POST   /upload        - Upload a scan (multipart field 'file')");
    info!("  POST   /predict       - Diagnose an uploaded case ({{\"caseId\": ...}})");
    info!("  GET    /progress      - Progress events (SSE)");
    info!("  GET    /model         - Model status");
    info!("  POST   /model/reload  - Reload the segmentation model");
    info!("  DELETE /model         - Unload the segmentation model");
    info!("  GET    /tmp/*         - Artifacts");
    info!("{}", "=".repeat(70));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    Ok(())
}

async fn root() -> &'static str {
    "CT Diagnostic Pipeline - Rust Version"
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "modelLoaded": state.models.is_loaded(),
        "fallbackPolicy": format!("{:?}", state.orchestrator.policy()).to_lowercase(),
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

/// Detailed statistics endpoint (JSON)
async fn stats_endpoint(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let snapshot = state.metrics.snapshot();
    serde_json::to_value(snapshot).map(Json).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to serialize metrics: {}", e),
        )
    })
}

fn artifact_url(config: &Config, handle: &ArtifactHandle) -> String {
    format!("{}/tmp/{}", config.public_url(), handle.key)
}

/// Scan upload endpoint
///
/// # Request Format:
/// - multipart/form-data
/// - Field "file": one DICOM (.dcm) or grayscale raster (.png/.tif) slice
///
/// # Response:
/// - `{caseId, imageUrl}`; the preview is already persisted
async fn upload_scan(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.metrics.record_endpoint_request("/upload");

    let mut upload: Option<(String, Bytes)> = None;
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        api_error(StatusCode::BAD_REQUEST, "BadRequest", format!("Multipart error: {}", e))
    })? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let data = field.bytes().await.map_err(|e| {
            api_error(StatusCode::BAD_REQUEST, "BadRequest", format!("Read error: {}", e))
        })?;
        upload = Some((filename, data));
    }

    let Some((filename, data)) = upload else {
        return Err(api_error(StatusCode::BAD_REQUEST, "BadRequest", "No file provided"));
    };

    let (case_id, scan_path) = state
        .uploads
        .store(&filename, &data)
        .await
        .map_err(|e| match e {
            UploadError::InvalidFileName(_) => {
                api_error(StatusCode::BAD_REQUEST, "BadRequest", e.to_string())
            }
            UploadError::Format(_) => {
                api_error(StatusCode::UNSUPPORTED_MEDIA_TYPE, "DecodeError", e.to_string())
            }
            UploadError::Io { .. } => {
                error!("Failed to store upload: {}", e);
                api_error(StatusCode::INTERNAL_SERVER_ERROR, "IOError", e.to_string())
            }
        })?;
    info!(case_id = %case_id, "Stored upload ({} bytes)", data.len());

    let (_, preview) = state
        .orchestrator
        .preprocess_only(&scan_path)
        .await
        .map_err(|e| pipeline_error(&e))?;

    Ok(Json(serde_json::json!({
        "caseId": case_id,
        "imageUrl": artifact_url(&state.config, &preview),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PredictRequest {
    case_id: String,
}

/// Full diagnosis of a previously uploaded case
async fn predict(
    State(state): State<AppState>,
    Json(request): Json<PredictRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.metrics.record_endpoint_request("/predict");

    let case_id = CaseId::parse(&request.case_id)
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "BadRequest", "Invalid caseId"))?;
    let scan_path = state
        .uploads
        .resolve(&case_id)
        .await
        .ok_or_else(|| {
            api_error(
                StatusCode::NOT_FOUND,
                "NotFound",
                format!("No uploaded scan for case '{}'", case_id),
            )
        })?;

    // Snapshot once; a concurrent reload does not affect this run
    let model = state.models.current();
    let sink = TeeProgress {
        first: TracingProgress,
        second: state.progress.clone(),
    };

    let report = state
        .orchestrator
        .run(&scan_path, model, &sink)
        .await
        .map_err(|e| pipeline_error(&e))?;

    let overlay_png = state
        .orchestrator
        .store()
        .get(&report.case_id, ArtifactKind::Overlay)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, "IOError", e.to_string()))?;
    let overlay_data_url = png_data_url_async(overlay_png).await.map_err(|e| {
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "IOError", e.to_string())
    })?;

    Ok(Json(serde_json::json!({
        "caseId": report.case_id,
        "imageUrl": artifact_url(&state.config, &report.preview),
        "drawUrl": artifact_url(&state.config, &report.overlay),
        "heatmapUrl": report.heatmap.as_ref().map(|h| artifact_url(&state.config, h)),
        "result": report.outcome,
        "overlay": overlay_data_url,
        "processingTimeMs": report.processing_time_ms,
    })))
}

/// Server-Sent Events stream of progress for all runs
async fn progress_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    state.metrics.record_endpoint_request("/progress");
    let stream = BroadcastStream::new(state.progress.subscribe())
        .filter_map(|msg| msg.ok())
        .map(|progress| Event::default().event("progress").json_data(&progress));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn model_status(State(state): State<AppState>) -> Json<ct_diagnosis::services::ModelStatus> {
    Json(state.models.status())
}

#[derive(Debug, Default, Deserialize)]
struct ReloadRequest {
    path: Option<PathBuf>,
}

/// Hot-swap the model from `MODEL_PATH` or `{"path": ...}`; running cases keep their snapshot
async fn reload_model(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ct_diagnosis::services::ModelStatus>, ApiError> {
    state.metrics.record_endpoint_request("/model/reload");

    let request: ReloadRequest = if body.is_empty() {
        ReloadRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            api_error(StatusCode::BAD_REQUEST, "BadRequest", format!("Invalid JSON: {}", e))
        })?
    };
    let path = request
        .path
        .unwrap_or_else(|| state.models.config().model_path.clone());

    let models = Arc::clone(&state.models);
    tokio::task::spawn_blocking(move || models.load_from_path(&path))
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, "TaskJoinError", e.to_string()))?
        .map_err(|e| {
            error!("Model reload failed: {}", e);
            api_error(StatusCode::UNPROCESSABLE_ENTITY, "ModelUnavailableError", e.to_string())
        })?;

    Ok(Json(state.models.status()))
}

async fn unload_model(State(state): State<AppState>) -> Json<ct_diagnosis::services::ModelStatus> {
    state.metrics.record_endpoint_request("/model");
    state.models.unload();
    Json(state.models.status())
}
