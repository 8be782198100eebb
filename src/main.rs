// Main entry point for the document audit service

use docaudit::{
    core::{types::*, BatchOptions, Config, PipelineConfig},
    orchestration::{BatchOrchestrator, ResultStore},
    phases::{export_annotated, export_enhanced},
    services::{DocumentInput, DocumentSource, FsDocumentSource, ModelSet},
    utils::{Metrics, OutputFormat},
};

use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use base64::{engine::general_purpose, Engine};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

type ApiError = (StatusCode, String);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::new()?);

    // Initialize logging
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(format!(
        "docaudit={},tower_http=info,ort=off",
        match config.log_level() {
            tracing::Level::TRACE => "trace",
            tracing::Level::DEBUG => "debug",
            tracing::Level::INFO => "info",
            tracing::Level::WARN => "warn",
            tracing::Level::ERROR => "error",
        }
    ));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== DOCUMENT AUDIT SERVICE ===");
    info!(
        "Config: backend={:?} concurrency={} model_pool={} deadline={}ms",
        config.models.backend,
        config.batch.max_concurrency,
        config.model_pool_size(),
        config.batch.per_document_timeout_ms
    );

    // Initialize metrics
    let metrics = Metrics::new();

    // Load and warm models once for the whole process
    info!("Loading models...");
    let models = ModelSet::load(&config, metrics.clone()).await?;

    let store = Arc::new(ResultStore::with_retention(config.max_retained_batches()));
    let orchestrator = Arc::new(BatchOrchestrator::new(
        models.clone(),
        store.clone(),
        metrics.clone(),
        PipelineConfig::from_config(&config),
    ));
    let source: Arc<dyn DocumentSource> = Arc::new(FsDocumentSource::new(config.document_root()));

    let state = AppState {
        config: config.clone(),
        orchestrator,
        store,
        source,
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
        .route("/api/v1/batches", post(submit_batch))
        .route("/api/v1/batches/from-storage", post(submit_stored_batch))
        .route("/api/v1/batches/{id}", get(get_batch))
        .route("/api/v1/batches/{id}/events", get(get_batch_events))
        .route("/api/v1/documents/{id}/result", get(get_document_result))
        .route("/api/v1/documents/{id}/export/annotated", get(export_annotated_endpoint))
        .route("/api/v1/documents/{id}/export/enhanced", get(export_enhanced_endpoint))
        .route("/api/v1/history", get(history))
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.max_upload_bytes()))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    info!("{}", "=".repeat(70));
    info!("Server starting on http://{}", addr);
    info!("{}", "-".repeat(70));
    info!("Endpoints:");
    info!("  GET  /health                                - Health check");
    info!("  GET  /metrics                               - Prometheus metrics");
    info!("  GET  /stats                                 - Detailed statistics");
    info!("  POST /api/v1/batches                        - Submit documents (multipart)");
    info!("  POST /api/v1/batches/from-storage           - Submit stored document ids");
    info!("  GET  /api/v1/batches/{{id}}                   - Batch report");
    info!("  GET  /api/v1/batches/{{id}}/events?since=N    - Status events");
    info!("  GET  /api/v1/documents/{{id}}/result          - Document result");
    info!("  GET  /api/v1/documents/{{id}}/export/...      - Annotated / enhanced image");
    info!("  GET  /api/v1/history                        - Batch history");
    info!("{}", "=".repeat(70));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    models.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

async fn root() -> &'static str {
    "Document Audit Service"
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let models = state.orchestrator.models();
    let breakers: serde_json::Map<String, serde_json::Value> = models
        .gate
        .breaker_stats()
        .into_iter()
        .map(|(name, stats)| (name, serde_json::to_value(stats).unwrap_or_default()))
        .collect();

    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "model_family": models.family(),
        "model_pool_size": models.gate.pool_size(),
        "model_permits_available": models.gate.available_permits(),
        "circuit_breakers": breakers,
        "batches": state.store.batch_count(),
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

/// Detailed statistics endpoint (JSON)
async fn stats_endpoint(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let snapshot = state.metrics.snapshot();
    serde_json::to_value(snapshot).map(Json).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to serialize metrics: {}", e),
        )
    })
}

#[derive(Debug, Default, Deserialize)]
struct SubmitQuery {
    #[serde(default)]
    wait: bool,
}

/// Submit a batch of uploaded documents
///
/// # Request Format:
/// - multipart/form-data
/// - Field "documents": one or more document files
/// - Field "options" (optional): JSON `BatchOptions`
///
/// # Response:
/// - `202` with the batch id, or the final `BatchReport` with `?wait=true`
async fn submit_batch(
    State(state): State<AppState>,
    Query(query): Query<SubmitQuery>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    state.metrics.record_endpoint_request("/api/v1/batches");

    let mut inputs = Vec::new();
    let mut options = BatchOptions::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Multipart error: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "documents" => {
                let filename = field.file_name().map(|f| f.to_string());
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| (StatusCode::BAD_REQUEST, format!("Read error: {}", e)))?;

                let mut document = Document::new(uuid::Uuid::new_v4().to_string(), data.to_vec());
                if let Some(filename) = filename {
                    document = document.with_filename(filename);
                }
                inputs.push(DocumentInput::Inline(document));
            }
            "options" => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| (StatusCode::BAD_REQUEST, format!("Options read error: {}", e)))?;
                options = serde_json::from_str(&raw).map_err(|e| {
                    (StatusCode::BAD_REQUEST, format!("Invalid options JSON: {}", e))
                })?;
            }
            _ => {}
        }
    }

    if inputs.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No documents provided".to_string()));
    }

    start_batch(&state, inputs, &options, query.wait).await
}

#[derive(Debug, Deserialize)]
struct StoredBatchRequest {
    document_ids: Vec<String>,
    #[serde(default)]
    options: BatchOptions,
}

/// Submit a batch of documents already held by the document source
async fn submit_stored_batch(
    State(state): State<AppState>,
    Query(query): Query<SubmitQuery>,
    Json(request): Json<StoredBatchRequest>,
) -> Result<Response, ApiError> {
    state
        .metrics
        .record_endpoint_request("/api/v1/batches/from-storage");

    if request.document_ids.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No document ids provided".to_string()));
    }

    let inputs = request
        .document_ids
        .into_iter()
        .map(|id| DocumentInput::Stored {
            id,
            source: state.source.clone(),
        })
        .collect();

    start_batch(&state, inputs, &request.options, query.wait).await
}

async fn start_batch(
    state: &AppState,
    inputs: Vec<DocumentInput>,
    options: &BatchOptions,
    wait: bool,
) -> Result<Response, ApiError> {
    let count = inputs.len();
    let handle = state
        .orchestrator
        .submit(inputs, options)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid batch configuration: {}", e)))?;

    info!("Accepted batch {} ({} documents)", handle.batch_id, count);

    if !wait {
        let body = serde_json::json!({
            "batch_id": handle.batch_id,
            "status": BatchStatus::Running,
            "total": count,
            "report_url": format!("/api/v1/batches/{}", handle.batch_id),
            "events_url": format!("/api/v1/batches/{}/events", handle.batch_id),
        });
        return Ok((StatusCode::ACCEPTED, Json(body)).into_response());
    }

    let report = handle.wait().await.map_err(|e| {
        error!("Batch processing failed: {:?}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Processing failed: {}", e),
        )
    })?;
    Ok(Json(report).into_response())
}

async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Json<BatchReport>, ApiError> {
    state
        .store
        .get_batch_report(&batch_id)
        .map(Json)
        .ok_or_else(|| not_found("batch", &batch_id))
}

#[derive(Debug, Default, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    since: u64,
}

/// Status transitions from a cursor. Clients resume with the last
/// `sequence + 1`.
async fn get_batch_events(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let events = state
        .store
        .events_since(&batch_id, query.since)
        .ok_or_else(|| not_found("batch", &batch_id))?;
    let next = events.last().map(|e| e.sequence + 1).unwrap_or(query.since);
    let complete = state
        .store
        .get_batch_report(&batch_id)
        .map(|r| r.is_complete())
        .unwrap_or(false);

    Ok(Json(serde_json::json!({
        "batch_id": batch_id,
        "events": events,
        "next": next,
        "complete": complete,
    })))
}

async fn get_document_result(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> Result<Json<Arc<DocumentResult>>, ApiError> {
    state
        .store
        .get_result(&document_id)
        .map(Json)
        .ok_or_else(|| not_found("result for document", &document_id))
}

#[derive(Debug, Default, Deserialize)]
struct ExportQuery {
    #[serde(default)]
    format: OutputFormat,
    /// Return base64 JSON instead of raw bytes
    #[serde(default)]
    inline: bool,
}

async fn export_annotated_endpoint(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let result = state
        .store
        .get_result(&document_id)
        .ok_or_else(|| not_found("result for document", &document_id))?;
    let document = state
        .store
        .get_document(&document_id)
        .ok_or_else(|| not_found("document", &document_id))?;

    let format = query.format;
    let bytes = tokio::task::spawn_blocking(move || {
        export_annotated(&document.bytes, &result, format)
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Export task failed: {}", e)))?
    .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;

    Ok(image_response(&document_id, "annotated", bytes, format, query.inline))
}

async fn export_enhanced_endpoint(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let result = state
        .store
        .get_result(&document_id)
        .ok_or_else(|| not_found("result for document", &document_id))?;

    let format = query.format;
    let bytes = tokio::task::spawn_blocking(move || export_enhanced(&result, format))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Export task failed: {}", e)))?
        .map_err(|e| match e {
            docaudit::ExportError::MissingEnhancement(_) => (StatusCode::NOT_FOUND, e.to_string()),
            other => (StatusCode::UNPROCESSABLE_ENTITY, other.to_string()),
        })?;

    Ok(image_response(&document_id, "enhanced", bytes, format, query.inline))
}

fn image_response(
    document_id: &str,
    rendition: &str,
    bytes: Vec<u8>,
    format: OutputFormat,
    inline: bool,
) -> Response {
    if inline {
        return Json(serde_json::json!({
            "document_id": document_id,
            "content_type": format.content_type(),
            "data": general_purpose::STANDARD.encode(&bytes),
        }))
        .into_response();
    }
    let disposition = format!(
        "attachment; filename=\"{}-{}.{}\"",
        document_id.replace('"', ""),
        rendition,
        format.extension()
    );
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    20
}

async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Json<Vec<BatchSummary>> {
    Json(state.store.history(query.offset, query.limit.min(200)))
}

fn not_found(what: &str, id: &str) -> ApiError {
    (StatusCode::NOT_FOUND, format!("No {} '{}'", what, id))
}
