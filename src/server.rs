//! HTTP API over the docqa pipeline.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/v1/process` | Answer a query (`{"query": "..."}`) |
//! | `POST` | `/api/v1/documents` | Ingest a document (base64 bytes or inline text) |
//! | `GET`  | `/api/v1/chunks` | Inspect stored chunks |
//! | `DELETE` | `/api/v1/documents/{id}` | Delete a document and its chunks |
//! | `GET`  | `/api/v1/stats` | Document, chunk, and embedding counts |
//! | `GET`  | `/health` | Version and per-tier availability |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `timeout` (408),
//! `unsupported_format` (415), `extraction_failed` (422), `internal` (500),
//! `no_answer` (503).
//!
//! A client that disconnects mid-request drops the handler future, which
//! cancels the pipeline call and releases any store locks it held.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use base64::Engine;
use docqa_core::models::{Answer, Chunk, ChunkFilter, Document, DocumentFormat, IngestReport, StoreStats};
use docqa_core::{ExtractionError, Pipeline, PipelineError};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::Config;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

/// Build the router. Exposed separately from [`run_server`] so tests can
/// serve it on an ephemeral port.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/process", post(handle_process))
        .route("/api/v1/documents", post(handle_ingest))
        .route("/api/v1/documents/{id}", delete(handle_delete))
        .route("/api/v1/chunks", get(handle_chunks))
        .route("/api/v1/stats", get(handle_stats))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Start the server on `[server].bind` and run until the process exits.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pipeline = crate::build_pipeline(config).await?;
    let app = router(AppState {
        pipeline: Arc::new(pipeline),
    });

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "docqa server listening");
    println!("docqa server listening on http://{}", config.server.bind);

    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "not_found", message)
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let message = err.to_string();
        match err {
            PipelineError::InvalidQuery(_) => bad_request(message),
            PipelineError::Extraction(ExtractionError::UnsupportedFormat(_)) => {
                AppError::new(StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported_format", message)
            }
            PipelineError::Extraction(ExtractionError::Extraction { .. }) => {
                AppError::new(StatusCode::UNPROCESSABLE_ENTITY, "extraction_failed", message)
            }
            PipelineError::Store(_) => {
                warn!(error = %message, "store failure while handling request");
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
            }
            PipelineError::NoAnswerAvailable { .. } => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "no_answer", message)
            }
            PipelineError::Cancelled => AppError::new(StatusCode::REQUEST_TIMEOUT, "timeout", message),
        }
    }
}

// ============ Handlers ============

#[derive(Deserialize)]
struct ProcessRequest {
    query: String,
}

async fn handle_process(
    State(state): State<AppState>,
    Json(req): Json<ProcessRequest>,
) -> Result<Json<Answer>, AppError> {
    let answer = state.pipeline.query(&req.query).await?;
    Ok(Json(answer))
}

/// Ingest body. Exactly one of `content_base64` or `text` must be set.
#[derive(Deserialize)]
struct IngestRequest {
    source: String,
    /// MIME type, short name (`pdf`), or extension. Inferred from `source`
    /// when omitted.
    format: Option<String>,
    content_base64: Option<String>,
    text: Option<String>,
}

impl IngestRequest {
    fn into_document(self) -> Result<Document, AppError> {
        if self.source.trim().is_empty() {
            return Err(bad_request("source must not be empty"));
        }
        let explicit = match self.format.as_deref() {
            Some(f) => Some(
                f.parse::<DocumentFormat>()
                    .map_err(|_| AppError::new(
                        StatusCode::UNSUPPORTED_MEDIA_TYPE,
                        "unsupported_format",
                        format!("unsupported format: {}", f),
                    ))?,
            ),
            None => None,
        };
        let inferred = DocumentFormat::from_path(std::path::Path::new(&self.source));

        match (self.content_base64, self.text) {
            (Some(b64), None) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(b64.trim())
                    .map_err(|e| bad_request(format!("content_base64 is not valid base64: {}", e)))?;
                let format = explicit.or(inferred).ok_or_else(|| {
                    bad_request("format is required when it cannot be inferred from source")
                })?;
                Ok(Document::new(self.source, format, bytes))
            }
            (None, Some(text)) => {
                let format = explicit.or(inferred).unwrap_or(DocumentFormat::PlainText);
                Ok(Document::new(self.source, format, text.into_bytes()))
            }
            _ => Err(bad_request("exactly one of content_base64 or text is required")),
        }
    }
}

async fn handle_ingest(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Result<Json<IngestReport>, AppError> {
    let document = req.into_document()?;
    let report = state.pipeline.ingest(document).await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct ChunksParams {
    document_id: Option<String>,
    source: Option<String>,
    contains: Option<String>,
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct ChunksResponse {
    chunks: Vec<Chunk>,
}

async fn handle_chunks(
    State(state): State<AppState>,
    Query(params): Query<ChunksParams>,
) -> Result<Json<ChunksResponse>, AppError> {
    let filter = ChunkFilter {
        document_id: params.document_id,
        source: params.source,
        text_contains: params.contains,
        offset: params.offset,
        limit: params.limit,
    };
    let chunks = state.pipeline.search_chunks(&filter).await?;
    Ok(Json(ChunksResponse { chunks }))
}

#[derive(Serialize)]
struct DeleteResponse {
    document_id: String,
    chunks_removed: usize,
}

async fn handle_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    let removed = state.pipeline.delete(&id).await?;
    if removed == 0 {
        return Err(not_found(format!("document not found: {}", id)));
    }
    Ok(Json(DeleteResponse {
        document_id: id,
        chunks_removed: removed,
    }))
}

async fn handle_stats(State(state): State<AppState>) -> Result<Json<StoreStats>, AppError> {
    Ok(Json(state.pipeline.stats().await?))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    tiers: BTreeMap<String, bool>,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        tiers: state.pipeline.health(),
    })
}
