//! HTTP surface: routes, multipart upload extraction and per-request bookkeeping.

use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::classifier::{self, ClassificationService};
use crate::environment::EnvironmentStatus;
use crate::error::GatewayError;
use crate::metrics::{self, Timer};
use crate::text_extraction::{self, TextExtractionService};

/// Multipart field carrying the image
pub const UPLOAD_FIELD: &str = "file";

#[derive(Clone)]
pub struct AppState {
    pub classifier: Arc<ClassificationService>,
    pub text_extraction: Arc<TextExtractionService>,
}

/// One uploaded file, fully buffered
#[derive(Debug)]
pub struct Upload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/api/ai/image/classification", post(classify_image))
        .route("/api/ai/image/ocr/text", post(extract_text))
        // Misspelled path kept for existing clients
        .route("/api/ai/image/orc/text", post(extract_text))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Pull the `file` field out of the form; other fields are skipped
pub async fn read_upload(
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Upload, GatewayError> {
    let mut multipart = multipart.map_err(|e| GatewayError::InvalidUpload(e.body_text()))?;

    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| GatewayError::InvalidUpload(e.body_text()))?
            .ok_or_else(|| GatewayError::InvalidUpload(format!("missing '{}' field", UPLOAD_FIELD)))?;

        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| GatewayError::InvalidUpload(e.body_text()))?;
        return Ok(Upload {
            file_name,
            bytes: bytes.to_vec(),
        });
    }
}

async fn classify_image(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let span = info_span!("classify", request_id = %Uuid::new_v4(), pipeline = classifier::PIPELINE);
    let timer = Timer::new();

    let result = async {
        let service = &state.classifier;
        service.check_environment().await?;
        let slot = service.admit().await?;
        let upload = read_upload(multipart).await?;
        service.classify(slot, upload.bytes).await
    }
    .instrument(span.clone())
    .await;

    span.in_scope(|| finish(classifier::PIPELINE, &timer, &result));
    match result {
        Ok(decision) => Json(json!({ "result": decision.label })).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn extract_text(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let span = info_span!("ocr", request_id = %Uuid::new_v4(), pipeline = text_extraction::PIPELINE);
    let timer = Timer::new();

    let result = async {
        let upload = read_upload(multipart).await?;
        let service = &state.text_extraction;
        let slot = service.admit().await?;
        service.extract(slot, &upload.file_name, &upload.bytes).await
    }
    .instrument(span.clone())
    .await;

    span.in_scope(|| finish(text_extraction::PIPELINE, &timer, &result));
    match result {
        Ok(extraction) => Json(extraction).into_response(),
        Err(e) => e.into_response(),
    }
}

fn finish<T>(pipeline: &'static str, timer: &Timer, result: &Result<T, GatewayError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.outcome(),
    };
    metrics::REQUESTS.with_label_values(&[pipeline, outcome]).inc();
    timer.observe(&metrics::REQUEST_LATENCY, pipeline);

    match result {
        Ok(_) => info!(latency_ms = timer.elapsed_ms(), "Request completed"),
        Err(e) if e.status_code().is_server_error() && !matches!(e, GatewayError::Capacity(_)) => {
            error!(latency_ms = timer.elapsed_ms(), error = %e, "Request failed")
        }
        Err(e) => warn!(latency_ms = timer.elapsed_ms(), error = %e, "Request rejected"),
    }
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let (engine, engine_error) = match state.classifier.environment_status() {
        EnvironmentStatus::Uninitialized => ("uninitialized", None),
        EnvironmentStatus::Ready => ("ready", None),
        EnvironmentStatus::Failed(e) => ("failed", Some(e)),
    };
    Json(json!({
        "status": "ok",
        "engine": engine,
        "engine_error": engine_error,
    }))
}

/// Prometheus metrics endpoint
async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics::export_metrics(),
    )
}

fn panic_response(panic: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    error!(panic = %message, "Handler panicked");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal server error" })),
    )
        .into_response()
}
