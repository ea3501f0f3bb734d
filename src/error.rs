use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::admission::CapacityExceeded;
use crate::environment::EnvironmentError;
use crate::inference::EngineError;
use crate::ocr::OcrError;
use crate::preprocess::DecodeError;

/// Every way a pipeline request can fail, classified before it reaches the client
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid upload: {0}")]
    InvalidUpload(String),

    #[error("Image decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Capacity(#[from] CapacityExceeded),

    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("OCR error: {0}")]
    Ocr(#[from] OcrError),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::InvalidUpload(_) | GatewayError::Decode(_) => StatusCode::BAD_REQUEST,
            GatewayError::Capacity(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Environment(_) | GatewayError::Engine(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GatewayError::Ocr(OcrError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Ocr(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show the caller; internal error text stays in the logs
    pub fn public_message(&self) -> &'static str {
        match self {
            GatewayError::InvalidUpload(_) => "unable to read uploaded image",
            GatewayError::Decode(_) => "failed to decode image",
            GatewayError::Capacity(_) => "system busy, please retry later",
            GatewayError::Environment(_) => "inference environment unavailable",
            GatewayError::Engine(EngineError::TensorAlloc(_)) => "failed to create tensor",
            GatewayError::Engine(EngineError::SessionCreate(_)) => "failed to load model session",
            GatewayError::Engine(_) => "inference failed",
            GatewayError::Ocr(OcrError::Timeout(_)) => "OCR processing timed out",
            GatewayError::Ocr(OcrError::Workspace(_)) => "failed to prepare OCR workspace",
            GatewayError::Ocr(OcrError::Spawn(_)) | GatewayError::Ocr(OcrError::ProcessFailed { .. }) => {
                "OCR process failed"
            }
            GatewayError::Ocr(OcrError::MissingResult(_)) => "unable to read OCR result",
            GatewayError::Ocr(OcrError::InvalidResult(_)) => "failed to parse OCR result",
        }
    }

    /// Diagnostic output deliberately passed through to the caller
    pub fn details(&self) -> Option<&str> {
        match self {
            GatewayError::Ocr(OcrError::ProcessFailed { output, .. }) => Some(output),
            _ => None,
        }
    }

    /// Short label for the outcome metric
    pub fn outcome(&self) -> &'static str {
        match self {
            GatewayError::InvalidUpload(_) | GatewayError::Decode(_) => "input_error",
            GatewayError::Capacity(_) => "capacity",
            GatewayError::Environment(_) => "environment",
            GatewayError::Engine(_) => "engine_error",
            GatewayError::Ocr(OcrError::Timeout(_)) => "timeout",
            GatewayError::Ocr(_) => "process_error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let mut body = json!({ "error": self.public_message() });
        if let Some(details) = self.details() {
            body["details"] = json!(details);
        }
        (self.status_code(), Json(body)).into_response()
    }
}
