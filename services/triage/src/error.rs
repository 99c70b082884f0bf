use crate::pipeline::PipelineError;
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

/// Errors returned by the upload API
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("No image file provided")]
    MissingImage,

    #[error("{0}")]
    InvalidUpload(String),

    #[error("Image exceeds the {limit} byte upload limit")]
    PayloadTooLarge { limit: usize },

    #[error(transparent)]
    Processing(#[from] PipelineError),
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingImage | ApiError::InvalidUpload(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Processing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Map a multipart stream error, keeping the body-limit distinction
    pub fn from_multipart(err: MultipartError, limit: usize) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge { limit }
        } else {
            ApiError::InvalidUpload(err.body_text())
        }
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        warn!(reason = %rejection.body_text(), "Upload is not a multipart request");
        ApiError::MissingImage
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::MissingImage | ApiError::InvalidUpload(_) => ErrorResponse {
                error: self.to_string(),
                details: None,
            },
            ApiError::PayloadTooLarge { .. } => ErrorResponse {
                error: "Image too large".to_string(),
                details: Some(self.to_string()),
            },
            ApiError::Processing(e) => ErrorResponse {
                error: "Failed to process image".to_string(),
                details: Some(e.to_string()),
            },
        };

        if status.is_client_error() {
            metrics::counter!("triage.uploads.rejected").increment(1);
        }

        (status, Json(body)).into_response()
    }
}
