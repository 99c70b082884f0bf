use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::inference::Detection;
use crate::pipeline::{DetectionPipeline, IncomingImage, ProcessingOutcome};
use anyhow::{Context, Result};
use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::BytesMut;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

/// Multipart framing allowance on top of the image limit
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Name of the file field carrying the image
const IMAGE_FIELD: &str = "image";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<DetectionPipeline>,
    pub max_upload_bytes: usize,
    pub service_name: String,
    /// Whether kept detections raise downstream tasks
    pub notifications_enabled: bool,
}

/// Successful upload response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub success: bool,
    pub filename: String,
    pub confidence: f64,
    pub passed: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub detections: Vec<Detection>,
}

impl UploadResponse {
    fn from_outcome(outcome: &ProcessingOutcome, notifications_enabled: bool) -> Self {
        let passed = outcome.passed();
        let message = match (passed, notifications_enabled) {
            (true, true) => format!(
                "Litter detected ({}); cleanup task requested",
                outcome.decision.reason
            ),
            (true, false) => format!("Litter detected ({})", outcome.decision.reason),
            (false, _) => format!(
                "No litter detected ({}); image discarded",
                outcome.decision.reason
            ),
        };

        Self {
            success: true,
            filename: outcome.filename.clone(),
            confidence: outcome.decision.confidence,
            passed,
            message,
            result_path: outcome.result_path().map(|p| p.display().to_string()),
            detections: outcome.detections.clone(),
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let body_limit = state.max_upload_bytes + MULTIPART_OVERHEAD_BYTES;

    Router::new()
        .route("/health", get(health_check))
        .route("/upload", post(upload_image))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": state.service_name
    }))
}

/// Receive one image, run detection and triage it.
///
/// The response is sent only after the worker has finished and the
/// artifacts have reached their final state.
#[instrument(skip(state, multipart))]
async fn upload_image(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, ApiError> {
    let image = read_image_field(multipart?, state.max_upload_bytes).await?;
    let outcome = state.pipeline.process(image).await?;

    Ok(Json(UploadResponse::from_outcome(
        &outcome,
        state.notifications_enabled,
    )))
}

/// Pull exactly one `image` file out of the form, enforcing the size cap
/// while streaming so oversize uploads never reach disk.
async fn read_image_field(mut multipart: Multipart, limit: usize) -> Result<IncomingImage, ApiError> {
    let mut image: Option<IncomingImage> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::from_multipart(e, limit))?
    {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        if image.is_some() {
            return Err(ApiError::InvalidUpload(
                "Only one image file may be uploaded".to_string(),
            ));
        }

        let content_type = field.content_type().map(str::to_string);
        let original_name = field.file_name().map(str::to_string);

        let mut data = BytesMut::new();
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| ApiError::from_multipart(e, limit))?
        {
            if data.len() + chunk.len() > limit {
                return Err(ApiError::PayloadTooLarge { limit });
            }
            data.extend_from_slice(&chunk);
        }

        image = Some(IncomingImage {
            data: data.freeze(),
            content_type,
            original_name,
        });
    }

    match image {
        Some(image) if !image.data.is_empty() => Ok(image),
        _ => Err(ApiError::MissingImage),
    }
}

/// Start the upload API server
pub async fn start_api_server<F>(state: AppState, config: &ApiConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting upload API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
