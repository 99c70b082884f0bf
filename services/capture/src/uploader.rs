//! Frame upload over multipart HTTP.
//!
//! One POST per frame, no retries and no queueing. A frame that fails to
//! upload is dropped; the next cycle captures a fresh one.

use crate::connectivity::Connectivity;
use crate::source::Frame;
use bytes::{BufMut, Bytes, BytesMut};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Multipart boundary used for every upload.
pub const BOUNDARY: &str = "----LitterwatchFrameBoundary7MA4YWxkTrZu0gW";

/// Form field the server reads the image from.
pub const IMAGE_FIELD: &str = "image";

/// Maximum response body kept for error reporting.
const MAX_ERROR_BODY: usize = 512;

/// Errors that can occur while uploading a frame.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Upload server not reachable")]
    NotConnected,

    #[error("Upload request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Server rejected upload with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// A frame packaged as a single-part multipart body.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub filename: String,
    pub body: Bytes,
}

impl UploadRequest {
    pub fn new(frame: &Frame, filename: impl Into<String>) -> Self {
        let filename = filename.into();
        let mut body = BytesMut::with_capacity(frame.len() + 256);

        body.put_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.put_slice(
            format!(
                "Content-Disposition: form-data; name=\"{IMAGE_FIELD}\"; filename=\"{filename}\"\r\n"
            )
            .as_bytes(),
        );
        body.put_slice(format!("Content-Type: {}\r\n\r\n", frame.content_type).as_bytes());
        body.put_slice(&frame.data);
        body.put_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Self {
            filename,
            body: body.freeze(),
        }
    }

    /// Value for the request's Content-Type header.
    pub fn content_type() -> String {
        format!("multipart/form-data; boundary={BOUNDARY}")
    }
}

/// Client-side filename; the server assigns its own on receipt.
pub fn frame_filename(device_id: &str, frame: &Frame) -> String {
    let extension = match frame.content_type.as_str() {
        "image/png" => "png",
        "image/webp" => "webp",
        _ => "jpg",
    };

    format!(
        "{}_{}_{:06}.{}",
        device_id,
        frame.captured_at.format("%Y%m%d_%H%M%S"),
        frame.sequence,
        extension
    )
}

/// HTTP uploader for captured frames.
pub struct HttpUploader {
    client: reqwest::Client,
    upload_url: String,
    device_id: String,
    connectivity: Arc<dyn Connectivity>,
}

impl HttpUploader {
    pub fn new(
        upload_url: impl Into<String>,
        device_id: impl Into<String>,
        timeout: Duration,
        connectivity: Arc<dyn Connectivity>,
    ) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            upload_url: upload_url.into(),
            device_id: device_id.into(),
            connectivity,
        })
    }

    /// Upload one frame. The frame is consumed whatever the outcome.
    #[instrument(skip(self, frame), fields(sequence = frame.sequence, bytes = frame.len()))]
    pub async fn upload(&self, frame: Frame) -> Result<StatusCode, UploadError> {
        if !self.connectivity.is_connected().await {
            return Err(UploadError::NotConnected);
        }

        let filename = frame_filename(&self.device_id, &frame);
        let request = UploadRequest::new(&frame, filename);
        drop(frame);

        let started = Instant::now();
        let response = self
            .client
            .post(&self.upload_url)
            .header(reqwest::header::CONTENT_TYPE, UploadRequest::content_type())
            .body(request.body)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(UploadError::Rejected {
                status: status.as_u16(),
                body: truncate(body),
            });
        }

        debug!(response = %body, "Server response");
        info!(
            filename = %request.filename,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Frame uploaded"
        );

        Ok(status)
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}
