//! Frame sources.
//!
//! Camera bring-up happens outside this agent. A source only hands back the
//! most recent still, either from the file the camera daemon keeps updating
//! or from the camera's HTTP snapshot endpoint.

use crate::config::{ScheduleConfig, SourceKind};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur while capturing a frame.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Failed to read frame from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Snapshot request failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("Snapshot endpoint returned status {0}")]
    Status(u16),

    #[error("Camera returned an empty frame")]
    Empty,

    #[error("Source not configured: {0}")]
    NotConfigured(&'static str),
}

/// A captured still.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Encoded image bytes
    pub data: Bytes,

    /// MIME type of `data`
    pub content_type: String,

    /// Capture sequence number
    pub sequence: u64,

    /// Wall-clock capture time
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Produces one frame on demand.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn capture(&self) -> Result<Frame, CaptureError>;
}

/// Reads the latest still from disk.
pub struct FileSnapshotSource {
    path: PathBuf,
    content_type: String,
    sequence: AtomicU64,
}

impl FileSnapshotSource {
    pub fn new(path: impl Into<PathBuf>, content_type: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content_type: content_type.into(),
            sequence: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl FrameSource for FileSnapshotSource {
    async fn capture(&self) -> Result<Frame, CaptureError> {
        let data = tokio::fs::read(&self.path)
            .await
            .map_err(|source| CaptureError::Read {
                path: self.path.clone(),
                source,
            })?;

        if data.is_empty() {
            return Err(CaptureError::Empty);
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        debug!(sequence, bytes = data.len(), path = %self.path.display(), "Frame read");

        Ok(Frame {
            data: Bytes::from(data),
            content_type: self.content_type.clone(),
            sequence,
            captured_at: Utc::now(),
        })
    }
}

/// Fetches a still from the camera's snapshot URL.
pub struct HttpSnapshotSource {
    client: reqwest::Client,
    url: String,
    default_content_type: String,
    sequence: AtomicU64,
}

impl HttpSnapshotSource {
    pub fn new(
        url: impl Into<String>,
        content_type: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, CaptureError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            url: url.into(),
            default_content_type: content_type.into(),
            sequence: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl FrameSource for HttpSnapshotSource {
    async fn capture(&self) -> Result<Frame, CaptureError> {
        let response = self.client.get(&self.url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CaptureError::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| v.starts_with("image/"))
            .map(str::to_string)
            .unwrap_or_else(|| self.default_content_type.clone());

        let data = response.bytes().await?;
        if data.is_empty() {
            return Err(CaptureError::Empty);
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        debug!(sequence, bytes = data.len(), "Snapshot fetched");

        Ok(Frame {
            data,
            content_type,
            sequence,
            captured_at: Utc::now(),
        })
    }
}

/// Build the configured frame source.
pub fn from_config(
    config: &ScheduleConfig,
    timeout: Duration,
) -> Result<Box<dyn FrameSource>, CaptureError> {
    match config.source {
        SourceKind::File => Ok(Box::new(FileSnapshotSource::new(
            config.path.clone(),
            config.content_type.clone(),
        ))),
        SourceKind::Http => {
            let url = config
                .url
                .as_deref()
                .ok_or(CaptureError::NotConfigured("capture.url"))?;
            Ok(Box::new(HttpSnapshotSource::new(
                url,
                config.content_type.clone(),
                timeout,
            )?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_file_source_reads_latest_still() {
        let dir = TempDir::new().unwrap();
        let still = dir.path().join("latest.jpg");
        std::fs::write(&still, b"\xff\xd8first").unwrap();

        let source = FileSnapshotSource::new(&still, "image/jpeg");
        let first = source.capture().await.unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(&first.data[..], b"\xff\xd8first");

        std::fs::write(&still, b"\xff\xd8second").unwrap();
        let second = source.capture().await.unwrap();
        assert_eq!(second.sequence, 1);
        assert_eq!(&second.data[..], b"\xff\xd8second");
        assert_eq!(second.content_type, "image/jpeg");
    }

    #[tokio::test]
    async fn test_file_source_missing_file() {
        let dir = TempDir::new().unwrap();
        let source = FileSnapshotSource::new(dir.path().join("absent.jpg"), "image/jpeg");

        assert!(matches!(
            source.capture().await,
            Err(CaptureError::Read { .. })
        ));
    }

    #[tokio::test]
    async fn test_file_source_empty_file() {
        let dir = TempDir::new().unwrap();
        let still = dir.path().join("latest.jpg");
        std::fs::write(&still, b"").unwrap();

        let source = FileSnapshotSource::new(&still, "image/jpeg");
        assert!(matches!(source.capture().await, Err(CaptureError::Empty)));
    }

    #[tokio::test]
    async fn test_http_source_fetches_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/capture"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(b"png-bytes".to_vec()),
            )
            .mount(&server)
            .await;

        let source = HttpSnapshotSource::new(
            format!("{}/capture", server.uri()),
            "image/jpeg",
            Duration::from_secs(2),
        )
        .unwrap();

        let frame = source.capture().await.unwrap();
        assert_eq!(&frame.data[..], b"png-bytes");
        assert_eq!(frame.content_type, "image/png");
    }

    #[tokio::test]
    async fn test_http_source_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let source =
            HttpSnapshotSource::new(server.uri(), "image/jpeg", Duration::from_secs(2)).unwrap();

        assert!(matches!(
            source.capture().await,
            Err(CaptureError::Status(503))
        ));
    }

    #[tokio::test]
    async fn test_http_source_empty_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let source =
            HttpSnapshotSource::new(server.uri(), "image/jpeg", Duration::from_secs(2)).unwrap();

        assert!(matches!(source.capture().await, Err(CaptureError::Empty)));
    }

    #[test]
    fn test_http_source_requires_url() {
        let config = ScheduleConfig {
            source: SourceKind::Http,
            ..ScheduleConfig::default()
        };

        assert!(matches!(
            from_config(&config, Duration::from_secs(1)),
            Err(CaptureError::NotConfigured(_))
        ));
    }
}
