use crate::config::NotifierConfig;
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

/// Errors from the downstream task API
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Task API request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Task API rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// A confirmed detection to raise a task for
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionNotice {
    pub filename: String,
    pub confidence: f64,
    pub result_path: Option<PathBuf>,
}

/// Task creation request body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskRequest<'a> {
    request_user_id: &'a str,
}

/// Creates downstream tasks for kept detections
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskNotifier: Send + Sync {
    /// Create one task; returns the API's response body
    async fn create_task(&self, notice: DetectionNotice) -> Result<String, NotifyError>;
}

/// HTTP client for the task API
pub struct HttpTaskNotifier {
    client: reqwest::Client,
    endpoint: String,
    request_user_id: String,
}

impl HttpTaskNotifier {
    pub fn new(config: &NotifierConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        info!(endpoint = %config.endpoint(), "Task notifier initialized");

        Ok(Self {
            client,
            endpoint: config.endpoint(),
            request_user_id: config.request_user_id.clone(),
        })
    }
}

#[async_trait]
impl TaskNotifier for HttpTaskNotifier {
    #[instrument(skip(self, notice), fields(filename = %notice.filename))]
    async fn create_task(&self, notice: DetectionNotice) -> Result<String, NotifyError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&CreateTaskRequest {
                request_user_id: &self.request_user_id,
            })
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!(confidence = notice.confidence, "Task API accepted request");
        Ok(body)
    }
}

/// Fire a task creation in the background.
///
/// The returned receiver yields the outcome once the call finishes; dropping
/// it is fine. Failures are logged here and never reach the caller's request.
pub fn dispatch(
    notifier: Arc<dyn TaskNotifier>,
    notice: DetectionNotice,
) -> oneshot::Receiver<Result<String, NotifyError>> {
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let filename = notice.filename.clone();
        let result = notifier.create_task(notice).await;

        match &result {
            Ok(body) => {
                info!(filename = %filename, response = %body, "Task created");
                metrics::counter!("triage.notifications.sent").increment(1);
            }
            Err(e) => {
                warn!(filename = %filename, error = %e, "Task creation failed");
                metrics::counter!("triage.notifications.failed").increment(1);
            }
        }

        let _ = tx.send(result);
    });

    rx
}
