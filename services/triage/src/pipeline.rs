use crate::inference::{Detection, InferenceRequest, InferenceWorker, WorkerError};
use crate::notifier::{self, DetectionNotice, NotifyError, TaskNotifier};
use crate::storage::{ArtifactFate, ArtifactStore, StorageError};
use crate::triage::{TriageDecision, TriagePolicy};
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{error, info, instrument, Instrument};
use uuid::Uuid;

/// Errors that fail an upload
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to store upload: {0}")]
    Storage(#[from] StorageError),

    #[error("Detection failed: {0}")]
    Worker(#[from] WorkerError),

    #[error("Processing task aborted: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// An image received by the upload endpoint
#[derive(Debug, Clone)]
pub struct IncomingImage {
    pub data: Bytes,
    pub content_type: Option<String>,
    /// Name the device gave the file
    pub original_name: Option<String>,
}

/// Everything that happened to one upload
#[derive(Debug)]
pub struct ProcessingOutcome {
    pub upload_id: Uuid,
    pub filename: String,
    pub decision: TriageDecision,
    pub fate: ArtifactFate,
    pub detections: Vec<Detection>,
    /// Completion of the background task creation, for kept detections
    pub notification: Option<oneshot::Receiver<Result<String, NotifyError>>>,
}

impl ProcessingOutcome {
    pub fn passed(&self) -> bool {
        self.decision.disposition.is_keep()
    }

    pub fn result_path(&self) -> Option<&PathBuf> {
        match &self.fate {
            ArtifactFate::Kept { result_path } => result_path.as_ref(),
            ArtifactFate::Discarded => None,
        }
    }
}

/// Upload → inference → triage → storage lifecycle → notification
#[derive(Clone)]
pub struct DetectionPipeline {
    store: Arc<ArtifactStore>,
    worker: Arc<dyn InferenceWorker>,
    policy: TriagePolicy,
    notifier: Option<Arc<dyn TaskNotifier>>,
    model: String,
}

impl DetectionPipeline {
    pub fn new(
        store: Arc<ArtifactStore>,
        worker: Arc<dyn InferenceWorker>,
        policy: TriagePolicy,
        notifier: Option<Arc<dyn TaskNotifier>>,
        model: String,
    ) -> Self {
        Self {
            store,
            worker,
            policy,
            notifier,
            model,
        }
    }

    /// Process one uploaded image to completion.
    ///
    /// The work runs on its own task, so a caller that stops waiting (a
    /// disconnected client) does not interrupt it. When the task ends the
    /// temporary artifact is gone: promoted, deleted after a kept annotated
    /// copy, or deleted with everything else.
    pub async fn process(&self, image: IncomingImage) -> Result<ProcessingOutcome, PipelineError> {
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.run(image).await }.in_current_span()).await?
    }

    #[instrument(skip(self, image), fields(upload_id = tracing::field::Empty, size_bytes = image.data.len()))]
    async fn run(&self, image: IncomingImage) -> Result<ProcessingOutcome, PipelineError> {
        let upload_id = Uuid::new_v4();
        tracing::Span::current().record("upload_id", tracing::field::display(upload_id));
        metrics::counter!("triage.uploads.received").increment(1);

        let artifact = self
            .store
            .persist(&image.data, image.content_type.as_deref())
            .await?;

        info!(
            filename = %artifact.filename,
            original_name = image.original_name.as_deref().unwrap_or("-"),
            "Upload stored, running detection"
        );
        drop(image);

        let request = InferenceRequest {
            image: artifact.temp_path.clone(),
            model: self.model.clone(),
            output_dir: self.store.results_dir().to_path_buf(),
        };

        let result = match self.worker.infer(request).await {
            Ok(result) => result,
            Err(e) => {
                error!(filename = %artifact.filename, error = %e, "Inference failed");
                metrics::counter!("triage.worker.failures").increment(1);
                self.store.discard_failed(&artifact).await;
                return Err(e.into());
            }
        };

        let decision = self.policy.evaluate(&result);
        let fate = self.store.settle(&artifact, &decision, &result).await;

        let notification = match (&fate, &self.notifier) {
            (ArtifactFate::Kept { result_path }, Some(notifier)) => Some(notifier::dispatch(
                notifier.clone(),
                DetectionNotice {
                    filename: artifact.filename.clone(),
                    confidence: result.confidence,
                    result_path: result_path.clone(),
                },
            )),
            _ => None,
        };

        if decision.disposition.is_keep() {
            metrics::counter!("triage.uploads.kept").increment(1);
        } else {
            metrics::counter!("triage.uploads.discarded").increment(1);
        }

        info!(
            filename = %artifact.filename,
            disposition = ?decision.disposition,
            reason = %decision.reason,
            detections = %result.detection_summary(),
            "Upload triaged"
        );

        Ok(ProcessingOutcome {
            upload_id,
            filename: artifact.filename,
            decision,
            fate,
            detections: result.detections,
            notification,
        })
    }
}
