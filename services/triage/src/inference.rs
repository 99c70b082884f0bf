//! Boundary to the external object-detection worker.
//!
//! The worker is a single-shot process: it receives a model reference, an
//! input image and an output directory, prints its findings on stdout and
//! exits. Everything the rest of the service knows about the model flows
//! through [`InferenceWorker`], so the subprocess can be swapped for a
//! network inference service without touching the ingestion path.
//!
//! Recognized stdout lines:
//!
//! ```text
//! CONFIDENCE:<float>              required, top detection confidence in [0, 1]
//! SAVED:<absolute path>           annotated copy, emitted for confident detections
//! DETECTION:<class>:<float>       optional, one per detected object
//! ```
//!
//! Any other output is treated as diagnostic noise.

use crate::config::InferenceConfig;
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

const CONFIDENCE_PREFIX: &str = "CONFIDENCE:";
const SAVED_PREFIX: &str = "SAVED:";
const DETECTION_PREFIX: &str = "DETECTION:";

/// Bytes of stderr kept for error reporting
const STDERR_TAIL_BYTES: usize = 2048;

/// Errors that can occur while running the worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to start worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker exited with {}: {stderr}", exit_description(.code))]
    Exit { code: Option<i32>, stderr: String },

    #[error("Worker timed out after {0:?}")]
    Timeout(Duration),

    #[error("Worker output contained no CONFIDENCE line")]
    MissingConfidence,

    #[error("Malformed worker output: {0}")]
    MalformedOutput(String),

    #[error("Worker pool closed")]
    Unavailable,
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "signal".to_string(),
    }
}

/// One scoring request
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    /// Image to score
    pub image: PathBuf,
    /// Model weights or model name
    pub model: String,
    /// Directory the worker writes annotated copies into
    pub output_dir: PathBuf,
}

/// Single detected object reported by the worker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub class: String,
    pub confidence: f64,
}

/// Result of scoring one image
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResult {
    /// Confidence of the most confident detection, 0 when nothing was found
    pub confidence: f64,
    /// Annotated copy written by the worker
    pub annotated_path: Option<PathBuf>,
    /// Per-object detections, when the worker reports them
    pub detections: Vec<Detection>,
}

impl InferenceResult {
    /// "class(0.91), class(0.42)" summary for logs
    pub fn detection_summary(&self) -> String {
        self.detections
            .iter()
            .map(|d| format!("{}({:.2})", d.class, d.confidence))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Scores a single stored image
#[async_trait]
pub trait InferenceWorker: Send + Sync {
    async fn infer(&self, request: InferenceRequest) -> Result<InferenceResult, WorkerError>;
}

/// Parse the worker's stdout.
pub fn parse_worker_output(stdout: &str) -> Result<InferenceResult, WorkerError> {
    let mut confidence = None;
    let mut annotated_path = None;
    let mut detections = Vec::new();

    for line in stdout.lines().map(str::trim) {
        if let Some(value) = line.strip_prefix(CONFIDENCE_PREFIX) {
            if confidence.is_none() {
                confidence = Some(parse_confidence(value)?);
            }
        } else if let Some(path) = line.strip_prefix(SAVED_PREFIX) {
            let path = path.trim();
            if path.is_empty() {
                return Err(WorkerError::MalformedOutput("empty SAVED path".to_string()));
            }
            annotated_path = Some(PathBuf::from(path));
        } else if let Some(detection) = line.strip_prefix(DETECTION_PREFIX) {
            let (class, value) = detection.rsplit_once(':').ok_or_else(|| {
                WorkerError::MalformedOutput(format!("detection line '{}'", line))
            })?;
            detections.push(Detection {
                class: class.trim().to_string(),
                confidence: parse_confidence(value)?,
            });
        }
    }

    let confidence = confidence.ok_or(WorkerError::MissingConfidence)?;

    Ok(InferenceResult {
        confidence,
        annotated_path,
        detections,
    })
}

fn parse_confidence(value: &str) -> Result<f64, WorkerError> {
    let confidence: f64 = value
        .trim()
        .parse()
        .map_err(|_| WorkerError::MalformedOutput(format!("confidence '{}'", value.trim())))?;

    if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
        return Err(WorkerError::MalformedOutput(format!(
            "confidence {} outside [0, 1]",
            confidence
        )));
    }

    Ok(confidence)
}

/// Runs the worker as a child process per request
pub struct ProcessWorker {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessWorker {
    pub fn new(config: &InferenceConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn render_args(&self, request: &InferenceRequest) -> Vec<String> {
        let input = request.image.to_string_lossy();
        let output = request.output_dir.to_string_lossy();

        self.args
            .iter()
            .map(|arg| {
                arg.replace("{model}", &request.model)
                    .replace("{input}", &input)
                    .replace("{output}", &output)
            })
            .collect()
    }
}

#[async_trait]
impl InferenceWorker for ProcessWorker {
    #[instrument(skip(self, request), fields(image = %request.image.display()))]
    async fn infer(&self, request: InferenceRequest) -> Result<InferenceResult, WorkerError> {
        let args = self.render_args(&request);
        debug!(program = %self.program, ?args, "Spawning inference worker");

        let started = Instant::now();
        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkerError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                warn!(timeout = ?self.timeout, "Inference worker timed out, killed");
                return Err(WorkerError::Timeout(self.timeout));
            }
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!("triage.worker.duration_ms").record(elapsed_ms);

        if !output.status.success() {
            return Err(WorkerError::Exit {
                code: output.status.code(),
                stderr: stderr_tail(&output.stderr),
            });
        }

        let result = parse_worker_output(&String::from_utf8_lossy(&output.stdout))?;

        info!(
            confidence = result.confidence,
            annotated = ?result.annotated_path,
            detections = %result.detection_summary(),
            elapsed_ms = format!("{:.1}", elapsed_ms),
            "Inference completed"
        );

        Ok(result)
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_TAIL_BYTES {
        return text.to_string();
    }

    let mut start = text.len() - STDERR_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// Caps how many worker invocations run at once.
///
/// Callers beyond capacity wait for a free slot instead of failing.
pub struct BoundedWorker {
    inner: Arc<dyn InferenceWorker>,
    slots: Arc<Semaphore>,
}

impl BoundedWorker {
    pub fn new(inner: Arc<dyn InferenceWorker>, max_concurrent: usize) -> Self {
        Self {
            inner,
            slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Currently free slots
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

#[async_trait]
impl InferenceWorker for BoundedWorker {
    async fn infer(&self, request: InferenceRequest) -> Result<InferenceResult, WorkerError> {
        let _permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| WorkerError::Unavailable)?;

        self.inner.infer(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request() -> InferenceRequest {
        InferenceRequest {
            image: PathBuf::from("/tmp/uploads/capture_1.jpg"),
            model: "yolov8n.pt".to_string(),
            output_dir: PathBuf::from("/tmp/results"),
        }
    }

    #[test]
    fn test_parse_confident_output() {
        let stdout = "Loaded model: best.pt\n\
                      CONFIDENCE:0.73\n\
                      DETECTION:Bottle:0.73\n\
                      DETECTION:Plastic film:0.41\n\
                      SAVED:/srv/results/capture_1.jpg\n";

        let result = parse_worker_output(stdout).unwrap();
        assert_eq!(result.confidence, 0.73);
        assert_eq!(
            result.annotated_path,
            Some(PathBuf::from("/srv/results/capture_1.jpg"))
        );
        assert_eq!(result.detections.len(), 2);
        assert_eq!(result.detections[1].class, "Plastic film");
        assert_eq!(result.detection_summary(), "Bottle(0.73), Plastic film(0.41)");
    }

    #[test]
    fn test_parse_low_confidence_without_saved() {
        let result = parse_worker_output("CONFIDENCE:0.10\n").unwrap();
        assert_eq!(result.confidence, 0.10);
        assert!(result.annotated_path.is_none());
        assert!(result.detections.is_empty());
    }

    #[test]
    fn test_parse_missing_confidence() {
        let err = parse_worker_output("SAVED:/srv/results/x.jpg\n").unwrap_err();
        assert!(matches!(err, WorkerError::MissingConfidence));

        let err = parse_worker_output("").unwrap_err();
        assert!(matches!(err, WorkerError::MissingConfidence));
    }

    #[test]
    fn test_parse_malformed_confidence() {
        for stdout in ["CONFIDENCE:high", "CONFIDENCE:1.7", "CONFIDENCE:-0.1", "CONFIDENCE:NaN"] {
            assert!(
                matches!(
                    parse_worker_output(stdout),
                    Err(WorkerError::MalformedOutput(_))
                ),
                "{}",
                stdout
            );
        }
    }

    #[test]
    fn test_first_confidence_line_wins() {
        let result = parse_worker_output("CONFIDENCE:0.2\nCONFIDENCE:0.9\n").unwrap();
        assert_eq!(result.confidence, 0.2);
    }

    #[test]
    fn test_render_args_substitutes_placeholders() {
        let worker = ProcessWorker::new(&InferenceConfig::default());
        let args = worker.render_args(&request());

        assert_eq!(
            args,
            vec![
                "detect_image.py",
                "--model",
                "yolov8n.pt",
                "--image",
                "/tmp/uploads/capture_1.jpg",
                "--output",
                "/tmp/results",
            ]
        );
    }

    fn shell_worker(script: &str) -> ProcessWorker {
        ProcessWorker::new(&InferenceConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "{input}".to_string()],
            ..InferenceConfig::default()
        })
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_worker_success() {
        let worker = shell_worker("echo 'loading'; echo CONFIDENCE:0.55; echo SAVED:/srv/out.jpg");
        let result = worker.infer(request()).await.unwrap();
        assert_eq!(result.confidence, 0.55);
        assert_eq!(result.annotated_path, Some(PathBuf::from("/srv/out.jpg")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_worker_nonzero_exit() {
        let worker = shell_worker("echo CONFIDENCE:0.9; echo 'model exploded' >&2; exit 3");
        match worker.infer(request()).await {
            Err(WorkerError::Exit { code, stderr }) => {
                assert_eq!(code, Some(3));
                assert!(stderr.contains("model exploded"));
            }
            other => panic!("Expected exit error, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_worker_timeout() {
        let worker = shell_worker("sleep 5").with_timeout(Duration::from_millis(100));
        let started = Instant::now();
        let err = worker.infer(request()).await.unwrap_err();
        assert!(matches!(err, WorkerError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_process_worker_missing_program() {
        let worker = ProcessWorker::new(&InferenceConfig {
            program: "litterwatch-no-such-worker".to_string(),
            ..InferenceConfig::default()
        });
        assert!(matches!(
            worker.infer(request()).await,
            Err(WorkerError::Spawn { .. })
        ));
    }

    struct SlowWorker {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl InferenceWorker for SlowWorker {
        async fn infer(&self, _request: InferenceRequest) -> Result<InferenceResult, WorkerError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(InferenceResult {
                confidence: 0.5,
                annotated_path: None,
                detections: vec![],
            })
        }
    }

    #[tokio::test]
    async fn test_bounded_worker_serializes_and_waits() {
        let inner = Arc::new(SlowWorker {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let bounded = Arc::new(BoundedWorker::new(inner.clone(), 1));

        let calls = (0..5).map(|_| {
            let bounded = bounded.clone();
            async move { bounded.infer(request()).await }
        });
        let results = futures::future::join_all(calls).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(inner.peak.load(Ordering::SeqCst), 1);
        assert_eq!(bounded.available_slots(), 1);
    }
}
