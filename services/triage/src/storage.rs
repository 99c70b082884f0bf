use crate::config::StorageConfig;
use crate::inference::InferenceResult;
use crate::triage::{Disposition, TriageDecision};
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, instrument, warn};

/// Attempts at finding a free name before giving up
const MAX_NAME_ATTEMPTS: usize = 16;

/// Errors raised while persisting an upload
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to prepare directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No free filename after {0} attempts")]
    NamesExhausted(usize),
}

/// An upload persisted in the temporary directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    /// Server-assigned filename, reused for the permanent copy
    pub filename: String,
    /// Location in the temporary directory
    pub temp_path: PathBuf,
    pub size_bytes: usize,
}

/// Final storage state of an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactFate {
    /// Kept; `result_path` is the permanent copy, if one could be secured
    Kept { result_path: Option<PathBuf> },
    /// Every copy removed
    Discarded,
}

/// Owns the temporary and permanent artifact directories
pub struct ArtifactStore {
    temp_dir: PathBuf,
    results_dir: PathBuf,
    sequence: AtomicU64,
}

impl ArtifactStore {
    /// Create both directories and resolve them to absolute paths
    pub async fn open(config: &StorageConfig) -> Result<Self, StorageError> {
        let temp_dir = prepare_dir(&config.temp_dir).await?;
        let results_dir = prepare_dir(&config.results_dir).await?;

        info!(
            temp_dir = %temp_dir.display(),
            results_dir = %results_dir.display(),
            "Artifact store initialized"
        );

        Ok(Self {
            temp_dir,
            results_dir,
            sequence: AtomicU64::new(0),
        })
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Filename format: capture_{YYYYMMDD}_{HHMMSS}_{millis}_{sequence}.{ext}
    ///
    /// The millisecond timestamp keeps names sortable; the process-wide
    /// sequence separates uploads landing in the same millisecond.
    pub fn generate_filename(&self, now: DateTime<Utc>, extension: &str) -> String {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!(
            "capture_{timestamp}_{sequence:06}.{extension}",
            timestamp = now.format("%Y%m%d_%H%M%S_%3f"),
            sequence = sequence,
            extension = extension
        )
    }

    /// Write an upload to the temporary directory under a fresh name.
    ///
    /// Files are created with create-new semantics, so an existing artifact
    /// is never overwritten.
    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    pub async fn persist(
        &self,
        data: &[u8],
        content_type: Option<&str>,
    ) -> Result<StoredArtifact, StorageError> {
        let extension = extension_for(content_type);

        for _ in 0..MAX_NAME_ATTEMPTS {
            let filename = self.generate_filename(Utc::now(), extension);
            let temp_path = self.temp_dir.join(&filename);

            let mut file = match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&temp_path)
                .await
            {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!(filename = %filename, "Filename taken, advancing sequence");
                    continue;
                }
                Err(source) => {
                    return Err(StorageError::Write {
                        path: temp_path,
                        source,
                    })
                }
            };

            let written = async {
                file.write_all(data).await?;
                file.flush().await
            }
            .await;

            if let Err(source) = written {
                drop(file);
                remove_quietly(&temp_path, "partial upload").await;
                return Err(StorageError::Write {
                    path: temp_path,
                    source,
                });
            }

            debug!(filename = %filename, "Upload persisted");

            return Ok(StoredArtifact {
                filename,
                temp_path,
                size_bytes: data.len(),
            });
        }

        Err(StorageError::NamesExhausted(MAX_NAME_ATTEMPTS))
    }

    /// Where the worker is expected to put the annotated copy
    pub fn annotated_path(&self, artifact: &StoredArtifact) -> PathBuf {
        self.results_dir.join(&artifact.filename)
    }

    /// Apply the triage decision to the upload's artifacts.
    ///
    /// Deletion failures are logged and never surface as errors.
    #[instrument(skip(self, decision, result), fields(filename = %artifact.filename))]
    pub async fn settle(
        &self,
        artifact: &StoredArtifact,
        decision: &TriageDecision,
        result: &InferenceResult,
    ) -> ArtifactFate {
        match decision.disposition {
            Disposition::Keep => self.keep(artifact, result).await,
            Disposition::Discard => {
                self.remove_all(artifact, result.annotated_path.as_deref())
                    .await;
                ArtifactFate::Discarded
            }
        }
    }

    /// Clean up after a failed inference.
    ///
    /// The upload and any partially written annotated copy are removed.
    pub async fn discard_failed(&self, artifact: &StoredArtifact) {
        self.remove_all(artifact, None).await;
    }

    async fn keep(&self, artifact: &StoredArtifact, result: &InferenceResult) -> ArtifactFate {
        let expected = self.annotated_path(artifact);
        let mut annotated = None;
        if let Some(path) = &result.annotated_path {
            if self.within_results(path).await {
                annotated = Some(path.clone());
            } else {
                warn!(
                    path = %path.display(),
                    "Reported annotated copy is missing or outside the results directory"
                );
            }
        }
        if annotated.is_none() && path_exists(&expected).await {
            annotated = Some(expected.clone());
        }

        if let Some(result_path) = annotated {
            remove_quietly(&artifact.temp_path, "temporary upload").await;
            return ArtifactFate::Kept {
                result_path: Some(result_path),
            };
        }

        // No annotated copy: promote the raw upload so the detection is not lost.
        match promote(&artifact.temp_path, &expected).await {
            Ok(()) => {
                info!(result_path = %expected.display(), "Promoted raw upload to results");
                ArtifactFate::Kept {
                    result_path: Some(expected),
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to promote upload to results");
                metrics::counter!("triage.storage.promote_failures").increment(1);
                remove_quietly(&artifact.temp_path, "temporary upload").await;
                ArtifactFate::Kept { result_path: None }
            }
        }
    }

    async fn remove_all(&self, artifact: &StoredArtifact, reported: Option<&Path>) {
        remove_quietly(&artifact.temp_path, "temporary upload").await;

        let expected = self.annotated_path(artifact);
        if let Some(path) = reported.filter(|p| *p != expected.as_path()) {
            if self.within_results(path).await {
                remove_quietly(path, "annotated copy").await;
            } else {
                warn!(
                    path = %path.display(),
                    "Reported annotated copy is outside the results directory, leaving it"
                );
            }
        }
        remove_quietly(&expected, "annotated copy").await;
    }

    /// Whether `path` resolves to an existing file inside the results directory.
    ///
    /// `..` segments and symlinks are resolved before the comparison.
    async fn within_results(&self, path: &Path) -> bool {
        match fs::canonicalize(path).await {
            Ok(resolved) => resolved != self.results_dir && resolved.starts_with(&self.results_dir),
            Err(_) => false,
        }
    }
}

async fn prepare_dir(path: &Path) -> Result<PathBuf, StorageError> {
    fs::create_dir_all(path)
        .await
        .map_err(|source| StorageError::Directory {
            path: path.to_path_buf(),
            source,
        })?;

    fs::canonicalize(path)
        .await
        .map_err(|source| StorageError::Directory {
            path: path.to_path_buf(),
            source,
        })
}

async fn path_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

async fn promote(from: &Path, to: &Path) -> std::io::Result<()> {
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(_) => {
            // Cross-device move
            fs::copy(from, to).await?;
            fs::remove_file(from).await
        }
    }
}

/// Delete a file, logging instead of failing. A missing file is not an error.
async fn remove_quietly(path: &Path, what: &str) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Deleted {}", what),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to delete {}", what);
            metrics::counter!("triage.storage.delete_failures").increment(1);
        }
    }
}

/// File extension for an upload content type
fn extension_for(content_type: Option<&str>) -> &'static str {
    match content_type.map(|c| c.to_lowercase()).as_deref() {
        Some("image/png") => "png",
        Some("image/webp") => "webp",
        Some("image/bmp") => "bmp",
        _ => "jpg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triage::decide;
    use chrono::TimeZone;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn open_store(root: &TempDir) -> ArtifactStore {
        ArtifactStore::open(&StorageConfig {
            temp_dir: root.path().join("uploads"),
            results_dir: root.path().join("results"),
        })
        .await
        .unwrap()
    }

    fn result(confidence: f64, annotated_path: Option<PathBuf>) -> InferenceResult {
        InferenceResult {
            confidence,
            annotated_path,
            detections: vec![],
        }
    }

    #[tokio::test]
    async fn test_open_creates_directories() {
        let root = TempDir::new().unwrap();
        let store = open_store(&root).await;

        assert!(store.temp_dir().is_dir());
        assert!(store.results_dir().is_dir());
        assert!(store.temp_dir().is_absolute());
    }

    #[tokio::test]
    async fn test_generate_filename_format() {
        let root = TempDir::new().unwrap();
        let store = open_store(&root).await;
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap();

        assert_eq!(
            store.generate_filename(now, "jpg"),
            "capture_20240115_103045_000_000000.jpg"
        );
        assert_eq!(
            store.generate_filename(now, "jpg"),
            "capture_20240115_103045_000_000001.jpg"
        );
    }

    #[tokio::test]
    async fn test_persist_writes_bytes() {
        let root = TempDir::new().unwrap();
        let store = open_store(&root).await;

        let artifact = store.persist(b"jpeg-bytes", Some("image/jpeg")).await.unwrap();
        assert!(artifact.filename.ends_with(".jpg"));
        assert_eq!(std::fs::read(&artifact.temp_path).unwrap(), b"jpeg-bytes");
        assert_eq!(artifact.size_bytes, 10);
    }

    #[tokio::test]
    async fn test_concurrent_persist_unique_names() {
        let root = TempDir::new().unwrap();
        let store = Arc::new(open_store(&root).await);

        let writes = (0..10u8).map(|i| {
            let store = store.clone();
            async move { store.persist(&[i; 64], None).await.unwrap() }
        });
        let artifacts = futures::future::join_all(writes).await;

        let names: HashSet<_> = artifacts.iter().map(|a| a.filename.clone()).collect();
        assert_eq!(names.len(), 10);

        for artifact in &artifacts {
            let data = std::fs::read(&artifact.temp_path).unwrap();
            assert!(data.iter().all(|b| *b == data[0]));
        }
        assert_eq!(std::fs::read_dir(store.temp_dir()).unwrap().count(), 10);
    }

    #[tokio::test]
    async fn test_keep_removes_temp_and_retains_annotated() {
        let root = TempDir::new().unwrap();
        let store = open_store(&root).await;
        let artifact = store.persist(b"raw", None).await.unwrap();

        let annotated = store.annotated_path(&artifact);
        std::fs::write(&annotated, b"annotated").unwrap();

        let fate = store
            .settle(&artifact, &decide(0.73, 0.4), &result(0.73, Some(annotated.clone())))
            .await;

        assert_eq!(
            fate,
            ArtifactFate::Kept {
                result_path: Some(annotated.clone())
            }
        );
        assert!(!artifact.temp_path.exists());
        assert_eq!(std::fs::read(&annotated).unwrap(), b"annotated");
    }

    #[tokio::test]
    async fn test_keep_without_annotated_copy_promotes_upload() {
        let root = TempDir::new().unwrap();
        let store = open_store(&root).await;
        let artifact = store.persist(b"raw", None).await.unwrap();

        let fate = store
            .settle(&artifact, &decide(0.35, 0.3), &result(0.35, None))
            .await;

        let expected = store.annotated_path(&artifact);
        assert_eq!(
            fate,
            ArtifactFate::Kept {
                result_path: Some(expected.clone())
            }
        );
        assert!(!artifact.temp_path.exists());
        assert_eq!(std::fs::read(&expected).unwrap(), b"raw");
    }

    #[tokio::test]
    async fn test_discard_removes_everything() {
        let root = TempDir::new().unwrap();
        let store = open_store(&root).await;
        let artifact = store.persist(b"raw", None).await.unwrap();

        // Worker wrote a copy even though it was not asked to
        let annotated = store.annotated_path(&artifact);
        std::fs::write(&annotated, b"annotated").unwrap();

        let fate = store
            .settle(&artifact, &decide(0.10, 0.4), &result(0.10, None))
            .await;

        assert_eq!(fate, ArtifactFate::Discarded);
        assert!(!artifact.temp_path.exists());
        assert!(!annotated.exists());
    }

    #[tokio::test]
    async fn test_discard_removes_reported_copy_inside_results() {
        let root = TempDir::new().unwrap();
        let store = open_store(&root).await;
        let artifact = store.persist(b"raw", None).await.unwrap();

        let reported = store.results_dir().join("detected_capture.jpg");
        std::fs::write(&reported, b"annotated").unwrap();

        store
            .settle(&artifact, &decide(0.2, 0.4), &result(0.2, Some(reported.clone())))
            .await;

        assert!(!reported.exists());
    }

    #[tokio::test]
    async fn test_discard_leaves_files_outside_results() {
        let root = TempDir::new().unwrap();
        let store = open_store(&root).await;
        let artifact = store.persist(b"raw", None).await.unwrap();

        let outside = root.path().join("elsewhere.jpg");
        std::fs::write(&outside, b"keep me").unwrap();

        store
            .settle(&artifact, &decide(0.2, 0.4), &result(0.2, Some(outside.clone())))
            .await;

        assert!(outside.exists());
        assert!(!artifact.temp_path.exists());
    }

    #[tokio::test]
    async fn test_discard_ignores_parent_dir_escape() {
        let root = TempDir::new().unwrap();
        let store = open_store(&root).await;
        let artifact = store.persist(b"raw", None).await.unwrap();
        let other = store.persist(b"in flight", None).await.unwrap();

        // Lexically under results/, resolves to another upload's temp file
        let escape = store
            .results_dir()
            .join("..")
            .join("uploads")
            .join(&other.filename);

        store
            .settle(&artifact, &decide(0.2, 0.4), &result(0.2, Some(escape)))
            .await;

        assert!(!artifact.temp_path.exists());
        assert_eq!(std::fs::read(&other.temp_path).unwrap(), b"in flight");
    }

    #[tokio::test]
    async fn test_keep_ignores_reported_path_outside_results() {
        let root = TempDir::new().unwrap();
        let store = open_store(&root).await;
        let artifact = store.persist(b"raw", None).await.unwrap();
        let other = store.persist(b"in flight", None).await.unwrap();

        let escape = store.results_dir().join("..").join("uploads").join(&other.filename);

        let fate = store
            .settle(&artifact, &decide(0.9, 0.4), &result(0.9, Some(escape)))
            .await;

        let expected = store.annotated_path(&artifact);
        assert_eq!(
            fate,
            ArtifactFate::Kept {
                result_path: Some(expected.clone())
            }
        );
        assert_eq!(std::fs::read(&expected).unwrap(), b"raw");
        assert!(other.temp_path.exists());
    }

    #[tokio::test]
    async fn test_discard_failed_cleans_partial_output() {
        let root = TempDir::new().unwrap();
        let store = open_store(&root).await;
        let artifact = store.persist(b"raw", None).await.unwrap();
        let partial = store.annotated_path(&artifact);
        std::fs::write(&partial, b"half").unwrap();

        store.discard_failed(&artifact).await;

        assert!(!artifact.temp_path.exists());
        assert!(!partial.exists());
    }

    #[test]
    fn test_extension_for_content_type() {
        assert_eq!(extension_for(Some("image/jpeg")), "jpg");
        assert_eq!(extension_for(Some("IMAGE/PNG")), "png");
        assert_eq!(extension_for(Some("application/octet-stream")), "jpg");
        assert_eq!(extension_for(None), "jpg");
    }
}
