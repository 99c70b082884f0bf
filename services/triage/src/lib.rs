//! Litterwatch Triage Service
//!
//! Upload and detection server for the litterwatch camera fleet. Devices post
//! still images over multipart HTTP; each image is stored under a unique
//! name, run through an external object-detection worker, and triaged by
//! confidence. Confirmed detections are kept and raise a cleanup task in the
//! downstream request API; everything else is deleted.
//!
//! ## Architecture
//!
//! ```text
//! ESP32 camera            Triage service                      Task API
//! ┌──────────┐  POST     ┌──────────────┐                    ┌──────────┐
//! │ capture  │──/upload─▶│ API          │                    │ requests │
//! └──────────┘           └──────────────┘                    └──────────┘
//!                               │                                  ▲
//!                               ▼                                  │
//!                        ┌──────────────┐   ┌──────────────┐       │
//!                        │ Artifact     │──▶│ Inference    │       │
//!                        │ Store        │   │ Worker       │       │
//!                        └──────────────┘   └──────────────┘       │
//!                               ▲                  │               │
//!                               │                  ▼               │
//!                               │           ┌──────────────┐       │
//!                               └───────────│ Triage       │───────┘
//!                                keep/delete│ Policy       │ kept only
//!                                           └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod inference;
pub mod notifier;
pub mod pipeline;
pub mod storage;
pub mod triage;

pub use api::{AppState, UploadResponse};
pub use config::Config;
pub use error::ApiError;
pub use inference::{BoundedWorker, Detection, InferenceResult, InferenceWorker, ProcessWorker};
pub use notifier::{HttpTaskNotifier, TaskNotifier};
pub use pipeline::{DetectionPipeline, ProcessingOutcome};
pub use storage::ArtifactStore;
pub use triage::{Disposition, TriageDecision, TriagePolicy};
