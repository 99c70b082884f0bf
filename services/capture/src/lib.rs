//! Litterwatch Capture Agent
//!
//! Runs on the camera device. Every capture period it grabs the latest still
//! from the camera and posts it to the triage server as a single multipart
//! upload. Failed captures and failed uploads are logged and dropped; the
//! loop never retries and never queues.
//!
//! # Architecture
//!
//! ```text
//! IntervalTicker -> FrameSource -> Connectivity probe -> HttpUploader -> Triage server
//! ```

pub mod agent;
pub mod config;
pub mod connectivity;
pub mod scheduler;
pub mod source;
pub mod uploader;

pub use agent::{CaptureAgent, CaptureStats, CycleOutcome};
pub use config::CaptureConfig;
pub use connectivity::{Connectivity, ServerProbe};
pub use scheduler::IntervalTicker;
pub use source::{CaptureError, Frame, FrameSource};
pub use uploader::{HttpUploader, UploadError};
