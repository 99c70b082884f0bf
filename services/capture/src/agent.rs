//! The capture loop: one capture and at most one upload per period.

use crate::scheduler::IntervalTicker;
use crate::source::FrameSource;
use crate::uploader::{HttpUploader, UploadError};
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Counters for the lifetime of the agent.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CaptureStats {
    pub cycles: u64,
    pub capture_failures: u64,
    pub offline_skips: u64,
    pub uploads_ok: u64,
    pub uploads_failed: u64,
}

/// What a single cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    CaptureSkipped,
    Offline,
    Uploaded(StatusCode),
    UploadFailed,
}

pub struct CaptureAgent {
    source: Box<dyn FrameSource>,
    uploader: HttpUploader,
    ticker: IntervalTicker,
    stats: CaptureStats,
}

impl CaptureAgent {
    pub fn new(source: Box<dyn FrameSource>, uploader: HttpUploader, ticker: IntervalTicker) -> Self {
        Self {
            source,
            uploader,
            ticker,
            stats: CaptureStats::default(),
        }
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    /// Run cycles until cancelled. A cycle in progress completes first.
    pub async fn run(&mut self, cancel: CancellationToken) -> CaptureStats {
        info!(period = ?self.ticker.period(), "Capture loop started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.ticker.tick() => {}
            }

            self.run_cycle().await;
        }

        info!("Capture loop stopped");
        self.stats.clone()
    }

    /// Capture one frame and upload it. Failures are logged and counted,
    /// never returned.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        self.stats.cycles += 1;

        let frame = match self.source.capture().await {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Capture failed, skipping cycle");
                self.stats.capture_failures += 1;
                return CycleOutcome::CaptureSkipped;
            }
        };

        match self.uploader.upload(frame).await {
            Ok(status) => {
                self.stats.uploads_ok += 1;
                CycleOutcome::Uploaded(status)
            }
            Err(UploadError::NotConnected) => {
                warn!("Upload server unreachable, frame dropped");
                self.stats.offline_skips += 1;
                CycleOutcome::Offline
            }
            Err(e) => {
                error!(error = %e, "Upload failed, frame dropped");
                self.stats.uploads_failed += 1;
                CycleOutcome::UploadFailed
            }
        }
    }
}
