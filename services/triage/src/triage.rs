use crate::config::TriageConfig;
use crate::inference::InferenceResult;
use serde::Serialize;
use tracing::debug;

/// Outcome of triaging one inference result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Disposition {
    /// Keep the annotated detection and create a task
    Keep,
    /// Delete every artifact of the upload
    Discard,
}

impl Disposition {
    pub fn is_keep(self) -> bool {
        matches!(self, Disposition::Keep)
    }
}

/// Decision on what to do with an uploaded image
#[derive(Debug, Clone, PartialEq)]
pub struct TriageDecision {
    pub disposition: Disposition,
    pub confidence: f64,
    pub threshold: f64,
    /// Human-readable threshold comparison
    pub reason: String,
}

/// Keep when `confidence` strictly exceeds `threshold`, discard otherwise.
///
/// A confidence exactly at the threshold is discarded, as is NaN.
pub fn decide(confidence: f64, threshold: f64) -> TriageDecision {
    let disposition = if confidence > threshold {
        Disposition::Keep
    } else {
        Disposition::Discard
    };

    let reason = match disposition {
        Disposition::Keep => format!("confidence {:.2} > threshold {:.2}", confidence, threshold),
        Disposition::Discard => {
            format!("confidence {:.2} <= threshold {:.2}", confidence, threshold)
        }
    };

    TriageDecision {
        disposition,
        confidence,
        threshold,
        reason,
    }
}

/// Threshold policy applied to every inference result
#[derive(Debug, Clone)]
pub struct TriagePolicy {
    threshold: f64,
}

impl TriagePolicy {
    pub fn new(config: &TriageConfig) -> Self {
        Self {
            threshold: config.threshold,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Determine the disposition of an inference result
    pub fn evaluate(&self, result: &InferenceResult) -> TriageDecision {
        let decision = decide(result.confidence, self.threshold);
        debug!(
            disposition = ?decision.disposition,
            reason = %decision.reason,
            "Triage decision"
        );
        decision
    }
}

impl Default for TriagePolicy {
    fn default() -> Self {
        Self::new(&TriageConfig::default())
    }
}
