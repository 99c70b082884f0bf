//! Fixed-period capture scheduling.
//!
//! The ticker compares elapsed time against the period at a fine poll
//! resolution instead of sleeping a whole period, so a slow cycle shifts the
//! next firing by at most one poll step. When the loop falls a full period
//! behind it re-anchors to the current instant rather than bursting.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct IntervalTicker {
    period: Duration,
    resolution: Duration,
    last_fire: Option<Instant>,
}

impl IntervalTicker {
    pub fn new(period: Duration, resolution: Duration) -> Self {
        Self {
            period,
            resolution: resolution.min(period),
            last_fire: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Whether a cycle is due at `now`; records the firing when it is.
    ///
    /// The first call always fires.
    pub fn poll_due(&mut self, now: Instant) -> bool {
        let Some(last) = self.last_fire else {
            self.last_fire = Some(now);
            return true;
        };

        if now.saturating_duration_since(last) < self.period {
            return false;
        }

        let next = last + self.period;
        self.last_fire = if now.saturating_duration_since(next) >= self.period {
            Some(now)
        } else {
            Some(next)
        };
        true
    }

    /// Time left until the next firing.
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.last_fire {
            Some(last) => self
                .period
                .saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }

    /// Wait until the next cycle is due.
    pub async fn tick(&mut self) {
        loop {
            let now = Instant::now();
            if self.poll_due(now) {
                return;
            }
            let wait = self.remaining(now).min(self.resolution);
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}
