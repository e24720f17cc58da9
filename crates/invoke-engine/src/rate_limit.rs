//! Sliding 1-second admission window.
//!
//! A strict count within the trailing second, not a token bucket: at most
//! `limit` admissions are allowed in any trailing 1000ms window. When the
//! limit is `None` the window never throttles.

use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_millis(1000);

/// Outcome of probing the window for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admitted now; the timestamp has been recorded.
    Admitted,
    /// Not admitted; retry after this many milliseconds.
    WaitMillis(u64),
}

/// Sliding-window rate limiter over executions-per-second.
pub struct RateWindow {
    limit: Option<u32>,
    timestamps: Vec<Instant>,
}

impl RateWindow {
    pub fn new(limit: Option<u32>) -> Self {
        Self {
            limit,
            timestamps: Vec::new(),
        }
    }

    pub fn set_limit(&mut self, limit: Option<u32>) {
        self.limit = limit;
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    /// Prune stale timestamps, then admit if under the limit.
    pub fn probe(&mut self, now: Instant) -> Admission {
        let cutoff = now.checked_sub(WINDOW).unwrap_or(now);
        self.timestamps.retain(|&ts| ts > cutoff);

        match self.limit {
            None => {
                self.timestamps.push(now);
                Admission::Admitted
            }
            Some(limit) if (self.timestamps.len() as u32) < limit => {
                self.timestamps.push(now);
                Admission::Admitted
            }
            Some(_) => {
                // Oldest surviving timestamp determines when a slot frees up.
                let oldest = self.timestamps[0];
                let elapsed = now.duration_since(oldest);
                let wait = WINDOW.saturating_sub(elapsed) + Duration::from_millis(1);
                Admission::WaitMillis(wait.as_millis() as u64)
            }
        }
    }

    pub fn recent_count(&self, now: Instant) -> usize {
        let cutoff = now.checked_sub(WINDOW).unwrap_or(now);
        self.timestamps.iter().filter(|&&ts| ts > cutoff).count()
    }
}
