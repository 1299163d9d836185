use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A half-open interval of wall-clock time, `[start, end)`.
///
/// Used to describe the active interval of a simulation run and to scope range queries against
/// the monitoring backend to exactly that interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeWindow {
    /// Create a window from explicit bounds. The end is clamped to be no earlier than the start
    /// so that a window is never negative.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    pub fn from_start_duration(start: DateTime<Utc>, duration: Duration) -> Self {
        let end = start
            + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        Self::new(start, end)
    }

    /// A window covering the last `duration` up to now.
    pub fn ending_now(duration: Duration) -> Self {
        let end = Utc::now();
        let start = end
            - chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        Self::new(start, end)
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn duration(&self) -> Duration {
        (self.end - self.start).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }

    /// Bounds as unix timestamps in seconds, the form range queries want.
    pub fn unix_bounds(&self) -> (i64, i64) {
        (self.start.timestamp(), self.end.timestamp())
    }
}
