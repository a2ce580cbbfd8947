//! Half-open time windows

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A `[start, end)` interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Create a window, requiring `start < end`
    ///
    /// # Errors
    ///
    /// Returns `Validation` when the window is empty or inverted
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(Error::Validation(format!(
                "window start {start} must be before end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Whether two windows share any instant
    ///
    /// Touching windows (`a.end == b.start`) do not overlap.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Whether the window contains `at`
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    /// Length in milliseconds
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.end - self.start).num_milliseconds()
    }

    /// Milliseconds of `[start, end)` falling inside this window
    #[must_use]
    pub fn clipped_ms(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
        let lo = start.max(self.start);
        let hi = end.min(self.end);
        if lo < hi {
            (hi - lo).num_milliseconds()
        } else {
            0
        }
    }
}
