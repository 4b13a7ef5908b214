//! Timestamp and wall-clock window helpers.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// UTC timestamp used throughout the engine.
pub type Timestamp = DateTime<Utc>;

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Converts a std duration into a chrono duration, saturating on overflow.
#[must_use]
pub fn to_chrono(duration: std::time::Duration) -> Duration {
    Duration::from_std(duration).unwrap_or(Duration::MAX)
}

/// Adds `delta` to `ts`, clamping to the latest representable instant.
#[must_use]
pub fn saturating_add(ts: Timestamp, delta: Duration) -> Timestamp {
    ts.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Subtracts `delta` from `ts`, clamping to the earliest representable instant.
#[must_use]
pub fn saturating_sub(ts: Timestamp, delta: Duration) -> Timestamp {
    ts.checked_sub_signed(delta).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// A half-open `[start, end)` interval aligned to wall-clock boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Inclusive lower bound.
    pub start: Timestamp,
    /// Exclusive upper bound.
    pub end: Timestamp,
}

impl TimeWindow {
    /// Returns the fixed-size window of `minutes` that contains `ts`.
    ///
    /// Windows are aligned to the Unix epoch, so every caller computes the same
    /// boundaries for the same instant. Returns `None` for a zero-length window.
    #[must_use]
    pub fn containing(ts: Timestamp, minutes: u32) -> Option<Self> {
        if minutes == 0 {
            return None;
        }
        let size = i64::from(minutes) * 60;
        let start_secs = ts.timestamp().div_euclid(size) * size;
        let start = Utc.timestamp_opt(start_secs, 0).single()?;
        Some(Self {
            start,
            end: start + Duration::seconds(size),
        })
    }

    /// Returns true if `ts` falls inside the window.
    #[must_use]
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Returns true once the window can no longer receive events.
    #[must_use]
    pub fn is_closed(&self, now: Timestamp) -> bool {
        now >= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32, s: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_window_alignment() {
        let window = TimeWindow::containing(at(10, 7, 42), 15).unwrap();
        assert_eq!(window.start, at(10, 0, 0));
        assert_eq!(window.end, at(10, 15, 0));

        let window = TimeWindow::containing(at(10, 44, 59), 30).unwrap();
        assert_eq!(window.start, at(10, 30, 0));
        assert_eq!(window.end, at(11, 0, 0));
    }

    #[test]
    fn test_window_boundary_belongs_to_next() {
        let window = TimeWindow::containing(at(10, 15, 0), 15).unwrap();
        assert_eq!(window.start, at(10, 15, 0));
        assert!(!TimeWindow::containing(at(10, 14, 59), 15)
            .unwrap()
            .contains(at(10, 15, 0)));
    }

    #[test]
    fn test_zero_window_is_instant() {
        assert!(TimeWindow::containing(at(10, 0, 0), 0).is_none());
    }

    #[test]
    fn test_saturating_arithmetic_clamps() {
        assert_eq!(saturating_add(at(10, 0, 0), Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(saturating_sub(at(10, 0, 0), Duration::MAX), DateTime::<Utc>::MIN_UTC);
        assert_eq!(saturating_add(at(10, 0, 0), Duration::minutes(5)), at(10, 5, 0));
    }

    #[test]
    fn test_window_closed() {
        let window = TimeWindow::containing(at(10, 7, 0), 15).unwrap();
        assert!(!window.is_closed(at(10, 14, 59)));
        assert!(window.is_closed(at(10, 15, 0)));
    }
}
