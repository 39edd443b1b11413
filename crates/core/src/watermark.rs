//! Source cursors.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A cursor marking how far a source has been ingested.
///
/// Watermarks are opaque, totally ordered positions. Offset-based sources
/// (files, sequences) use the row/record offset directly; time-based sources
/// use milliseconds since the Unix epoch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(i64);

impl Watermark {
    /// Beginning of every source.
    pub const ZERO: Watermark = Watermark(0);

    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn from_offset(offset: u64) -> Self {
        Self(i64::try_from(offset).unwrap_or(i64::MAX))
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at.timestamp_millis())
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    /// Interpret the watermark as a record offset (negative values clamp to 0).
    pub fn as_offset(&self) -> u64 {
        u64::try_from(self.0).unwrap_or(0)
    }

    /// Interpret the watermark as an epoch-millisecond timestamp.
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.0).single()
    }
}

impl core::fmt::Display for Watermark {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datetime_round_trip_keeps_millis() {
        let at = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap();
        let wm = Watermark::from_datetime(at);
        assert_eq!(wm.as_datetime(), Some(at));
    }

    #[test]
    fn offsets_are_ordered() {
        assert!(Watermark::from_offset(10) > Watermark::from_offset(9));
        assert_eq!(Watermark::new(-5).as_offset(), 0);
    }
}
