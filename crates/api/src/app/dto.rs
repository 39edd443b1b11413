use chrono::{DateTime, Utc};
use serde::Deserialize;

use signalhub_core::TimeRange;

pub const DEFAULT_LIMIT: usize = 50;
pub const MAX_LIMIT: usize = 1_000;

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl HistoryQuery {
    pub fn range(&self) -> TimeRange {
        TimeRange {
            from: self.from,
            to: self.to,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ChurnQuery {
    pub threshold: Option<f64>,
    pub top: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

impl LimitQuery {
    pub fn limit(&self) -> usize {
        clamp_limit(self.limit)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct QuarantineQuery {
    pub source: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ReprocessRequest {
    pub from_watermark: i64,
}

pub fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}
