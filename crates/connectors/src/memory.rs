use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value as JsonValue;

use signalhub_core::{BatchId, SourceId, SourceRecord, Watermark};

use crate::connector::{Connector, ConnectorError, PullBatch};

#[derive(Debug, Clone)]
struct FeedEntry {
    position: Watermark,
    record_ref: String,
    payload: JsonValue,
}

/// In-memory scripted feed.
///
/// Intended for tests/dev and for embedding callers that already hold their
/// data. Supports injected failures and latency to exercise retry/timeout paths.
#[derive(Debug)]
pub struct InMemoryConnector {
    feed: RwLock<Vec<FeedEntry>>,
    failures: Mutex<VecDeque<ConnectorError>>,
    latency: Mutex<Option<Duration>>,
    page_size: usize,
    pulls: AtomicUsize,
}

impl Default for InMemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::with_page_size(usize::MAX)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            feed: RwLock::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            latency: Mutex::new(None),
            page_size: page_size.max(1),
            pulls: AtomicUsize::new(0),
        }
    }

    /// Feed built from payloads at positions `1..=n`.
    pub fn from_payloads(payloads: impl IntoIterator<Item = JsonValue>) -> Self {
        let connector = Self::new();
        for (i, payload) in payloads.into_iter().enumerate() {
            connector.push(Watermark::from_offset(i as u64 + 1), payload);
        }
        connector
    }

    /// Append a payload at `position`. An existing entry at the same position is replaced.
    pub fn push(&self, position: Watermark, payload: JsonValue) {
        let record_ref = payload
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("pos:{position}"));
        self.push_with_ref(position, record_ref, payload);
    }

    pub fn push_with_ref(&self, position: Watermark, record_ref: impl Into<String>, payload: JsonValue) {
        if let Ok(mut feed) = self.feed.write() {
            feed.retain(|e| e.position != position);
            feed.push(FeedEntry {
                position,
                record_ref: record_ref.into(),
                payload,
            });
            feed.sort_by_key(|e| e.position);
        }
    }

    /// Make the next pull fail with `error` (queued; one error per pull).
    pub fn fail_next(&self, error: ConnectorError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push_back(error);
        }
    }

    /// Delay every pull by `latency` (None disables).
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut l) = self.latency.lock() {
            *l = latency;
        }
    }

    /// Number of pull calls served (including failed ones).
    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.feed.read().map(|f| f.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Connector for InMemoryConnector {
    fn pull(&self, source_id: &SourceId, since: Watermark) -> Result<PullBatch, ConnectorError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);

        let latency = self.latency.lock().ok().and_then(|l| *l);
        if let Some(latency) = latency {
            thread::sleep(latency);
        }

        let queued = self
            .failures
            .lock()
            .map_err(|_| ConnectorError::SourceUnavailable("failure queue poisoned".to_string()))?
            .pop_front();
        if let Some(error) = queued {
            return Err(error);
        }

        let feed = self
            .feed
            .read()
            .map_err(|_| ConnectorError::SourceUnavailable("feed lock poisoned".to_string()))?;

        let page: Vec<&FeedEntry> = feed
            .iter()
            .filter(|e| e.position > since)
            .take(self.page_size)
            .collect();

        let Some(last) = page.last() else {
            return Ok(PullBatch::empty(since));
        };

        let new_watermark = last.position;
        let batch_id = BatchId::for_window(source_id, since, new_watermark);
        let extracted_at = Utc::now();

        let records = page
            .into_iter()
            .map(|e| SourceRecord {
                source_id: source_id.clone(),
                batch_id,
                record_ref: e.record_ref.clone(),
                position: e.position,
                extracted_at,
                raw_payload: e.payload.clone(),
            })
            .collect();

        Ok(PullBatch {
            records,
            new_watermark,
        })
    }

    fn describe(&self) -> String {
        format!("in-memory feed ({} records)", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source() -> SourceId {
        SourceId::new("market").unwrap()
    }

    #[test]
    fn pulls_only_records_after_watermark() {
        let c = InMemoryConnector::from_payloads([json!({"v": 1}), json!({"v": 2}), json!({"v": 3})]);

        let batch = c.pull(&source(), Watermark::new(1)).unwrap();
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.new_watermark, Watermark::new(3));
        assert_eq!(batch.records[0].position, Watermark::new(2));
    }

    #[test]
    fn same_window_yields_same_batch_id() {
        let c = InMemoryConnector::from_payloads([json!({"v": 1}), json!({"v": 2})]);
        let a = c.pull(&source(), Watermark::ZERO).unwrap();
        let b = c.pull(&source(), Watermark::ZERO).unwrap();
        assert_eq!(a.records[0].batch_id, b.records[0].batch_id);
        assert_eq!(a.new_watermark, b.new_watermark);
    }

    #[test]
    fn page_size_bounds_each_pull() {
        let c = InMemoryConnector::with_page_size(2);
        for i in 1..=5 {
            c.push(Watermark::new(i), json!({"v": i}));
        }

        let first = c.pull(&source(), Watermark::ZERO).unwrap();
        assert_eq!(first.new_watermark, Watermark::new(2));
        let second = c.pull(&source(), first.new_watermark).unwrap();
        assert_eq!(second.new_watermark, Watermark::new(4));
    }

    #[test]
    fn empty_pull_keeps_watermark() {
        let c = InMemoryConnector::new();
        let batch = c.pull(&source(), Watermark::new(7)).unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.new_watermark, Watermark::new(7));
    }

    #[test]
    fn injected_failures_are_consumed_in_order() {
        let c = InMemoryConnector::from_payloads([json!({"v": 1})]);
        c.fail_next(ConnectorError::SourceUnavailable("timeout".into()));

        assert!(matches!(
            c.pull(&source(), Watermark::ZERO),
            Err(ConnectorError::SourceUnavailable(_))
        ));
        assert!(c.pull(&source(), Watermark::ZERO).is_ok());
        assert_eq!(c.pull_count(), 2);
    }
}
