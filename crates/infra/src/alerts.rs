use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use signalhub_core::{JobId, ModelId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// A job failed terminally and its source is blocked.
    JobExhausted,
    /// A connector reported an unrecognized payload shape.
    SchemaDrift,
    RecordsQuarantined,
    /// A candidate model was rejected by the promotion gate.
    MetricRegression,
    TrainingFailed,
}

/// Something an operator has to look at.
///
/// Alerts are insights for humans, separate from the job ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorAlert {
    pub kind: AlertKind,
    /// Source id or model type the alert is about.
    pub subject: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<ModelId>,
    pub raised_at: DateTime<Utc>,
}

impl OperatorAlert {
    pub fn new(kind: AlertKind, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.into(),
            message: message.into(),
            job_id: None,
            model_id: None,
            raised_at: Utc::now(),
        }
    }

    pub fn for_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn for_model(mut self, model_id: ModelId) -> Self {
        self.model_id = Some(model_id);
        self
    }
}

pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: OperatorAlert);

    /// Most recent alerts first.
    fn recent(&self, limit: usize) -> Vec<OperatorAlert>;
}

impl<T> AlertSink for std::sync::Arc<T>
where
    T: AlertSink + ?Sized,
{
    fn raise(&self, alert: OperatorAlert) {
        (**self).raise(alert)
    }

    fn recent(&self, limit: usize) -> Vec<OperatorAlert> {
        (**self).recent(limit)
    }
}

fn log_alert(alert: &OperatorAlert) {
    error!(
        kind = ?alert.kind,
        subject = %alert.subject,
        job_id = ?alert.job_id,
        model_id = ?alert.model_id,
        "operator alert: {}",
        alert.message
    );
}

/// Bounded in-process buffer; the oldest alerts fall off.
#[derive(Debug)]
pub struct InMemoryAlertSink {
    capacity: usize,
    inner: Mutex<VecDeque<OperatorAlert>>,
}

impl InMemoryAlertSink {
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub fn all(&self) -> Vec<OperatorAlert> {
        self.recent(usize::MAX)
    }

    pub fn count(&self, kind: AlertKind) -> usize {
        match self.inner.lock() {
            Ok(g) => g.iter().filter(|a| a.kind == kind).count(),
            Err(_) => 0,
        }
    }
}

impl Default for InMemoryAlertSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertSink for InMemoryAlertSink {
    fn raise(&self, alert: OperatorAlert) {
        log_alert(&alert);
        // A poisoned buffer still gets the log line above.
        if let Ok(mut g) = self.inner.lock() {
            if g.len() == self.capacity {
                g.pop_front();
            }
            g.push_back(alert);
        }
    }

    fn recent(&self, limit: usize) -> Vec<OperatorAlert> {
        match self.inner.lock() {
            Ok(g) => g.iter().rev().take(limit).cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// Logs alerts and keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn raise(&self, alert: OperatorAlert) {
        log_alert(&alert);
    }

    fn recent(&self, _limit: usize) -> Vec<OperatorAlert> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_newest_within_capacity() {
        let sink = InMemoryAlertSink::with_capacity(2);
        sink.raise(OperatorAlert::new(AlertKind::SchemaDrift, "a", "first"));
        sink.raise(OperatorAlert::new(AlertKind::JobExhausted, "b", "second"));
        sink.raise(OperatorAlert::new(AlertKind::JobExhausted, "c", "third"));

        let recent = sink.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "third");
        assert_eq!(recent[1].message, "second");
        assert_eq!(sink.count(AlertKind::SchemaDrift), 0);
        assert_eq!(sink.count(AlertKind::JobExhausted), 2);
    }

    #[test]
    fn serializes_kind_snake_case() {
        let alert = OperatorAlert::new(AlertKind::MetricRegression, "churn", "rejected");
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["kind"], "metric_regression");
        assert!(json.get("job_id").is_none());
    }
}
