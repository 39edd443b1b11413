use std::sync::Arc;

use thiserror::Error;

use signalhub_core::{SourceId, SourceRecord, Watermark};

/// Result of one connector pull.
#[derive(Debug, Clone, PartialEq)]
pub struct PullBatch {
    pub records: Vec<SourceRecord>,
    /// Cursor to resume from; equals the `since` watermark when nothing new arrived.
    pub new_watermark: Watermark,
}

impl PullBatch {
    pub fn empty(since: Watermark) -> Self {
        Self {
            records: Vec::new(),
            new_watermark: since,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectorError {
    /// Transient network/auth/IO failure; the pull may be retried.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// Payload shape is not recognized; needs an operator.
    #[error("source schema drift: {0}")]
    SourceSchemaDrift(String),

    #[error("no connector registered for source '{0}'")]
    Unregistered(SourceId),
}

impl ConnectorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectorError::SourceUnavailable(_))
    }
}

/// Pulls raw records from one kind of upstream source.
///
/// Contract:
/// - resumable: the same `since` returns a superset-safe result (downstream
///   deduplicates by idempotent keys)
/// - side-effect free: connectors never write to the store
pub trait Connector: Send + Sync {
    fn pull(&self, source_id: &SourceId, since: Watermark) -> Result<PullBatch, ConnectorError>;

    /// Short label for logs and operator status.
    fn describe(&self) -> String {
        "connector".to_string()
    }
}

impl<C> Connector for Arc<C>
where
    C: Connector + ?Sized,
{
    fn pull(&self, source_id: &SourceId, since: Watermark) -> Result<PullBatch, ConnectorError> {
        (**self).pull(source_id, since)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
