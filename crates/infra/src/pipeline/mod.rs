//! Ingestion pipeline.
//!
//! ## Flow per job attempt
//!
//! 1. Record `started` in the ledger
//! 2. If an earlier attempt's commit already landed, finish from its receipt
//! 3. Pull from the job's watermark (under `timeouts.pull`)
//! 4. Normalize record by record; failures are quarantined, not fatal
//! 5. Commit entities plus quarantine as one batch keyed by job id (under
//!    `timeouts.commit`)
//! 6. Record `succeeded` with the pulled watermark
//!
//! Failures before the commit leave the store untouched and the job retries
//! from the same watermark until the retry policy is exhausted. Cancellation is
//! checked between records, before the commit and during backoff sleeps.

pub mod timeout;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use signalhub_connectors::{ConnectorError, ConnectorRegistry};
use signalhub_core::{CancellationToken, JobId, SourceId, Watermark};
use signalhub_normalizer::Normalizer;

use crate::alerts::{AlertKind, AlertSink, OperatorAlert};
use crate::config::AppConfig;
use crate::ledger::{IngestionJob, JobEvent, JobEventKind, JobLedger, JobStats, JobStatus, LedgerError, RetryPolicy};
use crate::store::{BatchReceipt, CommitBatch, EntityStore, QuarantinedRecord, SharedStore, StoreError};

pub use timeout::{TimeoutError, run_with_timeout};

const RECENT_FAILURES: usize = 5;
const STATUS_JOB_SCAN: usize = 50;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown source '{0}'")]
    UnknownSource(SourceId),

    #[error("no mapping registered for source '{0}'")]
    UnmappedSource(SourceId),

    #[error("source {source_id} is blocked by failed job {job_id}")]
    SourceBlocked { source_id: SourceId, job_id: JobId },

    #[error("source {0} is not blocked")]
    NotBlocked(SourceId),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("{stage} {source}")]
    Timeout {
        stage: &'static str,
        #[source]
        source: TimeoutError,
    },

    #[error("job {0} was interrupted while running")]
    Interrupted(JobId),

    #[error("cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Connector(e) => e.is_retryable(),
            PipelineError::Store(e) => e.is_retryable(),
            PipelineError::Ledger(e) => matches!(e, LedgerError::Storage(_)),
            PipelineError::Timeout { .. } | PipelineError::Interrupted(_) => true,
            PipelineError::UnknownSource(_)
            | PipelineError::UnmappedSource(_)
            | PipelineError::SourceBlocked { .. }
            | PipelineError::NotBlocked(_)
            | PipelineError::Cancelled => false,
        }
    }

    fn alert_kind(&self) -> AlertKind {
        match self {
            PipelineError::Connector(ConnectorError::SourceSchemaDrift(_)) => AlertKind::SchemaDrift,
            _ => AlertKind::JobExhausted,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub retry: RetryPolicy,
    pub pull_timeout: Duration,
    pub commit_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            pull_timeout: Duration::from_secs(30),
            commit_timeout: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            retry: config.retry.clone(),
            pull_timeout: config.timeouts.pull,
            commit_timeout: config.timeouts.commit,
        }
    }
}

/// Per-source view for operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStatus {
    pub source_id: SourceId,
    /// Where the next job starts.
    pub last_watermark: Watermark,
    pub open_job: Option<IngestionJob>,
    pub blocked: bool,
    pub blocking_job: Option<JobId>,
    pub quarantined: usize,
    pub recent_failures: Vec<JobFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobFailure {
    pub job_id: JobId,
    pub status: JobStatus,
    pub attempts: u32,
    pub error: String,
    pub terminal: bool,
    pub at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperatorReport {
    pub generated_at: DateTime<Utc>,
    pub sources: Vec<SourceStatus>,
    pub alerts: Vec<OperatorAlert>,
}

enum Completion {
    Committed { receipt: BatchReceipt, pulled: usize },
    Discarded(String),
}

pub struct IngestionPipeline {
    connectors: ConnectorRegistry,
    normalizer: Normalizer,
    store: SharedStore,
    ledger: Arc<dyn JobLedger>,
    alerts: Arc<dyn AlertSink>,
    config: PipelineConfig,
    cancel: CancellationToken,
}

impl IngestionPipeline {
    pub fn new(
        connectors: ConnectorRegistry,
        normalizer: Normalizer,
        store: SharedStore,
        ledger: Arc<dyn JobLedger>,
        alerts: Arc<dyn AlertSink>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            connectors,
            normalizer,
            store,
            ledger,
            alerts,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Share a cancellation token with other lanes.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn sources(&self) -> Vec<SourceId> {
        self.connectors.sources()
    }

    pub fn ledger(&self) -> &Arc<dyn JobLedger> {
        &self.ledger
    }

    /// Open the source's next job, or hand back the job that is already open.
    pub fn begin_job(&self, source_id: &SourceId) -> Result<IngestionJob, PipelineError> {
        if !self.connectors.contains(source_id) {
            return Err(PipelineError::UnknownSource(source_id.clone()));
        }

        if let Some(open) = self.ledger.open_job(source_id)? {
            return match open.status {
                JobStatus::Running => Err(LedgerError::SourceBusy {
                    source_id: source_id.clone(),
                    open: open.job_id,
                }
                .into()),
                // Crashed between `failed` and `retrying`.
                JobStatus::Failed => Ok(self.ledger.append(JobEvent::new(
                    open.job_id,
                    source_id.clone(),
                    JobEventKind::Retrying {
                        attempt: open.attempt_count + 1,
                        next_attempt_at: Utc::now(),
                    },
                ))?),
                _ => Ok(open),
            };
        }

        if let Some(blocking) = self.ledger.blocking_job(source_id)? {
            return Err(PipelineError::SourceBlocked {
                source_id: source_id.clone(),
                job_id: blocking.job_id,
            });
        }

        let start = self.ledger.next_watermark(source_id)?;
        self.create_job(source_id, start, false)
    }

    fn create_job(&self, source_id: &SourceId, start: Watermark, reprocess: bool) -> Result<IngestionJob, PipelineError> {
        let job_id = JobId::new();
        let job = self.ledger.append(JobEvent::new(
            job_id,
            source_id.clone(),
            JobEventKind::Created {
                watermark_start: start,
                reprocess,
            },
        ))?;
        info!(source_id = %source_id, job_id = %job_id, watermark = %start, reprocess, "ingestion job created");
        Ok(job)
    }

    /// Run one attempt of an open job and record its outcome.
    ///
    /// Job failures are recorded in the ledger and returned as the job's new
    /// state; only ledger errors surface as `Err`.
    pub fn attempt(&self, job_id: JobId) -> Result<IngestionJob, PipelineError> {
        let job = self.ledger.job(job_id)?.ok_or(LedgerError::UnknownJob(job_id))?;
        let attempt = job.attempt_count + 1;
        let job = self.ledger.append(JobEvent::new(
            job_id,
            job.source_id.clone(),
            JobEventKind::Started { attempt },
        ))?;
        info!(source_id = %job.source_id, job_id = %job_id, attempt, "ingestion attempt started");

        match self.execute(&job) {
            Ok(Completion::Committed { receipt, pulled }) => {
                let stats = JobStats {
                    pulled,
                    applied: receipt.applied,
                    deduplicated: receipt.deduplicated,
                    quarantined: receipt.quarantined,
                };
                let done = self.ledger.append(JobEvent::new(
                    job_id,
                    job.source_id.clone(),
                    JobEventKind::Succeeded {
                        watermark_end: receipt.watermark_end,
                        stats,
                    },
                ))?;
                info!(
                    source_id = %job.source_id,
                    job_id = %job_id,
                    attempt,
                    snapshot = %receipt.snapshot_id,
                    applied = stats.applied,
                    deduplicated = stats.deduplicated,
                    quarantined = stats.quarantined,
                    "ingestion job succeeded"
                );
                if stats.quarantined > 0 {
                    self.alerts.raise(
                        OperatorAlert::new(
                            AlertKind::RecordsQuarantined,
                            job.source_id.as_str(),
                            format!("{} record(s) quarantined", stats.quarantined),
                        )
                        .for_job(job_id),
                    );
                }
                Ok(done)
            }
            Ok(Completion::Discarded(reason)) => {
                info!(source_id = %job.source_id, job_id = %job_id, reason = %reason, "ingestion job discarded");
                Ok(self.ledger.append(JobEvent::new(
                    job_id,
                    job.source_id.clone(),
                    JobEventKind::Discarded { reason },
                ))?)
            }
            Err(err) => self.record_failure(&job, err),
        }
    }

    fn execute(&self, job: &IngestionJob) -> Result<Completion, PipelineError> {
        if let Some(receipt) = self.store.committed_batch(job.job_id)? {
            info!(job_id = %job.job_id, "batch already committed by an earlier attempt");
            let pulled = receipt.applied + receipt.deduplicated + receipt.quarantined;
            return Ok(Completion::Committed { receipt, pulled });
        }

        let source_id = job.source_id.clone();
        if self.normalizer.mapping(&source_id).is_none() {
            return Err(PipelineError::UnmappedSource(source_id));
        }
        let connector = self
            .connectors
            .get(&source_id)
            .ok_or_else(|| ConnectorError::Unregistered(source_id.clone()))?;

        let since = job.watermark_start;
        let pull_source = source_id.clone();
        let batch = run_with_timeout(self.config.pull_timeout, move || connector.pull(&pull_source, since))
            .map_err(|source| PipelineError::Timeout { stage: "pull", source })??;

        if batch.new_watermark <= since {
            return Ok(Completion::Discarded(format!("no new data after watermark {since}")));
        }

        let processed_at = Utc::now();
        let pulled = batch.records.len();
        let mut entities = Vec::with_capacity(pulled);
        let mut quarantined = Vec::new();
        for record in batch.records {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            match self.normalizer.normalize(&record, processed_at) {
                Ok(entity) => entities.push(entity),
                Err(err) => {
                    warn!(
                        source_id = %source_id,
                        job_id = %job.job_id,
                        record_ref = %record.record_ref,
                        error = %err,
                        "record quarantined"
                    );
                    quarantined.push(QuarantinedRecord {
                        field: err.field().map(str::to_string),
                        error: err.to_string(),
                        record,
                        job_id: job.job_id,
                        quarantined_at: processed_at,
                    });
                }
            }
        }

        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let commit = CommitBatch {
            job_id: job.job_id,
            source_id,
            watermark_start: since,
            watermark_end: batch.new_watermark,
            entities,
            quarantined,
        };
        let store = self.store.clone();
        let committed = run_with_timeout(self.config.commit_timeout, move || store.commit_batch(commit))
            .map_err(|source| PipelineError::Timeout { stage: "commit", source })?;

        let receipt = match committed {
            Ok(receipt) => receipt,
            // Lost the race against an earlier attempt whose commit landed late.
            Err(StoreError::DuplicateJob(job_id)) => self
                .store
                .committed_batch(job_id)?
                .ok_or_else(|| StoreError::NotFound(format!("receipt of job {job_id}")))?,
            Err(err) => return Err(err.into()),
        };
        Ok(Completion::Committed { receipt, pulled })
    }

    fn record_failure(&self, job: &IngestionJob, err: PipelineError) -> Result<IngestionJob, PipelineError> {
        let cancelled = matches!(err, PipelineError::Cancelled);
        let retryable = !cancelled && err.is_retryable();
        let will_retry = retryable && self.config.retry.should_retry(job.attempt_count);

        let failed = self.ledger.append(JobEvent::new(
            job.job_id,
            job.source_id.clone(),
            JobEventKind::Failed {
                error: err.to_string(),
                retryable,
                terminal: !will_retry,
                cancelled,
            },
        ))?;

        if will_retry {
            let delay = self.config.retry.delay_for_attempt(job.attempt_count);
            let next_attempt_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            warn!(
                source_id = %job.source_id,
                job_id = %job.job_id,
                attempt = job.attempt_count,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "ingestion attempt failed, retrying"
            );
            return Ok(self.ledger.append(JobEvent::new(
                job.job_id,
                job.source_id.clone(),
                JobEventKind::Retrying {
                    attempt: job.attempt_count + 1,
                    next_attempt_at,
                },
            ))?);
        }

        if cancelled {
            info!(source_id = %job.source_id, job_id = %job.job_id, "ingestion job cancelled");
            return Ok(failed);
        }

        error!(
            source_id = %job.source_id,
            job_id = %job.job_id,
            attempt = job.attempt_count,
            error = %err,
            "ingestion job failed terminally; source blocked"
        );
        self.alerts.raise(
            OperatorAlert::new(
                err.alert_kind(),
                job.source_id.as_str(),
                format!("job failed after {} attempt(s): {err}", job.attempt_count),
            )
            .for_job(job.job_id),
        );
        Ok(failed)
    }

    /// Attempt a job until it succeeds, is discarded or fails terminally.
    pub fn run_job(&self, job_id: JobId) -> Result<IngestionJob, PipelineError> {
        let mut job = self.attempt(job_id)?;
        while job.status == JobStatus::Retrying {
            if !self.sleep_until(job.next_attempt_at) {
                job = self.ledger.append(JobEvent::new(
                    job_id,
                    job.source_id.clone(),
                    JobEventKind::Failed {
                        error: PipelineError::Cancelled.to_string(),
                        retryable: false,
                        terminal: true,
                        cancelled: true,
                    },
                ))?;
                info!(source_id = %job.source_id, job_id = %job_id, "ingestion job cancelled during backoff");
                break;
            }
            job = self.attempt(job_id)?;
        }
        Ok(job)
    }

    /// Returns false if cancelled while waiting.
    fn sleep_until(&self, at: Option<DateTime<Utc>>) -> bool {
        let Some(at) = at else {
            return !self.cancel.is_cancelled();
        };
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let Ok(left) = (at - Utc::now()).to_std() else {
                return true;
            };
            if left.is_zero() {
                return true;
            }
            thread::sleep(left.min(Duration::from_millis(50)));
        }
    }

    /// Ingest the source's next window.
    pub fn ingest(&self, source_id: &SourceId) -> Result<IngestionJob, PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let job = self.begin_job(source_id)?;
        self.run_job(job.job_id)
    }

    /// Re-ingest from `from` as an explicit reprocessing job.
    ///
    /// Reprocessing jobs do not move the source's watermark chain.
    pub fn reprocess(&self, source_id: &SourceId, from: Watermark) -> Result<IngestionJob, PipelineError> {
        if !self.connectors.contains(source_id) {
            return Err(PipelineError::UnknownSource(source_id.clone()));
        }
        let job = self.create_job(source_id, from, true)?;
        self.run_job(job.job_id)
    }

    /// Unblock a source after a terminal failure.
    pub fn resume_source(&self, source_id: &SourceId) -> Result<IngestionJob, PipelineError> {
        let blocking = self
            .ledger
            .blocking_job(source_id)?
            .ok_or_else(|| PipelineError::NotBlocked(source_id.clone()))?;
        let job = self.ledger.append(JobEvent::new(
            blocking.job_id,
            source_id.clone(),
            JobEventKind::Resumed,
        ))?;
        info!(source_id = %source_id, job_id = %job.job_id, "source resumed by operator");
        Ok(job)
    }

    /// Reconcile jobs left `running` by a crash.
    ///
    /// A job whose batch landed is completed from its receipt; anything else
    /// is failed and retried under the normal policy.
    pub fn recover(&self) -> Result<Vec<IngestionJob>, PipelineError> {
        let mut recovered = Vec::new();
        for job in self.ledger.running_jobs()? {
            let next = match self.store.committed_batch(job.job_id)? {
                Some(receipt) => {
                    info!(source_id = %job.source_id, job_id = %job.job_id, "recovered committed job");
                    self.ledger.append(JobEvent::new(
                        job.job_id,
                        job.source_id.clone(),
                        JobEventKind::Succeeded {
                            watermark_end: receipt.watermark_end,
                            stats: JobStats {
                                pulled: receipt.applied + receipt.deduplicated + receipt.quarantined,
                                applied: receipt.applied,
                                deduplicated: receipt.deduplicated,
                                quarantined: receipt.quarantined,
                            },
                        },
                    ))?
                }
                None => self.record_failure(&job, PipelineError::Interrupted(job.job_id))?,
            };
            recovered.push(next);
        }
        Ok(recovered)
    }

    pub fn source_status(&self, source_id: &SourceId) -> Result<SourceStatus, PipelineError> {
        let blocking = self.ledger.blocking_job(source_id)?;
        let recent_failures = self
            .ledger
            .jobs_for(source_id, STATUS_JOB_SCAN)?
            .into_iter()
            .filter_map(|job| {
                let error = job.last_error.clone()?;
                Some(JobFailure {
                    job_id: job.job_id,
                    status: job.status,
                    attempts: job.attempt_count,
                    error,
                    terminal: job.terminal,
                    at: job.finished_at.or(job.started_at),
                })
            })
            .take(RECENT_FAILURES)
            .collect();

        Ok(SourceStatus {
            source_id: source_id.clone(),
            last_watermark: self.ledger.next_watermark(source_id)?,
            open_job: self.ledger.open_job(source_id)?,
            blocked: blocking.is_some(),
            blocking_job: blocking.map(|j| j.job_id),
            quarantined: self.store.quarantine_count(source_id)?,
            recent_failures,
        })
    }

    pub fn operator_report(&self) -> Result<OperatorReport, PipelineError> {
        let mut sources = self.connectors.sources();
        for source_id in self.ledger.sources()? {
            if !sources.contains(&source_id) {
                sources.push(source_id);
            }
        }
        sources.sort();

        let sources = sources
            .iter()
            .map(|s| self.source_status(s))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(OperatorReport {
            generated_at: Utc::now(),
            sources,
            alerts: self.alerts.recent(20),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use signalhub_connectors::{Connector, InMemoryConnector};
    use signalhub_core::EntityType;
    use signalhub_normalizer::{FieldSpec, FieldType, SourceMapping};

    use crate::alerts::InMemoryAlertSink;
    use crate::ledger::InMemoryJobLedger;
    use crate::store::{EntityStore, InMemoryStore};

    struct Fixture {
        pipeline: IngestionPipeline,
        feed: Arc<InMemoryConnector>,
        store: Arc<InMemoryStore>,
        alerts: Arc<InMemoryAlertSink>,
        source: SourceId,
    }

    fn fixture(retry: RetryPolicy) -> Fixture {
        let source = SourceId::new("crm").unwrap();
        let feed = Arc::new(InMemoryConnector::new());
        let store = InMemoryStore::arc();
        let alerts = Arc::new(InMemoryAlertSink::new());
        let mapping = SourceMapping::new(EntityType::Customer, ["id"])
            .field(FieldSpec::new("tenure", FieldType::Int).required());
        let pipeline = IngestionPipeline::new(
            ConnectorRegistry::new().with(source.clone(), feed.clone()),
            Normalizer::new().with(source.clone(), mapping),
            store.clone(),
            InMemoryJobLedger::arc(),
            alerts.clone(),
            PipelineConfig {
                retry,
                ..PipelineConfig::default()
            },
        );
        Fixture {
            pipeline,
            feed,
            store,
            alerts,
            source,
        }
    }

    #[test]
    fn empty_pull_discards_job() {
        let f = fixture(RetryPolicy::default());
        let job = f.pipeline.ingest(&f.source).unwrap();
        assert_eq!(job.status, JobStatus::Discarded);
        assert_eq!(f.pipeline.ledger().next_watermark(&f.source).unwrap(), Watermark::ZERO);
    }

    #[test]
    fn schema_drift_blocks_source_until_resumed() {
        let f = fixture(RetryPolicy::default());
        f.feed.push(Watermark::from_offset(1), json!({"id": "c1", "tenure": 3}));
        f.feed
            .fail_next(ConnectorError::SourceSchemaDrift("unexpected column".to_string()));

        let job = f.pipeline.ingest(&f.source).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.terminal);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(f.alerts.count(AlertKind::SchemaDrift), 1);

        let blocked = f.pipeline.ingest(&f.source).unwrap_err();
        assert!(matches!(blocked, PipelineError::SourceBlocked { .. }));
        assert!(f.pipeline.source_status(&f.source).unwrap().blocked);

        f.pipeline.resume_source(&f.source).unwrap();
        let job = f.pipeline.ingest(&f.source).unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.watermark_end, Some(Watermark::from_offset(1)));
    }

    #[test]
    fn retries_exhaust_into_terminal_failure() {
        let f = fixture(RetryPolicy::fixed(2, Duration::from_millis(1)));
        f.feed.push(Watermark::from_offset(1), json!({"id": "c1", "tenure": 3}));
        for _ in 0..2 {
            f.feed.fail_next(ConnectorError::SourceUnavailable("down".to_string()));
        }

        let job = f.pipeline.ingest(&f.source).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.terminal);
        assert_eq!(job.attempt_count, 2);
        assert_eq!(f.alerts.count(AlertKind::JobExhausted), 1);
        assert!(!f.pipeline.source_status(&f.source).unwrap().recent_failures.is_empty());
    }

    #[test]
    fn cancelled_job_fails_without_advancing() {
        let f = fixture(RetryPolicy::default());
        f.feed.push(Watermark::from_offset(1), json!({"id": "c1", "tenure": 3}));
        let job = f.pipeline.begin_job(&f.source).unwrap();
        f.pipeline.cancel();

        let job = f.pipeline.attempt(job.job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.cancelled);
        assert!(!job.blocks_source());
        assert_eq!(f.store.latest_snapshot_id().unwrap().seq(), 0);
        assert_eq!(f.pipeline.ledger().next_watermark(&f.source).unwrap(), Watermark::ZERO);
    }

    #[test]
    fn recover_completes_committed_running_job() {
        let f = fixture(RetryPolicy::default());
        f.feed.push(Watermark::from_offset(1), json!({"id": "c1", "tenure": 3}));
        let job = f.pipeline.begin_job(&f.source).unwrap();

        // Simulate a crash after the commit but before `succeeded` was recorded.
        f.pipeline
            .ledger()
            .append(JobEvent::new(job.job_id, f.source.clone(), JobEventKind::Started { attempt: 1 }))
            .unwrap();
        let entity = f
            .pipeline
            .normalizer
            .normalize(
                &f.feed.pull(&f.source, Watermark::ZERO).unwrap().records[0],
                Utc::now(),
            )
            .unwrap();
        f.store
            .commit_batch(CommitBatch {
                job_id: job.job_id,
                source_id: f.source.clone(),
                watermark_start: Watermark::ZERO,
                watermark_end: Watermark::from_offset(1),
                entities: vec![entity],
                quarantined: Vec::new(),
            })
            .unwrap();

        let recovered = f.pipeline.recover().unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].status, JobStatus::Succeeded);
        assert_eq!(f.pipeline.ledger().next_watermark(&f.source).unwrap(), Watermark::from_offset(1));
    }

    #[test]
    fn recover_retries_uncommitted_running_job() {
        let f = fixture(RetryPolicy::default());
        let job = f.pipeline.begin_job(&f.source).unwrap();
        f.pipeline
            .ledger()
            .append(JobEvent::new(job.job_id, f.source.clone(), JobEventKind::Started { attempt: 1 }))
            .unwrap();

        let recovered = f.pipeline.recover().unwrap();
        assert_eq!(recovered[0].status, JobStatus::Retrying);
    }

    #[test]
    fn unknown_source_is_rejected() {
        let f = fixture(RetryPolicy::default());
        let other = SourceId::new("billing").unwrap();
        assert!(matches!(f.pipeline.ingest(&other), Err(PipelineError::UnknownSource(_))));
    }
}
