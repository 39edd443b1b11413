//! Ingestion job types, transitions and retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use signalhub_core::{JobId, SourceId, Watermark};

/// Derived status of an ingestion job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Retrying,
    Discarded,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
            JobStatus::Discarded => "discarded",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-job counters.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub pulled: usize,
    pub applied: usize,
    pub deduplicated: usize,
    pub quarantined: usize,
}

/// One transition in a job's append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEventKind {
    Created {
        watermark_start: Watermark,
        reprocess: bool,
    },
    Started {
        attempt: u32,
    },
    Succeeded {
        watermark_end: Watermark,
        stats: JobStats,
    },
    Failed {
        error: String,
        retryable: bool,
        /// No further attempts will be made.
        terminal: bool,
        cancelled: bool,
    },
    Retrying {
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
    },
    Discarded {
        reason: String,
    },
    /// Operator unblocked the source after a terminal failure.
    Resumed,
}

impl JobEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobEventKind::Created { .. } => "created",
            JobEventKind::Started { .. } => "started",
            JobEventKind::Succeeded { .. } => "succeeded",
            JobEventKind::Failed { .. } => "failed",
            JobEventKind::Retrying { .. } => "retrying",
            JobEventKind::Discarded { .. } => "discarded",
            JobEventKind::Resumed => "resumed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub source_id: SourceId,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: JobEventKind,
}

impl JobEvent {
    pub fn new(job_id: JobId, source_id: SourceId, kind: JobEventKind) -> Self {
        Self {
            job_id,
            source_id,
            at: Utc::now(),
            kind,
        }
    }
}

/// Ledger error.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("job not found: {0}")]
    UnknownJob(JobId),

    #[error("job already exists: {0}")]
    DuplicateJob(JobId),

    #[error("job {job_id}: cannot apply '{event}' while {from}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        event: &'static str,
    },

    #[error("source {source_id} already has open job {open}")]
    SourceBusy { source_id: SourceId, open: JobId },

    #[error("source {source_id} is blocked by failed job {job_id}")]
    SourceBlocked { source_id: SourceId, job_id: JobId },

    #[error("source {source_id}: job must start at watermark {expected}, got {got}")]
    WatermarkGap {
        source_id: SourceId,
        expected: Watermark,
        got: Watermark,
    },

    #[error("job {job_id}: watermark_end {end} does not advance past {start}")]
    NonAdvancingWatermark {
        job_id: JobId,
        start: Watermark,
        end: Watermark,
    },

    #[error("job {job_id} belongs to source {expected}, event names {got}")]
    SourceMismatch {
        job_id: JobId,
        expected: SourceId,
        got: SourceId,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

/// Current state of an ingestion job, folded from its event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionJob {
    pub job_id: JobId,
    pub source_id: SourceId,
    pub status: JobStatus,
    pub watermark_start: Watermark,
    /// Set once the job succeeds.
    pub watermark_end: Option<Watermark>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub retryable: bool,
    pub terminal: bool,
    pub cancelled: bool,
    pub resumed: bool,
    pub reprocess: bool,
    pub discard_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub stats: JobStats,
}

impl IngestionJob {
    /// Fold a complete event log (first event must be `created`).
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a JobEvent>) -> Result<Option<Self>, LedgerError> {
        let mut job: Option<IngestionJob> = None;
        for event in events {
            match job.as_mut() {
                None => job = Some(Self::created(event)?),
                Some(j) => j.apply(event)?,
            }
        }
        Ok(job)
    }

    /// Initial state from a `created` event.
    pub fn created(event: &JobEvent) -> Result<Self, LedgerError> {
        let JobEventKind::Created {
            watermark_start,
            reprocess,
        } = event.kind
        else {
            return Err(LedgerError::UnknownJob(event.job_id));
        };
        Ok(Self {
            job_id: event.job_id,
            source_id: event.source_id.clone(),
            status: JobStatus::Pending,
            watermark_start,
            watermark_end: None,
            attempt_count: 0,
            last_error: None,
            retryable: false,
            terminal: false,
            cancelled: false,
            resumed: false,
            reprocess,
            discard_reason: None,
            created_at: event.at,
            started_at: None,
            finished_at: None,
            next_attempt_at: None,
            stats: JobStats::default(),
        })
    }

    /// Apply one transition, rejecting anything the state machine forbids.
    pub fn apply(&mut self, event: &JobEvent) -> Result<(), LedgerError> {
        if event.job_id != self.job_id {
            return Err(LedgerError::UnknownJob(event.job_id));
        }
        if event.source_id != self.source_id {
            return Err(LedgerError::SourceMismatch {
                job_id: self.job_id,
                expected: self.source_id.clone(),
                got: event.source_id.clone(),
            });
        }

        match (self.status, &event.kind) {
            (JobStatus::Pending | JobStatus::Retrying, JobEventKind::Started { attempt })
                if *attempt == self.attempt_count + 1 =>
            {
                self.status = JobStatus::Running;
                self.attempt_count = *attempt;
                self.started_at = Some(event.at);
                self.next_attempt_at = None;
            }
            (JobStatus::Running, JobEventKind::Succeeded { watermark_end, stats }) => {
                if *watermark_end <= self.watermark_start {
                    return Err(LedgerError::NonAdvancingWatermark {
                        job_id: self.job_id,
                        start: self.watermark_start,
                        end: *watermark_end,
                    });
                }
                self.status = JobStatus::Succeeded;
                self.watermark_end = Some(*watermark_end);
                self.stats = *stats;
                self.last_error = None;
                self.finished_at = Some(event.at);
            }
            (JobStatus::Running, JobEventKind::Discarded { reason }) => {
                self.status = JobStatus::Discarded;
                self.discard_reason = Some(reason.clone());
                self.finished_at = Some(event.at);
            }
            (
                JobStatus::Pending | JobStatus::Running | JobStatus::Retrying,
                JobEventKind::Failed {
                    error,
                    retryable,
                    terminal,
                    cancelled,
                },
            ) => {
                self.status = JobStatus::Failed;
                self.last_error = Some(error.clone());
                self.retryable = *retryable;
                self.terminal = *terminal;
                self.cancelled = *cancelled;
                self.next_attempt_at = None;
                self.finished_at = Some(event.at);
            }
            (JobStatus::Failed, JobEventKind::Retrying { attempt, next_attempt_at })
                if !self.terminal && *attempt == self.attempt_count + 1 =>
            {
                self.status = JobStatus::Retrying;
                self.next_attempt_at = Some(*next_attempt_at);
                self.finished_at = None;
            }
            (JobStatus::Failed, JobEventKind::Resumed) if self.blocks_source() => {
                self.resumed = true;
            }
            (from, kind) => {
                return Err(LedgerError::InvalidTransition {
                    job_id: self.job_id,
                    from,
                    event: kind.name(),
                });
            }
        }
        Ok(())
    }

    /// Still owns the source's next window.
    pub fn is_open(&self) -> bool {
        match self.status {
            JobStatus::Pending | JobStatus::Running | JobStatus::Retrying => true,
            JobStatus::Failed => !self.terminal,
            JobStatus::Succeeded | JobStatus::Discarded => false,
        }
    }

    /// Terminal failure waiting for an operator. Cancelled jobs never block.
    pub fn blocks_source(&self) -> bool {
        self.status == JobStatus::Failed && self.terminal && !self.cancelled && !self.resumed
    }

    /// Counts toward the source's watermark chain.
    pub fn in_chain(&self) -> bool {
        self.status == JobStatus::Succeeded && !self.reprocess
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy for ingestion jobs.
///
/// `max_attempts` counts every attempt, the first one included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "crate::config::duration")]
    pub backoff_base: Duration,
    #[serde(with = "crate::config::duration")]
    pub backoff_max: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff_base: delay,
            backoff_max: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff_base: base,
            backoff_max: max,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.backoff_base.as_millis() as f64;
        let max_ms = self.backoff_max.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic jitter keyed on the attempt number.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether another attempt may follow `attempts` completed ones.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
