//! Job ledger storage implementations.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use signalhub_core::{JobId, SourceId, Watermark};

use super::types::{IngestionJob, JobEvent, JobEventKind, LedgerError};

/// Job ledger abstraction: an append-only log of job transitions.
pub trait JobLedger: Send + Sync {
    /// Validate and append one event; returns the job's new state.
    fn append(&self, event: JobEvent) -> Result<IngestionJob, LedgerError>;

    fn job(&self, job_id: JobId) -> Result<Option<IngestionJob>, LedgerError>;

    /// Full event log of a job, oldest first.
    fn events(&self, job_id: JobId) -> Result<Vec<JobEvent>, LedgerError>;

    /// Jobs of a source, newest first.
    fn jobs_for(&self, source_id: &SourceId, limit: usize) -> Result<Vec<IngestionJob>, LedgerError>;

    fn open_job(&self, source_id: &SourceId) -> Result<Option<IngestionJob>, LedgerError>;

    /// Latest succeeded non-reprocess job (the head of the watermark chain).
    fn last_succeeded(&self, source_id: &SourceId) -> Result<Option<IngestionJob>, LedgerError>;

    fn blocking_job(&self, source_id: &SourceId) -> Result<Option<IngestionJob>, LedgerError>;

    fn running_jobs(&self) -> Result<Vec<IngestionJob>, LedgerError>;

    fn sources(&self) -> Result<Vec<SourceId>, LedgerError>;

    fn is_blocked(&self, source_id: &SourceId) -> Result<bool, LedgerError> {
        Ok(self.blocking_job(source_id)?.is_some())
    }

    /// Where the next non-reprocess job of a source must start.
    fn next_watermark(&self, source_id: &SourceId) -> Result<Watermark, LedgerError> {
        Ok(self
            .last_succeeded(source_id)?
            .and_then(|j| j.watermark_end)
            .unwrap_or(Watermark::ZERO))
    }
}

impl<L> JobLedger for Arc<L>
where
    L: JobLedger + ?Sized,
{
    fn append(&self, event: JobEvent) -> Result<IngestionJob, LedgerError> {
        (**self).append(event)
    }

    fn job(&self, job_id: JobId) -> Result<Option<IngestionJob>, LedgerError> {
        (**self).job(job_id)
    }

    fn events(&self, job_id: JobId) -> Result<Vec<JobEvent>, LedgerError> {
        (**self).events(job_id)
    }

    fn jobs_for(&self, source_id: &SourceId, limit: usize) -> Result<Vec<IngestionJob>, LedgerError> {
        (**self).jobs_for(source_id, limit)
    }

    fn open_job(&self, source_id: &SourceId) -> Result<Option<IngestionJob>, LedgerError> {
        (**self).open_job(source_id)
    }

    fn last_succeeded(&self, source_id: &SourceId) -> Result<Option<IngestionJob>, LedgerError> {
        (**self).last_succeeded(source_id)
    }

    fn blocking_job(&self, source_id: &SourceId) -> Result<Option<IngestionJob>, LedgerError> {
        (**self).blocking_job(source_id)
    }

    fn running_jobs(&self) -> Result<Vec<IngestionJob>, LedgerError> {
        (**self).running_jobs()
    }

    fn sources(&self) -> Result<Vec<SourceId>, LedgerError> {
        (**self).sources()
    }
}

/// Folded ledger state for a set of sources.
///
/// Shared by every backend so admission rules are identical: the Postgres
/// ledger rebuilds it from the rows of one source inside a locked transaction.
#[derive(Debug, Default, Clone)]
pub struct LedgerState {
    events: HashMap<JobId, Vec<JobEvent>>,
    jobs: HashMap<JobId, IngestionJob>,
    /// Job ids per source in creation order.
    by_source: HashMap<SourceId, Vec<JobId>>,
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a log in append order, re-validating every event.
    pub fn from_events(events: impl IntoIterator<Item = JobEvent>) -> Result<Self, LedgerError> {
        let mut state = Self::new();
        for event in events {
            state.append(event)?;
        }
        Ok(state)
    }

    /// Jobs of a source in creation order.
    pub fn source_jobs<'a>(&'a self, source_id: &SourceId) -> impl DoubleEndedIterator<Item = &'a IngestionJob> + 'a {
        self.by_source
            .get(source_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.jobs.get(id))
    }

    /// Check an event against the state machine and the per-source rules
    /// without recording it.
    pub fn check(&self, event: &JobEvent) -> Result<IngestionJob, LedgerError> {
        match &event.kind {
            JobEventKind::Created {
                watermark_start,
                reprocess,
            } => {
                if self.jobs.contains_key(&event.job_id) {
                    return Err(LedgerError::DuplicateJob(event.job_id));
                }
                if let Some(open) = self.open_job(&event.source_id) {
                    return Err(LedgerError::SourceBusy {
                        source_id: event.source_id.clone(),
                        open: open.job_id,
                    });
                }
                if let Some(blocking) = self.blocking_job(&event.source_id) {
                    return Err(LedgerError::SourceBlocked {
                        source_id: event.source_id.clone(),
                        job_id: blocking.job_id,
                    });
                }
                if !reprocess {
                    let expected = self.next_watermark(&event.source_id);
                    if *watermark_start != expected {
                        return Err(LedgerError::WatermarkGap {
                            source_id: event.source_id.clone(),
                            expected,
                            got: *watermark_start,
                        });
                    }
                }
                IngestionJob::created(event)
            }
            _ => {
                let mut job = self
                    .jobs
                    .get(&event.job_id)
                    .cloned()
                    .ok_or(LedgerError::UnknownJob(event.job_id))?;
                job.apply(event)?;
                Ok(job)
            }
        }
    }

    pub fn append(&mut self, event: JobEvent) -> Result<IngestionJob, LedgerError> {
        let job = self.check(&event)?;
        if matches!(event.kind, JobEventKind::Created { .. }) {
            self.by_source
                .entry(event.source_id.clone())
                .or_default()
                .push(event.job_id);
        }
        self.jobs.insert(job.job_id, job.clone());
        self.events.entry(event.job_id).or_default().push(event);
        Ok(job)
    }

    pub fn job(&self, job_id: JobId) -> Option<&IngestionJob> {
        self.jobs.get(&job_id)
    }

    pub fn events(&self, job_id: JobId) -> &[JobEvent] {
        self.events.get(&job_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn jobs_for(&self, source_id: &SourceId, limit: usize) -> Vec<IngestionJob> {
        self.source_jobs(source_id).rev().take(limit).cloned().collect()
    }

    pub fn open_job(&self, source_id: &SourceId) -> Option<&IngestionJob> {
        self.source_jobs(source_id).find(|j| j.is_open())
    }

    pub fn last_succeeded(&self, source_id: &SourceId) -> Option<&IngestionJob> {
        self.source_jobs(source_id).rev().find(|j| j.in_chain())
    }

    pub fn blocking_job(&self, source_id: &SourceId) -> Option<&IngestionJob> {
        self.source_jobs(source_id).rev().find(|j| j.blocks_source())
    }

    pub fn next_watermark(&self, source_id: &SourceId) -> Watermark {
        self.last_succeeded(source_id)
            .and_then(|j| j.watermark_end)
            .unwrap_or(Watermark::ZERO)
    }

    pub fn running_jobs(&self) -> Vec<IngestionJob> {
        let mut running: Vec<IngestionJob> = self
            .jobs
            .values()
            .filter(|j| j.status == super::types::JobStatus::Running)
            .cloned()
            .collect();
        running.sort_by_key(|j| j.job_id);
        running
    }

    pub fn sources(&self) -> Vec<SourceId> {
        self.by_source
            .keys()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// In-memory job ledger for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobLedger {
    state: RwLock<LedgerState>,
}

impl InMemoryJobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, LedgerState>, LedgerError> {
        self.state
            .read()
            .map_err(|_| LedgerError::Storage("ledger lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, LedgerState>, LedgerError> {
        self.state
            .write()
            .map_err(|_| LedgerError::Storage("ledger lock poisoned".to_string()))
    }
}

impl JobLedger for InMemoryJobLedger {
    fn append(&self, event: JobEvent) -> Result<IngestionJob, LedgerError> {
        self.write()?.append(event)
    }

    fn job(&self, job_id: JobId) -> Result<Option<IngestionJob>, LedgerError> {
        Ok(self.read()?.job(job_id).cloned())
    }

    fn events(&self, job_id: JobId) -> Result<Vec<JobEvent>, LedgerError> {
        Ok(self.read()?.events(job_id).to_vec())
    }

    fn jobs_for(&self, source_id: &SourceId, limit: usize) -> Result<Vec<IngestionJob>, LedgerError> {
        Ok(self.read()?.jobs_for(source_id, limit))
    }

    fn open_job(&self, source_id: &SourceId) -> Result<Option<IngestionJob>, LedgerError> {
        Ok(self.read()?.open_job(source_id).cloned())
    }

    fn last_succeeded(&self, source_id: &SourceId) -> Result<Option<IngestionJob>, LedgerError> {
        Ok(self.read()?.last_succeeded(source_id).cloned())
    }

    fn blocking_job(&self, source_id: &SourceId) -> Result<Option<IngestionJob>, LedgerError> {
        Ok(self.read()?.blocking_job(source_id).cloned())
    }

    fn running_jobs(&self) -> Result<Vec<IngestionJob>, LedgerError> {
        Ok(self.read()?.running_jobs())
    }

    fn sources(&self) -> Result<Vec<SourceId>, LedgerError> {
        Ok(self.read()?.sources())
    }
}
