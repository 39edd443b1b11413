//! Postgres-backed job ledger.
//!
//! Events are rows of `ingestion_job_events`. Appends take a per-source
//! advisory lock, rebuild that source's [`LedgerState`] from its rows and
//! validate the new event against it, so the admission rules are exactly the
//! in-memory ones.

use tokio::runtime::Handle;
use tracing::instrument;

use sqlx::PgPool;

use signalhub_core::{JobId, SourceId};

use super::store::{JobLedger, LedgerState};
use super::types::{IngestionJob, JobEvent, LedgerError};

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ingestion_job_events (
    seq       BIGSERIAL PRIMARY KEY,
    job_id    UUID NOT NULL,
    source_id TEXT NOT NULL,
    at        TIMESTAMPTZ NOT NULL,
    event     JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS ingestion_job_events_source ON ingestion_job_events (source_id, seq);
CREATE INDEX IF NOT EXISTS ingestion_job_events_job ON ingestion_job_events (job_id, seq);
"#;

#[derive(Debug, Clone)]
pub struct PostgresJobLedger {
    pool: PgPool,
    handle: Handle,
}

impl PostgresJobLedger {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    pub async fn ensure_schema(&self) -> Result<(), LedgerError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    #[instrument(skip(self, event), fields(job_id = %event.job_id, source_id = %event.source_id, event = event.kind.name()), err)]
    pub async fn append_async(&self, event: JobEvent) -> Result<IngestionJob, LedgerError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(event.source_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("source_lock", e))?;

        let rows: Vec<serde_json::Value> =
            sqlx::query_scalar("SELECT event FROM ingestion_job_events WHERE source_id = $1 ORDER BY seq")
                .bind(event.source_id.as_str())
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("load_source_events", e))?;
        let state = LedgerState::from_events(decode_all(rows)?)?;
        let job = state.check(&event)?;

        let payload = serde_json::to_value(&event)
            .map_err(|e| LedgerError::Storage(format!("serialize job event: {e}")))?;
        sqlx::query("INSERT INTO ingestion_job_events (job_id, source_id, at, event) VALUES ($1, $2, $3, $4)")
            .bind(event.job_id.as_uuid())
            .bind(event.source_id.as_str())
            .bind(event.at)
            .bind(payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_job_event", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job)
    }

    pub async fn events_async(&self, job_id: JobId) -> Result<Vec<JobEvent>, LedgerError> {
        let rows: Vec<serde_json::Value> =
            sqlx::query_scalar("SELECT event FROM ingestion_job_events WHERE job_id = $1 ORDER BY seq")
                .bind(job_id.as_uuid())
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("load_job_events", e))?;
        decode_all(rows)
    }

    async fn source_state(&self, source_id: &SourceId) -> Result<LedgerState, LedgerError> {
        let rows: Vec<serde_json::Value> =
            sqlx::query_scalar("SELECT event FROM ingestion_job_events WHERE source_id = $1 ORDER BY seq")
                .bind(source_id.as_str())
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("load_source_events", e))?;
        LedgerState::from_events(decode_all(rows)?)
    }

    async fn full_state(&self) -> Result<LedgerState, LedgerError> {
        let rows: Vec<serde_json::Value> = sqlx::query_scalar("SELECT event FROM ingestion_job_events ORDER BY seq")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_events", e))?;
        LedgerState::from_events(decode_all(rows)?)
    }

    async fn sources_async(&self) -> Result<Vec<SourceId>, LedgerError> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT source_id FROM ingestion_job_events ORDER BY source_id")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("load_sources", e))?;
        rows.into_iter()
            .map(|s| SourceId::new(&s).map_err(|e| LedgerError::Storage(format!("corrupt source_id {s:?}: {e}"))))
            .collect()
    }
}

fn decode_all(rows: Vec<serde_json::Value>) -> Result<Vec<JobEvent>, LedgerError> {
    rows.into_iter()
        .map(|row| {
            serde_json::from_value(row).map_err(|e| LedgerError::Storage(format!("corrupt job event: {e}")))
        })
        .collect()
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            LedgerError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolTimedOut => LedgerError::Storage(format!("connection pool timed out in {operation}")),
        _ => LedgerError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

impl JobLedger for PostgresJobLedger {
    fn append(&self, event: JobEvent) -> Result<IngestionJob, LedgerError> {
        self.handle.block_on(self.append_async(event))
    }

    fn job(&self, job_id: JobId) -> Result<Option<IngestionJob>, LedgerError> {
        let events = self.handle.block_on(self.events_async(job_id))?;
        IngestionJob::from_events(&events)
    }

    fn events(&self, job_id: JobId) -> Result<Vec<JobEvent>, LedgerError> {
        self.handle.block_on(self.events_async(job_id))
    }

    fn jobs_for(&self, source_id: &SourceId, limit: usize) -> Result<Vec<IngestionJob>, LedgerError> {
        Ok(self.handle.block_on(self.source_state(source_id))?.jobs_for(source_id, limit))
    }

    fn open_job(&self, source_id: &SourceId) -> Result<Option<IngestionJob>, LedgerError> {
        Ok(self
            .handle
            .block_on(self.source_state(source_id))?
            .open_job(source_id)
            .cloned())
    }

    fn last_succeeded(&self, source_id: &SourceId) -> Result<Option<IngestionJob>, LedgerError> {
        Ok(self
            .handle
            .block_on(self.source_state(source_id))?
            .last_succeeded(source_id)
            .cloned())
    }

    fn blocking_job(&self, source_id: &SourceId) -> Result<Option<IngestionJob>, LedgerError> {
        Ok(self
            .handle
            .block_on(self.source_state(source_id))?
            .blocking_job(source_id)
            .cloned())
    }

    fn running_jobs(&self) -> Result<Vec<IngestionJob>, LedgerError> {
        Ok(self.handle.block_on(self.full_state())?.running_jobs())
    }

    fn sources(&self) -> Result<Vec<SourceId>, LedgerError> {
        self.handle.block_on(self.sources_async())
    }
}
