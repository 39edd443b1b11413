//! Ingestion job ledger.
//!
//! ## Design
//!
//! - One append-only event log per job (`created`, `started`, `succeeded`,
//!   `failed`, `retrying`, `discarded`, `resumed`)
//! - Current status is derived by folding the log; every append is validated
//!   against the job state machine
//! - Per source: at most one open job, and succeeded jobs form a gap-free
//!   watermark chain (reprocessing jobs are explicit and excluded)
//! - A terminal failure blocks its source until an operator resumes it

#[cfg(feature = "postgres")]
pub mod postgres;
pub mod store;
pub mod types;

#[cfg(feature = "postgres")]
pub use postgres::PostgresJobLedger;
pub use store::{InMemoryJobLedger, JobLedger, LedgerState};
pub use types::{
    BackoffStrategy, IngestionJob, JobEvent, JobEventKind, JobStats, JobStatus, LedgerError, RetryPolicy,
};
