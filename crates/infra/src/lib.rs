//! Infrastructure layer: store, job ledger, ingestion pipeline, model
//! scheduler, insight feed and process wiring.

pub mod alerts;
pub mod config;
pub mod feed;
pub mod lane;
pub mod ledger;
pub mod pipeline;
pub mod runtime;
pub mod scheduler;
pub mod store;

pub use alerts::{AlertKind, AlertSink, InMemoryAlertSink, OperatorAlert, TracingAlertSink};
pub use config::{AppConfig, ConfigError, SourceConfig};
pub use feed::{AtRiskCustomer, ChurnOverview, ForecastOverview, InsightFeed};
pub use lane::{LaneConfig, LaneHandle, LaneTrigger, TickOutcome, spawn_lane};
pub use ledger::{InMemoryJobLedger, IngestionJob, JobEvent, JobEventKind, JobLedger, JobStatus, LedgerError, RetryPolicy};
pub use pipeline::{IngestionPipeline, OperatorReport, PipelineConfig, PipelineError, SourceStatus};
pub use runtime::{Lanes, RuntimeError, Services};
pub use scheduler::{ModelScheduler, ModelStatus, SchedulerConfig, SchedulerError, TrainingState};
pub use store::{CentralStore, InMemoryStore, SharedStore, Snapshot, StoreError};
