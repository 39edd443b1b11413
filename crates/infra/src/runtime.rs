//! Process wiring: store, ledger, pipeline, scheduler, feed and their lanes.

use std::io;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use signalhub_core::{CancellationToken, ModelType, SourceId};
use signalhub_models::BackendRegistry;

use crate::alerts::{AlertSink, InMemoryAlertSink};
use crate::config::{AppConfig, ConfigError};
use crate::feed::InsightFeed;
use crate::lane::{LaneConfig, LaneHandle, LaneTrigger, TickOutcome, spawn_lane};
use crate::ledger::{InMemoryJobLedger, JobLedger, JobStatus, LedgerError};
use crate::pipeline::{IngestionPipeline, PipelineConfig, PipelineError};
use crate::scheduler::{ModelScheduler, SchedulerConfig, SchedulerError};
use crate::store::{InMemoryStore, SharedStore, StoreError};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("failed to spawn lane: {0}")]
    Lane(#[from] io::Error),
}

/// Everything a SignalHub process runs on.
#[derive(Clone)]
pub struct Services {
    pub config: AppConfig,
    pub store: SharedStore,
    pub ledger: Arc<dyn JobLedger>,
    pub alerts: Arc<dyn AlertSink>,
    pub pipeline: Arc<IngestionPipeline>,
    pub scheduler: Arc<ModelScheduler>,
    pub feed: InsightFeed,
    pub cancel: CancellationToken,
}

impl Services {
    pub fn in_memory(config: AppConfig) -> Self {
        Self::assemble(config, InMemoryStore::arc(), InMemoryJobLedger::arc())
    }

    pub fn assemble(config: AppConfig, store: SharedStore, ledger: Arc<dyn JobLedger>) -> Self {
        let alerts: Arc<dyn AlertSink> = Arc::new(InMemoryAlertSink::new());
        let cancel = CancellationToken::new();

        let pipeline = IngestionPipeline::new(
            config.connector_registry(),
            config.normalizer(),
            store.clone(),
            ledger.clone(),
            alerts.clone(),
            PipelineConfig::from_app(&config),
        )
        .with_cancellation(cancel.clone());

        let scheduler = ModelScheduler::new(
            store.clone(),
            BackendRegistry::with_defaults(config.training.forecast_horizon_days),
            alerts.clone(),
            SchedulerConfig::from_app(&config),
        )
        .with_cancellation(cancel.clone());

        Self {
            feed: InsightFeed::new(store.clone()),
            pipeline: Arc::new(pipeline),
            scheduler: Arc::new(scheduler),
            config,
            store,
            ledger,
            alerts,
            cancel,
        }
    }

    /// Postgres-backed services. Must be called from inside a tokio runtime;
    /// the store and ledger keep its handle for their blocking trait methods.
    #[cfg(feature = "postgres")]
    pub async fn postgres(config: AppConfig, database_url: &str) -> Result<Self, RuntimeError> {
        use crate::ledger::PostgresJobLedger;
        use crate::store::PostgresStore;

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Storage(format!("connect: {e}")))?;
        let handle = tokio::runtime::Handle::current();

        let store = PostgresStore::new(pool.clone(), handle.clone());
        store.ensure_schema().await?;
        let ledger = PostgresJobLedger::new(pool, handle);
        ledger.ensure_schema().await?;
        info!("postgres store ready");

        Ok(Self::assemble(config, Arc::new(store), Arc::new(ledger)))
    }

    /// Recover interrupted jobs, then start one ingestion lane per source and
    /// a training and a scoring lane per model type.
    ///
    /// Blocks on store calls; call from a plain thread or `spawn_blocking`
    /// when the store is Postgres.
    pub fn spawn_lanes(&self) -> Result<Lanes, RuntimeError> {
        for job in self.pipeline.recover()? {
            info!(source_id = %job.source_id, job_id = %job.job_id, status = %job.status, "recovered interrupted job");
        }

        let mut lanes = Lanes {
            handles: Vec::new(),
            ingestion: Vec::new(),
            cancel: self.cancel.clone(),
        };
        let scheduler_cfg = self.scheduler.config().clone();

        let mut training_triggers: Vec<LaneTrigger> = Vec::new();
        for model_type in self.scheduler.model_types() {
            let scheduler = self.scheduler.clone();
            let training = spawn_lane(
                format!("train-{model_type}"),
                LaneConfig::every(scheduler_cfg.training_poll()),
                move || training_tick(&scheduler, model_type),
            )?;
            training_triggers.push(training.trigger_handle());
            lanes.handles.push(training);

            let scheduler = self.scheduler.clone();
            let scoring = spawn_lane(
                format!("score-{model_type}"),
                LaneConfig::every(scheduler_cfg.scoring_cadence),
                move || scoring_tick(&scheduler, model_type),
            )?;
            lanes.handles.push(scoring);
        }

        for (source_id, source) in &self.config.sources {
            let pipeline = self.pipeline.clone();
            let triggers = training_triggers.clone();
            let lane_source = source_id.clone();
            let lane = spawn_lane(
                format!("ingest-{source_id}"),
                LaneConfig::every(source.poll_interval),
                move || ingestion_tick(&pipeline, &lane_source, &triggers),
            )?;
            lanes.ingestion.push((source_id.clone(), lane.trigger_handle()));
            lanes.handles.push(lane);
        }

        info!(lanes = lanes.handles.len(), "lanes started");
        Ok(lanes)
    }
}

/// Running lanes of a process.
#[derive(Debug)]
pub struct Lanes {
    handles: Vec<LaneHandle>,
    ingestion: Vec<(SourceId, LaneTrigger)>,
    cancel: CancellationToken,
}

impl Lanes {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.handles.iter().map(|h| h.name().to_string()).collect()
    }

    /// Ask a source's ingestion lane to pull now. False for unknown sources.
    pub fn trigger_source(&self, source_id: &SourceId) -> bool {
        match self.ingestion.iter().find(|(s, _)| s == source_id) {
            Some((_, trigger)) => {
                trigger.trigger();
                true
            }
            None => false,
        }
    }

    /// Cancel in-flight work and stop every lane.
    pub fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            handle.shutdown();
        }
        info!("lanes stopped");
    }
}

fn ingestion_tick(pipeline: &IngestionPipeline, source_id: &SourceId, training: &[LaneTrigger]) -> TickOutcome {
    match pipeline.ingest(source_id) {
        Ok(job) if job.status == JobStatus::Succeeded => {
            // New versions may make training due.
            for trigger in training {
                trigger.trigger();
            }
            TickOutcome::MoreWork
        }
        Ok(_) => TickOutcome::Idle,
        Err(PipelineError::SourceBlocked { .. } | PipelineError::Cancelled) => TickOutcome::Idle,
        Err(err) => {
            warn!(source_id = %source_id, error = %err, "ingestion tick failed");
            TickOutcome::Failed
        }
    }
}

fn training_tick(scheduler: &ModelScheduler, model_type: ModelType) -> TickOutcome {
    match scheduler.run_training(model_type) {
        Ok(_) => TickOutcome::Idle,
        // Recorded on the candidate and alerted; wait for the next trigger.
        Err(
            SchedulerError::MetricRegression { .. }
            | SchedulerError::MissingMetric { .. }
            | SchedulerError::Training(_)
            | SchedulerError::Cancelled,
        ) => TickOutcome::Idle,
        Err(err) => {
            warn!(model_type = %model_type, error = %err, "training tick failed");
            TickOutcome::Failed
        }
    }
}

fn scoring_tick(scheduler: &ModelScheduler, model_type: ModelType) -> TickOutcome {
    match scheduler.score(model_type) {
        Ok(_) | Err(SchedulerError::NoReadyModel(_)) => TickOutcome::Idle,
        Err(err) => {
            warn!(model_type = %model_type, error = %err, "scoring tick failed");
            TickOutcome::Failed
        }
    }
}
