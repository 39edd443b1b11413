//! Model training/scoring scheduler.
//!
//! ## Design
//!
//! - Per model type: `idle → training → {ready_candidate, training_failed}`,
//!   `ready_candidate → promoted → idle`
//! - Training reads one immutable snapshot; no store lock is held while the
//!   backend runs
//! - Promotion is gated on the backend's primary metric and swaps the ready
//!   artifact with a compare-and-set; promotions per model type are serialized
//! - Scoring uses the current ready artifact and is independent of training

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use signalhub_core::{CancellationToken, ModelArtifact, ModelId, ModelType, Prediction};
use signalhub_models::{BackendRegistry, ModelBackend, ModelError, ModelInput};

use crate::alerts::{AlertKind, AlertSink, OperatorAlert};
use crate::config::AppConfig;
use crate::store::{ArtifactRegistry, EntityStore, PredictionStore, SharedStore, StoreError};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no backend registered for model type '{0}'")]
    NoBackend(ModelType),

    #[error("no ready artifact for model type '{0}'")]
    NoReadyModel(ModelType),

    #[error("candidate {model_id} rejected: {metric} {candidate:.4} below required {required:.4}")]
    MetricRegression {
        model_id: ModelId,
        metric: String,
        candidate: f64,
        required: f64,
    },

    #[error("candidate {model_id} did not report metric '{metric}'")]
    MissingMetric { model_id: ModelId, metric: String },

    #[error(transparent)]
    Training(#[from] ModelError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Retrain once this long has passed since the last training.
    pub training_cadence: Duration,
    pub min_new_entities: usize,
    pub metric_floor: f64,
    pub max_regression: f64,
    pub scoring_cadence: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            training_cadence: Duration::from_secs(24 * 60 * 60),
            min_new_entities: 100,
            metric_floor: 0.5,
            max_regression: 0.05,
            scoring_cadence: Duration::from_secs(60 * 60),
        }
    }
}

impl SchedulerConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            training_cadence: config.training.cadence,
            min_new_entities: config.training.min_new_entities,
            metric_floor: config.promotion.metric_floor,
            max_regression: config.promotion.max_regression,
            scoring_cadence: config.scoring.cadence,
        }
    }

    /// How often the training lane checks whether training is due.
    pub fn training_poll(&self) -> Duration {
        self.training_cadence.min(Duration::from_secs(60))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingState {
    Idle,
    Training,
    ReadyCandidate,
    TrainingFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStatus {
    pub model_type: ModelType,
    pub state: TrainingState,
    pub primary_metric: String,
    pub ready: Option<ModelArtifact>,
    /// Newest first.
    pub artifacts: Vec<ModelArtifact>,
}

pub struct ModelScheduler {
    store: SharedStore,
    backends: BackendRegistry,
    alerts: Arc<dyn AlertSink>,
    config: SchedulerConfig,
    cancel: CancellationToken,
    states: Mutex<HashMap<ModelType, TrainingState>>,
    promotions: HashMap<ModelType, Mutex<()>>,
}

impl ModelScheduler {
    pub fn new(
        store: SharedStore,
        backends: BackendRegistry,
        alerts: Arc<dyn AlertSink>,
        config: SchedulerConfig,
    ) -> Self {
        let promotions = backends
            .model_types()
            .into_iter()
            .map(|t| (t, Mutex::new(())))
            .collect();
        Self {
            store,
            backends,
            alerts,
            config,
            cancel: CancellationToken::new(),
            states: Mutex::new(HashMap::new()),
            promotions,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn model_types(&self) -> Vec<ModelType> {
        self.backends.model_types()
    }

    fn backend(&self, model_type: ModelType) -> Result<Arc<dyn ModelBackend>, SchedulerError> {
        self.backends
            .get(model_type)
            .ok_or(SchedulerError::NoBackend(model_type))
    }

    fn promotion_guard(&self, model_type: ModelType) -> Result<MutexGuard<'_, ()>, SchedulerError> {
        self.promotions
            .get(&model_type)
            .ok_or(SchedulerError::NoBackend(model_type))?
            .lock()
            .map_err(|_| StoreError::Storage("promotion lock poisoned".to_string()).into())
    }

    fn set_state(&self, model_type: ModelType, state: TrainingState) {
        if let Ok(mut states) = self.states.lock() {
            states.insert(model_type, state);
        }
    }

    pub fn state(&self, model_type: ModelType) -> TrainingState {
        self.states
            .lock()
            .ok()
            .and_then(|s| s.get(&model_type).copied())
            .unwrap_or(TrainingState::Idle)
    }

    /// Due when no artifact exists, when the cadence has elapsed since the last
    /// training, or when enough new input versions were committed since.
    pub fn training_due(&self, model_type: ModelType) -> Result<bool, SchedulerError> {
        let backend = self.backend(model_type)?;
        let Some(latest) = self.store.artifacts(model_type)?.into_iter().next() else {
            return Ok(true);
        };

        let elapsed = (Utc::now() - latest.trained_at).to_std().unwrap_or(Duration::ZERO);
        if elapsed >= self.config.training_cadence {
            return Ok(true);
        }

        let fresh = self
            .store
            .versions_since(latest.training_snapshot_id, backend.input_types())?;
        debug!(model_type = %model_type, fresh, "training due check");
        Ok(fresh >= self.config.min_new_entities)
    }

    /// Train if due. Returns the promoted artifact when training ran and passed.
    pub fn run_training(&self, model_type: ModelType) -> Result<Option<ModelArtifact>, SchedulerError> {
        if !self.training_due(model_type)? {
            return Ok(None);
        }
        self.train(model_type).map(Some)
    }

    /// Train, gate and promote a new artifact, then score with it.
    pub fn train(&self, model_type: ModelType) -> Result<ModelArtifact, SchedulerError> {
        let backend = self.backend(model_type)?;
        let _guard = self.promotion_guard(model_type)?;
        if self.cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }

        self.set_state(model_type, TrainingState::Training);
        let snapshot = self.store.read_snapshot(Utc::now())?;
        let candidate = ModelArtifact::training(model_type, snapshot.snapshot_id(), Utc::now());
        let model_id = candidate.model_id;
        self.store.register_artifact(candidate)?;
        info!(model_type = %model_type, model_id = %model_id, snapshot = %snapshot.snapshot_id(), "training started");

        let input = ModelInput::new(
            snapshot.snapshot_id(),
            snapshot.as_of(),
            snapshot.of_types(backend.input_types()).collect(),
        );
        let trained = match backend.train(&input, &self.cancel) {
            Ok(trained) => trained,
            Err(err) => return Err(self.fail_candidate(model_type, model_id, err.into())),
        };

        let candidate = match self
            .store
            .record_training_result(model_id, trained.metrics, trained.parameters)
        {
            Ok(candidate) => candidate,
            Err(err) => return Err(self.fail_candidate(model_type, model_id, err.into())),
        };
        self.set_state(model_type, TrainingState::ReadyCandidate);

        let ready = self.store.ready_artifact(model_type)?;
        if let Err(err) = self.gate(backend.primary_metric(), &candidate, ready.as_ref()) {
            return Err(self.fail_candidate(model_type, model_id, err));
        }

        let promoted = match self.store.promote(model_id, ready.as_ref().map(|a| a.model_id)) {
            Ok(promoted) => promoted,
            Err(err) => return Err(self.fail_candidate(model_type, model_id, err.into())),
        };
        self.set_state(model_type, TrainingState::Idle);
        info!(
            model_type = %model_type,
            model_id = %model_id,
            previous = ?ready.map(|a| a.model_id),
            metric = backend.primary_metric(),
            value = promoted.metric(backend.primary_metric()).unwrap_or(f64::NAN),
            "model promoted"
        );

        // Serve the new artifact without waiting for the scoring cadence.
        match self.score_with(&*backend, &promoted) {
            Ok(predictions) => debug!(model_type = %model_type, rows = predictions.len(), "scored after promotion"),
            Err(err) => warn!(model_type = %model_type, model_id = %model_id, error = %err, "scoring after promotion failed"),
        }
        Ok(promoted)
    }

    /// Candidate must reach the floor and must not regress by more than
    /// `max_regression` against the ready artifact.
    fn gate(&self, metric: &str, candidate: &ModelArtifact, ready: Option<&ModelArtifact>) -> Result<(), SchedulerError> {
        let value = candidate.metric(metric).ok_or_else(|| SchedulerError::MissingMetric {
            model_id: candidate.model_id,
            metric: metric.to_string(),
        })?;

        let mut required = self.config.metric_floor;
        if let Some(baseline) = ready.and_then(|r| r.metric(metric)) {
            required = required.max(baseline - self.config.max_regression);
        }

        // NaN never passes.
        if !(value >= required) {
            return Err(SchedulerError::MetricRegression {
                model_id: candidate.model_id,
                metric: metric.to_string(),
                candidate: value,
                required,
            });
        }
        Ok(())
    }

    /// Mark a candidate failed, alert, and hand the error back.
    fn fail_candidate(&self, model_type: ModelType, model_id: ModelId, err: SchedulerError) -> SchedulerError {
        let err = match err {
            SchedulerError::Training(ModelError::Cancelled) => SchedulerError::Cancelled,
            other => other,
        };
        self.set_state(model_type, TrainingState::TrainingFailed);
        if let Err(store_err) = self.store.mark_training_failed(model_id, &err.to_string()) {
            warn!(model_type = %model_type, model_id = %model_id, error = %store_err, "could not mark candidate failed");
        }

        match &err {
            SchedulerError::Cancelled => {
                info!(model_type = %model_type, model_id = %model_id, "training cancelled");
            }
            SchedulerError::MetricRegression { .. } | SchedulerError::MissingMetric { .. } => {
                self.alerts.raise(
                    OperatorAlert::new(AlertKind::MetricRegression, model_type.as_str(), err.to_string())
                        .for_model(model_id),
                );
            }
            _ => {
                self.alerts.raise(
                    OperatorAlert::new(AlertKind::TrainingFailed, model_type.as_str(), err.to_string())
                        .for_model(model_id),
                );
            }
        }
        err
    }

    /// Score the latest snapshot with the ready artifact and append the run.
    pub fn score(&self, model_type: ModelType) -> Result<Vec<Prediction>, SchedulerError> {
        let backend = self.backend(model_type)?;
        let ready = self
            .store
            .ready_artifact(model_type)?
            .ok_or(SchedulerError::NoReadyModel(model_type))?;
        self.score_with(&*backend, &ready)
    }

    fn score_with(&self, backend: &dyn ModelBackend, artifact: &ModelArtifact) -> Result<Vec<Prediction>, SchedulerError> {
        let snapshot = self.store.read_snapshot(Utc::now())?;
        let input = ModelInput::new(
            snapshot.snapshot_id(),
            snapshot.as_of(),
            snapshot.of_types(backend.input_types()).collect(),
        );
        let scored = backend.score(artifact, &input)?;

        let predicted_at = Utc::now();
        let predictions: Vec<Prediction> = scored
            .into_iter()
            .map(|s| Prediction {
                entity_key: s.entity_key,
                model_id: artifact.model_id,
                model_type: artifact.model_type,
                predicted_at,
                value: s.value,
                horizon: s.horizon,
                snapshot_id: snapshot.snapshot_id(),
            })
            .collect();

        if !predictions.is_empty() {
            self.store.append_predictions(predictions.clone())?;
        }
        info!(
            model_type = %artifact.model_type,
            model_id = %artifact.model_id,
            snapshot = %snapshot.snapshot_id(),
            rows = predictions.len(),
            "scoring run appended"
        );
        Ok(predictions)
    }

    pub fn model_status(&self, model_type: ModelType) -> Result<ModelStatus, SchedulerError> {
        let backend = self.backend(model_type)?;
        Ok(ModelStatus {
            model_type,
            state: self.state(model_type),
            primary_metric: backend.primary_metric().to_string(),
            ready: self.store.ready_artifact(model_type)?,
            artifacts: self.store.artifacts(model_type)?,
        })
    }
}
