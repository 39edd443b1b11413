use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use signalhub_core::{
    CanonicalEntity, EntityKey, EntityRef, EntityType, JobId, ModelArtifact, ModelId, ModelType,
    Prediction, SnapshotId, SourceId, SourceRecord, TimeRange, Watermark,
};

/// A record that failed normalization, kept with its raw payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinedRecord {
    pub record: SourceRecord,
    pub error: String,
    /// Field at fault, when the failure is tied to one.
    pub field: Option<String>,
    pub job_id: JobId,
    pub quarantined_at: DateTime<Utc>,
}

/// Everything one ingestion job writes, committed all-or-nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitBatch {
    pub job_id: JobId,
    pub source_id: SourceId,
    pub watermark_start: Watermark,
    pub watermark_end: Watermark,
    pub entities: Vec<CanonicalEntity>,
    pub quarantined: Vec<QuarantinedRecord>,
}

/// Proof that a batch landed. Keyed by job id, so a retried job can detect
/// that an earlier attempt already committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReceipt {
    pub job_id: JobId,
    pub source_id: SourceId,
    /// Commit sequence assigned to the batch.
    pub snapshot_id: SnapshotId,
    pub committed_at: DateTime<Utc>,
    pub watermark_start: Watermark,
    pub watermark_end: Watermark,
    /// New versions appended.
    pub applied: usize,
    /// Versions skipped as already present or unchanged.
    pub deduplicated: usize,
    pub quarantined: usize,
}

/// Store operation error.
///
/// These are infrastructure errors; callers retry at the ingestion-job level.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("batch for job {0} already committed")]
    DuplicateJob(JobId),

    #[error("constraint violated: {0}")]
    Constraint(String),

    /// Optimistic check failed (e.g. the ready model changed underneath a promotion).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Storage(_) | StoreError::Timeout(_) | StoreError::Conflict(_)
        )
    }
}

/// Consistent point-in-time view of canonical entities.
///
/// Owned by the caller: later commits never change a snapshot already taken.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    snapshot_id: SnapshotId,
    as_of: DateTime<Utc>,
    entities: BTreeMap<EntityRef, Arc<CanonicalEntity>>,
}

impl Snapshot {
    pub fn new(
        snapshot_id: SnapshotId,
        as_of: DateTime<Utc>,
        entities: impl IntoIterator<Item = Arc<CanonicalEntity>>,
    ) -> Self {
        Self {
            snapshot_id,
            as_of,
            entities: entities.into_iter().map(|e| (e.entity_ref(), e)).collect(),
        }
    }

    pub fn snapshot_id(&self) -> SnapshotId {
        self.snapshot_id
    }

    pub fn as_of(&self) -> DateTime<Utc> {
        self.as_of
    }

    pub fn get(&self, entity_type: EntityType, entity_key: &EntityKey) -> Option<&CanonicalEntity> {
        self.entities
            .get(&EntityRef {
                entity_type,
                entity_key: entity_key.clone(),
            })
            .map(Arc::as_ref)
    }

    /// Entities in `(entity_type, entity_key)` order.
    pub fn entities(&self) -> impl Iterator<Item = &CanonicalEntity> {
        self.entities.values().map(Arc::as_ref)
    }

    pub fn of_types<'a>(&'a self, types: &'a [EntityType]) -> impl Iterator<Item = &'a CanonicalEntity> + 'a {
        self.entities().filter(move |e| types.contains(&e.entity_type))
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Canonical entity storage: bitemporal versions, commit receipts and quarantine.
pub trait EntityStore: Send + Sync {
    /// Commit a batch atomically and assign it the next commit sequence.
    fn commit_batch(&self, batch: CommitBatch) -> Result<BatchReceipt, StoreError>;

    fn committed_batch(&self, job_id: JobId) -> Result<Option<BatchReceipt>, StoreError>;

    /// Latest committed sequence.
    fn latest_snapshot_id(&self) -> Result<SnapshotId, StoreError>;

    /// Versions visible at the current commit sequence and valid at `as_of`.
    fn read_snapshot(&self, as_of: DateTime<Utc>) -> Result<Snapshot, StoreError>;

    /// Number of versions of `types` committed after `since`.
    fn versions_since(&self, since: SnapshotId, types: &[EntityType]) -> Result<usize, StoreError>;

    /// Full version chain, oldest first, with `valid_to` derived from successors.
    fn entity_history(
        &self,
        entity_type: EntityType,
        entity_key: &EntityKey,
    ) -> Result<Vec<CanonicalEntity>, StoreError>;

    /// Most recent quarantined records first.
    fn quarantined(&self, source_id: Option<&SourceId>, limit: usize) -> Result<Vec<QuarantinedRecord>, StoreError>;

    fn quarantine_count(&self, source_id: &SourceId) -> Result<usize, StoreError>;
}

/// Append-only prediction tables.
pub trait PredictionStore: Send + Sync {
    fn append_prediction(&self, prediction: Prediction) -> Result<(), StoreError> {
        self.append_predictions(vec![prediction])
    }

    /// Append a whole scoring run atomically.
    fn append_predictions(&self, predictions: Vec<Prediction>) -> Result<(), StoreError>;

    /// Current run of every entity key, per the selection rule of
    /// [`signalhub_core::select_current_run`].
    fn read_current_predictions(&self, model_type: ModelType) -> Result<Vec<Prediction>, StoreError>;

    /// Every prediction for one entity with `predicted_at` inside `range`,
    /// ordered by `predicted_at` then horizon.
    fn predictions_for(
        &self,
        entity_key: &EntityKey,
        model_type: ModelType,
        range: TimeRange,
    ) -> Result<Vec<Prediction>, StoreError>;
}

/// Versioned model artifacts. At most one `ready` artifact per model type.
pub trait ArtifactRegistry: Send + Sync {
    /// Register a new artifact in `training` status.
    fn register_artifact(&self, artifact: ModelArtifact) -> Result<(), StoreError>;

    fn record_training_result(
        &self,
        model_id: ModelId,
        metrics: BTreeMap<String, f64>,
        parameters: JsonValue,
    ) -> Result<ModelArtifact, StoreError>;

    fn mark_training_failed(&self, model_id: ModelId, reason: &str) -> Result<ModelArtifact, StoreError>;

    /// Atomically make `model_id` the ready artifact of its type, deprecating the
    /// previous one. Fails with `Conflict` unless the current ready id equals
    /// `expected_ready`.
    fn promote(&self, model_id: ModelId, expected_ready: Option<ModelId>) -> Result<ModelArtifact, StoreError>;

    fn ready_artifact(&self, model_type: ModelType) -> Result<Option<ModelArtifact>, StoreError>;

    fn artifact(&self, model_id: ModelId) -> Result<Option<ModelArtifact>, StoreError>;

    /// Newest first.
    fn artifacts(&self, model_type: ModelType) -> Result<Vec<ModelArtifact>, StoreError>;

    fn deprecated_ids(&self, model_type: ModelType) -> Result<HashSet<ModelId>, StoreError> {
        Ok(self
            .artifacts(model_type)?
            .into_iter()
            .filter(|a| a.status == signalhub_core::ArtifactStatus::Deprecated)
            .map(|a| a.model_id)
            .collect())
    }
}

/// The whole centralized store.
pub trait CentralStore: EntityStore + PredictionStore + ArtifactRegistry {}

impl<S> CentralStore for S where S: EntityStore + PredictionStore + ArtifactRegistry + ?Sized {}

pub type SharedStore = Arc<dyn CentralStore>;
