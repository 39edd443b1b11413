use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use signalhub_core::{
    CancellationToken, CanonicalEntity, EntityKey, EntityType, ModelArtifact, ModelType,
    PredictionValue, SnapshotId,
};

use crate::error::ModelError;

/// Entities of one immutable store snapshot, restricted to a backend's input types.
#[derive(Debug, Clone)]
pub struct ModelInput<'a> {
    pub snapshot_id: SnapshotId,
    pub as_of: DateTime<Utc>,
    pub entities: Vec<&'a CanonicalEntity>,
}

impl<'a> ModelInput<'a> {
    pub fn new(snapshot_id: SnapshotId, as_of: DateTime<Utc>, entities: Vec<&'a CanonicalEntity>) -> Self {
        Self {
            snapshot_id,
            as_of,
            entities,
        }
    }

    pub fn of_type(&self, entity_type: EntityType) -> impl Iterator<Item = &'a CanonicalEntity> + '_ {
        self.entities
            .iter()
            .copied()
            .filter(move |e| e.entity_type == entity_type)
    }
}

/// Output of a successful training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainedModel {
    pub metrics: BTreeMap<String, f64>,
    pub parameters: JsonValue,
}

/// One scored row, before the scheduler stamps model id and time.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredValue {
    pub entity_key: EntityKey,
    pub value: PredictionValue,
    pub horizon: Option<u32>,
}

/// A model family.
///
/// Implementations must be deterministic for a given input and must check
/// `cancel` between epochs (or equivalent units of work).
pub trait ModelBackend: Send + Sync {
    fn model_type(&self) -> ModelType;

    /// Entity types the backend reads.
    fn input_types(&self) -> &[EntityType];

    /// Metric compared at promotion time; higher is better.
    fn primary_metric(&self) -> &str;

    fn train(&self, input: &ModelInput<'_>, cancel: &CancellationToken) -> Result<TrainedModel, ModelError>;

    fn score(&self, artifact: &ModelArtifact, input: &ModelInput<'_>) -> Result<Vec<ScoredValue>, ModelError>;
}

impl<B> ModelBackend for Arc<B>
where
    B: ModelBackend + ?Sized,
{
    fn model_type(&self) -> ModelType {
        (**self).model_type()
    }

    fn input_types(&self) -> &[EntityType] {
        (**self).input_types()
    }

    fn primary_metric(&self) -> &str {
        (**self).primary_metric()
    }

    fn train(&self, input: &ModelInput<'_>, cancel: &CancellationToken) -> Result<TrainedModel, ModelError> {
        (**self).train(input, cancel)
    }

    fn score(&self, artifact: &ModelArtifact, input: &ModelInput<'_>) -> Result<Vec<ScoredValue>, ModelError> {
        (**self).score(artifact, input)
    }
}
