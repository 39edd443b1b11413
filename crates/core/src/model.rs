//! Model artifacts and predictions.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::id::{EntityKey, ModelId, SnapshotId};

/// Predictive model families.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Churn,
    Forecast,
}

impl ModelType {
    pub const ALL: [ModelType; 2] = [ModelType::Churn, ModelType::Forecast];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Churn => "churn",
            ModelType::Forecast => "forecast",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl core::fmt::Display for ModelType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a model artifact.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Training,
    Ready,
    Deprecated,
    TrainingFailed,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Training => "training",
            ArtifactStatus::Ready => "ready",
            ArtifactStatus::Deprecated => "deprecated",
            ArtifactStatus::TrainingFailed => "training_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            ArtifactStatus::Training,
            ArtifactStatus::Ready,
            ArtifactStatus::Deprecated,
            ArtifactStatus::TrainingFailed,
        ]
        .into_iter()
        .find(|st| st.as_str() == s)
    }
}

/// A trained (or training) model version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub model_id: ModelId,
    pub model_type: ModelType,
    pub trained_at: DateTime<Utc>,
    /// Store state the artifact was trained on.
    pub training_snapshot_id: SnapshotId,
    pub metrics: BTreeMap<String, f64>,
    pub status: ArtifactStatus,
    /// Backend-specific trained state (weights, coefficients, ...).
    pub parameters: JsonValue,
    pub failure: Option<String>,
}

impl ModelArtifact {
    /// A freshly registered artifact in `training` status.
    pub fn training(
        model_type: ModelType,
        training_snapshot_id: SnapshotId,
        trained_at: DateTime<Utc>,
    ) -> Self {
        Self {
            model_id: ModelId::new(),
            model_type,
            trained_at,
            training_snapshot_id,
            metrics: BTreeMap::new(),
            status: ArtifactStatus::Training,
            parameters: JsonValue::Null,
            failure: None,
        }
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }
}

/// Scoring output value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PredictionValue {
    /// Classification probability in \[0, 1\].
    Probability { p: f64 },
    /// Numeric forecast with an uncertainty interval.
    Numeric { value: f64, lower: f64, upper: f64 },
}

impl PredictionValue {
    /// Primary numeric value (probability or point forecast).
    pub fn point(&self) -> f64 {
        match self {
            PredictionValue::Probability { p } => *p,
            PredictionValue::Numeric { value, .. } => *value,
        }
    }
}

/// One scored output row. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub entity_key: EntityKey,
    pub model_id: ModelId,
    pub model_type: ModelType,
    pub predicted_at: DateTime<Utc>,
    pub value: PredictionValue,
    /// Days ahead (forecasts only).
    pub horizon: Option<u32>,
    pub snapshot_id: SnapshotId,
}

/// Inclusive time range used for history reads.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.is_none_or(|f| at >= f) && self.to.is_none_or(|t| at <= t)
    }
}

/// Ordering key of a prediction for "current" selection.
///
/// Predictions of live (non-deprecated) models win over deprecated ones; then
/// the latest `predicted_at`; then the higher (more recent) `model_id`.
fn current_rank(p: &Prediction, deprecated: &HashSet<ModelId>) -> (bool, DateTime<Utc>, ModelId) {
    (!deprecated.contains(&p.model_id), p.predicted_at, p.model_id)
}

/// Pick the current prediction among candidates for one entity/model type.
pub fn select_current<'a, I>(candidates: I, deprecated: &HashSet<ModelId>) -> Option<&'a Prediction>
where
    I: IntoIterator<Item = &'a Prediction>,
{
    candidates
        .into_iter()
        .max_by(|a, b| current_rank(a, deprecated).cmp(&current_rank(b, deprecated)))
}

/// All rows of the winning scoring run (same model and `predicted_at` as the
/// current prediction), ordered by horizon.
pub fn select_current_run<'a, I>(candidates: I, deprecated: &HashSet<ModelId>) -> Vec<&'a Prediction>
where
    I: IntoIterator<Item = &'a Prediction>,
    I::IntoIter: Clone,
{
    let iter = candidates.into_iter();
    let Some(winner) = select_current(iter.clone(), deprecated) else {
        return Vec::new();
    };
    let mut run: Vec<&Prediction> = iter
        .filter(|p| p.model_id == winner.model_id && p.predicted_at == winner.predicted_at)
        .collect();
    run.sort_by_key(|p| p.horizon.unwrap_or(0));
    run
}
