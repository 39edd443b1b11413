use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use signalhub_core::{
    ArtifactStatus, BatchId, CanonicalEntity, EntityKey, EntityRef, EntityType, JobId, ModelArtifact, ModelId,
    ModelType, Prediction, SnapshotId, SourceId, TimeRange, select_current_run,
};

use super::collapse_batch;
use super::r#trait::{
    ArtifactRegistry, BatchReceipt, CommitBatch, EntityStore, PredictionStore, QuarantinedRecord,
    Snapshot, StoreError,
};

/// Simulated storage failure for the next commit.
///
/// The commit fails once `after_entities` versions have been staged, which
/// exercises the all-or-nothing path of `commit_batch`.
#[derive(Debug, Clone)]
pub struct CommitFault {
    pub after_entities: usize,
    pub error: StoreError,
}

impl CommitFault {
    pub fn storage(after_entities: usize) -> Self {
        Self {
            after_entities,
            error: StoreError::Storage("injected storage fault".to_string()),
        }
    }
}

#[derive(Debug)]
struct StoredVersion {
    entity: Arc<CanonicalEntity>,
    seq: u64,
}

#[derive(Debug, Default)]
struct EntityState {
    seq: u64,
    /// Arena of immutable versions in commit order.
    versions: Vec<StoredVersion>,
    /// Per-key chains of arena indices, oldest first.
    chains: HashMap<EntityRef, Vec<usize>>,
    /// Every `(entity, batch)` pair ever offered, applied or not.
    seen: HashSet<(EntityRef, BatchId)>,
    receipts: HashMap<JobId, BatchReceipt>,
    quarantine: Vec<QuarantinedRecord>,
}

impl EntityState {
    fn chain(&self, entity_ref: &EntityRef) -> &[usize] {
        self.chains.get(entity_ref).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The chain as owned versions with `valid_to` filled from the successor.
    fn materialize(&self, chain: &[usize]) -> Vec<CanonicalEntity> {
        chain
            .iter()
            .enumerate()
            .map(|(pos, idx)| {
                let mut entity = (*self.versions[*idx].entity).clone();
                entity.valid_to = chain
                    .get(pos + 1)
                    .map(|next| self.versions[*next].entity.valid_from);
                entity
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct ModelState {
    artifacts: BTreeMap<ModelId, ModelArtifact>,
    predictions: Vec<Prediction>,
}

/// In-memory centralized store.
///
/// Intended for tests/dev and single-process deployments. Entity versions
/// live in an arena and are never edited after commit.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entities: RwLock<EntityState>,
    models: RwLock<ModelState>,
    faults: Mutex<VecDeque<CommitFault>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Queue a fault for the next commit (one fault per commit).
    pub fn inject_commit_fault(&self, fault: CommitFault) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.push_back(fault);
        }
    }

    /// Total number of stored versions across all chains.
    pub fn version_count(&self) -> usize {
        self.entities.read().map(|s| s.versions.len()).unwrap_or(0)
    }

    fn read_entities(&self) -> Result<RwLockReadGuard<'_, EntityState>, StoreError> {
        self.entities
            .read()
            .map_err(|_| StoreError::Storage("entity lock poisoned".to_string()))
    }

    fn write_entities(&self) -> Result<RwLockWriteGuard<'_, EntityState>, StoreError> {
        self.entities
            .write()
            .map_err(|_| StoreError::Storage("entity lock poisoned".to_string()))
    }

    fn read_models(&self) -> Result<RwLockReadGuard<'_, ModelState>, StoreError> {
        self.models
            .read()
            .map_err(|_| StoreError::Storage("model lock poisoned".to_string()))
    }

    fn write_models(&self) -> Result<RwLockWriteGuard<'_, ModelState>, StoreError> {
        self.models
            .write()
            .map_err(|_| StoreError::Storage("model lock poisoned".to_string()))
    }

    fn take_fault(&self) -> Result<Option<CommitFault>, StoreError> {
        Ok(self
            .faults
            .lock()
            .map_err(|_| StoreError::Storage("fault queue poisoned".to_string()))?
            .pop_front())
    }
}

impl EntityStore for InMemoryStore {
    fn commit_batch(&self, batch: CommitBatch) -> Result<BatchReceipt, StoreError> {
        let fault = self.take_fault()?;
        let mut state = self.write_entities()?;

        if state.receipts.contains_key(&batch.job_id) {
            return Err(StoreError::DuplicateJob(batch.job_id));
        }

        let (entities, mut deduplicated) = collapse_batch(batch.entities);
        let mut staged: Vec<CanonicalEntity> = Vec::with_capacity(entities.len());
        let mut offered = Vec::with_capacity(entities.len());

        for mut entity in entities {
            if let Some(f) = &fault {
                if staged.len() >= f.after_entities {
                    return Err(f.error.clone());
                }
            }
            if entity.valid_to.is_some() {
                return Err(StoreError::Constraint(format!(
                    "{}/{}: incoming versions must be open (valid_to = None)",
                    entity.entity_type, entity.entity_key
                )));
            }

            let seen_key = (entity.entity_ref(), entity.provenance.batch_id);
            if state.seen.contains(&seen_key) {
                deduplicated += 1;
                continue;
            }
            offered.push(seen_key);

            let chain = state.chain(&entity.entity_ref());

            if let Some(prev) = chain.last().map(|idx| &state.versions[*idx].entity) {
                if prev.same_content(&entity) {
                    deduplicated += 1;
                    continue;
                }
                if entity.valid_from < prev.valid_from {
                    entity.valid_from = prev.valid_from;
                }
                if prev.provenance.source_id != entity.provenance.source_id {
                    warn!(
                        entity_type = %entity.entity_type,
                        entity_key = %entity.entity_key,
                        previous_source = %prev.provenance.source_id,
                        source_id = %entity.provenance.source_id,
                        "entity updated by a different source; latest commit wins"
                    );
                }
            }
            staged.push(entity);
        }

        if let Some(f) = fault {
            return Err(f.error);
        }

        let seq = state.seq + 1;
        let applied = staged.len();
        for entity in staged {
            let key = entity.entity_ref();
            let idx = state.versions.len();
            state.versions.push(StoredVersion {
                entity: Arc::new(entity),
                seq,
            });
            state.chains.entry(key).or_default().push(idx);
        }

        state.seen.extend(offered);

        let quarantined = batch.quarantined.len();
        state.quarantine.extend(batch.quarantined);

        let receipt = BatchReceipt {
            job_id: batch.job_id,
            source_id: batch.source_id,
            snapshot_id: SnapshotId::new(seq),
            committed_at: Utc::now(),
            watermark_start: batch.watermark_start,
            watermark_end: batch.watermark_end,
            applied,
            deduplicated,
            quarantined,
        };
        state.seq = seq;
        state.receipts.insert(receipt.job_id, receipt.clone());

        debug!(
            job_id = %receipt.job_id,
            snapshot = %receipt.snapshot_id,
            applied,
            deduplicated,
            quarantined,
            "batch committed"
        );
        Ok(receipt)
    }

    fn committed_batch(&self, job_id: JobId) -> Result<Option<BatchReceipt>, StoreError> {
        Ok(self.read_entities()?.receipts.get(&job_id).cloned())
    }

    fn latest_snapshot_id(&self) -> Result<SnapshotId, StoreError> {
        Ok(SnapshotId::new(self.read_entities()?.seq))
    }

    fn read_snapshot(&self, as_of: DateTime<Utc>) -> Result<Snapshot, StoreError> {
        let state = self.read_entities()?;
        let mut visible = Vec::with_capacity(state.chains.len());

        for chain in state.chains.values() {
            let Some(pos) = chain
                .iter()
                .rposition(|idx| state.versions[*idx].entity.valid_from <= as_of)
            else {
                continue;
            };
            let version = &state.versions[chain[pos]].entity;
            match chain.get(pos + 1) {
                None => visible.push(Arc::clone(version)),
                Some(next) => {
                    let mut closed = (**version).clone();
                    closed.valid_to = Some(state.versions[*next].entity.valid_from);
                    visible.push(Arc::new(closed));
                }
            }
        }

        Ok(Snapshot::new(SnapshotId::new(state.seq), as_of, visible))
    }

    fn versions_since(&self, since: SnapshotId, types: &[EntityType]) -> Result<usize, StoreError> {
        let state = self.read_entities()?;
        Ok(state
            .versions
            .iter()
            .filter(|v| v.seq > since.seq() && types.contains(&v.entity.entity_type))
            .count())
    }

    fn entity_history(
        &self,
        entity_type: EntityType,
        entity_key: &EntityKey,
    ) -> Result<Vec<CanonicalEntity>, StoreError> {
        let state = self.read_entities()?;
        let key = EntityRef {
            entity_type,
            entity_key: entity_key.clone(),
        };
        Ok(state.materialize(state.chain(&key)))
    }

    fn quarantined(&self, source_id: Option<&SourceId>, limit: usize) -> Result<Vec<QuarantinedRecord>, StoreError> {
        let state = self.read_entities()?;
        Ok(state
            .quarantine
            .iter()
            .rev()
            .filter(|q| source_id.is_none_or(|s| &q.record.source_id == s))
            .take(limit)
            .cloned()
            .collect())
    }

    fn quarantine_count(&self, source_id: &SourceId) -> Result<usize, StoreError> {
        let state = self.read_entities()?;
        Ok(state
            .quarantine
            .iter()
            .filter(|q| &q.record.source_id == source_id)
            .count())
    }
}

impl PredictionStore for InMemoryStore {
    fn append_predictions(&self, predictions: Vec<Prediction>) -> Result<(), StoreError> {
        let mut state = self.write_models()?;

        for p in &predictions {
            let Some(artifact) = state.artifacts.get(&p.model_id) else {
                return Err(StoreError::Constraint(format!("unknown model {}", p.model_id)));
            };
            if artifact.model_type != p.model_type {
                return Err(StoreError::Constraint(format!(
                    "model {} is a {} model, prediction says {}",
                    p.model_id, artifact.model_type, p.model_type
                )));
            }
            if !matches!(artifact.status, ArtifactStatus::Ready | ArtifactStatus::Deprecated) {
                return Err(StoreError::Constraint(format!(
                    "model {} was never promoted (status {})",
                    p.model_id,
                    artifact.status.as_str()
                )));
            }
        }

        state.predictions.extend(predictions);
        Ok(())
    }

    fn read_current_predictions(&self, model_type: ModelType) -> Result<Vec<Prediction>, StoreError> {
        let state = self.read_models()?;
        let deprecated: HashSet<ModelId> = state
            .artifacts
            .values()
            .filter(|a| a.model_type == model_type && a.status == ArtifactStatus::Deprecated)
            .map(|a| a.model_id)
            .collect();

        let mut by_key: BTreeMap<&EntityKey, Vec<&Prediction>> = BTreeMap::new();
        for p in state.predictions.iter().filter(|p| p.model_type == model_type) {
            by_key.entry(&p.entity_key).or_default().push(p);
        }

        Ok(by_key
            .values()
            .flat_map(|group| select_current_run(group.iter().copied(), &deprecated))
            .cloned()
            .collect())
    }

    fn predictions_for(
        &self,
        entity_key: &EntityKey,
        model_type: ModelType,
        range: TimeRange,
    ) -> Result<Vec<Prediction>, StoreError> {
        let state = self.read_models()?;
        let mut out: Vec<Prediction> = state
            .predictions
            .iter()
            .filter(|p| p.model_type == model_type && &p.entity_key == entity_key && range.contains(p.predicted_at))
            .cloned()
            .collect();
        out.sort_by_key(|p| (p.predicted_at, p.horizon));
        Ok(out)
    }
}

impl ArtifactRegistry for InMemoryStore {
    fn register_artifact(&self, artifact: ModelArtifact) -> Result<(), StoreError> {
        if artifact.status != ArtifactStatus::Training {
            return Err(StoreError::Constraint(format!(
                "new artifacts start in training, got {}",
                artifact.status.as_str()
            )));
        }
        let mut state = self.write_models()?;
        if state.artifacts.contains_key(&artifact.model_id) {
            return Err(StoreError::Conflict(format!("artifact {} already registered", artifact.model_id)));
        }
        state.artifacts.insert(artifact.model_id, artifact);
        Ok(())
    }

    fn record_training_result(
        &self,
        model_id: ModelId,
        metrics: BTreeMap<String, f64>,
        parameters: JsonValue,
    ) -> Result<ModelArtifact, StoreError> {
        let mut state = self.write_models()?;
        let artifact = state
            .artifacts
            .get_mut(&model_id)
            .ok_or_else(|| StoreError::NotFound(format!("artifact {model_id}")))?;
        if artifact.status != ArtifactStatus::Training {
            return Err(StoreError::Conflict(format!(
                "artifact {model_id} is {}, not training",
                artifact.status.as_str()
            )));
        }
        artifact.metrics = metrics;
        artifact.parameters = parameters;
        Ok(artifact.clone())
    }

    fn mark_training_failed(&self, model_id: ModelId, reason: &str) -> Result<ModelArtifact, StoreError> {
        let mut state = self.write_models()?;
        let artifact = state
            .artifacts
            .get_mut(&model_id)
            .ok_or_else(|| StoreError::NotFound(format!("artifact {model_id}")))?;
        if artifact.status != ArtifactStatus::Training {
            return Err(StoreError::Conflict(format!(
                "artifact {model_id} is {}, not training",
                artifact.status.as_str()
            )));
        }
        artifact.status = ArtifactStatus::TrainingFailed;
        artifact.failure = Some(reason.to_string());
        Ok(artifact.clone())
    }

    fn promote(&self, model_id: ModelId, expected_ready: Option<ModelId>) -> Result<ModelArtifact, StoreError> {
        let mut state = self.write_models()?;

        let candidate = state
            .artifacts
            .get(&model_id)
            .ok_or_else(|| StoreError::NotFound(format!("artifact {model_id}")))?;
        if candidate.status != ArtifactStatus::Training {
            return Err(StoreError::Conflict(format!(
                "artifact {model_id} is {}, only trained candidates can be promoted",
                candidate.status.as_str()
            )));
        }
        if candidate.parameters.is_null() {
            return Err(StoreError::Constraint(format!("artifact {model_id} has no trained parameters")));
        }
        let model_type = candidate.model_type;

        let current = state
            .artifacts
            .values()
            .find(|a| a.model_type == model_type && a.status == ArtifactStatus::Ready)
            .map(|a| a.model_id);
        if current != expected_ready {
            return Err(StoreError::Conflict(format!(
                "ready {model_type} model is {current:?}, expected {expected_ready:?}"
            )));
        }

        if let Some(previous) = current.and_then(|id| state.artifacts.get_mut(&id)) {
            previous.status = ArtifactStatus::Deprecated;
        }
        let promoted = state
            .artifacts
            .get_mut(&model_id)
            .ok_or_else(|| StoreError::NotFound(format!("artifact {model_id}")))?;
        promoted.status = ArtifactStatus::Ready;
        Ok(promoted.clone())
    }

    fn ready_artifact(&self, model_type: ModelType) -> Result<Option<ModelArtifact>, StoreError> {
        Ok(self
            .read_models()?
            .artifacts
            .values()
            .find(|a| a.model_type == model_type && a.status == ArtifactStatus::Ready)
            .cloned())
    }

    fn artifact(&self, model_id: ModelId) -> Result<Option<ModelArtifact>, StoreError> {
        Ok(self.read_models()?.artifacts.get(&model_id).cloned())
    }

    fn artifacts(&self, model_type: ModelType) -> Result<Vec<ModelArtifact>, StoreError> {
        Ok(self
            .read_models()?
            .artifacts
            .values()
            .rev()
            .filter(|a| a.model_type == model_type)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;
    use signalhub_core::{AttrValue, PredictionValue, Provenance, Watermark};

    fn source() -> SourceId {
        SourceId::new("crm").unwrap()
    }

    fn customer(key: &str, tenure: i64, batch_id: BatchId, at: DateTime<Utc>) -> CanonicalEntity {
        CanonicalEntity {
            entity_type: EntityType::Customer,
            entity_key: EntityKey::new(key).unwrap(),
            attributes: BTreeMap::from([("tenure".to_string(), AttrValue::Int(tenure))]),
            extensions: BTreeMap::new(),
            valid_from: at,
            valid_to: None,
            provenance: Provenance {
                source_id: source(),
                batch_id,
                record_ref: key.to_string(),
            },
        }
    }

    fn batch(entities: Vec<CanonicalEntity>) -> CommitBatch {
        CommitBatch {
            job_id: JobId::new(),
            source_id: source(),
            watermark_start: Watermark::ZERO,
            watermark_end: Watermark::new(entities.len() as i64),
            entities,
            quarantined: Vec::new(),
        }
    }

    fn key(k: &str) -> EntityKey {
        EntityKey::new(k).unwrap()
    }

    #[test]
    fn commit_assigns_increasing_sequence_and_snapshot_sees_it() {
        let store = InMemoryStore::new();
        let t = Utc::now();
        let b1 = BatchId::new();

        let r1 = store.commit_batch(batch(vec![customer("a", 1, b1, t)])).unwrap();
        let r2 = store
            .commit_batch(batch(vec![customer("b", 2, BatchId::new(), t)]))
            .unwrap();
        assert_eq!(r1.snapshot_id, SnapshotId::new(1));
        assert_eq!(r2.snapshot_id, SnapshotId::new(2));

        let snap = store.read_snapshot(t).unwrap();
        assert_eq!(snap.snapshot_id(), SnapshotId::new(2));
        assert_eq!(snap.len(), 2);
        assert_eq!(store.committed_batch(r1.job_id).unwrap(), Some(r1));
    }

    #[test]
    fn same_job_cannot_commit_twice() {
        let store = InMemoryStore::new();
        let b = batch(vec![customer("a", 1, BatchId::new(), Utc::now())]);
        store.commit_batch(b.clone()).unwrap();
        assert_eq!(store.commit_batch(b.clone()), Err(StoreError::DuplicateJob(b.job_id)));
    }

    #[test]
    fn replayed_window_is_deduplicated() {
        let store = InMemoryStore::new();
        let t = Utc::now();
        let b = BatchId::new();
        store.commit_batch(batch(vec![customer("a", 1, b, t)])).unwrap();

        // Same window (same batch id) through a new job, later processing time.
        let replay = store
            .commit_batch(batch(vec![customer("a", 1, b, t + Duration::seconds(5))]))
            .unwrap();
        assert_eq!(replay.applied, 0);
        assert_eq!(replay.deduplicated, 1);

        // New window with identical content is not re-applied either.
        let same = store
            .commit_batch(batch(vec![customer("a", 1, BatchId::new(), t + Duration::seconds(9))]))
            .unwrap();
        assert_eq!(same.applied, 0);
        assert_eq!(store.entity_history(EntityType::Customer, &key("a")).unwrap().len(), 1);
    }

    #[test]
    fn new_version_closes_the_previous_one() {
        let store = InMemoryStore::new();
        let t1 = Utc::now();
        let t2 = t1 + Duration::hours(1);
        store.commit_batch(batch(vec![customer("a", 1, BatchId::new(), t1)])).unwrap();
        store.commit_batch(batch(vec![customer("a", 2, BatchId::new(), t2)])).unwrap();

        let history = store.entity_history(EntityType::Customer, &key("a")).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].valid_to, Some(t2));
        assert!(history[1].is_current());

        // Point-in-time reads.
        let before = store.read_snapshot(t1).unwrap();
        let old = before.get(EntityType::Customer, &key("a")).unwrap();
        assert_eq!(old.attr("tenure"), Some(&AttrValue::Int(1)));
        assert_eq!(old.valid_to, Some(t2));

        let now = store.read_snapshot(t2).unwrap();
        assert_eq!(
            now.get(EntityType::Customer, &key("a")).unwrap().attr("tenure"),
            Some(&AttrValue::Int(2))
        );
        assert!(store.read_snapshot(t1 - Duration::hours(1)).unwrap().is_empty());
    }

    #[test]
    fn out_of_order_processing_time_is_clamped() {
        let store = InMemoryStore::new();
        let t = Utc::now();
        store.commit_batch(batch(vec![customer("a", 1, BatchId::new(), t)])).unwrap();
        store
            .commit_batch(batch(vec![customer("a", 2, BatchId::new(), t - Duration::minutes(5))]))
            .unwrap();

        let history = store.entity_history(EntityType::Customer, &key("a")).unwrap();
        assert_eq!(history[1].valid_from, t);
        assert!(history[0].valid_from <= history[1].valid_from);
    }

    #[test]
    fn last_version_in_a_batch_wins() {
        let store = InMemoryStore::new();
        let t = Utc::now();
        let b = BatchId::new();
        let receipt = store
            .commit_batch(batch(vec![customer("a", 1, b, t), customer("a", 7, b, t)]))
            .unwrap();
        assert_eq!(receipt.applied, 1);
        assert_eq!(receipt.deduplicated, 1);
        let snap = store.read_snapshot(t).unwrap();
        assert_eq!(
            snap.get(EntityType::Customer, &key("a")).unwrap().attr("tenure"),
            Some(&AttrValue::Int(7))
        );
    }

    #[test]
    fn injected_fault_leaves_no_partial_writes() {
        let store = InMemoryStore::new();
        let t = Utc::now();
        store.inject_commit_fault(CommitFault::storage(1));

        let b = batch(vec![
            customer("a", 1, BatchId::new(), t),
            customer("b", 2, BatchId::new(), t),
        ]);
        let err = store.commit_batch(b.clone()).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.version_count(), 0);
        assert_eq!(store.latest_snapshot_id().unwrap(), SnapshotId::EMPTY);
        assert_eq!(store.committed_batch(b.job_id).unwrap(), None);

        // The fault is consumed; the retry lands.
        assert_eq!(store.commit_batch(b).unwrap().applied, 2);
    }

    #[test]
    fn snapshot_is_stable_while_commits_continue() {
        let store = InMemoryStore::new();
        let t = Utc::now();
        store.commit_batch(batch(vec![customer("a", 1, BatchId::new(), t)])).unwrap();
        let snap = store.read_snapshot(t + Duration::hours(2)).unwrap();

        store
            .commit_batch(batch(vec![customer("a", 2, BatchId::new(), t + Duration::hours(1))]))
            .unwrap();
        store
            .commit_batch(batch(vec![customer("b", 1, BatchId::new(), t)]))
            .unwrap();

        assert_eq!(snap.len(), 1);
        assert_eq!(
            snap.get(EntityType::Customer, &key("a")).unwrap().attr("tenure"),
            Some(&AttrValue::Int(1))
        );
        assert_eq!(store.versions_since(snap.snapshot_id(), &[EntityType::Customer]).unwrap(), 2);
        assert_eq!(store.versions_since(snap.snapshot_id(), &[EntityType::SalesRecord]).unwrap(), 0);
    }

    fn ready_model(store: &InMemoryStore, model_type: ModelType) -> ModelId {
        let artifact = ModelArtifact::training(model_type, SnapshotId::new(1), Utc::now());
        let id = artifact.model_id;
        let expected = store.ready_artifact(model_type).unwrap().map(|a| a.model_id);
        store.register_artifact(artifact).unwrap();
        store
            .record_training_result(id, BTreeMap::from([("accuracy".to_string(), 0.8)]), serde_json::json!({"w": [1]}))
            .unwrap();
        store.promote(id, expected).unwrap();
        id
    }

    fn churn_prediction(model_id: ModelId, at: DateTime<Utc>, p: f64) -> Prediction {
        Prediction {
            entity_key: key("c-1"),
            model_id,
            model_type: ModelType::Churn,
            predicted_at: at,
            value: PredictionValue::Probability { p },
            horizon: None,
            snapshot_id: SnapshotId::new(1),
        }
    }

    #[test]
    fn promotion_is_compare_and_set() {
        let store = InMemoryStore::new();
        let first = ready_model(&store, ModelType::Churn);

        let candidate = ModelArtifact::training(ModelType::Churn, SnapshotId::new(2), Utc::now());
        let cid = candidate.model_id;
        store.register_artifact(candidate).unwrap();

        // Untrained candidates cannot be promoted.
        assert!(matches!(store.promote(cid, Some(first)), Err(StoreError::Constraint(_))));

        store
            .record_training_result(cid, BTreeMap::new(), serde_json::json!({"w": [2]}))
            .unwrap();
        // Stale expectation.
        assert!(matches!(store.promote(cid, None), Err(StoreError::Conflict(_))));
        assert_eq!(store.ready_artifact(ModelType::Churn).unwrap().unwrap().model_id, first);

        store.promote(cid, Some(first)).unwrap();
        assert_eq!(store.ready_artifact(ModelType::Churn).unwrap().unwrap().model_id, cid);
        assert_eq!(
            store.artifact(first).unwrap().unwrap().status,
            ArtifactStatus::Deprecated
        );
        assert_eq!(store.artifacts(ModelType::Churn).unwrap()[0].model_id, cid);
    }

    #[test]
    fn failed_candidates_cannot_be_promoted() {
        let store = InMemoryStore::new();
        let candidate = ModelArtifact::training(ModelType::Forecast, SnapshotId::new(1), Utc::now());
        let id = candidate.model_id;
        store.register_artifact(candidate).unwrap();
        let failed = store.mark_training_failed(id, "insufficient data").unwrap();
        assert_eq!(failed.status, ArtifactStatus::TrainingFailed);
        assert_eq!(failed.failure.as_deref(), Some("insufficient data"));
        assert!(matches!(store.promote(id, None), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn current_prediction_prefers_live_models_then_latest() {
        let store = InMemoryStore::new();
        let old = ready_model(&store, ModelType::Churn);
        let t1 = Utc::now();
        let t2 = t1 + Duration::seconds(10);

        store.append_prediction(churn_prediction(old, t1, 0.2)).unwrap();
        store.append_prediction(churn_prediction(old, t2, 0.4)).unwrap();
        let current = store.read_current_predictions(ModelType::Churn).unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].predicted_at, t2);

        // A newer model takes over even though the old one scored later.
        let live = ready_model(&store, ModelType::Churn);
        store.append_prediction(churn_prediction(live, t1 + Duration::seconds(5), 0.9)).unwrap();
        let current = store.read_current_predictions(ModelType::Churn).unwrap();
        assert_eq!(current[0].model_id, live);

        let history = store
            .predictions_for(&key("c-1"), ModelType::Churn, TimeRange::all())
            .unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.windows(2).all(|w| w[0].predicted_at <= w[1].predicted_at));
    }

    #[test]
    fn predictions_require_a_promoted_model() {
        let store = InMemoryStore::new();
        let stray = ModelId::new();
        assert!(matches!(
            store.append_prediction(churn_prediction(stray, Utc::now(), 0.5)),
            Err(StoreError::Constraint(_))
        ));

        let ready = ready_model(&store, ModelType::Churn);
        let batch = vec![
            churn_prediction(ready, Utc::now(), 0.5),
            churn_prediction(stray, Utc::now(), 0.5),
        ];
        assert!(store.append_predictions(batch).is_err());
        assert!(store.read_current_predictions(ModelType::Churn).unwrap().is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

        /// Arbitrary commit sequences keep exactly one open version per key,
        /// and replaying every batch changes nothing.
        #[test]
        fn chains_stay_well_formed_and_replay_is_idempotent(
            commits in prop::collection::vec(
                prop::collection::vec((0usize..4, 0i64..3, -30i64..30), 1..5),
                1..12,
            )
        ) {
            let store = InMemoryStore::new();
            let base = Utc::now();
            let mut batches = Vec::new();

            for rows in &commits {
                let batch_id = BatchId::new();
                let entities = rows
                    .iter()
                    .map(|(k, tenure, offset)| {
                        customer(&format!("k{k}"), *tenure, batch_id, base + Duration::seconds(*offset))
                    })
                    .collect();
                let b = batch(entities);
                store.commit_batch(b.clone()).unwrap();
                batches.push(b);
            }

            let before = store.read_snapshot(base + Duration::days(1)).unwrap();

            for b in &batches {
                let mut replay = b.clone();
                replay.job_id = JobId::new();
                let receipt = store.commit_batch(replay).unwrap();
                prop_assert_eq!(receipt.applied, 0);
            }

            for k in 0..4 {
                let history = store.entity_history(EntityType::Customer, &key(&format!("k{k}"))).unwrap();
                let open = history.iter().filter(|v| v.valid_to.is_none()).count();
                prop_assert!(history.is_empty() || open == 1);
                prop_assert!(history.windows(2).all(|w| w[0].valid_from <= w[1].valid_from));
            }

            let after = store.read_snapshot(base + Duration::days(1)).unwrap();
            let a: Vec<_> = before.entities().map(|e| (e.entity_key.clone(), e.attributes.clone())).collect();
            let b: Vec<_> = after.entities().map(|e| (e.entity_key.clone(), e.attributes.clone())).collect();
            prop_assert_eq!(a, b);
        }
    }
}
