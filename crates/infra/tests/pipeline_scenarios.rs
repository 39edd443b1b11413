//! End-to-end scenarios: connector → normalizer → store → scheduler → feed.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::json;

use signalhub_connectors::{ConnectorRegistry, CsvConnector, CsvConnectorConfig, InMemoryConnector};
use signalhub_core::{
    ArtifactStatus, AttrValue, CanonicalEntity, EntityKey, EntityType, JobId, ModelArtifact, ModelId, ModelType,
    Prediction, SnapshotId, SourceId, TimeRange, Watermark,
};
use signalhub_infra::alerts::{AlertKind, InMemoryAlertSink};
use signalhub_infra::ledger::{InMemoryJobLedger, JobLedger, JobStatus, RetryPolicy};
use signalhub_infra::pipeline::{IngestionPipeline, PipelineConfig};
use signalhub_infra::scheduler::{ModelScheduler, SchedulerConfig, SchedulerError};
use signalhub_infra::store::{
    ArtifactRegistry, BatchReceipt, CommitBatch, CommitFault, EntityStore, InMemoryStore, PredictionStore,
    QuarantinedRecord, Snapshot, StoreError,
};
use signalhub_infra::InsightFeed;
use signalhub_models::{BackendRegistry, ChurnBackend};
use signalhub_normalizer::{FieldSpec, FieldType, Normalizer, SourceMapping};

struct Harness {
    source: SourceId,
    feed: Arc<InMemoryConnector>,
    store: Arc<InMemoryStore>,
    ledger: Arc<InMemoryJobLedger>,
    alerts: Arc<InMemoryAlertSink>,
    pipeline: IngestionPipeline,
}

fn harness() -> Harness {
    let source = SourceId::new("telco").unwrap();
    let feed = Arc::new(InMemoryConnector::new());
    let store = InMemoryStore::arc();
    let ledger = InMemoryJobLedger::arc();
    let alerts = Arc::new(InMemoryAlertSink::new());

    let mapping = SourceMapping::new(EntityType::Customer, ["customerID"])
        .field(FieldSpec::new("tenure", FieldType::Int).required())
        .field(FieldSpec::new("MonthlyCharges", FieldType::Float).target("monthly_charges"))
        .field(FieldSpec::new("Contract", FieldType::Text).target("contract"))
        .field(FieldSpec::new("Churn", FieldType::Bool).target("churn"));

    let pipeline = IngestionPipeline::new(
        ConnectorRegistry::new().with(source.clone(), feed.clone()),
        Normalizer::new().with(source.clone(), mapping),
        store.clone(),
        ledger.clone(),
        alerts.clone(),
        PipelineConfig {
            retry: RetryPolicy::fixed(3, std::time::Duration::from_millis(1)),
            ..PipelineConfig::default()
        },
    );

    Harness {
        source,
        feed,
        store,
        ledger,
        alerts,
        pipeline,
    }
}

fn customer(i: u64) -> serde_json::Value {
    let churns = i % 2 == 0;
    json!({
        "customerID": format!("C{i:03}"),
        "tenure": if churns { 1 + i % 4 } else { 40 + i % 20 },
        "MonthlyCharges": if churns { 90.0 } else { 35.0 },
        "Contract": if churns { "Month-to-month" } else { "Two year" },
        "Churn": churns,
    })
}

fn push_customers(h: &Harness, range: std::ops::RangeInclusive<u64>) {
    for i in range {
        h.feed.push(Watermark::from_offset(i), customer(i));
    }
}

#[test]
fn invalid_record_is_quarantined_and_job_succeeds() {
    let h = harness();
    h.feed.push(Watermark::from_offset(1), customer(1));
    h.feed
        .push(Watermark::from_offset(2), json!({"customerID": "C002", "Contract": "One year"}));

    let job = h.pipeline.ingest(&h.source).unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.watermark_end, Some(Watermark::from_offset(2)));
    assert_eq!(job.stats.applied, 1);
    assert_eq!(job.stats.quarantined, 1);

    assert_eq!(h.store.version_count(), 1);
    let quarantined = h.store.quarantined(Some(&h.source), 10).unwrap();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].record.record_ref, "pos:2");
    assert_eq!(quarantined[0].field.as_deref(), Some("tenure"));
    assert_eq!(h.alerts.count(AlertKind::RecordsQuarantined), 1);
}

#[test]
fn commit_fault_leaves_store_untouched_and_retries() {
    let h = harness();
    push_customers(&h, 1..=4);
    h.store.inject_commit_fault(CommitFault::storage(2));

    let job = h.pipeline.begin_job(&h.source).unwrap();
    let job = h.pipeline.attempt(job.job_id).unwrap();
    assert_eq!(job.status, JobStatus::Retrying);
    assert_eq!(h.store.version_count(), 0);
    assert_eq!(h.store.latest_snapshot_id().unwrap().seq(), 0);
    assert_eq!(h.ledger.next_watermark(&h.source).unwrap(), Watermark::ZERO);

    let job = h.pipeline.attempt(job.job_id).unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.attempt_count, 2);
    assert_eq!(h.store.version_count(), 4);
    assert_eq!(h.ledger.next_watermark(&h.source).unwrap(), Watermark::from_offset(4));
}

#[test]
fn reprocessing_a_window_is_idempotent() {
    let h = harness();
    push_customers(&h, 1..=5);
    h.pipeline.ingest(&h.source).unwrap();
    let before = h.store.read_snapshot(chrono::Utc::now()).unwrap();

    let job = h.pipeline.reprocess(&h.source, Watermark::ZERO).unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert!(job.reprocess);
    assert_eq!(job.stats.applied, 0);
    assert_eq!(job.stats.deduplicated, 5);

    let after = h.store.read_snapshot(chrono::Utc::now()).unwrap();
    let keys = |s: &signalhub_infra::Snapshot| {
        s.entities()
            .map(|e| (e.entity_key.clone(), e.valid_from, e.attributes.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(keys(&before), keys(&after));
    assert_eq!(h.store.version_count(), 5);
    // Reprocessing does not move the chain.
    assert_eq!(h.ledger.next_watermark(&h.source).unwrap(), Watermark::from_offset(5));
}

#[test]
fn succeeded_jobs_form_a_gap_free_chain() {
    let h = harness();
    for chunk in 0..3u64 {
        push_customers(&h, chunk * 3 + 1..=chunk * 3 + 3);
        let job = h.pipeline.ingest(&h.source).unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
    }
    // Nothing new: the next job is discarded.
    assert_eq!(h.pipeline.ingest(&h.source).unwrap().status, JobStatus::Discarded);

    let mut chain: Vec<_> = h
        .ledger
        .jobs_for(&h.source, 100)
        .unwrap()
        .into_iter()
        .filter(|j| j.in_chain())
        .collect();
    chain.reverse();
    assert_eq!(chain.len(), 3);
    let mut expected_start = Watermark::ZERO;
    for job in &chain {
        assert_eq!(job.watermark_start, expected_start);
        let end = job.watermark_end.unwrap();
        assert!(end > job.watermark_start);
        expected_start = end;
    }
    assert_eq!(expected_start, Watermark::from_offset(9));
}

#[test]
fn market_quotes_csv_is_keyed_by_ticker_and_date() {
    let source = SourceId::new("market_quotes").unwrap();
    let mut csv = CsvConnectorConfig::new(concat!(env!("CARGO_MANIFEST_DIR"), "/../../data/market_quotes.csv"));
    csv.required_columns = ["ticker", "date", "open", "close", "volume"].map(String::from).to_vec();
    let mapping = SourceMapping::new(EntityType::MarketIndicator, ["ticker", "date"])
        .field(FieldSpec::new("ticker", FieldType::Text).required())
        .field(FieldSpec::new("date", FieldType::Date).required())
        .field(FieldSpec::new("open", FieldType::Float).required())
        .field(FieldSpec::new("close", FieldType::Float).required())
        .field(FieldSpec::new("volume", FieldType::Float));

    let store = InMemoryStore::arc();
    let pipeline = IngestionPipeline::new(
        ConnectorRegistry::new().with(source.clone(), Arc::new(CsvConnector::new(csv))),
        Normalizer::new().with(source.clone(), mapping),
        store.clone(),
        InMemoryJobLedger::arc(),
        Arc::new(InMemoryAlertSink::new()),
        PipelineConfig::default(),
    );

    let job = pipeline.ingest(&source).unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.stats.pulled, 40);
    assert_eq!(job.stats.applied, 40);
    assert_eq!(job.stats.quarantined, 0);

    let snapshot = store.read_snapshot(Utc::now()).unwrap();
    assert_eq!(snapshot.of_types(&[EntityType::MarketIndicator]).count(), 40);
    let quote = snapshot
        .get(EntityType::MarketIndicator, &EntityKey::new("VZ:2026-01-02").unwrap())
        .unwrap();
    assert_eq!(quote.attr("ticker"), Some(&AttrValue::Text("VZ".to_string())));
    assert_eq!(quote.attr("date"), Some(&AttrValue::Date(NaiveDate::from_ymd_opt(2026, 1, 2).unwrap())));
    assert_eq!(quote.attr("open"), Some(&AttrValue::Float(40.01)));
    assert_eq!(quote.attr("close"), Some(&AttrValue::Float(39.45)));
    assert_eq!(quote.attr("volume"), Some(&AttrValue::Float(15_621_426.0)));
    assert!(snapshot.get(EntityType::MarketIndicator, &EntityKey::new("VZ").unwrap()).is_none());
}

/// Holds the first commit until a second one arrives, then lets the first
/// land before the second reaches the inner store.
struct LateCommitStore {
    inner: Arc<InMemoryStore>,
    calls: AtomicUsize,
    gate: Barrier,
}

impl EntityStore for LateCommitStore {
    fn commit_batch(&self, batch: CommitBatch) -> Result<BatchReceipt, StoreError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.gate.wait();
            let landed = self.inner.commit_batch(batch);
            self.gate.wait();
            landed
        } else {
            self.gate.wait();
            self.gate.wait();
            self.inner.commit_batch(batch)
        }
    }

    fn committed_batch(&self, job_id: JobId) -> Result<Option<BatchReceipt>, StoreError> {
        self.inner.committed_batch(job_id)
    }

    fn latest_snapshot_id(&self) -> Result<SnapshotId, StoreError> {
        self.inner.latest_snapshot_id()
    }

    fn read_snapshot(&self, as_of: DateTime<Utc>) -> Result<Snapshot, StoreError> {
        self.inner.read_snapshot(as_of)
    }

    fn versions_since(&self, since: SnapshotId, types: &[EntityType]) -> Result<usize, StoreError> {
        self.inner.versions_since(since, types)
    }

    fn entity_history(&self, entity_type: EntityType, entity_key: &EntityKey) -> Result<Vec<CanonicalEntity>, StoreError> {
        self.inner.entity_history(entity_type, entity_key)
    }

    fn quarantined(&self, source_id: Option<&SourceId>, limit: usize) -> Result<Vec<QuarantinedRecord>, StoreError> {
        self.inner.quarantined(source_id, limit)
    }

    fn quarantine_count(&self, source_id: &SourceId) -> Result<usize, StoreError> {
        self.inner.quarantine_count(source_id)
    }
}

impl PredictionStore for LateCommitStore {
    fn append_predictions(&self, predictions: Vec<Prediction>) -> Result<(), StoreError> {
        self.inner.append_predictions(predictions)
    }

    fn read_current_predictions(&self, model_type: ModelType) -> Result<Vec<Prediction>, StoreError> {
        self.inner.read_current_predictions(model_type)
    }

    fn predictions_for(
        &self,
        entity_key: &EntityKey,
        model_type: ModelType,
        range: TimeRange,
    ) -> Result<Vec<Prediction>, StoreError> {
        self.inner.predictions_for(entity_key, model_type, range)
    }
}

impl ArtifactRegistry for LateCommitStore {
    fn register_artifact(&self, artifact: ModelArtifact) -> Result<(), StoreError> {
        self.inner.register_artifact(artifact)
    }

    fn record_training_result(
        &self,
        model_id: ModelId,
        metrics: BTreeMap<String, f64>,
        parameters: serde_json::Value,
    ) -> Result<ModelArtifact, StoreError> {
        self.inner.record_training_result(model_id, metrics, parameters)
    }

    fn mark_training_failed(&self, model_id: ModelId, reason: &str) -> Result<ModelArtifact, StoreError> {
        self.inner.mark_training_failed(model_id, reason)
    }

    fn promote(&self, model_id: ModelId, expected_ready: Option<ModelId>) -> Result<ModelArtifact, StoreError> {
        self.inner.promote(model_id, expected_ready)
    }

    fn ready_artifact(&self, model_type: ModelType) -> Result<Option<ModelArtifact>, StoreError> {
        self.inner.ready_artifact(model_type)
    }

    fn artifact(&self, model_id: ModelId) -> Result<Option<ModelArtifact>, StoreError> {
        self.inner.artifact(model_id)
    }

    fn artifacts(&self, model_type: ModelType) -> Result<Vec<ModelArtifact>, StoreError> {
        self.inner.artifacts(model_type)
    }

    fn deprecated_ids(&self, model_type: ModelType) -> Result<HashSet<ModelId>, StoreError> {
        self.inner.deprecated_ids(model_type)
    }
}

#[test]
fn commit_landing_after_timeout_is_adopted_by_the_retry() {
    let h = harness();
    push_customers(&h, 1..=4);
    let store = Arc::new(LateCommitStore {
        inner: h.store.clone(),
        calls: AtomicUsize::new(0),
        gate: Barrier::new(2),
    });
    let pipeline = IngestionPipeline::new(
        ConnectorRegistry::new().with(h.source.clone(), h.feed.clone()),
        Normalizer::new().with(
            h.source.clone(),
            SourceMapping::new(EntityType::Customer, ["customerID"]).field(FieldSpec::new("tenure", FieldType::Int).required()),
        ),
        store.clone(),
        h.ledger.clone(),
        h.alerts.clone(),
        PipelineConfig {
            retry: RetryPolicy::fixed(3, Duration::from_millis(1)),
            commit_timeout: Duration::from_millis(50),
            ..PipelineConfig::default()
        },
    );

    let job = pipeline.ingest(&h.source).unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.attempt_count, 2);
    assert_eq!(job.stats.pulled, 4);
    assert_eq!(job.stats.applied, job.stats.pulled);
    assert_eq!(store.calls.load(Ordering::SeqCst), 2);

    // Only the first commit landed.
    assert_eq!(h.store.latest_snapshot_id().unwrap().seq(), 1);
    assert_eq!(h.store.version_count(), 4);
    let receipt = h.store.committed_batch(job.job_id).unwrap().unwrap();
    assert_eq!(receipt.applied, 4);
    assert_eq!(h.ledger.next_watermark(&h.source).unwrap(), Watermark::from_offset(4));
}

fn scheduler(h: &Harness, metric_floor: f64) -> ModelScheduler {
    ModelScheduler::new(
        h.store.clone(),
        BackendRegistry::new().with(Arc::new(ChurnBackend::default())),
        h.alerts.clone(),
        SchedulerConfig {
            metric_floor,
            ..SchedulerConfig::default()
        },
    )
}

#[test]
fn latest_scoring_run_is_current() {
    let h = harness();
    push_customers(&h, 1..=40);
    h.pipeline.ingest(&h.source).unwrap();

    let scheduler = scheduler(&h, 0.0);
    scheduler.train(ModelType::Churn).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    let second = scheduler.score(ModelType::Churn).unwrap();
    assert_eq!(second.len(), 40);

    let feed = InsightFeed::new(h.store.clone());
    let key = EntityKey::new("C001").unwrap();
    let current = feed.get_current_prediction(&key, ModelType::Churn).unwrap().unwrap();
    assert_eq!(current.predicted_at, second[0].predicted_at);

    let history = feed
        .get_prediction_history(&key, ModelType::Churn, signalhub_core::TimeRange::all())
        .unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].predicted_at < history[1].predicted_at);
}

#[test]
fn candidate_below_floor_keeps_ready_model_scoring() {
    let h = harness();
    push_customers(&h, 1..=40);
    h.pipeline.ingest(&h.source).unwrap();

    let first = scheduler(&h, 0.0).train(ModelType::Churn).unwrap();
    assert_eq!(first.status, ArtifactStatus::Ready);

    // No candidate can reach a floor above 1.0.
    let strict = scheduler(&h, 1.01);
    let err = strict.train(ModelType::Churn).unwrap_err();
    assert!(matches!(err, SchedulerError::MetricRegression { .. }));

    let ready = h.store.ready_artifact(ModelType::Churn).unwrap().unwrap();
    assert_eq!(ready.model_id, first.model_id);
    let newest = h.store.artifacts(ModelType::Churn).unwrap().remove(0);
    assert_eq!(newest.status, ArtifactStatus::TrainingFailed);
    assert_eq!(h.alerts.count(AlertKind::MetricRegression), 1);

    let run = strict.score(ModelType::Churn).unwrap();
    assert!(!run.is_empty());
    assert!(run.iter().all(|p| p.model_id == first.model_id));
}
