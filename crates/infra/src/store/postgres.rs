//! Postgres-backed centralized store.
//!
//! Entity versions are append-only rows; `valid_to` is never stored and is
//! derived with `LEAD(valid_from)` over each chain. Commits are serialized with
//! a transaction-scoped advisory lock so the commit sequence has no gaps.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (foreign key / check violation) | `23503`, `23514` | `Constraint` |
//! | Database (serialization failure / deadlock) | `40001`, `40P01` | `Conflict` |
//! | PoolTimedOut | N/A | `Timeout` |
//! | Other | Any other | `Storage` |
//!
//! ## Runtime
//!
//! The store traits are synchronous. Calls block on the `tokio` handle given at
//! construction, so they must come from plain threads or `spawn_blocking`,
//! never from inside an async task.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tokio::runtime::Handle;
use tracing::{debug, instrument, warn};

use signalhub_core::{
    ArtifactStatus, AttrValue, BatchId, CanonicalEntity, EntityKey, EntityType, JobId, ModelArtifact,
    ModelId, ModelType, Prediction, PredictionValue, Provenance, SnapshotId, SourceId, SourceRecord,
    TimeRange, Watermark,
};

use super::collapse_batch;
use super::r#trait::{
    ArtifactRegistry, BatchReceipt, CommitBatch, EntityStore, PredictionStore, QuarantinedRecord,
    Snapshot, StoreError,
};

/// Advisory lock key serializing batch commits.
const COMMIT_LOCK_KEY: i64 = 0x5348_0001;

/// Idempotent schema bootstrap.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS commit_batches (
    seq             BIGINT PRIMARY KEY,
    job_id          UUID NOT NULL UNIQUE,
    source_id       TEXT NOT NULL,
    committed_at    TIMESTAMPTZ NOT NULL,
    watermark_start BIGINT NOT NULL,
    watermark_end   BIGINT NOT NULL,
    applied         BIGINT NOT NULL,
    deduplicated    BIGINT NOT NULL,
    quarantined     BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS entity_versions (
    version_id  BIGSERIAL PRIMARY KEY,
    seq         BIGINT NOT NULL REFERENCES commit_batches (seq),
    entity_type TEXT NOT NULL,
    entity_key  TEXT NOT NULL,
    attributes  JSONB NOT NULL,
    extensions  JSONB NOT NULL,
    valid_from  TIMESTAMPTZ NOT NULL,
    source_id   TEXT NOT NULL,
    batch_id    UUID NOT NULL,
    record_ref  TEXT NOT NULL,
    UNIQUE (entity_type, entity_key, batch_id)
);
CREATE INDEX IF NOT EXISTS entity_versions_chain ON entity_versions (entity_type, entity_key, seq);

CREATE TABLE IF NOT EXISTS entity_batches (
    entity_type TEXT NOT NULL,
    entity_key  TEXT NOT NULL,
    batch_id    UUID NOT NULL,
    PRIMARY KEY (entity_type, entity_key, batch_id)
);

CREATE TABLE IF NOT EXISTS quarantined_records (
    id             BIGSERIAL PRIMARY KEY,
    job_id         UUID NOT NULL,
    source_id      TEXT NOT NULL,
    record         JSONB NOT NULL,
    error          TEXT NOT NULL,
    field          TEXT,
    quarantined_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS quarantined_records_source ON quarantined_records (source_id, id);

CREATE TABLE IF NOT EXISTS model_artifacts (
    model_id             UUID PRIMARY KEY,
    model_type           TEXT NOT NULL,
    trained_at           TIMESTAMPTZ NOT NULL,
    training_snapshot_id BIGINT NOT NULL,
    metrics              JSONB NOT NULL,
    status               TEXT NOT NULL,
    parameters           JSONB NOT NULL,
    failure              TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS model_artifacts_one_ready
    ON model_artifacts (model_type) WHERE status = 'ready';

CREATE TABLE IF NOT EXISTS predictions (
    id           BIGSERIAL PRIMARY KEY,
    model_id     UUID NOT NULL REFERENCES model_artifacts (model_id),
    model_type   TEXT NOT NULL,
    entity_key   TEXT NOT NULL,
    predicted_at TIMESTAMPTZ NOT NULL,
    value        JSONB NOT NULL,
    horizon      INTEGER,
    snapshot_id  BIGINT NOT NULL
);
CREATE INDEX IF NOT EXISTS predictions_lookup ON predictions (model_type, entity_key, predicted_at);
"#;

const VERSION_COLUMNS: &str = r#"
    entity_type, entity_key, attributes, extensions, valid_from,
    LEAD(valid_from) OVER (PARTITION BY entity_type, entity_key ORDER BY seq, version_id) AS valid_to,
    source_id, batch_id, record_ref, seq
"#;

/// Postgres implementation of the centralized store.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    #[instrument(skip(self, batch), fields(job_id = %batch.job_id, source_id = %batch.source_id), err)]
    pub async fn commit_batch_async(&self, batch: CommitBatch) -> Result<BatchReceipt, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(COMMIT_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("commit_lock", e))?;

        let existing: Option<i64> = sqlx::query_scalar("SELECT seq FROM commit_batches WHERE job_id = $1")
            .bind(batch.job_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("check_duplicate_job", e))?;
        if existing.is_some() {
            return Err(StoreError::DuplicateJob(batch.job_id));
        }

        let seq: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) + 1 FROM commit_batches")
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("next_seq", e))?;
        let committed_at = Utc::now();

        // The receipt row goes first so version rows can reference it; counts
        // are filled in once staging is done.
        sqlx::query(
            r#"
            INSERT INTO commit_batches (
                seq, job_id, source_id, committed_at, watermark_start, watermark_end,
                applied, deduplicated, quarantined
            )
            VALUES ($1, $2, $3, $4, $5, $6, 0, 0, 0)
            "#,
        )
        .bind(seq)
        .bind(batch.job_id.as_uuid())
        .bind(batch.source_id.as_str())
        .bind(committed_at)
        .bind(batch.watermark_start.value())
        .bind(batch.watermark_end.value())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_commit_batch", e))?;

        let (entities, mut deduplicated) = collapse_batch(batch.entities);
        let mut applied = 0usize;
        for entity in entities {
            if stage_version(&mut tx, seq, entity).await? {
                applied += 1;
            } else {
                deduplicated += 1;
            }
        }

        let quarantined = batch.quarantined.len();
        for q in &batch.quarantined {
            let record = serde_json::to_value(&q.record)
                .map_err(|e| StoreError::Storage(format!("serialize quarantined record: {e}")))?;
            sqlx::query(
                r#"
                INSERT INTO quarantined_records (job_id, source_id, record, error, field, quarantined_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(q.job_id.as_uuid())
            .bind(q.record.source_id.as_str())
            .bind(record)
            .bind(&q.error)
            .bind(q.field.as_deref())
            .bind(q.quarantined_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_quarantined", e))?;
        }

        sqlx::query("UPDATE commit_batches SET applied = $2, deduplicated = $3, quarantined = $4 WHERE seq = $1")
            .bind(seq)
            .bind(applied as i64)
            .bind(deduplicated as i64)
            .bind(quarantined as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_commit_batch", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        debug!(seq, applied, deduplicated, quarantined, "batch committed");
        Ok(BatchReceipt {
            job_id: batch.job_id,
            source_id: batch.source_id,
            snapshot_id: SnapshotId::new(seq as u64),
            committed_at,
            watermark_start: batch.watermark_start,
            watermark_end: batch.watermark_end,
            applied,
            deduplicated,
            quarantined,
        })
    }

    pub async fn committed_batch_async(&self, job_id: JobId) -> Result<Option<BatchReceipt>, StoreError> {
        let row = sqlx::query_as::<_, CommitBatchRow>(
            r#"
            SELECT seq, job_id, source_id, committed_at, watermark_start, watermark_end,
                   applied, deduplicated, quarantined
            FROM commit_batches
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("committed_batch", e))?;
        row.map(CommitBatchRow::into_receipt).transpose()
    }

    pub async fn latest_snapshot_id_async(&self) -> Result<SnapshotId, StoreError> {
        let seq: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM commit_batches")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("latest_snapshot_id", e))?;
        Ok(SnapshotId::new(seq as u64))
    }

    #[instrument(skip(self), err)]
    pub async fn read_snapshot_async(&self, as_of: DateTime<Utc>) -> Result<Snapshot, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_isolation", e))?;

        let seq: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM commit_batches")
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("snapshot_seq", e))?;

        let rows = sqlx::query_as::<_, VersionRow>(&format!(
            r#"
            SELECT * FROM (SELECT {VERSION_COLUMNS} FROM entity_versions WHERE seq <= $1) chain
            WHERE valid_from <= $2 AND (valid_to IS NULL OR valid_to > $2)
            "#
        ))
        .bind(seq)
        .bind(as_of)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("read_snapshot", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        let entities = rows
            .into_iter()
            .map(|r| r.into_entity().map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Snapshot::new(SnapshotId::new(seq as u64), as_of, entities))
    }

    pub async fn versions_since_async(&self, since: SnapshotId, types: &[EntityType]) -> Result<usize, StoreError> {
        let types: Vec<&str> = types.iter().map(EntityType::as_str).collect();
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM entity_versions WHERE seq > $1 AND entity_type = ANY($2)",
        )
        .bind(since.seq() as i64)
        .bind(&types)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("versions_since", e))?;
        Ok(count as usize)
    }

    pub async fn entity_history_async(
        &self,
        entity_type: EntityType,
        entity_key: &EntityKey,
    ) -> Result<Vec<CanonicalEntity>, StoreError> {
        let rows = sqlx::query_as::<_, VersionRow>(&format!(
            r#"
            SELECT {VERSION_COLUMNS} FROM entity_versions
            WHERE entity_type = $1 AND entity_key = $2
            ORDER BY seq, version_id
            "#
        ))
        .bind(entity_type.as_str())
        .bind(entity_key.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("entity_history", e))?;
        rows.into_iter().map(VersionRow::into_entity).collect()
    }

    pub async fn quarantined_async(
        &self,
        source_id: Option<&SourceId>,
        limit: usize,
    ) -> Result<Vec<QuarantinedRecord>, StoreError> {
        let rows = sqlx::query_as::<_, QuarantineRow>(
            r#"
            SELECT job_id, record, error, field, quarantined_at
            FROM quarantined_records
            WHERE $1::TEXT IS NULL OR source_id = $1
            ORDER BY id DESC
            LIMIT $2
            "#,
        )
        .bind(source_id.map(SourceId::as_str))
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("quarantined", e))?;
        rows.into_iter().map(QuarantineRow::into_record).collect()
    }

    pub async fn quarantine_count_async(&self, source_id: &SourceId) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM quarantined_records WHERE source_id = $1")
            .bind(source_id.as_str())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("quarantine_count", e))?;
        Ok(count as usize)
    }

    #[instrument(skip(self, predictions), fields(count = predictions.len()), err)]
    pub async fn append_predictions_async(&self, predictions: Vec<Prediction>) -> Result<(), StoreError> {
        if predictions.is_empty() {
            return Ok(());
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let ids: Vec<uuid::Uuid> = predictions
            .iter()
            .map(|p| *p.model_id.as_uuid())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let models: Vec<(uuid::Uuid, String, String)> =
            sqlx::query_as("SELECT model_id, model_type, status FROM model_artifacts WHERE model_id = ANY($1)")
                .bind(&ids)
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("check_models", e))?;

        for p in &predictions {
            let Some((_, model_type, status)) = models.iter().find(|(id, _, _)| id == p.model_id.as_uuid()) else {
                return Err(StoreError::Constraint(format!("unknown model {}", p.model_id)));
            };
            if model_type != p.model_type.as_str() {
                return Err(StoreError::Constraint(format!(
                    "model {} is a {model_type} model, prediction says {}",
                    p.model_id, p.model_type
                )));
            }
            if !matches!(
                ArtifactStatus::parse(status),
                Some(ArtifactStatus::Ready | ArtifactStatus::Deprecated)
            ) {
                return Err(StoreError::Constraint(format!(
                    "model {} was never promoted (status {status})",
                    p.model_id
                )));
            }
        }

        for p in &predictions {
            let value = serde_json::to_value(&p.value)
                .map_err(|e| StoreError::Storage(format!("serialize prediction value: {e}")))?;
            sqlx::query(
                r#"
                INSERT INTO predictions (model_id, model_type, entity_key, predicted_at, value, horizon, snapshot_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(p.model_id.as_uuid())
            .bind(p.model_type.as_str())
            .bind(p.entity_key.as_str())
            .bind(p.predicted_at)
            .bind(value)
            .bind(p.horizon.map(|h| h as i32))
            .bind(p.snapshot_id.seq() as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_prediction", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    pub async fn read_current_predictions_async(&self, model_type: ModelType) -> Result<Vec<Prediction>, StoreError> {
        // Same ranking as `select_current_run`: live models first, then latest
        // predicted_at, then the newest model id.
        let rows = sqlx::query_as::<_, PredictionRow>(
            r#"
            WITH ranked AS (
                SELECT p.entity_key, p.model_id, p.model_type, p.predicted_at, p.value, p.horizon,
                       p.snapshot_id, (a.status <> 'deprecated') AS live
                FROM predictions p
                JOIN model_artifacts a ON a.model_id = p.model_id
                WHERE p.model_type = $1
            ),
            winners AS (
                SELECT DISTINCT ON (entity_key) entity_key, model_id, predicted_at
                FROM ranked
                ORDER BY entity_key, live DESC, predicted_at DESC, model_id DESC
            )
            SELECT r.entity_key, r.model_id, r.model_type, r.predicted_at, r.value, r.horizon, r.snapshot_id
            FROM ranked r
            JOIN winners w
              ON w.entity_key = r.entity_key AND w.model_id = r.model_id AND w.predicted_at = r.predicted_at
            ORDER BY r.entity_key, COALESCE(r.horizon, 0)
            "#,
        )
        .bind(model_type.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("read_current_predictions", e))?;
        rows.into_iter().map(PredictionRow::into_prediction).collect()
    }

    pub async fn predictions_for_async(
        &self,
        entity_key: &EntityKey,
        model_type: ModelType,
        range: TimeRange,
    ) -> Result<Vec<Prediction>, StoreError> {
        let rows = sqlx::query_as::<_, PredictionRow>(
            r#"
            SELECT entity_key, model_id, model_type, predicted_at, value, horizon, snapshot_id
            FROM predictions
            WHERE model_type = $1 AND entity_key = $2
              AND ($3::TIMESTAMPTZ IS NULL OR predicted_at >= $3)
              AND ($4::TIMESTAMPTZ IS NULL OR predicted_at <= $4)
            ORDER BY predicted_at, COALESCE(horizon, 0)
            "#,
        )
        .bind(model_type.as_str())
        .bind(entity_key.as_str())
        .bind(range.from)
        .bind(range.to)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("predictions_for", e))?;
        rows.into_iter().map(PredictionRow::into_prediction).collect()
    }

    pub async fn register_artifact_async(&self, artifact: ModelArtifact) -> Result<(), StoreError> {
        if artifact.status != ArtifactStatus::Training {
            return Err(StoreError::Constraint(format!(
                "new artifacts start in training, got {}",
                artifact.status.as_str()
            )));
        }
        let metrics = to_json("metrics", &artifact.metrics)?;
        sqlx::query(
            r#"
            INSERT INTO model_artifacts (
                model_id, model_type, trained_at, training_snapshot_id, metrics, status, parameters, failure
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(artifact.model_id.as_uuid())
        .bind(artifact.model_type.as_str())
        .bind(artifact.trained_at)
        .bind(artifact.training_snapshot_id.seq() as i64)
        .bind(metrics)
        .bind(artifact.status.as_str())
        .bind(&artifact.parameters)
        .bind(artifact.failure.as_deref())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("register_artifact", e))?;
        Ok(())
    }

    /// Explain why a `... WHERE status = 'training'` update matched no row.
    async fn not_training(&self, model_id: ModelId) -> StoreError {
        match self.artifact_async(model_id).await {
            Ok(Some(existing)) => StoreError::Conflict(format!(
                "artifact {model_id} is {}, not training",
                existing.status.as_str()
            )),
            Ok(None) => StoreError::NotFound(format!("artifact {model_id}")),
            Err(e) => e,
        }
    }

    pub async fn record_training_result_async(
        &self,
        model_id: ModelId,
        metrics: BTreeMap<String, f64>,
        parameters: JsonValue,
    ) -> Result<ModelArtifact, StoreError> {
        let metrics = to_json("metrics", &metrics)?;
        let row = sqlx::query_as::<_, ArtifactRow>(
            r#"
            UPDATE model_artifacts SET metrics = $2, parameters = $3
            WHERE model_id = $1 AND status = 'training'
            RETURNING model_id, model_type, trained_at, training_snapshot_id, metrics, status, parameters, failure
            "#,
        )
        .bind(model_id.as_uuid())
        .bind(metrics)
        .bind(parameters)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_training_result", e))?;
        match row {
            Some(row) => row.into_artifact(),
            None => Err(self.not_training(model_id).await),
        }
    }

    pub async fn mark_training_failed_async(&self, model_id: ModelId, reason: &str) -> Result<ModelArtifact, StoreError> {
        let row = sqlx::query_as::<_, ArtifactRow>(
            r#"
            UPDATE model_artifacts SET status = 'training_failed', failure = $2
            WHERE model_id = $1 AND status = 'training'
            RETURNING model_id, model_type, trained_at, training_snapshot_id, metrics, status, parameters, failure
            "#,
        )
        .bind(model_id.as_uuid())
        .bind(reason)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_training_failed", e))?;
        match row {
            Some(row) => row.into_artifact(),
            None => Err(self.not_training(model_id).await),
        }
    }

    #[instrument(skip(self), err)]
    pub async fn promote_async(&self, model_id: ModelId, expected_ready: Option<ModelId>) -> Result<ModelArtifact, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let candidate = sqlx::query_as::<_, ArtifactRow>(
            r#"
            SELECT model_id, model_type, trained_at, training_snapshot_id, metrics, status, parameters, failure
            FROM model_artifacts WHERE model_id = $1 FOR UPDATE
            "#,
        )
        .bind(model_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("load_candidate", e))?
        .ok_or_else(|| StoreError::NotFound(format!("artifact {model_id}")))?
        .into_artifact()?;

        if candidate.status != ArtifactStatus::Training {
            return Err(StoreError::Conflict(format!(
                "artifact {model_id} is {}, only trained candidates can be promoted",
                candidate.status.as_str()
            )));
        }
        if candidate.parameters.is_null() {
            return Err(StoreError::Constraint(format!("artifact {model_id} has no trained parameters")));
        }

        let current: Option<uuid::Uuid> = sqlx::query_scalar(
            "SELECT model_id FROM model_artifacts WHERE model_type = $1 AND status = 'ready' FOR UPDATE",
        )
        .bind(candidate.model_type.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("load_ready", e))?;
        let current = current.map(ModelId::from_uuid);

        if current != expected_ready {
            return Err(StoreError::Conflict(format!(
                "ready {} model is {current:?}, expected {expected_ready:?}",
                candidate.model_type
            )));
        }

        if let Some(previous) = current {
            sqlx::query("UPDATE model_artifacts SET status = 'deprecated' WHERE model_id = $1")
                .bind(previous.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("deprecate_previous", e))?;
        }
        sqlx::query("UPDATE model_artifacts SET status = 'ready' WHERE model_id = $1")
            .bind(model_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("promote", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(ModelArtifact {
            status: ArtifactStatus::Ready,
            ..candidate
        })
    }

    pub async fn ready_artifact_async(&self, model_type: ModelType) -> Result<Option<ModelArtifact>, StoreError> {
        sqlx::query_as::<_, ArtifactRow>(
            r#"
            SELECT model_id, model_type, trained_at, training_snapshot_id, metrics, status, parameters, failure
            FROM model_artifacts WHERE model_type = $1 AND status = 'ready'
            "#,
        )
        .bind(model_type.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ready_artifact", e))?
        .map(ArtifactRow::into_artifact)
        .transpose()
    }

    pub async fn artifact_async(&self, model_id: ModelId) -> Result<Option<ModelArtifact>, StoreError> {
        sqlx::query_as::<_, ArtifactRow>(
            r#"
            SELECT model_id, model_type, trained_at, training_snapshot_id, metrics, status, parameters, failure
            FROM model_artifacts WHERE model_id = $1
            "#,
        )
        .bind(model_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("artifact", e))?
        .map(ArtifactRow::into_artifact)
        .transpose()
    }

    pub async fn artifacts_async(&self, model_type: ModelType) -> Result<Vec<ModelArtifact>, StoreError> {
        let rows = sqlx::query_as::<_, ArtifactRow>(
            r#"
            SELECT model_id, model_type, trained_at, training_snapshot_id, metrics, status, parameters, failure
            FROM model_artifacts WHERE model_type = $1
            ORDER BY model_id DESC
            "#,
        )
        .bind(model_type.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("artifacts", e))?;
        rows.into_iter().map(ArtifactRow::into_artifact).collect()
    }
}

/// Stage one version inside a commit transaction.
///
/// Returns `false` when the version is a duplicate (already offered in this
/// window, or unchanged from the current version).
async fn stage_version(
    tx: &mut Transaction<'_, Postgres>,
    seq: i64,
    mut entity: CanonicalEntity,
) -> Result<bool, StoreError> {
    if entity.valid_to.is_some() {
        return Err(StoreError::Constraint(format!(
            "{}/{}: incoming versions must be open (valid_to = None)",
            entity.entity_type, entity.entity_key
        )));
    }

    let offered = sqlx::query(
        r#"
        INSERT INTO entity_batches (entity_type, entity_key, batch_id)
        VALUES ($1, $2, $3)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(entity.entity_type.as_str())
    .bind(entity.entity_key.as_str())
    .bind(entity.provenance.batch_id.as_uuid())
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("offer_version", e))?;
    if offered.rows_affected() == 0 {
        return Ok(false);
    }

    let previous: Option<(JsonValue, JsonValue, DateTime<Utc>, String)> = sqlx::query_as(
        r#"
        SELECT attributes, extensions, valid_from, source_id
        FROM entity_versions
        WHERE entity_type = $1 AND entity_key = $2
        ORDER BY seq DESC, version_id DESC
        LIMIT 1
        "#,
    )
    .bind(entity.entity_type.as_str())
    .bind(entity.entity_key.as_str())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("load_current_version", e))?;

    let attributes = to_json("attributes", &entity.attributes)?;
    let extensions = to_json("extensions", &entity.extensions)?;

    if let Some((prev_attributes, prev_extensions, prev_valid_from, prev_source)) = previous {
        let prev_attributes: BTreeMap<String, AttrValue> = from_json("attributes", prev_attributes)?;
        if prev_attributes == entity.attributes && prev_extensions == extensions {
            return Ok(false);
        }
        if entity.valid_from < prev_valid_from {
            entity.valid_from = prev_valid_from;
        }
        if prev_source != entity.provenance.source_id.as_str() {
            warn!(
                entity_type = %entity.entity_type,
                entity_key = %entity.entity_key,
                previous_source = %prev_source,
                source_id = %entity.provenance.source_id,
                "entity updated by a different source; latest commit wins"
            );
        }
    }

    sqlx::query(
        r#"
        INSERT INTO entity_versions (
            seq, entity_type, entity_key, attributes, extensions, valid_from,
            source_id, batch_id, record_ref
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(seq)
    .bind(entity.entity_type.as_str())
    .bind(entity.entity_key.as_str())
    .bind(attributes)
    .bind(extensions)
    .bind(entity.valid_from)
    .bind(entity.provenance.source_id.as_str())
    .bind(entity.provenance.batch_id.as_uuid())
    .bind(&entity.provenance.record_ref)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_version", e))?;
    Ok(true)
}

fn to_json<T: serde::Serialize>(what: &str, value: &T) -> Result<JsonValue, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Storage(format!("serialize {what}: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(what: &str, value: JsonValue) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Storage(format!("corrupt {what} column: {e}")))
}

fn corrupt(column: &str, value: &str) -> StoreError {
    StoreError::Storage(format!("corrupt {column} column: {value:?}"))
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("40001") | Some("40P01") => StoreError::Conflict(msg),
                Some("23503") | Some("23514") => StoreError::Constraint(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolTimedOut => StoreError::Timeout(format!("connection pool timed out in {operation}")),
        sqlx::Error::PoolClosed => StoreError::Storage(format!("connection pool closed in {operation}")),
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

#[derive(Debug, FromRow)]
struct CommitBatchRow {
    seq: i64,
    job_id: uuid::Uuid,
    source_id: String,
    committed_at: DateTime<Utc>,
    watermark_start: i64,
    watermark_end: i64,
    applied: i64,
    deduplicated: i64,
    quarantined: i64,
}

impl CommitBatchRow {
    fn into_receipt(self) -> Result<BatchReceipt, StoreError> {
        Ok(BatchReceipt {
            job_id: JobId::from_uuid(self.job_id),
            source_id: SourceId::new(&self.source_id).map_err(|_| corrupt("source_id", &self.source_id))?,
            snapshot_id: SnapshotId::new(self.seq as u64),
            committed_at: self.committed_at,
            watermark_start: Watermark::new(self.watermark_start),
            watermark_end: Watermark::new(self.watermark_end),
            applied: self.applied as usize,
            deduplicated: self.deduplicated as usize,
            quarantined: self.quarantined as usize,
        })
    }
}

#[derive(Debug, FromRow)]
struct VersionRow {
    entity_type: String,
    entity_key: String,
    attributes: JsonValue,
    extensions: JsonValue,
    valid_from: DateTime<Utc>,
    valid_to: Option<DateTime<Utc>>,
    source_id: String,
    batch_id: uuid::Uuid,
    record_ref: String,
    #[allow(dead_code)]
    seq: i64,
}

impl VersionRow {
    fn into_entity(self) -> Result<CanonicalEntity, StoreError> {
        Ok(CanonicalEntity {
            entity_type: EntityType::parse(&self.entity_type).ok_or_else(|| corrupt("entity_type", &self.entity_type))?,
            entity_key: EntityKey::new(&self.entity_key).map_err(|_| corrupt("entity_key", &self.entity_key))?,
            attributes: from_json("attributes", self.attributes)?,
            extensions: from_json("extensions", self.extensions)?,
            valid_from: self.valid_from,
            valid_to: self.valid_to,
            provenance: Provenance {
                source_id: SourceId::new(&self.source_id).map_err(|_| corrupt("source_id", &self.source_id))?,
                batch_id: BatchId::from_uuid(self.batch_id),
                record_ref: self.record_ref,
            },
        })
    }
}

#[derive(Debug, FromRow)]
struct QuarantineRow {
    job_id: uuid::Uuid,
    record: JsonValue,
    error: String,
    field: Option<String>,
    quarantined_at: DateTime<Utc>,
}

impl QuarantineRow {
    fn into_record(self) -> Result<QuarantinedRecord, StoreError> {
        let record: SourceRecord = from_json("record", self.record)?;
        Ok(QuarantinedRecord {
            record,
            error: self.error,
            field: self.field,
            job_id: JobId::from_uuid(self.job_id),
            quarantined_at: self.quarantined_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct PredictionRow {
    entity_key: String,
    model_id: uuid::Uuid,
    model_type: String,
    predicted_at: DateTime<Utc>,
    value: JsonValue,
    horizon: Option<i32>,
    snapshot_id: i64,
}

impl PredictionRow {
    fn into_prediction(self) -> Result<Prediction, StoreError> {
        let value: PredictionValue = from_json("value", self.value)?;
        Ok(Prediction {
            entity_key: EntityKey::new(&self.entity_key).map_err(|_| corrupt("entity_key", &self.entity_key))?,
            model_id: ModelId::from_uuid(self.model_id),
            model_type: ModelType::parse(&self.model_type).ok_or_else(|| corrupt("model_type", &self.model_type))?,
            predicted_at: self.predicted_at,
            value,
            horizon: self.horizon.map(|h| h as u32),
            snapshot_id: SnapshotId::new(self.snapshot_id as u64),
        })
    }
}

#[derive(Debug, FromRow)]
struct ArtifactRow {
    model_id: uuid::Uuid,
    model_type: String,
    trained_at: DateTime<Utc>,
    training_snapshot_id: i64,
    metrics: JsonValue,
    status: String,
    parameters: JsonValue,
    failure: Option<String>,
}

impl ArtifactRow {
    fn into_artifact(self) -> Result<ModelArtifact, StoreError> {
        Ok(ModelArtifact {
            model_id: ModelId::from_uuid(self.model_id),
            model_type: ModelType::parse(&self.model_type).ok_or_else(|| corrupt("model_type", &self.model_type))?,
            trained_at: self.trained_at,
            training_snapshot_id: SnapshotId::new(self.training_snapshot_id as u64),
            metrics: from_json("metrics", self.metrics)?,
            status: ArtifactStatus::parse(&self.status).ok_or_else(|| corrupt("status", &self.status))?,
            parameters: self.parameters,
            failure: self.failure,
        })
    }
}

impl EntityStore for PostgresStore {
    fn commit_batch(&self, batch: CommitBatch) -> Result<BatchReceipt, StoreError> {
        self.handle.block_on(self.commit_batch_async(batch))
    }

    fn committed_batch(&self, job_id: JobId) -> Result<Option<BatchReceipt>, StoreError> {
        self.handle.block_on(self.committed_batch_async(job_id))
    }

    fn latest_snapshot_id(&self) -> Result<SnapshotId, StoreError> {
        self.handle.block_on(self.latest_snapshot_id_async())
    }

    fn read_snapshot(&self, as_of: DateTime<Utc>) -> Result<Snapshot, StoreError> {
        self.handle.block_on(self.read_snapshot_async(as_of))
    }

    fn versions_since(&self, since: SnapshotId, types: &[EntityType]) -> Result<usize, StoreError> {
        self.handle.block_on(self.versions_since_async(since, types))
    }

    fn entity_history(
        &self,
        entity_type: EntityType,
        entity_key: &EntityKey,
    ) -> Result<Vec<CanonicalEntity>, StoreError> {
        self.handle.block_on(self.entity_history_async(entity_type, entity_key))
    }

    fn quarantined(&self, source_id: Option<&SourceId>, limit: usize) -> Result<Vec<QuarantinedRecord>, StoreError> {
        self.handle.block_on(self.quarantined_async(source_id, limit))
    }

    fn quarantine_count(&self, source_id: &SourceId) -> Result<usize, StoreError> {
        self.handle.block_on(self.quarantine_count_async(source_id))
    }
}

impl PredictionStore for PostgresStore {
    fn append_predictions(&self, predictions: Vec<Prediction>) -> Result<(), StoreError> {
        self.handle.block_on(self.append_predictions_async(predictions))
    }

    fn read_current_predictions(&self, model_type: ModelType) -> Result<Vec<Prediction>, StoreError> {
        self.handle.block_on(self.read_current_predictions_async(model_type))
    }

    fn predictions_for(
        &self,
        entity_key: &EntityKey,
        model_type: ModelType,
        range: TimeRange,
    ) -> Result<Vec<Prediction>, StoreError> {
        self.handle.block_on(self.predictions_for_async(entity_key, model_type, range))
    }
}

impl ArtifactRegistry for PostgresStore {
    fn register_artifact(&self, artifact: ModelArtifact) -> Result<(), StoreError> {
        self.handle.block_on(self.register_artifact_async(artifact))
    }

    fn record_training_result(
        &self,
        model_id: ModelId,
        metrics: BTreeMap<String, f64>,
        parameters: JsonValue,
    ) -> Result<ModelArtifact, StoreError> {
        self.handle
            .block_on(self.record_training_result_async(model_id, metrics, parameters))
    }

    fn mark_training_failed(&self, model_id: ModelId, reason: &str) -> Result<ModelArtifact, StoreError> {
        self.handle.block_on(self.mark_training_failed_async(model_id, reason))
    }

    fn promote(&self, model_id: ModelId, expected_ready: Option<ModelId>) -> Result<ModelArtifact, StoreError> {
        self.handle.block_on(self.promote_async(model_id, expected_ready))
    }

    fn ready_artifact(&self, model_type: ModelType) -> Result<Option<ModelArtifact>, StoreError> {
        self.handle.block_on(self.ready_artifact_async(model_type))
    }

    fn artifact(&self, model_id: ModelId) -> Result<Option<ModelArtifact>, StoreError> {
        self.handle.block_on(self.artifact_async(model_id))
    }

    fn artifacts(&self, model_type: ModelType) -> Result<Vec<ModelArtifact>, StoreError> {
        self.handle.block_on(self.artifacts_async(model_type))
    }
}
