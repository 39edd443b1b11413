//! Operator endpoints: source health, job history, recovery actions and
//! model status.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::Response,
};
use tracing::info;

use signalhub_core::{SourceId, Watermark};
use signalhub_infra::store::{EntityStore, QuarantinedRecord};
use signalhub_infra::{
    AlertSink, IngestionJob, JobLedger, ModelStatus, OperatorAlert, OperatorReport, PipelineError, Services,
    SourceStatus,
};

use super::blocking;
use crate::app::dto::{LimitQuery, QuarantineQuery, ReprocessRequest, clamp_limit};
use crate::app::errors::{
    json_error, ledger_error_to_response, parse_model_type, parse_source_id, pipeline_error_to_response,
    scheduler_error_to_response, store_error_to_response,
};

pub async fn list_sources(Extension(services): Extension<Arc<Services>>) -> Result<Json<OperatorReport>, Response> {
    blocking(move || services.pipeline.operator_report().map_err(pipeline_error_to_response))
        .await
        .map(Json)
}

pub async fn source_status(
    Extension(services): Extension<Arc<Services>>,
    Path(source_id): Path<String>,
) -> Result<Json<SourceStatus>, Response> {
    let source_id = known_source(&services, &source_id)?;
    blocking(move || {
        services
            .pipeline
            .source_status(&source_id)
            .map_err(pipeline_error_to_response)
    })
    .await
    .map(Json)
}

pub async fn source_jobs(
    Extension(services): Extension<Arc<Services>>,
    Path(source_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<IngestionJob>>, Response> {
    let source_id = known_source(&services, &source_id)?;
    let limit = query.limit();
    blocking(move || {
        services
            .ledger
            .jobs_for(&source_id, limit)
            .map_err(ledger_error_to_response)
    })
    .await
    .map(Json)
}

pub async fn resume_source(
    Extension(services): Extension<Arc<Services>>,
    Path(source_id): Path<String>,
) -> Result<Json<IngestionJob>, Response> {
    let source_id = known_source(&services, &source_id)?;
    blocking(move || {
        services
            .pipeline
            .resume_source(&source_id)
            .map_err(pipeline_error_to_response)
    })
    .await
    .map(Json)
}

/// Re-ingest a source from `from_watermark`. Runs the job to completion;
/// already-stored versions are deduplicated.
pub async fn reprocess_source(
    Extension(services): Extension<Arc<Services>>,
    Path(source_id): Path<String>,
    Json(body): Json<ReprocessRequest>,
) -> Result<Json<IngestionJob>, Response> {
    let source_id = known_source(&services, &source_id)?;
    if body.from_watermark < 0 {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "invalid_watermark",
            "from_watermark must not be negative",
        ));
    }
    let from = Watermark::new(body.from_watermark);

    blocking(move || {
        info!(source_id = %source_id, from = %from, "reprocess requested by operator");
        services
            .pipeline
            .reprocess(&source_id, from)
            .map_err(pipeline_error_to_response)
    })
    .await
    .map(Json)
}

pub async fn quarantine(
    Extension(services): Extension<Arc<Services>>,
    Query(query): Query<QuarantineQuery>,
) -> Result<Json<Vec<QuarantinedRecord>>, Response> {
    let source_id = match query.source.as_deref() {
        Some(s) => Some(known_source(&services, s)?),
        None => None,
    };
    let limit = clamp_limit(query.limit);

    blocking(move || {
        services
            .store
            .quarantined(source_id.as_ref(), limit)
            .map_err(store_error_to_response)
    })
    .await
    .map(Json)
}

pub async fn alerts(
    Extension(services): Extension<Arc<Services>>,
    Query(query): Query<LimitQuery>,
) -> Json<Vec<OperatorAlert>> {
    Json(services.alerts.recent(query.limit()))
}

pub async fn model_status(
    Extension(services): Extension<Arc<Services>>,
    Path(model_type): Path<String>,
) -> Result<Json<ModelStatus>, Response> {
    let model_type = parse_model_type(&model_type)?;
    blocking(move || {
        services
            .scheduler
            .model_status(model_type)
            .map_err(scheduler_error_to_response)
    })
    .await
    .map(Json)
}

fn known_source(services: &Services, raw: &str) -> Result<SourceId, Response> {
    let source_id = parse_source_id(raw)?;
    if services.pipeline.sources().contains(&source_id) {
        Ok(source_id)
    } else {
        Err(pipeline_error_to_response(PipelineError::UnknownSource(source_id)))
    }
}
