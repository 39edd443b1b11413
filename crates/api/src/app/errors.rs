use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use signalhub_core::{EntityKey, ModelType, SourceId};
use signalhub_infra::{LedgerError, PipelineError, SchedulerError, StoreError};

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn not_found(message: impl Into<String>) -> Response {
    json_error(StatusCode::NOT_FOUND, "not_found", message)
}

pub fn store_error_to_response(err: StoreError) -> Response {
    match err {
        StoreError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        StoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        StoreError::DuplicateJob(job_id) => json_error(
            StatusCode::CONFLICT,
            "duplicate_job",
            format!("batch for job {job_id} already committed"),
        ),
        StoreError::Constraint(msg) => json_error(StatusCode::UNPROCESSABLE_ENTITY, "constraint_violation", msg),
        StoreError::Timeout(msg) => json_error(StatusCode::GATEWAY_TIMEOUT, "store_timeout", msg),
        StoreError::Storage(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg),
    }
}

pub fn ledger_error_to_response(err: LedgerError) -> Response {
    match err {
        LedgerError::UnknownJob(_) => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        LedgerError::Storage(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "ledger_error", msg),
        LedgerError::SourceBusy { .. } => json_error(StatusCode::CONFLICT, "source_busy", err.to_string()),
        LedgerError::SourceBlocked { .. } => json_error(StatusCode::CONFLICT, "source_blocked", err.to_string()),
        other => json_error(StatusCode::CONFLICT, "invalid_transition", other.to_string()),
    }
}

pub fn pipeline_error_to_response(err: PipelineError) -> Response {
    match err {
        PipelineError::UnknownSource(_) => json_error(StatusCode::NOT_FOUND, "unknown_source", err.to_string()),
        PipelineError::UnmappedSource(_) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "unmapped_source", err.to_string())
        }
        PipelineError::SourceBlocked { .. } => json_error(StatusCode::CONFLICT, "source_blocked", err.to_string()),
        PipelineError::NotBlocked(_) => json_error(StatusCode::CONFLICT, "not_blocked", err.to_string()),
        PipelineError::Store(e) => store_error_to_response(e),
        PipelineError::Ledger(e) => ledger_error_to_response(e),
        PipelineError::Connector(_) => json_error(StatusCode::BAD_GATEWAY, "connector_error", err.to_string()),
        PipelineError::Timeout { .. } => json_error(StatusCode::GATEWAY_TIMEOUT, "timeout", err.to_string()),
        PipelineError::Cancelled => json_error(StatusCode::SERVICE_UNAVAILABLE, "cancelled", err.to_string()),
        PipelineError::Interrupted(_) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "interrupted", err.to_string())
        }
    }
}

pub fn scheduler_error_to_response(err: SchedulerError) -> Response {
    match err {
        SchedulerError::NoBackend(_) | SchedulerError::NoReadyModel(_) => {
            json_error(StatusCode::NOT_FOUND, "not_found", err.to_string())
        }
        SchedulerError::Store(e) => store_error_to_response(e),
        SchedulerError::Cancelled => json_error(StatusCode::SERVICE_UNAVAILABLE, "cancelled", err.to_string()),
        other => json_error(StatusCode::INTERNAL_SERVER_ERROR, "scheduler_error", other.to_string()),
    }
}

pub fn parse_model_type(s: &str) -> Result<ModelType, Response> {
    ModelType::parse(&s.to_lowercase()).ok_or_else(|| {
        json_error(
            StatusCode::BAD_REQUEST,
            "invalid_model_type",
            "model_type must be one of: churn, forecast",
        )
    })
}

pub fn parse_entity_key(s: &str) -> Result<EntityKey, Response> {
    EntityKey::new(s).map_err(|e| json_error(StatusCode::BAD_REQUEST, "invalid_entity_key", e.to_string()))
}

pub fn parse_source_id(s: &str) -> Result<SourceId, Response> {
    SourceId::new(s).map_err(|e| json_error(StatusCode::BAD_REQUEST, "invalid_source_id", e.to_string()))
}
