use axum::{
    Router,
    http::StatusCode,
    response::Response,
    routing::{get, post},
};

use crate::app::errors::json_error;

pub mod insights;
pub mod ops;
pub mod predictions;
pub mod system;

pub fn router() -> Router {
    Router::new()
        .nest("/predictions", predictions_router())
        .route("/forecast/:series", get(predictions::current_forecast))
        .nest("/insights", insights_router())
        .nest("/ops", ops_router())
}

fn predictions_router() -> Router {
    Router::new()
        .route("/:model_type", get(predictions::current_run))
        .route("/:model_type/:entity_key", get(predictions::current_prediction))
        .route("/:model_type/:entity_key/history", get(predictions::prediction_history))
}

fn insights_router() -> Router {
    Router::new()
        .route("/churn", get(insights::churn))
        .route("/forecast/:series", get(insights::forecast))
}

fn ops_router() -> Router {
    Router::new()
        .route("/sources", get(ops::list_sources))
        .route("/sources/:source_id", get(ops::source_status))
        .route("/sources/:source_id/jobs", get(ops::source_jobs))
        .route("/sources/:source_id/resume", post(ops::resume_source))
        .route("/sources/:source_id/reprocess", post(ops::reprocess_source))
        .route("/quarantine", get(ops::quarantine))
        .route("/alerts", get(ops::alerts))
        .route("/models/:model_type", get(ops::model_status))
}

/// Run store-bound work off the async executor. The Postgres store drives
/// its queries with `block_on`, which must not happen on a runtime worker.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, Response>
where
    F: FnOnce() -> Result<T, Response> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => Err(json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            e.to_string(),
        )),
    }
}
