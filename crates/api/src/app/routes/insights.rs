use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::Response,
};

use signalhub_infra::{ChurnOverview, ForecastOverview, Services};

use super::blocking;
use crate::app::dto::ChurnQuery;
use crate::app::errors::{json_error, not_found, parse_entity_key, store_error_to_response};

pub const DEFAULT_CHURN_THRESHOLD: f64 = 0.5;
pub const DEFAULT_TOP_N: usize = 10;
const MAX_TOP_N: usize = 500;

pub async fn churn(
    Extension(services): Extension<Arc<Services>>,
    Query(query): Query<ChurnQuery>,
) -> Result<Json<ChurnOverview>, Response> {
    let threshold = query.threshold.unwrap_or(DEFAULT_CHURN_THRESHOLD);
    if !(0.0..=1.0).contains(&threshold) {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "invalid_threshold",
            "threshold must be between 0 and 1",
        ));
    }
    let top = query.top.unwrap_or(DEFAULT_TOP_N).min(MAX_TOP_N);

    blocking(move || {
        services
            .feed
            .churn_overview(threshold, top)
            .map_err(store_error_to_response)
    })
    .await
    .map(Json)
}

pub async fn forecast(
    Extension(services): Extension<Arc<Services>>,
    Path(series): Path<String>,
) -> Result<Json<ForecastOverview>, Response> {
    let series_key = parse_entity_key(&series)?;
    blocking(move || {
        services
            .feed
            .forecast_overview(&series_key)
            .map_err(store_error_to_response)?
            .ok_or_else(|| not_found(format!("no current forecast for series {series_key}")))
    })
    .await
    .map(Json)
}
