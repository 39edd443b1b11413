use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::Response,
};
use serde::Serialize;

use signalhub_core::{EntityKey, ModelType, Prediction};
use signalhub_infra::{ForecastOverview, Services};

use super::blocking;
use crate::app::dto::HistoryQuery;
use crate::app::errors::{
    json_error, not_found, parse_entity_key, parse_model_type, store_error_to_response,
};

pub async fn current_prediction(
    Extension(services): Extension<Arc<Services>>,
    Path((model_type, entity_key)): Path<(String, String)>,
) -> Result<Json<Prediction>, Response> {
    let model_type = parse_model_type(&model_type)?;
    let entity_key = parse_entity_key(&entity_key)?;

    blocking(move || {
        services
            .feed
            .get_current_prediction(&entity_key, model_type)
            .map_err(store_error_to_response)?
            .ok_or_else(|| not_found(format!("no current {model_type} prediction for {entity_key}")))
    })
    .await
    .map(Json)
}

pub async fn prediction_history(
    Extension(services): Extension<Arc<Services>>,
    Path((model_type, entity_key)): Path<(String, String)>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Prediction>>, Response> {
    let model_type = parse_model_type(&model_type)?;
    let entity_key = parse_entity_key(&entity_key)?;
    if let (Some(from), Some(to)) = (query.from, query.to) {
        if from > to {
            return Err(json_error(
                StatusCode::BAD_REQUEST,
                "invalid_range",
                "from must not be after to",
            ));
        }
    }
    let range = query.range();

    blocking(move || {
        services
            .feed
            .get_prediction_history(&entity_key, model_type, range)
            .map_err(store_error_to_response)
    })
    .await
    .map(Json)
}

/// Every prediction of the current scoring run for a model type.
pub async fn current_run(
    Extension(services): Extension<Arc<Services>>,
    Path(model_type): Path<String>,
) -> Result<Json<Vec<Prediction>>, Response> {
    let model_type = parse_model_type(&model_type)?;
    blocking(move || {
        services
            .feed
            .current_predictions(model_type)
            .map_err(store_error_to_response)
    })
    .await
    .map(Json)
}

#[derive(Debug, Serialize)]
pub struct ForecastResponse {
    pub series_key: EntityKey,
    pub model_type: ModelType,
    pub points: Vec<Prediction>,
    pub overview: Option<ForecastOverview>,
}

pub async fn current_forecast(
    Extension(services): Extension<Arc<Services>>,
    Path(series): Path<String>,
) -> Result<Json<ForecastResponse>, Response> {
    let series_key = parse_entity_key(&series)?;

    blocking(move || {
        let points = services
            .feed
            .get_current_forecast(&series_key)
            .map_err(store_error_to_response)?;
        if points.is_empty() {
            return Err(not_found(format!("no current forecast for series {series_key}")));
        }
        let overview = services
            .feed
            .forecast_overview(&series_key)
            .map_err(store_error_to_response)?;
        Ok(ForecastResponse {
            series_key,
            model_type: ModelType::Forecast,
            points,
            overview,
        })
    })
    .await
    .map(Json)
}
