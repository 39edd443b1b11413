//! Read-only insight feed over predictions and canonical entities.
//!
//! Current-prediction selection: predictions from non-deprecated models win
//! over those from deprecated models; then the latest `predicted_at`; then
//! the higher model id.

use chrono::{DateTime, Utc};
use serde::Serialize;

use signalhub_core::{
    EntityKey, EntityType, ModelId, ModelType, Prediction, TimeRange, select_current_run,
};

use crate::store::{ArtifactRegistry, EntityStore, PredictionStore, SharedStore, StoreError};

const CHURN_LABEL: &str = "churn";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AtRiskCustomer {
    pub entity_key: EntityKey,
    pub probability: f64,
    pub predicted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChurnOverview {
    /// Ready model at read time, if any.
    pub model_id: Option<ModelId>,
    pub threshold: f64,
    pub scored: usize,
    pub at_risk: usize,
    pub mean_probability: Option<f64>,
    /// Share of current customers labelled as churned.
    pub observed_churn_rate: Option<f64>,
    pub top: Vec<AtRiskCustomer>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastOverview {
    pub series_key: EntityKey,
    pub model_id: ModelId,
    pub predicted_at: DateTime<Utc>,
    pub horizons: usize,
    pub next_day: f64,
    pub horizon_total: f64,
    pub lower_total: f64,
    pub upper_total: f64,
}

#[derive(Clone)]
pub struct InsightFeed {
    store: SharedStore,
}

impl InsightFeed {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    fn current_run(&self, entity_key: &EntityKey, model_type: ModelType) -> Result<Vec<Prediction>, StoreError> {
        let candidates = self.store.predictions_for(entity_key, model_type, TimeRange::all())?;
        let deprecated = self.store.deprecated_ids(model_type)?;
        Ok(select_current_run(candidates.iter(), &deprecated)
            .into_iter()
            .cloned()
            .collect())
    }

    /// The current prediction; for forecasts, the nearest horizon of the current run.
    pub fn get_current_prediction(
        &self,
        entity_key: &EntityKey,
        model_type: ModelType,
    ) -> Result<Option<Prediction>, StoreError> {
        Ok(self.current_run(entity_key, model_type)?.into_iter().next())
    }

    pub fn get_prediction_history(
        &self,
        entity_key: &EntityKey,
        model_type: ModelType,
        range: TimeRange,
    ) -> Result<Vec<Prediction>, StoreError> {
        self.store.predictions_for(entity_key, model_type, range)
    }

    /// Every horizon of the current forecast run, nearest first.
    pub fn get_current_forecast(&self, series_key: &EntityKey) -> Result<Vec<Prediction>, StoreError> {
        self.current_run(series_key, ModelType::Forecast)
    }

    pub fn current_predictions(&self, model_type: ModelType) -> Result<Vec<Prediction>, StoreError> {
        self.store.read_current_predictions(model_type)
    }

    pub fn churn_overview(&self, threshold: f64, top_n: usize) -> Result<ChurnOverview, StoreError> {
        // One row per customer for churn.
        let current = self.store.read_current_predictions(ModelType::Churn)?;
        let scored = current.len();

        let mut at_risk: Vec<AtRiskCustomer> = current
            .iter()
            .map(|p| AtRiskCustomer {
                entity_key: p.entity_key.clone(),
                probability: p.value.point(),
                predicted_at: p.predicted_at,
            })
            .filter(|c| c.probability >= threshold)
            .collect();
        at_risk.sort_by(|a, b| {
            b.probability
                .total_cmp(&a.probability)
                .then_with(|| a.entity_key.cmp(&b.entity_key))
        });
        let at_risk_count = at_risk.len();
        at_risk.truncate(top_n);

        let mean_probability =
            (scored > 0).then(|| current.iter().map(|p| p.value.point()).sum::<f64>() / scored as f64);

        let snapshot = self.store.read_snapshot(Utc::now())?;
        let labels: Vec<f64> = snapshot
            .of_types(&[EntityType::Customer])
            .filter_map(|e| {
                let label = e.attr(CHURN_LABEL)?;
                label.as_bool().map(f64::from).or_else(|| label.as_f64())
            })
            .collect();
        let observed_churn_rate = (!labels.is_empty()).then(|| labels.iter().sum::<f64>() / labels.len() as f64);

        Ok(ChurnOverview {
            model_id: self.store.ready_artifact(ModelType::Churn)?.map(|a| a.model_id),
            threshold,
            scored,
            at_risk: at_risk_count,
            mean_probability,
            observed_churn_rate,
            top: at_risk,
        })
    }

    pub fn forecast_overview(&self, series_key: &EntityKey) -> Result<Option<ForecastOverview>, StoreError> {
        let run = self.get_current_forecast(series_key)?;
        let Some(first) = run.first() else {
            return Ok(None);
        };

        let mut overview = ForecastOverview {
            series_key: series_key.clone(),
            model_id: first.model_id,
            predicted_at: first.predicted_at,
            horizons: run.len(),
            next_day: first.value.point(),
            horizon_total: 0.0,
            lower_total: 0.0,
            upper_total: 0.0,
        };
        for p in &run {
            let (value, lower, upper) = match p.value {
                signalhub_core::PredictionValue::Numeric { value, lower, upper } => (value, lower, upper),
                signalhub_core::PredictionValue::Probability { p } => (p, p, p),
            };
            overview.horizon_total += value;
            overview.lower_total += lower;
            overview.upper_total += upper;
        }
        Ok(Some(overview))
    }
}
