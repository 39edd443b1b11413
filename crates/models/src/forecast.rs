use std::collections::BTreeMap;

use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use signalhub_core::{
    CancellationToken, EntityKey, EntityType, ModelArtifact, ModelType, PredictionValue,
};

use crate::backend::{ModelBackend, ModelInput, ScoredValue, TrainedModel};
use crate::error::ModelError;
use crate::stats::{mean, stddev};

/// z-value of the two-sided 95% interval.
const INTERVAL_Z: f64 = 1.96;

const BACKFIT_ROUNDS: usize = 25;

/// Ordinary least squares line `(intercept, slope)`.
fn least_squares(xs: &[f64], ys: &[f64]) -> (f64, f64) {
    let x_mean = mean(xs);
    let y_mean = mean(ys);
    let var: f64 = xs.iter().map(|x| (x - x_mean).powi(2)).sum();
    let cov: f64 = xs.iter().zip(ys).map(|(x, y)| (x - x_mean) * (y - y_mean)).sum();
    let slope = if var > f64::EPSILON { cov / var } else { 0.0 };
    (y_mean - slope * x_mean, slope)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastConfig {
    /// Attribute naming the series; records without it fall into `default_series`.
    pub series_attr: String,
    pub default_series: String,
    pub date_attr: String,
    pub value_attr: String,
    pub horizon_days: u32,
    pub holdout_fraction: f64,
    pub min_holdout_days: usize,
    pub min_days: usize,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            series_attr: "series".to_string(),
            default_series: "total".to_string(),
            date_attr: "date".to_string(),
            value_attr: "sales_amount".to_string(),
            horizon_days: 90,
            holdout_fraction: 0.2,
            min_holdout_days: 7,
            min_days: 14,
        }
    }
}

/// Fitted state of one series: `y = intercept + slope * t + seasonal[weekday]`,
/// where `t` counts days since `origin`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SeriesFit {
    origin: NaiveDate,
    last_date: NaiveDate,
    intercept: f64,
    slope: f64,
    /// Monday-first weekday offsets, centered on zero.
    seasonal: [f64; 7],
    residual_std: f64,
}

impl SeriesFit {
    fn fit(days: &[(NaiveDate, f64)]) -> Option<Self> {
        let (origin, _) = *days.first()?;
        let (last_date, _) = *days.last()?;
        let ts: Vec<f64> = days.iter().map(|(d, _)| (*d - origin).num_days() as f64).collect();
        let ys: Vec<f64> = days.iter().map(|(_, y)| *y).collect();

        let weekdays: Vec<usize> = days
            .iter()
            .map(|(d, _)| d.weekday().num_days_from_monday() as usize)
            .collect();

        // Backfitting: alternate the trend fit and the weekday offsets until
        // the two stop absorbing each other's signal.
        let mut seasonal = [0.0; 7];
        let (mut intercept, mut slope) = (0.0, 0.0);
        for _ in 0..BACKFIT_ROUNDS {
            let adjusted: Vec<f64> = ys.iter().zip(&weekdays).map(|(y, wd)| y - seasonal[*wd]).collect();
            (intercept, slope) = least_squares(&ts, &adjusted);

            let mut sums = [0.0; 7];
            let mut counts = [0usize; 7];
            for ((y, t), wd) in ys.iter().zip(&ts).zip(&weekdays) {
                sums[*wd] += y - (intercept + slope * t);
                counts[*wd] += 1;
            }
            for wd in 0..7 {
                seasonal[wd] = if counts[wd] > 0 { sums[wd] / counts[wd] as f64 } else { 0.0 };
            }
            let center = mean(&seasonal);
            for s in &mut seasonal {
                *s -= center;
            }
        }

        let mut fit = Self {
            origin,
            last_date,
            intercept,
            slope,
            seasonal,
            residual_std: 0.0,
        };
        let residuals: Vec<f64> = days.iter().map(|(d, y)| y - fit.predict(*d)).collect();
        fit.residual_std = stddev(&residuals, mean(&residuals));
        Some(fit)
    }

    fn predict(&self, date: NaiveDate) -> f64 {
        let t = (date - self.origin).num_days() as f64;
        let wd = date.weekday().num_days_from_monday() as usize;
        self.intercept + self.slope * t + self.seasonal[wd]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ForecastParameters {
    horizon_days: u32,
    series: BTreeMap<String, SeriesFit>,
}

/// Daily sales forecaster: per-series linear trend with weekday seasonality.
#[derive(Debug, Clone, Default)]
pub struct ForecastBackend {
    config: ForecastConfig,
}

const INPUT_TYPES: [EntityType; 1] = [EntityType::SalesRecord];

impl ForecastBackend {
    pub fn new(config: ForecastConfig) -> Self {
        Self { config }
    }

    pub fn with_horizon(mut self, horizon_days: u32) -> Self {
        self.config.horizon_days = horizon_days;
        self
    }

    pub fn config(&self) -> &ForecastConfig {
        &self.config
    }

    /// Daily totals per series, in date order.
    fn daily_totals(&self, input: &ModelInput<'_>) -> BTreeMap<String, Vec<(NaiveDate, f64)>> {
        let mut totals: BTreeMap<String, BTreeMap<NaiveDate, f64>> = BTreeMap::new();
        for e in input.of_type(EntityType::SalesRecord) {
            let Some(date) = e.attr(&self.config.date_attr).and_then(|v| v.as_date()) else {
                continue;
            };
            let Some(value) = e.attr(&self.config.value_attr).and_then(|v| v.as_f64()) else {
                continue;
            };
            let series = e
                .attr(&self.config.series_attr)
                .and_then(|v| v.as_text())
                .unwrap_or(&self.config.default_series)
                .to_string();
            *totals.entry(series).or_default().entry(date).or_insert(0.0) += value;
        }
        totals
            .into_iter()
            .map(|(series, days)| (series, days.into_iter().collect()))
            .collect()
    }
}

impl ModelBackend for ForecastBackend {
    fn model_type(&self) -> ModelType {
        ModelType::Forecast
    }

    fn input_types(&self) -> &[EntityType] {
        &INPUT_TYPES
    }

    fn primary_metric(&self) -> &str {
        "forecast_accuracy"
    }

    fn train(&self, input: &ModelInput<'_>, cancel: &CancellationToken) -> Result<TrainedModel, ModelError> {
        let cfg = &self.config;
        if cfg.horizon_days == 0 {
            return Err(ModelError::InvalidInput("horizon_days must be >= 1".to_string()));
        }
        if !(cfg.holdout_fraction > 0.0 && cfg.holdout_fraction < 1.0) {
            return Err(ModelError::InvalidInput("holdout_fraction must be in (0, 1)".to_string()));
        }

        let totals = self.daily_totals(input);
        let mut series = BTreeMap::new();
        let mut abs_pct = Vec::new();
        let mut sq_err = Vec::new();

        // One series is one unit of work for cancellation.
        for (name, days) in &totals {
            if cancel.is_cancelled() {
                return Err(ModelError::Cancelled);
            }
            if days.len() < cfg.min_days.max(2) {
                tracing::debug!(series = %name, days = days.len(), "series too short; skipped");
                continue;
            }

            let holdout = ((days.len() as f64 * cfg.holdout_fraction).ceil() as usize)
                .max(cfg.min_holdout_days.max(1))
                .min(days.len() - 2);
            let split = days.len() - holdout;
            let Some(train_fit) = SeriesFit::fit(&days[..split]) else {
                continue;
            };
            for (d, y) in &days[split..] {
                let err = y - train_fit.predict(*d);
                sq_err.push(err * err);
                if y.abs() > f64::EPSILON {
                    abs_pct.push((err / y).abs());
                }
            }

            if let Some(full_fit) = SeriesFit::fit(days) {
                series.insert(name.clone(), full_fit);
            }
        }

        if series.is_empty() {
            return Err(ModelError::InsufficientData(format!(
                "no series with at least {} days of data",
                cfg.min_days
            )));
        }

        let mape = mean(&abs_pct);
        let rmse = mean(&sq_err).sqrt();
        let metrics = BTreeMap::from([
            ("mape".to_string(), mape),
            ("rmse".to_string(), rmse),
            ("forecast_accuracy".to_string(), (1.0 - mape).max(0.0)),
            ("series".to_string(), series.len() as f64),
        ]);

        let parameters = serde_json::to_value(ForecastParameters {
            horizon_days: cfg.horizon_days,
            series,
        })
        .map_err(|e| ModelError::Internal(format!("serialize parameters: {e}")))?;

        Ok(TrainedModel { metrics, parameters })
    }

    fn score(&self, artifact: &ModelArtifact, input: &ModelInput<'_>) -> Result<Vec<ScoredValue>, ModelError> {
        let params: ForecastParameters = serde_json::from_value(artifact.parameters.clone())
            .map_err(|e| ModelError::InvalidArtifact(format!("forecast parameters: {e}")))?;

        // Forecasts start after the latest observed day, which may be newer
        // than the training snapshot.
        let latest: BTreeMap<String, NaiveDate> = self
            .daily_totals(input)
            .into_iter()
            .filter_map(|(name, days)| days.last().map(|(d, _)| (name, *d)))
            .collect();

        let mut scored = Vec::new();
        for (name, fit) in &params.series {
            let entity_key = EntityKey::new(name.as_str())
                .map_err(|e| ModelError::InvalidArtifact(e.to_string()))?;
            let anchor = latest
                .get(name)
                .copied()
                .filter(|d| *d > fit.last_date)
                .unwrap_or(fit.last_date);
            let band = INTERVAL_Z * fit.residual_std;

            for h in 1..=params.horizon_days {
                let date = anchor + Duration::days(i64::from(h));
                let yhat = fit.predict(date).max(0.0);
                scored.push(ScoredValue {
                    entity_key: entity_key.clone(),
                    value: PredictionValue::Numeric {
                        value: yhat,
                        lower: (yhat - band).max(0.0),
                        upper: yhat + band,
                    },
                    horizon: Some(h),
                });
            }
        }
        Ok(scored)
    }
}
