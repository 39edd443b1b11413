use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use signalhub_core::{
    CancellationToken, CanonicalEntity, EntityType, ModelArtifact, ModelType, PredictionValue,
};

use crate::backend::{ModelBackend, ModelInput, ScoredValue, TrainedModel};
use crate::error::ModelError;
use crate::stats::{mean, sigmoid, stddev};

/// Binary feature: 1 when `attribute` equals `equals` (case-insensitive).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Indicator {
    pub name: String,
    pub attribute: String,
    pub equals: String,
}

impl Indicator {
    pub fn new(name: &str, attribute: &str, equals: &str) -> Self {
        Self {
            name: name.to_string(),
            attribute: attribute.to_string(),
            equals: equals.to_string(),
        }
    }

    fn value(&self, entity: &CanonicalEntity) -> f64 {
        match entity.attr(&self.attribute).and_then(|v| v.as_text()) {
            Some(text) if text.eq_ignore_ascii_case(&self.equals) => 1.0,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChurnConfig {
    /// Numeric attributes, standardized before fitting.
    pub numeric: Vec<String>,
    pub indicators: Vec<Indicator>,
    /// Boolean label attribute.
    pub label: String,
    pub epochs: usize,
    pub learning_rate: f64,
    pub l2: f64,
    /// Every n-th customer (by key order) is held out for evaluation.
    pub holdout_every: usize,
    pub min_samples: usize,
}

impl Default for ChurnConfig {
    fn default() -> Self {
        Self {
            numeric: vec![
                "tenure".to_string(),
                "monthly_charges".to_string(),
                "total_charges".to_string(),
            ],
            indicators: vec![
                Indicator::new("month_to_month", "contract", "Month-to-month"),
                Indicator::new("fiber_internet", "internet_service", "Fiber optic"),
                Indicator::new("no_online_security", "online_security", "No"),
                Indicator::new("no_tech_support", "tech_support", "No"),
                Indicator::new("electronic_check", "payment_method", "Electronic check"),
            ],
            label: "churn".to_string(),
            epochs: 400,
            learning_rate: 0.1,
            l2: 0.001,
            holdout_every: 5,
            min_samples: 10,
        }
    }
}

/// Trained state stored in `ModelArtifact::parameters`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ChurnParameters {
    numeric: Vec<String>,
    indicators: Vec<Indicator>,
    means: Vec<f64>,
    stds: Vec<f64>,
    weights: Vec<f64>,
    bias: f64,
}

impl ChurnParameters {
    fn features(&self, entity: &CanonicalEntity) -> Vec<f64> {
        let mut x = Vec::with_capacity(self.weights.len());
        for (i, name) in self.numeric.iter().enumerate() {
            // Missing values sit at the mean.
            let raw = entity.attr(name).and_then(|v| v.as_f64()).unwrap_or(self.means[i]);
            let std = if self.stds[i] > f64::EPSILON { self.stds[i] } else { 1.0 };
            x.push((raw - self.means[i]) / std);
        }
        x.extend(self.indicators.iter().map(|ind| ind.value(entity)));
        x
    }

    fn probability(&self, x: &[f64]) -> f64 {
        let z = self.bias + self.weights.iter().zip(x).map(|(w, v)| w * v).sum::<f64>();
        sigmoid(z)
    }
}

/// Churn classifier: L2-regularized logistic regression fitted by full-batch
/// gradient descent.
#[derive(Debug, Clone, Default)]
pub struct ChurnBackend {
    config: ChurnConfig,
}

const INPUT_TYPES: [EntityType; 1] = [EntityType::Customer];

impl ChurnBackend {
    pub fn new(config: ChurnConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChurnConfig {
        &self.config
    }

    fn labeled<'a>(&self, input: &ModelInput<'a>) -> Vec<(&'a CanonicalEntity, f64)> {
        let mut rows: Vec<(&CanonicalEntity, f64)> = input
            .of_type(EntityType::Customer)
            .filter_map(|e| {
                let label = e.attr(&self.config.label)?;
                let y = label.as_bool().map(f64::from).or_else(|| label.as_f64())?;
                Some((e, if y >= 0.5 { 1.0 } else { 0.0 }))
            })
            .collect();
        rows.sort_by(|a, b| a.0.entity_key.cmp(&b.0.entity_key));
        rows
    }
}

impl ModelBackend for ChurnBackend {
    fn model_type(&self) -> ModelType {
        ModelType::Churn
    }

    fn input_types(&self) -> &[EntityType] {
        &INPUT_TYPES
    }

    fn primary_metric(&self) -> &str {
        "accuracy"
    }

    fn train(&self, input: &ModelInput<'_>, cancel: &CancellationToken) -> Result<TrainedModel, ModelError> {
        let cfg = &self.config;
        if cfg.holdout_every < 2 {
            return Err(ModelError::InvalidInput("holdout_every must be >= 2".to_string()));
        }
        if !(cfg.learning_rate.is_finite() && cfg.learning_rate > 0.0) {
            return Err(ModelError::InvalidInput(
                "learning_rate must be a finite positive number".to_string(),
            ));
        }

        let rows = self.labeled(input);
        if rows.len() < cfg.min_samples.max(2) {
            return Err(ModelError::InsufficientData(format!(
                "{} labeled customers, need at least {}",
                rows.len(),
                cfg.min_samples.max(2)
            )));
        }

        let (train, holdout): (Vec<_>, Vec<_>) = rows
            .iter()
            .enumerate()
            .partition(|(i, _)| (i + 1) % cfg.holdout_every != 0);
        let train: Vec<_> = train.into_iter().map(|(_, r)| *r).collect();
        let holdout: Vec<_> = holdout.into_iter().map(|(_, r)| *r).collect();

        // Standardization statistics come from the training split only.
        let mut means = Vec::with_capacity(cfg.numeric.len());
        let mut stds = Vec::with_capacity(cfg.numeric.len());
        for name in &cfg.numeric {
            let column: Vec<f64> = train
                .iter()
                .filter_map(|(e, _)| e.attr(name).and_then(|v| v.as_f64()))
                .collect();
            let m = mean(&column);
            means.push(m);
            stds.push(stddev(&column, m));
        }

        let mut params = ChurnParameters {
            numeric: cfg.numeric.clone(),
            indicators: cfg.indicators.clone(),
            means,
            stds,
            weights: vec![0.0; cfg.numeric.len() + cfg.indicators.len()],
            bias: 0.0,
        };

        let xs: Vec<Vec<f64>> = train.iter().map(|(e, _)| params.features(e)).collect();
        let ys: Vec<f64> = train.iter().map(|(_, y)| *y).collect();
        let n = xs.len() as f64;

        for _epoch in 0..cfg.epochs {
            if cancel.is_cancelled() {
                return Err(ModelError::Cancelled);
            }

            let mut grad_w = vec![0.0; params.weights.len()];
            let mut grad_b = 0.0;
            for (x, y) in xs.iter().zip(&ys) {
                let err = params.probability(x) - y;
                for (g, v) in grad_w.iter_mut().zip(x) {
                    *g += err * v;
                }
                grad_b += err;
            }
            for (w, g) in params.weights.iter_mut().zip(&grad_w) {
                *w -= cfg.learning_rate * (g / n + cfg.l2 * *w);
            }
            params.bias -= cfg.learning_rate * grad_b / n;
        }

        let metrics = evaluate(&params, &holdout);
        let parameters = serde_json::to_value(&params)
            .map_err(|e| ModelError::Internal(format!("serialize parameters: {e}")))?;

        tracing::debug!(
            train = train.len(),
            holdout = holdout.len(),
            accuracy = metrics.get("accuracy").copied().unwrap_or_default(),
            "churn model fitted"
        );

        Ok(TrainedModel { metrics, parameters })
    }

    fn score(&self, artifact: &ModelArtifact, input: &ModelInput<'_>) -> Result<Vec<ScoredValue>, ModelError> {
        let params: ChurnParameters = serde_json::from_value(artifact.parameters.clone())
            .map_err(|e| ModelError::InvalidArtifact(format!("churn parameters: {e}")))?;
        let width = params.numeric.len() + params.indicators.len();
        if params.weights.len() != width
            || params.means.len() != params.numeric.len()
            || params.stds.len() != params.numeric.len()
        {
            return Err(ModelError::InvalidArtifact("churn parameter dimensions disagree".to_string()));
        }

        let mut scored: Vec<ScoredValue> = input
            .of_type(EntityType::Customer)
            .map(|e| ScoredValue {
                entity_key: e.entity_key.clone(),
                value: PredictionValue::Probability {
                    p: params.probability(&params.features(e)),
                },
                horizon: None,
            })
            .collect();
        scored.sort_by(|a, b| a.entity_key.cmp(&b.entity_key));
        Ok(scored)
    }
}

fn evaluate(params: &ChurnParameters, holdout: &[(&CanonicalEntity, f64)]) -> BTreeMap<String, f64> {
    let (mut tp, mut fp, mut tn, mut fn_) = (0.0, 0.0, 0.0, 0.0);
    let mut log_loss = 0.0;
    for (e, y) in holdout {
        let p = params.probability(&params.features(e));
        let predicted = p >= 0.5;
        match (predicted, *y >= 0.5) {
            (true, true) => tp += 1.0,
            (true, false) => fp += 1.0,
            (false, false) => tn += 1.0,
            (false, true) => fn_ += 1.0,
        }
        let p = p.clamp(1e-12, 1.0 - 1e-12);
        log_loss -= y * p.ln() + (1.0 - y) * (1.0 - p).ln();
    }

    let total = tp + fp + tn + fn_;
    let ratio = |num: f64, den: f64| if den > 0.0 { num / den } else { 0.0 };

    BTreeMap::from([
        ("accuracy".to_string(), ratio(tp + tn, total)),
        ("precision".to_string(), ratio(tp, tp + fp)),
        ("recall".to_string(), ratio(tp, tp + fn_)),
        ("log_loss".to_string(), ratio(log_loss, total)),
        ("holdout_size".to_string(), total),
    ])
}
