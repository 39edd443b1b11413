use std::collections::BTreeMap;
use std::sync::Arc;

use signalhub_core::ModelType;

use crate::backend::ModelBackend;
use crate::churn::ChurnBackend;
use crate::forecast::ForecastBackend;

/// Backends registered by model type.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: BTreeMap<ModelType, Arc<dyn ModelBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the two reference backends.
    pub fn with_defaults(forecast_horizon_days: u32) -> Self {
        Self::new()
            .with(Arc::new(ChurnBackend::default()))
            .with(Arc::new(ForecastBackend::default().with_horizon(forecast_horizon_days)))
    }

    /// Register (or replace) the backend for its model type.
    pub fn register(&mut self, backend: Arc<dyn ModelBackend>) {
        self.backends.insert(backend.model_type(), backend);
    }

    pub fn with(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        self.register(backend);
        self
    }

    pub fn get(&self, model_type: ModelType) -> Option<Arc<dyn ModelBackend>> {
        self.backends.get(&model_type).cloned()
    }

    pub fn model_types(&self) -> Vec<ModelType> {
        self.backends.keys().copied().collect()
    }
}

impl core::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_map()
            .entries(
                self.backends
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.primary_metric().to_string())),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_both_model_types() {
        let registry = BackendRegistry::with_defaults(30);
        assert_eq!(registry.model_types(), vec![ModelType::Churn, ModelType::Forecast]);
        let forecast = registry.get(ModelType::Forecast).unwrap();
        assert_eq!(forecast.primary_metric(), "forecast_accuracy");
    }
}
