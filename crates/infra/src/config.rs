//! Configuration loading and representation.
//!
//! The process reads one TOML file (`$SIGNALHUB_CONFIG`, else
//! `config/signalhub.toml`). Every section has defaults, so an empty file is a
//! valid configuration. `DATABASE_URL` and `SIGNALHUB_BIND` override the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use signalhub_connectors::{ConnectorConfig, ConnectorRegistry};
use signalhub_core::SourceId;
use signalhub_normalizer::{Normalizer, SourceMapping};

use crate::ledger::RetryPolicy;

pub const CONFIG_ENV: &str = "SIGNALHUB_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/signalhub.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// One ingestion source: where to pull from and how to map it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub connector: ConnectorConfig,
    pub mapping: SourceMapping,
    #[serde(default = "default_poll_interval", with = "duration")]
    pub poll_interval: Duration,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    #[serde(with = "duration")]
    pub pull: Duration,
    #[serde(with = "duration")]
    pub commit: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            pull: Duration::from_secs(30),
            commit: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    #[serde(with = "duration")]
    pub cadence: Duration,
    /// New versions of a backend's input types that trigger retraining.
    pub min_new_entities: usize,
    pub forecast_horizon_days: u32,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            cadence: Duration::from_secs(24 * 60 * 60),
            min_new_entities: 100,
            forecast_horizon_days: 90,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    #[serde(with = "duration")]
    pub cadence: Duration,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            cadence: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionConfig {
    /// Minimum primary metric of any promoted candidate.
    pub metric_floor: f64,
    /// Largest allowed drop of the primary metric versus the ready artifact.
    pub max_regression: f64,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            metric_floor: 0.5,
            max_regression: 0.05,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Postgres URL; without it the in-memory store is used.
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub sources: BTreeMap<SourceId, SourceConfig>,
    pub retry: RetryPolicy,
    pub timeouts: TimeoutConfig,
    pub training: TrainingConfig,
    pub scoring: ScoringConfig,
    pub promotion: PromotionConfig,
    pub store: StoreConfig,
    pub api: ApiConfig,
}

impl AppConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Load from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` for environment variables.
    ///
    /// An explicit `$SIGNALHUB_CONFIG` must exist; a missing default file
    /// means defaults.
    pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup(CONFIG_ENV) {
            Some(path) => Self::from_path(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::from_path(DEFAULT_CONFIG_PATH)?,
            None => Self::default(),
        };
        config.apply_env_overrides(lookup);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()) {
            self.store.database_url = Some(url);
        }
        if let Some(bind) = lookup("SIGNALHUB_BIND").filter(|v| !v.trim().is_empty()) {
            self.api.bind = bind;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::Invalid("retry.jitter must be within 0.0..=1.0".to_string()));
        }
        if self.promotion.metric_floor < 0.0 || !self.promotion.metric_floor.is_finite() {
            return Err(ConfigError::Invalid("promotion.metric_floor must be >= 0".to_string()));
        }
        if self.promotion.max_regression < 0.0 || !self.promotion.max_regression.is_finite() {
            return Err(ConfigError::Invalid("promotion.max_regression must be >= 0".to_string()));
        }
        if self.training.forecast_horizon_days == 0 {
            return Err(ConfigError::Invalid("training.forecast_horizon_days must be at least 1".to_string()));
        }
        for (name, value) in [
            ("timeouts.pull", self.timeouts.pull),
            ("timeouts.commit", self.timeouts.commit),
            ("training.cadence", self.training.cadence),
            ("scoring.cadence", self.scoring.cadence),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        for (source_id, source) in &self.sources {
            if source.poll_interval.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "sources.{source_id}.poll_interval must be positive"
                )));
            }
            source
                .mapping
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("sources.{source_id}.mapping: {e}")))?;
        }
        Ok(())
    }

    /// Ingestion lanes need at least one configured source.
    pub fn require_sources(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::Invalid("no [sources] configured".to_string()));
        }
        Ok(())
    }

    pub fn connector_registry(&self) -> ConnectorRegistry {
        let mut registry = ConnectorRegistry::new();
        for (source_id, source) in &self.sources {
            registry.register(source_id.clone(), source.connector.build());
        }
        registry
    }

    pub fn normalizer(&self) -> Normalizer {
        let mut normalizer = Normalizer::new();
        for (source_id, source) in &self.sources {
            normalizer.register(source_id.clone(), source.mapping.clone());
        }
        normalizer
    }
}

/// Serde adapter for durations: integer milliseconds or a string with a
/// `ms`, `s`, `m`, `h` or `d` suffix.
pub mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    const UNITS: [(&str, u64); 5] = [
        ("ms", 1),
        ("s", 1_000),
        ("m", 60_000),
        ("h", 3_600_000),
        ("d", 86_400_000),
    ];

    pub fn parse(raw: &str) -> Result<Duration, String> {
        let raw = raw.trim();
        // "ms" must be tried before "m" and "s".
        let (digits, factor) = UNITS
            .iter()
            .find_map(|(suffix, factor)| raw.strip_suffix(suffix).map(|d| (d, *factor)))
            .ok_or_else(|| format!("duration {raw:?} needs a unit (ms, s, m, h, d)"))?;
        let value: u64 = digits
            .trim()
            .parse()
            .map_err(|_| format!("invalid duration {raw:?}"))?;
        value
            .checked_mul(factor)
            .map(Duration::from_millis)
            .ok_or_else(|| format!("duration {raw:?} overflows"))
    }

    pub fn format(value: Duration) -> String {
        let ms = value.as_millis() as u64;
        let (suffix, factor) = UNITS
            .iter()
            .rev()
            .find(|(_, factor)| ms != 0 && ms % factor == 0)
            .copied()
            .unwrap_or(("ms", 1));
        format!("{}{suffix}", ms / factor)
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Millis(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => Ok(Duration::from_millis(ms)),
            Raw::Text(text) => parse(&text).map_err(serde::de::Error::custom),
        }
    }
}
