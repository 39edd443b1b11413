//! `signalhub-models`
//!
//! **Responsibility:** pluggable model backends behind a fixed train/score contract.
//!
//! This crate is intentionally storage-agnostic:
//! - It never reads the store; inputs are snapshots handed over by the scheduler.
//! - It never writes predictions; it returns scored values for the caller to persist.
//! - Trained state travels as JSON inside the model artifact.

pub mod backend;
pub mod churn;
pub mod error;
pub mod forecast;
pub mod registry;
mod stats;

pub use backend::{ModelBackend, ModelInput, ScoredValue, TrainedModel};
pub use churn::{ChurnBackend, ChurnConfig, Indicator};
pub use error::ModelError;
pub use forecast::{ForecastBackend, ForecastConfig};
pub use registry::BackendRegistry;
