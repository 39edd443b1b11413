//! `signalhub-core`: canonical data model building blocks.
//!
//! This crate contains **pure** primitives shared by connectors, the
//! normalizer, model backends and infrastructure (no IO).

pub mod cancel;
pub mod entity;
pub mod error;
pub mod id;
pub mod model;
pub mod value;
pub mod watermark;

pub use cancel::CancellationToken;
pub use entity::{CanonicalEntity, EntityRef, EntityType, Provenance, SourceRecord};
pub use error::{DomainError, DomainResult};
pub use id::{BatchId, EntityKey, JobId, ModelId, SnapshotId, SourceId};
pub use model::{
    ArtifactStatus, ModelArtifact, ModelType, Prediction, PredictionValue, TimeRange, select_current,
    select_current_run,
};
pub use value::AttrValue;
pub use watermark::Watermark;
