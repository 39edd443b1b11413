//! `signalhub-normalizer`: maps raw source records onto the canonical schema.
//!
//! Mappings are declarative (one [`SourceMapping`] per source id) and the
//! transformation is pure: the only time input is the caller's `processed_at`.

mod coerce;
pub mod error;
pub mod mapping;
pub mod normalizer;

pub use error::NormalizationError;
pub use mapping::{FieldSpec, FieldType, SourceMapping};
pub use normalizer::Normalizer;
