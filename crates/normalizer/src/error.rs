use thiserror::Error;

use signalhub_core::SourceId;

use crate::mapping::FieldType;

/// Per-record normalization failure. The pipeline quarantines the record and
/// continues with the rest of the batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NormalizationError {
    #[error("record {record_ref}: missing required field '{field}'")]
    MissingField { field: String, record_ref: String },

    #[error("record {record_ref}: field '{field}' value {value} is not a valid {expected}")]
    InvalidValue {
        field: String,
        record_ref: String,
        value: String,
        expected: FieldType,
    },

    #[error("record {record_ref}: payload is not a JSON object")]
    NotAnObject { record_ref: String },

    #[error("no mapping registered for source '{0}'")]
    UnmappedSource(SourceId),
}

impl NormalizationError {
    /// Field at fault, when the failure is tied to one.
    pub fn field(&self) -> Option<&str> {
        match self {
            NormalizationError::MissingField { field, .. }
            | NormalizationError::InvalidValue { field, .. } => Some(field),
            NormalizationError::NotAnObject { .. } | NormalizationError::UnmappedSource(_) => None,
        }
    }
}
