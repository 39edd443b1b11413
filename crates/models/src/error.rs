use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("insufficient training data: {0}")]
    InsufficientData(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The artifact's parameters cannot be read by this backend.
    #[error("invalid artifact: {0}")]
    InvalidArtifact(String),

    #[error("training cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}
