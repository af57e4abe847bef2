//! Error types for Sediment

use thiserror::Error;

/// Result type alias for Sediment operations
pub type Result<T> = std::result::Result<T, SedimentError>;

/// Main error type for Sediment
#[derive(Error, Debug)]
pub enum SedimentError {
    #[error("Invalid schema: {0}")]
    Validation(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Driver error: {0}")]
    Driver(#[from] crate::driver::DriverError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SedimentError {
    /// Check if the error is retryable at the request level
    pub fn is_retryable(&self) -> bool {
        matches!(self, SedimentError::Driver(e) if e.is_retryable())
    }

    /// HTTP status the router should surface for this error
    pub fn status(&self) -> u16 {
        match self {
            SedimentError::Validation(_)
            | SedimentError::InvalidQuery(_)
            | SedimentError::BadRequest(_) => 400,
            SedimentError::NotFound(_) => 404,
            _ => 500,
        }
    }
}
