//! Error types shared across the deposit workspace

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised by the shared utilities
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
}
