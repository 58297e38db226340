//! Error types for the resource-usage meter
//!
//! Provides a unified error type and a `Result` alias used across the crate.

use thiserror::Error;

/// Result type alias using MeterError
pub type Result<T> = std::result::Result<T, MeterError>;

/// Unified error type for meter operations
///
/// `Clone` so read failures can be fanned out on the broadcast error channel.
#[derive(Debug, Clone, Error)]
pub enum MeterError {
    // Platform accounting call failed or returned malformed data
    #[error("Failed to read resource usage: {0}")]
    UsageRead(String),

    // Configuration errors (invalid interval, zero channel capacity)
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for MeterError {
    fn from(err: std::io::Error) -> Self {
        MeterError::UsageRead(err.to_string())
    }
}
