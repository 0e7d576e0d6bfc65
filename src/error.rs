//! Error types for directory access
//!
//! Errors are classified by recoverability:
//! - Retryable: network issues, timeouts, 5xx and 429 responses
//! - NonRetryable: configuration errors, unexpected response shapes

use thiserror::Error;

/// Errors from the external user directory.
///
/// None of these ever reach the UI. Callers reduce them to "no mapping
/// available now" and log a line.
#[derive(Debug, Error)]
pub enum DirectoryError {
    // Retryable errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Directory request timed out after {0} seconds")]
    Timeout(u64),

    #[error("Directory returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    // Non-retryable errors
    #[error("Failed to parse directory response: {0}")]
    Parse(String),

    #[error("Invalid directory configuration: {0}")]
    InvalidConfig(String),
}

impl DirectoryError {
    /// Returns true if a later attempt may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            DirectoryError::Network(_) | DirectoryError::Timeout(_) => true,
            DirectoryError::Status { status, .. } => *status == 429 || *status >= 500,
            DirectoryError::Parse(_) | DirectoryError::InvalidConfig(_) => false,
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            DirectoryError::Timeout(timeout_secs)
        } else {
            DirectoryError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for DirectoryError {
    fn from(err: serde_json::Error) -> Self {
        DirectoryError::Parse(err.to_string())
    }
}
