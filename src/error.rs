//! Error types for the credit engine
//!
//! Expected business outcomes (insufficient credits, a rolled-back spend) are
//! reported as `Ok(false)` by the controller. These types only cover plumbing
//! failures and programmer errors.

use thiserror::Error;

/// Failure reported by a balance authority adapter.
///
/// Cloneable so a single refresh result can be handed to every caller that
/// joined the same in-flight fetch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Network failure, timeout, or connection reset
    #[error("transport error: {0}")]
    Transport(String),

    /// Authority answered with a non-success HTTP status
    #[error("authority returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Call went through but the payload reports a business failure
    #[error("authority rejected the request: {0}")]
    Rejected(String),

    /// No balance record exists for this identity
    #[error("no balance record for {0}")]
    NotFound(String),

    /// Response body could not be decoded
    #[error("failed to decode authority response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            RemoteError::Decode(e.to_string())
        } else {
            RemoteError::Transport(e.to_string())
        }
    }
}

/// Unified error type for credit engine operations
#[derive(Debug, Error)]
pub enum QuotaError {
    /// Spend amounts must be strictly positive
    #[error("spend amount must be positive, got {0}")]
    InvalidAmount(u64),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The refresh task ended without reporting a result
    #[error("refresh for {0} was abandoned before completing")]
    RefreshAbandoned(String),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type alias for credit engine operations
pub type Result<T> = std::result::Result<T, QuotaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_converts_transparently() {
        let err: QuotaError = RemoteError::Rejected("Error: insufficient credits".into()).into();
        assert_eq!(
            err.to_string(),
            "authority rejected the request: Error: insufficient credits"
        );
    }

    #[test]
    fn test_invalid_amount_message() {
        assert_eq!(
            QuotaError::InvalidAmount(0).to_string(),
            "spend amount must be positive, got 0"
        );
    }
}
