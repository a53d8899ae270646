//! Error types for gearlink operations.
//!
//! Failures the connection cycle absorbs on its own (pending authorization,
//! transient network errors, cache corruption) never surface here; they are
//! resolved inside the token loop. `GearError` covers the cases an
//! application call site can actually act on.

use thiserror::Error;

/// Main error type for gear operations
#[derive(Debug, Error)]
pub enum GearError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("broker request failed: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("token exchange rejected: {reason}")]
    TokenRejected { reason: String },

    #[error("token revocation failed: {reason}")]
    RevokeFailed { reason: String },

    #[error("gear is not connected to the broker")]
    NotConnected,

    #[error("a connection is already in progress")]
    AlreadyConnected,

    #[error("connection attempt aborted: {reason}")]
    ConnectAborted { reason: String },

    #[error("invalid broker endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl GearError {
    /// Create a token rejection error
    pub fn token_rejected<S: Into<String>>(reason: S) -> Self {
        Self::TokenRejected {
            reason: reason.into(),
        }
    }

    /// Create a revocation failure error
    pub fn revoke_failed<S: Into<String>>(reason: S) -> Self {
        Self::RevokeFailed {
            reason: reason.into(),
        }
    }

    /// Create a connect-aborted error
    pub fn connect_aborted<S: Into<String>>(reason: S) -> Self {
        Self::ConnectAborted {
            reason: reason.into(),
        }
    }
}

/// Result type for gear operations
pub type GearResult<T> = Result<T, GearError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_rejected_constructor() {
        let error = GearError::token_rejected("bad key");
        assert!(matches!(error, GearError::TokenRejected { .. }));
        assert_eq!(error.to_string(), "token exchange rejected: bad key");
    }

    #[test]
    fn test_revoke_failed_constructor() {
        let error = GearError::revoke_failed("FAILED");
        assert!(matches!(error, GearError::RevokeFailed { .. }));
        assert_eq!(error.to_string(), "token revocation failed: FAILED");
    }

    #[test]
    fn test_not_connected_display() {
        assert_eq!(
            GearError::NotConnected.to_string(),
            "gear is not connected to the broker"
        );
    }

    #[test]
    fn test_invalid_endpoint_display() {
        let error = GearError::InvalidEndpoint("not-a-url".to_string());
        assert!(error.to_string().contains("not-a-url"));
    }
}
