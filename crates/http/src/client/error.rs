//! Client error types

use lectern_core::CoreError;
use thiserror::Error;

/// Why a token refresh did not produce a usable access token.
///
/// Cloned to every caller queued behind the same refresh.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    /// There is nothing to refresh with
    #[error("No refresh token available")]
    NoRefreshToken,

    /// The refresh endpoint refused the refresh token
    #[error("Refresh rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// No response was received from the refresh endpoint
    #[error("Network error during refresh: {0}")]
    Network(String),

    /// The refresh endpoint answered with something unusable
    #[error("Invalid refresh response: {0}")]
    InvalidResponse(String),

    /// The refreshed session could not be persisted
    #[error("Failed to store refreshed session: {0}")]
    Storage(String),

    /// The refresh task ended without reporting an outcome
    #[error("Refresh abandoned before completing")]
    Abandoned,
}

/// Client error types
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or request error
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Server returned an error status
    #[error("Server error {status}: {message}")]
    ServerError { status: u16, message: String },

    /// Authentication failed and could not be recovered
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Bad request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Forbidden
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The session could not be refreshed
    #[error("Session refresh failed: {0}")]
    Refresh(#[from] RefreshError),

    /// Session storage failed
    #[error("Session storage error: {0}")]
    Storage(#[from] CoreError),
}

impl ClientError {
    /// Create error from HTTP status code
    pub fn from_status(status: reqwest::StatusCode, message: String) -> Self {
        match status.as_u16() {
            400 => Self::BadRequest(message),
            401 => Self::AuthenticationFailed(message),
            403 => Self::Forbidden(message),
            404 => Self::NotFound(message),
            _ => Self::ServerError {
                status: status.as_u16(),
                message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_from_status_mapping() {
        assert!(matches!(
            ClientError::from_status(StatusCode::UNAUTHORIZED, "nope".into()),
            ClientError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            ClientError::from_status(StatusCode::FORBIDDEN, "nope".into()),
            ClientError::Forbidden(_)
        ));
        assert!(matches!(
            ClientError::from_status(StatusCode::BAD_GATEWAY, "down".into()),
            ClientError::ServerError { status: 502, .. }
        ));
    }
}
