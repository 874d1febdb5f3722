//! Entitlement engine error types.

use thiserror::Error;

/// Error type for backend calls and token acquisition.
#[derive(Error, Debug)]
pub enum AuthError {
    /// The access token was rejected as expired or malformed. Retryable once
    /// after a refresh.
    #[error("Access token expired")]
    ExpiredToken,

    /// The session was invalidated server-side (revoked, user deleted, banned).
    #[error("Session revoked: {0}")]
    SessionRevoked(String),

    /// The refresh token was explicitly rejected.
    #[error("Refresh token rejected: {0}")]
    RefreshRejected(String),

    /// Non-success response that is neither an expiry nor a revocation.
    #[error("Backend error: HTTP {status} ({body_summary})")]
    Backend { status: u16, body_summary: String },

    /// A session handed over for import is unusable.
    #[error("Invalid session: {0}")]
    InvalidSession(String),

    /// Response body did not have the expected shape
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] token_storage::StorageError),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parse error
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Network unavailable (transient error, can retry)
    #[error("Network unavailable")]
    NetworkUnavailable,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AuthError {
    /// Returns true if this error is transient: the current state should be
    /// kept and the next poll will try again.
    pub fn is_transient(&self) -> bool {
        match self {
            AuthError::NetworkUnavailable | AuthError::Timeout => true,
            AuthError::Backend { status, .. } => *status >= 500 || *status == 429,
            AuthError::UnexpectedResponse(_) | AuthError::Json(_) => true,
            AuthError::Http(e) => {
                if e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() {
                    return true;
                }
                if let Some(status) = e.status() {
                    return status.is_server_error();
                }
                e.is_decode()
            }
            _ => false,
        }
    }

    /// Returns true if the error means local credentials must be discarded.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AuthError::SessionRevoked(_) | AuthError::RefreshRejected(_)
        )
    }
}

/// Result type alias using AuthError.
pub type AuthResult<T> = Result<T, AuthError>;
