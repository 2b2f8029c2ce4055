use reqwest::StatusCode;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by authentication, token storage and the session client.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("HTTP status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("authorization request denied ({0})")]
    AuthorizationDenied(String),
    #[error("authorization response missing code parameter")]
    MissingCode,
    #[error("authorization state mismatch")]
    StateMismatch,
    #[error("authorization code exchange failed: {reason}")]
    ExchangeFailed {
        status: Option<StatusCode>,
        reason: String,
    },
    #[error("refresh token rejected: {0}")]
    RefreshInvalid(String),
    #[error("session expired")]
    SessionExpired,
    #[error("authorization callback already being processed")]
    FlowInProgress,
}

impl AuthError {
    /// Whether this error belongs to the forced-logout family.
    pub fn is_teardown(&self) -> bool {
        matches!(self, AuthError::RefreshInvalid(_) | AuthError::SessionExpired)
    }
}
