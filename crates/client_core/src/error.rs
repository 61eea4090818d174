use reqwest::StatusCode;
use thiserror::Error;

/// Failures surfaced by the session gateway.
///
/// `Clone` because a single refresh outcome is handed to every request queued
/// behind it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("request to {path} failed: {message}")]
    Transport { path: String, message: String },
    #[error("request to {path} was rejected after the session was refreshed")]
    Unauthorized { path: String },
    #[error("session refresh rejected with status {status}")]
    RefreshRejected { status: StatusCode },
    #[error("session refresh was abandoned before it settled")]
    RefreshAbandoned,
    #[error("request to {path} failed with status {status}{}", detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
    Status {
        path: String,
        status: StatusCode,
        detail: Option<String>,
    },
    #[error("invalid response body from {path}: {message}")]
    Decode { path: String, message: String },
}

impl SessionError {
    /// True when the caller should treat the user as logged out.
    pub fn is_terminal_auth_failure(&self) -> bool {
        matches!(
            self,
            SessionError::RefreshRejected { .. }
                | SessionError::RefreshAbandoned
                | SessionError::Unauthorized { .. }
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("chat channel is not connected")]
    NotConnected,
    #[error("message content cannot be empty")]
    EmptyMessage,
    #[error("message too long, maximum {max} characters")]
    MessageTooLong { max: usize },
}
