//! Session orchestration errors.

use thiserror::Error;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors reported to callers of the session service.
///
/// Failures during teardown are not represented here: they are collected in a
/// [`CleanupReport`](super::CleanupReport) and logged.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Bad input, rejected before any resource is allocated.
    #[error("invalid request: {0}")]
    Validation(String),

    /// No host port could be reserved.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The configured session limit has been reached.
    #[error("session limit reached ({limit} active sessions)")]
    AdmissionDenied { limit: usize },

    /// Fetching the source or starting the container failed.
    #[error("provisioning session {session_id} failed: {message}")]
    Provisioning { session_id: String, message: String },

    /// No session with this ID (or it has no container yet).
    #[error("session not found: {0}")]
    NotFound(String),

    /// The container runtime failed outside of session creation.
    #[error("container runtime error: {0}")]
    Runtime(String),
}

impl SessionError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    pub fn provisioning(session_id: &str, message: impl std::fmt::Display) -> Self {
        Self::Provisioning {
            session_id: session_id.to_string(),
            message: message.to_string(),
        }
    }
}

impl From<crate::ports::PortError> for SessionError {
    fn from(err: crate::ports::PortError) -> Self {
        Self::ResourceExhausted(err.to_string())
    }
}
