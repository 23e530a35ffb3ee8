//! Error taxonomy for the mirroring engine.
//!
//! Persistence and CLI code uses `anyhow`; everything that crosses a session
//! or coordinator boundary uses [`CopyError`] so callers can tell terminal
//! failures from retryable ones.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CopyError {
    /// Bad caller input. Rejected before any state changes.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Credential rejected by the remote side.
    #[error("authorization rejected: {0}")]
    Auth(String),

    /// Credential authorized but lacks a required scope.
    #[error("insufficient scope: {0}")]
    InsufficientScope(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// Policy mutation attempted while copying is in progress.
    #[error("policy is locked while copying is {0}")]
    PolicyLocked(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("no follower session could be authorized")]
    NoAuthorizedFollowers,

    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl CopyError {
    /// Terminal errors mean the credential itself is unusable; never retry them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CopyError::Auth(_) | CopyError::InsufficientScope(_))
    }

    /// Network-level failures. The supervisor retries these and nothing else.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CopyError::Transport(_) | CopyError::Timeout(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CopyError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        CopyError::Transport(err.to_string())
    }
}

pub type CopyResult<T> = Result<T, CopyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classification() {
        assert!(CopyError::Auth("bad token".into()).is_terminal());
        assert!(CopyError::InsufficientScope("trade".into()).is_terminal());
        assert!(!CopyError::Transport("reset".into()).is_terminal());
        assert!(CopyError::Timeout("authorize".into()).is_retryable());
        assert!(!CopyError::PolicyLocked("active".into()).is_retryable());
    }
}
