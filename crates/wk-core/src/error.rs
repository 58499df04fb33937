//! Error taxonomy for the game engine.
//!
//! Domain services translate every internal failure into one of these kinds;
//! the API layer maps them onto the wire envelope and an HTTP status. Only
//! `Fatal` and `TransientBackend` surface as 5xx.

use thiserror::Error;

use crate::types::ResourceKind;

pub type GameResult<T> = Result<T, GameError>;

/// Errors that can occur while processing a player command or a timed-task
/// completion.
#[derive(Debug, Error)]
pub enum GameError {
    /// Malformed or missing fields in the request payload.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The entity does not exist for this user.
    #[error("not found: {0}")]
    NotFound(String),

    /// A precondition was violated (already in progress, max level, …).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A cost check failed; the caller's resources are untouched.
    #[error("insufficient {0}")]
    InsufficientResources(ResourceKind),

    /// Permission check failed (rank, ownership).
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Could not acquire the user or alliance lock within the deadline.
    #[error("lock timeout on {0}")]
    LockTimeout(String),

    /// Cache or persistence is unavailable; the caller may retry.
    #[error("backend unavailable: {0}")]
    TransientBackend(String),

    /// Invariant violation. Fails fast, logged at error severity.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl GameError {
    /// Whether this error should surface as a 5xx to the transport layer.
    pub fn is_internal(&self) -> bool {
        matches!(self, GameError::TransientBackend(_) | GameError::Fatal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_resource_kind() {
        let e = GameError::InsufficientResources(ResourceKind::Food);
        assert_eq!(e.to_string(), "insufficient food");
    }

    #[test]
    fn internal_classification() {
        assert!(GameError::Fatal("x".into()).is_internal());
        assert!(GameError::TransientBackend("x".into()).is_internal());
        assert!(!GameError::Conflict("x".into()).is_internal());
        assert!(!GameError::Validation("x".into()).is_internal());
    }
}
