//! Error taxonomy for the orchestrator core.
//!
//! Every failure a work item or proposal can hit is classified here so that
//! retry decisions and persisted error records are uniform. Stage agents and
//! the binary use `anyhow` internally; everything crossing a component
//! boundary is an `OrchestratorError`.

use thiserror::Error;

/// Classified failure for any orchestrator operation.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A proposal or op failed validation. Surfaced on the proposal, never
    /// retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Optimistic version mismatch or uniqueness violation at commit time.
    /// The proposal fails as a whole; the caller may resubmit with fresh
    /// context.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The policy engine rejected the proposal. Terminal.
    #[error("policy rejected: {0}")]
    PolicyRejection(String),

    /// Transient I/O, lease loss, or notification failure. Re-queued with
    /// backoff.
    #[error("transient: {0}")]
    Transient(String),

    /// Invariant violation or corrupted payload. Terminal, incident logged.
    #[error("fatal: {0}")]
    Fatal(String),

    /// External cancel signal. Terminal, not retried.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl OrchestratorError {
    /// Whether a work item failing with this error should be re-queued.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OrchestratorError::Transient(_))
    }

    /// Stable code for persisted error records.
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::Validation(_) => "validation_error",
            OrchestratorError::Conflict(_) => "conflict_error",
            OrchestratorError::PolicyRejection(_) => "policy_rejection",
            OrchestratorError::Transient(_) => "transient_error",
            OrchestratorError::Fatal(_) => "fatal_error",
            OrchestratorError::Cancelled(_) => "cancellation_error",
        }
    }

    /// Suggested recovery actions, surfaced in work status views.
    pub fn recovery_actions(&self) -> Vec<String> {
        match self {
            OrchestratorError::Validation(_) => {
                vec!["fix the proposal operations and resubmit".to_string()]
            }
            OrchestratorError::Conflict(_) => {
                vec!["refetch the basket context and resubmit with current versions".to_string()]
            }
            OrchestratorError::PolicyRejection(_) => {
                vec!["request manual review or adjust basket policy".to_string()]
            }
            OrchestratorError::Transient(_) => {
                vec!["no action needed, the work item will be retried".to_string()]
            }
            OrchestratorError::Fatal(_) => {
                vec!["inspect the work payload, this failure is not retryable".to_string()]
            }
            OrchestratorError::Cancelled(_) => vec![],
        }
    }
}

impl From<sqlx::Error> for OrchestratorError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            // Unique violations surface as conflicts so commit paths can map
            // them onto the proposal FSM.
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                OrchestratorError::Conflict(err.to_string())
            }
            sqlx::Error::RowNotFound => OrchestratorError::Fatal(err.to_string()),
            _ => OrchestratorError::Transient(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Fatal(format!("payload codec: {err}"))
    }
}

/// Convenience alias used throughout the core.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_retry() {
        assert!(OrchestratorError::Transient("io".into()).is_retryable());
        assert!(!OrchestratorError::Validation("bad op".into()).is_retryable());
        assert!(!OrchestratorError::Conflict("version".into()).is_retryable());
        assert!(!OrchestratorError::PolicyRejection("locked".into()).is_retryable());
        assert!(!OrchestratorError::Fatal("corrupt".into()).is_retryable());
        assert!(!OrchestratorError::Cancelled("user".into()).is_retryable());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(OrchestratorError::Conflict("x".into()).code(), "conflict_error");
        assert_eq!(OrchestratorError::Cancelled("x".into()).code(), "cancellation_error");
    }
}
