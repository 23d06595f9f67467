//! Core error type for the Conductor engine.
//!
//! `EngineError` carries the engine's error taxonomy:
//!
//! - `InvalidTransition`: a usage/programming error, never retried.
//! - `AgentExecution`: model/transport failure; the step ends `failed`.
//! - `Protocol`: malformed or out-of-order channel usage (e.g. resolving a
//!   tool call twice). The offending call is rejected, the step continues.
//! - `Cancelled`: expected; produces `cancelled`, not `failed`.
//!
//! The remaining variants cover infrastructure (storage, config, lookups).

/// Which record an invalid transition was attempted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionSubject {
    Step,
    Workflow,
}

impl std::fmt::Display for TransitionSubject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Step => f.write_str("step"),
            Self::Workflow => f.write_str("workflow"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid transition: {subject} cannot go from '{from}' to '{to}'")]
    InvalidTransition {
        subject: TransitionSubject,
        from: String,
        to: String,
    },

    #[error("Agent execution error: {0}")]
    AgentExecution(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn invalid_step_transition(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::InvalidTransition {
            subject: TransitionSubject::Step,
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn invalid_workflow_transition(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::InvalidTransition {
            subject: TransitionSubject::Workflow,
            from: from.into(),
            to: to.into(),
        }
    }

    /// Whether a user may sensibly retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AgentExecution(_) | Self::Database(_))
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_message() {
        let err = EngineError::invalid_step_transition("running", "pending");
        assert_eq!(
            err.to_string(),
            "Invalid transition: step cannot go from 'running' to 'pending'"
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_agent_errors_are_retryable() {
        assert!(EngineError::AgentExecution("boom".into()).is_retryable());
        assert!(!EngineError::Protocol("double resolve".into()).is_retryable());
        assert!(!EngineError::Cancelled("user".into()).is_retryable());
    }
}
