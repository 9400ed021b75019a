//! Agent-level error types.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by a capability's `invoke` method.
///
/// The engine uses the variant to decide retry behaviour:
/// - `Retryable` — the step is re-invoked with exponential back-off.
/// - `Fatal`     — the step is immediately marked as failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// Transient failure; the engine should re-try the step.
    #[error("retryable agent error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal agent error: {0}")]
    Fatal(String),
}

impl AgentError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }
}

/// Errors produced by [`crate::AgentRegistry::invoke`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvokeError {
    /// No agent is registered under this identifier.
    #[error("unknown agent '{0}'")]
    UnknownAgent(String),

    /// The agent exists but exposes no capability with this task name.
    #[error("agent '{agent_id}' has no capability named '{task}'")]
    UnknownTask { agent_id: String, task: String },

    /// The capability did not return within its time budget.
    #[error("agent '{agent_id}' task '{task}' timed out after {after:?}")]
    TimedOut {
        agent_id: String,
        task: String,
        after: Duration,
    },

    /// The capability itself reported an error.
    #[error(transparent)]
    Agent(#[from] AgentError),
}

impl InvokeError {
    /// Whether the failure is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TimedOut { .. } | Self::Agent(AgentError::Retryable(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(InvokeError::from(AgentError::retryable("flaky")).is_retryable());
        assert!(InvokeError::TimedOut {
            agent_id: "a".into(),
            task: "t".into(),
            after: Duration::from_secs(1),
        }
        .is_retryable());

        assert!(!InvokeError::from(AgentError::fatal("boom")).is_retryable());
        assert!(!InvokeError::UnknownAgent("ghost".into()).is_retryable());
        assert!(!InvokeError::UnknownTask {
            agent_id: "a".into(),
            task: "nope".into(),
        }
        .is_retryable());
    }
}
