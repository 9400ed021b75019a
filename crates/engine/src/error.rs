//! Engine-level error types.

use std::fmt;
use std::time::Duration;

use agents::{AgentError, InvokeError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Graph construction
// ---------------------------------------------------------------------------

/// Where a step reference was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    DependsOn,
    Branch,
    Template,
    Condition,
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DependsOn => write!(f, "depends_on"),
            Self::Branch => write!(f, "then/else"),
            Self::Template => write!(f, "input template"),
            Self::Condition => write!(f, "when predicate"),
        }
    }
}

/// Errors raised while building a [`crate::WorkflowGraph`]. Fatal to the run
/// before it starts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Two or more steps share the same ID.
    #[error("duplicate step ID: '{0}'")]
    DuplicateId(String),

    /// A step references a step ID that doesn't exist in the workflow.
    #[error("step '{step}' references unknown step '{reference}' ({kind})")]
    UnknownReference {
        step: String,
        reference: String,
        kind: ReferenceKind,
    },

    /// Depth-first search found a back-edge.
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    /// A required field is absent.
    #[error("step '{step}' is missing required field '{field}'")]
    MissingField { step: String, field: &'static str },

    /// A field is present but its value is unusable.
    #[error("step '{step}' has invalid '{field}': {message}")]
    InvalidField {
        step: String,
        field: &'static str,
        message: String,
    },

    /// The `when` predicate does not parse.
    #[error("step '{step}' has an invalid condition: {message}")]
    InvalidCondition { step: String, message: String },
}

// ---------------------------------------------------------------------------
// Templating
// ---------------------------------------------------------------------------

/// Errors raised while substituting `{{stepId}}` placeholders.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// The referenced step has no successful result.
    #[error("unresolved reference '{{{{{reference}}}}}'")]
    UnresolvedReference { reference: String },
}

// ---------------------------------------------------------------------------
// Step execution
// ---------------------------------------------------------------------------

/// Coarse classification of a step error, kept in [`crate::StepResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Input templating failed.
    Template,
    /// The agent or task could not be resolved.
    Dispatch,
    /// The capability reported an error.
    Failure,
    /// The step exceeded its own timeout on every attempt.
    Timeout,
    /// The workflow deadline elapsed while the step was pending or running.
    Deadline,
    /// The run was cancelled.
    Cancelled,
    /// A prerequisite did not succeed.
    Upstream,
    /// The step sat on a conditional branch that was not selected.
    Branch,
}

/// Why a single step did not succeed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Unknown agent or unknown task.
    #[error("dispatch failed: {0}")]
    Dispatch(InvokeError),

    #[error("{0}")]
    Failure(AgentError),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("workflow deadline exceeded")]
    DeadlineExceeded,

    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Template(_) => ErrorKind::Template,
            Self::Dispatch(_) => ErrorKind::Dispatch,
            Self::Failure(_) => ErrorKind::Failure,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::DeadlineExceeded => ErrorKind::Deadline,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Failure(AgentError::Retryable(_))
        )
    }
}

impl From<InvokeError> for StepError {
    fn from(err: InvokeError) -> Self {
        match err {
            InvokeError::TimedOut { after, .. } => Self::Timeout(after),
            InvokeError::Agent(e) => Self::Failure(e),
            other @ (InvokeError::UnknownAgent(_) | InvokeError::UnknownTask { .. }) => {
                Self::Dispatch(other)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Errors produced by workflow parsing and the run submission service.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid workflow: {0}")]
    Graph(#[from] GraphError),

    #[error("malformed workflow JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed workflow YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unknown run '{0}'")]
    UnknownRun(Uuid),

    #[error("run '{0}' has not finished yet")]
    RunActive(Uuid),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_errors_map_to_step_errors() {
        let timeout = StepError::from(InvokeError::TimedOut {
            agent_id: "a".into(),
            task: "t".into(),
            after: Duration::from_secs(2),
        });
        assert_eq!(timeout, StepError::Timeout(Duration::from_secs(2)));
        assert!(timeout.is_retryable());

        let unknown = StepError::from(InvokeError::UnknownAgent("ghost".into()));
        assert_eq!(unknown.kind(), ErrorKind::Dispatch);
        assert!(!unknown.is_retryable());

        let fatal = StepError::from(InvokeError::Agent(AgentError::Fatal("x".into())));
        assert_eq!(fatal.kind(), ErrorKind::Failure);
        assert!(!fatal.is_retryable());
    }

    #[test]
    fn messages_name_the_offending_steps() {
        let err = GraphError::CycleDetected {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");

        let err = TemplateError::UnresolvedReference { reference: "prep".into() };
        assert_eq!(err.to_string(), "unresolved reference '{{prep}}'");
    }
}
