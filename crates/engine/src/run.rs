//! Run state: per-step results, the run lifecycle, and snapshots.
//!
//! A [`WorkflowRun`] is owned and mutated exclusively by the
//! [`crate::WorkflowRunner`] driving it. Callers observe it through
//! [`RunSnapshot`]s.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use crate::graph::{Step, WorkflowGraph};
use crate::{ErrorKind, StepError};

/// Deadline used when `now + global_timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

// ---------------------------------------------------------------------------
// StepStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a single step: `pending → running → terminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    TimedOut,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Failed outright or cut off by the workflow deadline.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

impl FromStr for StepStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending"   => Ok(Self::Pending),
            "running"   => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed"    => Ok(Self::Failed),
            "skipped"   => Ok(Self::Skipped),
            "timed_out" => Ok(Self::TimedOut),
            other       => Err(format!("unknown step status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// StepResult
// ---------------------------------------------------------------------------

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub agent_id: Option<String>,
    pub status: StepStatus,
    /// Output of a succeeded step; the value templating and predicates read.
    pub output: Option<Value>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Capability invocations made.
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepResult {
    pub fn pending(step: &Step) -> Self {
        Self {
            step_id: step.id.clone(),
            agent_id: step.agent_id.clone(),
            status: StepStatus::Pending,
            output: None,
            error: None,
            error_kind: None,
            attempts: 0,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub(crate) fn start(&mut self) {
        self.status = StepStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn succeed(&mut self, output: Value, attempts: u32) {
        self.status = StepStatus::Succeeded;
        self.output = Some(output);
        self.attempts = attempts;
        self.finished_at = Some(Utc::now());
    }

    /// Record a terminal error. Deadline interruptions become `timed_out`,
    /// cancellations `skipped`, everything else `failed`.
    pub(crate) fn fail(&mut self, err: &StepError, attempts: u32) {
        self.status = match err {
            StepError::DeadlineExceeded => StepStatus::TimedOut,
            StepError::Cancelled => StepStatus::Skipped,
            _ => StepStatus::Failed,
        };
        self.output = None;
        self.error = Some(err.to_string());
        self.error_kind = Some(err.kind());
        self.attempts = attempts;
        self.finished_at = Some(Utc::now());
    }

    pub(crate) fn skip(&mut self, kind: ErrorKind, reason: impl Into<String>) {
        self.status = StepStatus::Skipped;
        self.error = Some(reason.into());
        self.error_kind = Some(kind);
        self.finished_at = Some(Utc::now());
    }
}

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

/// `Created → Running → {Completed, Failed, Cancelled, TimedOut}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Created | Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowRun
// ---------------------------------------------------------------------------

/// One execution instance of a workflow.
#[derive(Debug)]
pub struct WorkflowRun {
    id: Uuid,
    graph: Arc<WorkflowGraph>,
    /// Indexed like `graph.steps()`.
    results: Vec<StepResult>,
    /// Gated steps selected by at least one gate.
    activated: HashSet<usize>,
    status: RunStatus,
    deadline: Instant,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl WorkflowRun {
    /// Create a run whose deadline is `global_timeout` from now.
    pub fn new(graph: Arc<WorkflowGraph>, global_timeout: Duration) -> Self {
        let results = graph.steps().iter().map(StepResult::pending).collect();
        let now = Instant::now();
        let deadline = now
            .checked_add(global_timeout)
            .unwrap_or_else(|| now + FAR_FUTURE);
        Self {
            id: Uuid::new_v4(),
            graph,
            results,
            activated: HashSet::new(),
            status: RunStatus::Created,
            deadline,
            created_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn graph(&self) -> &Arc<WorkflowGraph> {
        &self.graph
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn results(&self) -> &[StepResult] {
        &self.results
    }

    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.graph.index_of(step_id).map(|i| &self.results[i])
    }

    pub fn is_activated(&self, step_id: &str) -> bool {
        self.graph
            .index_of(step_id)
            .is_some_and(|i| self.activated.contains(&i))
    }

    /// Outputs of every succeeded step, keyed by step ID.
    pub fn outputs(&self) -> HashMap<String, Value> {
        self.results
            .iter()
            .filter(|r| r.status == StepStatus::Succeeded)
            .filter_map(|r| r.output.clone().map(|o| (r.step_id.clone(), o)))
            .collect()
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.id,
            workflow_id: self.graph.id().to_owned(),
            workflow_name: self.graph.name().map(str::to_owned),
            status: self.status,
            steps: self.results.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }

    // -- mutation, runner only -------------------------------------------

    pub(crate) fn result_at(&self, idx: usize) -> &StepResult {
        &self.results[idx]
    }

    pub(crate) fn result_mut(&mut self, idx: usize) -> &mut StepResult {
        &mut self.results[idx]
    }

    pub(crate) fn record(&mut self, idx: usize, result: StepResult) {
        self.results[idx] = result;
    }

    pub(crate) fn activate(&mut self, idx: usize) {
        self.activated.insert(idx);
    }

    pub(crate) fn activated_at(&self, idx: usize) -> bool {
        self.activated.contains(&idx)
    }

    pub(crate) fn set_error(&mut self, error: impl Into<String>) {
        self.error.get_or_insert_with(|| error.into());
    }

    /// Apply a lifecycle transition. Terminal states are absorbing.
    pub(crate) fn transition(&mut self, to: RunStatus) -> bool {
        if self.status.is_terminal() || self.status == to {
            return false;
        }
        self.status = to;
        if to.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        true
    }
}

// ---------------------------------------------------------------------------
// RunSnapshot
// ---------------------------------------------------------------------------

/// Point-in-time copy of a run, safe to hand to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub workflow_name: Option<String>,
    pub status: RunStatus,
    /// Every step in declaration order.
    pub steps: Vec<StepResult>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunSnapshot {
    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.step(step_id).map(|s| s.status)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Step IDs currently in `status`, in declaration order.
    pub fn with_status(&self, status: StepStatus) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.status == status)
            .map(|s| s.step_id.as_str())
            .collect()
    }

    /// Outputs of succeeded steps.
    pub fn completed(&self) -> BTreeMap<&str, &Value> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Succeeded)
            .filter_map(|s| s.output.as_ref().map(|o| (s.step_id.as_str(), o)))
            .collect()
    }

    /// Error detail of failed and timed-out steps.
    pub fn failed(&self) -> BTreeMap<&str, &str> {
        self.steps
            .iter()
            .filter(|s| s.status.is_failure())
            .map(|s| (s.step_id.as_str(), s.error.as_deref().unwrap_or_default()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{StepSpec, WorkflowSpec};
    use agents::AgentError;
    use serde_json::json;

    fn run() -> WorkflowRun {
        let graph = WorkflowGraph::build(WorkflowSpec::new(vec![
            StepSpec::new("a", "agent", "task"),
            StepSpec::new("b", "agent", "task").depends_on(["a"]),
        ]))
        .expect("valid");
        WorkflowRun::new(Arc::new(graph), Duration::from_secs(10))
    }

    #[test]
    fn new_run_has_pending_results() {
        let run = run();
        assert_eq!(run.status(), RunStatus::Created);
        assert!(run.results().iter().all(|r| r.status == StepStatus::Pending));
        assert!(run.outputs().is_empty());
    }

    #[test]
    fn oversized_global_timeout_saturates_to_a_far_deadline() {
        let graph = Arc::clone(run().graph());
        let run = WorkflowRun::new(graph, Duration::MAX);
        assert_eq!(run.status(), RunStatus::Created);
        assert!(run.deadline() >= Instant::now() + Duration::from_secs(86_400 * 365));
    }

    #[test]
    fn terminal_status_is_absorbing() {
        let mut run = run();
        assert!(run.transition(RunStatus::Running));
        assert!(run.transition(RunStatus::Cancelled));
        assert!(!run.transition(RunStatus::Completed));
        assert_eq!(run.status(), RunStatus::Cancelled);
        assert!(run.snapshot().finished_at.is_some());
    }

    #[test]
    fn failure_statuses_follow_error_kind() {
        let mut run = run();
        let result = run.result_mut(0);
        result.start();
        result.fail(&StepError::DeadlineExceeded, 1);
        assert_eq!(result.status, StepStatus::TimedOut);
        assert_eq!(result.error_kind, Some(ErrorKind::Deadline));

        let result = run.result_mut(1);
        result.start();
        result.fail(&StepError::Failure(AgentError::Fatal("x".into())), 2);
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.attempts, 2);

        let snapshot = run.snapshot();
        assert_eq!(snapshot.failed().len(), 2);
        assert_eq!(snapshot.with_status(StepStatus::Failed), vec!["b"]);
    }

    #[test]
    fn outputs_only_include_succeeded_steps() {
        let mut run = run();
        run.result_mut(0).succeed(json!({ "rows": 3 }), 1);
        run.result_mut(1).skip(ErrorKind::Upstream, "nope");

        let outputs = run.outputs();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs["a"], json!({ "rows": 3 }));
        assert_eq!(run.snapshot().completed().len(), 1);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            StepStatus::Pending,
            StepStatus::Running,
            StepStatus::Succeeded,
            StepStatus::Failed,
            StepStatus::Skipped,
            StepStatus::TimedOut,
        ] {
            assert_eq!(status.to_string().parse::<StepStatus>(), Ok(status));
        }
        assert!("exploded".parse::<StepStatus>().is_err());
    }
}
