//! Run submission: start workflows in the background and observe them by ID.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::events::RunObserver;
use crate::graph::WorkflowGraph;
use crate::models::WorkflowSpec;
use crate::monitor::AgentMonitor;
use crate::run::RunSnapshot;
use crate::runner::WorkflowRunner;
use crate::EngineError;

/// Handle kept for every submitted run.
struct RunEntry {
    progress: watch::Receiver<RunSnapshot>,
    cancel: CancellationToken,
}

/// Owns a runner and the runs submitted to it.
///
/// Each run executes on its own tokio task; the service only keeps the
/// latest published snapshot and the run's cancellation token.
pub struct WorkflowService {
    runner: Arc<WorkflowRunner>,
    monitor: Arc<AgentMonitor>,
    runs: Mutex<HashMap<Uuid, RunEntry>>,
}

impl WorkflowService {
    /// Wrap `runner`, attaching an [`AgentMonitor`] to it.
    pub fn new(runner: WorkflowRunner) -> Self {
        let monitor = Arc::new(AgentMonitor::new(runner.config().monitor_threshold));
        let observer: Arc<dyn RunObserver> = monitor.clone();
        Self {
            runner: Arc::new(runner.with_observer(observer)),
            monitor,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn runner(&self) -> &WorkflowRunner {
        &self.runner
    }

    pub fn monitor(&self) -> &AgentMonitor {
        &self.monitor
    }

    /// Validate `spec` and start running it. Must be called from within a
    /// tokio runtime.
    ///
    /// # Errors
    /// Returns [`EngineError::Graph`] if the workflow is invalid; nothing is
    /// started in that case.
    pub fn submit(&self, spec: WorkflowSpec, global_timeout: Option<Duration>) -> Result<Uuid, EngineError> {
        let graph = Arc::new(WorkflowGraph::build(spec)?);
        let mut run = self.runner.create_run(graph, global_timeout);
        let run_id = run.id();

        let (tx, rx) = watch::channel(run.snapshot());
        let cancel = CancellationToken::new();
        self.runs.lock().insert(
            run_id,
            RunEntry {
                progress: rx,
                cancel: cancel.clone(),
            },
        );

        let runner = Arc::clone(&self.runner);
        tokio::spawn(async move {
            runner.run_with_progress(&mut run, &cancel, &tx).await;
        });

        info!(%run_id, "run submitted");
        Ok(run_id)
    }

    /// Latest snapshot of a run.
    pub fn status(&self, run_id: Uuid) -> Result<RunSnapshot, EngineError> {
        let runs = self.runs.lock();
        let entry = runs.get(&run_id).ok_or(EngineError::UnknownRun(run_id))?;
        let snapshot = entry.progress.borrow().clone();
        Ok(snapshot)
    }

    /// Request cancellation. Idempotent; a finished run is left as is.
    pub fn cancel(&self, run_id: Uuid) -> Result<(), EngineError> {
        let runs = self.runs.lock();
        let entry = runs.get(&run_id).ok_or(EngineError::UnknownRun(run_id))?;
        if !entry.cancel.is_cancelled() {
            info!(%run_id, "cancellation requested");
            entry.cancel.cancel();
        }
        Ok(())
    }

    /// Wait for a run to reach a terminal status.
    pub async fn wait(&self, run_id: Uuid) -> Result<RunSnapshot, EngineError> {
        let mut rx = self
            .runs
            .lock()
            .get(&run_id)
            .map(|e| e.progress.clone())
            .ok_or(EngineError::UnknownRun(run_id))?;

        let waited = rx
            .wait_for(RunSnapshot::is_terminal)
            .await
            .map(|snapshot| snapshot.clone());
        // The run task is gone; report what it last published.
        let snapshot = waited.unwrap_or_else(|_| rx.borrow().clone());
        Ok(snapshot)
    }

    /// Forget a finished run and return its final snapshot.
    ///
    /// # Errors
    /// [`EngineError::RunActive`] if the run has not finished.
    pub fn remove(&self, run_id: Uuid) -> Result<RunSnapshot, EngineError> {
        let mut runs = self.runs.lock();
        let entry = runs.get(&run_id).ok_or(EngineError::UnknownRun(run_id))?;
        let snapshot = entry.progress.borrow().clone();
        if !snapshot.is_terminal() {
            return Err(EngineError::RunActive(run_id));
        }
        runs.remove(&run_id);
        Ok(snapshot)
    }

    /// IDs of every tracked run.
    pub fn run_ids(&self) -> Vec<Uuid> {
        self.runs.lock().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::models::StepSpec;
    use crate::run::{RunStatus, StepStatus};
    use agents::mock::MockCapability;
    use agents::{Agent, AgentRegistry};
    use serde_json::json;

    fn service() -> WorkflowService {
        let registry = AgentRegistry::new()
            .with_agent(Agent::new("worker").with_capability("work", MockCapability::returning(json!("ok"))))
            .with_agent(Agent::new("sleeper").with_capability("sleep", MockCapability::hanging()))
            .with_agent(Agent::new("broken").with_capability("break", MockCapability::failing_fatal("boom")));
        WorkflowService::new(WorkflowRunner::new(Arc::new(registry), EngineConfig::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn submit_then_wait_reports_completion() {
        let service = service();
        let run_id = service
            .submit(
                WorkflowSpec::new(vec![StepSpec::new("a", "worker", "work")]),
                None,
            )
            .expect("valid workflow");

        let snapshot = service.wait(run_id).await.expect("known run");
        assert_eq!(snapshot.status, RunStatus::Completed);
        assert_eq!(snapshot.step_status("a"), Some(StepStatus::Succeeded));
        assert_eq!(service.status(run_id).expect("known run"), snapshot);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_workflow_is_rejected_at_submission() {
        let service = service();
        let err = service
            .submit(
                WorkflowSpec::new(vec![StepSpec::new("a", "worker", "work").depends_on(["ghost"])]),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Graph(_)));
        assert!(service.run_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_a_running_workflow() {
        let service = service();
        let run_id = service
            .submit(
                WorkflowSpec::new(vec![
                    StepSpec::new("wait", "sleeper", "sleep"),
                    StepSpec::new("after", "worker", "work").depends_on(["wait"]),
                ]),
                None,
            )
            .expect("valid workflow");

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(service.status(run_id).expect("known run").status, RunStatus::Running);
        assert!(matches!(service.remove(run_id), Err(EngineError::RunActive(_))));

        service.cancel(run_id).expect("known run");
        service.cancel(run_id).expect("cancel is idempotent");
        let snapshot = service.wait(run_id).await.expect("known run");
        assert_eq!(snapshot.status, RunStatus::Cancelled);
        assert_eq!(snapshot.step_status("wait"), Some(StepStatus::Skipped));
        assert_eq!(snapshot.step_status("after"), Some(StepStatus::Skipped));

        assert_eq!(service.remove(run_id).expect("finished").run_id, run_id);
        assert!(matches!(service.status(run_id), Err(EngineError::UnknownRun(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn status_reflects_progress_within_a_cycle() {
        let service = service();
        let run_id = service
            .submit(
                WorkflowSpec::new(vec![
                    StepSpec::new("a", "worker", "work"),
                    StepSpec::new("b", "sleeper", "sleep"),
                ]),
                None,
            )
            .expect("valid workflow");

        tokio::time::sleep(Duration::from_secs(1)).await;
        let snapshot = service.status(run_id).expect("known run");
        assert_eq!(snapshot.status, RunStatus::Running);
        assert_eq!(snapshot.step_status("a"), Some(StepStatus::Succeeded));
        assert_eq!(snapshot.step_status("b"), Some(StepStatus::Running));

        service.cancel(run_id).expect("known run");
        service.wait(run_id).await.expect("known run");
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_sees_failures_across_runs() {
        let service = service();
        for _ in 0..3 {
            let run_id = service
                .submit(WorkflowSpec::new(vec![StepSpec::new("b", "broken", "break")]), None)
                .expect("valid workflow");
            let snapshot = service.wait(run_id).await.expect("known run");
            assert_eq!(snapshot.status, RunStatus::Failed);
        }
        assert_eq!(service.monitor().anomalies(), vec!["broken"]);
    }

    #[test]
    fn unknown_run_ids_are_errors() {
        let service = service();
        let id = Uuid::new_v4();
        assert!(matches!(service.status(id), Err(EngineError::UnknownRun(_))));
        assert!(matches!(service.cancel(id), Err(EngineError::UnknownRun(_))));
        assert!(matches!(service.remove(id), Err(EngineError::UnknownRun(_))));
    }
}
