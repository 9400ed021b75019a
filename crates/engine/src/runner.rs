//! Workflow run coordinator.
//!
//! `WorkflowRunner` drives a [`WorkflowRun`] from `Created` to a terminal
//! status:
//! 1. Walks the scheduler's cycles in order.
//! 2. Dispatches each cycle's parallel steps as concurrent tokio tasks,
//!    bounded by a per-run in-flight limit, and waits for all of them.
//! 3. Dispatches the cycle's serial steps one at a time, in declaration order.
//! 4. Folds every step result into the run from this task alone, applying
//!    gate activations and skip propagation as results arrive.
//! 5. Stops dispatching when the run is cancelled, its deadline passes, or a
//!    fatal error occurs, then settles the overall run status.
//!
//! Steps see only the outputs that existed when their cycle began.

use std::sync::Arc;
use std::time::Duration;

use agents::{AgentError, AgentRegistry};
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::condition::{Activation, ConditionalEvaluator};
use crate::config::EngineConfig;
use crate::events::{RunEvent, RunObserver};
use crate::executor::{StepContext, StepExecutor};
use crate::graph::WorkflowGraph;
use crate::models::WorkflowSpec;
use crate::run::{RunSnapshot, RunStatus, StepResult, StepStatus, WorkflowRun};
use crate::scheduler::Scheduler;
use crate::{EngineError, ErrorKind, StepError};

/// Outcome of folding one step result; `Err` aborts the run.
type Fold = Result<(), String>;

// ---------------------------------------------------------------------------
// WorkflowRunner
// ---------------------------------------------------------------------------

/// Executes workflow runs against one agent registry.
pub struct WorkflowRunner {
    executor: StepExecutor,
    config: EngineConfig,
    max_in_flight: usize,
    observers: Vec<Arc<dyn RunObserver>>,
}

impl WorkflowRunner {
    pub fn new(registry: Arc<AgentRegistry>, config: EngineConfig) -> Self {
        let max_in_flight = config
            .max_in_flight
            .unwrap_or_else(|| registry.total_capacity())
            .max(1);
        Self {
            executor: StepExecutor::new(registry, &config),
            config,
            max_in_flight,
            observers: Vec::new(),
        }
    }

    /// Attach an observer to every run this runner drives.
    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Create a run of `graph`; its deadline starts counting now.
    pub fn create_run(&self, graph: Arc<WorkflowGraph>, global_timeout: Option<Duration>) -> WorkflowRun {
        WorkflowRun::new(graph, global_timeout.unwrap_or(self.config.global_timeout))
    }

    /// Build `spec` and run it to completion with the default deadline.
    ///
    /// # Errors
    /// Returns [`EngineError::Graph`] if the workflow is invalid. Step and
    /// run failures are reported in the returned snapshot.
    pub async fn execute(&self, spec: WorkflowSpec) -> Result<RunSnapshot, EngineError> {
        let graph = Arc::new(WorkflowGraph::build(spec)?);
        let mut run = self.create_run(graph, None);
        self.run(&mut run, &CancellationToken::new()).await;
        Ok(run.snapshot())
    }

    /// Drive `run` to a terminal status.
    pub async fn run(&self, run: &mut WorkflowRun, cancel: &CancellationToken) -> RunStatus {
        self.drive(run, cancel, None).await
    }

    /// Like [`WorkflowRunner::run`], publishing a snapshot after every state
    /// change.
    pub async fn run_with_progress(
        &self,
        run: &mut WorkflowRun,
        cancel: &CancellationToken,
        progress: &watch::Sender<RunSnapshot>,
    ) -> RunStatus {
        self.drive(run, cancel, Some(progress)).await
    }

    // -----------------------------------------------------------------------
    // Internal: the cycle loop.
    // -----------------------------------------------------------------------

    #[instrument(skip_all, fields(run_id = %run.id(), workflow_id = %run.graph().id()))]
    async fn drive(
        &self,
        run: &mut WorkflowRun,
        cancel: &CancellationToken,
        progress: Option<&watch::Sender<RunSnapshot>>,
    ) -> RunStatus {
        if run.status().is_terminal() {
            return run.status();
        }

        let graph = Arc::clone(run.graph());
        let run_id = run.id();
        // Stops in-flight steps when the run aborts on a fatal error.
        let abort = cancel.child_token();
        let slots = Arc::new(Semaphore::new(self.max_in_flight));
        let mut fatal: Option<String> = None;

        run.transition(RunStatus::Running);
        info!(
            "run started: {} step(s), deadline in {:?}",
            graph.len(),
            run.deadline().saturating_duration_since(Instant::now())
        );
        self.emit(&RunEvent::RunStarted {
            run_id,
            workflow_id: graph.id().to_owned(),
        });
        publish(progress, run);

        for cycle in Scheduler::new(&graph).cycles() {
            if interrupted(run, cancel) {
                break;
            }
            debug!(
                cycle = cycle.index,
                parallel = ?cycle.parallel,
                serial = ?cycle.serial,
                "starting cycle"
            );

            let ctx = StepContext::new(run_id, run.deadline())
                .with_outputs(run.outputs())
                .with_cancel(abort.clone());

            // ---- parallel group ----------------------------------------
            let mut tasks = JoinSet::new();
            let mut dispatched = Vec::new();
            for id in &cycle.parallel {
                if fatal.is_some() {
                    break;
                }
                let Some(idx) = graph.index_of(id) else { continue };
                if !self.admit(run, idx) {
                    publish(progress, run);
                    continue;
                }
                if graph.step(idx).target().is_none() {
                    if let Err(msg) = self.evaluate_gate(run, idx, cycle.index) {
                        abort.cancel();
                        fatal = Some(msg);
                    }
                    publish(progress, run);
                    continue;
                }

                // Wait for an in-flight slot, folding finished steps meanwhile.
                // Steps that never get one are settled by `finish`.
                let permit = loop {
                    tokio::select! {
                        biased;
                        _ = abort.cancelled() => break None,
                        _ = sleep_until(run.deadline()) => break None,
                        permit = Arc::clone(&slots).acquire_owned() => break permit.ok(),
                        Some(joined) = tasks.join_next() => {
                            self.fold_joined(run, joined, &abort, &mut fatal);
                            publish(progress, run);
                        }
                    }
                };
                let Some(permit) = permit else { break };

                self.dispatch(run, idx, cycle.index);
                dispatched.push(idx);
                publish(progress, run);

                let step = graph.step(idx).clone();
                let executor = self.executor.clone();
                let ctx = ctx.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    (idx, executor.run(&step, &ctx).await)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                self.fold_joined(run, joined, &abort, &mut fatal);
                publish(progress, run);
            }

            // A panicked task never reports back; its step is still running.
            for idx in dispatched {
                if !run.result_at(idx).is_terminal() {
                    let err = StepError::Failure(AgentError::fatal("capability panicked"));
                    let result = StepExecutor::abandoned(graph.step(idx), &err);
                    if let Err(msg) = self.settle(run, idx, result) {
                        fatal.get_or_insert(msg);
                    }
                    publish(progress, run);
                }
            }

            // ---- serial group ------------------------------------------
            for id in &cycle.serial {
                if fatal.is_some() || interrupted(run, cancel) {
                    break;
                }
                let Some(idx) = graph.index_of(id) else { continue };
                if !self.admit(run, idx) {
                    publish(progress, run);
                    continue;
                }

                let folded = if graph.step(idx).target().is_none() {
                    self.evaluate_gate(run, idx, cycle.index)
                } else {
                    self.dispatch(run, idx, cycle.index);
                    publish(progress, run);
                    let result = self.executor.run(graph.step(idx), &ctx).await;
                    self.settle(run, idx, result)
                };
                publish(progress, run);
                if let Err(msg) = folded {
                    abort.cancel();
                    fatal = Some(msg);
                }
            }

            if fatal.is_some() {
                break;
            }
        }

        let status = self.finish(run, cancel, fatal);
        publish(progress, run);
        status
    }

    // -----------------------------------------------------------------------
    // Internal: per-step state folds. Only ever called from `drive`.
    // -----------------------------------------------------------------------

    /// Decide whether step `idx` may be dispatched, skipping it otherwise.
    fn admit(&self, run: &mut WorkflowRun, idx: usize) -> bool {
        if run.result_at(idx).is_terminal() {
            return false;
        }

        let graph = Arc::clone(run.graph());
        let blocked = graph
            .prerequisites(idx)
            .iter()
            .copied()
            .find(|&p| run.result_at(p).status != StepStatus::Succeeded);
        if let Some(p) = blocked {
            let reason = format!("upstream step '{}' did not succeed", graph.step(p).id);
            self.skip_step(run, idx, ErrorKind::Upstream, reason);
            self.skip_dependents(run, idx);
            return false;
        }

        if graph.is_gated(idx) && !run.activated_at(idx) {
            self.skip_step(run, idx, ErrorKind::Branch, "not selected by any gate");
            self.skip_dependents(run, idx);
            return false;
        }
        true
    }

    fn dispatch(&self, run: &mut WorkflowRun, idx: usize, cycle: usize) {
        run.result_mut(idx).start();
        let result = run.result_at(idx);
        let event = RunEvent::StepDispatched {
            run_id: run.id(),
            step_id: result.step_id.clone(),
            agent_id: result.agent_id.clone(),
            cycle,
        };
        self.emit(&event);
    }

    /// Resolve a pure gate in place: its output is its predicate's value.
    fn evaluate_gate(&self, run: &mut WorkflowRun, idx: usize, cycle: usize) -> Fold {
        self.dispatch(run, idx, cycle);

        let graph = Arc::clone(run.graph());
        let step = graph.step(idx);
        let mut result = run.result_at(idx).clone();
        match ConditionalEvaluator::resolve(step, &run.outputs()) {
            Ok(activation) => result.succeed(Value::Bool(activation.taken), 0),
            Err(e) => result.fail(&StepError::Template(e), 0),
        }
        self.settle(run, idx, result)
    }

    /// Fold a terminal step result into the run.
    fn settle(&self, run: &mut WorkflowRun, idx: usize, result: StepResult) -> Fold {
        let graph = Arc::clone(run.graph());
        let step = graph.step(idx);
        let status = result.status;
        let kind = result.error_kind;
        let error = result.error.clone();

        self.emit(&RunEvent::StepFinished {
            run_id: run.id(),
            step_id: step.id.clone(),
            agent_id: step.agent_id.clone(),
            status,
            attempts: result.attempts,
        });
        run.record(idx, result);

        match status {
            StepStatus::Succeeded if step.condition.is_some() => {
                let activation = ConditionalEvaluator::resolve(step, &run.outputs())
                    .map_err(|e| format!("condition on step '{}' could not be evaluated: {}", step.id, e))?;
                self.apply_activation(run, idx, activation);
            }
            StepStatus::Failed => {
                self.skip_dependents(run, idx);
                if kind == Some(ErrorKind::Template) {
                    return Err(format!(
                        "step '{}': {}",
                        step.id,
                        error.unwrap_or_default()
                    ));
                }
            }
            // Deadline and cancellation leftovers are settled by `finish`.
            _ => {}
        }
        Ok(())
    }

    /// Fold one joined parallel task, keeping the first fatal error.
    fn fold_joined(
        &self,
        run: &mut WorkflowRun,
        joined: Result<(usize, StepResult), JoinError>,
        abort: &CancellationToken,
        fatal: &mut Option<String>,
    ) {
        match joined {
            Ok((idx, result)) => {
                if let Err(msg) = self.settle(run, idx, result) {
                    abort.cancel();
                    fatal.get_or_insert(msg);
                }
            }
            Err(e) => error!("step task did not complete: {}", e),
        }
    }

    fn apply_activation(&self, run: &mut WorkflowRun, gate: usize, activation: Activation) {
        let graph = Arc::clone(run.graph());
        let gate_id = &graph.step(gate).id;
        info!(
            "gate '{}' evaluated to {}: activating {:?}",
            gate_id, activation.taken, activation.activate
        );

        for id in &activation.activate {
            if let Some(i) = graph.index_of(id) {
                run.activate(i);
            }
        }

        for id in &activation.prune {
            let Some(i) = graph.index_of(id) else { continue };
            if run.activated_at(i) || run.result_at(i).is_terminal() {
                continue;
            }
            // Another gate may still select it.
            if graph.gates(i).iter().all(|&g| run.result_at(g).is_terminal()) {
                let reason = format!("branch not selected by gate '{gate_id}'");
                self.skip_step(run, i, ErrorKind::Branch, reason);
                self.skip_dependents(run, i);
            }
        }
    }

    fn skip_step(&self, run: &mut WorkflowRun, idx: usize, kind: ErrorKind, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(step_id = %run.result_at(idx).step_id, ?kind, "skipping step: {}", reason);
        run.result_mut(idx).skip(kind, reason);

        let result = run.result_at(idx);
        let event = RunEvent::StepFinished {
            run_id: run.id(),
            step_id: result.step_id.clone(),
            agent_id: result.agent_id.clone(),
            status: StepStatus::Skipped,
            attempts: result.attempts,
        };
        self.emit(&event);
    }

    /// Skip everything downstream of `idx` that has not settled yet.
    fn skip_dependents(&self, run: &mut WorkflowRun, idx: usize) {
        let graph = Arc::clone(run.graph());
        let origin = &graph.step(idx).id;
        for d in graph.descendants(idx) {
            if !run.result_at(d).is_terminal() {
                let reason = format!("upstream step '{origin}' did not succeed");
                self.skip_step(run, d, ErrorKind::Upstream, reason);
            }
        }
    }

    fn skip_remaining(&self, run: &mut WorkflowRun, kind: ErrorKind, reason: &str) {
        for idx in 0..run.results().len() {
            if !run.result_at(idx).is_terminal() {
                self.skip_step(run, idx, kind, reason);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internal: overall status.
    // -----------------------------------------------------------------------

    fn finish(&self, run: &mut WorkflowRun, cancel: &CancellationToken, fatal: Option<String>) -> RunStatus {
        let graph = Arc::clone(run.graph());
        let unfinished = run.results().iter().any(|r| !r.is_terminal());
        let cancelled = run
            .results()
            .iter()
            .any(|r| r.error_kind == Some(ErrorKind::Cancelled));
        let deadline_hit = run.results().iter().any(|r| r.status == StepStatus::TimedOut)
            || (unfinished && Instant::now() >= run.deadline());

        let status = if let Some(msg) = fatal {
            self.skip_remaining(run, ErrorKind::Cancelled, "run aborted");
            run.set_error(msg);
            RunStatus::Failed
        } else if cancel.is_cancelled() && (unfinished || cancelled) {
            self.skip_remaining(run, ErrorKind::Cancelled, "run cancelled");
            run.set_error("run cancelled");
            RunStatus::Cancelled
        } else if deadline_hit {
            self.skip_remaining(run, ErrorKind::Deadline, "workflow deadline exceeded");
            run.set_error("workflow deadline exceeded");
            RunStatus::TimedOut
        } else {
            let blocking = (0..graph.len()).find(|&i| {
                run.result_at(i).status.is_failure() && !graph.successors(i).is_empty()
            });
            let any_succeeded = run.results().iter().any(|r| r.status == StepStatus::Succeeded);
            let any_failed = run.results().iter().any(|r| r.status.is_failure());

            if let Some(i) = blocking {
                let result = run.result_at(i);
                let msg = format!(
                    "step '{}' failed: {}",
                    result.step_id,
                    result.error.as_deref().unwrap_or_default()
                );
                run.set_error(msg);
                RunStatus::Failed
            } else if any_failed && !any_succeeded {
                run.set_error("no step succeeded");
                RunStatus::Failed
            } else {
                RunStatus::Completed
            }
        };

        run.transition(status);
        match status {
            RunStatus::Completed => info!("run completed"),
            _ => warn!("run finished as {}: {}", status, run.error().unwrap_or_default()),
        }
        self.emit(&RunEvent::RunFinished {
            run_id: run.id(),
            status,
        });
        status
    }

    fn emit(&self, event: &RunEvent) {
        for observer in &self.observers {
            observer.notify(event);
        }
    }
}

/// Whether dispatching must stop.
fn interrupted(run: &WorkflowRun, cancel: &CancellationToken) -> bool {
    cancel.is_cancelled() || Instant::now() >= run.deadline()
}

fn publish(progress: Option<&watch::Sender<RunSnapshot>>, run: &WorkflowRun) {
    if let Some(tx) = progress {
        tx.send_replace(run.snapshot());
    }
}
