//! Step execution.
//!
//! `StepExecutor` runs exactly one step:
//! 1. Substitutes `{{stepId}}` placeholders from the outputs visible to it.
//! 2. Dispatches the task through [`AgentRegistry::invoke`] under the step
//!    timeout, clamped to what is left of the workflow deadline.
//! 3. Retries retryable failures and step timeouts with exponential
//!    back-off until the step's [`RetryPolicy`] is exhausted.
//! 4. Stops early when the run is cancelled or its deadline passes.
//!
//! It never panics on agent failure; every outcome becomes a [`StepResult`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agents::{AgentRegistry, InvocationContext, InvokeError};
use serde_json::Value;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, RetryPolicy};
use crate::graph::Step;
use crate::run::StepResult;
use crate::{template, StepError};

// ---------------------------------------------------------------------------
// StepContext
// ---------------------------------------------------------------------------

/// Run-level state a step executes against.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: Uuid,
    /// Outputs of the steps that succeeded before this step's cycle began.
    pub outputs: Arc<HashMap<String, Value>>,
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

impl StepContext {
    pub fn new(run_id: Uuid, deadline: Instant) -> Self {
        Self {
            run_id,
            outputs: Arc::new(HashMap::new()),
            deadline,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_outputs(mut self, outputs: HashMap<String, Value>) -> Self {
        self.outputs = Arc::new(outputs);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Runs single steps against an agent registry. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StepExecutor {
    registry: Arc<AgentRegistry>,
    step_timeout: Duration,
    retry: RetryPolicy,
}

impl StepExecutor {
    pub fn new(registry: Arc<AgentRegistry>, config: &EngineConfig) -> Self {
        Self {
            registry,
            step_timeout: config.step_timeout,
            retry: config.retry,
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Per-attempt timeout: the step's own, else the configured default.
    pub fn timeout_for(&self, step: &Step) -> Duration {
        step.timeout.unwrap_or(self.step_timeout)
    }

    /// The step's retry policy, else the configured default.
    pub fn retry_for(&self, step: &Step) -> RetryPolicy {
        step.retry.unwrap_or(self.retry)
    }

    /// Run `step` to a terminal [`StepResult`].
    #[instrument(skip_all, fields(run_id = %ctx.run_id, step_id = %step.id))]
    pub async fn run(&self, step: &Step, ctx: &StepContext) -> StepResult {
        let mut result = StepResult::pending(step);
        result.start();

        match self.execute_with_retry(step, ctx).await {
            (Ok(output), attempts) => {
                debug!("step '{}' succeeded after {} attempt(s)", step.id, attempts);
                result.succeed(output, attempts);
            }
            (Err(err), attempts) => {
                match err {
                    StepError::Cancelled => debug!("step '{}' cancelled", step.id),
                    _ => error!("step '{}' failed after {} attempt(s): {}", step.id, attempts, err),
                }
                result.fail(&err, attempts);
            }
        }
        result
    }

    /// A terminal result for a step that never got to run.
    pub fn abandoned(step: &Step, err: &StepError) -> StepResult {
        let mut result = StepResult::pending(step);
        result.start();
        result.fail(err, 0);
        result
    }

    // -----------------------------------------------------------------------
    // Internal: dispatch with retry logic.
    // -----------------------------------------------------------------------

    async fn execute_with_retry(&self, step: &Step, ctx: &StepContext) -> (Result<Value, StepError>, u32) {
        let Some((agent_id, task)) = step.target() else {
            // Pure gates are evaluated by the runner and never dispatched.
            return (Ok(Value::Null), 0);
        };

        let input = match template::resolve(&step.input, &ctx.outputs) {
            Ok(input) => input,
            Err(e) => return (Err(e.into()), 0),
        };

        if !self.registry.contains(agent_id) {
            let err = InvokeError::UnknownAgent(agent_id.to_owned());
            return (Err(StepError::Dispatch(err)), 0);
        }

        let policy = self.retry_for(step);
        let timeout = self.timeout_for(step);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let invocation = InvocationContext::new(ctx.run_id, &step.id, agent_id).with_attempt(attempts);

            let outcome = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Err(StepError::Cancelled),
                _ = sleep_until(ctx.deadline) => Err(StepError::DeadlineExceeded),
                res = self.registry.invoke(agent_id, task, input.clone(), &invocation, timeout) => {
                    res.map_err(StepError::from)
                }
            };

            match outcome {
                Ok(output) => return (Ok(output), attempts),

                Err(err) if err.is_retryable() && attempts < policy.attempts() => {
                    let delay = policy.backoff(attempts);
                    warn!(
                        "step '{}' retryable error (attempt {}/{}), retrying in {:?}: {}",
                        step.id,
                        attempts,
                        policy.attempts(),
                        delay,
                        err
                    );

                    tokio::select! {
                        biased;
                        _ = ctx.cancel.cancelled() => return (Err(StepError::Cancelled), attempts),
                        _ = sleep_until(ctx.deadline) => return (Err(StepError::DeadlineExceeded), attempts),
                        _ = sleep(delay) => {}
                    }
                }

                Err(err) => return (Err(err), attempts),
            }
        }
    }
}
