//! The `Capability` trait — the contract every agent task must fulfil.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::AgentError;

/// Context passed to every capability invocation.
///
/// Defined here (in the agents crate) so both the engine and individual
/// capability implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// ID of the workflow run the step belongs to.
    pub run_id: Uuid,
    /// Step being executed.
    pub step_id: String,
    /// Agent the step was assigned to.
    pub agent_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
}

impl InvocationContext {
    pub fn new(run_id: Uuid, step_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            run_id,
            step_id: step_id.into(),
            agent_id: agent_id.into(),
            attempt: 1,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

/// A single named task an agent knows how to perform.
///
/// Receives the step's resolved input and returns the step's output. The
/// engine never inspects the output beyond templating and `when` predicates.
#[async_trait]
pub trait Capability: Send + Sync {
    async fn invoke(&self, input: Value, ctx: &InvocationContext) -> Result<Value, AgentError>;
}

/// Adapter turning an async closure into a [`Capability`].
///
/// ```ignore
/// let echo = FnCapability::new(|input, _ctx| async move { Ok::<_, AgentError>(input) });
/// ```
pub struct FnCapability<F, Fut> {
    func: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnCapability<F, Fut>
where
    F: Fn(Value, InvocationContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, AgentError>> + Send,
{
    pub fn new(func: F) -> Self {
        Self {
            func,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> Capability for FnCapability<F, Fut>
where
    F: Fn(Value, InvocationContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, AgentError>> + Send,
{
    async fn invoke(&self, input: Value, ctx: &InvocationContext) -> Result<Value, AgentError> {
        (self.func)(input, ctx.clone()).await
    }
}
