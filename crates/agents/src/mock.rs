//! `MockCapability` — a test double for `Capability`.
//!
//! Useful in unit and integration tests where a real agent implementation is
//! either unavailable or irrelevant.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::{AgentError, Capability, InvocationContext};

/// Behaviour injected into `MockCapability` at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Return the input unchanged.
    Echo,
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Fail with a `Retryable` error for the first `failures` calls, then
    /// return the value.
    Flaky { failures: usize, value: Value },
    /// Sleep, then return the value.
    Delayed { value: Value, delay: Duration },
    /// Never return.
    Hang,
}

/// A mock capability that records every call it receives and returns a
/// programmer-specified result.
#[derive(Debug)]
pub struct MockCapability {
    /// What the capability will do when `invoke` is called.
    pub behaviour: MockBehaviour,
    /// All inputs seen by this capability (in call order).
    calls: Mutex<Vec<Value>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockCapability {
    pub fn new(behaviour: MockBehaviour) -> Self {
        Self {
            behaviour,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Always succeeds with the given value.
    pub fn returning(value: Value) -> Self {
        Self::new(MockBehaviour::ReturnValue(value))
    }

    /// Always succeeds with its own input.
    pub fn echo() -> Self {
        Self::new(MockBehaviour::Echo)
    }

    /// Always fails with a `Retryable` error.
    pub fn failing_retryable(msg: impl Into<String>) -> Self {
        Self::new(MockBehaviour::FailRetryable(msg.into()))
    }

    /// Always fails with a `Fatal` error.
    pub fn failing_fatal(msg: impl Into<String>) -> Self {
        Self::new(MockBehaviour::FailFatal(msg.into()))
    }

    /// Fails `failures` times with a `Retryable` error, then succeeds.
    pub fn flaky(failures: usize, value: Value) -> Self {
        Self::new(MockBehaviour::Flaky { failures, value })
    }

    /// Succeeds with `value` after `delay`.
    pub fn delayed(value: Value, delay: Duration) -> Self {
        Self::new(MockBehaviour::Delayed { value, delay })
    }

    /// Never returns.
    pub fn hanging() -> Self {
        Self::new(MockBehaviour::Hang)
    }

    /// Number of times this capability has been invoked.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Inputs received so far, in call order.
    pub fn calls(&self) -> Vec<Value> {
        self.calls.lock().clone()
    }

    /// Highest number of invocations observed running at the same time.
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Capability for MockCapability {
    async fn invoke(&self, input: Value, _ctx: &InvocationContext) -> Result<Value, AgentError> {
        let call_index = {
            let mut calls = self.calls.lock();
            calls.push(input.clone());
            calls.len() - 1
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(v.clone()),
            MockBehaviour::Echo => Ok(input),
            MockBehaviour::FailRetryable(msg) => Err(AgentError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(AgentError::Fatal(msg.clone())),
            MockBehaviour::Flaky { failures, value } => {
                if call_index < *failures {
                    Err(AgentError::Retryable(format!("transient failure #{}", call_index + 1)))
                } else {
                    Ok(value.clone())
                }
            }
            MockBehaviour::Delayed { value, delay } => {
                tokio::time::sleep(*delay).await;
                Ok(value.clone())
            }
            MockBehaviour::Hang => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn flaky_recovers_after_configured_failures() {
        let cap = MockCapability::flaky(2, json!("ok"));
        let ctx = InvocationContext::new(Uuid::new_v4(), "s", "a");

        assert!(matches!(cap.invoke(json!(1), &ctx).await, Err(AgentError::Retryable(_))));
        assert!(matches!(cap.invoke(json!(2), &ctx).await, Err(AgentError::Retryable(_))));
        assert_eq!(cap.invoke(json!(3), &ctx).await, Ok(json!("ok")));

        assert_eq!(cap.call_count(), 3);
        assert_eq!(cap.calls(), vec![json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn echo_returns_input() {
        let cap = MockCapability::echo();
        let ctx = InvocationContext::new(Uuid::new_v4(), "s", "a");
        assert_eq!(cap.invoke(json!({ "x": 1 }), &ctx).await, Ok(json!({ "x": 1 })));
    }
}
