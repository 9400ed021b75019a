//! Agent registry — maps agent identifiers to capability-invocation handles.
//!
//! The registry is the only thing the engine knows about agents. It owns
//! every [`AgentHandle`]; the engine references handles for the duration of
//! a single invocation and never keeps them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::{Capability, InvocationContext, InvokeError};

/// Concurrent steps an agent accepts when no capacity is declared.
pub const DEFAULT_CAPACITY: usize = 5;

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// An agent definition: an identifier plus a set of named capabilities.
pub struct Agent {
    id: String,
    role: Option<String>,
    capacity: usize,
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl Agent {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: None,
            capacity: DEFAULT_CAPACITY,
            capabilities: HashMap::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Maximum number of steps this agent runs at once. Clamped to at least 1.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_capability(self, task: impl Into<String>, capability: impl Capability + 'static) -> Self {
        self.with_shared_capability(task, Arc::new(capability))
    }

    /// Register a capability that is shared with other agents or kept by the caller.
    pub fn with_shared_capability(
        mut self,
        task: impl Into<String>,
        capability: Arc<dyn Capability>,
    ) -> Self {
        self.capabilities.insert(task.into(), capability);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Task names this agent can perform, sorted.
    pub fn tasks(&self) -> Vec<&str> {
        let mut tasks: Vec<&str> = self.capabilities.keys().map(String::as_str).collect();
        tasks.sort_unstable();
        tasks
    }

    pub fn capability(&self, task: &str) -> Option<&Arc<dyn Capability>> {
        self.capabilities.get(task)
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("capacity", &self.capacity)
            .field("tasks", &self.tasks())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// AgentHandle
// ---------------------------------------------------------------------------

/// A registered agent together with the permits that bound its concurrency.
#[derive(Debug)]
pub struct AgentHandle {
    agent: Agent,
    permits: Semaphore,
}

impl AgentHandle {
    fn new(agent: Agent) -> Self {
        let permits = Semaphore::new(agent.capacity());
        Self { agent, permits }
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn capacity(&self) -> usize {
        self.agent.capacity()
    }

    /// Number of invocations currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.agent.capacity() - self.permits.available_permits()
    }
}

// ---------------------------------------------------------------------------
// AgentRegistry
// ---------------------------------------------------------------------------

/// Maps agent identifiers to [`AgentHandle`]s.
#[derive(Debug, Default, Clone)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<AgentHandle>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent, returning the handle it replaced (if any).
    pub fn register(&mut self, agent: Agent) -> Option<Arc<AgentHandle>> {
        let id = agent.id().to_owned();
        debug!(agent_id = %id, capacity = agent.capacity(), "registering agent");
        self.agents.insert(id, Arc::new(AgentHandle::new(agent)))
    }

    /// Builder-style [`AgentRegistry::register`].
    pub fn with_agent(mut self, agent: Agent) -> Self {
        self.register(agent);
        self
    }

    /// Remove an agent.
    ///
    /// Clones of this registry share the agent's handle. Invocations made
    /// through a clone that are still waiting for one of its permits fail
    /// with [`InvokeError::UnknownAgent`]; those already holding a permit run
    /// to completion.
    pub fn deregister(&mut self, agent_id: &str) -> Option<Arc<AgentHandle>> {
        let handle = self.agents.remove(agent_id)?;
        handle.permits.close();
        Some(handle)
    }

    pub fn get(&self, agent_id: &str) -> Option<&Arc<AgentHandle>> {
        self.agents.get(agent_id)
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// Declared capacity of an agent.
    pub fn capacity(&self, agent_id: &str) -> Option<usize> {
        self.agents.get(agent_id).map(|h| h.capacity())
    }

    /// Sum of all agent capacities.
    pub fn total_capacity(&self) -> usize {
        self.agents.values().map(|h| h.capacity()).sum()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Registered agent identifiers, sorted.
    pub fn agent_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Invoke `task` on `agent_id`, bounded by `timeout`.
    ///
    /// Waits for one of the agent's capacity permits first; the wait does not
    /// count against `timeout`.
    ///
    /// # Errors
    /// - [`InvokeError::UnknownAgent`] / [`InvokeError::UnknownTask`] when the
    ///   target cannot be resolved.
    /// - [`InvokeError::TimedOut`] when the capability exceeds `timeout`.
    /// - [`InvokeError::Agent`] when the capability reports an error.
    pub async fn invoke(
        &self,
        agent_id: &str,
        task: &str,
        input: Value,
        ctx: &InvocationContext,
        timeout: Duration,
    ) -> Result<Value, InvokeError> {
        let handle = self
            .agents
            .get(agent_id)
            .ok_or_else(|| InvokeError::UnknownAgent(agent_id.to_owned()))?;

        let capability = handle
            .agent
            .capability(task)
            .ok_or_else(|| InvokeError::UnknownTask {
                agent_id: agent_id.to_owned(),
                task: task.to_owned(),
            })?;

        // Closed only on deregistration.
        let _permit = handle
            .permits
            .acquire()
            .await
            .map_err(|_| InvokeError::UnknownAgent(agent_id.to_owned()))?;

        debug!(
            agent_id,
            task,
            step_id = %ctx.step_id,
            attempt = ctx.attempt,
            "invoking capability"
        );

        match tokio::time::timeout(timeout, capability.invoke(input, ctx)).await {
            Ok(result) => result.map_err(InvokeError::from),
            Err(_) => Err(InvokeError::TimedOut {
                agent_id: agent_id.to_owned(),
                task: task.to_owned(),
                after: timeout,
            }),
        }
    }
}
