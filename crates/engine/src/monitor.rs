//! Consecutive-failure tracking per agent.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::warn;

use crate::events::{RunEvent, RunObserver};
use crate::run::StepStatus;

/// Flags agents whose steps fail `threshold` times in a row.
///
/// A success resets the agent's count. So does flagging it, so a persistently
/// failing agent is reported once every `threshold` failures.
#[derive(Debug)]
pub struct AgentMonitor {
    threshold: u32,
    state: Mutex<MonitorState>,
}

#[derive(Debug, Default)]
struct MonitorState {
    failures: HashMap<String, u32>,
    anomalies: Vec<String>,
}

impl AgentMonitor {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            state: Mutex::new(MonitorState::default()),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Current consecutive failure count for `agent_id`.
    pub fn failures(&self, agent_id: &str) -> u32 {
        self.state.lock().failures.get(agent_id).copied().unwrap_or(0)
    }

    /// Agents flagged so far, once per crossing.
    pub fn anomalies(&self) -> Vec<String> {
        self.state.lock().anomalies.clone()
    }

    fn record(&self, agent_id: &str, status: StepStatus) {
        let mut state = self.state.lock();
        if status == StepStatus::Succeeded {
            state.failures.remove(agent_id);
            return;
        }
        if !status.is_failure() {
            return;
        }

        let count = state.failures.entry(agent_id.to_owned()).or_insert(0);
        *count += 1;
        if *count >= self.threshold {
            warn!(
                agent_id,
                failures = *count,
                "agent failed {} consecutive steps",
                *count
            );
            state.failures.remove(agent_id);
            state.anomalies.push(agent_id.to_owned());
        }
    }
}

impl RunObserver for AgentMonitor {
    fn notify(&self, event: &RunEvent) {
        if let RunEvent::StepFinished { agent_id: Some(agent_id), status, .. } = event {
            self.record(agent_id, *status);
        }
    }
}
