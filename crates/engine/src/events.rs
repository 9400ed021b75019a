//! Run lifecycle events and the observers that consume them.
//!
//! The runner publishes a [`RunEvent`] when a run starts, when a step is
//! dispatched, when a step reaches a terminal status, and when the run ends.
//! Observers are called synchronously from the runner task and must not
//! block.

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::run::{RunStatus, StepStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: Uuid,
        workflow_id: String,
    },
    StepDispatched {
        run_id: Uuid,
        step_id: String,
        agent_id: Option<String>,
        cycle: usize,
    },
    StepFinished {
        run_id: Uuid,
        step_id: String,
        agent_id: Option<String>,
        status: StepStatus,
        attempts: u32,
    },
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::StepDispatched { run_id, .. }
            | Self::StepFinished { run_id, .. }
            | Self::RunFinished { run_id, .. } => *run_id,
        }
    }

    /// Step the event concerns, if any.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::StepDispatched { step_id, .. } | Self::StepFinished { step_id, .. } => Some(step_id),
            _ => None,
        }
    }
}

/// Receives every event of the runs it is attached to.
pub trait RunObserver: Send + Sync {
    fn notify(&self, event: &RunEvent);
}

/// Logs every event at `info`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl RunObserver for TracingObserver {
    fn notify(&self, event: &RunEvent) {
        match event {
            RunEvent::RunStarted { run_id, workflow_id } => {
                info!(%run_id, workflow_id = %workflow_id, "run started");
            }
            RunEvent::StepDispatched { run_id, step_id, agent_id, cycle } => {
                info!(%run_id, step_id = %step_id, agent_id = ?agent_id, cycle, "step dispatched");
            }
            RunEvent::StepFinished { run_id, step_id, agent_id, status, attempts } => {
                info!(
                    %run_id,
                    step_id = %step_id,
                    agent_id = ?agent_id,
                    status = %status,
                    attempts,
                    "step finished"
                );
            }
            RunEvent::RunFinished { run_id, status } => {
                info!(%run_id, status = %status, "run finished");
            }
        }
    }
}

/// Keeps every event in memory, in arrival order.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<RunEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().clone()
    }

    /// Events concerning `step_id`.
    pub fn step_events(&self, step_id: &str) -> Vec<RunEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.step_id() == Some(step_id))
            .cloned()
            .collect()
    }

    /// IDs of dispatched steps in dispatch order.
    pub fn dispatch_order(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                RunEvent::StepDispatched { step_id, .. } => Some(step_id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl RunObserver for RecordingObserver {
    fn notify(&self, event: &RunEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_observer_keeps_arrival_order() {
        let observer = RecordingObserver::new();
        let run_id = Uuid::new_v4();
        observer.notify(&RunEvent::RunStarted { run_id, workflow_id: "wf".into() });
        observer.notify(&RunEvent::StepDispatched {
            run_id,
            step_id: "a".into(),
            agent_id: Some("agent".into()),
            cycle: 0,
        });
        observer.notify(&RunEvent::StepFinished {
            run_id,
            step_id: "a".into(),
            agent_id: Some("agent".into()),
            status: StepStatus::Succeeded,
            attempts: 1,
        });

        assert_eq!(observer.events().len(), 3);
        assert_eq!(observer.step_events("a").len(), 2);
        assert_eq!(observer.dispatch_order(), vec!["a"]);
        assert!(observer.events().iter().all(|e| e.run_id() == run_id));

        observer.clear();
        assert!(observer.events().is_empty());
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let event = RunEvent::RunFinished { run_id: Uuid::nil(), status: RunStatus::Completed };
        let json = serde_json::to_value(&event).expect("serializable");
        assert_eq!(json["event"], "run_finished");
        assert_eq!(json["status"], "completed");
    }
}
