//! Execution plan rendering for `agentflow plan`.

use std::fmt;

use engine::{compute_cycles, EngineConfig, WorkflowGraph};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct Plan {
    pub workflow_id: String,
    pub name: Option<String>,
    pub global_timeout_secs: f64,
    pub cycles: Vec<PlannedCycle>,
}

#[derive(Debug, Serialize)]
pub struct PlannedCycle {
    pub index: usize,
    pub parallel: Vec<PlannedStep>,
    pub serial: Vec<PlannedStep>,
}

/// A step with the timeout and retry budget it would actually run with.
#[derive(Debug, Serialize)]
pub struct PlannedStep {
    pub id: String,
    pub agent_id: Option<String>,
    pub task: Option<String>,
    pub timeout_secs: f64,
    pub max_attempts: u32,
    /// Gates whose `then` / `else` lists name this step.
    pub gated_by: Vec<String>,
}

impl Plan {
    pub fn build(graph: &WorkflowGraph, config: &EngineConfig) -> Self {
        let planned = |id: &str| -> Option<PlannedStep> {
            let idx = graph.index_of(id)?;
            let step = graph.step(idx);
            Some(PlannedStep {
                id: step.id.clone(),
                agent_id: step.agent_id.clone(),
                task: step.task.clone(),
                timeout_secs: step.timeout.unwrap_or(config.step_timeout).as_secs_f64(),
                max_attempts: step.retry.unwrap_or(config.retry).attempts(),
                gated_by: graph
                    .gates(idx)
                    .iter()
                    .map(|&g| graph.step(g).id.clone())
                    .collect(),
            })
        };

        let cycles = compute_cycles(graph)
            .into_iter()
            .map(|cycle| PlannedCycle {
                index: cycle.index,
                parallel: cycle.parallel.iter().filter_map(|id| planned(id)).collect(),
                serial: cycle.serial.iter().filter_map(|id| planned(id)).collect(),
            })
            .collect();

        Self {
            workflow_id: graph.id().to_owned(),
            name: graph.name().map(str::to_owned),
            global_timeout_secs: config.global_timeout.as_secs_f64(),
            cycles,
        }
    }

    pub fn step_count(&self) -> usize {
        self.cycles.iter().map(|c| c.parallel.len() + c.serial.len()).sum()
    }
}

impl fmt::Display for PlannedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.agent_id, &self.task) {
            (Some(agent), Some(task)) => write!(f, "{} -> {}.{}", self.id, agent, task)?,
            _ => write!(f, "{} (gate)", self.id)?,
        }
        write!(f, "  timeout={}s attempts={}", self.timeout_secs, self.max_attempts)?;
        if !self.gated_by.is_empty() {
            write!(f, "  gated by [{}]", self.gated_by.join(", "))?;
        }
        Ok(())
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => writeln!(f, "workflow {} ({})", self.workflow_id, name)?,
            None => writeln!(f, "workflow {}", self.workflow_id)?,
        }
        writeln!(
            f,
            "{} step(s) in {} cycle(s), deadline {}s",
            self.step_count(),
            self.cycles.len(),
            self.global_timeout_secs
        )?;
        for cycle in &self.cycles {
            writeln!(f, "cycle {}:", cycle.index)?;
            for step in &cycle.parallel {
                writeln!(f, "  [parallel] {step}")?;
            }
            for step in &cycle.serial {
                writeln!(f, "  [serial]   {step}")?;
            }
        }
        Ok(())
    }
}
