//! Scheduler — partitions a validated graph into ordered execution cycles.
//!
//! Layered topological sort: cycle 0 holds the steps with no prerequisites,
//! cycle *k* the steps whose prerequisites all sit in cycles `0..k`. Inside a
//! cycle, `parallel` steps are dispatched together and the remaining steps
//! run one at a time afterwards, both in declaration order.
//!
//! [`Cycles`] is lazy; a fresh iterator over the same graph always yields the
//! same sequence.

use serde::Serialize;

use crate::graph::WorkflowGraph;

/// One batch of steps whose prerequisites are satisfied by earlier cycles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionCycle {
    pub index: usize,
    /// Steps eligible for concurrent dispatch.
    pub parallel: Vec<String>,
    /// Steps dispatched one by one once every parallel step has settled.
    pub serial: Vec<String>,
}

impl ExecutionCycle {
    /// Every step of the cycle in dispatch order.
    pub fn steps(&self) -> impl Iterator<Item = &str> {
        self.parallel.iter().chain(&self.serial).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.parallel.len() + self.serial.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.steps().any(|s| s == step_id)
    }
}

/// Computes execution cycles for a graph.
pub struct Scheduler<'g> {
    graph: &'g WorkflowGraph,
}

impl<'g> Scheduler<'g> {
    pub fn new(graph: &'g WorkflowGraph) -> Self {
        Self { graph }
    }

    /// Lazily yield cycles in order.
    pub fn cycles(&self) -> Cycles<'g> {
        Cycles {
            graph: self.graph,
            layer: vec![None; self.graph.len()],
            next_index: 0,
            remaining: self.graph.len(),
        }
    }

    pub fn compute_cycles(&self) -> Vec<ExecutionCycle> {
        self.cycles().collect()
    }
}

/// Convenience wrapper around [`Scheduler::compute_cycles`].
pub fn compute_cycles(graph: &WorkflowGraph) -> Vec<ExecutionCycle> {
    Scheduler::new(graph).compute_cycles()
}

/// Lazy cycle iterator; see [`Scheduler::cycles`].
pub struct Cycles<'g> {
    graph: &'g WorkflowGraph,
    /// Cycle each step was placed in.
    layer: Vec<Option<usize>>,
    next_index: usize,
    remaining: usize,
}

impl Iterator for Cycles<'_> {
    type Item = ExecutionCycle;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        let current = self.next_index;
        let frontier: Vec<usize> = (0..self.graph.len())
            .filter(|&i| self.layer[i].is_none())
            .filter(|&i| {
                self.graph
                    .prerequisites(i)
                    .iter()
                    .all(|&p| matches!(self.layer[p], Some(l) if l < current))
            })
            .collect();

        // Unreachable for a validated (acyclic) graph.
        if frontier.is_empty() {
            return None;
        }

        let mut cycle = ExecutionCycle {
            index: current,
            parallel: Vec::new(),
            serial: Vec::new(),
        };
        for i in frontier {
            self.layer[i] = Some(current);
            self.remaining -= 1;
            let step = self.graph.step(i);
            if step.parallel {
                cycle.parallel.push(step.id.clone());
            } else {
                cycle.serial.push(step.id.clone());
            }
        }

        self.next_index += 1;
        Some(cycle)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (usize::from(self.remaining > 0), Some(self.remaining))
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{StepSpec, WorkflowSpec};
    use std::collections::HashMap;

    fn step(id: &str) -> StepSpec {
        StepSpec::new(id, "agent", "task")
    }

    fn graph(steps: Vec<StepSpec>) -> WorkflowGraph {
        WorkflowGraph::build(WorkflowSpec::new(steps)).expect("graph should be valid")
    }

    #[test]
    fn prep_then_parallel_pair() {
        let g = graph(vec![
            step("prep"),
            step("analyze").depends_on(["prep"]).parallel(),
            step("validate").depends_on(["prep"]).parallel(),
        ]);

        let cycles = compute_cycles(&g);
        assert_eq!(
            cycles,
            vec![
                ExecutionCycle { index: 0, parallel: vec![], serial: vec!["prep".into()] },
                ExecutionCycle {
                    index: 1,
                    parallel: vec!["analyze".into(), "validate".into()],
                    serial: vec![],
                },
            ]
        );
    }

    #[test]
    fn parallel_and_serial_split_in_declaration_order() {
        let g = graph(vec![
            step("s2"),
            step("p1").parallel(),
            step("s1"),
            step("p2").parallel(),
        ]);

        let cycles = compute_cycles(&g);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].parallel, vec!["p1", "p2"]);
        assert_eq!(cycles[0].serial, vec!["s2", "s1"]);
        let order: Vec<&str> = cycles[0].steps().collect();
        assert_eq!(order, vec!["p1", "p2", "s2", "s1"]);
    }

    #[test]
    fn partition_and_dependency_order_hold() {
        // Declared out of topological order on purpose.
        let g = graph(vec![
            step("report").depends_on(["merge"]),
            step("merge").depends_on(["left", "right"]),
            step("left").depends_on(["load"]).parallel(),
            step("right").depends_on(["load"]).parallel(),
            step("load"),
            step("audit").depends_on(["load"]),
        ]);

        let cycles = compute_cycles(&g);
        let mut placed: HashMap<&str, usize> = HashMap::new();
        for cycle in &cycles {
            for id in cycle.steps() {
                assert!(placed.insert(id, cycle.index).is_none(), "'{id}' placed twice");
            }
        }
        assert_eq!(placed.len(), g.len());

        for s in g.steps() {
            for dep in &s.depends_on {
                assert!(placed[dep.as_str()] < placed[s.id.as_str()]);
            }
        }
        assert_eq!(cycles[0].steps().collect::<Vec<_>>(), vec!["load"]);
        assert_eq!(placed["report"], 3);
    }

    #[test]
    fn cycle_zero_has_no_dependencies() {
        let g = graph(vec![step("a"), step("b").depends_on(["a"]), step("c")]);
        let first = compute_cycles(&g).remove(0);
        assert_eq!(first.serial, vec!["a", "c"]);
    }

    #[test]
    fn recomputation_is_idempotent() {
        let g = graph(vec![
            step("a"),
            step("b").depends_on(["a"]).parallel(),
            step("c").depends_on(["a"]),
            step("d").depends_on(["b", "c"]),
        ]);
        let scheduler = Scheduler::new(&g);
        assert_eq!(scheduler.compute_cycles(), scheduler.compute_cycles());

        // Restarting the lazy iterator midway yields the same prefix.
        let first_two: Vec<_> = scheduler.cycles().take(2).collect();
        assert_eq!(first_two, scheduler.compute_cycles()[..2].to_vec());
    }

    #[test]
    fn gated_steps_follow_their_gate() {
        let g = graph(vec![
            step("score"),
            StepSpec::gate("check", "{{score}} > 10")
                .depends_on(["score"])
                .then(["fast_path"])
                .otherwise(["slow_path"]),
            step("fast_path"),
            step("slow_path"),
        ]);

        let cycles = compute_cycles(&g);
        assert_eq!(cycles.len(), 3);
        assert_eq!(cycles[1].serial, vec!["check"]);
        assert_eq!(cycles[2].serial, vec!["fast_path", "slow_path"]);
    }

    #[test]
    fn empty_graph_has_no_cycles() {
        let g = graph(vec![]);
        assert!(compute_cycles(&g).is_empty());
    }
}
