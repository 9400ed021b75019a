//! Workflow graph construction and validation — run this before scheduling.
//!
//! Rules enforced:
//! 1. Step IDs must be unique within the workflow.
//! 2. Every `depends_on`, `then` / `else`, template and predicate reference
//!    must name an existing step.
//! 3. The prerequisite relation must be acyclic; checked by depth-first
//!    search, failing on the first back-edge. Besides declared dependencies
//!    it holds implicit edges: gate → gated step, and referenced step →
//!    reader for every template and predicate reference (a gate's `when` may
//!    read the gate's own output when the gate dispatches a task).
//!
//! The resulting [`WorkflowGraph`] is immutable.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use crate::condition::{Condition, Predicate};
use crate::config::RetryPolicy;
use crate::models::{BranchEntry, StepSpec, WorkflowSpec};
use crate::template;
use crate::{GraphError, ReferenceKind};

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A validated step.
#[derive(Debug, Clone)]
pub struct Step {
    pub id: String,
    /// `None` only for pure gates.
    pub agent_id: Option<String>,
    /// `None` only for pure gates.
    pub task: Option<String>,
    pub input: Value,
    pub depends_on: Vec<String>,
    pub parallel: bool,
    pub condition: Option<Condition>,
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
}

impl Step {
    /// Agent and task to invoke, unless the step is a pure gate.
    pub fn target(&self) -> Option<(&str, &str)> {
        match (&self.agent_id, &self.task) {
            (Some(agent), Some(task)) => Some((agent, task)),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowGraph
// ---------------------------------------------------------------------------

/// Ordered steps plus the derived dependency structure.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    id: String,
    name: Option<String>,
    steps: Vec<Step>,
    index: HashMap<String, usize>,
    /// Declared dependency → dependents, one edge per distinct declaration.
    dependents: Vec<Vec<usize>>,
    /// Gated step → gates naming it in `then` / `else`.
    gates: Vec<Vec<usize>>,
    /// Everything that must resolve before a step: dependencies, data
    /// references and gates.
    prerequisites: Vec<Vec<usize>>,
    /// Inverse of `prerequisites`.
    successors: Vec<Vec<usize>>,
}

/// A step spec after inline branch steps were hoisted out.
struct FlatStep {
    spec: StepSpec,
    then: Vec<String>,
    otherwise: Vec<String>,
}

impl WorkflowGraph {
    /// Validate a workflow specification and build its graph.
    ///
    /// # Errors
    /// - [`GraphError::MissingField`] / [`GraphError::InvalidField`] /
    ///   [`GraphError::InvalidCondition`] for malformed steps.
    /// - [`GraphError::DuplicateId`] if two steps share an ID.
    /// - [`GraphError::UnknownReference`] if a reference names a missing step.
    /// - [`GraphError::CycleDetected`] if the prerequisite relation has a cycle.
    pub fn build(spec: WorkflowSpec) -> Result<Self, GraphError> {
        let WorkflowSpec { id, name, steps } = spec;

        // -------------------------------------------------------------------
        // 1. Hoist inline branch steps and validate fields
        // -------------------------------------------------------------------
        let mut flat = Vec::with_capacity(steps.len());
        for step in steps {
            flatten(step, &mut flat)?;
        }

        let steps = flat
            .into_iter()
            .enumerate()
            .map(|(position, f)| validate_step(position, f))
            .collect::<Result<Vec<_>, _>>()?;

        // -------------------------------------------------------------------
        // 2. Ensure step IDs are unique
        // -------------------------------------------------------------------
        let mut index = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if index.insert(step.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateId(step.id.clone()));
            }
        }

        // -------------------------------------------------------------------
        // 3. Resolve references into edges
        // -------------------------------------------------------------------
        let resolve = |step: &Step, reference: &str, kind| {
            index
                .get(reference)
                .copied()
                .ok_or_else(|| GraphError::UnknownReference {
                    step: step.id.clone(),
                    reference: reference.to_owned(),
                    kind,
                })
        };

        let n = steps.len();
        let mut dependents = vec![Vec::new(); n];
        let mut gates = vec![Vec::new(); n];
        let mut prerequisites: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (i, step) in steps.iter().enumerate() {
            for dep in &step.depends_on {
                let d = resolve(step, dep.as_str(), ReferenceKind::DependsOn)?;
                if !prerequisites[i].contains(&d) {
                    prerequisites[i].push(d);
                    dependents[d].push(i);
                }
            }

            if let Some(condition) = &step.condition {
                for target in condition.then.iter().chain(&condition.otherwise) {
                    let t = resolve(step, target.as_str(), ReferenceKind::Branch)?;
                    if !gates[t].contains(&i) {
                        gates[t].push(i);
                    }
                }
                let own_output = step.target().is_some();
                for r in condition.predicate.references() {
                    let p = resolve(step, r.step.as_str(), ReferenceKind::Condition)?;
                    if (p != i || !own_output) && !prerequisites[i].contains(&p) {
                        prerequisites[i].push(p);
                    }
                }
            }

            for r in template::references(&step.input) {
                let p = resolve(step, r.step.as_str(), ReferenceKind::Template)?;
                if !prerequisites[i].contains(&p) {
                    prerequisites[i].push(p);
                }
            }
        }

        for (t, step_gates) in gates.iter().enumerate() {
            for &g in step_gates {
                if !prerequisites[t].contains(&g) {
                    prerequisites[t].push(g);
                }
            }
        }

        let mut successors = vec![Vec::new(); n];
        for (i, prereqs) in prerequisites.iter().enumerate() {
            for &p in prereqs {
                successors[p].push(i);
            }
        }

        let graph = Self {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name,
            steps,
            index,
            dependents,
            gates,
            prerequisites,
            successors,
        };

        // -------------------------------------------------------------------
        // 4. Cycle detection (depth-first, back-edge = cycle)
        // -------------------------------------------------------------------
        graph.detect_cycle()?;

        Ok(graph)
    }

    fn detect_cycle(&self) -> Result<(), GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Grey,
            Black,
        }

        let mut marks = vec![Mark::White; self.steps.len()];

        for root in 0..self.steps.len() {
            if marks[root] != Mark::White {
                continue;
            }
            // (node, next prerequisite to visit)
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            marks[root] = Mark::Grey;

            while let Some(&(node, next)) = stack.last() {
                if let Some(&child) = self.prerequisites[node].get(next) {
                    if let Some(top) = stack.last_mut() {
                        top.1 += 1;
                    }
                    match marks[child] {
                        Mark::White => {
                            marks[child] = Mark::Grey;
                            stack.push((child, 0));
                        }
                        Mark::Grey => {
                            let start = stack
                                .iter()
                                .position(|&(n, _)| n == child)
                                .unwrap_or_default();
                            let mut path: Vec<String> = stack[start..]
                                .iter()
                                .map(|&(n, _)| self.steps[n].id.clone())
                                .collect();
                            path.push(self.steps[child].id.clone());
                            return Err(GraphError::CycleDetected { path });
                        }
                        Mark::Black => {}
                    }
                } else {
                    marks[node] = Mark::Black;
                    stack.pop();
                }
            }
        }
        Ok(())
    }

    /// Every step that must resolve before step `idx` may run.
    pub fn ancestors(&self, idx: usize) -> HashSet<usize> {
        let mut seen = HashSet::new();
        let mut stack: Vec<usize> = self.prerequisites[idx].clone();
        while let Some(node) = stack.pop() {
            if seen.insert(node) {
                stack.extend(&self.prerequisites[node]);
            }
        }
        seen
    }

    /// Every step reachable downstream of step `idx`.
    pub fn descendants(&self, idx: usize) -> Vec<usize> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut stack: Vec<usize> = self.successors[idx].clone();
        while let Some(node) = stack.pop() {
            if seen.insert(node) {
                order.push(node);
                stack.extend(&self.successors[node]);
            }
        }
        order.sort_unstable();
        order
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Steps in declaration order (inline branch steps hoisted).
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, idx: usize) -> &Step {
        &self.steps[idx]
    }

    pub fn get(&self, id: &str) -> Option<&Step> {
        self.index.get(id).map(|&i| &self.steps[i])
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps declaring `depends_on` this step.
    pub fn dependents(&self, idx: usize) -> &[usize] {
        &self.dependents[idx]
    }

    /// Gates naming this step in a `then` / `else` list.
    pub fn gates(&self, idx: usize) -> &[usize] {
        &self.gates[idx]
    }

    pub fn is_gated(&self, idx: usize) -> bool {
        !self.gates[idx].is_empty()
    }

    /// Declared dependencies plus gates.
    pub fn prerequisites(&self, idx: usize) -> &[usize] {
        &self.prerequisites[idx]
    }

    /// Steps that list this one among their prerequisites.
    pub fn successors(&self, idx: usize) -> &[usize] {
        &self.successors[idx]
    }
}

// ---------------------------------------------------------------------------
// Spec → Step
// ---------------------------------------------------------------------------

fn flatten(mut spec: StepSpec, out: &mut Vec<FlatStep>) -> Result<(), GraphError> {
    let mut inline = Vec::new();

    let collect = |entries: Vec<BranchEntry>, inline: &mut Vec<StepSpec>| {
        entries
            .into_iter()
            .map(|entry| match entry {
                BranchEntry::Id(id) => Ok(id),
                BranchEntry::Inline(step) => {
                    let id = step.id.clone().filter(|id| !id.is_empty()).ok_or_else(|| {
                        GraphError::MissingField {
                            step: format!(
                                "inline branch of '{}'",
                                spec_label(&spec.id, out.len())
                            ),
                            field: "id",
                        }
                    })?;
                    inline.push(*step);
                    Ok(id)
                }
            })
            .collect::<Result<Vec<_>, GraphError>>()
    };

    let then = collect(std::mem::take(&mut spec.then), &mut inline)?;
    let otherwise = collect(std::mem::take(&mut spec.otherwise), &mut inline)?;

    out.push(FlatStep {
        spec,
        then,
        otherwise,
    });
    for step in inline {
        flatten(step, out)?;
    }
    Ok(())
}

fn spec_label(id: &Option<String>, position: usize) -> String {
    match id {
        Some(id) if !id.is_empty() => id.clone(),
        _ => format!("#{position}"),
    }
}

fn validate_step(position: usize, flat: FlatStep) -> Result<Step, GraphError> {
    let FlatStep {
        spec,
        then,
        otherwise,
    } = flat;

    let id = match spec.id {
        Some(id) if !id.is_empty() => id,
        _ => {
            return Err(GraphError::MissingField {
                step: format!("#{position}"),
                field: "id",
            })
        }
    };

    let agent_id = spec.agent_id.filter(|s| !s.is_empty());
    let task = spec.task.filter(|s| !s.is_empty());

    // A pure gate may omit both; everything else needs both.
    let pure_gate = spec.when.is_some() && agent_id.is_none() && task.is_none();
    if !pure_gate {
        if agent_id.is_none() {
            return Err(GraphError::MissingField { step: id, field: "agent_id" });
        }
        if task.is_none() {
            return Err(GraphError::MissingField { step: id, field: "task" });
        }
    }

    let condition = match spec.when {
        Some(source) => {
            let predicate = Predicate::parse(&source).map_err(|message| {
                GraphError::InvalidCondition {
                    step: id.clone(),
                    message,
                }
            })?;
            Some(Condition {
                predicate,
                then,
                otherwise,
            })
        }
        None if !then.is_empty() || !otherwise.is_empty() => {
            return Err(GraphError::InvalidField {
                step: id,
                field: "then",
                message: "a 'then' / 'else' block requires a 'when' predicate".into(),
            });
        }
        None => None,
    };

    let timeout = match spec.timeout {
        Some(secs) => match Duration::try_from_secs_f64(secs) {
            Ok(timeout) if !timeout.is_zero() => Some(timeout),
            _ => {
                return Err(GraphError::InvalidField {
                    step: id,
                    field: "timeout",
                    message: format!("expected a positive number of seconds, got {secs}"),
                })
            }
        },
        None => None,
    };

    let retry = spec.retry.or_else(|| {
        spec.retries
            .map(|r| RetryPolicy::default().with_attempts(r.saturating_add(1)))
    });

    Ok(Step {
        id,
        agent_id,
        task,
        input: spec.input,
        depends_on: spec.depends_on,
        parallel: spec.parallel,
        condition,
        timeout,
        retry,
    })
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(id: &str) -> StepSpec {
        StepSpec::new(id, "agent", "task")
    }

    fn build(steps: Vec<StepSpec>) -> Result<WorkflowGraph, GraphError> {
        WorkflowGraph::build(WorkflowSpec::new(steps))
    }

    #[test]
    fn valid_diamond_builds_adjacency() {
        //   a
        //  / \
        // b   c
        //  \ /
        //   d
        let graph = build(vec![
            step("a"),
            step("b").depends_on(["a"]),
            step("c").depends_on(["a"]),
            step("d").depends_on(["b", "c"]),
        ])
        .expect("should be valid");

        let a = graph.index_of("a").unwrap();
        let d = graph.index_of("d").unwrap();
        assert_eq!(graph.dependents(a), &[1, 2]);
        assert_eq!(graph.prerequisites(d), &[1, 2]);
        assert_eq!(graph.ancestors(d), HashSet::from([0, 1, 2]));
        assert_eq!(graph.descendants(a), vec![1, 2, 3]);
    }

    #[test]
    fn duplicate_dependency_yields_one_edge() {
        let graph = build(vec![step("a"), step("b").depends_on(["a", "a"])]).expect("valid");
        assert_eq!(graph.dependents(0), &[1]);
        assert_eq!(graph.prerequisites(1), &[0]);
    }

    #[test]
    fn duplicate_step_id_is_rejected() {
        assert_eq!(
            build(vec![step("a"), step("a")]).unwrap_err(),
            GraphError::DuplicateId("a".into())
        );
    }

    #[test]
    fn unknown_references_are_rejected() {
        let err = build(vec![step("a").depends_on(["ghost"])]).unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownReference {
                step: "a".into(),
                reference: "ghost".into(),
                kind: ReferenceKind::DependsOn,
            }
        );

        let err = build(vec![step("a").input(json!({ "x": "{{ghost}}" }))]).unwrap_err();
        assert!(matches!(
            err,
            GraphError::UnknownReference { kind: ReferenceKind::Template, .. }
        ));

        let err = build(vec![StepSpec::gate("g", "true").then(["ghost"])]).unwrap_err();
        assert!(matches!(
            err,
            GraphError::UnknownReference { kind: ReferenceKind::Branch, .. }
        ));

        let err = build(vec![StepSpec::gate("g", "{{ghost}} > 1")]).unwrap_err();
        assert!(matches!(
            err,
            GraphError::UnknownReference { kind: ReferenceKind::Condition, .. }
        ));
    }

    #[test]
    fn cycle_is_detected_with_path() {
        // a → b → c → a
        let err = build(vec![
            step("a").depends_on(["c"]),
            step("b").depends_on(["a"]),
            step("c").depends_on(["b"]),
        ])
        .unwrap_err();

        assert_eq!(
            err,
            GraphError::CycleDetected {
                path: vec!["a".into(), "c".into(), "b".into(), "a".into()],
            }
        );
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let err = build(vec![step("a").depends_on(["a"])]).unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected { path } if path == ["a", "a"]));
    }

    #[test]
    fn gate_edges_participate_in_cycle_detection() {
        // gate selects `x`, but the gate itself depends on `x`.
        let err = build(vec![
            step("x"),
            StepSpec::gate("g", "true").depends_on(["x"]).then(["x"]),
        ])
        .unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected { .. }));
    }

    #[test]
    fn missing_required_fields_are_rejected() {
        let err = build(vec![StepSpec {
            id: Some("a".into()),
            task: Some("t".into()),
            ..StepSpec::default()
        }])
        .unwrap_err();
        assert_eq!(err, GraphError::MissingField { step: "a".into(), field: "agent_id" });

        let err = build(vec![StepSpec {
            agent_id: Some("x".into()),
            task: Some("t".into()),
            ..StepSpec::default()
        }])
        .unwrap_err();
        assert_eq!(err, GraphError::MissingField { step: "#0".into(), field: "id" });
    }

    #[test]
    fn pure_gate_may_omit_agent_and_task() {
        let graph = build(vec![StepSpec::gate("g", "1 == 1").then(["t"]), step("t")])
            .expect("should be valid");
        assert!(graph.get("g").unwrap().target().is_none());
        assert!(graph.is_gated(1));
        assert_eq!(graph.gates(1), &[0]);
        assert_eq!(graph.prerequisites(1), &[0]);
    }

    #[test]
    fn inline_branch_steps_are_hoisted_after_their_gate() {
        let graph = build(vec![
            StepSpec::gate("check", "1 == 1")
                .then([step("true_step")])
                .otherwise([step("false_step")]),
            step("after"),
        ])
        .expect("should be valid");

        let ids: Vec<&str> = graph.steps().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["check", "true_step", "false_step", "after"]);
        let condition = graph.get("check").unwrap().condition.as_ref().unwrap();
        assert_eq!(condition.then, vec!["true_step"]);
        assert_eq!(condition.otherwise, vec!["false_step"]);
    }

    #[test]
    fn references_become_implicit_prerequisites() {
        let graph = build(vec![
            step("a"),
            step("b").input(json!({ "from_a": "{{a}}" })),
        ])
        .expect("undeclared reference should be valid");
        assert_eq!(graph.prerequisites(1), &[0]);
        assert_eq!(graph.successors(0), &[1]);
        // Only declared dependencies are listed as dependents.
        assert!(graph.dependents(0).is_empty());

        let graph = build(vec![
            StepSpec::gate("g", "{{a.ok}}").then(["t"]),
            step("a"),
            step("t"),
        ])
        .expect("predicate reference should be valid");
        assert_eq!(graph.prerequisites(0), &[1]);

        // Declared and referenced edges collapse into one.
        let graph = build(vec![step("a"), step("b").depends_on(["a"]).input(json!("{{a}}"))])
            .expect("valid");
        assert_eq!(graph.prerequisites(1), &[0]);
    }

    #[test]
    fn reference_cycles_are_rejected() {
        let err = build(vec![
            step("a").input(json!("{{b}}")),
            step("b").input(json!("{{a}}")),
        ])
        .unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected { .. }));

        let err = build(vec![step("a").input(json!("{{a.x}}"))]).unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected { path } if path == ["a", "a"]));
    }

    #[test]
    fn predicate_may_read_own_output_only_when_dispatching() {
        let graph = build(vec![step("score").when("{{score}} > 0.5").then(["fast"]), step("fast")])
            .expect("task-bearing gate may read its own output");
        assert!(graph.prerequisites(0).is_empty());

        let err = build(vec![StepSpec::gate("g", "{{g}}")]).unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected { .. }));
    }

    #[test]
    fn invalid_fields_are_rejected() {
        for secs in [0.0, -1.0, f64::NAN, f64::INFINITY, 1e20] {
            let err = build(vec![step("a").timeout_secs(secs)]).unwrap_err();
            assert!(matches!(err, GraphError::InvalidField { field: "timeout", .. }), "{secs}");
        }

        let err = build(vec![StepSpec::gate("g", "1 ==")]).unwrap_err();
        assert!(matches!(err, GraphError::InvalidCondition { .. }));

        let err = build(vec![step("a").then(["a"])]).unwrap_err();
        assert!(matches!(err, GraphError::InvalidField { field: "then", .. }));
    }

    #[test]
    fn retries_shorthand_sets_attempts() {
        let graph = build(vec![step("a").retries(2), step("b")]).expect("valid");
        assert_eq!(graph.step(0).retry.map(|r| r.max_attempts), Some(3));
        assert!(graph.step(1).retry.is_none());
    }

    #[test]
    fn generated_id_when_absent() {
        let graph = build(vec![step("solo")]).expect("valid");
        assert!(!graph.id().is_empty());

        let named = WorkflowGraph::build(WorkflowSpec::new(vec![step("solo")]).with_id("wf-1"))
            .expect("valid");
        assert_eq!(named.id(), "wf-1");
    }
}
