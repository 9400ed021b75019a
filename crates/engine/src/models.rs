//! Workflow specification models — the declarative, ingested form.
//!
//! These types mirror the JSON/YAML a caller submits. Nothing here is
//! validated; [`crate::WorkflowGraph::build`] turns a [`WorkflowSpec`] into an
//! immutable, checked graph. Unknown fields are ignored and required fields
//! are `Option`s so that a missing one surfaces as a
//! [`crate::GraphError::MissingField`] naming the step rather than as an
//! opaque parse error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RetryPolicy;
use crate::EngineError;

// ---------------------------------------------------------------------------
// WorkflowSpec
// ---------------------------------------------------------------------------

/// A complete workflow submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSpec {
    /// Workflow identifier; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Steps in declaration order.
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

impl WorkflowSpec {
    pub fn new(steps: Vec<StepSpec>) -> Self {
        Self {
            id: None,
            name: None,
            steps,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn from_json(source: &str) -> Result<Self, EngineError> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn from_yaml(source: &str) -> Result<Self, EngineError> {
        Ok(serde_yaml::from_str(source)?)
    }
}

// ---------------------------------------------------------------------------
// StepSpec
// ---------------------------------------------------------------------------

/// One entry of a `then` / `else` list: a step ID or an inline step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BranchEntry {
    Id(String),
    Inline(Box<StepSpec>),
}

impl From<&str> for BranchEntry {
    fn from(id: &str) -> Self {
        Self::Id(id.to_owned())
    }
}

impl From<StepSpec> for BranchEntry {
    fn from(step: StepSpec) -> Self {
        Self::Inline(Box::new(step))
    }
}

/// A single step as submitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepSpec {
    /// Unique identifier within the workflow (required).
    #[serde(default)]
    pub id: Option<String>,
    /// Agent the step is assigned to (required unless the step is a pure gate).
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Capability to invoke on the agent (required unless the step is a pure gate).
    #[serde(default)]
    pub task: Option<String>,
    /// Input payload; strings may embed `{{stepId}}` placeholders.
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Predicate selecting between `then` and `else`.
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default)]
    pub then: Vec<BranchEntry>,
    #[serde(default, rename = "else")]
    pub otherwise: Vec<BranchEntry>,
    /// Per-attempt timeout in seconds.
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Shorthand for `retry.max_attempts = retries + 1`.
    #[serde(default)]
    pub retries: Option<u32>,
}

impl StepSpec {
    /// Convenience constructor for a regular agent step.
    pub fn new(id: impl Into<String>, agent_id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            agent_id: Some(agent_id.into()),
            task: Some(task.into()),
            ..Self::default()
        }
    }

    /// Convenience constructor for a pure gate: a `when` block with no task.
    pub fn gate(id: impl Into<String>, when: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            when: Some(when.into()),
            ..Self::default()
        }
    }

    pub fn input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn when(mut self, predicate: impl Into<String>) -> Self {
        self.when = Some(predicate.into());
        self
    }

    pub fn then<I, B>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<BranchEntry>,
    {
        self.then = entries.into_iter().map(Into::into).collect();
        self
    }

    pub fn otherwise<I, B>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<BranchEntry>,
    {
        self.otherwise = entries.into_iter().map(Into::into).collect();
        self
    }

    pub fn timeout_secs(mut self, secs: f64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_documented_step_fields_and_ignores_unknown_ones() {
        let spec = WorkflowSpec::from_json(
            r#"{
                "steps": [
                    {
                        "id": "sales_analysis",
                        "agent_id": "analyst1",
                        "task": "analyze_data",
                        "input": { "data": "Q3_sales.csv" },
                        "priority": 5
                    },
                    {
                        "id": "report",
                        "agent_id": "analyst1",
                        "task": "generate_report",
                        "input": { "analysis": "{{sales_analysis}}" },
                        "depends_on": ["sales_analysis"],
                        "parallel": true,
                        "retries": 2,
                        "timeout": 1.5
                    }
                ]
            }"#,
        )
        .expect("should parse");

        assert_eq!(spec.steps.len(), 2);
        let report = &spec.steps[1];
        assert_eq!(report.depends_on, vec!["sales_analysis"]);
        assert!(report.parallel);
        assert_eq!(report.retries, Some(2));
        assert_eq!(report.timeout, Some(1.5));
        assert_eq!(report.input, json!({ "analysis": "{{sales_analysis}}" }));
        assert!(!spec.steps[0].parallel);
    }

    #[test]
    fn branch_entries_accept_ids_and_inline_steps() {
        let spec = WorkflowSpec::from_yaml(
            r#"
steps:
  - id: check
    when: "1 == 1"
    then:
      - id: true_step
        agent_id: agent1
        task: execute
    else:
      - false_step
  - id: false_step
    agent_id: agent2
    task: execute
"#,
        )
        .expect("should parse");

        let check = &spec.steps[0];
        assert_eq!(check.when.as_deref(), Some("1 == 1"));
        assert!(matches!(&check.then[0], BranchEntry::Inline(s) if s.id.as_deref() == Some("true_step")));
        assert!(matches!(&check.otherwise[0], BranchEntry::Id(id) if id == "false_step"));
        assert!(check.agent_id.is_none());
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            WorkflowSpec::from_json("{ not json"),
            Err(EngineError::Json(_))
        ));
    }
}
