//! `engine` crate — workflow ingest, graph validation, scheduling, and the
//! multi-agent run coordinator.
//!
//! The usual flow: deserialize a [`WorkflowSpec`], build a [`WorkflowGraph`]
//! from it, then hand the graph to a [`WorkflowRunner`] (directly, or through
//! a [`WorkflowService`] for background runs addressed by ID).

pub mod condition;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod models;
pub mod monitor;
pub mod run;
pub mod runner;
pub mod scheduler;
pub mod service;
pub mod template;

pub use condition::{Activation, Condition, ConditionalEvaluator, Predicate};
pub use config::{EngineConfig, RetryPolicy, DEFAULT_GLOBAL_TIMEOUT, DEFAULT_STEP_TIMEOUT};
pub use error::{EngineError, ErrorKind, GraphError, ReferenceKind, StepError, TemplateError};
pub use events::{RecordingObserver, RunEvent, RunObserver, TracingObserver};
pub use executor::{StepContext, StepExecutor};
pub use graph::{Step, WorkflowGraph};
pub use models::{BranchEntry, StepSpec, WorkflowSpec};
pub use monitor::AgentMonitor;
pub use run::{RunSnapshot, RunStatus, StepResult, StepStatus, WorkflowRun};
pub use runner::WorkflowRunner;
pub use scheduler::{compute_cycles, ExecutionCycle, Scheduler};
pub use service::WorkflowService;
