//! `agentflow` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate` — parse and validate a workflow file (JSON or YAML).
//! - `plan`     — print the execution cycles with effective timeouts and
//!   retry budgets.
//!
//! Neither command invokes any agent.

mod plan;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use engine::{EngineConfig, RetryPolicy, WorkflowGraph, WorkflowSpec};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::plan::Plan;

#[derive(Parser)]
#[command(
    name = "agentflow",
    about = "Multi-agent workflow orchestration engine",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition file.
    Validate {
        #[command(flatten)]
        input: InputArgs,
    },
    /// Show the execution cycles a workflow would run in.
    Plan {
        #[command(flatten)]
        input: InputArgs,

        /// Whole-run deadline in seconds.
        #[arg(long, env = "AGENTFLOW_GLOBAL_TIMEOUT", default_value_t = 300.0)]
        global_timeout: f64,

        /// Per-attempt timeout in seconds for steps that declare none.
        #[arg(long, env = "AGENTFLOW_STEP_TIMEOUT", default_value_t = 60.0)]
        step_timeout: f64,

        /// Attempts for steps that declare no retry policy.
        #[arg(long, env = "AGENTFLOW_MAX_ATTEMPTS", default_value_t = 3)]
        max_attempts: u32,

        /// Emit the plan as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Args)]
struct InputArgs {
    /// Path to the workflow file.
    path: PathBuf,

    /// Input format; inferred from the file extension when omitted.
    #[arg(long, value_enum)]
    format: Option<Format>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Json,
    Yaml,
}

impl Format {
    fn detect(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Self::Yaml,
            _ => Self::Json,
        }
    }
}

fn load(input: &InputArgs) -> Result<WorkflowGraph> {
    let format = input.format.unwrap_or_else(|| Format::detect(&input.path));
    debug!(path = %input.path.display(), ?format, "loading workflow");

    let content = std::fs::read_to_string(&input.path)
        .with_context(|| format!("cannot read file {}", input.path.display()))?;
    let spec = match format {
        Format::Json => WorkflowSpec::from_json(&content),
        Format::Yaml => WorkflowSpec::from_yaml(&content),
    }?;

    let graph = WorkflowGraph::build(spec)
        .with_context(|| format!("{} is not a valid workflow", input.path.display()))?;
    Ok(graph)
}

fn seconds(flag: &str, secs: f64) -> Result<Duration> {
    match Duration::try_from_secs_f64(secs) {
        Ok(duration) if !duration.is_zero() => Ok(duration),
        _ => anyhow::bail!("--{flag} must be a positive number of seconds, got {secs}"),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { input } => {
            let graph = load(&input)?;
            info!(workflow_id = graph.id(), steps = graph.len(), "workflow validated");
            println!("Workflow '{}' is valid: {} step(s).", graph.id(), graph.len());
        }
        Command::Plan {
            input,
            global_timeout,
            step_timeout,
            max_attempts,
            json,
        } => {
            let graph = load(&input)?;
            let config = EngineConfig::default()
                .with_global_timeout(seconds("global-timeout", global_timeout)?)
                .with_step_timeout(seconds("step-timeout", step_timeout)?)
                .with_retry(RetryPolicy::default().with_attempts(max_attempts));

            let plan = Plan::build(&graph, &config);
            if json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                print!("{plan}");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_accepts_positive_values() {
        assert_eq!(seconds("step-timeout", 1.5).unwrap(), Duration::from_millis(1500));
    }

    #[test]
    fn seconds_rejects_unrepresentable_values() {
        for secs in [0.0, -2.0, f64::NAN, f64::INFINITY, 1e20] {
            let err = seconds("step-timeout", secs).unwrap_err();
            assert!(err.to_string().starts_with("--step-timeout must be"), "{secs}");
        }
    }

    #[test]
    fn format_is_inferred_from_extension() {
        assert_eq!(Format::detect(Path::new("flow.yml")), Format::Yaml);
        assert_eq!(Format::detect(Path::new("flow.yaml")), Format::Yaml);
        assert_eq!(Format::detect(Path::new("flow.json")), Format::Json);
    }
}
