mod config;
mod confirm;

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use tracing_subscriber::EnvFilter;

use drover::agent::{Agent, Mode};
use drover::environments::LocalEnvironment;
use drover::errors::ExitStatus;
use drover::providers::openai::{OpenAiProvider, OPENAI_HOST};
use drover::registry::SubagentRegistry;
use drover::trajectory::Trajectory;

use crate::config::Settings;
use crate::confirm::ConsoleApproval;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Task for the agent to solve
    task: Option<String>,

    /// Read the task from a file instead
    #[arg(long)]
    task_file: Option<PathBuf>,

    /// YAML settings file with agent/model/environment sections
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Model name to request from the backend
    #[arg(short, long)]
    model: Option<String>,

    /// OpenAI-compatible API host (can also be set via OPENAI_HOST)
    #[arg(long)]
    host: Option<String>,

    /// API key (can also be set via OPENAI_API_KEY)
    #[arg(long)]
    api_key: Option<String>,

    /// Confirmation mode: human, confirm or yolo
    #[arg(long)]
    mode: Option<Mode>,

    /// Shorthand for --mode yolo
    #[arg(short, long)]
    yolo: bool,

    /// Directory of subagent descriptor files
    #[arg(long, default_value = ".drover/agents")]
    agents_dir: PathBuf,

    /// Save the trajectory to this path when the run ends
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Working directory for commands
    #[arg(long)]
    cwd: Option<String>,

    /// Per-command timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Ceiling on model calls across the hierarchy
    #[arg(long)]
    step_limit: Option<u64>,

    /// Ceiling on spend in dollars across the hierarchy
    #[arg(long)]
    cost_limit: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    apply_overrides(&mut settings, &cli);

    let task = resolve_task(&cli)?;

    let api_key = cli
        .api_key
        .clone()
        .or_else(|| env::var("OPENAI_API_KEY").ok())
        .context("API key must be provided via --api-key or OPENAI_API_KEY")?;
    let host = cli
        .host
        .clone()
        .or_else(|| env::var("OPENAI_HOST").ok())
        .unwrap_or_else(|| OPENAI_HOST.to_string());

    let provider = Arc::new(OpenAiProvider::new(settings.model, host, api_key)?);
    let environment = Arc::new(LocalEnvironment::new(settings.environment));
    let registry = SubagentRegistry::load(&cli.agents_dir)
        .with_context(|| format!("failed to load registry from {}", cli.agents_dir.display()))?;

    let agent = Agent::new(provider, environment, settings.agent)
        .with_registry(Arc::new(registry));
    let approval = ConsoleApproval::new(agent.mode_cell());
    let mut agent = agent.with_approval(Arc::new(approval));

    let interrupt = agent.interrupt_handle();
    ctrlc::set_handler(move || interrupt.interrupt())
        .context("failed to install Ctrl-C handler")?;

    println!(
        "{} {}",
        style("drover").cyan().bold(),
        style(format!("starting on: {task}")).dim()
    );

    let outcome = agent.run(&task).await;

    let status = match outcome.status {
        ExitStatus::Submitted => style(outcome.status.to_string()).green().bold(),
        _ => style(outcome.status.to_string()).red().bold(),
    };
    let stats = agent.model_stats();
    println!(
        "\n{status} after {} model calls (${:.2})",
        stats.n_calls, stats.cost
    );
    match &outcome.submission {
        Some(submission) if !submission.is_empty() => println!("\n{submission}"),
        _ => println!("{}", outcome.message),
    }

    if let Some(path) = &cli.output {
        Trajectory::from_run(&agent, &outcome).save(path)?;
        println!("{}", style(format!("Saved trajectory to {}", path.display())).dim());
    }

    if outcome.status != ExitStatus::Submitted {
        std::process::exit(1);
    }
    Ok(())
}

fn apply_overrides(settings: &mut Settings, cli: &Cli) {
    if let Some(model) = &cli.model {
        settings.model.model = model.clone();
    }
    if let Some(mode) = cli.mode {
        settings.agent.mode = mode;
    }
    if cli.yolo {
        settings.agent.mode = Mode::Yolo;
    }
    if let Some(cwd) = &cli.cwd {
        settings.environment.cwd = cwd.clone();
    }
    if let Some(timeout) = cli.timeout {
        settings.environment.timeout = timeout;
    }
    if let Some(step_limit) = cli.step_limit {
        settings.agent.step_limit = step_limit;
    }
    if let Some(cost_limit) = cli.cost_limit {
        settings.agent.cost_limit = cost_limit;
    }
}

fn resolve_task(cli: &Cli) -> Result<String> {
    if let Some(task) = &cli.task {
        return Ok(task.clone());
    }
    if let Some(path) = &cli.task_file {
        return std::fs::read_to_string(path)
            .map(|t| t.trim().to_string())
            .with_context(|| format!("failed to read task file {}", path.display()));
    }
    anyhow::bail!("no task given; pass it as an argument or via --task-file")
}
