//! Leaderboard evaluator CLI
//!
//! The `leaderboard` command runs a driving agent over every route of a catalog against a
//! running simulator bridge, checkpointing each result so an interrupted evaluation can be
//! resumed with `--resume true`.
//!
//! ## Exit codes
//!
//! - `0`: every task recorded
//! - `1`: configuration or checkpoint error, nothing ran
//! - `2`: simulator unreachable or infrastructure retries exhausted
//! - `130`: interrupted by the operator

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use tokio::sync::watch;
use tracing::Level;

use leaderboard_core::telemetry::init_tracing;
use leaderboard_core::{
    EvaluatorConfig, ExistingCheckpointPolicy, Orchestrator, OrchestratorError,
    ProcessAgentLauncher, RunSummary, ScenarioType, SimEndpoint, TcpSimulator, Track, VERSION,
};

#[derive(Parser, Debug)]
#[command(name = "leaderboard")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Closed-loop route evaluation for autonomous driving agents", long_about = None)]
struct Cli {
    /// Scenario trigger catalog (JSON)
    #[arg(long)]
    scenarios: PathBuf,

    /// Route catalog (XML)
    #[arg(long)]
    routes: PathBuf,

    /// Episodes per route
    #[arg(long, default_value_t = 1)]
    repetitions: u32,

    /// Evaluation track: SENSORS or MAP
    #[arg(long, default_value = "SENSORS")]
    track: Track,

    /// Checkpoint file holding per-task results
    #[arg(long, default_value = "./simulation_results.json")]
    checkpoint: PathBuf,

    /// Agent executable, launched once per episode
    #[arg(long)]
    agent: PathBuf,

    /// Configuration file handed to the agent
    #[arg(long = "agent-config")]
    agent_config: Option<PathBuf>,

    /// 1 raises the default log level to DEBUG
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=1))]
    debug: u8,

    /// Directory for simulator recordings; empty disables recording
    #[arg(long, default_value = "")]
    record: String,

    /// Continue an existing checkpoint instead of starting over
    #[arg(
        long,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_value_t = false,
        default_missing_value = "true"
    )]
    resume: bool,

    /// Simulator host
    #[arg(long, env = "LEADERBOARD_HOST", default_value = "localhost")]
    host: String,

    /// Simulator port
    #[arg(long, default_value_t = 2000)]
    port: u16,

    /// Traffic manager port
    #[arg(long = "trafficManagerPort", default_value_t = 8000)]
    traffic_manager_port: u16,

    /// Per-call client timeout in seconds
    #[arg(long, default_value_t = 200.0)]
    timeout: f64,

    /// Wall-clock bound on one episode in seconds
    #[arg(long = "episode-timeout", default_value_t = 3600.0)]
    episode_timeout: f64,

    /// Only run routes carrying a trigger of this type, e.g. Scenario3
    #[arg(long = "scenario-type", env = "INTENDED_SCENARIO_TYPE")]
    scenario_type: Option<String>,

    /// What to do with a non-empty checkpoint when not resuming
    #[arg(long = "on-existing-checkpoint", value_enum, default_value_t = PolicyArg::Reject)]
    on_existing_checkpoint: PolicyArg,

    /// Infrastructure retries per task before the run fails
    #[arg(long = "infra-retries", default_value_t = 2)]
    infra_retries: u32,

    /// Simulator installation, recorded for provenance
    #[arg(long = "simulator-root", env = "CARLA_ROOT")]
    simulator_root: Option<String>,

    /// Emit JSON-formatted log lines and a JSON report
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum PolicyArg {
    Reject,
    Overwrite,
}

impl From<PolicyArg> for ExistingCheckpointPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Reject => ExistingCheckpointPolicy::Reject,
            PolicyArg::Overwrite => ExistingCheckpointPolicy::Overwrite,
        }
    }
}

fn seconds(flag: &str, value: f64) -> Result<Duration> {
    if value.is_nan() || value <= 0.0 {
        bail!("--{flag} must be a positive number of seconds, got {value}");
    }
    Duration::try_from_secs_f64(value).with_context(|| format!("--{flag} is out of range"))
}

/// An exported but empty variable counts as unset.
fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Translate parsed flags into the evaluator configuration.
fn build_config(cli: &Cli) -> Result<EvaluatorConfig> {
    let mut config = EvaluatorConfig::new(
        cli.routes.clone(),
        cli.scenarios.clone(),
        cli.agent.clone(),
        cli.checkpoint.clone(),
    );
    config.repetitions = cli.repetitions;
    config.track = cli.track;
    config.agent_config = cli.agent_config.clone();
    config.debug = cli.debug > 0;
    config.record = match cli.record.trim() {
        "" => None,
        dir => Some(PathBuf::from(dir)),
    };
    config.resume = cli.resume;
    config.on_existing_checkpoint = cli.on_existing_checkpoint.into();
    config.endpoint = SimEndpoint::new(cli.host.clone(), cli.port, cli.traffic_manager_port);
    config.client_timeout = seconds("timeout", cli.timeout)?;
    config.episode_timeout = seconds("episode-timeout", cli.episode_timeout)?;
    config.scenario_type = non_blank(&cli.scenario_type)
        .map(str::parse::<ScenarioType>)
        .transpose()
        .context("Invalid --scenario-type")?;
    config.infra_retries = cli.infra_retries;
    config.simulator_root = non_blank(&cli.simulator_root).map(PathBuf::from);
    Ok(config)
}

/// Exit status for a failed run.
fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<OrchestratorError>()
        .map_or(1, OrchestratorError::exit_code)
}

/// Feed Ctrl-C into the shutdown channel.
fn watch_interrupt() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after cleanup");
            let _ = tx.send(true);
        }
    });
    rx
}

async fn run(cli: &Cli) -> Result<RunSummary> {
    let config = build_config(cli)?;
    tracing::info!(
        version = VERSION,
        routes = %config.routes.display(),
        checkpoint = %config.checkpoint.display(),
        endpoint = %config.endpoint,
        track = %config.track,
        resume = config.resume,
        "starting evaluation"
    );

    let backend = Arc::new(TcpSimulator::new(format!("leaderboard/{VERSION}")));
    let launcher = Arc::new(ProcessAgentLauncher::new(
        config.agent.clone(),
        config.agent_config.clone(),
    ));
    let mut orchestrator =
        Orchestrator::new(config, backend, launcher).with_shutdown(watch_interrupt());
    let summary = orchestrator.run().await?;
    Ok(summary)
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        let out = serde_json::to_string_pretty(&summary.report)
            .context("Failed to serialize evaluation report")?;
        println!("{out}");
    } else {
        print!("{}", summary.report.render_summary());
        println!(
            "Executed {} task(s), resumed {}; results in {}",
            summary.executed,
            summary.resumed,
            summary.checkpoint.display()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.debug > 0 {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let outcome = match run(&cli).await {
        Ok(summary) => print_summary(&summary, cli.json),
        Err(e) => Err(e),
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}
