//! Cronloop CLI

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use cronloop_core::{
    run_sync, ExperimentBacklog, ExperimentController, ExperimentStatus, InMemoryJobControl,
    JobControl, LoopConfig, MetricSummary, OpenClawJobControl, SyncOptions, WorkspacePaths,
};
use cronloop_core::report::{render_control_report, write_report};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

/// Initialize logging with the specified verbosity level
fn init_logging(verbose: u8, quiet: bool, json: bool) -> Result<()> {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter =
        EnvFilter::from_default_env().add_directive(format!("cronloop={}", level).parse()?);

    // stdout is reserved for the JSON summary line
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(verbose >= 2) // Show module path at debug+
        .with_file(verbose >= 3) // Show file:line at trace
        .with_line_number(verbose >= 3);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }

    Ok(())
}

#[derive(Parser)]
#[command(name = "cronloop")]
#[command(about = "Metrics and auto-promotion loop for scheduled jobs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Workspace root
    #[arg(
        long,
        env = "CRONLOOP_WORKSPACE",
        default_value = "~/.openclaw/workspace",
        global = true
    )]
    workspace: String,

    /// Scheduler profile (default: from config, else "dev")
    #[arg(long, env = "CRONLOOP_PROFILE", global = true)]
    profile: Option<String>,

    /// Config file (default: <workspace>/self-improvement/config/cronloop.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use a JSON jobs file instead of the scheduler CLI
    #[arg(long, global = true)]
    jobs_file: Option<PathBuf>,

    /// Increase verbosity (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Output logs as JSON (for machine parsing)
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest run history, refresh metrics and propose experiments
    Sync {
        /// Lookback window in days
        #[arg(long)]
        window_days: Option<u32>,
        /// Run history entries fetched per job
        #[arg(long)]
        runs_per_job_limit: Option<usize>,
        /// Minimum runs before a job gets recommendations
        #[arg(long)]
        min_sample: Option<u64>,
    },
    /// Activate, evaluate, promote or roll back one experiment
    Control {
        /// Runs required after activation before evaluating
        #[arg(long)]
        min_new_runs_before_evaluation: Option<u64>,
        /// Record decisions without editing any job
        #[arg(long)]
        dry_run: bool,
    },
    /// Show backlog counts and the active experiment
    Status,
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Sync { .. } => "sync",
            Commands::Control { .. } => "control",
            Commands::Status => "status",
        }
    }
}

fn job_control(cli: &Cli, config: &LoopConfig) -> Result<Box<dyn JobControl>> {
    match &cli.jobs_file {
        Some(path) => {
            let path = PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).to_string());
            info!(path = %path.display(), "Using jobs file");
            Ok(Box::new(InMemoryJobControl::from_file(&path)?))
        }
        None => Ok(Box::new(OpenClawJobControl::new(
            config.openclaw_bin.clone(),
            config.profile.clone(),
        ))),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging with CLI options
    let result = match init_logging(cli.verbose, cli.quiet, cli.log_json) {
        Ok(()) => run(&cli).await,
        Err(e) => Err(e),
    };

    // every invocation ends with exactly one summary line on stdout
    match result {
        Ok(summary) => {
            println!("{}", summary);
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(command = cli.command.name(), error = %format!("{:#}", err), "Command failed");
            println!(
                "{}",
                json!({
                    "ok": false,
                    "command": cli.command.name(),
                    "error": format!("{:#}", err),
                })
            );
            eprintln!("Error: {:?}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> Result<Value> {
    // Expand home directory
    let workspace = PathBuf::from(shellexpand::tilde(&cli.workspace).to_string());
    let paths = WorkspacePaths::new(&workspace);

    let mut config = LoopConfig::load(cli.config.as_deref(), &paths)
        .context("Failed to load configuration")?;
    if let Some(profile) = &cli.profile {
        config.profile = profile.clone();
    }

    let summary = match &cli.command {
        Commands::Sync {
            window_days,
            runs_per_job_limit,
            min_sample,
        } => {
            if let Some(days) = window_days {
                config.window_days = *days;
            }
            if let Some(limit) = runs_per_job_limit {
                config.runs_per_job_limit = *limit;
            }
            if let Some(min) = min_sample {
                config.min_sample = *min;
            }

            let jobs = job_control(cli, &config)?;
            let outcome =
                run_sync(jobs.as_ref(), &paths, &SyncOptions::from(&config), Utc::now()).await?;

            let new_experiments: Vec<&str> =
                outcome.new_experiments.iter().map(|e| e.id.as_str()).collect();
            json!({
                "ok": true,
                "profile": config.profile,
                "newRowsIngested": outcome.summary.new_rows_ingested,
                "windowRuns": outcome.summary.window.runs,
                "successRate": outcome.summary.window.success_rate,
                "report": outcome.report,
                "latestReport": outcome.latest_report,
                "newExperiments": new_experiments,
            })
        }

        Commands::Control {
            min_new_runs_before_evaluation,
            dry_run,
        } => {
            if let Some(min) = min_new_runs_before_evaluation {
                config.min_new_runs = *min;
            }

            let jobs = job_control(cli, &config)?;
            let backlog = ExperimentBacklog::new(paths.backlog_file());
            let summary = MetricSummary::load(&paths.summary_file())
                .context("Failed to read metric summary")?;
            let controller = ExperimentController::from_config(&config, &paths, *dry_run);

            let now = Utc::now();
            let outcome = controller
                .run_cycle(jobs.as_ref(), &backlog, summary.as_ref(), now)
                .await?;

            let report = paths.control_report();
            write_report(&report, &render_control_report(&outcome, now, *dry_run))?;

            json!({
                "ok": true,
                "status": outcome.status.as_str(),
                "actions": outcome.actions,
                "report": report,
            })
        }

        Commands::Status => {
            let backlog = ExperimentBacklog::new(paths.backlog_file());
            let experiments = backlog.load_all()?;

            let mut counts: BTreeMap<&str, usize> = ExperimentStatus::ALL
                .iter()
                .map(|s| (s.as_str(), 0))
                .collect();
            for exp in &experiments {
                *counts.entry(exp.status.as_str()).or_default() += 1;
            }
            let active = experiments.iter().find(|e| e.is_active()).map(|e| {
                json!({
                    "id": e.id,
                    "job": e.job,
                    "type": e.experiment_type.as_str(),
                    "startedAt": e.started_at,
                    "lastEvaluationDecision": e.last_evaluation_decision,
                })
            });

            json!({
                "ok": true,
                "total": experiments.len(),
                "counts": counts,
                "active": active,
            })
        }
    };

    Ok(summary)
}
