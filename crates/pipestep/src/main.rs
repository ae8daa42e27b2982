//! Pipestep - CI/CD pipeline step runner
//!
//! Main entry point: `pipestep [OPTIONS] <STEP> [--<param> <value>...]`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::builder::BoolishValueParser;
use clap::{ArgAction, CommandFactory, FromArgMatches, Parser, Subcommand};
use pipestep_lifecycle::{RunOptions, Services, StepDriver};
use pipestep_log::LogSink;
use pipestep_types::StepError;
use tokio::signal;
use tokio_util::sync::CancellationToken;

mod flags;
mod steps;

/// Exit code for a missing or unknown step.
const USAGE_EXIT: u8 = 2;

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Pipestep - CI/CD pipeline step runner
#[derive(Parser)]
#[command(name = "pipestep")]
#[command(author, version, about, long_about = None)]
#[command(override_usage = "pipestep [OPTIONS] <STEP> [--<param> <value>...]")]
pub struct Cli {
    /// Enable debug logging
    #[arg(long, env = "PIPESTEP_verbose", action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    pub verbose: bool,

    /// Correlation id propagated to logs and telemetry (generated when absent)
    #[arg(long, env = "PIPESTEP_correlationID")]
    pub correlation_id: Option<String>,

    /// Stage whose `stages.<name>` configuration applies
    #[arg(long, env = "PIPESTEP_stageName")]
    pub stage_name: Option<String>,

    /// Root of the pipeline environment
    #[arg(long, env = "PIPESTEP_envRootPath")]
    pub env_root: Option<PathBuf>,

    /// Project configuration file (default: .pipeline/config.yml)
    #[arg(long, env = "PIPESTEP_customConfig")]
    pub custom_config: Option<PathBuf>,

    /// Default configuration files, applied in order below the project file
    #[arg(long, env = "PIPESTEP_defaultConfig", value_delimiter = ',')]
    pub default_config: Vec<PathBuf>,

    /// Log format: default, timestamp, plain or github
    #[arg(long, env = "PIPESTEP_logFormat")]
    pub log_format: Option<String>,

    /// Do not send the telemetry record
    #[arg(long, env = "PIPESTEP_noTelemetry", action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    pub no_telemetry: bool,

    /// Cancel the step after this many seconds
    #[arg(long, env = "PIPESTEP_stepTimeout", value_name = "SECONDS")]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// A step name followed by its flags
    #[command(external_subcommand)]
    Step(Vec<String>),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    let registry = steps::registry()?;
    let usage = steps::usage(&registry);
    let matches = Cli::command().after_help(usage.clone()).get_matches();
    let cli = Cli::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());

    let Some(Commands::Step(args)) = cli.command else {
        eprintln!("{}", usage);
        return Ok(ExitCode::from(USAGE_EXIT));
    };
    let Some((name, rest)) = args.split_first() else {
        eprintln!("{}", usage);
        return Ok(ExitCode::from(USAGE_EXIT));
    };

    let log = LogSink::new();
    log.set_verbose(cli.verbose);
    log.init_global()?;

    let Some(entry) = registry.get(name) else {
        eprintln!("error: unknown step '{}'\n\n{}", name, usage);
        return Ok(ExitCode::from(USAGE_EXIT));
    };

    if rest.iter().any(|a| a == "--help" || a == "-h") {
        println!("{}", steps::step_usage(&entry));
        return Ok(ExitCode::SUCCESS);
    }
    // A bad step flag is a configuration failure of the step, finalized
    // like any other.
    let flags = flags::parse(rest, &entry.metadata)
        .map_err(|e| StepError::configuration(format!("{:#}", e)));

    let options = RunOptions {
        verbose: cli.verbose,
        correlation_id: cli.correlation_id,
        stage_name: cli.stage_name,
        env_root: cli.env_root,
        workdir: std::env::current_dir()?,
        custom_config: cli.custom_config,
        default_configs: cli.default_config,
        log_format: cli.log_format,
        no_telemetry: cli.no_telemetry,
        deadline: cli.timeout.map(Duration::from_secs),
        ..Default::default()
    };
    cancel_on_signal(options.cancel.clone());

    let services = Services {
        log: Some(log),
        ..Default::default()
    };
    let outcome = StepDriver::new(options)
        .with_services(services)
        .run_parsed(&entry, flags)
        .await;

    Ok(ExitCode::from(u8::try_from(outcome.exit_code).unwrap_or(1)))
}

/// Cancel the run on SIGINT or SIGTERM.
fn cancel_on_signal(cancel: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        cancel.cancel();
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::debug!(error = %err, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::debug!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::warn!("Received SIGINT, cancelling step"),
        _ = terminate => tracing::warn!("Received SIGTERM, cancelling step"),
    }
}
