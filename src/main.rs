mod config;
mod http;
mod llm;
mod logging;
mod metrics;
mod models;
mod pipeline;
mod providers;
mod report;

use clap::{Parser, Subcommand};
use config::RunConfig;
use eyre::WrapErr;
use logging::RunLog;
use models::{RunResult, RunStatus};
use pipeline::Pipeline;
use providers::Providers;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "product-insights")]
#[command(about = "Search, rank and summarize product reviews into an HTML report")]
#[command(version)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a full run for the configured query.
    Run {
        #[arg(short, long, env = "INSIGHTS_CONFIG", default_value = "config.yaml")]
        config: PathBuf,
    },
    /// Rebuild report.html from a previous run's saved outputs.
    Regenerate {
        /// Run directory; defaults to the most recent run.
        run_dir: Option<PathBuf>,
        /// Where to look for runs when no directory is given.
        #[arg(long)]
        base_dir: Option<PathBuf>,
        #[arg(short, long, env = "INSIGHTS_CONFIG", default_value = "config.yaml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let run_log = logging::init(cli.verbose);

    match dispatch(cli.command, run_log).await {
        Ok(code) => code,
        Err(err) => {
            error!(target = "insights.cli", "{err:#}");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(command: Command, run_log: RunLog) -> eyre::Result<ExitCode> {
    match command {
        Command::Run { config } => run(&config, run_log).await,
        Command::Regenerate {
            run_dir,
            base_dir,
            config,
        } => {
            let run_dir = match run_dir {
                Some(dir) => dir,
                None => {
                    let base_dir = base_dir.unwrap_or_else(|| default_base_dir(&config));
                    let latest = report::latest_run(&base_dir).await?;
                    info!(target = "insights.cli", dir = %latest.display(), "using most recent run");
                    latest
                }
            };
            let path = report::regenerate(&run_dir)
                .await
                .wrap_err_with(|| format!("regenerating report in {}", run_dir.display()))?;
            println!("Report written to {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(config_path: &Path, run_log: RunLog) -> eyre::Result<ExitCode> {
    let config = RunConfig::load(config_path)
        .wrap_err_with(|| format!("loading {}", config_path.display()))?;
    let providers = Providers::from_env(&config).wrap_err("configuring providers")?;
    info!(
        target = "insights.cli",
        query = %config.query,
        review_source = config.review_source.as_str(),
        "configuration loaded"
    );
    let result = Pipeline::new(config, providers)
        .with_run_log(run_log)
        .run()
        .await?;
    print_summary(&result);
    Ok(match result.status {
        RunStatus::Completed => ExitCode::SUCCESS,
        RunStatus::Failed => ExitCode::FAILURE,
    })
}

/// Falls back to the default `data` directory when the config is missing or
/// unreadable; regenerate never needs the rest of it.
fn default_base_dir(config_path: &Path) -> PathBuf {
    RunConfig::load(config_path)
        .map(|config| config.output.base_dir)
        .unwrap_or_else(|_| config::OutputConfig::default().base_dir)
}

fn print_summary(result: &RunResult) {
    println!("Run {} {:?}", result.run_id, result.status);
    println!("  directory: {}", result.run_directory.display());
    for stage in &result.stages {
        println!(
            "  {:<11} {:>8} ms  saved={}",
            stage.stage.as_str(),
            stage.elapsed_ms,
            stage.saved
        );
    }
    if result.partially_saved() {
        println!("  some stage outputs were kept in memory only:");
    }
    for fault in &result.faults {
        println!("  not saved: {} ({})", fault.artifact, fault.message);
    }
    if let Some(failure) = &result.failure {
        println!(
            "  failed at {} [{}]: {}",
            failure.stage, failure.kind, failure.detail
        );
    }
    if let Some(report) = &result.report {
        println!("  report: {}", report.display());
    }
}
