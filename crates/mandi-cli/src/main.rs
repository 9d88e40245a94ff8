use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use mandi_adapters::CsvFileSource;
use mandi_core::DateWindow;
use mandi_storage::ArchiveStore;
use mandi_sync::{
    archive_status, report_daily_markdown, verify_archive, RunError, RunOutcome, RunRequest,
    SyncConfig, SyncPipeline,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mandi")]
#[command(about = "Incremental updater for the mandi commodity price archive")]
struct Cli {
    /// Archive root; overrides MANDI_ARCHIVE_DIR.
    #[arg(long, global = true)]
    archive_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch new rows from the upstream API and commit them.
    Run {
        /// First arrival date to fetch (YYYY-MM-DD).
        #[arg(long, requires = "end")]
        start: Option<NaiveDate>,
        /// Last arrival date to fetch (YYYY-MM-DD).
        #[arg(long, requires = "start")]
        end: Option<NaiveDate>,
    },
    /// Merge a local CSV snapshot into the archive.
    Import { path: PathBuf },
    /// Print archive and last-run status as JSON.
    Status {
        /// Exit 1 when the last successful run is older than this.
        #[arg(long)]
        max_age_hours: Option<f64>,
    },
    /// Re-verify every partition against the manifest.
    Verify,
    /// Summarize recent runs as markdown.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into())))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "command failed");
            ExitCode::from(1)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let command = cli.command.unwrap_or(Commands::Run {
        start: None,
        end: None,
    });
    let load_config = || -> Result<SyncConfig, RunError> {
        let mut config = SyncConfig::from_env()?;
        if let Some(dir) = &cli.archive_dir {
            config.archive_dir = dir.clone();
        }
        Ok(config)
    };

    match command {
        Commands::Run { start, end } => {
            let window = match (start, end) {
                (Some(start), Some(end)) => {
                    Some(DateWindow::new(start, end).context("invalid --start/--end")?)
                }
                _ => None,
            };
            let pipeline = load_config().and_then(SyncPipeline::from_config);
            Ok(match pipeline {
                Ok(pipeline) => run(&pipeline, RunRequest { window }).await,
                Err(err) => report_failure(&err),
            })
        }
        Commands::Import { path } => {
            if !path.is_file() {
                anyhow::bail!("snapshot {} does not exist", path.display());
            }
            Ok(match load_config() {
                Ok(config) => {
                    let pipeline = SyncPipeline::new(config, Box::new(CsvFileSource::new(path)));
                    run(&pipeline, RunRequest::default()).await
                }
                Err(err) => report_failure(&err),
            })
        }
        Commands::Status { max_age_hours } => {
            let config = load_config()?;
            let store = ArchiveStore::new(config.archive_dir);
            let status = archive_status(&store, max_age_hours, Utc::now())?;
            print_json(&status)?;
            Ok(if status.stale {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            })
        }
        Commands::Verify => {
            let config = load_config()?;
            let store = ArchiveStore::new(config.archive_dir);
            let report = verify_archive(&store)?;
            print_json(&report)?;
            if report.is_clean() {
                info!(partitions = report.partitions.len(), "archive verified");
                Ok(ExitCode::SUCCESS)
            } else {
                error!(problems = report.problem_count(), "archive failed verification");
                Ok(ExitCode::from(6))
            }
        }
        Commands::Report { runs } => {
            let config = load_config()?;
            let markdown = report_daily_markdown(runs, &config.archive_dir)?;
            println!("{markdown}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(pipeline: &SyncPipeline, request: RunRequest) -> ExitCode {
    match pipeline.run_until(request, shutdown_signal()).await {
        Ok(outcome) => report_outcome(&outcome),
        Err(err) => report_failure(&err),
    }
}

fn report_outcome(outcome: &RunOutcome) -> ExitCode {
    if let Err(err) = print_json(outcome) {
        error!(error = %format!("{err:#}"), "could not print outcome");
    }
    exit_code(outcome.exit_code)
}

fn report_failure(err: &RunError) -> ExitCode {
    let summary = serde_json::json!({
        "status": "failed",
        "kind": err.kind(),
        "exit_code": err.exit_code(),
        "error": err.to_string(),
    });
    println!("{summary}");
    exit_code(err.exit_code())
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("serializing output")?;
    println!("{text}");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("interrupt received"),
        () = terminate => info!("terminate received"),
    }
}
