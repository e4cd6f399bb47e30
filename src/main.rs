mod capacity;
mod config;
mod extract;
mod monitor;
mod runner;
mod usage;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use crate::runner::{Outcome, RunOptions};

/// Run external commands under a disk-usage quota: launch the command,
/// watch the watched directory's size on a background task, and kill the
/// command if the budget is exceeded before it finishes or times out.
#[derive(Parser, Debug)]
#[command(name = "diskwarden", version, about)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "diskwarden.toml")]
    config: PathBuf,

    /// Override the quota in GB
    #[arg(long)]
    quota_gb: Option<f64>,

    /// Override the watched directory
    #[arg(long)]
    watch: Option<PathBuf>,

    /// Override the command timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Extra logging (monitor samples, capacity decisions)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run one command under the disk budget
    Run {
        /// Program and arguments, executed without a shell
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Unpack .tar.zst archives under the disk budget
    Extract {
        /// Directory to scan for archives (default: from config)
        #[arg(long)]
        source: Option<PathBuf>,
        /// Directory to unpack into (default: the watched directory)
        #[arg(long)]
        dest: Option<PathBuf>,
    },
    /// Report current usage of the watched directory
    Usage {
        /// Directory to probe (default: the watched directory)
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    let cfg = match config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            return ExitCode::from(2);
        }
    };

    let watch = cli.watch.clone().unwrap_or_else(|| cfg.paths.watch_dir.clone());
    let mut opts = RunOptions::new(
        usage::gb_to_bytes(cli.quota_gb.unwrap_or(cfg.quota.limit_gb)),
        watch.clone(),
    );
    opts.timeout = Duration::from_secs(cli.timeout.unwrap_or(cfg.run.timeout_secs));
    opts.poll_interval = Duration::from_secs(cfg.monitor.poll_interval_secs);

    match cli.command {
        Cmd::Run { command } => run_command(&command, &opts).await,
        Cmd::Extract { source, dest } => {
            let source = source.unwrap_or_else(|| cfg.paths.source_dir.clone());
            let dest = dest.unwrap_or_else(|| watch.clone());
            match extract::extract_archives(&source, &dest, &opts).await {
                Ok(report) => {
                    tracing::info!(
                        extracted = report.extracted,
                        removed = report.removed,
                        "extraction complete"
                    );
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    tracing::error!(error = %e, "extraction failed");
                    ExitCode::from(1)
                }
            }
        }
        Cmd::Usage { path } => {
            let path = path.unwrap_or(watch);
            match usage::dir_usage(&path) {
                Ok(bytes) => {
                    println!("{} GB", usage::to_gb(bytes));
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    tracing::error!(error = %e, "usage probe failed");
                    ExitCode::from(2)
                }
            }
        }
    }
}

/// Run one command under the budget and map the outcome to an exit code.
async fn run_command(command: &[String], opts: &RunOptions) -> ExitCode {
    let label = command
        .first()
        .map(|p| format!("running '{p}'"))
        .unwrap_or_else(|| "running command".to_string());

    match runner::run_guarded(command, &label, opts).await {
        Ok(Outcome::Completed) => ExitCode::SUCCESS,
        Ok(Outcome::NonZeroExit { code, .. }) => {
            // surface the child's own code where it fits, generic failure otherwise
            match code {
                Some(c) if (1..=255).contains(&c) => ExitCode::from(c as u8),
                _ => ExitCode::FAILURE,
            }
        }
        Ok(Outcome::TimedOut) => ExitCode::from(3),
        Ok(Outcome::QuotaExceeded) => ExitCode::from(4),
        Err(e) => {
            tracing::error!(error = %e, "command could not be run");
            ExitCode::from(2)
        }
    }
}
