//! Lectern CLI - sign in to a learning platform account and call its API

mod commands;
mod config;
mod console;
mod logging;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use commands::Commands;
use console::{ConsoleNavigator, ConsoleNotifier};
use lectern_core::{FileStorage, SessionStore};
use lectern_http::SessionClient;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, debug, error};

#[derive(Parser)]
#[command(name = "lectern")]
#[command(about = "Sign in to Lectern and make authorized API calls")]
#[command(version)]
struct Cli {
    /// Set logging level
    #[arg(short = 'l', long, global = true, default_value = "warn")]
    log_level: LogLevel,

    /// Directory holding the stored session, configuration and logs
    #[arg(short = 'd', long, global = true, env = "LECTERN_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Configuration file (defaults to lectern.toml in the data directory)
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    /// Timeout for the whole command in seconds (0 = no timeout)
    #[arg(short = 't', long, global = true, default_value = "60")]
    timeout: u64,

    /// Disable file logging (only log to stderr)
    #[arg(long, global = true)]
    no_file_log: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config::load_config(cli.config.as_deref(), cli.data_dir.clone())?;
    let data_dir = config.storage.resolve_dir();

    let log_dir = (!cli.no_file_log).then_some(data_dir.as_path());
    logging::init_logging(cli.log_level.into(), log_dir)?;
    debug!(data_dir = %data_dir.display(), base_url = %config.api.base_url, "Starting Lectern CLI");

    let storage = FileStorage::open(&data_dir)
        .with_context(|| format!("Failed to open session storage in {}", data_dir.display()))?;
    let store = Arc::new(SessionStore::new(Arc::new(storage))?);

    let client = SessionClient::builder()
        .config(&config)
        .store(store)
        .notifier(Arc::new(ConsoleNotifier))
        .navigator(Arc::new(ConsoleNavigator))
        .build()?;

    // Long-running commands are only stopped by the user
    let outcome = if cli.timeout == 0 || cli.command.is_long_running() {
        cli.command.execute(client, config).await
    } else {
        let timeout_duration = Duration::from_secs(cli.timeout);
        match tokio::time::timeout(timeout_duration, cli.command.execute(client, config)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("Command timed out after {} seconds", cli.timeout);
                std::process::exit(1);
            }
        }
    };

    if let Err(e) = outcome {
        error!("Command failed: {e:#}");
        std::process::exit(1);
    }

    Ok(())
}

#[derive(Clone, Debug, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(log_level: LogLevel) -> Self {
        match log_level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}
