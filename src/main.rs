//! Daemon entry point: configuration, logging, lifecycle.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use agent_switchboard::config::GlobalConfig;
use agent_switchboard::supervisor::SessionManager;
use agent_switchboard::Result;

/// Config file consulted when `--config` is not given.
const DEFAULT_CONFIG_FILE: &str = "switchboard.toml";

/// Supervisor for AI coding agent subprocesses.
#[derive(Debug, Parser)]
#[command(name = "agent-switchboard", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the store directory from the config.
    #[arg(long)]
    store_dir: Option<PathBuf>,

    /// Log filter when `RUST_LOG` is not set.
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "supervisor failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(store_dir) = cli.store_dir {
        config.store_dir = store_dir;
    }

    info!(store_dir = %config.store_dir.display(), "starting supervisor");
    let manager = SessionManager::new(config).await?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| agent_switchboard::AppError::Io(format!("failed to wait for ctrl-c: {e}")))?;

    manager.shutdown().await;
    Ok(())
}

/// Load the config from an explicit path, the default file, or defaults.
fn load_config(path: Option<&std::path::Path>) -> Result<GlobalConfig> {
    if let Some(path) = path {
        return GlobalConfig::load_from_path(path);
    }
    if std::path::Path::new(DEFAULT_CONFIG_FILE).exists() {
        return GlobalConfig::load_from_path(DEFAULT_CONFIG_FILE);
    }
    Ok(GlobalConfig::default())
}
