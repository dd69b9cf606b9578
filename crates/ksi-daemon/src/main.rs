//! `ksid` — the KSI daemon binary.

#![deny(unsafe_code)]
#![deny(clippy::all)]

use std::path::PathBuf;

use clap::Parser;
use ksi_config::DaemonConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ksid", about = "KSI daemon: event-driven orchestration of LLM agent populations")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, env = "KSI_CONFIG")]
    config: Option<PathBuf>,

    /// Derive every path (socket, store, log, sandboxes, compositions)
    /// from this directory instead of loading a config file.
    #[arg(long, conflicts_with = "config")]
    root: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check_config: bool,
}

fn init_tracing(config: &DaemonConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    if config.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.root {
        Some(root) => DaemonConfig::scoped_to(root),
        None => ksi_config::load(cli.config.as_deref())?,
    };
    if cli.check_config {
        println!("configuration ok");
        return Ok(());
    }
    init_tracing(&config);
    ksi_daemon::bootstrap::run(config).await
}
