//! berthd: the Berth provisioning daemon.
//!
//! Single binary that assembles the engine:
//! - State store (redb)
//! - Driver registry and credentials
//! - Host pool (when a pool-based driver is enabled)
//! - Dispatch workers and the health monitor
//!
//! # Usage
//!
//! ```text
//! berthd run --config /etc/berth/berth.toml --data-dir /var/lib/berth
//! berthd check-config --config /etc/berth/berth.toml
//! ```

mod blueprints;
mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,berth=debug,berthd=debug";

#[derive(Parser)]
#[command(name = "berthd", about = "Berth provisioning daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine until interrupted.
    Run {
        /// Configuration file. Defaults plus BERTH_* overrides when absent.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/berth")]
        data_dir: PathBuf,

        /// Blueprint catalog to load into the store before starting.
        #[arg(long)]
        blueprints: Option<PathBuf>,
    },
    /// Validate a configuration (and optionally a blueprint catalog) and
    /// print the effective settings.
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        blueprints: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run {
            config,
            data_dir,
            blueprints,
        } => daemon::run(config, data_dir, blueprints).await,
        Command::CheckConfig { config, blueprints } => {
            daemon::check_config(config, blueprints)
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
