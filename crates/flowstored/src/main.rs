//! flowstored: the flow store daemon.
//!
//! Runs one replica of the flow store from a TOML config, or inspects the
//! state a replica left on disk.
//!
//! # Usage
//!
//! ```text
//! flowstored scaffold > flowstore.toml
//! flowstored run --config flowstore.toml
//! flowstored inspect --data-dir /var/lib/flowstore --device pof:0000000000000001
//! ```

mod inspect;
mod standalone;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use flowstore_core::StoreConfig;

/// Name of the redb file inside `data_dir`.
pub(crate) const DB_FILE: &str = "flowstore.redb";

const DEFAULT_FILTER: &str = "info,flowstored=debug,flowstore=debug";

#[derive(Parser)]
#[command(name = "flowstored", about = "Distributed flow-state store daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single replica with a loopback device adapter.
    Run {
        /// Path to flowstore.toml.
        #[arg(long, default_value = "flowstore.toml")]
        config: PathBuf,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Print persisted device snapshots and mastership records.
    Inspect {
        /// Data directory of a (stopped) replica.
        #[arg(long)]
        data_dir: PathBuf,

        /// Only show this device.
        #[arg(long)]
        device: Option<String>,
    },
    /// Print a starter config.
    Scaffold {
        #[arg(long, default_value = "replica-1")]
        replica_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, log_json } => {
            init_tracing(log_json);
            let config = StoreConfig::from_file(&config)?;
            standalone::run(config).await
        }
        Command::Inspect { data_dir, device } => {
            init_tracing(false);
            inspect::run(&data_dir, device.as_deref())
        }
        Command::Scaffold { replica_id } => {
            print!("{}", StoreConfig::scaffold(&replica_id).to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
