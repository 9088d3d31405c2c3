//! Shard server binary.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use mcas_backend::MapStore;
use mcas_shard::cluster::ClusterSignalQueue;
use mcas_shard::{signals, ConfigFile, Shard};
use mcas_transport::TcpListenerEndpoint;

#[derive(Parser)]
#[command(name = "mcas-shard")]
#[command(about = "MCAS key-value shard server", long_about = None)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Index of the shard to run from the configuration.
    #[arg(short, long, default_value = "0")]
    shard: usize,

    /// Debug verbosity override.
    #[arg(short, long)]
    debug: Option<u32>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let text = match std::fs::read_to_string(&cli.config) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("cannot read config {}: {e}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };
    let config_file = match ConfigFile::from_json(&text) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("cannot parse config {}: {e}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };
    let Some(mut config) = config_file.shards.get(cli.shard).cloned() else {
        eprintln!("no shard {} in config", cli.shard);
        return ExitCode::FAILURE;
    };
    if let Some(debug) = cli.debug {
        config.debug_level = debug;
    }

    let filter = match config.debug_level {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    if let Err(e) = signals::install_sigint_handler() {
        error!("cannot install SIGINT handler: {e}");
        return ExitCode::FAILURE;
    }

    let store = match config.backend.as_str() {
        "mapstore" => Box::new(MapStore::new()),
        other @ ("hstore" | "hstore-cc") => {
            // persistent engines plug in behind the same trait; this
            // build ships only the DRAM backend
            error!(backend = other, "backend not built into this binary");
            return ExitCode::FAILURE;
        }
        other => {
            error!(backend = other, "unrecognized backend");
            return ExitCode::FAILURE;
        }
    };

    let endpoint = format!("{}:{}", config.addr, config.port);
    let listener = match config.provider.as_str() {
        "tcp" => match TcpListenerEndpoint::bind(&endpoint) {
            Ok(l) => Box::new(l),
            Err(e) => {
                error!(%endpoint, "cannot bind: {e}");
                return ExitCode::FAILURE;
            }
        },
        other => {
            error!(provider = other, "provider not available in this binary");
            return ExitCode::FAILURE;
        }
    };

    info!(%endpoint, core = config.core, "starting shard");
    let (_cluster_tx, cluster_rx) = ClusterSignalQueue::new();
    let mut shard = Shard::new(config, store, listener, cluster_rx);
    shard.run();
    ExitCode::SUCCESS
}
