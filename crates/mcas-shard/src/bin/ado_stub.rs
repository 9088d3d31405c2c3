//! Minimal ADO process used by tests and demos.
//!
//! Connects to the shard's channel and runs a trivial plugin chain:
//! every work request is answered with a completion that echoes the
//! invocation blob back as an inline buffer. Understands the shutdown
//! and op-event messages well enough to exercise the coordinator.

use std::time::Duration;

use clap::Parser;
use tracing::{debug, info};

use mcas_ado_proto::{AdoEndpoint, AdoMessage, ResponseBuffer};
use mcas_protocol::Status;

#[derive(Parser)]
#[command(name = "mcas-ado-stub")]
#[command(about = "Echo ADO process for tests", long_about = None)]
struct Cli {
    /// Shared-memory channel name handed over by the shard.
    #[arg(long)]
    channel: String,

    /// Plugin list (accepted and ignored).
    #[arg(long, num_args = 0..)]
    plugins: Vec<String>,

    /// `{key:value}` parameters (accepted and ignored).
    #[arg(long)]
    param: Vec<String>,

    /// Core mask (accepted and ignored).
    #[arg(long)]
    cores: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();
    let cli = Cli::parse();

    // the shard creates the segment just before launching us, but the
    // race is real: retry briefly
    let mut endpoint = None;
    for _ in 0..100 {
        match AdoEndpoint::open(&cli.channel) {
            Ok(e) => {
                endpoint = Some(e);
                break;
            }
            Err(_) => std::thread::sleep(Duration::from_millis(10)),
        }
    }
    let Some(mut endpoint) = endpoint else {
        eprintln!("cannot open channel {}", cli.channel);
        std::process::exit(1);
    };
    info!(
        channel = %cli.channel,
        plugins = ?cli.plugins,
        params = ?cli.param,
        cores = ?cli.cores,
        "ADO stub attached"
    );

    loop {
        match endpoint.try_recv() {
            Ok(Some(msg)) => match msg {
                AdoMessage::Bootstrap { pool_name, .. } => {
                    debug!(%pool_name, "bootstrap");
                }
                AdoMessage::MemoryMap { token, len, .. } => {
                    debug!(token = format_args!("{token:#x}"), len, "memory map");
                }
                AdoMessage::WorkRequest {
                    work_key, request, ..
                } => {
                    let completion = AdoMessage::WorkCompletion {
                        work_key,
                        status: Status::Ok.to_i32(),
                        buffers: vec![ResponseBuffer::Inline {
                            layer_id: 0,
                            data: request,
                        }],
                    };
                    while let Err(mcas_ado_proto::IpcError::Full) = endpoint.send(&completion) {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
                AdoMessage::OpEvent { op } => {
                    let _ = endpoint.send(&AdoMessage::OpEventResponse { op });
                }
                AdoMessage::ClusterEvent { sender, .. } => {
                    debug!(%sender, "cluster event");
                }
                AdoMessage::Shutdown => {
                    info!("shutdown requested");
                    return;
                }
                other => debug!("ignoring {other:?}"),
            },
            Ok(None) => {
                if !endpoint.peer_alive() {
                    info!("shard gone, exiting");
                    return;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => {
                eprintln!("channel error: {e}");
                return;
            }
        }
    }
}
