#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use firma_node::{apply_data_dir, config, Node};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "firma-node", about = "Firma-Sign peer-to-peer signing node")]
struct Opts {
    /// TOML configuration file; defaults apply when omitted.
    #[clap(long)]
    config: Option<PathBuf>,
    /// Directory for identity, database, and blobs.
    #[clap(long, default_value = "./firma-data")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();
    std::fs::create_dir_all(&opts.data_dir)?;

    let mut node_config = config::load(opts.config.as_deref())?;
    firma_telemetry::init_tracing(&node_config.log_level)?;
    apply_data_dir(&mut node_config, &opts.data_dir);

    let node = Node::start(node_config, &opts.data_dir).await?;

    // The supervisor: log transport faults as they surface, shut down
    // gracefully on ctrl-c. Transport failures never cascade past the bus.
    let mut events = node.engine.subscribe(None);
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(target: "node", event = "interrupt");
        }
        _ = async {
            while let Some(item) = events.recv().await {
                if let firma_engine::BusItem::Event(event) = item {
                    if let firma_engine::EventKind::TransportError { transport, code, message } = &event.kind {
                        tracing::warn!(
                            target: "node",
                            event = "transport_error",
                            transport = %transport,
                            code = %code,
                            message = %message
                        );
                    }
                }
            }
        } => {}
    }

    node.shutdown().await;
    Ok(())
}
