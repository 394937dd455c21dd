//! Global structured-logging setup.
//!
//! Core components log under a fixed set of targets (`node`, `engine`,
//! `registry`, `p2p`, `store`, `blob`, `bus`) with flat `event = "..."`
//! fields keyed by transfer id. The default filter applies the configured
//! level to those targets only and holds dependency noise — libp2p's
//! sub-crates above all — at `warn`. `RUST_LOG`, when set, replaces the
//! whole filter.

use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Targets the core emits under; the configured level applies to these.
const CORE_TARGETS: [&str; 7] = ["node", "engine", "registry", "p2p", "store", "blob", "bus"];

/// Initializes the global `tracing` subscriber. `default_level` is the node
/// configuration's `log_level` and must name a level (`trace` … `error`).
pub fn init_tracing(default_level: &str) -> Result<(), anyhow::Error> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(env_filter) => env_filter,
        Err(_) => core_filter(default_level)?,
    };
    // Flattened JSON lines: the `event`/`transfer_id` fields land at the
    // top level where log pipelines index them.
    let fmt_layer = fmt::layer()
        .json()
        .flatten_event(true)
        .with_target(true)
        .with_writer(std::io::stderr);
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing_log::LogTracer::init()?;
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// `warn` for everything, `level` for the core's own targets.
fn core_filter(level: &str) -> Result<EnvFilter, anyhow::Error> {
    let mut filter = EnvFilter::new("warn");
    for target in CORE_TARGETS {
        let directive: Directive = format!("{target}={level}")
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid log level {level:?}: {e}"))?;
        filter = filter.add_directive(directive);
    }
    Ok(filter)
}
