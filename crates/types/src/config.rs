//! Shared configuration structures for core Firma-Sign components.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Top-level node configuration, loaded from TOML at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Base directory of the blob store.
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    /// Path of the SQLite database file.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Requests per minute admitted by the HTTP facade (consumed there; the
    /// core only carries the value).
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    /// CORS origin handed to the HTTP facade.
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
    /// Default tracing filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Optional blob store byte quota; unlimited when absent.
    #[serde(default)]
    pub storage_quota_bytes: Option<u64>,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Per-transport configuration tables, keyed by transport name. Only the
    /// transports listed here are instantiated.
    #[serde(default)]
    pub transports: BTreeMap<String, serde_json::Value>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            database_path: default_database_path(),
            rate_limit: default_rate_limit(),
            cors_origin: default_cors_origin(),
            log_level: default_log_level(),
            storage_quota_bytes: None,
            engine: EngineConfig::default(),
            transports: BTreeMap::new(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./firma-data/blobs")
}
fn default_database_path() -> PathBuf {
    PathBuf::from("./firma-data/firma.db")
}
fn default_rate_limit() -> u32 {
    100
}
fn default_cors_origin() -> String {
    "*".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Tunables of the transfer state engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Period of the deadline sweeper, seconds.
    #[serde(default = "default_deadline_tick_secs")]
    pub deadline_tick_secs: u64,
    /// Workers draining the incoming-envelope channel.
    #[serde(default = "default_receive_workers")]
    pub receive_workers: usize,
    /// Per-recipient send deadline, seconds.
    #[serde(default = "default_send_deadline_secs")]
    pub send_deadline_secs: u64,
}

fn default_deadline_tick_secs() -> u64 {
    30
}
fn default_receive_workers() -> usize {
    4
}
fn default_send_deadline_secs() -> u64 {
    60
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            deadline_tick_secs: default_deadline_tick_secs(),
            receive_workers: default_receive_workers(),
            send_deadline_secs: default_send_deadline_secs(),
        }
    }
}

/// Configuration of the built-in direct-peer transport. Deserialized from
/// `transports.p2p` in the node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pConfig {
    /// First of the two adjacent listen ports: `port` carries the native
    /// framed protocol, `port + 1` the WebSocket-wrapped variant.
    pub port: u16,
    /// Upper bound on established connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Multiaddrs dialed at startup to seed the DHT.
    #[serde(default)]
    pub bootstrap: Vec<String>,
    /// Dial peers as they are discovered to warm connectivity.
    #[serde(default = "default_auto_dial")]
    pub auto_dial: bool,
    /// Dial/handshake timeout, seconds.
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    /// Per-send acknowledgement deadline, seconds.
    #[serde(default = "default_send_deadline_secs")]
    pub send_deadline_secs: u64,
    /// File holding the node's long-lived keypair; created on first start.
    #[serde(default)]
    pub identity_path: Option<PathBuf>,
}

fn default_max_connections() -> u32 {
    50
}
fn default_auto_dial() -> bool {
    true
}
fn default_connection_timeout_secs() -> u64 {
    30
}
