#![forbid(unsafe_code)]

//! Node assembly and supervision.
//!
//! Brings the components up in dependency order — relational store, blob
//! store, coordinator, subscription bus, transport registry, state engine —
//! and tears them down in reverse. Individual transport failures surface on
//! the bus and never cascade; a shutdown request quiesces transports
//! gracefully.

pub mod config;

use anyhow::Context;
use firma_engine::{NoopAnchor, SubscriptionBus, TransferEngine};
use firma_p2p::{P2pTransport, PeerDirectory};
use firma_store::{BlobStore, Database, StoreCoordinator};
use firma_transport::{ShutdownMode, TransportRegistry};
use firma_types::{NodeConfig, SenderInfo, VerificationStatus};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Size cap the blob store enforces; matches the largest transport cap.
const BLOB_MAX_FILE_SIZE: u64 = 500 * 1024 * 1024;

/// Sweep period for the peer directory's sliding TTL.
const DIRECTORY_SWEEP_PERIOD: Duration = Duration::from_secs(60 * 60);

pub struct Node {
    pub engine: Arc<TransferEngine>,
    pub directory: Arc<PeerDirectory>,
    registry: Arc<TransportRegistry>,
    background_shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").finish_non_exhaustive()
    }
}

impl Node {
    /// Starts every component in order. `data_dir` hosts the node identity
    /// and any config-relative state.
    pub async fn start(config: NodeConfig, data_dir: &Path) -> anyhow::Result<Node> {
        let database = Arc::new(
            Database::open(&config.database_path)
                .with_context(|| format!("open database at {:?}", config.database_path))?,
        );
        let blobs = Arc::new(
            BlobStore::open(
                &config.storage_path,
                BLOB_MAX_FILE_SIZE,
                config.storage_quota_bytes,
            )
            .with_context(|| format!("open blob store at {:?}", config.storage_path))?,
        );
        let coordinator = Arc::new(StoreCoordinator::new(database, blobs));
        coordinator
            .clean_temp()
            .await
            .context("clean temp staging area")?;

        let bus = SubscriptionBus::default();

        let (incoming_tx, incoming_rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::channel(64);
        let registry = Arc::new(TransportRegistry::new(incoming_tx, events_tx));
        let directory = Arc::new(PeerDirectory::default());
        let p2p = P2pTransport::new(data_dir, Arc::clone(&directory));
        registry.register(p2p.clone());
        registry
            .initialize_all(&config.transports)
            .await
            .context("initialize transports")?;

        let local_sender = local_sender(&p2p).await;
        tracing::info!(
            target: "node",
            event = "identity",
            sender_id = %local_sender.sender_id
        );

        let engine = TransferEngine::new(
            coordinator,
            Arc::clone(&registry),
            bus,
            Arc::new(NoopAnchor),
            config.engine.clone(),
            local_sender,
        );
        engine.start(incoming_rx, events_rx);

        let (background_shutdown, _) = watch::channel(false);
        directory.spawn_sweeper(DIRECTORY_SWEEP_PERIOD, background_shutdown.subscribe());

        tracing::info!(target: "node", event = "started");
        Ok(Node {
            engine,
            directory,
            registry,
            background_shutdown,
        })
    }

    /// Reverse-order teardown: engine first, transports last-but-one,
    /// stores drop with the node.
    pub async fn shutdown(&self) {
        tracing::info!(target: "node", event = "shutdown_begin");
        self.engine.shutdown().await;
        self.registry.shutdown(ShutdownMode::Graceful).await;
        self.background_shutdown.send(true).ok();
        tracing::info!(target: "node", event = "shutdown_complete");
    }
}

/// The identity stamped on outgoing frames: the p2p peer id when the p2p
/// transport is live, a host-derived placeholder otherwise.
async fn local_sender(p2p: &P2pTransport) -> SenderInfo {
    let sender_id = match p2p.local_peer_id().await {
        Some(peer_id) => peer_id.to_string(),
        None => "local-node".to_string(),
    };
    let name = std::env::var("HOSTNAME").unwrap_or_else(|_| "firma-node".to_string());
    SenderInfo {
        sender_id,
        name,
        email: None,
        public_key: None,
        transport: "p2p".to_string(),
        timestamp: 0,
        verification: VerificationStatus::Verified,
    }
}

/// Resolves config-relative paths against the data dir when the config left
/// them at their defaults.
pub fn apply_data_dir(config: &mut NodeConfig, data_dir: &Path) {
    let defaults = NodeConfig::default();
    if config.storage_path == defaults.storage_path {
        config.storage_path = data_dir.join("blobs");
    }
    if config.database_path == defaults.database_path {
        config.database_path = data_dir.join("firma.db");
    }
}

#[allow(unused)]
fn assert_node_is_send() {
    fn check<T: Send + Sync>() {}
    check::<Node>();
}
