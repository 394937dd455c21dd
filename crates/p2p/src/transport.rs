//! The `Transport` implementation over the swarm driver.

use crate::directory::PeerDirectory;
use crate::identity;
use crate::protocol::{
    validate_frame, FrameFault, TransferAck, TransferFrame, MAX_DOCUMENT_BYTES,
};
use crate::swarm::{NetworkEvent, SwarmCommand, SwarmDriver};
use async_trait::async_trait;
use firma_transport::{
    Capabilities, IncomingEnvelope, OutgoingRecipient, OutgoingTransfer, RecipientResult,
    Transport, TransportStatus, TransferResult,
};
use firma_types::{P2pConfig, TransportError};
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

pub const TRANSPORT_NAME: &str = "p2p";

struct Running {
    commands: mpsc::Sender<SwarmCommand>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    local_peer_id: PeerId,
    config: P2pConfig,
}

/// Shared handles the event pump writes into.
#[derive(Clone)]
struct Shared {
    directory: Arc<PeerDirectory>,
    sink: Arc<Mutex<Option<mpsc::Sender<IncomingEnvelope>>>>,
    receiving: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<String>>>,
}

pub struct P2pTransport {
    data_dir: PathBuf,
    shared: Shared,
    running: tokio::sync::Mutex<Option<Running>>,
    initialized: AtomicBool,
    active_transfers: Arc<AtomicU32>,
    max_file_size: u64,
}

impl P2pTransport {
    /// `data_dir` hosts the identity file when the config does not name one.
    pub fn new(data_dir: impl Into<PathBuf>, directory: Arc<PeerDirectory>) -> Arc<Self> {
        Arc::new(Self {
            data_dir: data_dir.into(),
            shared: Shared {
                directory,
                sink: Arc::new(Mutex::new(None)),
                receiving: Arc::new(AtomicBool::new(false)),
                last_error: Arc::new(Mutex::new(None)),
            },
            running: tokio::sync::Mutex::new(None),
            initialized: AtomicBool::new(false),
            active_transfers: Arc::new(AtomicU32::new(0)),
            max_file_size: MAX_DOCUMENT_BYTES,
        })
    }

    /// Lowers the size cap so tests need not allocate 500 MB buffers.
    #[cfg(test)]
    fn with_max_file_size(data_dir: impl Into<PathBuf>, cap: u64) -> Arc<Self> {
        let mut transport = Self::new(data_dir, Arc::new(PeerDirectory::default()));
        Arc::get_mut(&mut transport)
            .expect("fresh transport is uniquely owned")
            .max_file_size = cap;
        transport
    }

    /// The node's own peer id, once initialized.
    pub async fn local_peer_id(&self) -> Option<PeerId> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.local_peer_id.clone())
    }

    async fn command_channel(
        &self,
    ) -> Result<(mpsc::Sender<SwarmCommand>, Duration), TransportError> {
        let running = self.running.lock().await;
        match running.as_ref() {
            None => Err(TransportError::NotInitialized(TRANSPORT_NAME.into())),
            Some(r) => Ok((
                r.commands.clone(),
                Duration::from_secs(r.config.send_deadline_secs),
            )),
        }
    }
}

/// A recipient identifier is either a bare peer id or a full multiaddr
/// carrying a `/p2p/<id>` suffix.
fn resolve_identifier(identifier: &str) -> Result<(PeerId, Option<Multiaddr>), TransportError> {
    if let Ok(peer) = identifier.parse::<PeerId>() {
        return Ok((peer, None));
    }
    let mut addr: Multiaddr = identifier
        .parse()
        .map_err(|_| TransportError::Rejected(format!("unresolvable identifier: {identifier}")))?;
    match addr.pop() {
        Some(Protocol::P2p(peer)) => Ok((peer, Some(addr))),
        _ => Err(TransportError::Rejected(format!(
            "multiaddr without /p2p/ suffix: {identifier}"
        ))),
    }
}

/// Consumes swarm events: inbound transfers are validated, acknowledged,
/// and published to the registry sink; discovery events feed the directory.
async fn run_event_pump(
    mut events: mpsc::Receiver<NetworkEvent>,
    commands: mpsc::Sender<SwarmCommand>,
    shared: Shared,
) {
    while let Some(event) = events.recv().await {
        match event {
            NetworkEvent::InboundTransfer {
                peer,
                frame,
                channel,
            } => {
                handle_inbound(peer, frame, channel, &commands, &shared).await;
            }
            NetworkEvent::PeerDiscovered { peer, address } => {
                shared
                    .directory
                    .record_seen(&peer.to_string(), Some(address.to_string()));
                shared
                    .directory
                    .record_transport(&peer.to_string(), TRANSPORT_NAME);
            }
            NetworkEvent::PeerExpired { peer } => {
                tracing::debug!(target: "p2p", event = "peer_expired", peer = %peer);
            }
            NetworkEvent::IdentifyReceived { peer, protocols } => {
                shared
                    .directory
                    .record_protocols(&peer.to_string(), protocols);
            }
            NetworkEvent::ConnectionEstablished { peer, inbound, total } => {
                tracing::debug!(
                    target: "p2p",
                    event = "connection_established",
                    peer = %peer,
                    inbound,
                    total
                );
                shared.directory.record_seen(&peer.to_string(), None);
            }
            NetworkEvent::ConnectionClosed { peer, total } => {
                tracing::debug!(target: "p2p", event = "connection_closed", peer = %peer, total);
            }
            NetworkEvent::Listening { address } => {
                tracing::info!(target: "p2p", event = "ready", %address);
            }
        }
    }
}

async fn handle_inbound(
    peer: PeerId,
    frame: TransferFrame,
    channel: libp2p::request_response::ResponseChannel<TransferAck>,
    commands: &mpsc::Sender<SwarmCommand>,
    shared: &Shared,
) {
    match validate_frame(&frame) {
        Err(FrameFault::Malformed(detail)) => {
            // Undecodable content is dropped without a reply; the remote
            // times out rather than learning anything.
            tracing::warn!(
                target: "p2p",
                event = "frame_malformed",
                peer = %peer,
                transfer_id = %frame.transfer_id,
                detail = %detail
            );
            *shared.last_error.lock() = Some(format!("malformed frame from {peer}"));
            drop(channel);
        }
        Err(fault) => {
            tracing::warn!(
                target: "p2p",
                event = "frame_rejected",
                peer = %peer,
                transfer_id = %frame.transfer_id,
                reason = fault.ack_error()
            );
            commands
                .send(SwarmCommand::SendAck {
                    channel,
                    ack: TransferAck::failed(fault.ack_error()),
                })
                .await
                .ok();
        }
        Ok(documents) => {
            let sink = shared.sink.lock().clone();
            let ack = match sink {
                Some(sink) if shared.receiving.load(Ordering::SeqCst) => {
                    let envelope = IncomingEnvelope {
                        transport: TRANSPORT_NAME.into(),
                        transfer_id: frame.transfer_id.clone(),
                        documents,
                        sender: frame.sender_info(),
                        options: frame.options.clone(),
                    };
                    if sink.send(envelope).await.is_ok() {
                        shared.directory.record_seen(&peer.to_string(), None);
                        shared
                            .directory
                            .record_transport(&peer.to_string(), TRANSPORT_NAME);
                        tracing::info!(
                            target: "p2p",
                            event = "transfer_received",
                            peer = %peer,
                            transfer_id = %frame.transfer_id
                        );
                        TransferAck::ok()
                    } else {
                        TransferAck::failed("OperationFailed")
                    }
                }
                _ => {
                    tracing::warn!(
                        target: "p2p",
                        event = "transfer_dropped_not_receiving",
                        peer = %peer,
                        transfer_id = %frame.transfer_id
                    );
                    TransferAck::failed("OperationFailed")
                }
            };
            commands
                .send(SwarmCommand::SendAck { channel, ack })
                .await
                .ok();
        }
    }
}

async fn send_to_recipient(
    commands: mpsc::Sender<SwarmCommand>,
    frame: TransferFrame,
    recipient: OutgoingRecipient,
    deadline: Duration,
) -> RecipientResult {
    let (peer, address) = match resolve_identifier(&recipient.identifier) {
        Ok(resolved) => resolved,
        Err(error) => return RecipientResult::failed(&recipient, &error),
    };

    if let Some(address) = address {
        // Manual address: teach the routing table and warm the connection
        // before the request goes out.
        commands
            .send(SwarmCommand::AddPeerAddress {
                peer,
                address: address.clone(),
            })
            .await
            .ok();
        commands.send(SwarmCommand::Dial(address)).await.ok();
    }

    let (reply_tx, reply_rx) = oneshot::channel();
    if commands
        .send(SwarmCommand::SendTransfer {
            peer,
            frame,
            reply: reply_tx,
        })
        .await
        .is_err()
    {
        return RecipientResult::failed(
            &recipient,
            &TransportError::Internal("swarm loop is gone".into()),
        );
    }

    match tokio::time::timeout(deadline, reply_rx).await {
        Err(_) => RecipientResult::failed(&recipient, &TransportError::SendTimeout),
        Ok(Err(_)) => RecipientResult::failed(&recipient, &TransportError::Cancelled),
        Ok(Ok(Err(error))) => RecipientResult::failed(&recipient, &error),
        Ok(Ok(Ok(ack))) => {
            if ack.success {
                RecipientResult::ok(&recipient)
            } else {
                // The remote's negative ack carries a taxonomy token.
                RecipientResult {
                    recipient_id: recipient.id.clone(),
                    identifier: recipient.identifier.clone(),
                    success: false,
                    error: Some(ack.error.unwrap_or_else(|| "OperationFailed".into())),
                    detail: Some("rejected by remote".into()),
                    retryable: false,
                }
            }
        }
    }
}

#[async_trait]
impl Transport for P2pTransport {
    fn name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            max_file_size: self.max_file_size,
            supports_batch: true,
            supports_encryption: true,
            supports_notifications: false,
            supports_resume: true,
            required_config: vec!["port".to_string()],
        }
    }

    fn validate_config(&self, raw: &serde_json::Value) -> bool {
        serde_json::from_value::<P2pConfig>(raw.clone()).is_ok()
    }

    async fn initialize(&self, config: &serde_json::Value) -> Result<(), TransportError> {
        let config: P2pConfig = serde_json::from_value(config.clone())
            .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;

        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let identity_path = config
            .identity_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("identity.key"));
        let keypair = identity::load_or_generate(&identity_path)?;

        let driver = SwarmDriver::start(keypair, config.clone())?;
        let SwarmDriver {
            commands,
            events,
            shutdown,
            task,
            local_peer_id,
        } = driver;

        let pump = tokio::spawn(run_event_pump(
            events,
            commands.clone(),
            self.shared.clone(),
        ));

        tracing::info!(target: "p2p", event = "initialized", peer_id = %local_peer_id);
        *running = Some(Running {
            commands,
            shutdown,
            tasks: vec![task, pump],
            local_peer_id,
            config,
        });
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        let mut running = self.running.lock().await;
        if let Some(running) = running.take() {
            running.shutdown.send(true).ok();
            for task in running.tasks {
                task.await
                    .map_err(|e| TransportError::Internal(format!("task join: {e}")))?;
            }
        }
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn status(&self) -> TransportStatus {
        TransportStatus {
            initialized: self.initialized.load(Ordering::SeqCst),
            receiving: self.shared.receiving.load(Ordering::SeqCst),
            active_transfers: self.active_transfers.load(Ordering::SeqCst),
            last_error: self.shared.last_error.lock().clone(),
        }
    }

    async fn send(&self, transfer: OutgoingTransfer) -> Result<TransferResult, TransportError> {
        let (commands, deadline) = self.command_channel().await?;

        // The size cap is enforced before any bytes leave the node: an
        // oversize document fails every recipient without opening a
        // connection.
        for document in &transfer.documents {
            let size = document.bytes.len() as u64;
            if size > self.max_file_size {
                let error = TransportError::FileTooLarge {
                    size,
                    max: self.max_file_size,
                };
                let results = transfer
                    .recipients
                    .iter()
                    .map(|r| RecipientResult::failed(r, &error))
                    .collect();
                return Ok(TransferResult::from_results(transfer.transfer_id, results));
            }
        }

        self.active_transfers.fetch_add(1, Ordering::SeqCst);
        let frame = TransferFrame::from_outgoing(&transfer);
        let sends = transfer.recipients.iter().map(|recipient| {
            send_to_recipient(
                commands.clone(),
                frame.clone(),
                recipient.clone(),
                deadline,
            )
        });
        let results = futures::future::join_all(sends).await;
        self.active_transfers.fetch_sub(1, Ordering::SeqCst);

        for result in results.iter().filter(|r| !r.success) {
            if let Some(error) = &result.error {
                *self.shared.last_error.lock() =
                    Some(format!("{}: {error}", result.identifier));
            }
        }
        Ok(TransferResult::from_results(transfer.transfer_id, results))
    }

    async fn start_receiving(
        &self,
        sink: mpsc::Sender<IncomingEnvelope>,
    ) -> Result<(), TransportError> {
        *self.shared.sink.lock() = Some(sink);
        self.shared.receiving.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_receiving(&self) -> Result<(), TransportError> {
        self.shared.receiving.store(false, Ordering::SeqCst);
        *self.shared.sink.lock() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
