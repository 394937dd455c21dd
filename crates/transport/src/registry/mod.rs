//! The transport registry.
//!
//! Plugins are registered at startup (compile-time wiring, no runtime
//! discovery), initialized from the node's per-transport configuration
//! tables, and supervised here: the registry tracks which plugins are live,
//! fans their incoming envelopes into one shared channel, surfaces failures
//! on a supervisor event channel, and routes each recipient of an outgoing
//! transfer to the plugin named by its `transport` field.

use crate::contract::{
    IncomingEnvelope, OutgoingTransfer, RecipientResult, Transport, TransportStatus,
    TransferResult,
};
use crate::Capabilities;
use firma_types::{ErrorCode, TransportError};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// How long a plugin gets to quiesce in a graceful shutdown before it is
/// abandoned.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Supervisor-facing events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A plugin failed; `code` is a taxonomy token.
    TransportError {
        transport: String,
        code: String,
        message: String,
    },
    /// A plugin did not quiesce within the graceful window and was
    /// abandoned.
    ShutdownTimeout { transport: String },
}

/// Shutdown discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Parallel shutdown, up to 10s per plugin, force after timeout.
    Graceful,
    /// Tell every plugin to stop and clear references immediately.
    Abrupt,
}

/// Introspection record for one registered plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportDescriptor {
    pub name: String,
    pub version: String,
    pub capabilities: Capabilities,
    pub status: TransportStatus,
}

pub struct TransportRegistry {
    transports: RwLock<HashMap<String, Arc<dyn Transport>>>,
    /// Names that completed `initialize` and are receiving.
    active: RwLock<HashSet<String>>,
    incoming_tx: mpsc::Sender<IncomingEnvelope>,
    events_tx: mpsc::Sender<RegistryEvent>,
}

impl TransportRegistry {
    pub fn new(
        incoming_tx: mpsc::Sender<IncomingEnvelope>,
        events_tx: mpsc::Sender<RegistryEvent>,
    ) -> Self {
        Self {
            transports: RwLock::new(HashMap::new()),
            active: RwLock::new(HashSet::new()),
            incoming_tx,
            events_tx,
        }
    }

    /// Registers a plugin constructor product under its own name. Replaces
    /// any previous registration of the same name.
    pub fn register(&self, transport: Arc<dyn Transport>) {
        let name = transport.name().to_string();
        tracing::info!(target: "registry", event = "registered", transport = %name, version = transport.version());
        self.transports.write().insert(name, transport);
    }

    /// Initializes every transport named in `configs`, in order. A name
    /// without a registered plugin, a missing required key, or a rejected
    /// config fails startup.
    pub async fn initialize_all(
        &self,
        configs: &BTreeMap<String, serde_json::Value>,
    ) -> Result<(), TransportError> {
        for (name, config) in configs {
            let transport = self
                .transports
                .read()
                .get(name)
                .cloned()
                .ok_or_else(|| TransportError::Unavailable(name.clone()))?;

            for key in &transport.capabilities().required_config {
                if config.get(key).is_none() {
                    return Err(TransportError::InvalidConfig(format!(
                        "transport '{name}' requires config key '{key}'"
                    )));
                }
            }
            if !transport.validate_config(config) {
                return Err(TransportError::InvalidConfig(format!(
                    "transport '{name}' rejected its configuration"
                )));
            }

            transport.initialize(config).await?;
            transport.start_receiving(self.incoming_tx.clone()).await?;
            self.active.write().insert(name.clone());
            tracing::info!(target: "registry", event = "initialized", transport = %name);
        }
        Ok(())
    }

    fn initialized_transport(&self, name: &str) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = self
            .transports
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| TransportError::Unavailable(name.to_string()))?;
        if !self.active.read().contains(name) {
            return Err(TransportError::Unavailable(format!(
                "{name} is not initialized"
            )));
        }
        Ok(transport)
    }

    /// Capability descriptor of a registered plugin, live or not.
    pub fn capabilities_of(&self, name: &str) -> Option<Capabilities> {
        self.transports.read().get(name).map(|t| t.capabilities())
    }

    /// The names currently live.
    pub fn active_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.active.read().iter().cloned().collect();
        names.sort();
        names
    }

    /// Introspection over every registered plugin, live or not.
    pub async fn descriptors(&self) -> Vec<TransportDescriptor> {
        let transports: Vec<Arc<dyn Transport>> =
            self.transports.read().values().cloned().collect();
        let mut out = Vec::with_capacity(transports.len());
        for transport in transports {
            out.push(TransportDescriptor {
                name: transport.name().to_string(),
                version: transport.version().to_string(),
                capabilities: transport.capabilities(),
                status: transport.status().await,
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    async fn publish_error(&self, transport: &str, error: &TransportError) {
        let event = RegistryEvent::TransportError {
            transport: transport.to_string(),
            code: error.code().to_string(),
            message: error.to_string(),
        };
        if self.events_tx.send(event).await.is_err() {
            tracing::debug!(target: "registry", event = "supervisor_gone", transport);
        }
    }

    /// Routes an outgoing transfer. Recipients are grouped by their
    /// `transport` field and each group is sent concurrently; a recipient
    /// naming an absent or uninitialized plugin fails alone with
    /// `TransportUnavailable`. The returned results align index-wise with
    /// `transfer.recipients`.
    pub async fn route(&self, transfer: OutgoingTransfer) -> TransferResult {
        let transfer_id = transfer.transfer_id.clone();
        let mut results: Vec<Option<RecipientResult>> = vec![None; transfer.recipients.len()];

        let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (index, recipient) in transfer.recipients.iter().enumerate() {
            groups
                .entry(recipient.transport.clone())
                .or_default()
                .push(index);
        }

        let mut sends = Vec::new();
        for (name, indices) in groups {
            match self.initialized_transport(&name) {
                Err(error) => {
                    for &index in &indices {
                        results[index] =
                            Some(RecipientResult::failed(&transfer.recipients[index], &error));
                    }
                    self.publish_error(&name, &error).await;
                }
                Ok(transport) => {
                    let sub_transfer = OutgoingTransfer {
                        transfer_id: transfer.transfer_id.clone(),
                        documents: transfer.documents.clone(),
                        recipients: indices
                            .iter()
                            .map(|&i| transfer.recipients[i].clone())
                            .collect(),
                        sender: transfer.sender.clone(),
                        options: transfer.options.clone(),
                    };
                    sends.push(async move {
                        let outcome = transport.send(sub_transfer).await;
                        (name, indices, outcome)
                    });
                }
            }
        }

        for (name, indices, outcome) in futures::future::join_all(sends).await {
            match outcome {
                Ok(result) => {
                    for (position, &index) in indices.iter().enumerate() {
                        results[index] = result.recipient_results.get(position).cloned();
                    }
                }
                Err(error) => {
                    // Transport-fatal: every recipient in this group fails
                    // with the same kind; siblings on other transports are
                    // untouched.
                    for &index in &indices {
                        results[index] =
                            Some(RecipientResult::failed(&transfer.recipients[index], &error));
                    }
                    self.publish_error(&name, &error).await;
                }
            }
        }

        let recipient_results = results
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    // A plugin returned fewer results than recipients; that
                    // is a contract violation reported per recipient.
                    RecipientResult::failed(
                        &transfer.recipients[index],
                        &TransportError::Internal("missing recipient result".into()),
                    )
                })
            })
            .collect();
        TransferResult::from_results(transfer_id, recipient_results)
    }

    /// Shuts the registry down. Graceful mode quiesces plugins in parallel
    /// with a 10s cap each; abrupt mode tells them to stop and clears
    /// references without waiting.
    pub async fn shutdown(&self, mode: ShutdownMode) {
        let live: Vec<(String, Arc<dyn Transport>)> = {
            let transports = self.transports.read();
            self.active
                .read()
                .iter()
                .filter_map(|name| transports.get(name).map(|t| (name.clone(), t.clone())))
                .collect()
        };

        match mode {
            ShutdownMode::Graceful => {
                let shutdowns = live.into_iter().map(|(name, transport)| {
                    let events_tx = self.events_tx.clone();
                    async move {
                        let quiesce = async {
                            transport.stop_receiving().await.ok();
                            transport.shutdown().await
                        };
                        match tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, quiesce).await {
                            Ok(Ok(())) => {
                                tracing::info!(target: "registry", event = "shutdown", transport = %name)
                            }
                            Ok(Err(e)) => {
                                tracing::warn!(target: "registry", event = "shutdown_error", transport = %name, error = %e)
                            }
                            Err(_) => {
                                tracing::warn!(target: "registry", event = "shutdown_timeout", transport = %name);
                                events_tx
                                    .send(RegistryEvent::ShutdownTimeout {
                                        transport: name.clone(),
                                    })
                                    .await
                                    .ok();
                            }
                        }
                    }
                });
                futures::future::join_all(shutdowns).await;
            }
            ShutdownMode::Abrupt => {
                for (name, transport) in live {
                    transport.stop_receiving().await.ok();
                    transport.shutdown().await.ok();
                    tracing::info!(target: "registry", event = "shutdown_abrupt", transport = %name);
                }
                self.transports.write().clear();
            }
        }
        self.active.write().clear();
    }
}
