//! The uniform transport contract.
//!
//! Every delivery mechanism — direct peer, store-and-forward mailbox,
//! chat-bot delivery, web-link pickup — implements [`Transport`] and
//! participates in the same pipeline. Per-recipient failures are values in
//! the [`TransferResult`]; only transport-fatal conditions surface as a
//! `TransportError`.

use async_trait::async_trait;
use firma_types::{ErrorCode, SenderInfo, TransportError};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Immutable descriptor of what a transport supports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Largest single document, bytes.
    pub max_file_size: u64,
    /// Multiple documents per envelope.
    pub supports_batch: bool,
    /// Transport-level payload encryption.
    pub supports_encryption: bool,
    /// Delivery/view receipts back to the sender.
    pub supports_notifications: bool,
    /// Safe to retry a failed send.
    pub supports_resume: bool,
    /// Config keys that must be present for `initialize` to succeed.
    pub required_config: Vec<String>,
}

/// A transport's live state, for introspection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStatus {
    pub initialized: bool,
    pub receiving: bool,
    pub active_transfers: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// One document of an outgoing transfer, bytes already loaded from the
/// store.
#[derive(Debug, Clone)]
pub struct OutgoingDocument {
    pub id: String,
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
    /// SHA-256 hex of `bytes`; the receiver re-verifies.
    pub hash: String,
}

/// One addressee of an outgoing transfer.
#[derive(Debug, Clone)]
pub struct OutgoingRecipient {
    pub id: String,
    /// Address meaningful to the carrying transport.
    pub identifier: String,
    /// Name of the transport that should carry this recipient's copy.
    pub transport: String,
    pub preferences: Option<serde_json::Value>,
}

/// The unit handed to [`Transport::send`].
#[derive(Debug, Clone)]
pub struct OutgoingTransfer {
    pub transfer_id: String,
    pub documents: Vec<OutgoingDocument>,
    pub recipients: Vec<OutgoingRecipient>,
    pub sender: SenderInfo,
    pub options: Option<serde_json::Value>,
}

/// Per-recipient outcome. `error`, when set, is a stable taxonomy token
/// (`"FileTooLarge"`, `"TransportUnavailable"`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientResult {
    pub recipient_id: String,
    pub identifier: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Human-readable detail accompanying `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Whether the failure class admits a retry (paired with the
    /// transport's `supports_resume` capability by the engine).
    #[serde(default)]
    pub retryable: bool,
}

impl RecipientResult {
    pub fn ok(recipient: &OutgoingRecipient) -> Self {
        Self {
            recipient_id: recipient.id.clone(),
            identifier: recipient.identifier.clone(),
            success: true,
            error: None,
            detail: None,
            retryable: false,
        }
    }

    pub fn failed(recipient: &OutgoingRecipient, error: &TransportError) -> Self {
        Self {
            recipient_id: recipient.id.clone(),
            identifier: recipient.identifier.clone(),
            success: false,
            error: Some(error.code().to_string()),
            detail: Some(error.to_string()),
            retryable: error.is_retryable(),
        }
    }
}

/// Result of one `send`: resolved only after every per-recipient attempt
/// has terminated. `recipient_results` is index-aligned with
/// `OutgoingTransfer::recipients`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer_id: String,
    /// True when any recipient succeeded.
    pub success: bool,
    pub recipient_results: Vec<RecipientResult>,
}

impl TransferResult {
    pub fn from_results(transfer_id: String, recipient_results: Vec<RecipientResult>) -> Self {
        let success = recipient_results.iter().any(|r| r.success);
        Self {
            transfer_id,
            success,
            recipient_results,
        }
    }
}

/// One document of an incoming envelope, bytes decoded and hash-verified by
/// the transport before it reaches the engine.
#[derive(Debug, Clone)]
pub struct IncomingDocument {
    pub id: String,
    pub file_name: String,
    pub mime_type: String,
    pub size: u64,
    pub bytes: Vec<u8>,
    pub hash: String,
    pub metadata: Option<serde_json::Value>,
}

/// A transfer received from a remote party, published by the transport into
/// the registry's channel and drained by the engine's worker pool.
#[derive(Debug, Clone)]
pub struct IncomingEnvelope {
    /// Name of the transport that received it.
    pub transport: String,
    pub transfer_id: String,
    pub documents: Vec<IncomingDocument>,
    pub sender: SenderInfo,
    pub options: Option<serde_json::Value>,
}

/// The transport plugin contract.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable plugin name; recipients select their transport by it.
    fn name(&self) -> &'static str;

    fn version(&self) -> &'static str;

    /// Immutable capability descriptor.
    fn capabilities(&self) -> Capabilities;

    /// Checks a raw config map without side effects.
    fn validate_config(&self, raw: &serde_json::Value) -> bool;

    /// Brings the transport up with its configuration table.
    async fn initialize(&self, config: &serde_json::Value) -> Result<(), TransportError>;

    /// Quiesces the transport. Idempotent.
    async fn shutdown(&self) -> Result<(), TransportError>;

    async fn status(&self) -> TransportStatus;

    /// Delivers to every recipient; never errors for partial failure. The
    /// returned results align index-wise with `transfer.recipients`.
    async fn send(&self, transfer: OutgoingTransfer) -> Result<TransferResult, TransportError>;

    /// Starts publishing received transfers into `sink`. Replaces any
    /// previous sink.
    async fn start_receiving(
        &self,
        sink: mpsc::Sender<IncomingEnvelope>,
    ) -> Result<(), TransportError>;

    /// Stops publishing received transfers.
    async fn stop_receiving(&self) -> Result<(), TransportError>;
}
