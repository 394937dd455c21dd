//! Entities and enumerations for the transfer data model.
//!
//! Relational rows persist timestamps as whole seconds since the Unix epoch;
//! wire frames and blob sidecars carry milliseconds. Fields holding one or
//! the other are suffixed accordingly in their doc comments.

use serde::{Deserialize, Serialize};

/// Whether a transfer originates at this node or arrived from a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Outgoing,
    Incoming,
}

impl TransferDirection {
    /// The path segment used in the blob layout (`transfers/{segment}/...`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Outgoing => "outgoing",
            Self::Incoming => "incoming",
        }
    }
}

/// Lifecycle states of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferStatus {
    Pending,
    Sending,
    Sent,
    Delivered,
    Opened,
    Signing,
    PartiallySigned,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine admits a transition from `self` to `next`.
    ///
    /// `Failed` is reachable from every non-terminal state (send errors and
    /// deadline expiry), `Cancelled` only from `Pending` and `Sending`.
    pub fn can_transition_to(&self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        matches!(
            (*self, next),
            (Pending, Sending)
                | (Pending, Cancelled)
                | (Sending, Sent)
                | (Sending, Cancelled)
                | (Sent, Delivered)
                | (Sent, Opened)
                | (Sent, Signing)
                | (Sent, PartiallySigned)
                | (Sent, Completed)
                | (Delivered, Opened)
                | (Delivered, Signing)
                | (Delivered, PartiallySigned)
                | (Delivered, Completed)
                | (Opened, Signing)
                | (Opened, PartiallySigned)
                | (Opened, Completed)
                | (Signing, PartiallySigned)
                | (Signing, Completed)
                | (PartiallySigned, Completed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Opened => "opened",
            Self::Signing => "signing",
            Self::PartiallySigned => "partially-signed",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "sending" => Self::Sending,
            "sent" => Self::Sent,
            "delivered" => Self::Delivered,
            "opened" => Self::Opened,
            "signing" => Self::Signing,
            "partially-signed" => Self::PartiallySigned,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }
}

/// Lifecycle states of a document within a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Signed,
    Rejected,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Signed => "signed",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "signed" => Self::Signed,
            "rejected" => Self::Rejected,
            _ => return None,
        })
    }
}

/// Progress ladder of a single recipient: `pending → notified → viewed →
/// signed | rejected`. Timestamps on the recipient row are monotone with
/// this ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientStatus {
    Pending,
    Notified,
    Viewed,
    Signed,
    Rejected,
}

impl RecipientStatus {
    /// Position on the ladder; `Signed` and `Rejected` share the top rung.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Notified => 1,
            Self::Viewed => 2,
            Self::Signed | Self::Rejected => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Notified => "notified",
            Self::Viewed => "viewed",
            Self::Signed => "signed",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "notified" => Self::Notified,
            "viewed" => Self::Viewed,
            "signed" => Self::Signed,
            "rejected" => Self::Rejected,
            _ => return None,
        })
    }
}

/// Outcome of verifying a remote sender's identity material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Verified,
    Unverified,
    Failed,
}

/// The blob slot a document's bytes live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobSlot {
    Original,
    Signed,
}

impl BlobSlot {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Original => "original",
            Self::Signed => "signed",
        }
    }
}

/// Caller-supplied options governing a transfer's completion rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferMetadata {
    /// Deadline in Unix milliseconds; past it a non-terminal transfer fails
    /// with reason `Expired`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<i64>,
    /// Free-form message shown to recipients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When true (the default), completion requires every recipient to sign.
    #[serde(default = "default_require_all")]
    pub require_all_signatures: bool,
    /// Overrides `require_all_signatures` with an absolute count when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_signature_count: Option<u32>,
    /// Marks the automatic return leg carrying signed documents back to the
    /// original sender.
    #[serde(default, skip_serializing_if = "is_false")]
    pub return_transport: bool,
    /// For a return leg, the id of the inbound transfer it answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_transfer_id: Option<String>,
    /// Numeric pickup code handed to out-of-band recipients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_code: Option<String>,
}

fn default_require_all() -> bool {
    true
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl Default for TransferMetadata {
    fn default() -> Self {
        Self {
            deadline: None,
            message: None,
            require_all_signatures: true,
            required_signature_count: None,
            return_transport: false,
            original_transfer_id: None,
            transfer_code: None,
        }
    }
}

/// Identity of the remote originator, embedded on incoming transfers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderInfo {
    pub sender_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    pub transport: String,
    /// Unix milliseconds at which the sender assembled the transfer.
    pub timestamp: i64,
    pub verification: VerificationStatus,
}

/// A single send action from one sender to one or more recipients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: String,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    /// Name of the transport plugin carrying this transfer.
    pub transport_name: String,
    /// Opaque per-transfer transport configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_config: Option<serde_json::Value>,
    /// Present on incoming transfers only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<SenderInfo>,
    pub metadata: TransferMetadata,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds; strictly increases on every state change.
    pub updated_at: i64,
}

/// A document carried by a transfer. The bytes live in the blob store at the
/// canonical path for `(transfer_id, slot, file_name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub transfer_id: String,
    pub file_name: String,
    pub size: u64,
    /// SHA-256 of the original bytes, lowercase hex.
    pub content_hash: String,
    pub status: DocumentStatus,
    /// Unix seconds; set exactly once, together with `signed_by`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_by: Option<String>,
    /// Anchor receipt for the original bytes, when an anchor backend is wired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_anchor: Option<String>,
    /// Anchor receipt for the signed bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_anchor: Option<String>,
    /// Unix seconds.
    pub created_at: i64,
}

/// A target of a transfer, addressed by a transport-specific identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    pub transfer_id: String,
    /// Address meaningful to the chosen transport (peer id, mailbox, ...).
    pub identifier: String,
    pub transport: String,
    pub status: RecipientStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferences: Option<serde_json::Value>,
    /// Unix seconds, monotone with the status ladder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notified_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_at: Option<i64>,
    /// Unix seconds.
    pub created_at: i64,
}

/// A transfer together with its documents and recipients, as returned to the
/// facade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferBundle {
    pub transfer: Transfer,
    pub documents: Vec<Document>,
    pub recipients: Vec<Recipient>,
}
