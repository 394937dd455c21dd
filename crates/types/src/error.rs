//! Error taxonomy shared across component boundaries.
//!
//! Component boundaries translate underlying faults into these enums;
//! internal detail travels in the message, the variant is the kind. Every
//! enum implements [`ErrorCode`], whose stable token is what wire acks and
//! per-recipient results carry verbatim.

use crate::transfer::TransferStatus;
use thiserror::Error;

/// A trait for assigning a stable, machine-readable code to an error.
pub trait ErrorCode {
    /// Returns the stable taxonomy token for this error variant.
    fn code(&self) -> &'static str;
}

/// Errors from the blob store, the relational store, and the coordinator.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The entity or path does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// A path escaped the configured base directory, or the caller is not
    /// allowed to touch the target.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The payload exceeds the configured size cap.
    #[error("file too large: {size} bytes exceeds cap of {max}")]
    FileTooLarge { size: u64, max: u64 },
    /// The blob store's byte quota is exhausted.
    #[error("quota exceeded: {used} of {quota} bytes in use")]
    QuotaExceeded { used: u64, quota: u64 },
    /// The record already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Recomputed content hash does not match the recorded one.
    #[error("hash mismatch: expected {expected}, got {got}")]
    HashMismatch { expected: String, got: String },
    /// `with_transaction` was re-entered from inside an open transaction.
    #[error("nested transactions are not supported")]
    NestedTransaction,
    /// A persisted row failed to decode into its entity.
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    /// Underlying I/O or database failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl ErrorCode for StoreError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::PermissionDenied(_) => "PermissionDenied",
            Self::FileTooLarge { .. } => "FileTooLarge",
            Self::QuotaExceeded { .. } => "QuotaExceeded",
            Self::AlreadyExists(_) => "AlreadyExists",
            Self::HashMismatch { .. } => "HashMismatch",
            Self::NestedTransaction => "NestedTransaction",
            Self::InvalidRecord(_) | Self::Backend(_) => "OperationFailed",
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::NotFound(e.to_string()),
            std::io::ErrorKind::PermissionDenied => StoreError::PermissionDenied(e.to_string()),
            _ => StoreError::Backend(e.to_string()),
        }
    }
}

/// Errors from transport plugins and the registry.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The plugin was asked to work before `initialize` completed.
    #[error("transport '{0}' is not initialized")]
    NotInitialized(String),
    /// The supplied configuration failed the plugin's validator.
    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),
    /// The named transport is absent or uninitialized.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    /// No acknowledgement arrived within the send deadline.
    #[error("send timed out")]
    SendTimeout,
    /// The operation was cancelled by the caller.
    #[error("cancelled")]
    Cancelled,
    /// The payload exceeds the transport's capability cap.
    #[error("file too large: {size} bytes exceeds transport cap of {max}")]
    FileTooLarge { size: u64, max: u64 },
    /// The remote acknowledged the frame negatively.
    #[error("rejected by remote: {0}")]
    Rejected(String),
    /// A network-class failure (dial, stream, connection reset). Retryable
    /// when the transport supports resume.
    #[error("network error: {0}")]
    Network(String),
    /// Internal transport failure.
    #[error("transport internal error: {0}")]
    Internal(String),
}

impl ErrorCode for TransportError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotInitialized(_) => "NotInitialized",
            Self::InvalidConfig(_) => "InvalidConfig",
            Self::Unavailable(_) => "TransportUnavailable",
            Self::SendTimeout => "SendTimeout",
            Self::Cancelled => "Cancelled",
            Self::FileTooLarge { .. } => "FileTooLarge",
            Self::Rejected(_) | Self::Network(_) | Self::Internal(_) => "OperationFailed",
        }
    }
}

impl TransportError {
    /// Whether the send path may retry this failure (gated additionally on
    /// the transport's `supports_resume` capability).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SendTimeout | Self::Unavailable(_) | Self::Network(_)
        )
    }
}

/// Errors from the hash and envelope utilities.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The authentication tag did not verify.
    #[error("authentication failed")]
    AuthFailed,
    /// Malformed input (key material, envelope fields, digit count).
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Underlying primitive failure.
    #[error("crypto operation failed: {0}")]
    OperationFailed(String),
}

impl ErrorCode for CryptoError {
    fn code(&self) -> &'static str {
        match self {
            Self::AuthFailed => "AuthFailed",
            Self::InvalidInput(_) | Self::OperationFailed(_) => "OperationFailed",
        }
    }
}

/// Errors from the transfer state engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The transfer, document, or recipient does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// A concurrent signer won the race for this document.
    #[error("document {document_id} already signed by {signed_by}")]
    AlreadySigned {
        document_id: String,
        signed_by: String,
    },
    /// The transfer deadline passed.
    #[error("transfer deadline expired")]
    Expired,
    /// The requested state change is not admitted by the state machine.
    #[error("invalid transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: TransferStatus,
        to: TransferStatus,
    },
    /// The operation was cancelled.
    #[error("cancelled")]
    Cancelled,
    /// A store fault, carried through unchanged.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A transport fault, carried through unchanged.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A crypto fault, carried through unchanged.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// Internal engine failure.
    #[error("engine internal error: {0}")]
    Internal(String),
}

impl ErrorCode for EngineError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::AlreadySigned { .. } => "AlreadySigned",
            Self::Expired => "Expired",
            Self::InvalidTransition { .. } => "OperationFailed",
            Self::Cancelled => "Cancelled",
            Self::Store(e) => e.code(),
            Self::Transport(e) => e.code(),
            Self::Crypto(e) => e.code(),
            Self::Internal(_) => "OperationFailed",
        }
    }
}
