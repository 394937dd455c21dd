//! Core types for the Firma-Sign transfer coordinator.
//!
//! This crate is the leaf of the workspace: entities and enumerations for
//! transfers, documents, and recipients, the error taxonomy shared across
//! component boundaries, and the configuration structures consumed at node
//! startup. It carries no I/O.

pub mod config;
pub mod error;
pub mod id;
pub mod peer;
pub mod transfer;

pub use config::{EngineConfig, NodeConfig, P2pConfig};
pub use error::{CryptoError, EngineError, ErrorCode, StoreError, TransportError};
pub use id::{is_valid_id, new_id};
pub use peer::PeerEntry;
pub use transfer::{
    BlobSlot, Document, DocumentStatus, Recipient, RecipientStatus, SenderInfo, Transfer,
    TransferBundle, TransferDirection, TransferMetadata, TransferStatus, VerificationStatus,
};
