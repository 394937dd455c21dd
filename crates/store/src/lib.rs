#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::unimplemented,
        clippy::todo
    )
)]

//! Durable storage for the Firma-Sign core.
//!
//! Three layers: a content-hashing filesystem [`blob::BlobStore`], a SQLite
//! [`sql::Database`] holding the transfer/document/recipient records, and the
//! [`coordinator::StoreCoordinator`] that couples the two into one logical
//! commit and owns every write after creation.

pub mod blob;
pub mod coordinator;
pub mod keyed_lock;
pub mod sql;

pub use blob::{BlobEntry, BlobMeta, BlobStore, BlobUsage, SavedBlob};
pub use coordinator::{NewDocument, NewRecipient, NewTransferRequest, StoreCoordinator};
pub use sql::Database;
