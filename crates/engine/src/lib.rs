//! The transfer state engine.
//!
//! One state machine per transfer, driven through the store coordinator and
//! the transport registry: outgoing sends with bounded retry, incoming
//! ingestion through a worker pool, signature submission with the
//! return-transfer guarantee, a single deadline sweeper, and the
//! subscription bus observers watch it all through.

pub mod anchor;
mod deadline;
pub mod engine;
pub mod events;
mod incoming;

pub use anchor::{AnchorKind, HashAnchor, NoopAnchor};
pub use engine::{CreateTransfer, DocumentInput, RecipientInput, SignatureInput, TransferEngine};
pub use events::{BusItem, EventKind, SubscriptionBus, Subscription, TransferEvent};
