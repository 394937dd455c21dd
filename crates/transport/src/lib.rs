//! Transport plugin runtime for the Firma-Sign core.
//!
//! [`contract`] defines the uniform interface every delivery mechanism
//! implements; [`registry`] discovers none of them at runtime — plugins are
//! registered at startup by the node and selected by configuration — but
//! owns their lifecycle, routes outgoing transfers, and fans incoming
//! envelopes into one channel.

pub mod contract;
pub mod registry;

pub use contract::{
    Capabilities, IncomingDocument, IncomingEnvelope, OutgoingDocument, OutgoingRecipient,
    OutgoingTransfer, RecipientResult, Transport, TransportStatus, TransferResult,
};
pub use registry::{RegistryEvent, ShutdownMode, TransportDescriptor, TransportRegistry};
