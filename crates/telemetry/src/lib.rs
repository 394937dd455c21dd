//! # Firma-Sign Telemetry
//!
//! Observability infrastructure for the Firma-Sign core: structured logging
//! initialization and the Unix-time helpers the persistence layer stamps
//! records with.

/// The initialization routine for global structured logging.
pub mod init;
/// Unix-epoch clock helpers (whole seconds for rows, milliseconds for wire).
pub mod clock;

pub use clock::{unix_millis, unix_secs};
pub use init::init_tracing;
