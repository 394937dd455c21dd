//! Hash and crypto utilities for the Firma-Sign core.
//!
//! Content hashing and id derivation, the password envelope used for
//! at-rest protection of exported material, and the numeric transfer-code
//! generator.

pub mod code;
pub mod envelope;
pub mod hash;

pub use code::generate_transfer_code;
pub use envelope::{decrypt, encrypt, EncryptedEnvelope};
pub use hash::{combine_hashes, document_id, hash_bytes};
