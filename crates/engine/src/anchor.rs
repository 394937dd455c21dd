//! External hash-anchoring collaborator.
//!
//! Anchoring document hashes into an append-only external record (a ledger,
//! a transparency log) is consumed through this trait and implemented by a
//! separate subsystem. The in-process default anchors nothing.

use async_trait::async_trait;
use firma_types::EngineError;

/// Which artifact a receipt covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorKind {
    Original,
    Signed,
}

#[async_trait]
pub trait HashAnchor: Send + Sync {
    /// Anchors `hash` for `transfer_id`; returns the external transaction id
    /// when one was produced.
    async fn anchor(
        &self,
        transfer_id: &str,
        hash: &str,
        kind: AnchorKind,
    ) -> Result<Option<String>, EngineError>;
}

/// The default collaborator: records nothing.
pub struct NoopAnchor;

#[async_trait]
impl HashAnchor for NoopAnchor {
    async fn anchor(
        &self,
        _transfer_id: &str,
        _hash: &str,
        _kind: AnchorKind,
    ) -> Result<Option<String>, EngineError> {
        Ok(None)
    }
}
