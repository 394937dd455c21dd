//! Directory entry for a known remote node.

use serde::{Deserialize, Serialize};

/// A cached view of a remote peer. Entries are weak references rebuilt
/// opportunistically from discovery and incoming transfers; they are never
/// the source of truth for durable records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub peer_id: String,
    /// Multiaddrs the peer was last reachable at.
    pub addresses: Vec<String>,
    /// Protocols the peer advertised.
    pub protocols: Vec<String>,
    /// Unix milliseconds of the last sighting; drives the sliding TTL.
    pub last_seen: i64,
    /// Transport names the peer is known to accept.
    pub transports_known: Vec<String>,
}

impl PeerEntry {
    pub fn new(peer_id: impl Into<String>, last_seen: i64) -> Self {
        Self {
            peer_id: peer_id.into(),
            addresses: Vec::new(),
            protocols: Vec::new(),
            last_seen,
            transports_known: Vec::new(),
        }
    }

    /// Records a sighting, merging the address into the entry.
    pub fn touch(&mut self, address: Option<String>, now_ms: i64) {
        if let Some(addr) = address {
            if !self.addresses.contains(&addr) {
                self.addresses.push(addr);
            }
        }
        self.last_seen = self.last_seen.max(now_ms);
    }
}
