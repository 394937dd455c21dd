//! The process-wide peer directory.
//!
//! A cache of known remote nodes keyed by peer id, fed by discovery events,
//! incoming transfers, and manual adds. Entries expire on a sliding 24h TTL
//! since their last sighting. Never durable; never the source of truth.

use firma_telemetry::unix_millis;
use firma_types::PeerEntry;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Sliding TTL since `last_seen`.
const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub struct PeerDirectory {
    entries: RwLock<HashMap<String, PeerEntry>>,
    ttl_ms: i64,
}

impl Default for PeerDirectory {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl PeerDirectory {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl_ms: ttl.as_millis() as i64,
        }
    }

    /// Records a sighting from discovery or an incoming transfer.
    pub fn record_seen(&self, peer_id: &str, address: Option<String>) {
        let now = unix_millis();
        let mut entries = self.entries.write();
        entries
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerEntry::new(peer_id, now))
            .touch(address, now);
    }

    /// Merges the protocols a peer advertised (identify exchange).
    pub fn record_protocols(&self, peer_id: &str, protocols: Vec<String>) {
        let now = unix_millis();
        let mut entries = self.entries.write();
        let entry = entries
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerEntry::new(peer_id, now));
        for protocol in protocols {
            if !entry.protocols.contains(&protocol) {
                entry.protocols.push(protocol);
            }
        }
        entry.touch(None, now);
    }

    /// Marks a transport as known-good for the peer.
    pub fn record_transport(&self, peer_id: &str, transport: &str) {
        let now = unix_millis();
        let mut entries = self.entries.write();
        let entry = entries
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerEntry::new(peer_id, now));
        if !entry.transports_known.iter().any(|t| t == transport) {
            entry.transports_known.push(transport.to_string());
        }
        entry.touch(None, now);
    }

    /// Manual add with a full address.
    pub fn add_manual(&self, peer_id: &str, address: String) {
        self.record_seen(peer_id, Some(address));
    }

    pub fn get(&self, peer_id: &str) -> Option<PeerEntry> {
        let entries = self.entries.read();
        let entry = entries.get(peer_id)?;
        if self.expired(entry) {
            return None;
        }
        Some(entry.clone())
    }

    /// All live entries.
    pub fn snapshot(&self) -> Vec<PeerEntry> {
        let entries = self.entries.read();
        let mut out: Vec<PeerEntry> = entries
            .values()
            .filter(|e| !self.expired(e))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        out
    }

    fn expired(&self, entry: &PeerEntry) -> bool {
        unix_millis() - entry.last_seen > self.ttl_ms
    }

    /// Drops expired entries; returns how many were removed.
    pub fn prune_expired(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        let cutoff = unix_millis() - self.ttl_ms;
        entries.retain(|_, entry| entry.last_seen >= cutoff);
        before - entries.len()
    }

    /// Background sweeper; one per process.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        period: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let directory = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let removed = directory.prune_expired();
                        if removed > 0 {
                            tracing::debug!(target: "p2p", event = "directory_pruned", removed);
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
