//! Keyed async mutex: one writer per transfer id, unbounded readers.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// A map of lazily-created async mutexes, one per key. Guards are plain
/// `tokio::sync::OwnedMutexGuard`s, so they are held across awaits.
#[derive(Default)]
pub struct KeyedLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the writer lock for `key`, creating it on first use.
    pub async fn acquire(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock();
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drops lock entries with no outstanding holders. Called from purge
    /// paths to keep the map bounded by live transfers.
    pub fn release_idle(&self) {
        let mut map = self.inner.lock();
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}
