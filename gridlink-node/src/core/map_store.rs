use super::types::MapStoreStats;
use bytes::Bytes;
use parking_lot::RwLock;
use radix_trie::{Trie, TrieCommon};
use std::sync::Arc;
use tracing::debug;

/// Visible single-host store using a radix trie keyed by raw bytes
///
/// This is the state a reader observes; replication bookkeeping (timestamps,
/// origins, tombstones) lives in the modification log, not here.
#[derive(Clone)]
pub struct MapStore {
    data: Arc<RwLock<Trie<Vec<u8>, Bytes>>>,
    stats: Arc<RwLock<MapStoreStats>>,
}

impl MapStore {
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(Trie::new())),
            stats: Arc::new(RwLock::new(MapStoreStats::default())),
        }
    }

    /// Insert a value, returning the prior value if the key existed
    pub fn insert(&self, key: &[u8], value: Bytes) -> Option<Bytes> {
        let prior = self.data.write().insert(key.to_vec(), value);

        let mut stats = self.stats.write();
        if prior.is_none() {
            stats.inserts += 1;
            stats.total_keys += 1;
        } else {
            stats.updates += 1;
        }

        prior
    }

    /// Get a value by key
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.stats.write().gets += 1;
        self.data.read().get(&key.to_vec()).cloned()
    }

    /// Remove a key, returning the prior value if present
    pub fn remove(&self, key: &[u8]) -> Option<Bytes> {
        let prior = self.data.write().remove(&key.to_vec());

        if prior.is_some() {
            let mut stats = self.stats.write();
            stats.removes += 1;
            stats.total_keys = stats.total_keys.saturating_sub(1);
            debug!("removed key ({} bytes)", key.len());
        }

        prior
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.data.read().get(&key.to_vec()).is_some()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Snapshot of all visible entries, used for bootstrap delivery
    pub fn entries(&self) -> Vec<(Vec<u8>, Bytes)> {
        self.data
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn stats(&self) -> MapStoreStats {
        self.stats.read().clone()
    }
}

impl Default for MapStore {
    fn default() -> Self {
        Self::new()
    }
}
