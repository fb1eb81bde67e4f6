use super::log::{ModificationIterator, ModificationLog};
use super::types::{
    ModificationEntry, PeerId, ReplicationError, ReplicationResult, ReplicationStats,
};
use crate::core::subscription::{EntrySubscriber, EventFilter, TopicSubscriber, ValueSubscriber};
use crate::core::{MapEvent, MapStore, SubscriptionCollection};
use crate::protocol::context::RequestContext;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Snapshot header written ahead of the serialized entries
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotHeader {
    entry_count: usize,
    created_at: i64,
    checksum: u32,
}

/// A replicated key/value and topic asset
///
/// Owns the visible store, the modification log with its per-peer
/// iterators, and the subscription collection. Local mutations and remote
/// entries go through the same apply path: the conflict rule decides, the
/// visible store changes, subscribers are notified, and every other peer's
/// iterator is offered the entry.
pub struct ReplicatedMap {
    name: String,
    local: PeerId,
    store: Arc<MapStore>,
    log: Arc<ModificationLog>,
    subscriptions: Arc<SubscriptionCollection>,

    /// Serializes conflict decision + store update; notification runs
    /// outside of it
    apply_lock: Mutex<()>,

    /// Strictly increasing local clock (ms), advanced past any observed
    /// remote timestamp
    last_timestamp: AtomicI64,

    stats: RwLock<ReplicationStats>,
}

impl ReplicatedMap {
    pub fn new(name: impl Into<String>, local: PeerId) -> Self {
        let name = name.into();
        info!("initializing replicated map {} on host {}", name, local);

        let store = Arc::new(MapStore::new());
        Self {
            name,
            local,
            subscriptions: Arc::new(SubscriptionCollection::new(store.clone())),
            store,
            log: Arc::new(ModificationLog::new()),
            apply_lock: Mutex::new(()),
            last_timestamp: AtomicI64::new(0),
            stats: RwLock::new(ReplicationStats::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_identifier(&self) -> PeerId {
        self.local
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionCollection> {
        &self.subscriptions
    }

    /// Put a value, stamping it with the local identifier and clock
    pub fn put(&self, key: &[u8], value: Bytes) -> ReplicationResult<()> {
        let entry = ModificationEntry::put(
            Bytes::copy_from_slice(key),
            value,
            self.next_timestamp(),
            self.local,
        );
        self.apply(&entry, true)?;
        Ok(())
    }

    /// Remove a key, recording a tombstone; returns the prior visible value
    pub fn remove(&self, key: &[u8]) -> ReplicationResult<Option<Bytes>> {
        let prior = self.store.get(key);
        let entry = ModificationEntry::tombstone(
            Bytes::copy_from_slice(key),
            self.next_timestamp(),
            self.local,
        );
        self.apply(&entry, true)?;
        Ok(prior)
    }

    /// Publish a message to the asset's topic subscribers
    ///
    /// Topic messages ride the map: the payload is stored under the topic
    /// name, so remote peers observe the publish through replication.
    pub fn publish(&self, topic: &str, payload: Bytes) -> ReplicationResult<()> {
        self.put(topic.as_bytes(), payload)
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.store.get(key)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Apply an entry received from a remote peer
    ///
    /// Accepts and overwrites iff the entry's `(timestamp, origin)` pair is
    /// strictly newer than the locally recorded one; otherwise the entry is
    /// discarded silently. Returns whether the entry was accepted.
    pub fn apply_replication(&self, entry: &ModificationEntry) -> ReplicationResult<bool> {
        self.apply(entry, false)
    }

    fn apply(&self, entry: &ModificationEntry, local: bool) -> ReplicationResult<bool> {
        if entry.key.is_empty() {
            return Err(ReplicationError::MalformedEntry(
                "entry without a key".to_string(),
            ));
        }
        let live_value = match (&entry.value, entry.is_deleted) {
            (Some(value), false) => Some(value.clone()),
            (None, true) => None,
            _ => {
                return Err(ReplicationError::MalformedEntry(
                    "value and tombstone flag disagree".to_string(),
                ));
            }
        };

        self.observe_timestamp(entry.timestamp);

        let event = {
            let _guard = self.apply_lock.lock();

            if let Some((timestamp, origin)) = self.log.version_of(&entry.key) {
                if !entry.supersedes(timestamp, origin) {
                    self.stats.write().entries_discarded += 1;
                    debug!(
                        "discarded entry for map {} (ts {} origin {} vs local ts {} origin {})",
                        self.name, entry.timestamp, entry.origin, timestamp, origin
                    );
                    return Ok(false);
                }
            }

            self.log.record(entry);

            match live_value {
                None => self
                    .store
                    .remove(&entry.key)
                    .map(|old_value| MapEvent::Removed {
                        key: entry.key.clone(),
                        old_value,
                    }),
                Some(value) => Some(match self.store.insert(&entry.key, value.clone()) {
                    None => MapEvent::Inserted {
                        key: entry.key.clone(),
                        value,
                    },
                    Some(old_value) => MapEvent::Updated {
                        key: entry.key.clone(),
                        old_value,
                        value,
                    },
                }),
            }
        };

        {
            let mut stats = self.stats.write();
            stats.entries_applied += 1;
            if local {
                stats.entries_local += 1;
            }
            stats.tombstones = self.log.tombstone_count() as u64;
        }

        // Notification runs outside every replication lock; an invalid
        // subscriber never rolls the mutation back.
        if let Some(event) = event {
            self.subscriptions.notify_event(&event);
            if let Some(value) = event.value() {
                if let Ok(topic) = std::str::from_utf8(event.key()) {
                    self.subscriptions.notify_topic(topic, value);
                }
            }
        }

        Ok(true)
    }

    /// Create-if-absent the modification iterator for a peer
    ///
    /// Safe to call concurrently for different peers; iterators never block
    /// each other.
    pub fn acquire_modification_iterator(&self, peer: PeerId) -> ModificationIterator {
        ModificationIterator::new(self.log.clone(), peer)
    }

    /// Bulk-drain convenience over a peer's iterator
    pub fn for_each_pending(&self, peer: PeerId, apply: impl FnMut(&ModificationEntry)) {
        self.acquire_modification_iterator(peer).for_each(apply);
    }

    /// Serialize the full entry table (tombstones included) with a crc32
    /// checksum, for bootstrap transfer
    pub fn snapshot(&self) -> ReplicationResult<Vec<u8>> {
        let entries = self.log.all_entries();
        let data = bincode::serialize(&entries)?;
        let header = SnapshotHeader {
            entry_count: entries.len(),
            created_at: self.now_ms(),
            checksum: crc32fast::hash(&data),
        };

        info!(
            "created snapshot of map {}: {} entries, {} bytes",
            self.name,
            entries.len(),
            data.len()
        );

        let mut out = bincode::serialize(&header)?;
        out.extend_from_slice(&data);
        Ok(out)
    }

    /// Verify and apply a snapshot; idempotent under the conflict rule
    pub fn apply_snapshot(&self, snapshot: &[u8]) -> ReplicationResult<usize> {
        let header: SnapshotHeader = bincode::deserialize(snapshot)?;
        let header_size = bincode::serialized_size(&header)? as usize;
        let data = &snapshot[header_size..];

        let checksum = crc32fast::hash(data);
        if checksum != header.checksum {
            return Err(ReplicationError::ChecksumMismatch {
                expected: header.checksum,
                actual: checksum,
            });
        }

        let entries: Vec<ModificationEntry> = bincode::deserialize(data)?;
        let mut applied = 0;
        for entry in &entries {
            match self.apply_replication(entry) {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(e) => warn!("skipping malformed snapshot entry: {}", e),
            }
        }

        info!(
            "applied snapshot to map {}: {}/{} entries accepted",
            self.name, applied, header.entry_count
        );
        Ok(applied)
    }

    // Subscription conveniences, delegating to the collection.

    pub fn register_key_subscriber(
        &self,
        context: &RequestContext,
        key: &[u8],
        subscriber: Arc<dyn ValueSubscriber>,
    ) {
        self.subscriptions
            .register_key_subscriber(context, key, subscriber);
    }

    pub fn register_reference_subscriber(
        &self,
        context: &RequestContext,
        key: &[u8],
        subscriber: Arc<dyn ValueSubscriber>,
    ) {
        self.subscriptions
            .register_reference_subscriber(context, key, subscriber);
    }

    pub fn register_entry_subscriber(
        &self,
        context: &RequestContext,
        subscriber: Arc<dyn EntrySubscriber>,
        filter: Option<EventFilter>,
    ) {
        self.subscriptions
            .register_entry_subscriber(context, subscriber, filter);
    }

    pub fn register_topic_subscriber(&self, subscriber: Arc<dyn TopicSubscriber>) {
        self.subscriptions.register_topic_subscriber(subscriber);
    }

    pub fn stats(&self) -> ReplicationStats {
        self.stats.read().clone()
    }

    fn next_timestamp(&self) -> i64 {
        let now = self.now_ms();
        loop {
            let last = self.last_timestamp.load(Ordering::SeqCst);
            let next = now.max(last + 1);
            if self
                .last_timestamp
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return next;
            }
        }
    }

    fn observe_timestamp(&self, timestamp: i64) {
        self.last_timestamp.fetch_max(timestamp, Ordering::SeqCst);
    }

    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(raw: u8) -> PeerId {
        PeerId::new(raw).unwrap()
    }

    fn entry(key: &'static [u8], value: &'static [u8], ts: i64, origin: u8) -> ModificationEntry {
        ModificationEntry::put(
            Bytes::from_static(key),
            Bytes::from_static(value),
            ts,
            peer(origin),
        )
    }

    #[test]
    fn test_put_and_get() {
        let map = ReplicatedMap::new("/maps/test", peer(1));

        map.put(b"hello", Bytes::from_static(b"world")).unwrap();
        assert_eq!(map.get(b"hello"), Some(Bytes::from_static(b"world")));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_conflict_resolution_is_order_independent() {
        let older = entry(b"hello", b"world1", 100, 2);
        let newer = entry(b"hello", b"world2", 100, 3);

        for entries in [[&older, &newer], [&newer, &older]] {
            let map = ReplicatedMap::new("/maps/test", peer(1));
            for e in entries {
                map.apply_replication(e).unwrap();
            }
            assert_eq!(map.get(b"hello"), Some(Bytes::from_static(b"world2")));
        }
    }

    #[test]
    fn test_stale_entry_discarded_silently() {
        let map = ReplicatedMap::new("/maps/test", peer(1));

        assert!(map.apply_replication(&entry(b"k", b"new", 200, 2)).unwrap());
        assert!(!map.apply_replication(&entry(b"k", b"old", 100, 3)).unwrap());

        assert_eq!(map.get(b"k"), Some(Bytes::from_static(b"new")));
        assert_eq!(map.stats().entries_discarded, 1);
    }

    #[test]
    fn test_tombstone_removes_but_stays_recorded() {
        let map = ReplicatedMap::new("/maps/test", peer(1));

        map.apply_replication(&entry(b"k", b"v", 100, 2)).unwrap();
        map.apply_replication(&ModificationEntry::tombstone(
            Bytes::from_static(b"k"),
            200,
            peer(2),
        ))
        .unwrap();

        assert_eq!(map.get(b"k"), None);
        // A late put older than the tombstone still loses
        assert!(!map.apply_replication(&entry(b"k", b"late", 150, 3)).unwrap());
        assert_eq!(map.get(b"k"), None);
    }

    #[test]
    fn test_malformed_entry_rejected_without_poisoning() {
        let map = ReplicatedMap::new("/maps/test", peer(1));

        let malformed = ModificationEntry::put(Bytes::new(), Bytes::from_static(b"v"), 100, peer(2));
        assert!(map.apply_replication(&malformed).is_err());

        // Later entries still apply
        assert!(map.apply_replication(&entry(b"k", b"v", 100, 2)).unwrap());
    }

    #[test]
    fn test_remote_entry_offered_to_other_peers_not_origin() {
        let map = ReplicatedMap::new("/maps/test", peer(1));
        let origin_iter = map.acquire_modification_iterator(peer(2));
        let other_iter = map.acquire_modification_iterator(peer(3));

        map.apply_replication(&entry(b"k", b"v", 100, 2)).unwrap();

        assert!(!origin_iter.has_next());
        assert!(other_iter.has_next());
    }

    #[test]
    fn test_local_timestamps_are_strictly_increasing() {
        let map = ReplicatedMap::new("/maps/test", peer(1));
        let iter = map.acquire_modification_iterator(peer(2));

        map.put(b"a", Bytes::from_static(b"1")).unwrap();
        map.put(b"b", Bytes::from_static(b"2")).unwrap();

        let mut timestamps = Vec::new();
        iter.for_each(|e| timestamps.push(e.timestamp));
        assert_eq!(timestamps.len(), 2);
        assert!(timestamps[0] < timestamps[1]);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let source = ReplicatedMap::new("/maps/test", peer(1));
        source.put(b"a", Bytes::from_static(b"1")).unwrap();
        source.put(b"b", Bytes::from_static(b"2")).unwrap();
        source.remove(b"a").unwrap();

        let snapshot = source.snapshot().unwrap();

        let target = ReplicatedMap::new("/maps/test", peer(2));
        let applied = target.apply_snapshot(&snapshot).unwrap();

        assert_eq!(applied, 2); // one live entry + one tombstone
        assert_eq!(target.get(b"b"), Some(Bytes::from_static(b"2")));
        assert_eq!(target.get(b"a"), None);
    }

    #[test]
    fn test_snapshot_checksum_verification() {
        let source = ReplicatedMap::new("/maps/test", peer(1));
        source.put(b"a", Bytes::from_static(b"1")).unwrap();

        let mut snapshot = source.snapshot().unwrap();
        if let Some(last) = snapshot.last_mut() {
            *last = !*last;
        }

        let target = ReplicatedMap::new("/maps/test", peer(2));
        assert!(matches!(
            target.apply_snapshot(&snapshot),
            Err(ReplicationError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_remove_returns_prior_value() {
        let map = ReplicatedMap::new("/maps/test", peer(1));

        map.put(b"k", Bytes::from_static(b"v")).unwrap();
        assert_eq!(map.remove(b"k").unwrap(), Some(Bytes::from_static(b"v")));
        assert_eq!(map.remove(b"k").unwrap(), None);
    }
}
