use super::types::{ModificationEntry, PeerId};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Latest recorded mutation per key, tombstones included
#[derive(Debug, Clone)]
struct EntryRecord {
    value: Option<Bytes>,
    timestamp: i64,
    origin: PeerId,
    is_deleted: bool,
    bootstrap_timestamp: i64,
}

/// Pending work for one peer's iterator
#[derive(Default)]
struct PeerCursor {
    pending: VecDeque<Vec<u8>>,
    queued: HashSet<Vec<u8>>,
}

impl PeerCursor {
    fn enqueue(&mut self, key: &[u8]) {
        if self.queued.insert(key.to_vec()) {
            self.pending.push_back(key.to_vec());
        }
    }
}

/// Modification Log - per-store record of mutations with per-peer cursors
///
/// The log keeps the newest record for every key (a tombstone for a
/// deletion) so that late or duplicate entries can still be compared, and
/// an arena of cursors indexed by the 0..=127 peer identifier. Cursors for
/// different peers never block each other; a key is queued at most once per
/// cursor position, and a bootstrap replay via `dirty_entries` simply
/// re-queues it.
pub struct ModificationLog {
    records: RwLock<HashMap<Vec<u8>, EntryRecord>>,
    cursors: Box<[Mutex<Option<PeerCursor>>]>,
    active_peers: RwLock<Vec<PeerId>>,
}

impl ModificationLog {
    pub fn new() -> Self {
        let cursors: Box<[Mutex<Option<PeerCursor>>]> = (0..=PeerId::MAX as usize)
            .map(|_| Mutex::new(None))
            .collect();

        Self {
            records: RwLock::new(HashMap::new()),
            cursors,
            active_peers: RwLock::new(Vec::new()),
        }
    }

    /// Record an accepted entry and offer it to every other peer's cursor
    ///
    /// The entry is never offered back to its own origin.
    pub fn record(&self, entry: &ModificationEntry) {
        {
            let mut records = self.records.write();
            records.insert(
                entry.key.to_vec(),
                EntryRecord {
                    value: entry.value.clone(),
                    timestamp: entry.timestamp,
                    origin: entry.origin,
                    is_deleted: entry.is_deleted,
                    bootstrap_timestamp: entry.bootstrap_timestamp,
                },
            );
        }

        let peers: Vec<PeerId> = self.active_peers.read().clone();
        for peer in peers {
            if peer == entry.origin {
                continue;
            }
            let mut slot = self.cursors[peer.index()].lock();
            if let Some(cursor) = slot.as_mut() {
                cursor.enqueue(&entry.key);
            }
        }
    }

    /// Newest recorded version of a key, if any
    pub fn version_of(&self, key: &[u8]) -> Option<(i64, PeerId)> {
        self.records
            .read()
            .get(key)
            .map(|r| (r.timestamp, r.origin))
    }

    /// Create the cursor for a peer if it does not exist yet
    ///
    /// A fresh cursor owes the peer the full retained history; the
    /// receiving side's conflict rule absorbs anything it already holds.
    pub fn ensure_cursor(&self, peer: PeerId) {
        let mut slot = self.cursors[peer.index()].lock();
        if slot.is_none() {
            let mut cursor = PeerCursor::default();
            let mut keys: Vec<(i64, Vec<u8>)> = self
                .records
                .read()
                .iter()
                .filter(|(_, r)| r.origin != peer)
                .map(|(k, r)| (r.timestamp, k.clone()))
                .collect();
            keys.sort();
            for (_, key) in keys {
                cursor.enqueue(&key);
            }

            *slot = Some(cursor);
            self.active_peers.write().push(peer);
            debug!("created modification cursor for peer {}", peer);
        }
    }

    /// Re-queue every record with `timestamp >= since` for the peer
    ///
    /// The boundary is inclusive. Records originated by the peer itself are
    /// skipped; the receiving side tolerates redelivery of everything else
    /// through its conflict rule.
    pub fn dirty_entries(&self, peer: PeerId, since: i64) {
        self.ensure_cursor(peer);

        let mut keys: Vec<(i64, Vec<u8>)> = self
            .records
            .read()
            .iter()
            .filter(|(_, r)| r.timestamp >= since && r.origin != peer)
            .map(|(k, r)| (r.timestamp, k.clone()))
            .collect();
        keys.sort();

        let mut slot = self.cursors[peer.index()].lock();
        let cursor = slot.as_mut().expect("cursor exists after ensure_cursor");
        for (_, key) in keys {
            cursor.enqueue(&key);
        }
    }

    /// Pull the next pending entry for a peer, advancing the cursor
    pub fn next_pending(&self, peer: PeerId) -> Option<ModificationEntry> {
        let mut slot = self.cursors[peer.index()].lock();
        let cursor = slot.as_mut()?;

        loop {
            let key = cursor.pending.pop_front()?;
            cursor.queued.remove(&key);

            let records = self.records.read();
            let Some(record) = records.get(&key) else {
                continue;
            };
            // A record that changed hands to this peer after being queued
            // must not echo back to it.
            if record.origin == peer {
                continue;
            }

            return Some(ModificationEntry {
                key: Bytes::from(key),
                value: record.value.clone(),
                timestamp: record.timestamp,
                origin: record.origin,
                is_deleted: record.is_deleted,
                bootstrap_timestamp: record.bootstrap_timestamp,
            });
        }
    }

    pub fn pending_len(&self, peer: PeerId) -> usize {
        self.cursors[peer.index()]
            .lock()
            .as_ref()
            .map(|c| c.pending.len())
            .unwrap_or(0)
    }

    /// Every recorded entry (tombstones included) in timestamp order
    pub fn all_entries(&self) -> Vec<ModificationEntry> {
        let mut entries: Vec<ModificationEntry> = self
            .records
            .read()
            .iter()
            .map(|(key, r)| ModificationEntry {
                key: Bytes::from(key.clone()),
                value: r.value.clone(),
                timestamp: r.timestamp,
                origin: r.origin,
                is_deleted: r.is_deleted,
                bootstrap_timestamp: r.bootstrap_timestamp,
            })
            .collect();
        entries.sort_by_key(|e| e.timestamp);
        entries
    }

    /// Number of recorded keys, tombstones included
    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.records.read().values().filter(|r| r.is_deleted).count()
    }
}

impl Default for ModificationLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-peer cursor over a modification log
///
/// Lightweight handle; created on first acquisition and living as long as
/// the owning store. The position only moves forward as entries are
/// drained; `dirty_entries` is the sole way to mark drained entries
/// pending again.
#[derive(Clone)]
pub struct ModificationIterator {
    log: Arc<ModificationLog>,
    peer: PeerId,
}

impl ModificationIterator {
    pub(crate) fn new(log: Arc<ModificationLog>, peer: PeerId) -> Self {
        log.ensure_cursor(peer);
        Self { log, peer }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn has_next(&self) -> bool {
        self.log.pending_len(self.peer) > 0
    }

    /// Pull a single entry into the consumer; false when nothing is pending
    pub fn next_entry(&self, consumer: impl FnOnce(&ModificationEntry)) -> bool {
        match self.log.next_pending(self.peer) {
            Some(entry) => {
                consumer(&entry);
                true
            }
            None => false,
        }
    }

    /// Drain every pending entry in log order
    pub fn for_each(&self, mut apply: impl FnMut(&ModificationEntry)) {
        while let Some(entry) = self.log.next_pending(self.peer) {
            apply(&entry);
        }
    }

    /// Mark everything with `timestamp >= since` (inclusive) pending again
    pub fn dirty_entries(&self, since: i64) {
        self.log.dirty_entries(self.peer, since);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(raw: u8) -> PeerId {
        PeerId::new(raw).unwrap()
    }

    fn put(key: &'static [u8], value: &'static [u8], ts: i64, origin: u8) -> ModificationEntry {
        ModificationEntry::put(
            Bytes::from_static(key),
            Bytes::from_static(value),
            ts,
            peer(origin),
        )
    }

    #[test]
    fn test_record_and_drain() {
        let log = Arc::new(ModificationLog::new());
        let iter = ModificationIterator::new(log.clone(), peer(2));

        log.record(&put(b"a", b"1", 10, 1));
        log.record(&put(b"b", b"2", 11, 1));

        assert!(iter.has_next());
        let mut drained = Vec::new();
        iter.for_each(|e| drained.push(e.key.clone()));
        assert_eq!(drained.len(), 2);
        assert!(!iter.has_next());
    }

    #[test]
    fn test_entry_never_echoes_to_origin() {
        let log = Arc::new(ModificationLog::new());
        let to_origin = ModificationIterator::new(log.clone(), peer(2));
        let to_other = ModificationIterator::new(log.clone(), peer(3));

        log.record(&put(b"a", b"1", 10, 2));

        assert!(!to_origin.has_next());
        assert!(to_other.has_next());
    }

    #[test]
    fn test_key_queued_at_most_once_per_position() {
        let log = Arc::new(ModificationLog::new());
        let iter = ModificationIterator::new(log.clone(), peer(2));

        log.record(&put(b"a", b"1", 10, 1));
        log.record(&put(b"a", b"2", 11, 1));

        let mut drained = Vec::new();
        iter.for_each(|e| drained.push(e.value.clone()));

        // One position, carrying the newest value
        assert_eq!(drained, vec![Some(Bytes::from_static(b"2"))]);
    }

    #[test]
    fn test_dirty_entries_requeues_from_inclusive_boundary() {
        let log = Arc::new(ModificationLog::new());
        let iter = ModificationIterator::new(log.clone(), peer(2));

        log.record(&put(b"a", b"1", 10, 1));
        log.record(&put(b"b", b"2", 20, 1));
        log.record(&put(b"c", b"3", 30, 1));
        iter.for_each(|_| {});

        iter.dirty_entries(20);

        let mut keys = Vec::new();
        iter.for_each(|e| keys.push(e.key.to_vec()));
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_dirty_entries_zero_replays_everything() {
        let log = Arc::new(ModificationLog::new());
        let iter = ModificationIterator::new(log.clone(), peer(2));

        log.record(&put(b"a", b"1", 10, 1));
        log.record(&put(b"b", b"2", 20, 3));
        iter.for_each(|_| {});

        iter.dirty_entries(0);
        let mut count = 0;
        iter.for_each(|_| count += 1);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_tombstones_are_recorded_and_replayed() {
        let log = Arc::new(ModificationLog::new());
        let iter = ModificationIterator::new(log.clone(), peer(2));

        log.record(&put(b"a", b"1", 10, 1));
        log.record(&ModificationEntry::tombstone(
            Bytes::from_static(b"a"),
            20,
            peer(1),
        ));

        assert_eq!(log.tombstone_count(), 1);

        let mut drained = Vec::new();
        iter.for_each(|e| drained.push((e.is_deleted, e.timestamp)));
        assert_eq!(drained, vec![(true, 20)]);
    }

    #[test]
    fn test_late_cursor_starts_with_full_history() {
        let log = Arc::new(ModificationLog::new());
        log.record(&put(b"a", b"1", 10, 1));
        log.record(&put(b"b", b"2", 20, 5));

        // A cursor created after the fact owes the peer everything it did
        // not originate itself
        let late = ModificationIterator::new(log.clone(), peer(5));
        let mut keys = Vec::new();
        late.for_each(|e| keys.push(e.key.to_vec()));
        assert_eq!(keys, vec![b"a".to_vec()]);
    }
}
