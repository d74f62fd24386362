#![forbid(unsafe_code)]

//! This node's share of stored entries.
//!
//! Entries are keyed by `(key, creator)`: multiple creators may store under
//! the same key and each owns its own slot. An entry can be marked `stale`
//! (another node is now responsible for it) or `deleted` (a tombstone left
//! behind by an explicit delete); tombstones are withheld from reads and
//! purged by the TTL sweep together with expired entries.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use lattice_core::DhtAddress;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// One stored key-value entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEntry {
    pub key: DhtAddress,
    pub creator: DhtAddress,
    pub payload: Vec<u8>,
    pub ttl: Duration,
    pub stored_at: SystemTime,
    pub stale: bool,
    pub deleted: bool,
}

impl DataEntry {
    pub fn new(key: DhtAddress, creator: DhtAddress, payload: Vec<u8>, ttl: Duration) -> Self {
        Self {
            key,
            creator,
            payload,
            ttl,
            stored_at: SystemTime::now(),
            stale: false,
            deleted: false,
        }
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        now.duration_since(self.stored_at)
            .map_or(false, |elapsed| elapsed > self.ttl)
    }
}

#[derive(Debug)]
pub struct LocalDataStore {
    max_ttl: Duration,
    entries: Mutex<HashMap<DhtAddress, HashMap<DhtAddress, DataEntry>>>,
}

impl LocalDataStore {
    pub fn new(max_ttl: Duration) -> Self {
        Self { max_ttl, entries: Mutex::new(HashMap::new()) }
    }

    /// Upsert an entry under `(key, creator)`. The TTL is clamped to the
    /// store's maximum and the TTL clock restarts now.
    pub fn store_entry(&self, mut entry: DataEntry) {
        entry.ttl = entry.ttl.min(self.max_ttl);
        entry.stored_at = SystemTime::now();
        trace!(key = %entry.key, creator = %entry.creator, "storing entry");
        self.entries
            .lock()
            .entry(entry.key)
            .or_default()
            .insert(entry.creator, entry);
    }

    /// All live (not deleted, not expired) entries under `key`.
    pub fn get_entries(&self, key: &DhtAddress) -> Vec<DataEntry> {
        let now = SystemTime::now();
        self.entries
            .lock()
            .get(key)
            .map(|per_creator| {
                per_creator
                    .values()
                    .filter(|e| !e.deleted && !e.is_expired(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Leave a tombstone on the entry `creator` stored under `key`.
    pub fn mark_as_deleted(&self, key: &DhtAddress, creator: &DhtAddress) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(key).and_then(|m| m.get_mut(creator)) {
            Some(entry) => {
                entry.deleted = true;
                true
            }
            None => false,
        }
    }

    /// Soft-mark the entry: this node is no longer among its responsible
    /// holders. Returns false when the entry is unknown or already stale.
    pub fn set_stale(&self, key: &DhtAddress, creator: &DhtAddress) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(key).and_then(|m| m.get_mut(creator)) {
            Some(entry) if !entry.stale => {
                entry.stale = true;
                true
            }
            _ => false,
        }
    }

    /// All live entries across all keys, for replication scans.
    pub fn snapshot(&self) -> Vec<DataEntry> {
        let now = SystemTime::now();
        self.entries
            .lock()
            .values()
            .flat_map(|per_creator| per_creator.values())
            .filter(|e| !e.deleted && !e.is_expired(now))
            .cloned()
            .collect()
    }

    /// Purge expired entries and tombstones whose TTL elapsed; returns the
    /// number of removed entries.
    pub fn sweep_expired(&self) -> usize {
        let now = SystemTime::now();
        let mut entries = self.entries.lock();
        let mut removed = 0;
        entries.retain(|_, per_creator| {
            per_creator.retain(|_, entry| {
                let keep = !entry.is_expired(now);
                if !keep {
                    removed += 1;
                }
                keep
            });
            !per_creator.is_empty()
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> LocalDataStore {
        LocalDataStore::new(Duration::from_secs(60))
    }

    #[test]
    fn store_then_get_round_trips() {
        let store = store();
        let key = DhtAddress::random();
        let creator = DhtAddress::random();
        store.store_entry(DataEntry::new(key, creator, b"payload".to_vec(), Duration::from_secs(10)));

        let entries = store.get_entries(&key);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, key);
        assert_eq!(entries[0].creator, creator);
        assert_eq!(entries[0].payload, b"payload");
    }

    #[test]
    fn entries_are_keyed_by_key_and_creator() {
        let store = store();
        let key = DhtAddress::random();
        let a = DhtAddress::random();
        let b = DhtAddress::random();
        store.store_entry(DataEntry::new(key, a, b"from a".to_vec(), Duration::from_secs(10)));
        store.store_entry(DataEntry::new(key, b, b"from b".to_vec(), Duration::from_secs(10)));
        store.store_entry(DataEntry::new(key, a, b"from a again".to_vec(), Duration::from_secs(10)));

        let entries = store.get_entries(&key);
        assert_eq!(entries.len(), 2, "one slot per creator");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn expired_entries_are_invisible_and_swept() {
        let store = store();
        let key = DhtAddress::random();
        store.store_entry(DataEntry::new(
            key,
            DhtAddress::random(),
            b"x".to_vec(),
            Duration::from_millis(0),
        ));
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.get_entries(&key).is_empty());
        assert_eq!(store.sweep_expired(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn ttl_is_clamped_to_store_maximum() {
        let store = LocalDataStore::new(Duration::from_millis(10));
        let key = DhtAddress::random();
        store.store_entry(DataEntry::new(
            key,
            DhtAddress::random(),
            b"x".to_vec(),
            Duration::from_secs(3600),
        ));
        std::thread::sleep(Duration::from_millis(20));
        assert!(store.get_entries(&key).is_empty());
    }

    #[test]
    fn tombstones_hide_entries_from_reads() {
        let store = store();
        let key = DhtAddress::random();
        let creator = DhtAddress::random();
        store.store_entry(DataEntry::new(key, creator, b"x".to_vec(), Duration::from_secs(10)));

        assert!(store.mark_as_deleted(&key, &creator));
        assert!(store.get_entries(&key).is_empty());
        // the tombstone itself remains until the sweep
        assert_eq!(store.len(), 1);
        assert!(!store.mark_as_deleted(&key, &DhtAddress::random()));
    }

    #[test]
    fn stale_marking_happens_once() {
        let store = store();
        let key = DhtAddress::random();
        let creator = DhtAddress::random();
        store.store_entry(DataEntry::new(key, creator, b"x".to_vec(), Duration::from_secs(10)));

        assert!(store.set_stale(&key, &creator));
        assert!(!store.set_stale(&key, &creator), "second marking is a no-op");
        // stale entries are still readable
        assert_eq!(store.get_entries(&key).len(), 1);
        assert!(store.get_entries(&key)[0].stale);
    }
}
