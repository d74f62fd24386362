#![forbid(unsafe_code)]

//! K-bucket routing table.
//!
//! The identifier space is partitioned by shared-prefix length of the XOR
//! distance from the local address: bucket `i` holds peers whose distance
//! has `i` leading zero bits. Each bucket holds at most `k` contacts. A full
//! bucket never drops a member outright; the caller opens an eviction check
//! (liveness probe of the least-recently-seen member) and settles it through
//! [`KBucketTable::complete_eviction`]. While a check is pending, further
//! candidates for that bucket are dropped (first-requested-wins).

use std::collections::HashSet;

use lattice_core::{DhtAddress, DHT_ADDRESS_LENGTH};
use lattice_transport::PeerDescriptor;

pub const BUCKET_COUNT: usize = DHT_ADDRESS_LENGTH * 8;

#[derive(Debug, Clone)]
struct Slot {
    descriptor: PeerDescriptor,
    last_seen: u64,
}

#[derive(Debug, Default, Clone)]
struct Bucket {
    slots: Vec<Slot>,
    eviction_pending: bool,
}

impl Bucket {
    fn position(&self, id: &DhtAddress) -> Option<usize> {
        self.slots.iter().position(|s| s.descriptor.node_id == *id)
    }

    fn least_recently_seen(&self) -> Option<&Slot> {
        self.slots.iter().min_by_key(|s| s.last_seen)
    }
}

/// Result of an insertion attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
    /// The bucket is full; an eviction check against the returned member has
    /// been opened and must be settled via `complete_eviction`.
    Full { least_recently_seen: PeerDescriptor },
    /// The bucket is full with an eviction check already pending.
    Dropped,
}

/// Result of settling an eviction check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionOutcome {
    pub removed: Option<PeerDescriptor>,
    pub inserted: bool,
}

#[derive(Debug)]
pub struct KBucketTable {
    local_id: DhtAddress,
    capacity: usize,
    buckets: Vec<Bucket>,
}

impl KBucketTable {
    pub fn new(local_id: DhtAddress, capacity: usize) -> Self {
        Self {
            local_id,
            capacity,
            buckets: vec![Bucket::default(); BUCKET_COUNT],
        }
    }

    fn bucket_index(&self, id: &DhtAddress) -> usize {
        self.local_id
            .distance_to(id)
            .leading_zeros()
            .min(BUCKET_COUNT - 1)
    }

    pub fn contains(&self, id: &DhtAddress) -> bool {
        self.buckets[self.bucket_index(id)].position(id).is_some()
    }

    pub fn get(&self, id: &DhtAddress) -> Option<PeerDescriptor> {
        let bucket = &self.buckets[self.bucket_index(id)];
        bucket.position(id).map(|pos| bucket.slots[pos].descriptor.clone())
    }

    pub fn try_insert(&mut self, descriptor: PeerDescriptor, stamp: u64) -> InsertOutcome {
        if descriptor.node_id == self.local_id {
            return InsertOutcome::Dropped;
        }
        let index = self.bucket_index(&descriptor.node_id);
        let capacity = self.capacity;
        let bucket = &mut self.buckets[index];
        if let Some(pos) = bucket.position(&descriptor.node_id) {
            bucket.slots[pos].last_seen = stamp;
            return InsertOutcome::AlreadyPresent;
        }
        if bucket.slots.len() < capacity {
            bucket.slots.push(Slot { descriptor, last_seen: stamp });
            return InsertOutcome::Inserted;
        }
        if bucket.eviction_pending {
            return InsertOutcome::Dropped;
        }
        bucket.eviction_pending = true;
        let lrs = bucket
            .least_recently_seen()
            .expect("full bucket has members")
            .descriptor
            .clone();
        InsertOutcome::Full { least_recently_seen: lrs }
    }

    /// Settle the pending eviction check in `candidate`'s bucket. When
    /// `evict` is set the probed member is removed and the candidate takes
    /// its place; otherwise the member's recency is refreshed and the
    /// candidate is dropped.
    pub fn complete_eviction(
        &mut self,
        candidate: PeerDescriptor,
        probed: &DhtAddress,
        evict: bool,
        stamp: u64,
    ) -> EvictionOutcome {
        let index = self.bucket_index(&candidate.node_id);
        let capacity = self.capacity;
        let bucket = &mut self.buckets[index];
        bucket.eviction_pending = false;
        let mut outcome = EvictionOutcome { removed: None, inserted: false };
        if evict {
            if let Some(pos) = bucket.position(probed) {
                outcome.removed = Some(bucket.slots.remove(pos).descriptor);
            }
            if bucket.slots.len() < capacity && bucket.position(&candidate.node_id).is_none() {
                bucket.slots.push(Slot { descriptor: candidate, last_seen: stamp });
                outcome.inserted = true;
            }
        } else if let Some(pos) = bucket.position(probed) {
            bucket.slots[pos].last_seen = stamp;
        }
        outcome
    }

    /// Refresh the recency of a member after successful communication.
    pub fn touch(&mut self, id: &DhtAddress, stamp: u64) -> bool {
        let index = self.bucket_index(id);
        match self.buckets[index].position(id) {
            Some(pos) => {
                self.buckets[index].slots[pos].last_seen = stamp;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &DhtAddress) -> bool {
        let index = self.bucket_index(id);
        match self.buckets[index].position(id) {
            Some(pos) => {
                self.buckets[index].slots.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Up to `limit` members ordered by ascending XOR distance to `target`,
    /// skipping ids in `exclude`.
    pub fn closest(
        &self,
        target: &DhtAddress,
        limit: usize,
        exclude: &HashSet<DhtAddress>,
    ) -> Vec<PeerDescriptor> {
        let mut members: Vec<&PeerDescriptor> = self
            .buckets
            .iter()
            .flat_map(|b| b.slots.iter().map(|s| &s.descriptor))
            .filter(|d| !exclude.contains(&d.node_id))
            .collect();
        members.sort_by_key(|d| (target.distance_to(&d.node_id), d.node_id));
        members.into_iter().take(limit).cloned().collect()
    }

    pub fn all_descriptors(&self) -> Vec<PeerDescriptor> {
        self.buckets
            .iter()
            .flat_map(|b| b.slots.iter().map(|s| s.descriptor.clone()))
            .collect()
    }

    /// Total number of members across all buckets.
    pub fn count(&self) -> usize {
        self.buckets.iter().map(|b| b.slots.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Occupancy of each non-empty bucket, for diagnostics and tests.
    pub fn occupancy(&self) -> Vec<(usize, usize)> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.slots.is_empty())
            .map(|(i, b)| (i, b.slots.len()))
            .collect()
    }

    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.slots.clear();
            bucket.eviction_pending = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(lead: u8, tail: u8) -> DhtAddress {
        let mut raw = [0u8; DHT_ADDRESS_LENGTH];
        raw[0] = lead;
        raw[DHT_ADDRESS_LENGTH - 1] = tail;
        DhtAddress::new(raw)
    }

    fn descriptor(lead: u8, tail: u8) -> PeerDescriptor {
        PeerDescriptor::new(addr(lead, tail))
    }

    #[test]
    fn buckets_never_exceed_capacity() {
        let mut table = KBucketTable::new(addr(0, 0), 3);
        // all of these share bucket 0 (leading bit differs from local)
        for tail in 0..10u8 {
            table.try_insert(descriptor(0x80, tail), u64::from(tail));
        }
        for (_, len) in table.occupancy() {
            assert!(len <= 3);
        }
        assert_eq!(table.count(), 3);
    }

    #[test]
    fn full_bucket_opens_one_eviction_check() {
        let mut table = KBucketTable::new(addr(0, 0), 2);
        table.try_insert(descriptor(0x80, 1), 1);
        table.try_insert(descriptor(0x80, 2), 2);

        match table.try_insert(descriptor(0x80, 3), 3) {
            InsertOutcome::Full { least_recently_seen } => {
                assert_eq!(least_recently_seen.node_id, addr(0x80, 1));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        // second candidate while the check is pending is dropped
        assert_eq!(table.try_insert(descriptor(0x80, 4), 4), InsertOutcome::Dropped);
    }

    #[test]
    fn eviction_replaces_unresponsive_member() {
        let mut table = KBucketTable::new(addr(0, 0), 2);
        table.try_insert(descriptor(0x80, 1), 1);
        table.try_insert(descriptor(0x80, 2), 2);
        let candidate = descriptor(0x80, 3);
        table.try_insert(candidate.clone(), 3);

        let outcome = table.complete_eviction(candidate, &addr(0x80, 1), true, 4);
        assert_eq!(outcome.removed.unwrap().node_id, addr(0x80, 1));
        assert!(outcome.inserted);
        assert!(table.contains(&addr(0x80, 3)));
        assert!(!table.contains(&addr(0x80, 1)));
    }

    #[test]
    fn responsive_member_survives_eviction_check() {
        let mut table = KBucketTable::new(addr(0, 0), 2);
        table.try_insert(descriptor(0x80, 1), 1);
        table.try_insert(descriptor(0x80, 2), 2);
        let candidate = descriptor(0x80, 3);
        table.try_insert(candidate.clone(), 3);

        let outcome = table.complete_eviction(candidate, &addr(0x80, 1), false, 4);
        assert!(outcome.removed.is_none());
        assert!(!outcome.inserted);
        assert!(table.contains(&addr(0x80, 1)));
        // refreshed recency: the other member is now least recently seen
        match table.try_insert(descriptor(0x80, 5), 5) {
            InsertOutcome::Full { least_recently_seen } => {
                assert_eq!(least_recently_seen.node_id, addr(0x80, 2));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn closest_orders_by_distance_to_target() {
        let mut table = KBucketTable::new(addr(0, 0), 4);
        for lead in [0x01, 0x02, 0x40, 0x80] {
            table.try_insert(descriptor(lead, 0), 1);
        }
        let target = addr(0x03, 0);
        let closest = table.closest(&target, 3, &HashSet::new());
        let leads: Vec<u8> = closest.iter().map(|d| d.node_id.as_bytes()[0]).collect();
        assert_eq!(leads, vec![0x02, 0x01, 0x40]);
    }
}
