#![forbid(unsafe_code)]

//! Connection-lock bookkeeping.
//!
//! Locks are independent of the existence of connections: a lock on a peer
//! means the link to it must not be torn down, even while the underlying
//! transport reconnects. Three categories are tracked per peer, each a set
//! of caller-chosen lock tokens:
//!
//! * **local**: this node requires the link,
//! * **remote**: the peer has asked us to keep the link,
//! * **weak**: routing-table membership wants the link kept warm but will
//!   not insist against resource pressure.
//!
//! A peer is locked while any category holds at least one token. Adding or
//! removing a token is idempotent.

use std::collections::{HashMap, HashSet};

use lattice_core::DhtAddress;

pub type LockId = String;

#[derive(Debug, Default)]
pub struct ConnectionLockHandler {
    local_locks: HashMap<DhtAddress, HashSet<LockId>>,
    remote_locks: HashMap<DhtAddress, HashSet<LockId>>,
    weak_locks: HashMap<DhtAddress, HashSet<LockId>>,
}

impl ConnectionLockHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn local_locked_connection_count(&self) -> usize {
        self.local_locks.len()
    }

    #[must_use]
    pub fn remote_locked_connection_count(&self) -> usize {
        self.remote_locks.len()
    }

    #[must_use]
    pub fn weak_locked_connection_count(&self) -> usize {
        self.weak_locks.len()
    }

    pub fn is_local_locked(&self, id: &DhtAddress, lock_id: Option<&str>) -> bool {
        Self::holds(&self.local_locks, id, lock_id)
    }

    pub fn is_remote_locked(&self, id: &DhtAddress, lock_id: Option<&str>) -> bool {
        Self::holds(&self.remote_locks, id, lock_id)
    }

    pub fn is_weak_locked(&self, id: &DhtAddress) -> bool {
        self.weak_locks.contains_key(id)
    }

    /// Whether any category holds the peer.
    pub fn is_locked(&self, id: &DhtAddress) -> bool {
        self.local_locks.contains_key(id)
            || self.remote_locks.contains_key(id)
            || self.weak_locks.contains_key(id)
    }

    pub fn add_local_locked(&mut self, id: DhtAddress, lock_id: impl Into<LockId>) {
        self.local_locks.entry(id).or_default().insert(lock_id.into());
    }

    pub fn add_remote_locked(&mut self, id: DhtAddress, lock_id: impl Into<LockId>) {
        self.remote_locks.entry(id).or_default().insert(lock_id.into());
    }

    pub fn add_weak_locked(&mut self, id: DhtAddress, lock_id: impl Into<LockId>) {
        self.weak_locks.entry(id).or_default().insert(lock_id.into());
    }

    pub fn remove_local_locked(&mut self, id: &DhtAddress, lock_id: &str) {
        Self::release(&mut self.local_locks, id, lock_id);
    }

    pub fn remove_remote_locked(&mut self, id: &DhtAddress, lock_id: &str) {
        Self::release(&mut self.remote_locks, id, lock_id);
    }

    pub fn remove_weak_locked(&mut self, id: &DhtAddress, lock_id: &str) {
        Self::release(&mut self.weak_locks, id, lock_id);
    }

    /// Drop every token the peer holds in all categories.
    pub fn clear_all_locks(&mut self, id: &DhtAddress) {
        self.local_locks.remove(id);
        self.remote_locks.remove(id);
        self.weak_locks.remove(id);
    }

    pub fn clear(&mut self) {
        self.local_locks.clear();
        self.remote_locks.clear();
        self.weak_locks.clear();
    }

    fn holds(map: &HashMap<DhtAddress, HashSet<LockId>>, id: &DhtAddress, lock_id: Option<&str>) -> bool {
        match lock_id {
            None => map.contains_key(id),
            Some(token) => map.get(id).is_some_and(|set| set.contains(token)),
        }
    }

    fn release(map: &mut HashMap<DhtAddress, HashSet<LockId>>, id: &DhtAddress, lock_id: &str) {
        if let Some(set) = map.get_mut(id) {
            set.remove(lock_id);
            if set.is_empty() {
                map.remove(id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_then_unlock_leaves_peer_unlocked() {
        let peer = DhtAddress::random();
        let mut locks = ConnectionLockHandler::new();
        locks.add_local_locked(peer, "svc");
        assert!(locks.is_locked(&peer));
        locks.remove_local_locked(&peer, "svc");
        assert!(!locks.is_locked(&peer));
        assert_eq!(locks.local_locked_connection_count(), 0);
    }

    #[test]
    fn weak_and_strong_locks_contribute_independently() {
        let peer = DhtAddress::random();
        let mut locks = ConnectionLockHandler::new();
        locks.add_weak_locked(peer, "table");
        locks.add_local_locked(peer, "svc");
        assert!(locks.is_locked(&peer));

        locks.remove_local_locked(&peer, "svc");
        assert!(locks.is_locked(&peer), "weak lock still holds");

        locks.remove_weak_locked(&peer, "table");
        assert!(!locks.is_locked(&peer));
    }

    #[test]
    fn tokens_are_idempotent() {
        let peer = DhtAddress::random();
        let mut locks = ConnectionLockHandler::new();
        locks.add_local_locked(peer, "svc");
        locks.add_local_locked(peer, "svc");
        locks.remove_local_locked(&peer, "svc");
        assert!(!locks.is_local_locked(&peer, None));
    }

    #[test]
    fn distinct_tokens_release_separately() {
        let peer = DhtAddress::random();
        let mut locks = ConnectionLockHandler::new();
        locks.add_local_locked(peer, "join");
        locks.add_local_locked(peer, "stream");
        locks.remove_local_locked(&peer, "join");
        assert!(locks.is_local_locked(&peer, Some("stream")));
        assert!(!locks.is_local_locked(&peer, Some("join")));
        assert!(locks.is_locked(&peer));
    }

    #[test]
    fn remote_category_is_separate() {
        let peer = DhtAddress::random();
        let mut locks = ConnectionLockHandler::new();
        locks.add_remote_locked(peer, "peer-svc");
        assert!(!locks.is_local_locked(&peer, None));
        assert!(locks.is_remote_locked(&peer, None));
        locks.clear_all_locks(&peer);
        assert!(!locks.is_locked(&peer));
    }
}
