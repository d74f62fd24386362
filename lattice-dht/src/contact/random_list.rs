#![forbid(unsafe_code)]

//! Long-term random sample of observed peers.
//!
//! Every observed peer is a candidate, but only a random fraction is
//! admitted, so the list drifts toward a uniform sample of the population
//! rather than mirroring the neighborhood. Admission order is kept and the
//! oldest member is dropped when the list is full.

use lattice_core::DhtAddress;
use lattice_transport::PeerDescriptor;
use rand::Rng;
use std::collections::{HashMap, VecDeque};

#[derive(Debug)]
pub struct RandomContactList {
    local_id: DhtAddress,
    max_size: usize,
    randomness: f64,
    order: VecDeque<DhtAddress>,
    contacts: HashMap<DhtAddress, PeerDescriptor>,
}

impl RandomContactList {
    pub fn new(local_id: DhtAddress, max_size: usize, randomness: f64) -> Self {
        Self {
            local_id,
            max_size,
            randomness,
            order: VecDeque::new(),
            contacts: HashMap::new(),
        }
    }

    /// Consider `descriptor` for admission. Returns the admitted flag and,
    /// when the list was full, the member that made room.
    pub fn add_contact(&mut self, descriptor: PeerDescriptor) -> (bool, Option<PeerDescriptor>) {
        if descriptor.node_id == self.local_id || self.contacts.contains_key(&descriptor.node_id) {
            return (false, None);
        }
        if rand::thread_rng().gen::<f64>() >= self.randomness {
            return (false, None);
        }
        let mut dropped = None;
        if self.contacts.len() >= self.max_size {
            if let Some(oldest) = self.order.pop_front() {
                dropped = self.contacts.remove(&oldest);
            }
        }
        self.order.push_back(descriptor.node_id);
        self.contacts.insert(descriptor.node_id, descriptor);
        (true, dropped)
    }

    pub fn remove_contact(&mut self, id: &DhtAddress) -> bool {
        if self.contacts.remove(id).is_some() {
            self.order.retain(|other| other != id);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, id: &DhtAddress) -> bool {
        self.contacts.contains_key(id)
    }

    /// Members in admission order, oldest first.
    pub fn contacts(&self, limit: usize) -> Vec<PeerDescriptor> {
        self.order
            .iter()
            .filter_map(|id| self.contacts.get(id).cloned())
            .take(limit)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.contacts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> PeerDescriptor {
        PeerDescriptor::new(DhtAddress::random())
    }

    #[test]
    fn always_admits_with_full_randomness() {
        let mut list = RandomContactList::new(DhtAddress::random(), 8, 1.0);
        for _ in 0..5 {
            let (added, _) = list.add_contact(descriptor());
            assert!(added);
        }
        assert_eq!(list.len(), 5);
    }

    #[test]
    fn never_admits_with_zero_randomness() {
        let mut list = RandomContactList::new(DhtAddress::random(), 8, 0.0);
        for _ in 0..5 {
            let (added, _) = list.add_contact(descriptor());
            assert!(!added);
        }
        assert!(list.is_empty());
    }

    #[test]
    fn full_list_drops_oldest_member() {
        let mut list = RandomContactList::new(DhtAddress::random(), 2, 1.0);
        let first = descriptor();
        list.add_contact(first.clone());
        list.add_contact(descriptor());
        let (added, dropped) = list.add_contact(descriptor());
        assert!(added);
        assert_eq!(dropped.unwrap().node_id, first.node_id);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn rejects_self_and_known_ids() {
        let local = DhtAddress::random();
        let mut list = RandomContactList::new(local, 8, 1.0);
        assert!(!list.add_contact(PeerDescriptor::new(local)).0);
        let peer = descriptor();
        assert!(list.add_contact(peer.clone()).0);
        assert!(!list.add_contact(peer).0);
    }
}
