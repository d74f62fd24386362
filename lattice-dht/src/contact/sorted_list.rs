#![forbid(unsafe_code)]

//! Bounded contact list kept sorted by XOR distance to a reference address.
//!
//! Distances to a fixed reference are a bijection of node ids, so the
//! ordering is total and ties cannot occur. When the list is full, a new
//! contact is only admitted if it is closer than the current farthest
//! member, which is then evicted.

use std::collections::HashSet;

use lattice_core::{DhtAddress, Distance};
use lattice_transport::PeerDescriptor;
use std::collections::BTreeMap;

use super::{Contact, ContactState};

/// Result of an insertion attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// Admitted; the previous farthest member may have been pushed out.
    Added { evicted: Option<PeerDescriptor> },
    AlreadyPresent,
    /// Full and the candidate is farther than every member.
    Rejected,
}

#[derive(Debug)]
pub struct SortedContactList {
    reference_id: DhtAddress,
    max_size: usize,
    by_distance: BTreeMap<Distance, Contact>,
}

impl SortedContactList {
    pub fn new(reference_id: DhtAddress, max_size: usize) -> Self {
        Self { reference_id, max_size, by_distance: BTreeMap::new() }
    }

    fn distance_of(&self, id: &DhtAddress) -> Distance {
        self.reference_id.distance_to(id)
    }

    pub fn add_contact(&mut self, descriptor: PeerDescriptor) -> AddOutcome {
        if descriptor.node_id == self.reference_id {
            return AddOutcome::Rejected;
        }
        let distance = self.distance_of(&descriptor.node_id);
        if self.by_distance.contains_key(&distance) {
            return AddOutcome::AlreadyPresent;
        }
        if self.by_distance.len() >= self.max_size {
            let farthest = *self
                .by_distance
                .keys()
                .next_back()
                .expect("non-empty list at capacity");
            if distance >= farthest {
                return AddOutcome::Rejected;
            }
            let evicted = self
                .by_distance
                .remove(&farthest)
                .map(|c| c.descriptor().clone());
            self.by_distance.insert(distance, Contact::new(descriptor));
            return AddOutcome::Added { evicted };
        }
        self.by_distance.insert(distance, Contact::new(descriptor));
        AddOutcome::Added { evicted: None }
    }

    pub fn remove_contact(&mut self, id: &DhtAddress) -> Option<Contact> {
        let distance = self.distance_of(id);
        self.by_distance.remove(&distance)
    }

    pub fn contains(&self, id: &DhtAddress) -> bool {
        self.by_distance.contains_key(&self.distance_of(id))
    }

    pub fn get(&self, id: &DhtAddress) -> Option<&Contact> {
        self.by_distance.get(&self.distance_of(id))
    }

    pub fn set_state(&mut self, id: &DhtAddress, state: ContactState) -> bool {
        let distance = self.distance_of(id);
        match self.by_distance.get_mut(&distance) {
            Some(contact) => {
                contact.set_state(state);
                true
            }
            None => false,
        }
    }

    /// Record a query failure; returns the contact's failure count.
    pub fn record_failure(&mut self, id: &DhtAddress) -> Option<u32> {
        let distance = self.distance_of(id);
        self.by_distance.get_mut(&distance).map(Contact::record_failure)
    }

    pub fn is_active(&self, id: &DhtAddress) -> bool {
        self.get(id).is_some_and(Contact::is_active)
    }

    /// Up to `limit` contacts in ascending distance order, skipping ids in
    /// `exclude`.
    pub fn closest_contacts(&self, limit: usize, exclude: &HashSet<DhtAddress>) -> Vec<PeerDescriptor> {
        self.by_distance
            .values()
            .filter(|c| !exclude.contains(&c.node_id()))
            .take(limit)
            .map(|c| c.descriptor().clone())
            .collect()
    }

    /// All contacts in ascending distance order.
    pub fn all_descriptors(&self) -> Vec<PeerDescriptor> {
        self.by_distance.values().map(|c| c.descriptor().clone()).collect()
    }

    pub fn all_ids(&self) -> Vec<DhtAddress> {
        self.by_distance.values().map(Contact::node_id).collect()
    }

    /// The closest active contact whose id satisfies `predicate`.
    pub fn closest_active_where(
        &self,
        predicate: impl Fn(&DhtAddress) -> bool,
    ) -> Option<PeerDescriptor> {
        self.by_distance
            .values()
            .find(|c| c.is_active() && predicate(&c.node_id()))
            .map(|c| c.descriptor().clone())
    }

    pub fn len(&self) -> usize {
        self.by_distance.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_distance.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_distance.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::DHT_ADDRESS_LENGTH;

    fn addr(lead: u8) -> DhtAddress {
        let mut raw = [0u8; DHT_ADDRESS_LENGTH];
        raw[0] = lead;
        DhtAddress::new(raw)
    }

    fn descriptor(lead: u8) -> PeerDescriptor {
        PeerDescriptor::new(addr(lead))
    }

    #[test]
    fn keeps_ascending_distance_order() {
        let mut list = SortedContactList::new(addr(0x00), 10);
        for lead in [0x40, 0x01, 0x10, 0x04] {
            list.add_contact(descriptor(lead));
        }
        let ordered: Vec<u8> = list
            .closest_contacts(10, &HashSet::new())
            .iter()
            .map(|d| d.node_id.as_bytes()[0])
            .collect();
        assert_eq!(ordered, vec![0x01, 0x04, 0x10, 0x40]);
    }

    #[test]
    fn rejects_reference_id_and_duplicates() {
        let mut list = SortedContactList::new(addr(0x00), 10);
        assert_eq!(list.add_contact(descriptor(0x00)), AddOutcome::Rejected);
        assert!(matches!(list.add_contact(descriptor(0x01)), AddOutcome::Added { .. }));
        assert_eq!(list.add_contact(descriptor(0x01)), AddOutcome::AlreadyPresent);
    }

    #[test]
    fn full_list_evicts_farthest_for_closer_candidate() {
        let mut list = SortedContactList::new(addr(0x00), 2);
        list.add_contact(descriptor(0x10));
        list.add_contact(descriptor(0x20));

        // farther candidate is rejected outright
        assert_eq!(list.add_contact(descriptor(0x30)), AddOutcome::Rejected);

        // closer candidate pushes out the farthest member
        match list.add_contact(descriptor(0x01)) {
            AddOutcome::Added { evicted: Some(evicted) } => {
                assert_eq!(evicted.node_id, addr(0x20));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn state_transitions_and_failures() {
        let mut list = SortedContactList::new(addr(0x00), 4);
        list.add_contact(descriptor(0x01));
        assert!(!list.is_active(&addr(0x01)));

        list.set_state(&addr(0x01), ContactState::Active);
        assert!(list.is_active(&addr(0x01)));

        assert_eq!(list.record_failure(&addr(0x01)), Some(1));
        assert_eq!(list.record_failure(&addr(0x01)), Some(2));
        assert!(!list.is_active(&addr(0x01)));

        // recovery resets the failure counter
        list.set_state(&addr(0x01), ContactState::Active);
        assert_eq!(list.record_failure(&addr(0x01)), Some(1));
    }

    #[test]
    fn exclusion_set_is_honored() {
        let mut list = SortedContactList::new(addr(0x00), 4);
        list.add_contact(descriptor(0x01));
        list.add_contact(descriptor(0x02));
        let exclude: HashSet<_> = [addr(0x01)].into_iter().collect();
        let contacts = list.closest_contacts(4, &exclude);
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].node_id, addr(0x02));
    }
}
