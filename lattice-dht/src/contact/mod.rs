#![forbid(unsafe_code)]

//! Contact bookkeeping primitives.
//!
//! A [`Contact`] wraps a peer descriptor with its query state. Contacts live
//! in the lists of this module: the distance-sorted neighbor list, the
//! long-term random sample, and the k-bucket routing table. The same node id
//! may be referenced from several lists for different purposes, but each
//! list owns its own slot.

use lattice_transport::PeerDescriptor;

pub mod kbucket;
pub mod random_list;
pub mod sorted_list;

pub use kbucket::{EvictionOutcome, InsertOutcome, KBucketTable};
pub use random_list::RandomContactList;
pub use sorted_list::{AddOutcome, SortedContactList};

/// Query state of a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactState {
    /// Never queried by this node.
    NotContacted,
    /// A query is or has been in flight.
    Contacted,
    /// Responded to a query.
    Active,
    /// Failed its most recent query or probe.
    Unresponsive,
}

/// A peer descriptor together with this node's view of its query state.
#[derive(Debug, Clone)]
pub struct Contact {
    descriptor: PeerDescriptor,
    state: ContactState,
    failures: u32,
}

impl Contact {
    pub fn new(descriptor: PeerDescriptor) -> Self {
        Self { descriptor, state: ContactState::NotContacted, failures: 0 }
    }

    #[must_use]
    pub fn descriptor(&self) -> &PeerDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn node_id(&self) -> lattice_core::DhtAddress {
        self.descriptor.node_id
    }

    #[must_use]
    pub fn state(&self) -> ContactState {
        self.state
    }

    pub fn set_state(&mut self, state: ContactState) {
        self.state = state;
        if state == ContactState::Active {
            self.failures = 0;
        }
    }

    /// Record a failed query; returns the failure count so far.
    pub fn record_failure(&mut self) -> u32 {
        self.state = ContactState::Unresponsive;
        self.failures += 1;
        self.failures
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == ContactState::Active
    }
}
