#![forbid(unsafe_code)]

//! Aggregation state of one recursive operation.
//!
//! Redundant routing paths may converge on the target neighborhood, so the
//! session waits for a small fixed number of independent "no closer nodes
//! found" completion reports rather than for every hop. Results accumulate
//! monotonically; whoever is waiting is woken when enough reports arrived.

use std::collections::{BTreeMap, HashMap};

use lattice_core::{DhtAddress, Distance};
use lattice_transport::PeerDescriptor;
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::routing::RecursiveOperation;
use crate::store::DataEntry;

/// Upper bound on tracked closest nodes; well above any redundancy factor.
const MAX_TRACKED_NODES: usize = 20;

/// Aggregated outcome of a recursive operation.
#[derive(Debug, Clone, Default)]
pub struct RecursiveOperationResult {
    /// Nodes near the target, ascending by distance.
    pub closest_nodes: Vec<PeerDescriptor>,
    /// Matching entries (FETCH_DATA only), one slot per creator.
    pub data_entries: Vec<DataEntry>,
}

struct SessionState {
    closest: BTreeMap<Distance, PeerDescriptor>,
    entries: HashMap<DhtAddress, DataEntry>,
    completions: usize,
    completed: bool,
}

pub struct RecursiveOperationSession {
    id: String,
    target: DhtAddress,
    operation: RecursiveOperation,
    waited_completions: usize,
    state: Mutex<SessionState>,
    completed_notify: Notify,
}

impl RecursiveOperationSession {
    pub fn new(target: DhtAddress, operation: RecursiveOperation, waited_completions: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            target,
            operation,
            waited_completions,
            state: Mutex::new(SessionState {
                closest: BTreeMap::new(),
                entries: HashMap::new(),
                completions: 0,
                completed: false,
            }),
            completed_notify: Notify::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> DhtAddress {
        self.target
    }

    pub fn operation(&self) -> RecursiveOperation {
        self.operation
    }

    /// Merge one report from the routing path. `no_closer_nodes_found`
    /// reports count toward completion.
    pub fn on_response(
        &self,
        routing_path: Vec<PeerDescriptor>,
        closest_nodes: Vec<PeerDescriptor>,
        data_entries: Vec<DataEntry>,
        no_closer_nodes_found: bool,
    ) {
        let mut st = self.state.lock();
        if st.completed {
            return;
        }
        for node in routing_path.into_iter().chain(closest_nodes) {
            st.closest.insert(self.target.distance_to(&node.node_id), node);
        }
        while st.closest.len() > MAX_TRACKED_NODES {
            let farthest = *st.closest.keys().next_back().expect("non-empty map");
            st.closest.remove(&farthest);
        }
        for entry in data_entries {
            match st.entries.get(&entry.creator) {
                Some(existing) if existing.stored_at >= entry.stored_at => {}
                _ => {
                    st.entries.insert(entry.creator, entry);
                }
            }
        }
        if no_closer_nodes_found {
            st.completions += 1;
            if st.completions >= self.waited_completions {
                st.completed = true;
                self.completed_notify.notify_waiters();
            }
        }
    }

    /// Wait until enough completion reports arrived. The caller layers a
    /// wall-clock timeout on top.
    pub async fn wait_completed(&self) {
        loop {
            let notified = self.completed_notify.notified();
            if self.state.lock().completed {
                return;
            }
            notified.await;
        }
    }

    /// Force completion, e.g. on shutdown.
    pub fn complete(&self) {
        let mut st = self.state.lock();
        st.completed = true;
        self.completed_notify.notify_waiters();
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    /// Snapshot of everything accumulated so far.
    pub fn results(&self) -> RecursiveOperationResult {
        let st = self.state.lock();
        RecursiveOperationResult {
            closest_nodes: st.closest.values().cloned().collect(),
            data_entries: st.entries.values().cloned().collect(),
        }
    }
}
