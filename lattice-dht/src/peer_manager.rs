#![forbid(unsafe_code)]

//! Contact admission, eviction and lifecycle events.
//!
//! The `PeerManager` owns one node's routing table (k-buckets) and its
//! auxiliary contact lists: the distance-sorted neighbor list, the open
//! internet list and the long-term random sample. All mutation goes through
//! one mutex-guarded state so every admission or eviction decision sees a
//! consistent view of the table.
//!
//! A full bucket never drops a member outright. The least-recently-seen
//! member is probed through the injected [`LivenessProber`]; only when the
//! probe fails is it replaced by the candidate. While a probe for a bucket
//! is in flight, further candidates for that bucket are dropped
//! (first-requested-wins); they stay in the neighbor list and are promoted
//! later when a slot frees up.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lattice_core::{DhtAddress, DhtConfig};
use lattice_transport::{ConnectionLocker, PeerDescriptor};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::contact::{
    AddOutcome, ContactState, InsertOutcome, KBucketTable, RandomContactList, SortedContactList,
};
use crate::routing::ClosestContactsProvider;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Liveness probe used by bucket eviction checks. Implementations must
/// resolve within a bounded time; the manager additionally applies its own
/// probe timeout so a stuck probe never blocks table mutation.
#[async_trait]
pub trait LivenessProber: Send + Sync + 'static {
    async fn probe(&self, target: &PeerDescriptor) -> bool;
}

/// Contact lifecycle notifications, consumed by the store manager (for
/// replication) and by discovery.
#[derive(Debug, Clone)]
pub enum ContactEvent {
    NewContact {
        descriptor: PeerDescriptor,
        closest: Vec<PeerDescriptor>,
    },
    ContactRemoved {
        descriptor: PeerDescriptor,
        closest: Vec<PeerDescriptor>,
    },
}

#[derive(Debug, Clone)]
pub struct PeerManagerConfig {
    pub service_id: String,
    pub nodes_per_bucket: usize,
    pub max_neighbor_list_size: usize,
    pub closest_contacts_limit: usize,
    pub max_contact_failures: u32,
    pub random_contact_probability: f64,
    pub eviction_probe_timeout: Duration,
}

impl From<&DhtConfig> for PeerManagerConfig {
    fn from(cfg: &DhtConfig) -> Self {
        Self {
            service_id: cfg.service_id.clone(),
            nodes_per_bucket: cfg.nodes_per_bucket,
            max_neighbor_list_size: cfg.max_neighbor_list_size,
            closest_contacts_limit: cfg.closest_contacts_limit,
            max_contact_failures: cfg.max_contact_failures,
            random_contact_probability: cfg.random_contact_probability,
            eviction_probe_timeout: cfg.rpc_timeout(),
        }
    }
}

struct State {
    bucket: KBucketTable,
    neighbors: SortedContactList,
    open_internet: SortedContactList,
    random: RandomContactList,
    connections: HashMap<DhtAddress, PeerDescriptor>,
}

pub struct PeerManager {
    local: PeerDescriptor,
    config: PeerManagerConfig,
    state: Mutex<State>,
    events: broadcast::Sender<ContactEvent>,
    prober: Arc<dyn LivenessProber>,
    locker: Arc<dyn ConnectionLocker>,
    /// Monotonic recency clock for bucket slots; per manager instance so
    /// multiple nodes in one process stay independent.
    clock: AtomicU64,
    stopped: AtomicBool,
}

impl PeerManager {
    pub fn new(
        local: PeerDescriptor,
        config: PeerManagerConfig,
        prober: Arc<dyn LivenessProber>,
        locker: Arc<dyn ConnectionLocker>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let local_id = local.node_id;
        Arc::new(Self {
            local,
            state: Mutex::new(State {
                bucket: KBucketTable::new(local_id, config.nodes_per_bucket),
                neighbors: SortedContactList::new(local_id, config.max_neighbor_list_size),
                open_internet: SortedContactList::new(local_id, config.max_neighbor_list_size / 2),
                random: RandomContactList::new(
                    local_id,
                    config.max_neighbor_list_size,
                    config.random_contact_probability,
                ),
                connections: HashMap::new(),
            }),
            config,
            events,
            prober,
            locker,
            clock: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        })
    }

    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn next_stamp(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn weak_lock_token(&self) -> String {
        format!("{}::kbucket", self.config.service_id)
    }

    fn closest_snapshot(&self, state: &State) -> Vec<PeerDescriptor> {
        state
            .neighbors
            .closest_contacts(self.config.closest_contacts_limit, &HashSet::new())
    }

    fn emit(&self, events: Vec<ContactEvent>) {
        for event in events {
            let _ = self.events.send(event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContactEvent> {
        self.events.subscribe()
    }

    /// Observe a peer. New peers enter the neighbor list and, if their
    /// bucket has room (or its probe frees a slot), the routing table.
    pub fn add_contact(self: &Arc<Self>, descriptor: PeerDescriptor) {
        if self.stopped() || descriptor.node_id == self.local.node_id {
            return;
        }
        let mut events = Vec::new();
        let mut probe = None;
        {
            let mut st = self.state.lock();
            if st.bucket.contains(&descriptor.node_id) {
                let stamp = self.next_stamp();
                st.bucket.touch(&descriptor.node_id, stamp);
                return;
            }
            if st.neighbors.contains(&descriptor.node_id) {
                // known already; a candidate for the long-term sample only
                let _ = st.random.add_contact(descriptor);
                return;
            }
            trace!(peer = %descriptor.node_id, "adding new contact");
            match st.neighbors.add_contact(descriptor.clone()) {
                AddOutcome::Added { evicted } => {
                    if let Some(evicted) = evicted {
                        let _ = st.random.add_contact(evicted);
                    }
                }
                AddOutcome::AlreadyPresent => {}
                AddOutcome::Rejected => {
                    let _ = st.random.add_contact(descriptor.clone());
                }
            }
            if descriptor.open_internet {
                let _ = st.open_internet.add_contact(descriptor.clone());
            }
            let stamp = self.next_stamp();
            match st.bucket.try_insert(descriptor.clone(), stamp) {
                InsertOutcome::Inserted => {
                    self.locker
                        .weak_lock_connection(&descriptor, &self.weak_lock_token());
                    events.push(ContactEvent::NewContact {
                        descriptor,
                        closest: self.closest_snapshot(&st),
                    });
                }
                InsertOutcome::AlreadyPresent | InsertOutcome::Dropped => {}
                InsertOutcome::Full { least_recently_seen } => {
                    probe = Some((least_recently_seen, descriptor));
                }
            }
        }
        self.emit(events);
        if let Some((lrs, candidate)) = probe {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.run_eviction_check(lrs, candidate).await;
            });
        }
    }

    pub fn handle_new_peers(self: &Arc<Self>, peers: Vec<PeerDescriptor>) {
        for peer in peers {
            self.add_contact(peer);
        }
    }

    /// Probe the least-recently-seen member of a full bucket and settle the
    /// pending eviction either way. Bounded by the probe timeout, so table
    /// mutation is never blocked indefinitely.
    async fn run_eviction_check(self: Arc<Self>, lrs: PeerDescriptor, candidate: PeerDescriptor) {
        let responsive = tokio::time::timeout(
            self.config.eviction_probe_timeout,
            self.prober.probe(&lrs),
        )
        .await
        .unwrap_or(false);
        if self.stopped() {
            return;
        }
        let mut events = Vec::new();
        {
            let mut st = self.state.lock();
            let stamp = self.next_stamp();
            let outcome =
                st.bucket
                    .complete_eviction(candidate.clone(), &lrs.node_id, !responsive, stamp);
            if responsive {
                st.neighbors.set_state(&lrs.node_id, ContactState::Active);
            } else {
                debug!(peer = %lrs.node_id, "eviction probe failed, replacing contact");
                st.neighbors.remove_contact(&lrs.node_id);
                st.random.remove_contact(&lrs.node_id);
                st.open_internet.remove_contact(&lrs.node_id);
                if outcome.removed.is_some() {
                    self.locker
                        .weak_unlock_connection(&lrs, &self.weak_lock_token());
                    events.push(ContactEvent::ContactRemoved {
                        descriptor: lrs,
                        closest: self.closest_snapshot(&st),
                    });
                }
                if outcome.inserted {
                    self.locker
                        .weak_lock_connection(&candidate, &self.weak_lock_token());
                    events.push(ContactEvent::NewContact {
                        descriptor: candidate,
                        closest: self.closest_snapshot(&st),
                    });
                }
            }
        }
        self.emit(events);
    }

    /// Record a successful query against the contact.
    pub fn handle_peer_active(&self, id: &DhtAddress) {
        let mut st = self.state.lock();
        st.neighbors.set_state(id, ContactState::Active);
        st.open_internet.set_state(id, ContactState::Active);
        let stamp = self.next_stamp();
        st.bucket.touch(id, stamp);
    }

    /// Record a failed query; contacts beyond the retry budget are removed.
    pub fn handle_peer_unresponsive(&self, id: &DhtAddress) {
        let failures = {
            let mut st = self.state.lock();
            st.open_internet.record_failure(id);
            st.neighbors.record_failure(id)
        };
        match failures {
            Some(count) if count >= self.config.max_contact_failures => {
                debug!(peer = %id, failures = count, "contact exceeded retry budget");
                self.remove_contact(id);
            }
            _ => {}
        }
    }

    /// Drop the contact from every list. A freed bucket slot is backfilled
    /// with the closest active neighbor not yet in the bucket.
    pub fn remove_contact(&self, id: &DhtAddress) {
        let mut events = Vec::new();
        let mut unlock = None;
        {
            let mut st = self.state.lock();
            let descriptor = st
                .neighbors
                .get(id)
                .map(|c| c.descriptor().clone())
                .or_else(|| st.bucket.get(id));
            let in_bucket = st.bucket.remove(id);
            let was_neighbor = st.neighbors.remove_contact(id).is_some();
            st.random.remove_contact(id);
            st.open_internet.remove_contact(id);
            if let Some(descriptor) = descriptor {
                if in_bucket {
                    unlock = Some(descriptor.clone());
                }
                if in_bucket || was_neighbor {
                    events.push(ContactEvent::ContactRemoved {
                        descriptor,
                        closest: self.closest_snapshot(&st),
                    });
                }
            }
            if in_bucket {
                let stamp = self.next_stamp();
                let promoted = {
                    let State { neighbors, bucket, .. } = &mut *st;
                    neighbors
                        .closest_active_where(|nid| !bucket.contains(nid))
                        .filter(|promoted| {
                            matches!(
                                bucket.try_insert(promoted.clone(), stamp),
                                InsertOutcome::Inserted
                            )
                        })
                };
                if let Some(promoted) = promoted {
                    self.locker
                        .weak_lock_connection(&promoted, &self.weak_lock_token());
                    events.push(ContactEvent::NewContact {
                        descriptor: promoted,
                        closest: self.closest_snapshot(&st),
                    });
                }
            }
        }
        if let Some(descriptor) = unlock {
            self.locker
                .weak_unlock_connection(&descriptor, &self.weak_lock_token());
        }
        self.emit(events);
    }

    pub fn handle_connected(&self, descriptor: PeerDescriptor) {
        if descriptor.node_id == self.local.node_id {
            return;
        }
        self.state
            .lock()
            .connections
            .insert(descriptor.node_id, descriptor);
    }

    pub fn handle_disconnected(&self, descriptor: &PeerDescriptor, graceful: bool) {
        self.state.lock().connections.remove(&descriptor.node_id);
        if graceful {
            self.remove_contact(&descriptor.node_id);
        } else {
            // keep the contact but free its bucket slot so routing stops
            // picking a dead link
            let mut events = Vec::new();
            {
                let mut st = self.state.lock();
                if st.bucket.remove(&descriptor.node_id) {
                    events.push(ContactEvent::ContactRemoved {
                        descriptor: descriptor.clone(),
                        closest: self.closest_snapshot(&st),
                    });
                }
            }
            if !events.is_empty() {
                self.locker
                    .weak_unlock_connection(descriptor, &self.weak_lock_token());
            }
            self.emit(events);
        }
    }

    /// Up to `limit` known contacts ordered by ascending XOR distance to
    /// `target`, excluding the given ids and the local node.
    pub fn get_closest_contacts_to(
        &self,
        target: &DhtAddress,
        limit: usize,
        exclude: &HashSet<DhtAddress>,
    ) -> Vec<PeerDescriptor> {
        let st = self.state.lock();
        let mut seen = HashSet::new();
        let mut all: Vec<PeerDescriptor> = Vec::new();
        for descriptor in st
            .neighbors
            .all_descriptors()
            .into_iter()
            .chain(st.bucket.all_descriptors())
        {
            if descriptor.node_id == self.local.node_id || exclude.contains(&descriptor.node_id) {
                continue;
            }
            if seen.insert(descriptor.node_id) {
                all.push(descriptor);
            }
        }
        all.sort_by_key(|d| (target.distance_to(&d.node_id), d.node_id));
        all.truncate(limit);
        all
    }

    /// Same ordering, restricted to contacts currently believed connected.
    pub fn get_closest_neighbors_to(&self, target: &DhtAddress, limit: usize) -> Vec<PeerDescriptor> {
        let st = self.state.lock();
        let mut connected: Vec<PeerDescriptor> = st.connections.values().cloned().collect();
        connected.sort_by_key(|d| (target.distance_to(&d.node_id), d.node_id));
        connected.truncate(limit);
        connected
    }

    /// Number of neighbor-list contacts outside `exclude`; used by discovery
    /// sessions to detect an empty candidate set up front.
    pub fn nearby_contact_count(&self, exclude: &HashSet<DhtAddress>) -> usize {
        self.state
            .lock()
            .neighbors
            .all_ids()
            .iter()
            .filter(|id| !exclude.contains(id))
            .count()
    }

    pub fn neighbor_count(&self) -> usize {
        self.state.lock().neighbors.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.state.lock().bucket.count()
    }

    pub fn bucket_descriptors(&self) -> Vec<PeerDescriptor> {
        self.state.lock().bucket.all_descriptors()
    }

    pub fn random_contacts(&self, limit: usize) -> Vec<PeerDescriptor> {
        self.state.lock().random.contacts(limit)
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn local_descriptor(&self) -> &PeerDescriptor {
        &self.local
    }

    /// Clear the table and release all weak locks. Terminal.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let mut st = self.state.lock();
        for descriptor in st.bucket.all_descriptors() {
            self.locker
                .weak_unlock_connection(&descriptor, &self.weak_lock_token());
        }
        st.bucket.clear();
        st.neighbors.clear();
        st.open_internet.clear();
        st.random.clear();
        st.connections.clear();
    }
}

impl ClosestContactsProvider for PeerManager {
    fn closest_connected(
        &self,
        target: &DhtAddress,
        limit: usize,
        exclude: &HashSet<DhtAddress>,
    ) -> Vec<PeerDescriptor> {
        let st = self.state.lock();
        let mut connected: Vec<PeerDescriptor> = st
            .connections
            .values()
            .filter(|d| !exclude.contains(&d.node_id))
            .cloned()
            .collect();
        connected.sort_by_key(|d| (target.distance_to(&d.node_id), d.node_id));
        connected.truncate(limit);
        connected
    }
}
