#![forbid(unsafe_code)]

//! Key-value storage and replication.
//!
//! [`LocalDataStore`] holds this node's share of entries; [`StoreManager`]
//! decides where entries belong. Stores fan out to the redundancy-factor
//! closest nodes found by a recursive FIND_NODE; afterwards the manager
//! reacts to routing-table changes: when a new contact enters the closest-R
//! set of a key this node is primary for, the entry is replicated to it,
//! and when the new arrival pushes this node out of the closest-R set the
//! local copy is soft-marked stale. Replication RPCs are fire-and-forget
//! with logged failures; they never block contact admission.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lattice_core::{DhtAddress, DhtConfig, DhtResult};
use lattice_transport::PeerDescriptor;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

pub mod local;

pub use local::{DataEntry, LocalDataStore};

use crate::peer_manager::{ContactEvent, PeerManager};
use crate::routing::RecursiveOperation;
use crate::rpc::DhtRpcClient;
use crate::recursive::RecursiveOperationManager;

/// What a routing-table change means for one locally held entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationAction {
    /// This node is the entry's primary storer and the new peer entered the
    /// closest-R set: hand it a replica.
    Replicate,
    /// The new peer displaced this node beyond the closest-R set: the local
    /// copy is no longer this node's responsibility.
    MarkStale,
    Ignore,
}

/// Rank `{local} ∪ neighbors` against the key, with and without the new
/// peer, and derive the action. Distances never tie (XOR metric), node id
/// order is the formal tie-break.
pub fn replication_action(
    local_id: &DhtAddress,
    key: &DhtAddress,
    neighbors: &[PeerDescriptor],
    new_peer: &DhtAddress,
    redundancy: usize,
) -> ReplicationAction {
    let mut before: Vec<DhtAddress> = neighbors
        .iter()
        .map(|d| d.node_id)
        .filter(|id| id != new_peer && id != local_id)
        .collect();
    before.push(*local_id);
    before.sort_by_key(|id| (key.distance_to(id), *id));
    let local_before = before
        .iter()
        .position(|id| id == local_id)
        .expect("local id ranked");

    let mut after = before.clone();
    after.push(*new_peer);
    after.sort_by_key(|id| (key.distance_to(id), *id));
    let local_after = after
        .iter()
        .position(|id| id == local_id)
        .expect("local id ranked");
    let new_peer_rank = after
        .iter()
        .position(|id| id == new_peer)
        .expect("new peer ranked");

    if after[0] == *local_id && new_peer_rank < redundancy {
        ReplicationAction::Replicate
    } else if local_before < redundancy && local_after >= redundancy {
        ReplicationAction::MarkStale
    } else {
        ReplicationAction::Ignore
    }
}

#[derive(Debug, Clone)]
pub struct StoreManagerConfig {
    pub redundancy_factor: usize,
    pub store_ttl: Duration,
    pub ttl_sweep_interval: Duration,
    /// Breadth of the closest-contacts snapshot used for ranking decisions.
    pub ranking_breadth: usize,
}

impl From<&DhtConfig> for StoreManagerConfig {
    fn from(cfg: &DhtConfig) -> Self {
        Self {
            redundancy_factor: cfg.redundancy_factor,
            store_ttl: Duration::from_millis(cfg.store_ttl_ms),
            ttl_sweep_interval: Duration::from_millis(cfg.ttl_sweep_interval_ms),
            ranking_breadth: cfg.redundancy_factor * 2,
        }
    }
}

pub struct StoreManager {
    local: PeerDescriptor,
    config: StoreManagerConfig,
    rpc: Arc<DhtRpcClient>,
    local_store: Arc<LocalDataStore>,
    recursive: Arc<RecursiveOperationManager>,
    peer_manager: Arc<PeerManager>,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StoreManager {
    pub fn new(
        local: PeerDescriptor,
        config: StoreManagerConfig,
        rpc: Arc<DhtRpcClient>,
        local_store: Arc<LocalDataStore>,
        recursive: Arc<RecursiveOperationManager>,
        peer_manager: Arc<PeerManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            config,
            rpc,
            local_store,
            recursive,
            peer_manager,
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Start the TTL sweep and the contact-event subscription.
    pub fn start(self: &Arc<Self>) {
        let sweeper = {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(this.config.ttl_sweep_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if this.stopped() {
                        break;
                    }
                    let removed = this.local_store.sweep_expired();
                    if removed > 0 {
                        trace!(removed, "expired entries purged");
                    }
                }
            })
        };
        let subscriber = {
            let this = Arc::clone(self);
            let mut events = self.peer_manager.subscribe();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(ContactEvent::NewContact { descriptor, .. }) => {
                            this.on_new_contact(&descriptor);
                        }
                        Ok(ContactEvent::ContactRemoved { .. }) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "contact event stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };
        self.tasks.lock().extend([sweeper, subscriber]);
    }

    /// Store `payload` under `key` on the closest-R nodes. Returns the nodes
    /// that accepted, which may be fewer than the redundancy factor.
    pub async fn store_data(
        &self,
        key: DhtAddress,
        payload: Vec<u8>,
    ) -> DhtResult<Vec<PeerDescriptor>> {
        info!(%key, "storing data");
        let found = self
            .recursive
            .execute(key, RecursiveOperation::FindNode, None, true)
            .await?;
        let mut successful = Vec::new();
        for node in found.closest_nodes {
            if successful.len() >= self.config.redundancy_factor {
                break;
            }
            if node.node_id == self.local.node_id {
                self.local_store.store_entry(DataEntry::new(
                    key,
                    self.local.node_id,
                    payload.clone(),
                    self.config.store_ttl,
                ));
                successful.push(node);
                continue;
            }
            match self
                .rpc
                .store_data(&node, key, payload.clone(), self.config.store_ttl)
                .await
            {
                Ok(()) => successful.push(node),
                Err(e) => debug!(peer = %node.node_id, error = %e, "store call failed"),
            }
        }
        Ok(successful)
    }

    /// Fetch all entries stored under `key` across the overlay.
    pub async fn get_data(&self, key: DhtAddress) -> DhtResult<Vec<DataEntry>> {
        let result = self
            .recursive
            .execute(key, RecursiveOperation::FetchData, None, true)
            .await?;
        Ok(result.data_entries)
    }

    /// Tombstone this node's entry under `key` across the overlay. The
    /// recursive leg is fire-and-forget.
    pub async fn delete_data(&self, key: DhtAddress) -> DhtResult<()> {
        self.recursive
            .execute(key, RecursiveOperation::DeleteData, None, false)
            .await?;
        Ok(())
    }

    /// Inbound store call: the caller becomes the entry's creator.
    pub fn handle_store_request(
        &self,
        source: &PeerDescriptor,
        key: DhtAddress,
        payload: Vec<u8>,
        ttl: Duration,
    ) {
        self.local_store
            .store_entry(DataEntry::new(key, source.node_id, payload, ttl));
    }

    /// Inbound replica hand-over: keep the entry and pass it further along
    /// the closest-R set when appropriate.
    pub fn handle_replicate_request(&self, source: &PeerDescriptor, entry: DataEntry) {
        self.local_store.store_entry(entry.clone());
        self.replicate_to_neighbors_if_needed(source, &entry);
    }

    /// Replication reaction to a contact admission. Decisions for each key
    /// are computed against one consistent closest-contacts snapshot.
    fn on_new_contact(&self, new_peer: &PeerDescriptor) {
        if self.stopped() {
            return;
        }
        let exclude: HashSet<DhtAddress> = [new_peer.node_id].into_iter().collect();
        for entry in self.local_store.snapshot() {
            let neighbors = self.peer_manager.get_closest_contacts_to(
                &entry.key,
                self.config.ranking_breadth,
                &exclude,
            );
            match replication_action(
                &self.local.node_id,
                &entry.key,
                &neighbors,
                &new_peer.node_id,
                self.config.redundancy_factor,
            ) {
                ReplicationAction::Replicate => {
                    debug!(key = %entry.key, peer = %new_peer.node_id, "replicating to new contact");
                    self.replicate_entry(new_peer.clone(), entry);
                }
                ReplicationAction::MarkStale => {
                    debug!(key = %entry.key, "no longer responsible, marking stale");
                    self.local_store.set_stale(&entry.key, &entry.creator);
                }
                ReplicationAction::Ignore => {}
            }
        }
    }

    /// Forward a received replica: the primary hands it to every holder in
    /// the closest-R set, everyone else only corrects toward the primary.
    fn replicate_to_neighbors_if_needed(&self, incoming: &PeerDescriptor, entry: &DataEntry) {
        let mut ranked = self.peer_manager.get_closest_contacts_to(
            &entry.key,
            self.config.ranking_breadth,
            &HashSet::new(),
        );
        ranked.push(self.local.clone());
        ranked.sort_by_key(|d| (entry.key.distance_to(&d.node_id), d.node_id));

        let primary = match ranked.first() {
            Some(primary) => primary.clone(),
            None => return,
        };
        if primary.node_id == self.local.node_id {
            for holder in ranked.iter().take(self.config.redundancy_factor) {
                if holder.node_id == self.local.node_id || holder.node_id == incoming.node_id {
                    continue;
                }
                self.replicate_entry(holder.clone(), entry.clone());
            }
        } else if primary.node_id != incoming.node_id {
            self.replicate_entry(primary, entry.clone());
        }
    }

    fn replicate_entry(&self, target: PeerDescriptor, entry: DataEntry) {
        if self.stopped() {
            return;
        }
        let rpc = self.rpc.clone();
        tokio::spawn(async move {
            if let Err(e) = rpc.replicate_data(&target, entry).await {
                debug!(peer = %target.node_id, error = %e, "replication failed");
            }
        });
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
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

    fn descriptors(leads: &[u8]) -> Vec<PeerDescriptor> {
        leads.iter().map(|l| PeerDescriptor::new(addr(*l))).collect()
    }

    // Five nodes at distances 0x10 < 0x20 < 0x30 < 0x40 < 0x50 from the
    // key, redundancy factor 3.
    const KEY_LEAD: u8 = 0x00;
    const R: usize = 3;

    #[test]
    fn primary_replicates_to_peer_entering_closest_r() {
        let key = addr(KEY_LEAD);
        let local = addr(0x10);
        let neighbors = descriptors(&[0x20, 0x30, 0x40, 0x50]);
        let new_peer = addr(0x15);
        assert_eq!(
            replication_action(&local, &key, &neighbors, &new_peer, R),
            ReplicationAction::Replicate
        );
    }

    #[test]
    fn holder_remaining_within_r_does_nothing() {
        let key = addr(KEY_LEAD);
        let local = addr(0x20);
        let neighbors = descriptors(&[0x10, 0x30, 0x40, 0x50]);
        let new_peer = addr(0x15);
        assert_eq!(
            replication_action(&local, &key, &neighbors, &new_peer, R),
            ReplicationAction::Ignore
        );
    }

    #[test]
    fn holder_displaced_beyond_r_goes_stale() {
        let key = addr(KEY_LEAD);
        let local = addr(0x30);
        let neighbors = descriptors(&[0x10, 0x20, 0x40, 0x50]);
        let new_peer = addr(0x15);
        assert_eq!(
            replication_action(&local, &key, &neighbors, &new_peer, R),
            ReplicationAction::MarkStale
        );
    }

    #[test]
    fn distant_arrival_changes_nothing() {
        let key = addr(KEY_LEAD);
        let new_peer = addr(0x60);
        for (local_lead, others) in [
            (0x10u8, vec![0x20u8, 0x30, 0x40, 0x50]),
            (0x30, vec![0x10, 0x20, 0x40, 0x50]),
        ] {
            assert_eq!(
                replication_action(
                    &addr(local_lead),
                    &key,
                    &descriptors(&others),
                    &new_peer,
                    R
                ),
                ReplicationAction::Ignore
            );
        }
    }

    #[test]
    fn non_primary_never_replicates_to_the_new_peer() {
        let key = addr(KEY_LEAD);
        // local is second-closest; a new peer enters within R but only the
        // primary may replicate
        let local = addr(0x20);
        let neighbors = descriptors(&[0x10, 0x30, 0x40, 0x50]);
        let new_peer = addr(0x25);
        assert_ne!(
            replication_action(&local, &key, &neighbors, &new_peer, R),
            ReplicationAction::Replicate
        );
    }
}
