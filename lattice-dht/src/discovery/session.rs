#![forbid(unsafe_code)]

//! One bounded iterative closest-node lookup.
//!
//! The session repeatedly asks the closest uncontacted candidates for their
//! closest peers, feeding every answer back into the peer manager. It ends
//! when the candidate set is exhausted, when enough rounds pass without the
//! closest known neighbor improving, or when the caller's timeout fires.
//! The shared `contacted` set guarantees no node id is ever queried twice,
//! including across parallel sessions of the same join.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use lattice_core::{DhtAddress, Distance};
use lattice_transport::PeerDescriptor;
use parking_lot::Mutex;
use tracing::trace;
use uuid::Uuid;

use crate::peer_manager::PeerManager;
use crate::rpc::DhtRpcClient;

#[derive(Debug, Clone)]
pub struct DiscoverySessionConfig {
    pub target: DhtAddress,
    pub parallelism: usize,
    pub no_progress_limit: u32,
}

pub struct DiscoverySession {
    id: String,
    config: DiscoverySessionConfig,
    peer_manager: Arc<PeerManager>,
    rpc: Arc<DhtRpcClient>,
    contacted: Arc<Mutex<HashSet<DhtAddress>>>,
    aborted: Arc<AtomicBool>,
}

impl DiscoverySession {
    pub fn new(
        config: DiscoverySessionConfig,
        peer_manager: Arc<PeerManager>,
        rpc: Arc<DhtRpcClient>,
        contacted: Arc<Mutex<HashSet<DhtAddress>>>,
        aborted: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            config,
            peer_manager,
            rpc,
            contacted,
            aborted,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn closest_distance(&self) -> Distance {
        self.peer_manager
            .get_closest_contacts_to(&self.config.target, 1, &HashSet::new())
            .first()
            .map(|d| self.config.target.distance_to(&d.node_id))
            .unwrap_or(Distance::MAX)
    }

    /// Drive the lookup to convergence. The caller bounds the wall clock.
    pub async fn run(&self) {
        {
            let contacted = self.contacted.lock();
            if self.peer_manager.nearby_contact_count(&contacted) == 0 {
                return;
            }
        }
        let mut no_progress: u32 = 0;
        loop {
            if self.aborted.load(Ordering::SeqCst) {
                return;
            }
            if no_progress >= self.config.no_progress_limit {
                trace!(session = %self.id, "discovery stopped making progress");
                return;
            }
            let batch = {
                let contacted = self.contacted.lock();
                self.peer_manager.get_closest_contacts_to(
                    &self.config.target,
                    self.config.parallelism,
                    &contacted,
                )
            };
            if batch.is_empty() {
                trace!(session = %self.id, "no uncontacted candidates left");
                return;
            }
            {
                let mut contacted = self.contacted.lock();
                for peer in &batch {
                    contacted.insert(peer.node_id);
                }
            }
            let before = self.closest_distance();
            let responses = join_all(batch.iter().map(|peer| async move {
                (
                    peer.clone(),
                    self.rpc
                        .get_closest_peers(peer, self.config.target)
                        .await,
                )
            }))
            .await;
            if self.aborted.load(Ordering::SeqCst) {
                return;
            }
            for (peer, response) in responses {
                match response {
                    Ok(contacts) => {
                        self.peer_manager.handle_peer_active(&peer.node_id);
                        self.peer_manager.handle_new_peers(contacts);
                    }
                    Err(e) => {
                        trace!(peer = %peer.node_id, error = %e, "closest-peers query failed");
                        self.peer_manager.handle_peer_unresponsive(&peer.node_id);
                    }
                }
            }
            if self.closest_distance() >= before {
                no_progress += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer_manager::{LivenessProber, PeerManagerConfig};
    use async_trait::async_trait;
    use lattice_core::DHT_ADDRESS_LENGTH;
    use lattice_transport::{ConnectionLocker, Simulator, Transport};
    use std::time::Duration;

    struct NoopProber;

    #[async_trait]
    impl LivenessProber for NoopProber {
        async fn probe(&self, _target: &PeerDescriptor) -> bool {
            true
        }
    }

    struct NoopLocker;

    impl ConnectionLocker for NoopLocker {
        fn lock_connection(&self, _target: &PeerDescriptor, _lock_id: &str) {}
        fn unlock_connection(&self, _target: &PeerDescriptor, _lock_id: &str) {}
        fn weak_lock_connection(&self, _target: &PeerDescriptor, _lock_id: &str) {}
        fn weak_unlock_connection(&self, _target: &PeerDescriptor, _lock_id: &str) {}
    }

    fn addr(lead: u8) -> DhtAddress {
        let mut raw = [0u8; DHT_ADDRESS_LENGTH];
        raw[0] = lead;
        DhtAddress::new(raw)
    }

    #[tokio::test]
    async fn empty_candidate_set_ends_immediately() {
        let sim = Simulator::new();
        let local = PeerDescriptor::new(addr(0x01));
        let transport: Arc<dyn Transport> = sim.create_transport(local.clone());
        let pm = crate::peer_manager::PeerManager::new(
            local,
            PeerManagerConfig {
                service_id: "layer0".into(),
                nodes_per_bucket: 8,
                max_neighbor_list_size: 64,
                closest_contacts_limit: 5,
                max_contact_failures: 2,
                random_contact_probability: 0.0,
                eviction_probe_timeout: Duration::from_millis(50),
            },
            Arc::new(NoopProber),
            Arc::new(NoopLocker),
        );
        let rpc = Arc::new(DhtRpcClient::new(
            transport,
            "layer0".into(),
            Duration::from_millis(50),
        ));
        let session = DiscoverySession::new(
            DiscoverySessionConfig {
                target: addr(0x7f),
                parallelism: 1,
                no_progress_limit: 1,
            },
            pm,
            rpc,
            Arc::new(Mutex::new(HashSet::new())),
            Arc::new(AtomicBool::new(false)),
        );
        // no candidates known: must return without issuing any RPC
        tokio::time::timeout(Duration::from_millis(100), session.run())
            .await
            .expect("session ended on its own");
    }
}
