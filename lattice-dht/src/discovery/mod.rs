#![forbid(unsafe_code)]

//! Network join and routing-table upkeep.
//!
//! [`PeerDiscovery`] seeds the table from bootstrap entry points, drives the
//! discovery sessions of the initial join (one toward the local address to
//! find the real neighborhood, one toward a random address to diversify the
//! non-neighbor buckets), keeps the table fresh with a periodic refresh, and
//! rejoins with capped exponential backoff whenever the node finds itself
//! isolated. Background failures are logged and retried; only the caller of
//! the initial join sees a timeout error.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use lattice_core::{DhtAddress, DhtConfig, DhtError, DhtResult};
use lattice_transport::{ConnectionLocker, PeerDescriptor};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

pub mod session;

pub use session::{DiscoverySession, DiscoverySessionConfig};

use crate::peer_manager::PeerManager;
use crate::rpc::DhtRpcClient;

#[derive(Debug, Clone)]
pub struct PeerDiscoveryConfig {
    pub service_id: String,
    pub parallelism: usize,
    pub no_progress_limit: u32,
    pub join_timeout: Duration,
    pub refresh_interval: Duration,
    pub rejoin_base_delay: Duration,
    pub rejoin_max_delay: Duration,
}

impl From<&DhtConfig> for PeerDiscoveryConfig {
    fn from(cfg: &DhtConfig) -> Self {
        Self {
            service_id: cfg.service_id.clone(),
            parallelism: cfg.parallelism,
            no_progress_limit: cfg.no_progress_limit,
            join_timeout: cfg.join_timeout(),
            refresh_interval: Duration::from_millis(cfg.table_refresh_interval_ms),
            rejoin_base_delay: Duration::from_millis(cfg.rejoin_base_delay_ms),
            rejoin_max_delay: Duration::from_millis(cfg.rejoin_max_delay_ms),
        }
    }
}

pub struct PeerDiscovery {
    local: PeerDescriptor,
    config: PeerDiscoveryConfig,
    peer_manager: Arc<PeerManager>,
    rpc: Arc<DhtRpcClient>,
    locker: Arc<dyn ConnectionLocker>,
    /// Node ids queried by any session of the current join.
    contacted: Arc<Mutex<HashSet<DhtAddress>>>,
    join_called: AtomicBool,
    ongoing_sessions: AtomicUsize,
    rejoin_ongoing: AtomicBool,
    refresh_started: AtomicBool,
    aborted: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerDiscovery {
    pub fn new(
        local: PeerDescriptor,
        config: PeerDiscoveryConfig,
        peer_manager: Arc<PeerManager>,
        rpc: Arc<DhtRpcClient>,
        locker: Arc<dyn ConnectionLocker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            config,
            peer_manager,
            rpc,
            locker,
            contacted: Arc::new(Mutex::new(HashSet::new())),
            join_called: AtomicBool::new(false),
            ongoing_sessions: AtomicUsize::new(0),
            rejoin_ongoing: AtomicBool::new(false),
            refresh_started: AtomicBool::new(false),
            aborted: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn stopped(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn join_lock_token(&self) -> String {
        format!("{}::join_dht", self.config.service_id)
    }

    /// Join the overlay through the given entry points. Runs one session
    /// targeting the local address and one targeting a random address; the
    /// entry points stay connection-locked for the duration.
    pub async fn join_dht(
        self: &Arc<Self>,
        entry_points: &[PeerDescriptor],
        do_random_join: bool,
    ) -> DhtResult<()> {
        if self.stopped() {
            return Err(DhtError::Stopped);
        }
        self.join_called.store(true, Ordering::SeqCst);
        let entry_points: Vec<PeerDescriptor> = entry_points
            .iter()
            .filter(|ep| ep.node_id != self.local.node_id)
            .cloned()
            .collect();
        if entry_points.is_empty() {
            // a lone first node has nothing to join
            return Ok(());
        }
        info!(
            entry_point = %entry_points[0].node_id,
            service = %self.config.service_id,
            "joining the dht"
        );
        let token = self.join_lock_token();
        for entry_point in &entry_points {
            self.locker.lock_connection(entry_point, &token);
            self.peer_manager.add_contact(entry_point.clone());
        }

        let mut targets = vec![self.local.node_id];
        if do_random_join {
            targets.push(DhtAddress::random());
        }
        let mut result = Ok(());
        for target in targets {
            let session = DiscoverySession::new(
                DiscoverySessionConfig {
                    target,
                    parallelism: self.config.parallelism,
                    no_progress_limit: self.config.no_progress_limit,
                },
                self.peer_manager.clone(),
                self.rpc.clone(),
                self.contacted.clone(),
                self.aborted.clone(),
            );
            self.ongoing_sessions.fetch_add(1, Ordering::SeqCst);
            let timed_out = tokio::time::timeout(self.config.join_timeout, session.run())
                .await
                .is_err();
            self.ongoing_sessions.fetch_sub(1, Ordering::SeqCst);
            if timed_out {
                debug!(service = %self.config.service_id, "dht join timed out");
                result = Err(DhtError::Timeout("dht join"));
                break;
            }
        }

        for entry_point in &entry_points {
            self.locker.unlock_connection(entry_point, &token);
        }
        if !self.stopped() {
            if self.peer_manager.neighbor_count() == 0 {
                // still isolated; retry in the background unless a rejoin
                // is already driving this join
                if !self.rejoin_ongoing.load(Ordering::SeqCst) {
                    self.schedule_rejoin(entry_points[0].clone(), self.config.rejoin_base_delay);
                }
            } else {
                self.ensure_refresh_running();
            }
        }
        result
    }

    /// Re-enter the overlay after isolation. Clears the contacted state of
    /// the previous join and retries with growing delay on failure; never
    /// gives up while the node is running.
    pub async fn rejoin_dht(self: &Arc<Self>, entry_point: PeerDescriptor) {
        self.rejoin_with_delay(entry_point, self.config.rejoin_base_delay)
            .await;
    }

    async fn rejoin_with_delay(self: &Arc<Self>, entry_point: PeerDescriptor, delay: Duration) {
        if self.stopped() || self.rejoin_ongoing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(service = %self.config.service_id, "rejoining the dht");
        self.contacted.lock().clear();
        let result = self.join_dht(std::slice::from_ref(&entry_point), true).await;
        self.rejoin_ongoing.store(false, Ordering::SeqCst);
        let joined = result.is_ok() && self.peer_manager.neighbor_count() > 0;
        if joined {
            info!(service = %self.config.service_id, "rejoined the dht");
        } else if !self.stopped() {
            warn!(service = %self.config.service_id, "rejoin failed, backing off");
            let next = (delay * 2).min(self.config.rejoin_max_delay);
            self.schedule_rejoin(entry_point, next);
        }
    }

    fn schedule_rejoin(self: &Arc<Self>, entry_point: PeerDescriptor, delay: Duration) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !this.stopped() {
                this.rejoin_with_delay(entry_point, delay).await;
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Periodically re-query the closest known contacts for their closest
    /// peers to counteract topology drift.
    fn ensure_refresh_running(self: &Arc<Self>) {
        if self.refresh_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.refresh_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick fires immediately; skip it, the join just ran
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if this.stopped() {
                    break;
                }
                this.refresh_table().await;
            }
        });
        self.tasks.lock().push(handle);
    }

    async fn refresh_table(&self) {
        let neighbors = self
            .peer_manager
            .get_closest_neighbors_to(&self.local.node_id, self.config.parallelism);
        trace!(count = neighbors.len(), "refreshing routing table");
        let results = join_all(neighbors.iter().map(|peer| async move {
            (
                peer.clone(),
                self.rpc.get_closest_peers(peer, self.local.node_id).await,
            )
        }))
        .await;
        for (peer, result) in results {
            match result {
                Ok(contacts) => {
                    self.peer_manager.handle_peer_active(&peer.node_id);
                    self.peer_manager.handle_new_peers(contacts);
                }
                Err(e) => {
                    debug!(peer = %peer.node_id, error = %e, "table refresh query failed");
                    self.peer_manager.handle_peer_unresponsive(&peer.node_id);
                }
            }
        }
    }

    pub fn is_join_ongoing(&self) -> bool {
        if !self.join_called.load(Ordering::SeqCst) {
            return true;
        }
        self.ongoing_sessions.load(Ordering::SeqCst) > 0
    }

    pub fn is_join_called(&self) -> bool {
        self.join_called.load(Ordering::SeqCst)
    }

    /// Abort sessions and background loops. Terminal.
    pub fn stop(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
