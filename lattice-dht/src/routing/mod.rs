#![forbid(unsafe_code)]

//! Hop-by-hop message routing.
//!
//! The [`Router`] moves a message one hop closer to its destination: it
//! selects the connected contacts nearest the target (always strictly
//! closer than the local node, so cyclic topologies cannot loop), hands the
//! message to a [`RoutingSession`] that tries them in order, and answers the
//! previous hop with an acknowledgment. A sliding duplicate detector
//! suppresses re-processing of request ids that already passed through.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lattice_core::DhtAddress;
use lattice_transport::PeerDescriptor;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

pub mod duplicate;
pub mod session;

pub use duplicate::DuplicateDetector;
pub use session::RoutingSession;

use crate::rpc::DhtRpcClient;

/// Parallel branches a recursive-mode message fans out to at each hop, so
/// redundant routing paths can converge on the target neighborhood.
const RECURSIVE_BRANCH_COUNT: usize = 2;

/// The operations a recursive query can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecursiveOperation {
    FindNode,
    FetchData,
    DeleteData,
}

/// Payload of a routed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RoutedBody {
    /// Opaque bytes for the layer above the DHT.
    Application(Vec<u8>),
    /// A leg of a recursive operation.
    RecursiveOperation {
        session_id: String,
        operation: RecursiveOperation,
    },
}

/// A message in hop-by-hop transit toward `target`. Immutable in transit
/// except for the path appended at each hop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutedMessage {
    /// Id used for duplicate suppression.
    pub request_id: String,
    pub target: DhtAddress,
    pub source: PeerDescriptor,
    /// Hops already traversed, oldest first.
    pub routing_path: Vec<PeerDescriptor>,
    pub body: RoutedBody,
}

impl RoutedMessage {
    /// The hop this message arrived from, if any.
    pub fn previous_hop(&self) -> Option<&PeerDescriptor> {
        self.routing_path.last()
    }
}

/// Error kinds carried in a routing acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteError {
    /// No viable next hop.
    NoTargets,
    /// The request id was already routed here.
    Duplicate,
    /// The node is shutting down.
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteAck {
    pub error: Option<RouteError>,
}

impl RouteAck {
    pub fn ok() -> Self {
        Self { error: None }
    }

    pub fn with_error(error: RouteError) -> Self {
        Self { error: Some(error) }
    }
}

/// How a message is being routed; recursive legs report their progress back
/// to the originating session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMode {
    Forward,
    Recursive,
}

/// Source of next-hop candidates. The router deliberately sees only this
/// narrow surface of the peer manager so tests can substitute a fixed
/// topology.
pub trait ClosestContactsProvider: Send + Sync + 'static {
    fn closest_connected(
        &self,
        target: &DhtAddress,
        limit: usize,
        exclude: &HashSet<DhtAddress>,
    ) -> Vec<PeerDescriptor>;
}

pub struct Router {
    local: PeerDescriptor,
    provider: Arc<dyn ClosestContactsProvider>,
    rpc: Arc<DhtRpcClient>,
    detector: Mutex<DuplicateDetector>,
    candidate_limit: usize,
    stopped: AtomicBool,
}

impl Router {
    pub fn new(
        local: PeerDescriptor,
        provider: Arc<dyn ClosestContactsProvider>,
        rpc: Arc<DhtRpcClient>,
        candidate_limit: usize,
        detector_max_size: usize,
        detector_max_age: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            provider,
            rpc,
            detector: Mutex::new(DuplicateDetector::new(detector_max_size, detector_max_age)),
            candidate_limit,
            stopped: AtomicBool::new(false),
        })
    }

    /// Record a request id, reporting whether it was already routed here.
    pub fn check_and_mark_duplicate(&self, request_id: &str) -> bool {
        self.detector.lock().check_and_insert(request_id)
    }

    /// Select next hops for a message not destined to the local node and
    /// hand it to a forwarding session. The returned ack tells the previous
    /// hop whether the message was accepted.
    pub fn route(
        self: &Arc<Self>,
        message: RoutedMessage,
        mode: RoutingMode,
        excluded: Option<DhtAddress>,
    ) -> RouteAck {
        if self.stopped.load(Ordering::SeqCst) {
            return RouteAck::with_error(RouteError::Stopped);
        }
        debug_assert_ne!(message.target, self.local.node_id);

        let mut exclude: HashSet<DhtAddress> = HashSet::new();
        exclude.insert(self.local.node_id);
        exclude.insert(message.source.node_id);
        if let Some(excluded) = excluded {
            exclude.insert(excluded);
        }
        for hop in &message.routing_path {
            exclude.insert(hop.node_id);
        }

        let own_distance = self.local.node_id.distance_to(&message.target);
        let candidates: Vec<PeerDescriptor> = self
            .provider
            .closest_connected(&message.target, self.candidate_limit, &exclude)
            .into_iter()
            .filter(|d| d.node_id.distance_to(&message.target) < own_distance)
            .collect();
        if candidates.is_empty() {
            trace!(
                target = %message.target,
                request_id = %message.request_id,
                "no closer nodes found"
            );
            return RouteAck::with_error(RouteError::NoTargets);
        }

        let mut message = message;
        message.routing_path.push(self.local.clone());
        trace!(
            target = %message.target,
            request_id = %message.request_id,
            ?mode,
            candidates = candidates.len(),
            "routing message"
        );
        let branches = match mode {
            RoutingMode::Forward => 1,
            RoutingMode::Recursive => RECURSIVE_BRANCH_COUNT,
        };
        let session = RoutingSession::new(self.rpc.clone(), message, candidates, branches);
        tokio::spawn(async move {
            if let Err(e) = session.run().await {
                debug!(error = %e, "routing session exhausted all candidates");
            }
        });
        RouteAck::ok()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::DHT_ADDRESS_LENGTH;
    use lattice_transport::{PeerDescriptor, Simulator, Transport};
    use uuid::Uuid;

    struct FixedProvider {
        peers: Vec<PeerDescriptor>,
    }

    impl ClosestContactsProvider for FixedProvider {
        fn closest_connected(
            &self,
            target: &DhtAddress,
            limit: usize,
            exclude: &HashSet<DhtAddress>,
        ) -> Vec<PeerDescriptor> {
            let mut peers: Vec<PeerDescriptor> = self
                .peers
                .iter()
                .filter(|d| !exclude.contains(&d.node_id))
                .cloned()
                .collect();
            peers.sort_by_key(|d| target.distance_to(&d.node_id));
            peers.truncate(limit);
            peers
        }
    }

    fn addr(lead: u8) -> DhtAddress {
        let mut raw = [0u8; DHT_ADDRESS_LENGTH];
        raw[0] = lead;
        DhtAddress::new(raw)
    }

    fn router(local: PeerDescriptor, peers: Vec<PeerDescriptor>) -> Arc<Router> {
        let sim = Simulator::new();
        let transport = sim.create_transport(local.clone());
        let transport: Arc<dyn Transport> = transport;
        let rpc = Arc::new(DhtRpcClient::new(
            transport,
            "layer0".into(),
            Duration::from_millis(100),
        ));
        Router::new(
            local,
            Arc::new(FixedProvider { peers }),
            rpc,
            3,
            128,
            Duration::from_secs(60),
        )
    }

    fn message(target: DhtAddress, source: PeerDescriptor) -> RoutedMessage {
        RoutedMessage {
            request_id: Uuid::new_v4().to_string(),
            target,
            source,
            routing_path: Vec::new(),
            body: RoutedBody::Application(vec![1, 2, 3]),
        }
    }

    #[tokio::test]
    async fn no_candidates_yields_no_targets() {
        let local = PeerDescriptor::new(addr(0x01));
        let router = router(local.clone(), Vec::new());
        let ack = router.route(message(addr(0x7f), local), RoutingMode::Forward, None);
        assert_eq!(ack.error, Some(RouteError::NoTargets));
    }

    #[tokio::test]
    async fn farther_peers_are_not_viable_hops() {
        // only known peer is farther from the target than the local node
        let local = PeerDescriptor::new(addr(0x10));
        let far = PeerDescriptor::new(addr(0x70));
        let router = router(local.clone(), vec![far]);
        let ack = router.route(message(addr(0x11), local), RoutingMode::Forward, None);
        assert_eq!(ack.error, Some(RouteError::NoTargets));
    }

    #[tokio::test]
    async fn duplicate_detection_is_idempotent() {
        let local = PeerDescriptor::new(addr(0x01));
        let router = router(local, Vec::new());
        assert!(!router.check_and_mark_duplicate("req-1"));
        assert!(router.check_and_mark_duplicate("req-1"));
        assert!(!router.check_and_mark_duplicate("req-2"));
    }

    #[tokio::test]
    async fn stopped_router_rejects_messages() {
        let local = PeerDescriptor::new(addr(0x01));
        let router = router(local.clone(), Vec::new());
        router.stop();
        let ack = router.route(message(addr(0x7f), local), RoutingMode::Forward, None);
        assert_eq!(ack.error, Some(RouteError::Stopped));
    }
}
