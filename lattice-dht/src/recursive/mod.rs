#![forbid(unsafe_code)]

//! Recursive operation coordination.
//!
//! A recursive operation (FIND_NODE, FETCH_DATA, DELETE_DATA) is a logical
//! query that must visit the nodes nearest a target address. The manager
//! wraps the query in a routed message and rides the [`Router`]: every node
//! along the path contributes its closest connected contacts, any locally
//! stored matching entries, and a "no closer nodes found" flag, reported
//! back to the originating session. DELETE_DATA tombstones the originator's
//! entry at every node the path touches instead of shipping a deletion
//! payload.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lattice_core::{DhtAddress, DhtError, DhtResult};
use lattice_transport::PeerDescriptor;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use uuid::Uuid;

pub mod session;

pub use session::{RecursiveOperationResult, RecursiveOperationSession};

use crate::peer_manager::PeerManager;
use crate::routing::{
    RecursiveOperation, RouteAck, RouteError, RoutedBody, RoutedMessage, Router, RoutingMode,
};
use crate::rpc::DhtRpcClient;
use crate::store::{DataEntry, LocalDataStore};

/// Grace period that lets the router hand off a fire-and-forget operation
/// before the session is torn down.
const FIRE_AND_FORGET_GRACE: Duration = Duration::from_millis(50);

pub struct RecursiveOperationManager {
    local: PeerDescriptor,
    router: Arc<Router>,
    peer_manager: Arc<PeerManager>,
    local_data_store: Arc<LocalDataStore>,
    rpc: Arc<DhtRpcClient>,
    sessions: Mutex<HashMap<String, Arc<RecursiveOperationSession>>>,
    operation_timeout: Duration,
    closest_limit: usize,
    stopped: AtomicBool,
}

impl RecursiveOperationManager {
    pub fn new(
        local: PeerDescriptor,
        router: Arc<Router>,
        peer_manager: Arc<PeerManager>,
        local_data_store: Arc<LocalDataStore>,
        rpc: Arc<DhtRpcClient>,
        operation_timeout: Duration,
        closest_limit: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            router,
            peer_manager,
            local_data_store,
            rpc,
            sessions: Mutex::new(HashMap::new()),
            operation_timeout,
            closest_limit,
            stopped: AtomicBool::new(false),
        })
    }

    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Run one recursive operation against `target`. On timeout the partial
    /// result accumulated so far is returned rather than an error; with
    /// `wait_for_completion` unset the call returns right after the message
    /// left the router.
    pub async fn execute(
        self: &Arc<Self>,
        target: DhtAddress,
        operation: RecursiveOperation,
        excluded: Option<DhtAddress>,
        wait_for_completion: bool,
    ) -> DhtResult<RecursiveOperationResult> {
        if self.stopped() {
            return Err(DhtError::Stopped);
        }
        let connections = self.peer_manager.connection_count();
        let waited_completions = if connections > 1 { 2 } else { 1 };
        let session = Arc::new(RecursiveOperationSession::new(
            target,
            operation,
            waited_completions,
        ));

        // Degenerate single-node network: resolve from local state only,
        // without waiting for hops that cannot exist.
        if connections == 0 {
            trace!(%target, "no connections, resolving recursive operation locally");
            let entries = match operation {
                RecursiveOperation::FetchData => self.local_data_store.get_entries(&target),
                _ => Vec::new(),
            };
            if operation == RecursiveOperation::DeleteData {
                self.local_data_store
                    .mark_as_deleted(&target, &self.local.node_id);
            }
            session.on_response(vec![self.local.clone()], Vec::new(), entries, true);
            return Ok(session.results());
        }

        self.sessions
            .lock()
            .insert(session.id().to_string(), session.clone());
        let message = RoutedMessage {
            request_id: Uuid::new_v4().to_string(),
            target,
            source: self.local.clone(),
            routing_path: Vec::new(),
            body: RoutedBody::RecursiveOperation {
                session_id: session.id().to_string(),
                operation,
            },
        };
        // the local node acts as the first hop
        let ack = self.handle_route_request(message, excluded);
        if let Some(error) = ack.error {
            trace!(?error, "recursive operation did not leave the local node");
        }

        if wait_for_completion {
            if tokio::time::timeout(self.operation_timeout, session.wait_completed())
                .await
                .is_err()
            {
                debug!(%target, ?operation, "recursive operation timed out, returning partial result");
            }
        } else {
            tokio::time::sleep(FIRE_AND_FORGET_GRACE).await;
        }

        match operation {
            RecursiveOperation::FetchData => {
                let entries = self.local_data_store.get_entries(&target);
                if !entries.is_empty() {
                    session.on_response(Vec::new(), vec![self.local.clone()], entries, false);
                }
            }
            RecursiveOperation::DeleteData => {
                self.local_data_store
                    .mark_as_deleted(&target, &self.local.node_id);
            }
            RecursiveOperation::FindNode => {}
        }

        self.sessions.lock().remove(session.id());
        session.complete();
        Ok(session.results())
    }

    /// Handle one recursive leg arriving at this node, either from the
    /// local `execute` or from a remote hop.
    pub fn handle_route_request(
        self: &Arc<Self>,
        message: RoutedMessage,
        excluded: Option<DhtAddress>,
    ) -> RouteAck {
        if self.stopped() {
            return RouteAck::with_error(RouteError::Stopped);
        }
        let (session_id, operation) = match &message.body {
            RoutedBody::RecursiveOperation { session_id, operation } => {
                (session_id.clone(), *operation)
            }
            RoutedBody::Application(_) => {
                warn!("non-recursive message reached the recursive handler");
                return RouteAck::with_error(RouteError::NoTargets);
            }
        };
        if self.router.check_and_mark_duplicate(&message.request_id)
            && message.source.node_id != self.local.node_id
        {
            return RouteAck::with_error(RouteError::Duplicate);
        }
        self.peer_manager.add_contact(message.source.clone());

        let closest = self
            .peer_manager
            .get_closest_neighbors_to(&message.target, self.closest_limit);
        let entries = match operation {
            RecursiveOperation::FetchData => self.local_data_store.get_entries(&message.target),
            _ => Vec::new(),
        };
        if operation == RecursiveOperation::DeleteData {
            self.local_data_store
                .mark_as_deleted(&message.target, &message.source.node_id);
        }

        if message.target == self.local.node_id {
            // terminal node of the query
            self.send_response(
                &message.source,
                session_id,
                message.routing_path.clone(),
                closest,
                entries,
                true,
            );
            return RouteAck::ok();
        }

        let ack = self
            .router
            .route(message.clone(), RoutingMode::Recursive, excluded);
        match ack.error {
            None | Some(RouteError::NoTargets) => {
                let no_closer_nodes_found = ack.error == Some(RouteError::NoTargets)
                    || (!closest.is_empty()
                        && message.previous_hop().is_some()
                        && !self.is_closer_than_self(&closest[0], &message.target));
                self.send_response(
                    &message.source,
                    session_id,
                    message.routing_path.clone(),
                    closest,
                    entries,
                    no_closer_nodes_found,
                );
            }
            Some(_) => {}
        }
        ack
    }

    /// Deliver one completion report to the originator's session.
    fn send_response(
        &self,
        target: &PeerDescriptor,
        session_id: String,
        routing_path: Vec<PeerDescriptor>,
        closest_nodes: Vec<PeerDescriptor>,
        data_entries: Vec<DataEntry>,
        no_closer_nodes_found: bool,
    ) {
        if target.node_id == self.local.node_id {
            if let Some(session) = self.sessions.lock().get(&session_id).cloned() {
                session.on_response(routing_path, closest_nodes, data_entries, no_closer_nodes_found);
            }
            return;
        }
        let rpc = self.rpc.clone();
        let target = target.clone();
        tokio::spawn(async move {
            if let Err(e) = rpc
                .send_session_response(
                    &target,
                    session_id,
                    routing_path,
                    closest_nodes,
                    data_entries,
                    no_closer_nodes_found,
                )
                .await
            {
                debug!(peer = %target.node_id, error = %e, "session response failed");
            }
        });
    }

    /// Inbound completion report for a session hosted here.
    pub fn handle_session_response(
        self: &Arc<Self>,
        source: PeerDescriptor,
        session_id: &str,
        routing_path: Vec<PeerDescriptor>,
        closest_nodes: Vec<PeerDescriptor>,
        data_entries: Vec<DataEntry>,
        no_closer_nodes_found: bool,
    ) {
        self.peer_manager.add_contact(source);
        match self.sessions.lock().get(session_id).cloned() {
            Some(session) => {
                session.on_response(routing_path, closest_nodes, data_entries, no_closer_nodes_found);
            }
            None => trace!(session_id, "report for unknown or finished session"),
        }
    }

    fn is_closer_than_self(&self, peer: &PeerDescriptor, target: &DhtAddress) -> bool {
        peer.node_id.distance_to(target) < self.local.node_id.distance_to(target)
    }

    /// Abort all ongoing sessions without awaiting remote responses.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let mut sessions = self.sessions.lock();
        for session in sessions.values() {
            session.complete();
        }
        sessions.clear();
    }
}
