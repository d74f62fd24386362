#![forbid(unsafe_code)]

//! The `DhtNode` facade.
//!
//! Wires the engine's components together over an injected transport and
//! exposes the caller-facing API consumed by higher layers: start/stop,
//! join, hop-by-hop routing, recursive operations and key-value storage.
//! Each component receives only the narrow collaborator interfaces it
//! needs, so the pieces remain individually testable.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use lattice_core::{DhtAddress, DhtConfig, DhtError, DhtResult};
use lattice_transport::{
    ConnectionLocker, DisconnectReason, PeerDescriptor, RpcRequestHandler, Transport,
    TransportEvent,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::discovery::{PeerDiscovery, PeerDiscoveryConfig};
use crate::peer_manager::{ContactEvent, LivenessProber, PeerManager, PeerManagerConfig};
use crate::recursive::{RecursiveOperationManager, RecursiveOperationResult};
use crate::routing::{
    RecursiveOperation, RouteAck, RouteError, RoutedBody, RoutedMessage, Router, RoutingMode,
};
use crate::rpc::{DhtRpcClient, DhtRpcRequest, DhtRpcResponse};
use crate::store::{DataEntry, LocalDataStore, StoreManager, StoreManagerConfig};

const MESSAGE_CHANNEL_CAPACITY: usize = 256;
const LEAVE_NOTICE_TIMEOUT: Duration = Duration::from_secs(2);

/// An application payload routed to this node.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub source: PeerDescriptor,
    pub payload: Vec<u8>,
}

/// Narrowing adapter: components that only manage locks see the transport
/// through [`ConnectionLocker`] alone.
struct TransportLocker(Arc<dyn Transport>);

impl ConnectionLocker for TransportLocker {
    fn lock_connection(&self, target: &PeerDescriptor, lock_id: &str) {
        self.0.lock_connection(target, lock_id);
    }

    fn unlock_connection(&self, target: &PeerDescriptor, lock_id: &str) {
        self.0.unlock_connection(target, lock_id);
    }

    fn weak_lock_connection(&self, target: &PeerDescriptor, lock_id: &str) {
        self.0.weak_lock_connection(target, lock_id);
    }

    fn weak_unlock_connection(&self, target: &PeerDescriptor, lock_id: &str) {
        self.0.weak_unlock_connection(target, lock_id);
    }
}

/// Liveness probes are pings over the regular RPC client.
struct RpcProber {
    rpc: Arc<DhtRpcClient>,
}

#[async_trait]
impl LivenessProber for RpcProber {
    async fn probe(&self, target: &PeerDescriptor) -> bool {
        self.rpc.ping(target).await.is_ok()
    }
}

pub struct DhtNode {
    config: DhtConfig,
    transport: Arc<dyn Transport>,
    local: PeerDescriptor,
    rpc: Arc<DhtRpcClient>,
    peer_manager: Arc<PeerManager>,
    router: Arc<Router>,
    discovery: Arc<PeerDiscovery>,
    recursive: Arc<RecursiveOperationManager>,
    store: Arc<StoreManager>,
    local_data_store: Arc<LocalDataStore>,
    entry_points: Mutex<Vec<PeerDescriptor>>,
    messages: broadcast::Sender<InboundMessage>,
    started: AtomicBool,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DhtNode {
    pub fn new(config: DhtConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        let local = transport.local_descriptor();
        let rpc = Arc::new(DhtRpcClient::new(
            transport.clone(),
            config.service_id.clone(),
            config.rpc_timeout(),
        ));
        let locker: Arc<dyn ConnectionLocker> = Arc::new(TransportLocker(transport.clone()));
        let peer_manager = PeerManager::new(
            local.clone(),
            PeerManagerConfig::from(&config),
            Arc::new(RpcProber { rpc: rpc.clone() }),
            locker.clone(),
        );
        let router = Router::new(
            local.clone(),
            peer_manager.clone(),
            rpc.clone(),
            config.closest_contacts_limit,
            config.duplicate_detector_max_size,
            Duration::from_millis(config.duplicate_detector_max_age_ms),
        );
        let local_data_store = Arc::new(LocalDataStore::new(Duration::from_millis(
            config.store_max_ttl_ms,
        )));
        let recursive = RecursiveOperationManager::new(
            local.clone(),
            router.clone(),
            peer_manager.clone(),
            local_data_store.clone(),
            rpc.clone(),
            config.operation_timeout(),
            config.closest_contacts_limit,
        );
        let store = StoreManager::new(
            local.clone(),
            StoreManagerConfig::from(&config),
            rpc.clone(),
            local_data_store.clone(),
            recursive.clone(),
            peer_manager.clone(),
        );
        let discovery = PeerDiscovery::new(
            local.clone(),
            PeerDiscoveryConfig::from(&config),
            peer_manager.clone(),
            rpc.clone(),
            locker,
        );
        let (messages, _) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);
        Arc::new(Self {
            config,
            transport,
            local,
            rpc,
            peer_manager,
            router,
            discovery,
            recursive,
            store,
            local_data_store,
            entry_points: Mutex::new(Vec::new()),
            messages,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Bind the RPC service and start the background loops. Idempotent.
    pub fn start(self: &Arc<Self>) -> DhtResult<()> {
        if self.is_stopped() {
            return Err(DhtError::Stopped);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(node = %self.local.node_id, service = %self.config.service_id, "starting dht node");
        self.transport.register_service(
            &self.config.service_id,
            Arc::new(DhtRpcServer { node: Arc::downgrade(self) }),
        );
        self.store.start();

        let transport_loop = {
            let this = Arc::clone(self);
            let mut events = self.transport.subscribe();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(TransportEvent::Connected(descriptor)) => {
                            this.peer_manager.handle_connected(descriptor);
                        }
                        Ok(TransportEvent::Disconnected(descriptor, reason)) => {
                            this.peer_manager.handle_disconnected(
                                &descriptor,
                                reason == DisconnectReason::GracefulLeave,
                            );
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "transport event stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };
        let isolation_watch = {
            let this = Arc::clone(self);
            let mut events = self.peer_manager.subscribe();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(ContactEvent::ContactRemoved { .. }) => {
                            this.rejoin_if_isolated();
                        }
                        Ok(ContactEvent::NewContact { .. }) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };
        self.tasks.lock().extend([transport_loop, isolation_watch]);
        Ok(())
    }

    fn rejoin_if_isolated(&self) {
        if self.is_stopped()
            || self.peer_manager.bucket_count() > 0
            || self.discovery.is_join_ongoing()
        {
            return;
        }
        let entry_point = self.entry_points.lock().first().cloned();
        if let Some(entry_point) = entry_point {
            info!(node = %self.local.node_id, "routing table empty, rejoining");
            let discovery = self.discovery.clone();
            tokio::spawn(async move {
                discovery.rejoin_dht(entry_point).await;
            });
        }
    }

    /// Join the overlay through the given bootstrap entry points.
    pub async fn join_dht(self: &Arc<Self>, entry_points: &[PeerDescriptor]) -> DhtResult<()> {
        if self.is_stopped() || !self.started.load(Ordering::SeqCst) {
            return Err(DhtError::Stopped);
        }
        *self.entry_points.lock() = entry_points.to_vec();
        self.discovery.join_dht(entry_points, true).await
    }

    /// Route an opaque payload hop-by-hop toward `target`.
    pub fn route_message(
        self: &Arc<Self>,
        target: DhtAddress,
        payload: Vec<u8>,
        excluded: Option<DhtAddress>,
    ) -> DhtResult<()> {
        if self.is_stopped() {
            return Err(DhtError::Stopped);
        }
        if target == self.local.node_id {
            return Err(DhtError::CannotConnectToSelf);
        }
        let message = RoutedMessage {
            request_id: Uuid::new_v4().to_string(),
            target,
            source: self.local.clone(),
            routing_path: Vec::new(),
            body: RoutedBody::Application(payload),
        };
        // remember our own request id so an echo through a cycle is dropped
        self.router.check_and_mark_duplicate(&message.request_id);
        let ack = self.router.route(message, RoutingMode::Forward, excluded);
        match ack.error {
            None => Ok(()),
            Some(RouteError::NoTargets) => Err(DhtError::NoTargets),
            Some(RouteError::Duplicate) => Err(DhtError::DuplicateMessage),
            Some(RouteError::Stopped) => Err(DhtError::Stopped),
        }
    }

    /// Run a recursive FIND_NODE / FETCH_DATA / DELETE_DATA toward `target`.
    pub async fn execute_recursive_operation(
        self: &Arc<Self>,
        target: DhtAddress,
        operation: RecursiveOperation,
    ) -> DhtResult<RecursiveOperationResult> {
        self.recursive.execute(target, operation, None, true).await
    }

    /// Store `payload` on the redundancy-factor nodes closest to `key`;
    /// returns the nodes that accepted.
    pub async fn store_data(
        self: &Arc<Self>,
        key: DhtAddress,
        payload: Vec<u8>,
    ) -> DhtResult<Vec<PeerDescriptor>> {
        if self.is_stopped() {
            return Err(DhtError::Stopped);
        }
        self.store.store_data(key, payload).await
    }

    pub async fn get_data(self: &Arc<Self>, key: DhtAddress) -> DhtResult<Vec<DataEntry>> {
        if self.is_stopped() {
            return Err(DhtError::Stopped);
        }
        self.store.get_data(key).await
    }

    pub async fn delete_data(self: &Arc<Self>, key: DhtAddress) -> DhtResult<()> {
        if self.is_stopped() {
            return Err(DhtError::Stopped);
        }
        self.store.delete_data(key).await
    }

    /// Known contacts in ascending distance order from the local address.
    pub fn get_closest_contacts(&self, limit: usize) -> Vec<PeerDescriptor> {
        self.peer_manager
            .get_closest_contacts_to(&self.local.node_id, limit, &HashSet::new())
    }

    pub fn get_number_of_connections(&self) -> usize {
        self.transport.connection_count()
    }

    pub fn get_bucket_size(&self) -> usize {
        self.peer_manager.bucket_count()
    }

    pub fn local_descriptor(&self) -> PeerDescriptor {
        self.local.clone()
    }

    pub fn local_data_store(&self) -> &Arc<LocalDataStore> {
        &self.local_data_store
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.messages.subscribe()
    }

    pub fn subscribe_contact_events(&self) -> broadcast::Receiver<ContactEvent> {
        self.peer_manager.subscribe()
    }

    pub fn is_join_ongoing(&self) -> bool {
        self.discovery.is_join_ongoing()
    }

    /// Stop the node: announce departure, abort sessions and background
    /// loops, clear the routing table and release its locks.
    pub async fn stop(self: &Arc<Self>) {
        if !self.started.load(Ordering::SeqCst) || self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(node = %self.local.node_id, "stopping dht node");
        let contacts = self.peer_manager.bucket_descriptors();
        let notices = contacts.iter().map(|peer| self.rpc.leave_notice(peer));
        if tokio::time::timeout(LEAVE_NOTICE_TIMEOUT, join_all(notices))
            .await
            .is_err()
        {
            debug!("leave notices timed out");
        }
        self.discovery.stop();
        self.recursive.stop();
        self.router.stop();
        self.store.stop();
        self.peer_manager.stop();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.transport.unregister_service(&self.config.service_id);
    }

    /// Inbound leg of hop-by-hop routing.
    fn handle_routed_message(self: &Arc<Self>, message: RoutedMessage) -> RouteAck {
        if self.is_stopped() {
            return RouteAck::with_error(RouteError::Stopped);
        }
        if matches!(message.body, RoutedBody::RecursiveOperation { .. }) {
            return self.recursive.handle_route_request(message, None);
        }
        if self.router.check_and_mark_duplicate(&message.request_id) {
            return RouteAck::with_error(RouteError::Duplicate);
        }
        self.peer_manager.add_contact(message.source.clone());
        if message.target == self.local.node_id {
            if let RoutedBody::Application(payload) = message.body {
                trace!(source = %message.source.node_id, "message arrived at target");
                let _ = self.messages.send(InboundMessage {
                    source: message.source,
                    payload,
                });
            }
            RouteAck::ok()
        } else {
            self.router.route(message, RoutingMode::Forward, None)
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        source: PeerDescriptor,
        request: DhtRpcRequest,
    ) -> DhtResult<DhtRpcResponse> {
        match request {
            DhtRpcRequest::RouteMessage(message) => {
                Ok(DhtRpcResponse::RouteAck(self.handle_routed_message(message)))
            }
            _ if self.is_stopped() => Err(DhtError::Stopped),
            DhtRpcRequest::GetClosestPeers { target } => {
                self.peer_manager.add_contact(source);
                Ok(DhtRpcResponse::ClosestPeers(
                    self.peer_manager.get_closest_contacts_to(
                        &target,
                        self.config.closest_contacts_limit,
                        &HashSet::new(),
                    ),
                ))
            }
            DhtRpcRequest::Ping => {
                self.peer_manager.add_contact(source);
                Ok(DhtRpcResponse::Pong)
            }
            DhtRpcRequest::LeaveNotice => {
                trace!(peer = %source.node_id, "peer announced departure");
                self.peer_manager.handle_disconnected(&source, true);
                Ok(DhtRpcResponse::Empty)
            }
            DhtRpcRequest::StoreData { key, payload, ttl } => {
                self.peer_manager.add_contact(source.clone());
                self.store.handle_store_request(&source, key, payload, ttl);
                Ok(DhtRpcResponse::Empty)
            }
            DhtRpcRequest::ReplicateData { entry } => {
                self.store.handle_replicate_request(&source, entry);
                Ok(DhtRpcResponse::Empty)
            }
            DhtRpcRequest::SessionResponse {
                session_id,
                routing_path,
                closest_nodes,
                data_entries,
                no_closer_nodes_found,
            } => {
                self.recursive.handle_session_response(
                    source,
                    &session_id,
                    routing_path,
                    closest_nodes,
                    data_entries,
                    no_closer_nodes_found,
                );
                Ok(DhtRpcResponse::Empty)
            }
        }
    }
}

/// Server side of the DHT service, registered on the transport.
struct DhtRpcServer {
    node: Weak<DhtNode>,
}

#[async_trait]
impl RpcRequestHandler for DhtRpcServer {
    async fn handle_request(&self, source: PeerDescriptor, payload: Vec<u8>) -> DhtResult<Vec<u8>> {
        let node = self.node.upgrade().ok_or(DhtError::Stopped)?;
        let request: DhtRpcRequest = serde_cbor::from_slice(&payload)?;
        let response = node.dispatch(source, request)?;
        Ok(serde_cbor::to_vec(&response)?)
    }
}
