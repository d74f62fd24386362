#![forbid(unsafe_code)]

//! Transport-facing abstractions consumed by the Lattice DHT.
//!
//! The DHT core never opens sockets itself. It talks to a [`Transport`]
//! implementation through a narrow surface: typed request/response calls
//! carried as opaque payload bytes, a connected/disconnected event stream,
//! connection enumeration, and connection-lock management. Production
//! deployments plug in a real network transport; tests use the in-process
//! [`simulator`].

use std::sync::Arc;

use async_trait::async_trait;
use lattice_core::{DhtAddress, DhtResult};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub mod locks;
pub mod simulator;

pub use locks::{ConnectionLockHandler, LockId};
pub use simulator::{Simulator, SimulatorTransport};

/// A node's publicly known identity: its DHT address plus reachability
/// metadata. Owned by the transport layer; the DHT treats it as an opaque
/// value with an embedded address and copies it freely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub node_id: DhtAddress,
    /// Opaque reachability hint (host:port, multiaddr, ...), if any.
    pub endpoint: Option<String>,
    /// Whether the peer is reachable from the open internet without
    /// traversal assistance.
    pub open_internet: bool,
}

impl PeerDescriptor {
    pub fn new(node_id: DhtAddress) -> Self {
        Self { node_id, endpoint: None, open_internet: false }
    }

    pub fn with_endpoint(node_id: DhtAddress, endpoint: impl Into<String>) -> Self {
        Self { node_id, endpoint: Some(endpoint.into()), open_internet: true }
    }
}

/// Why a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer announced its departure.
    GracefulLeave,
    /// The link dropped without notice.
    ConnectionLost,
}

/// Connection lifecycle notifications emitted by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected(PeerDescriptor),
    Disconnected(PeerDescriptor, DisconnectReason),
}

/// Server side of the RPC substrate: one handler per service id, invoked
/// with the source descriptor and the raw request payload.
#[async_trait]
pub trait RpcRequestHandler: Send + Sync + 'static {
    async fn handle_request(&self, source: PeerDescriptor, payload: Vec<u8>) -> DhtResult<Vec<u8>>;
}

/// Lock management of a transport's connection manager. Locks keep an
/// overlay link alive independently of raw connection lifetime; see
/// [`ConnectionLockHandler`] for the bookkeeping semantics.
pub trait ConnectionLocker: Send + Sync {
    fn lock_connection(&self, target: &PeerDescriptor, lock_id: &str);
    fn unlock_connection(&self, target: &PeerDescriptor, lock_id: &str);
    fn weak_lock_connection(&self, target: &PeerDescriptor, lock_id: &str);
    fn weak_unlock_connection(&self, target: &PeerDescriptor, lock_id: &str);
}

/// The transport surface the DHT engine consumes.
#[async_trait]
pub trait Transport: ConnectionLocker + Send + Sync + 'static {
    /// Descriptor under which this transport is reachable.
    fn local_descriptor(&self) -> PeerDescriptor;

    /// Issue a request to `target` on the given service and await the
    /// response payload. Implementations connect on demand.
    async fn call(
        &self,
        target: &PeerDescriptor,
        service_id: &str,
        request: Vec<u8>,
    ) -> DhtResult<Vec<u8>>;

    /// Register the handler invoked for inbound requests on `service_id`.
    fn register_service(&self, service_id: &str, handler: Arc<dyn RpcRequestHandler>);

    /// Remove a previously registered handler.
    fn unregister_service(&self, service_id: &str);

    /// Subscribe to connection lifecycle events.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Descriptors of all currently connected peers.
    fn connections(&self) -> Vec<PeerDescriptor>;

    fn connection_count(&self) -> usize;

    /// Drop the connection to `target`, notifying both sides.
    fn disconnect(&self, target: &PeerDescriptor, reason: DisconnectReason);
}

impl<T: ConnectionLocker + ?Sized> ConnectionLocker for Arc<T> {
    fn lock_connection(&self, target: &PeerDescriptor, lock_id: &str) {
        (**self).lock_connection(target, lock_id);
    }

    fn unlock_connection(&self, target: &PeerDescriptor, lock_id: &str) {
        (**self).unlock_connection(target, lock_id);
    }

    fn weak_lock_connection(&self, target: &PeerDescriptor, lock_id: &str) {
        (**self).weak_lock_connection(target, lock_id);
    }

    fn weak_unlock_connection(&self, target: &PeerDescriptor, lock_id: &str) {
        (**self).weak_unlock_connection(target, lock_id);
    }
}
