#![forbid(unsafe_code)]

//! In-process transport simulator.
//!
//! Connects any number of node instances inside one process with zero
//! latency: a call is dispatched directly to the target's registered
//! service handler. Connections are established on first contact and
//! tracked symmetrically on both endpoints, so transport events fire the
//! same way they would over a real network. Integration tests build whole
//! overlays on top of this.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use lattice_core::{DhtAddress, DhtError, DhtResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::trace;

use crate::{
    ConnectionLockHandler, ConnectionLocker, DisconnectReason, PeerDescriptor, RpcRequestHandler,
    Transport, TransportEvent,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

struct Endpoint {
    descriptor: PeerDescriptor,
    services: DashMap<String, Arc<dyn RpcRequestHandler>>,
    connections: Mutex<HashMap<DhtAddress, PeerDescriptor>>,
    locks: Mutex<ConnectionLockHandler>,
    events: broadcast::Sender<TransportEvent>,
    stopped: AtomicBool,
}

impl Endpoint {
    fn new(descriptor: PeerDescriptor) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            descriptor,
            services: DashMap::new(),
            connections: Mutex::new(HashMap::new()),
            locks: Mutex::new(ConnectionLockHandler::new()),
            events,
            stopped: AtomicBool::new(false),
        })
    }
}

/// Registry of all simulated endpoints in one overlay.
#[derive(Default)]
pub struct Simulator {
    endpoints: DashMap<DhtAddress, Arc<Endpoint>>,
}

impl Simulator {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a new node to the simulated network and hand back its
    /// transport. Re-using an address replaces the previous endpoint.
    pub fn create_transport(self: &Arc<Self>, descriptor: PeerDescriptor) -> Arc<SimulatorTransport> {
        let endpoint = Endpoint::new(descriptor.clone());
        self.endpoints.insert(descriptor.node_id, endpoint.clone());
        Arc::new(SimulatorTransport { simulator: self.clone(), endpoint })
    }

    fn endpoint(&self, id: &DhtAddress) -> Option<Arc<Endpoint>> {
        self.endpoints.get(id).map(|e| e.value().clone())
    }
}

/// One node's view of the simulated network.
pub struct SimulatorTransport {
    simulator: Arc<Simulator>,
    endpoint: Arc<Endpoint>,
}

impl SimulatorTransport {
    /// Simulate this node going away. Open connections drop with the given
    /// reason and subsequent calls in either direction fail.
    pub fn shutdown(&self, reason: DisconnectReason) {
        self.endpoint.stopped.store(true, Ordering::SeqCst);
        let peers: Vec<PeerDescriptor> =
            self.endpoint.connections.lock().values().cloned().collect();
        for peer in peers {
            self.disconnect(&peer, reason);
        }
    }

    pub fn is_connection_locked(&self, id: &DhtAddress) -> bool {
        self.endpoint.locks.lock().is_locked(id)
    }

    pub fn local_locked_count(&self) -> usize {
        self.endpoint.locks.lock().local_locked_connection_count()
    }

    pub fn remote_locked_count(&self) -> usize {
        self.endpoint.locks.lock().remote_locked_connection_count()
    }

    pub fn weak_locked_count(&self) -> usize {
        self.endpoint.locks.lock().weak_locked_connection_count()
    }

    /// Record the connection on both endpoints, emitting `Connected` events
    /// on first contact.
    fn establish(&self, remote: &Arc<Endpoint>) {
        let local = &self.endpoint;
        let newly_connected = {
            let mut conns = local.connections.lock();
            conns
                .insert(remote.descriptor.node_id, remote.descriptor.clone())
                .is_none()
        };
        if newly_connected {
            let _ = local.events.send(TransportEvent::Connected(remote.descriptor.clone()));
            trace!(peer = %remote.descriptor.node_id, "simulator connection established");
        }
        let newly_connected_remote = {
            let mut conns = remote.connections.lock();
            conns
                .insert(local.descriptor.node_id, local.descriptor.clone())
                .is_none()
        };
        if newly_connected_remote {
            let _ = remote.events.send(TransportEvent::Connected(local.descriptor.clone()));
        }
    }
}

#[async_trait]
impl Transport for SimulatorTransport {
    fn local_descriptor(&self) -> PeerDescriptor {
        self.endpoint.descriptor.clone()
    }

    async fn call(
        &self,
        target: &PeerDescriptor,
        service_id: &str,
        request: Vec<u8>,
    ) -> DhtResult<Vec<u8>> {
        if self.endpoint.stopped.load(Ordering::SeqCst) {
            return Err(DhtError::Stopped);
        }
        if target.node_id == self.endpoint.descriptor.node_id {
            return Err(DhtError::CannotConnectToSelf);
        }
        let remote = self
            .simulator
            .endpoint(&target.node_id)
            .filter(|e| !e.stopped.load(Ordering::SeqCst))
            .ok_or_else(|| DhtError::Transport(format!("peer {} unreachable", target.node_id)))?;
        self.establish(&remote);
        let handler = remote
            .services
            .get(service_id)
            .map(|h| h.value().clone())
            .ok_or_else(|| {
                DhtError::Transport(format!("no service '{service_id}' on {}", target.node_id))
            })?;
        handler
            .handle_request(self.endpoint.descriptor.clone(), request)
            .await
    }

    fn register_service(&self, service_id: &str, handler: Arc<dyn RpcRequestHandler>) {
        self.endpoint.services.insert(service_id.to_string(), handler);
    }

    fn unregister_service(&self, service_id: &str) {
        self.endpoint.services.remove(service_id);
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.endpoint.events.subscribe()
    }

    fn connections(&self) -> Vec<PeerDescriptor> {
        self.endpoint.connections.lock().values().cloned().collect()
    }

    fn connection_count(&self) -> usize {
        self.endpoint.connections.lock().len()
    }

    fn disconnect(&self, target: &PeerDescriptor, reason: DisconnectReason) {
        let dropped = self
            .endpoint
            .connections
            .lock()
            .remove(&target.node_id)
            .is_some();
        if dropped {
            let _ = self
                .endpoint
                .events
                .send(TransportEvent::Disconnected(target.clone(), reason));
        }
        if let Some(remote) = self.simulator.endpoint(&target.node_id) {
            let dropped_remote = remote
                .connections
                .lock()
                .remove(&self.endpoint.descriptor.node_id)
                .is_some();
            if dropped_remote {
                let _ = remote.events.send(TransportEvent::Disconnected(
                    self.endpoint.descriptor.clone(),
                    reason,
                ));
            }
        }
    }
}

impl ConnectionLocker for SimulatorTransport {
    fn lock_connection(&self, target: &PeerDescriptor, lock_id: &str) {
        self.endpoint
            .locks
            .lock()
            .add_local_locked(target.node_id, lock_id);
        // Mirror what a lock request over the wire would do on the peer.
        if let Some(remote) = self.simulator.endpoint(&target.node_id) {
            remote
                .locks
                .lock()
                .add_remote_locked(self.endpoint.descriptor.node_id, lock_id);
        }
    }

    fn unlock_connection(&self, target: &PeerDescriptor, lock_id: &str) {
        self.endpoint
            .locks
            .lock()
            .remove_local_locked(&target.node_id, lock_id);
        if let Some(remote) = self.simulator.endpoint(&target.node_id) {
            remote
                .locks
                .lock()
                .remove_remote_locked(&self.endpoint.descriptor.node_id, lock_id);
        }
    }

    fn weak_lock_connection(&self, target: &PeerDescriptor, lock_id: &str) {
        self.endpoint
            .locks
            .lock()
            .add_weak_locked(target.node_id, lock_id);
    }

    fn weak_unlock_connection(&self, target: &PeerDescriptor, lock_id: &str) {
        self.endpoint
            .locks
            .lock()
            .remove_weak_locked(&target.node_id, lock_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl RpcRequestHandler for Echo {
        async fn handle_request(&self, _source: PeerDescriptor, payload: Vec<u8>) -> DhtResult<Vec<u8>> {
            Ok(payload)
        }
    }

    fn descriptor() -> PeerDescriptor {
        PeerDescriptor::new(DhtAddress::random())
    }

    #[tokio::test]
    async fn call_reaches_registered_service_and_connects_both_sides() {
        let sim = Simulator::new();
        let a = sim.create_transport(descriptor());
        let b = sim.create_transport(descriptor());
        b.register_service("echo", Arc::new(Echo));

        let reply = a
            .call(&b.local_descriptor(), "echo", b"hello".to_vec())
            .await
            .unwrap();
        assert_eq!(reply, b"hello");
        assert_eq!(a.connection_count(), 1);
        assert_eq!(b.connection_count(), 1);
    }

    #[tokio::test]
    async fn connected_events_fire_on_first_contact_only() {
        let sim = Simulator::new();
        let a = sim.create_transport(descriptor());
        let b = sim.create_transport(descriptor());
        b.register_service("echo", Arc::new(Echo));
        let mut events = b.subscribe();

        a.call(&b.local_descriptor(), "echo", vec![1]).await.unwrap();
        a.call(&b.local_descriptor(), "echo", vec![2]).await.unwrap();

        match events.try_recv().unwrap() {
            TransportEvent::Connected(peer) => {
                assert_eq!(peer.node_id, a.local_descriptor().node_id);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(events.try_recv().is_err(), "second call must not reconnect");
    }

    #[tokio::test]
    async fn call_to_unknown_peer_fails() {
        let sim = Simulator::new();
        let a = sim.create_transport(descriptor());
        let ghost = descriptor();
        assert!(matches!(
            a.call(&ghost, "echo", vec![]).await,
            Err(DhtError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn call_to_self_is_rejected() {
        let sim = Simulator::new();
        let a = sim.create_transport(descriptor());
        let own = a.local_descriptor();
        assert!(matches!(
            a.call(&own, "echo", vec![]).await,
            Err(DhtError::CannotConnectToSelf)
        ));
    }

    #[tokio::test]
    async fn disconnect_notifies_both_endpoints() {
        let sim = Simulator::new();
        let a = sim.create_transport(descriptor());
        let b = sim.create_transport(descriptor());
        b.register_service("echo", Arc::new(Echo));
        a.call(&b.local_descriptor(), "echo", vec![]).await.unwrap();

        let mut a_events = a.subscribe();
        let mut b_events = b.subscribe();
        a.disconnect(&b.local_descriptor(), DisconnectReason::ConnectionLost);

        assert!(matches!(
            a_events.try_recv().unwrap(),
            TransportEvent::Disconnected(_, DisconnectReason::ConnectionLost)
        ));
        assert!(matches!(
            b_events.try_recv().unwrap(),
            TransportEvent::Disconnected(_, DisconnectReason::ConnectionLost)
        ));
        assert_eq!(a.connection_count(), 0);
        assert_eq!(b.connection_count(), 0);
    }

    #[tokio::test]
    async fn locks_mirror_to_remote_side() {
        let sim = Simulator::new();
        let a = sim.create_transport(descriptor());
        let b = sim.create_transport(descriptor());
        a.lock_connection(&b.local_descriptor(), "svc::join");
        assert!(a.is_connection_locked(&b.local_descriptor().node_id));
        assert_eq!(b.remote_locked_count(), 1);

        a.unlock_connection(&b.local_descriptor(), "svc::join");
        assert!(!a.is_connection_locked(&b.local_descriptor().node_id));
        assert_eq!(b.remote_locked_count(), 0);
    }
}
