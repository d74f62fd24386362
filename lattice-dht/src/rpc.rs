#![forbid(unsafe_code)]

//! Typed RPC calls of the DHT service.
//!
//! The wire byte layout is owned by the transport; this module only defines
//! the call signatures and encodes them as CBOR payloads. [`DhtRpcClient`]
//! is the remote proxy used everywhere a component talks to a peer: every
//! call carries an explicit deadline and decodes into the expected response
//! variant or fails.

use std::sync::Arc;
use std::time::Duration;

use lattice_core::{DhtAddress, DhtError, DhtResult};
use lattice_transport::{PeerDescriptor, Transport};
use serde::{Deserialize, Serialize};

use crate::routing::{RouteAck, RoutedMessage};
use crate::store::DataEntry;

/// Request side of the DHT service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DhtRpcRequest {
    /// Return the peers closest to `target` known to the callee.
    GetClosestPeers { target: DhtAddress },
    /// Liveness probe.
    Ping,
    /// Graceful departure announcement.
    LeaveNotice,
    /// Accept a message for hop-by-hop routing.
    RouteMessage(RoutedMessage),
    /// Store an entry on the callee under the caller's identity.
    StoreData { key: DhtAddress, payload: Vec<u8>, ttl: Duration },
    /// Hand over a replica of an existing entry.
    ReplicateData { entry: DataEntry },
    /// Report one routing-path completion back to a recursive-operation
    /// session on the callee.
    SessionResponse {
        session_id: String,
        routing_path: Vec<PeerDescriptor>,
        closest_nodes: Vec<PeerDescriptor>,
        data_entries: Vec<DataEntry>,
        no_closer_nodes_found: bool,
    },
}

/// Response side of the DHT service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DhtRpcResponse {
    ClosestPeers(Vec<PeerDescriptor>),
    Pong,
    RouteAck(RouteAck),
    Empty,
}

/// Remote proxy for the DHT service of a peer.
pub struct DhtRpcClient {
    transport: Arc<dyn Transport>,
    service_id: String,
    rpc_timeout: Duration,
}

impl DhtRpcClient {
    pub fn new(transport: Arc<dyn Transport>, service_id: String, rpc_timeout: Duration) -> Self {
        Self { transport, service_id, rpc_timeout }
    }

    async fn request(
        &self,
        target: &PeerDescriptor,
        request: &DhtRpcRequest,
    ) -> DhtResult<DhtRpcResponse> {
        let payload = serde_cbor::to_vec(request)?;
        let reply = tokio::time::timeout(
            self.rpc_timeout,
            self.transport.call(target, &self.service_id, payload),
        )
        .await
        .map_err(|_| DhtError::Timeout("rpc call"))??;
        Ok(serde_cbor::from_slice(&reply)?)
    }

    pub async fn get_closest_peers(
        &self,
        target: &PeerDescriptor,
        address: DhtAddress,
    ) -> DhtResult<Vec<PeerDescriptor>> {
        match self
            .request(target, &DhtRpcRequest::GetClosestPeers { target: address })
            .await?
        {
            DhtRpcResponse::ClosestPeers(peers) => Ok(peers),
            other => Err(unexpected("getClosestPeers", &other)),
        }
    }

    pub async fn ping(&self, target: &PeerDescriptor) -> DhtResult<()> {
        match self.request(target, &DhtRpcRequest::Ping).await? {
            DhtRpcResponse::Pong => Ok(()),
            other => Err(unexpected("ping", &other)),
        }
    }

    pub async fn leave_notice(&self, target: &PeerDescriptor) -> DhtResult<()> {
        match self.request(target, &DhtRpcRequest::LeaveNotice).await? {
            DhtRpcResponse::Empty => Ok(()),
            other => Err(unexpected("leaveNotice", &other)),
        }
    }

    pub async fn route_message(
        &self,
        target: &PeerDescriptor,
        message: &RoutedMessage,
    ) -> DhtResult<RouteAck> {
        match self
            .request(target, &DhtRpcRequest::RouteMessage(message.clone()))
            .await?
        {
            DhtRpcResponse::RouteAck(ack) => Ok(ack),
            other => Err(unexpected("routeMessage", &other)),
        }
    }

    pub async fn store_data(
        &self,
        target: &PeerDescriptor,
        key: DhtAddress,
        payload: Vec<u8>,
        ttl: Duration,
    ) -> DhtResult<()> {
        match self
            .request(target, &DhtRpcRequest::StoreData { key, payload, ttl })
            .await?
        {
            DhtRpcResponse::Empty => Ok(()),
            other => Err(unexpected("storeData", &other)),
        }
    }

    pub async fn replicate_data(&self, target: &PeerDescriptor, entry: DataEntry) -> DhtResult<()> {
        match self
            .request(target, &DhtRpcRequest::ReplicateData { entry })
            .await?
        {
            DhtRpcResponse::Empty => Ok(()),
            other => Err(unexpected("replicateData", &other)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn send_session_response(
        &self,
        target: &PeerDescriptor,
        session_id: String,
        routing_path: Vec<PeerDescriptor>,
        closest_nodes: Vec<PeerDescriptor>,
        data_entries: Vec<DataEntry>,
        no_closer_nodes_found: bool,
    ) -> DhtResult<()> {
        let request = DhtRpcRequest::SessionResponse {
            session_id,
            routing_path,
            closest_nodes,
            data_entries,
            no_closer_nodes_found,
        };
        match self.request(target, &request).await? {
            DhtRpcResponse::Empty => Ok(()),
            other => Err(unexpected("sessionResponse", &other)),
        }
    }
}

fn unexpected(method: &str, response: &DhtRpcResponse) -> DhtError {
    DhtError::Transport(format!("unexpected response to {method}: {response:?}"))
}
