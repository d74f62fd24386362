#![forbid(unsafe_code)]

//! One forwarding attempt of a routed message.
//!
//! The router has already picked the candidate hops; the session tries them
//! in ascending distance order until one accepts. Per-hop failures are
//! recovered here and never surface beyond the session.

use std::sync::Arc;

use lattice_core::{DhtError, DhtResult};
use lattice_transport::PeerDescriptor;
use tracing::{debug, trace};

use crate::rpc::DhtRpcClient;

use super::{RouteError, RoutedMessage};

pub struct RoutingSession {
    rpc: Arc<DhtRpcClient>,
    message: RoutedMessage,
    candidates: Vec<PeerDescriptor>,
    /// How many accepting hops to aim for. Forward mode keeps one path;
    /// recursive mode fans out so the originating session receives
    /// independent completion reports.
    branches: usize,
}

impl RoutingSession {
    pub fn new(
        rpc: Arc<DhtRpcClient>,
        message: RoutedMessage,
        candidates: Vec<PeerDescriptor>,
        branches: usize,
    ) -> Self {
        Self { rpc, message, candidates, branches }
    }

    /// Offer the message to candidates in order until enough of them
    /// accept; returns the number of accepting hops.
    pub async fn run(self) -> DhtResult<usize> {
        let mut accepted = 0;
        for candidate in self.candidates {
            if accepted >= self.branches {
                break;
            }
            match self.rpc.route_message(&candidate, &self.message).await {
                Ok(ack) => match ack.error {
                    None => {
                        trace!(
                            next_hop = %candidate.node_id,
                            request_id = %self.message.request_id,
                            "message forwarded"
                        );
                        accepted += 1;
                    }
                    Some(RouteError::Duplicate) => {
                        // the candidate already saw this message through
                        // another path; treat the branch as covered
                        accepted += 1;
                    }
                    Some(error) => {
                        trace!(next_hop = %candidate.node_id, ?error, "hop rejected message");
                    }
                },
                Err(e) => {
                    debug!(next_hop = %candidate.node_id, error = %e, "hop send failed");
                }
            }
        }
        if accepted == 0 {
            return Err(DhtError::NoTargets);
        }
        Ok(accepted)
    }
}
