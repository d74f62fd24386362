//! Helpers shared by the integration tests: short-deadline configuration
//! and node construction over the in-process simulator.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use lattice_core::{DhtAddress, DhtConfig, DHT_ADDRESS_LENGTH};
use lattice_dht::DhtNode;
use lattice_transport::{PeerDescriptor, Simulator};

/// Production defaults with deadlines shortened for test runs.
pub fn test_config() -> DhtConfig {
    DhtConfig {
        rpc_timeout_ms: 2_000,
        join_timeout_ms: 10_000,
        operation_timeout_ms: 2_000,
        ttl_sweep_interval_ms: 50,
        ..DhtConfig::default()
    }
}

pub fn addr(lead: u8, tail: u8) -> DhtAddress {
    let mut raw = [0u8; DHT_ADDRESS_LENGTH];
    raw[0] = lead;
    raw[DHT_ADDRESS_LENGTH - 1] = tail;
    DhtAddress::new(raw)
}

pub fn start_node(
    simulator: &Arc<Simulator>,
    id: DhtAddress,
    config: DhtConfig,
) -> Arc<DhtNode> {
    let transport = simulator.create_transport(PeerDescriptor::new(id));
    let node = DhtNode::new(config, transport);
    node.start().expect("node starts");
    node
}

pub fn start_random_node(simulator: &Arc<Simulator>, config: DhtConfig) -> Arc<DhtNode> {
    start_node(simulator, DhtAddress::random(), config)
}

/// Poll `condition` until it holds or `deadline` elapses; returns the final
/// evaluation. Background work (replication, event fan-out) has no completion
/// handle to await, so scenario tests converge on the observable state.
pub async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let started = tokio::time::Instant::now();
    while started.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
