//! Hop-by-hop routing scenarios: delivery across the overlay and the
//! structural error kinds surfaced to the caller.

mod common;

use std::time::Duration;

use lattice_core::{DhtAddress, DhtError};
use lattice_transport::Simulator;

use common::{start_random_node, test_config};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn payload_reaches_the_target_node() {
    let _guard = tracing_subscriber::fmt::try_init();
    let simulator = Simulator::new();
    let config = test_config();

    let entry = start_random_node(&simulator, config.clone());
    let entry_descriptor = entry.local_descriptor();
    let mut nodes = Vec::new();
    for _ in 0..4 {
        let node = start_random_node(&simulator, config.clone());
        node.join_dht(std::slice::from_ref(&entry_descriptor))
            .await
            .expect("join succeeds");
        nodes.push(node);
    }

    // every joiner is connected to the entry point, so a message addressed
    // to it always has a viable hop
    let sender = &nodes[3];
    let mut inbox = entry.subscribe_messages();
    sender
        .route_message(entry_descriptor.node_id, b"hello entry".to_vec(), None)
        .expect("message leaves the sender");

    let delivered = tokio::time::timeout(Duration::from_secs(3), inbox.recv())
        .await
        .expect("message arrives in time")
        .expect("channel stays open");
    assert_eq!(delivered.payload, b"hello entry");
    assert_eq!(
        delivered.source.node_id,
        sender.local_descriptor().node_id
    );
}

#[tokio::test]
async fn routing_to_the_local_node_is_rejected() {
    let _guard = tracing_subscriber::fmt::try_init();
    let simulator = Simulator::new();
    let node = start_random_node(&simulator, test_config());
    let own = node.local_descriptor().node_id;
    assert!(matches!(
        node.route_message(own, b"loop".to_vec(), None),
        Err(DhtError::CannotConnectToSelf)
    ));
}

#[tokio::test]
async fn isolated_node_reports_no_targets() {
    let _guard = tracing_subscriber::fmt::try_init();
    let simulator = Simulator::new();
    let node = start_random_node(&simulator, test_config());
    assert!(matches!(
        node.route_message(DhtAddress::random(), b"nowhere".to_vec(), None),
        Err(DhtError::NoTargets)
    ));
}
