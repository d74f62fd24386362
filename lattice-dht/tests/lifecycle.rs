//! Node lifecycle: graceful departure announcements and the behavior of the
//! public entry points once a node has stopped.

mod common;

use std::time::Duration;

use lattice_core::{DhtAddress, DhtError};
use lattice_dht::RecursiveOperation;
use lattice_transport::Simulator;

use common::{start_random_node, test_config, wait_until};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn graceful_leave_removes_the_node_from_peer_tables() {
    let _guard = tracing_subscriber::fmt::try_init();
    let simulator = Simulator::new();
    let config = test_config();

    let entry = start_random_node(&simulator, config.clone());
    let node = start_random_node(&simulator, config);
    node.join_dht(&[entry.local_descriptor()])
        .await
        .expect("join succeeds");

    let node_id = node.local_descriptor().node_id;
    assert!(
        entry
            .get_closest_contacts(10)
            .iter()
            .any(|d| d.node_id == node_id),
        "entry point learned the joiner"
    );

    node.stop().await;

    let forgotten = wait_until(Duration::from_secs(3), || {
        entry
            .get_closest_contacts(10)
            .iter()
            .all(|d| d.node_id != node_id)
    })
    .await;
    assert!(forgotten, "leave notice evicts the departed node immediately");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopped_node_refuses_public_entry_points() {
    let _guard = tracing_subscriber::fmt::try_init();
    let simulator = Simulator::new();
    let node = start_random_node(&simulator, test_config());
    node.stop().await;

    let target = DhtAddress::random();
    assert!(matches!(
        node.route_message(target, b"late".to_vec(), None),
        Err(DhtError::Stopped)
    ));
    assert!(matches!(
        node.join_dht(&[]).await,
        Err(DhtError::Stopped)
    ));
    assert!(matches!(
        node.store_data(target, b"late".to_vec()).await,
        Err(DhtError::Stopped)
    ));
    assert!(matches!(node.get_data(target).await, Err(DhtError::Stopped)));
    assert!(matches!(
        node.execute_recursive_operation(target, RecursiveOperation::FindNode)
            .await,
        Err(DhtError::Stopped)
    ));

    // the tables were cleared and a second stop is a no-op
    assert_eq!(node.get_bucket_size(), 0);
    node.stop().await;
}
