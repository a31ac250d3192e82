//! End-to-end discovery scenarios over a scripted in-memory transport.

use std::sync::Arc;

use meridian_common::crypto::{hash, Hash};
use meridian_daemon::discovery::testing::{test_node, MemoryTransport};
use meridian_daemon::discovery::{DiscoveryConfig, DiscoveryTable, Node, NodeRole, Transport};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn boot_url(node: &Node) -> String {
    format!(
        "merinode://{}@{}?role={}",
        node.id().to_hex(),
        node.udp_addr(),
        node.role()
    )
}

fn table_with(
    transport: &Arc<MemoryTransport>,
    bootstrap: Vec<String>,
) -> Arc<DiscoveryTable> {
    let config = DiscoveryConfig {
        node_id: Some(Hash::new([0xEE; 32])),
        bootstrap_nodes: bootstrap,
        ..Default::default()
    };
    let transport: Arc<dyn Transport> = Arc::clone(transport) as Arc<dyn Transport>;
    DiscoveryTable::new(config, transport).unwrap()
}

#[tokio::test]
async fn test_bootstrap_seeds_table_after_refresh() {
    init_logger();

    let transport = Arc::new(MemoryTransport::new());
    let boot = test_node(1, NodeRole::Validator);
    transport.add_peer(Arc::clone(&boot)).await;

    let table = table_with(&transport, vec![boot_url(&boot)]);
    assert!(!table.is_initialized());

    table.start().await;
    table.refresh().await.unwrap();

    assert!(table.is_initialized());
    assert!(table.count(NodeRole::Validator).await >= 1);

    let sampled = table.random_nodes(NodeRole::Validator, 8).await;
    assert_eq!(sampled.len(), 1);
    assert_eq!(sampled[0].id(), boot.id());

    table.close().await;
}

#[tokio::test]
async fn test_refresh_discovers_neighbors_of_neighbors() {
    init_logger();

    let transport = Arc::new(MemoryTransport::new());
    let boot = test_node(1, NodeRole::Boot);
    let validators: Vec<_> = (2..6u8)
        .map(|seed| test_node(seed, NodeRole::Validator))
        .collect();
    let proxies: Vec<_> = (6..8u8)
        .map(|seed| test_node(seed, NodeRole::Proxy))
        .collect();

    transport.add_peer(Arc::clone(&boot)).await;
    for node in validators.iter().chain(proxies.iter()) {
        transport.add_peer(Arc::clone(node)).await;
    }

    // The bootstrap node knows one validator and all proxies; that
    // validator knows the rest of the validators.
    let mut boot_knows: Vec<Arc<Node>> = vec![Arc::clone(&validators[0])];
    boot_knows.extend(proxies.iter().cloned());
    transport.set_neighbors(boot.id().clone(), boot_knows).await;
    transport
        .set_neighbors(validators[0].id().clone(), validators[1..].to_vec())
        .await;

    let table = table_with(&transport, vec![boot_url(&boot)]);
    table.start().await;
    table.refresh().await.unwrap();

    // Recursive validator lookups walked the whole chain
    assert_eq!(table.count(NodeRole::Validator).await, validators.len());
    // Flat role discovery picked up the proxies
    assert_eq!(table.count(NodeRole::Proxy).await, proxies.len());

    // Closest query answers in distance order
    let target = hash(b"somewhere");
    let closest = table.closest_nodes(&target, NodeRole::Validator, 3).await;
    assert_eq!(closest.len(), 3);

    table.close().await;
}

#[tokio::test]
async fn test_unreachable_role_stays_empty_without_error() {
    init_logger();

    let transport = Arc::new(MemoryTransport::new());
    // Bootstrap node never answers
    let boot = test_node(1, NodeRole::Boot);

    let table = table_with(&transport, vec![boot_url(&boot)]);
    table.start().await;
    table.refresh().await.unwrap();

    // No reachable peers just means empty answers, not failures
    assert!(table.is_initialized());
    for role in NodeRole::ALL {
        assert_eq!(table.count(role).await, 0);
        assert!(table.random_nodes(role, 8).await.is_empty());
    }

    table.close().await;
}

#[tokio::test]
async fn test_closed_table_is_inert() {
    init_logger();

    let transport = Arc::new(MemoryTransport::new());
    let table = table_with(&transport, Vec::new());

    table.start().await;
    table.refresh().await.unwrap();
    table.close().await;

    assert!(table.refresh().await.is_err());
    assert!(table.random_nodes(NodeRole::Validator, 4).await.is_empty());
}
