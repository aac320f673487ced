use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use cluster_core::discovery::ClusterEvent;
use cluster_core::endpoint::Endpoint;
use memstore::MemStore;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;
#[allow(unused_imports)]
use pretty_assertions::assert_ne;
use rmpv::Value;

#[macro_use]
mod fixtures;

async fn three_nodes(cluster: &str, port: u16) -> (Vec<fixtures::TestNode>, Arc<MemStore>) {
    let store = Arc::new(MemStore::new());
    let mut nodes = Vec::new();
    for (ordinal, name) in [(1u16, "n1"), (2, "n2"), (3, "n3")] {
        let node = fixtures::spawn_node(fixtures::test_config(cluster, port, Some(name), ordinal), store.clone());
        fixtures::wait_ready(&node, Duration::from_secs(8)).await;
        nodes.push(node);
    }
    // Every registry must know all three before shard placement runs.
    for node in &nodes {
        node.discovery
            .wait(Some(Duration::from_secs(5)))
            .metrics(|m| m.total_nodes == 3, "all nodes known")
            .await
            .expect("cluster did not converge");
    }
    (nodes, store)
}

/// Primary failover test.
///
/// What does this test do?
///
/// - brings three nodes online and creates an index replicated on all of
///   them.
/// - kills the primary without a BYE and lets it age past the lifespan.
/// - asserts that the next writable resolve on a survivor swaps an active
///   replica into the primary slot, preserving the replica set, and
///   persists the new order.
///
/// RUST_LOG=cluster_core,primary_failover=trace cargo test -p cluster-core --test primary_failover
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn primary_failover_swaps_replica() -> Result<()> {
    let (_log_guard, ut_span) = init_ut!();
    let _ent = ut_span.enter();

    let (nodes, _store) = three_nodes("primary-failover", 45831).await;

    let settings_obj = Value::Map(vec![
        (Value::from("number_of_shards"), Value::from(1u64)),
        (Value::from("number_of_replicas"), Value::from(2u64)),
    ]);
    let settings = nodes[0]
        .resolver
        .resolve_index_settings("foo", true, false, Some(&settings_obj), None, false, false, false)
        .await?;
    assert_eq!(settings.shards.len(), 1);
    assert_eq!(settings.shards[0].nodes.len(), 3);
    let old_primary = settings.shards[0].nodes[0].clone();
    let old_replicas: HashSet<String> = settings.shards[0].nodes.iter().cloned().collect();

    // Crash the primary (no BYE) and let it age out everywhere.
    let victim = nodes
        .iter()
        .position(|node| node.config.node_name.as_deref() == Some(old_primary.as_str()))
        .expect("primary is one of the test nodes");
    nodes[victim].discovery.abort();
    let survivor = &nodes[(victim + 1) % nodes.len()];
    tokio::time::sleep(survivor.config.node_lifespan + Duration::from_millis(700)).await;

    let endpoints = survivor
        .resolver
        .resolve_index_endpoints(&Endpoint::local("/foo"), true, false, None)
        .await?;
    assert_eq!(endpoints.len(), 1);
    assert_ne!(endpoints[0].node_name.as_deref(), Some(old_primary.as_str()));

    let settings = survivor
        .resolver
        .resolve_index_settings("foo", false, false, None, None, false, false, false)
        .await?;
    let new_primary = settings.shards[0].nodes[0].clone();
    assert_ne!(new_primary, old_primary);
    // The swap preserves the replica set.
    let new_replicas: HashSet<String> = settings.shards[0].nodes.iter().cloned().collect();
    assert_eq!(new_replicas, old_replicas);

    for (i, node) in nodes.iter().enumerate() {
        if i != victim {
            node.discovery.shutdown().await?;
        }
    }
    Ok(())
}

/// Stalled shard test.
///
/// What does this test do?
///
/// - creates a single-replica index whose only replica is one node.
/// - kills that node and resolves from a survivor that is not a replica.
/// - asserts the first writable resolve stalls and a later one dispatches
///   ELECT_PRIMARY for the shard.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn stalled_shard_dispatches_elect_primary() -> Result<()> {
    let (_log_guard, ut_span) = init_ut!();
    let _ent = ut_span.enter();

    let (mut nodes, _store) = three_nodes("elect-primary", 45833).await;

    let settings_obj = Value::Map(vec![
        (Value::from("number_of_shards"), Value::from(1u64)),
        (Value::from("number_of_replicas"), Value::from(0u64)),
    ]);
    let settings = nodes[0]
        .resolver
        .resolve_index_settings("bar", true, false, Some(&settings_obj), None, false, false, false)
        .await?;
    assert_eq!(settings.shards[0].nodes.len(), 1);
    let primary = settings.shards[0].nodes[0].clone();

    let victim = nodes
        .iter()
        .position(|node| node.config.node_name.as_deref() == Some(primary.as_str()))
        .expect("primary is one of the test nodes");
    nodes[victim].discovery.abort();
    let survivor_idx = (victim + 1) % nodes.len();
    tokio::time::sleep(nodes[survivor_idx].config.node_lifespan + Duration::from_millis(700)).await;

    // First writable resolve finds no active replica and stalls.
    let survivor = &nodes[survivor_idx];
    let _ = survivor
        .resolver
        .resolve_index_endpoints(&Endpoint::local("/bar"), true, false, None)
        .await?;
    // After the stall window passes, the next resolve dispatches
    // ELECT_PRIMARY for the shard.
    tokio::time::sleep(survivor.config.stall_time + Duration::from_millis(50)).await;
    let _ = survivor
        .resolver
        .resolve_index_endpoints(&Endpoint::local("/bar"), true, false, None)
        .await?;

    let survivor = &mut nodes[survivor_idx];
    let mut elected = None;
    while let Ok(event) = survivor.resolver_events.try_recv() {
        if let ClusterEvent::ElectPrimary(path) = event {
            elected = Some(path);
        }
    }
    assert_eq!(elected.as_deref(), Some("bar"));

    for (i, node) in nodes.iter().enumerate() {
        if i != victim {
            node.discovery.shutdown().await?;
        }
    }
    Ok(())
}
