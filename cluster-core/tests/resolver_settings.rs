use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use cluster_core::config::Config;
use cluster_core::node::Node;
use cluster_core::node::NodeRegistry;
use cluster_core::resolver::IndexResolver;
use cluster_core::storage::MetadataStore;
use cluster_core::ClientError;
use memstore::MemStore;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;
#[allow(unused_imports)]
use pretty_assertions::assert_ne;
use rmpv::Value;

#[macro_use]
mod fixtures;

fn registry_of(names: &[&str]) -> Arc<NodeRegistry> {
    let registry = Arc::new(NodeRegistry::new(Duration::from_secs(25)));
    for (i, name) in names.iter().enumerate() {
        let mut node = Node::new(*name);
        node.idx = i as u64 + 1;
        node.set_host("127.0.0.1");
        node.remote_port = 20000 + i as u16;
        if i == 0 {
            registry.set_local(node);
        } else {
            registry.touch(&node, true, true).unwrap();
        }
    }
    registry
}

fn resolver(config: Arc<Config>, registry: Arc<NodeRegistry>, store: Arc<dyn MetadataStore>) -> IndexResolver {
    IndexResolver::new(config, registry, store, None, None)
}

fn shard_settings(num_shards: u64, num_replicas: u64) -> Value {
    Value::Map(vec![
        (Value::from("number_of_shards"), Value::from(num_shards)),
        (Value::from("number_of_replicas"), Value::from(num_replicas)),
    ])
}

/// Saved settings survive a round-trip through the metadata store: a fresh
/// resolver over the same store loads exactly what was saved.
#[tokio::test]
async fn settings_roundtrip_through_store() -> Result<()> {
    let (_log_guard, ut_span) = init_ut!();
    let _ent = ut_span.enter();

    let config = Arc::new(Config::build("resolver-settings".into()).validate()?);
    let registry = registry_of(&["n1", "n2", "n3"]);
    let store: Arc<dyn MetadataStore> = Arc::new(MemStore::new());

    let first = resolver(config.clone(), registry.clone(), store.clone());
    let obj = shard_settings(2, 1);
    let saved = first
        .resolve_index_settings("some/idx", true, false, Some(&obj), None, false, false, false)
        .await?;
    assert_eq!(saved.num_shards, 2);
    assert_eq!(saved.num_replicas_plus_master, 2);
    assert!(saved.saved);

    let second = resolver(config, registry, store);
    let loaded = second
        .resolve_index_settings("some/idx", false, false, None, None, false, false, false)
        .await?;
    assert!(loaded.loaded);
    assert_eq!(loaded.num_shards, saved.num_shards);
    assert_eq!(loaded.num_replicas_plus_master, saved.num_replicas_plus_master);
    let saved_nodes: Vec<_> = saved.shards.iter().map(|s| s.nodes.clone()).collect();
    let loaded_nodes: Vec<_> = loaded.shards.iter().map(|s| s.nodes.clone()).collect();
    assert_eq!(saved_nodes, loaded_nodes);
    Ok(())
}

/// Changing the shard count of an index that was loaded is a client error;
/// changing the replica count only forces a rebuild.
#[tokio::test]
async fn shard_count_change_is_rejected() -> Result<()> {
    let (_log_guard, ut_span) = init_ut!();
    let _ent = ut_span.enter();

    let config = Arc::new(Config::build("resolver-settings".into()).validate()?);
    let registry = registry_of(&["n1", "n2", "n3"]);
    let store: Arc<dyn MetadataStore> = Arc::new(MemStore::new());
    let resolver = resolver(config, registry, store);

    resolver
        .resolve_index_settings("idx", true, false, Some(&shard_settings(2, 0)), None, false, false, false)
        .await?;

    let err = resolver
        .resolve_index_settings("idx", true, false, Some(&shard_settings(3, 0)), None, false, false, false)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::ShardCountChange));

    // Growing replicas is allowed and resettles every shard.
    let grown = resolver
        .resolve_index_settings("idx", true, false, Some(&shard_settings(2, 2)), None, false, false, false)
        .await?;
    assert_eq!(grown.num_replicas_plus_master, 3);
    for shard in &grown.shards {
        assert_eq!(shard.nodes.len(), 3);
    }
    Ok(())
}

/// Out-of-range settings are rejected outright.
#[tokio::test]
async fn invalid_settings_are_client_errors() -> Result<()> {
    let (_log_guard, ut_span) = init_ut!();
    let _ent = ut_span.enter();

    let config = Arc::new(Config::build("resolver-settings".into()).validate()?);
    let registry = registry_of(&["n1"]);
    let store: Arc<dyn MetadataStore> = Arc::new(MemStore::new());
    let resolver = resolver(config, registry, store);

    let err = resolver
        .resolve_index_settings("idx", true, false, Some(&shard_settings(0, 0)), None, false, false, false)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::InvalidSettingsValue("number_of_shards")));

    let not_a_number = Value::Map(vec![(Value::from("number_of_shards"), Value::from("two"))]);
    let err = resolver
        .resolve_index_settings("idx", true, false, Some(&not_a_number), None, false, false, false)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::InvalidSettingsType("number_of_shards", _)));
    Ok(())
}

/// System paths resolve without touching the store: the leader is the
/// primary and every other node is a replica, and settings are refused.
#[tokio::test]
async fn system_paths_follow_the_leader() -> Result<()> {
    let (_log_guard, ut_span) = init_ut!();
    let _ent = ut_span.enter();

    let config = Arc::new(Config::build("resolver-settings".into()).sharding(3, 0).validate()?);
    let registry = registry_of(&["n1", "n2", "n3"]);
    let mut leader = Node::new("n2");
    leader.idx = 2;
    leader.set_host("127.0.0.1");
    leader.remote_port = 20001;
    registry.set_leader(leader);
    let memstore = Arc::new(MemStore::new());
    let store: Arc<dyn MetadataStore> = memstore.clone();
    let resolver = resolver(config, registry, store);

    let settings = resolver
        .resolve_index_settings(".xapiand/indices", true, false, None, None, false, false, false)
        .await?;
    assert_eq!(settings.num_shards, 3);
    for shard in &settings.shards {
        assert_eq!(shard.nodes[0], "n2");
        assert_eq!(shard.nodes.len(), 3);
    }

    let settings = resolver
        .resolve_index_settings(".xapiand/nodes", true, false, None, None, false, false, false)
        .await?;
    assert_eq!(settings.num_shards, 1);
    assert_eq!(settings.shards[0].nodes[0], "n2");

    // Nothing was persisted for system paths.
    assert_eq!(memstore.document_count(".xapiand/indices").await, 0);
    let err = resolver
        .resolve_index_settings(".xapiand/indices", true, false, Some(&shard_settings(2, 0)), None, false, false, false)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::SystemIndexSettings));
    Ok(())
}

/// The clear flag evicts the cache entry and returns empty settings.
#[tokio::test]
async fn clear_evicts_the_entry() -> Result<()> {
    let (_log_guard, ut_span) = init_ut!();
    let _ent = ut_span.enter();

    let config = Arc::new(Config::build("resolver-settings".into()).validate()?);
    let registry = registry_of(&["n1", "n2"]);
    let store: Arc<dyn MetadataStore> = Arc::new(MemStore::new());
    let resolver = resolver(config, registry, store);

    resolver
        .resolve_index_settings("idx", true, false, Some(&shard_settings(1, 1)), None, false, false, false)
        .await?;
    let cleared = resolver
        .resolve_index_settings("idx", false, false, None, None, false, false, true)
        .await?;
    assert!(cleared.shards.is_empty());
    assert_eq!(cleared.num_shards, 0);
    Ok(())
}
