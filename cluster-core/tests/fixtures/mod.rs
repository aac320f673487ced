//! Fixtures for testing the coordination core.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use cluster_core::config::Config;
use cluster_core::discovery::ClusterEvent;
use cluster_core::discovery::Discovery;
use cluster_core::node::NodeRegistry;
use cluster_core::resolver::IndexResolver;
use cluster_core::schemas::SchemasLRU;
use cluster_core::storage::MetadataStore;
use memstore::MemStore;
use tokio::sync::mpsc;
use tracing_subscriber::prelude::*;

macro_rules! func_name {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        let n = &name[..name.len() - 3];
        let nn = n.replace("::{{closure}}", "");
        nn
    }};
}

macro_rules! init_ut {
    () => {{
        fixtures::init_tracing();

        let name = func_name!();
        let span = tracing::debug_span!("ut", "{}", name.split("::").last().unwrap());
        ((), span)
    }};
}

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// A node under test: its config, registry, discovery actor and the two
/// caches, all over a store shared by the whole test cluster.
pub struct TestNode {
    pub config: Arc<Config>,
    pub registry: Arc<NodeRegistry>,
    pub store: Arc<MemStore>,
    pub discovery: Discovery,
    pub events: mpsc::UnboundedReceiver<ClusterEvent>,
    pub resolver: IndexResolver,
    pub resolver_events: mpsc::UnboundedReceiver<ClusterEvent>,
    pub schemas: SchemasLRU,
}

/// Build a config with timers shrunk for tests.
///
/// Every test uses its own `cluster_name` (datagrams from other clusters
/// are dropped) and its own discovery port, so suites don't cross-talk.
pub fn test_config(cluster_name: &str, port: u16, node_name: Option<&str>, ordinal: u16) -> Config {
    let mut builder = Config::build(cluster_name.into())
        .discovery_bind(TEST_GROUP, port)
        .advertise_host("127.0.0.1")
        .service_ports(18880 + ordinal * 3, 18881 + ordinal * 3, 18882 + ordinal * 3)
        .discovery_waiting(Duration::from_millis(100), Duration::from_millis(250))
        .heartbeat_range(Duration::from_millis(40), Duration::from_millis(80))
        .node_lifespan(Duration::from_millis(1500))
        .stall_time(Duration::from_millis(100))
        .db_updated_delay(Duration::ZERO, Duration::from_millis(50));
    if let Some(name) = node_name {
        builder = builder.node_name(name);
    }
    builder.validate().expect("failed to build test config")
}

/// Spawn a node on the shared store.
pub fn spawn_node(config: Config, store: Arc<MemStore>) -> TestNode {
    let config = Arc::new(config);
    let registry = Arc::new(NodeRegistry::new(config.node_lifespan));
    let (discovery, events) = Discovery::spawn(config.clone(), registry.clone())
        .expect("failed to spawn discovery actor");
    let store_dyn: Arc<dyn MetadataStore> = store.clone();
    let (tx_resolver_events, resolver_events) = mpsc::unbounded_channel();
    let resolver = IndexResolver::new(
        config.clone(),
        registry.clone(),
        store_dyn.clone(),
        Some(discovery.clone()),
        Some(tx_resolver_events),
    );
    let schemas = SchemasLRU::new(config.clone(), store_dyn, Some(discovery.clone()));
    TestNode {
        config,
        registry,
        store,
        discovery,
        events,
        resolver,
        resolver_events,
        schemas,
    }
}

/// Bind an observer socket on the discovery group, for tests that need to
/// watch or inject raw datagrams.
pub fn bind_probe_socket(group: Ipv4Addr, port: u16) -> tokio::net::UdpSocket {
    use socket2::Domain;
    use socket2::Protocol;
    use socket2::Socket;
    use socket2::Type;
    use std::net::SocketAddrV4;

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).unwrap();
    socket.set_reuse_address(true).unwrap();
    #[cfg(not(target_os = "windows"))]
    socket.set_reuse_port(true).unwrap();
    socket.set_nonblocking(true).unwrap();
    socket
        .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())
        .unwrap();
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED).unwrap();
    socket.set_multicast_loop_v4(true).unwrap();
    tokio::net::UdpSocket::from_std(socket.into()).unwrap()
}

/// The multicast group every test config binds.
pub const TEST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 192, 200, 73);

/// Wait for a node to report the READY state.
pub async fn wait_ready(node: &TestNode, timeout: Duration) -> cluster_core::DiscoveryMetrics {
    node.discovery
        .wait(Some(timeout))
        .state(cluster_core::ClusterState::Ready, "node ready")
        .await
        .expect("node did not reach READY")
}
