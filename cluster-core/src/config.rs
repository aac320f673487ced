//! Runtime configuration for the coordination core.

use std::net::Ipv4Addr;
use std::time::Duration;

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

/// Base heartbeat used to derive the node lifespan.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(500);

/// The runtime configuration for a cluster node.
///
/// Use [`Config::build`] to construct; `validate` is called for you and the
/// derived timer ranges are checked for sanity. The election timeout is
/// always drawn from `[2.5 × heartbeat_max, 5.0 × heartbeat_max]`, so tests
/// shrink every timer by shrinking the heartbeat range alone.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The name which scopes gossip; datagrams with other names are dropped.
    pub cluster_name: String,
    /// Explicit node name. When set, a name collision is fatal; when empty,
    /// a new name is generated and the join is retried.
    pub node_name: Option<String>,

    /// Multicast group the discovery socket joins.
    pub discovery_group: Ipv4Addr,
    /// Port the discovery socket binds.
    pub discovery_port: u16,
    /// Host address advertised in cluster messages.
    pub advertise_host: String,

    /// Advertised HTTP port.
    pub http_port: u16,
    /// Advertised remote-protocol port.
    pub remote_port: u16,
    /// Advertised replication port.
    pub replication_port: u16,

    /// Initial discovery window between HELLO and the slow cadence.
    pub discovery_waiting_fast: Duration,
    /// Extended discovery window before joining.
    pub discovery_waiting_slow: Duration,

    /// Minimum leader heartbeat period.
    pub heartbeat_min: Duration,
    /// Maximum leader heartbeat period.
    pub heartbeat_max: Duration,

    /// How long a silent node stays alive.
    pub node_lifespan: Duration,

    /// Default number of shards for new indices.
    pub num_shards: usize,
    /// Default number of replicas (not counting the primary).
    pub num_replicas: usize,
    /// Require explicit settings on new writable indices.
    pub strict: bool,
    /// Single-node mode: no cluster notifications are emitted.
    pub solo: bool,

    /// Window a writable resolve waits for a missing primary before
    /// dispatching an ELECT_PRIMARY command.
    pub stall_time: Duration,

    /// Entries kept by the index resolver LRU.
    pub resolver_cache_size: usize,
    /// Age after which a resolver LRU entry is treated as a miss.
    pub resolver_cache_timeout: Duration,
    /// Entries kept by the schema LRU.
    pub schema_cache_size: usize,

    /// Minimum randomized delay before acting on a DB_UPDATED notification.
    pub db_updated_min_delay: Duration,
    /// Maximum randomized delay before acting on a DB_UPDATED notification.
    pub db_updated_max_delay: Duration,
}

impl Config {
    /// Start building a config for the given cluster.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            config: Config {
                cluster_name,
                node_name: None,
                discovery_group: Ipv4Addr::new(239, 192, 168, 1),
                discovery_port: 8884,
                advertise_host: "127.0.0.1".to_string(),
                http_port: 8880,
                remote_port: 8881,
                replication_port: 8882,
                discovery_waiting_fast: Duration::from_millis(200),
                discovery_waiting_slow: Duration::from_millis(600),
                heartbeat_min: Duration::from_millis(150),
                heartbeat_max: Duration::from_millis(300),
                node_lifespan: HEARTBEAT_TIMEOUT * 50,
                num_shards: 1,
                num_replicas: 0,
                strict: false,
                solo: false,
                stall_time: Duration::from_secs(10),
                resolver_cache_size: 100,
                resolver_cache_timeout: Duration::from_secs(60),
                schema_cache_size: 30,
                db_updated_min_delay: Duration::ZERO,
                db_updated_max_delay: Duration::from_millis(3000),
            },
        }
    }

    /// Minimum election timeout: `2.5 × heartbeat_max`.
    pub fn election_timeout_min(&self) -> Duration {
        self.heartbeat_max * 5 / 2
    }

    /// Maximum election timeout: `5.0 × heartbeat_max`.
    pub fn election_timeout_max(&self) -> Duration {
        self.heartbeat_max * 5
    }

    /// Draw a new randomized election timeout, uniform over the range.
    pub fn new_rand_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min();
        let max = self.election_timeout_max();
        thread_rng().gen_range(min..=max)
    }

    /// Draw a new randomized leader heartbeat period, uniform over the range.
    pub fn new_rand_heartbeat_interval(&self) -> Duration {
        thread_rng().gen_range(self.heartbeat_min..=self.heartbeat_max)
    }

    /// Draw a randomized delay for spreading replication triggered by a
    /// DB_UPDATED notification.
    pub fn new_rand_db_updated_delay(&self) -> Duration {
        if self.db_updated_max_delay <= self.db_updated_min_delay {
            return self.db_updated_min_delay;
        }
        thread_rng().gen_range(self.db_updated_min_delay..=self.db_updated_max_delay)
    }
}

/// Builder for [`Config`].
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the explicit node name.
    pub fn node_name(mut self, name: impl Into<String>) -> Self {
        self.config.node_name = Some(name.into());
        self
    }

    /// Set the multicast group and port the discovery socket uses.
    pub fn discovery_bind(mut self, group: Ipv4Addr, port: u16) -> Self {
        self.config.discovery_group = group;
        self.config.discovery_port = port;
        self
    }

    /// Set the host address advertised in cluster messages.
    pub fn advertise_host(mut self, host: impl Into<String>) -> Self {
        self.config.advertise_host = host.into();
        self
    }

    /// Set the three advertised service ports.
    pub fn service_ports(mut self, http: u16, remote: u16, replication: u16) -> Self {
        self.config.http_port = http;
        self.config.remote_port = remote;
        self.config.replication_port = replication;
        self
    }

    /// Set the heartbeat period range; election timeouts derive from it.
    pub fn heartbeat_range(mut self, min: Duration, max: Duration) -> Self {
        self.config.heartbeat_min = min;
        self.config.heartbeat_max = max;
        self
    }

    /// Set the two discovery waiting windows.
    pub fn discovery_waiting(mut self, fast: Duration, slow: Duration) -> Self {
        self.config.discovery_waiting_fast = fast;
        self.config.discovery_waiting_slow = slow;
        self
    }

    /// Set how long a silent node stays alive.
    pub fn node_lifespan(mut self, lifespan: Duration) -> Self {
        self.config.node_lifespan = lifespan;
        self
    }

    /// Set the default shard/replica counts for new indices.
    pub fn sharding(mut self, num_shards: usize, num_replicas: usize) -> Self {
        self.config.num_shards = num_shards;
        self.config.num_replicas = num_replicas;
        self
    }

    /// Set the stall window before ELECT_PRIMARY is dispatched.
    pub fn stall_time(mut self, stall_time: Duration) -> Self {
        self.config.stall_time = stall_time;
        self
    }

    /// Require explicit settings on new writable indices.
    pub fn strict(mut self, strict: bool) -> Self {
        self.config.strict = strict;
        self
    }

    /// Set the randomized DB_UPDATED replication delay range.
    pub fn db_updated_delay(mut self, min: Duration, max: Duration) -> Self {
        self.config.db_updated_min_delay = min;
        self.config.db_updated_max_delay = max;
        self
    }

    /// Validate the configuration and produce the final `Config`.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let config = self.config;
        if config.cluster_name.is_empty() {
            return Err(ConfigError::EmptyClusterName);
        }
        if config.num_shards == 0 || config.num_shards > 9999 {
            return Err(ConfigError::InvalidShards);
        }
        if config.heartbeat_min > config.heartbeat_max || config.heartbeat_min.is_zero() {
            return Err(ConfigError::InvalidHeartbeatRange);
        }
        if config.election_timeout_min() <= config.heartbeat_max {
            return Err(ConfigError::InvalidElectionRange);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::build("test".into()).validate().unwrap();
        assert_eq!(config.discovery_port, 8884);
        assert_eq!(config.num_shards, 1);
        assert_eq!(config.num_replicas, 0);
        assert_eq!(config.node_lifespan, Duration::from_secs(25));
    }

    #[test]
    fn election_range_follows_heartbeat() {
        let config = Config::build("test".into())
            .heartbeat_range(Duration::from_millis(50), Duration::from_millis(100))
            .validate()
            .unwrap();
        assert_eq!(config.election_timeout_min(), Duration::from_millis(250));
        assert_eq!(config.election_timeout_max(), Duration::from_millis(500));
        for _ in 0..64 {
            let t = config.new_rand_election_timeout();
            assert!(t >= config.election_timeout_min() && t <= config.election_timeout_max());
        }
    }

    #[test]
    fn rejects_empty_cluster_name() {
        assert!(matches!(
            Config::build("".into()).validate(),
            Err(ConfigError::EmptyClusterName)
        ));
    }

    #[test]
    fn rejects_bad_shards() {
        assert!(Config::build("test".into()).sharding(0, 0).validate().is_err());
        assert!(Config::build("test".into()).sharding(10_000, 0).validate().is_err());
    }
}
