//! Cluster coordination core.
//!
//! This crate provides every node of a sharded, schema-aware search cluster
//! with a consistent answer to "for this index path, which nodes host which
//! shards, and what schema governs them?", in the face of node churn,
//! network loss and concurrent writers. It is composed of:
//!
//! - [`NodeRegistry`] — the process-wide set of known nodes, their liveness
//!   and the identity of the local and leader nodes.
//! - [`Discovery`] — a single-task actor owning a multicast UDP socket,
//!   running the cluster join gossip and the Raft role machine, and applying
//!   committed log entries to the registry.
//! - [`MetadataStore`] — the interface to the replicated internal index
//!   (`.xapiand/indices`) that persists settings and schemas.
//! - [`IndexResolver`] — an LRU from unsharded path to shard layout, with
//!   consistent-hash placement, primary repair and persistence.
//! - [`SchemasLRU`] — a two-tier (local + foreign) cache of immutable,
//!   shared schema objects with conflict-retry update semantics.

pub mod config;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod metrics;
pub mod node;
pub mod resolver;
pub mod schemas;
pub mod storage;
pub mod wire;

pub use crate::config::Config;
pub use crate::discovery::ClusterEvent;
pub use crate::discovery::ClusterState;
pub use crate::discovery::Discovery;
pub use crate::discovery::Role;
pub use crate::error::ClientError;
pub use crate::error::ConfigError;
pub use crate::error::FatalError;
pub use crate::error::StoreError;
pub use crate::metrics::DiscoveryMetrics;
pub use crate::metrics::Wait;
pub use crate::node::Node;
pub use crate::node::NodeRegistry;
pub use crate::resolver::IndexResolver;
pub use crate::resolver::IndexSettings;
pub use crate::resolver::IndexSettingsShard;
pub use crate::schemas::SchemaRef;
pub use crate::schemas::SchemasLRU;
pub use crate::storage::MetadataStore;

/// A Raft term.
pub type Term = u64;

/// A 1-based index into the Raft log.
pub type LogIndex = u64;

/// Version number meaning "not yet known / not yet persisted".
pub const UNKNOWN_VERSION: u64 = 0;

/// Number of tries for resolving optimistic version conflicts.
pub const CONFLICT_RETRIES: usize = 10;

/// Bound on recursive foreign-schema resolution depth.
pub const MAX_SCHEMA_RECURSION: usize = 10;

/// A trait defining a compact, log-friendly summary of a message or state.
pub trait MessageSummary {
    /// Return a brief single-line summary for tracing output.
    fn summary(&self) -> String;
}
