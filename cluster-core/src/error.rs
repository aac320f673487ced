//! Error types exposed by this crate.

use thiserror::Error;

/// An error produced by invalid caller input.
///
/// These are the only errors the resolver and the schema cache surface to
/// callers for bad requests; everything transient is retried or reverted
/// internally first.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Settings were supplied for a cluster-internal index.
    #[error("Cannot modify settings of cluster indices.")]
    SystemIndexSettings,

    /// A settings field was present but had the wrong shape.
    #[error("Data inconsistency, '{0}' must be {1}")]
    InvalidSettingsType(&'static str, &'static str),

    /// A settings value was out of bounds.
    #[error("Invalid '{0}' setting")]
    InvalidSettingsValue(&'static str),

    /// A required settings value was missing (strict mode).
    #[error("Value of '{0}' is missing")]
    MissingSetting(&'static str),

    /// Shard count changes are not supported on an index that was loaded.
    #[error("It is not allowed to change 'number_of_shards' setting")]
    ShardCountChange,

    /// A foreign schema reference did not carry both an index path and a
    /// document id.
    #[error("Schema metadata is corrupt: '{uri}' must contain index and docid")]
    ForeignUriMissingParts { uri: String },

    /// A foreign schema chain re-entered an endpoint already being resolved.
    #[error("Cyclic schema reference detected: {0}")]
    CyclicSchemaReference(String),

    /// A foreign schema chain exceeded the recursion bound.
    #[error("Maximum recursion reached: {0}")]
    MaxSchemaRecursion(String),

    /// An endpoint could not be resolved to any node.
    #[error("Cannot resolve endpoint: {0}")]
    CannotResolveEndpoint(String),

    /// Optimistic retries were exhausted without converging.
    #[error("Too many conflicts resolving {0}")]
    TooManyConflicts(String),

    /// Inconsistent persisted settings.
    #[error("Inconsistency in settings configured for {0}: {1}")]
    InconsistentSettings(String, String),

    /// The backing store failed in a way retries cannot fix.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// An error from the metadata storage interface.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested document does not exist.
    #[error("document not found")]
    DocNotFound,

    /// The requested index/database does not exist.
    #[error("database not found")]
    DatabaseNotFound,

    /// An optimistic update observed a newer version than expected.
    ///
    /// Callers pattern-match on this variant to drive their retry loops.
    #[error("document version conflict (current version {current})")]
    DocVersionConflict { current: u64 },

    /// Any other backend failure.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// True for the two "absent" cases that mean "initialize from defaults".
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::DocNotFound | StoreError::DatabaseNotFound)
    }
}

/// A non-recoverable condition that terminates the discovery actor.
#[derive(Debug, Error)]
pub enum FatalError {
    /// The explicitly configured node name is already taken by another node.
    #[error("Cannot join the party. Node name {0} already taken!")]
    NameTaken(String),

    /// The discovery socket could not be created or bound.
    #[error("discovery socket error: {0}")]
    Socket(#[source] std::io::Error),
}

/// An invalid runtime configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cluster name must not be empty")]
    EmptyClusterName,

    #[error("number_of_shards must be in 1..=9999")]
    InvalidShards,

    #[error("heartbeat interval range is inverted")]
    InvalidHeartbeatRange,

    #[error("election timeout must exceed the maximum heartbeat interval")]
    InvalidElectionRange,
}
