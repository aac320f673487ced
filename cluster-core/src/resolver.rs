//! The sharded-index resolver.
//!
//! Resolves a logical index path to an ordered list of shards, each with a
//! replica list whose head is the primary. Settings are computed with jump
//! consistent hashing when absent, repaired when the primary goes away, and
//! persisted through the metadata store inside the cluster-internal
//! `.xapiand/indices` index. An aging LRU keeps hot paths cheap.

use std::collections::HashMap;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use lru::LruCache;
use rmpv::Value;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::discovery::ClusterEvent;
use crate::discovery::Discovery;
use crate::endpoint;
use crate::endpoint::Endpoint;
use crate::endpoint::SYSTEM_INDICES;
use crate::error::ClientError;
use crate::error::StoreError;
use crate::node::Node;
use crate::node::NodeRegistry;
use crate::storage::map_get;
use crate::storage::value_str;
use crate::storage::value_u64;
use crate::storage::MetadataStore;
use crate::CONFLICT_RETRIES;
use crate::UNKNOWN_VERSION;

const RESERVED_STRICT: &str = "_strict";
const RESERVED_SETTINGS: &str = "_settings";
const ID_FIELD_NAME: &str = "_id";

/// Debounce window for settings-updated notifications.
const SETTINGS_NOTIFY_DEBOUNCE: Duration = Duration::from_millis(1000);

/// One shard of an index: an ordered replica list, primary first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexSettingsShard {
    /// Version of the persisted shard document, [`UNKNOWN_VERSION`] when
    /// never loaded or saved.
    pub version: u64,
    /// The shard differs from what is persisted.
    pub modified: bool,
    /// Replica node names; index 0 is the primary.
    pub nodes: Vec<String>,
}

/// The resolved settings of an index.
#[derive(Clone, Debug, Default)]
pub struct IndexSettings {
    /// Version of the persisted aggregate document.
    pub version: u64,
    /// The settings were loaded from the metadata store.
    pub loaded: bool,
    /// The settings match what is persisted.
    pub saved: bool,
    /// The settings differ from what is persisted.
    pub modified: bool,
    /// Until when writable resolves hold off electing a new primary.
    pub stalled: Option<Instant>,
    /// Number of shards; always equals `shards.len()` once computed.
    pub num_shards: usize,
    /// Replicas per shard, counting the primary.
    pub num_replicas_plus_master: usize,
    /// The shards.
    pub shards: Vec<IndexSettingsShard>,
}

impl IndexSettings {
    fn initial(num_shards: usize, num_replicas_plus_master: usize) -> Self {
        IndexSettings {
            version: UNKNOWN_VERSION,
            loaded: false,
            saved: false,
            modified: true,
            stalled: None,
            num_shards,
            num_replicas_plus_master,
            shards: Vec::new(),
        }
    }
}

/// 64-bit FNV-1a, the stable path hash feeding the jump hash.
fn fnv1a64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &byte in data {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x1_0000_01b3);
    }
    hash
}

/// Jump consistent hash: maps `(key, n)` to a bucket in `[0, n)` with
/// minimal reassignment when `n` changes by one.
pub fn jump_consistent_hash(key: u64, num_buckets: usize) -> u64 {
    debug_assert!(num_buckets > 0);
    let mut k = key;
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < num_buckets as i64 {
        b = j;
        k = k.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        j = (((b.wrapping_add(1)) as f64) * ((1u64 << 31) as f64 / (((k >> 33).wrapping_add(1)) as f64))) as i64;
    }
    b as u64
}

/// The routing key of a path.
pub fn routing_key(path: &str, total_nodes: usize) -> u64 {
    jump_consistent_hash(fnv1a64(path.as_bytes()), total_nodes)
}

/// Pick a primary for each shard by walking the node ring down from the
/// routing key. Deterministic for fixed `(routing_key, nodes, num_shards)`.
pub fn calculate_shards(routing_key: u64, nodes: &[Arc<Node>], num_shards: usize) -> Vec<IndexSettingsShard> {
    let mut shards = Vec::new();
    if nodes.is_empty() {
        return shards;
    }
    let mut routing_key = routing_key;
    if routing_key < num_shards as u64 {
        routing_key += num_shards as u64;
    }
    for s in 0..num_shards {
        let idx = ((routing_key - s as u64) % nodes.len() as u64) as usize;
        shards.push(IndexSettingsShard {
            version: UNKNOWN_VERSION,
            modified: true,
            nodes: vec![nodes[idx].name().to_string()],
        });
    }
    shards
}

/// Grow (or trim) each shard's replica list to `num_replicas_plus_master`
/// by walking the node ring from the primary, skipping duplicates.
pub fn settle_replicas(
    settings: &mut IndexSettings,
    nodes: &[Arc<Node>],
    mut num_replicas_plus_master: usize,
) {
    if num_replicas_plus_master > nodes.len() && !nodes.is_empty() {
        num_replicas_plus_master = nodes.len();
    }
    for shard in &mut settings.shards {
        let shard_nodes_size = shard.nodes.len();
        if shard_nodes_size < num_replicas_plus_master {
            let mut used: HashSet<String> =
                shard.nodes.iter().map(|name| name.to_lowercase()).collect();
            let primary = shard.nodes[0].to_lowercase();
            let start = nodes
                .iter()
                .position(|node| node.lower_name() == primary)
                .unwrap_or(0);
            let mut idx = start;
            for _ in shard_nodes_size..num_replicas_plus_master {
                loop {
                    idx = (idx + 1) % nodes.len();
                    if !used.contains(nodes[idx].lower_name()) {
                        break;
                    }
                }
                shard.nodes.push(nodes[idx].name().to_string());
                used.insert(nodes[idx].lower_name().to_string());
            }
            shard.modified = true;
            settings.saved = false;
        } else if shard_nodes_size > num_replicas_plus_master && num_replicas_plus_master > 0 {
            shard.nodes.truncate(num_replicas_plus_master);
            shard.modified = true;
            settings.saved = false;
        }
    }
}

struct CachedSettings {
    inserted: Instant,
    settings: IndexSettings,
}

/// The index resolver: an aging LRU of [`IndexSettings`] keyed by
/// unsharded path (plus one entry per shard), backed by the metadata store.
pub struct IndexResolver {
    config: Arc<Config>,
    registry: Arc<NodeRegistry>,
    store: Arc<dyn MetadataStore>,
    discovery: Option<Discovery>,
    tx_events: Option<mpsc::UnboundedSender<ClusterEvent>>,
    cache: Mutex<LruCache<String, CachedSettings>>,
    notified: Mutex<HashMap<String, Instant>>,
}

impl IndexResolver {
    /// Create a resolver.
    ///
    /// `discovery` carries settings-updated notifications to peers and may
    /// be `None` in solo setups; `tx_events` carries `ELECT_PRIMARY`
    /// dispatches for stalled shards.
    pub fn new(
        config: Arc<Config>,
        registry: Arc<NodeRegistry>,
        store: Arc<dyn MetadataStore>,
        discovery: Option<Discovery>,
        tx_events: Option<mpsc::UnboundedSender<ClusterEvent>>,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.resolver_cache_size.max(1)).unwrap();
        Self {
            config,
            registry,
            store,
            discovery,
            tx_events,
            cache: Mutex::new(LruCache::new(capacity)),
            notified: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the settings of `normalized_path`.
    ///
    /// The workhorse behind [`resolve_index_endpoints`]
    /// (IndexResolver::resolve_index_endpoints); see the crate docs for the
    /// semantics of each flag.
    #[tracing::instrument(level = "debug", skip(self, settings, primary_node))]
    #[allow(clippy::too_many_arguments)]
    pub async fn resolve_index_settings(
        &self,
        normalized_path: &str,
        writable: bool,
        primary: bool,
        settings: Option<&Value>,
        primary_node: Option<Arc<Node>>,
        mut reload: bool,
        mut rebuild: bool,
        clear: bool,
    ) -> Result<IndexSettings, ClientError> {
        let mut strict = self.config.strict;

        // Unwrap the optional {_strict, _settings} envelope.
        let mut settings = settings;
        if let Some(obj) = settings {
            if obj.is_map() {
                if let Some(strict_val) = map_get(obj, RESERVED_STRICT) {
                    strict = strict_val
                        .as_bool()
                        .ok_or(ClientError::InvalidSettingsType(RESERVED_STRICT, "boolean"))?;
                }
                settings = map_get(obj, RESERVED_SETTINGS);
            } else {
                settings = None;
            }
        }

        if endpoint::is_system_path(normalized_path) {
            // Everything inside the system prefix has its primary on the
            // current leader and replicas everywhere.
            if settings.is_some() {
                return Err(ClientError::SystemIndexSettings);
            }
            return Ok(self.system_index_settings(normalized_path));
        }

        if primary_node.is_some() {
            reload = true;
            rebuild = true;
        }

        let (unsharded, _shard) = endpoint::unsharded_path(normalized_path);
        let unsharded_normalized_path = unsharded.to_string();

        let mut index_settings = None;
        let mut store_lru = false;

        {
            let mut cache = self.cache.lock().unwrap();
            if settings.is_none() && !reload && !rebuild && !clear {
                if let Some(cached) = self.cache_get(&mut cache, normalized_path) {
                    if !writable || cached.saved {
                        return Ok(cached);
                    }
                }
            }
            if clear {
                self.invalidate_locked(&mut cache, &unsharded_normalized_path);
                return Ok(IndexSettings::default());
            }
            if !reload {
                index_settings = self.cache_get(&mut cache, &unsharded_normalized_path);
            }
        }

        let mut index_settings = match index_settings {
            Some(settings) => {
                tracing::trace!(path=%unsharded_normalized_path, "settings loaded from LRU");
                settings
            }
            None => {
                let loaded = self.load_settings(&unsharded_normalized_path).await?;
                store_lru = true;
                if !loaded.shards.is_empty() {
                    if loaded.shards.iter().any(|shard| shard.nodes.is_empty()) {
                        // There were missing replicas, rebuild.
                        rebuild = true;
                    }
                    tracing::trace!(path=%unsharded_normalized_path, "settings loaded");
                    loaded
                } else {
                    tracing::trace!(path=%unsharded_normalized_path, "settings initialized");
                    IndexSettings::initial(self.config.num_shards, self.config.num_replicas + 1)
                }
            }
        };

        if let Some(settings) = settings {
            let mut num_shards = index_settings.num_shards;
            let mut num_replicas_plus_master = index_settings.num_replicas_plus_master;

            match map_get(settings, "number_of_shards") {
                Some(val) => {
                    num_shards = value_u64(val)
                        .ok_or(ClientError::InvalidSettingsType("number_of_shards", "integer"))?
                        as usize;
                    if num_shards == 0 || num_shards > 9999 {
                        return Err(ClientError::InvalidSettingsValue("number_of_shards"));
                    }
                }
                None => {
                    if writable && strict && !index_settings.loaded {
                        return Err(ClientError::MissingSetting("number_of_shards"));
                    }
                }
            }

            match map_get(settings, "number_of_replicas") {
                Some(val) => {
                    let num_replicas = value_u64(val)
                        .ok_or(ClientError::InvalidSettingsType("number_of_replicas", "numeric"))?
                        as usize;
                    num_replicas_plus_master = num_replicas + 1;
                    if num_replicas_plus_master > 9999 {
                        return Err(ClientError::InvalidSettingsValue("number_of_replicas"));
                    }
                }
                None => {
                    if writable && strict && !index_settings.loaded {
                        return Err(ClientError::MissingSetting("number_of_replicas"));
                    }
                }
            }

            if !index_settings.shards.is_empty() {
                if num_shards != index_settings.num_shards {
                    if index_settings.loaded {
                        return Err(ClientError::ShardCountChange);
                    }
                    rebuild = true;
                }
                if num_replicas_plus_master != index_settings.num_replicas_plus_master {
                    rebuild = true;
                }
            }

            if index_settings.num_replicas_plus_master != num_replicas_plus_master {
                index_settings.num_replicas_plus_master = num_replicas_plus_master;
                index_settings.modified = true;
                index_settings.saved = false;
            }

            if index_settings.num_shards != num_shards {
                index_settings.num_shards = num_shards;
                index_settings.modified = true;
                index_settings.saved = false;
                index_settings.shards.clear();
            }
        } else if writable && strict && !index_settings.loaded {
            return Err(ClientError::MissingSetting("settings"));
        }

        if rebuild || index_settings.shards.is_empty() {
            tracing::trace!(
                replicas = index_settings.num_replicas_plus_master - 1,
                shards = index_settings.num_shards,
                "configuring shards"
            );
            let nodes = self.registry.nodes();
            if index_settings.shards.is_empty() {
                let key = routing_key(&unsharded_normalized_path, self.registry.total_nodes().max(1));
                index_settings.shards = calculate_shards(key, &nodes, index_settings.num_shards);
                index_settings.modified = true;
                index_settings.saved = false;
            }
            let num_replicas_plus_master = index_settings.num_replicas_plus_master;
            settle_replicas(&mut index_settings, &nodes, num_replicas_plus_master);

            if writable {
                self.update_primary(&unsharded_normalized_path, &mut index_settings, primary_node);
            }
            store_lru = true;
        }

        if !index_settings.shards.is_empty() {
            if writable && !index_settings.saved {
                self.save_settings(&unsharded_normalized_path, &mut index_settings).await?;
                store_lru = true;
            }

            let mut shard_settings = None;
            if store_lru {
                let mut cache = self.cache.lock().unwrap();
                cache.put(
                    unsharded_normalized_path.clone(),
                    CachedSettings { inserted: Instant::now(), settings: index_settings.clone() },
                );
                for (shard_num, shard) in index_settings.shards.iter().enumerate() {
                    let path = endpoint::shard_path(&unsharded_normalized_path, shard_num + 1);
                    let single = IndexSettings {
                        version: shard.version,
                        loaded: index_settings.loaded,
                        saved: index_settings.saved,
                        modified: shard.modified,
                        stalled: index_settings.stalled,
                        num_shards: 1,
                        num_replicas_plus_master: index_settings.num_replicas_plus_master,
                        shards: vec![shard.clone()],
                    };
                    if path == normalized_path {
                        shard_settings = Some(single.clone());
                    }
                    cache.put(path, CachedSettings { inserted: Instant::now(), settings: single });
                }
            } else {
                for (shard_num, shard) in index_settings.shards.iter().enumerate() {
                    let path = endpoint::shard_path(&unsharded_normalized_path, shard_num + 1);
                    if path == normalized_path {
                        shard_settings = Some(IndexSettings {
                            version: shard.version,
                            loaded: index_settings.loaded,
                            saved: index_settings.saved,
                            modified: shard.modified,
                            stalled: index_settings.stalled,
                            num_shards: 1,
                            num_replicas_plus_master: index_settings.num_replicas_plus_master,
                            shards: vec![shard.clone()],
                        });
                        break;
                    }
                }
            }
            if let Some(shard_settings) = shard_settings {
                return Ok(shard_settings);
            }
        }
        Ok(index_settings)
    }

    /// Resolve a logical endpoint to one `(node, path)` endpoint per shard.
    ///
    /// Writable resolves retry on version conflicts until the concurrent
    /// writers converge, up to [`CONFLICT_RETRIES`] times.
    #[tracing::instrument(level = "debug", skip(self, settings), fields(endpoint=%endpoint))]
    pub async fn resolve_index_endpoints(
        &self,
        endpoint: &Endpoint,
        writable: bool,
        primary: bool,
        settings: Option<&Value>,
    ) -> Result<Vec<Endpoint>, ClientError> {
        let (unsharded, shard) = endpoint::unsharded_path(&endpoint.path);
        let unsharded_normalized_path = unsharded.to_string();
        let is_shard_query = shard.is_some();

        let mut rebuild = false;
        let mut t = CONFLICT_RETRIES;
        loop {
            let res = self
                .resolve_index_settings(
                    &unsharded_normalized_path,
                    writable,
                    primary,
                    settings,
                    None,
                    t != CONFLICT_RETRIES,
                    rebuild,
                    false,
                )
                .await;
            let index_settings = match res {
                Ok(index_settings) => index_settings,
                Err(ClientError::Store(StoreError::DocVersionConflict { .. })) => {
                    t -= 1;
                    if t == 0 {
                        return Err(ClientError::TooManyConflicts(endpoint.path.clone()));
                    }
                    continue;
                }
                Err(err) => return Err(err),
            };

            let retry = !rebuild;
            rebuild = false;

            let mut endpoints = Vec::new();
            let n_shards = index_settings.shards.len();
            for (shard_num, shard) in index_settings.shards.iter().enumerate() {
                let path = if n_shards == 1 {
                    unsharded_normalized_path.clone()
                } else {
                    endpoint::shard_path(&unsharded_normalized_path, shard_num + 1)
                };
                if is_shard_query && path != endpoint.path {
                    continue;
                }

                let is_active = |name: &String| {
                    self.registry
                        .get(name)
                        .map(|node| self.registry.is_active(&node))
                        .unwrap_or(false)
                };
                let chosen = if writable {
                    // Writes go to the primary; an unreachable primary
                    // forces one rebuild pass, which repairs it.
                    match shard.nodes.first() {
                        Some(name) if is_active(name) => Some(name.clone()),
                        other => {
                            rebuild = retry;
                            other.cloned()
                        }
                    }
                } else if primary {
                    // The primary is the first replica, active or not.
                    shard.nodes.first().cloned()
                } else {
                    shard
                        .nodes
                        .iter()
                        .find(|name| is_active(name))
                        .cloned()
                        .or_else(|| shard.nodes.last().cloned())
                };

                let mut resolved = Endpoint::local(&path);
                resolved.node_name = chosen;
                endpoints.push(resolved);
                if rebuild || is_shard_query {
                    break;
                }
            }

            if !rebuild {
                return Ok(endpoints);
            }
        }
    }

    /// Evict the aggregate entry and every per-shard entry for a path.
    pub fn invalidate(&self, uri: &str) {
        let endpoint = Endpoint::parse(uri);
        let (unsharded, _) = endpoint::unsharded_path(&endpoint.path);
        let mut cache = self.cache.lock().unwrap();
        self.invalidate_locked(&mut cache, unsharded);
    }

    fn invalidate_locked(&self, cache: &mut LruCache<String, CachedSettings>, unsharded: &str) {
        if let Some(cached) = cache.pop(unsharded) {
            if cached.settings.num_shards > 1 {
                for shard_num in 1..=cached.settings.num_shards {
                    cache.pop(&endpoint::shard_path(unsharded, shard_num));
                }
            }
        }
    }

    fn cache_get(&self, cache: &mut LruCache<String, CachedSettings>, path: &str) -> Option<IndexSettings> {
        match cache.get(path) {
            Some(cached) if cached.inserted.elapsed() <= self.config.resolver_cache_timeout => {
                Some(cached.settings.clone())
            }
            Some(_) => {
                cache.pop(path);
                None
            }
            None => None,
        }
    }

    /// System indices: primary on the current leader, replicas everywhere.
    fn system_index_settings(&self, normalized_path: &str) -> IndexSettings {
        let leader = self.registry.leader_node();
        let primary_node = if leader.is_empty() { self.registry.local_node() } else { leader };
        if !self.registry.is_active(&primary_node) {
            tracing::warn!("Primary node {} is not active!", primary_node.name());
        }
        let mut shard = IndexSettingsShard {
            version: UNKNOWN_VERSION,
            modified: false,
            nodes: vec![primary_node.name().to_string()],
        };
        for node in self.registry.nodes() {
            if node.lower_name() != primary_node.lower_name() {
                shard.nodes.push(node.name().to_string());
            }
        }

        let mut settings = IndexSettings::default();
        if normalized_path == SYSTEM_INDICES {
            // The settings index itself gets the default number of shards.
            for _ in 0..self.config.num_shards {
                settings.shards.push(shard.clone());
            }
            settings.num_shards = self.config.num_shards;
        } else {
            settings.shards.push(shard);
            settings.num_shards = 1;
        }
        settings.num_replicas_plus_master = settings.shards[0].nodes.len();
        settings
    }

    /// Swap an unreachable primary with the first active replica; stall and
    /// eventually dispatch ELECT_PRIMARY when no replica is active either.
    fn update_primary(
        &self,
        unsharded_normalized_path: &str,
        settings: &mut IndexSettings,
        primary_node: Option<Arc<Node>>,
    ) {
        let now = Instant::now();
        if matches!(settings.stalled, Some(stalled) if stalled > now) {
            return;
        }

        let mut updated = false;
        let num_shards = settings.shards.len();
        for (shard_num, shard) in settings.shards.iter_mut().enumerate() {
            let healthy = shard.nodes.iter().position(|name| {
                self.registry
                    .get(name)
                    .map(|node| {
                        self.registry.is_active(&node)
                            || matches!(&primary_node, Some(primary) if primary.is_similar(&node))
                    })
                    .unwrap_or(false)
            });
            match healthy {
                Some(0) => {}
                Some(pos) => {
                    let shard_path = if num_shards > 1 {
                        endpoint::shard_path(unsharded_normalized_path, shard_num + 1)
                    } else {
                        unsharded_normalized_path.to_string()
                    };
                    tracing::info!(
                        "Primary shard {} moved from node {} to {}",
                        shard_path,
                        shard.nodes[0],
                        shard.nodes[pos]
                    );
                    shard.nodes.swap(0, pos);
                    shard.modified = true;
                    settings.saved = false;
                    updated = true;
                }
                None => match settings.stalled {
                    None => {
                        settings.stalled = Some(now + self.config.stall_time);
                        break;
                    }
                    Some(stalled) if stalled <= now => {
                        let primary_seen = shard
                            .nodes
                            .first()
                            .and_then(|name| self.registry.get(name))
                            .map(|node| self.registry.is_active(&node))
                            .unwrap_or(false);
                        if !primary_seen {
                            let shard_path = if num_shards > 1 {
                                endpoint::shard_path(unsharded_normalized_path, shard_num + 1)
                            } else {
                                unsharded_normalized_path.to_string()
                            };
                            if let Some(tx) = &self.tx_events {
                                let _ = tx.send(ClusterEvent::ElectPrimary(shard_path));
                            }
                        }
                        settings.stalled = Some(now + self.config.stall_time);
                    }
                    _ => {}
                },
            }
        }

        if updated && !self.config.solo {
            settings.stalled = None;
        }
    }

    /// Load persisted settings; absence means "initialize from defaults".
    async fn load_settings(&self, unsharded_normalized_path: &str) -> Result<IndexSettings, ClientError> {
        let (obj, version) = match self.store.get_document(SYSTEM_INDICES, unsharded_normalized_path).await {
            Ok(found) => found,
            Err(err) if err.is_not_found() => return Ok(IndexSettings::default()),
            Err(err) => return Err(err.into()),
        };

        let mut index_settings = IndexSettings {
            version,
            num_replicas_plus_master: 1,
            ..IndexSettings::default()
        };

        if let Some(val) = map_get(&obj, "number_of_replicas") {
            let num_replicas = value_u64(val).ok_or_else(|| {
                ClientError::InconsistentSettings(
                    unsharded_normalized_path.to_string(),
                    "invalid 'number_of_replicas'".to_string(),
                )
            })?;
            index_settings.num_replicas_plus_master = num_replicas as usize + 1;
        }

        if let Some(shards_val) = map_get(&obj, "shards") {
            // Inline replica list: a single-shard index.
            let shard = load_replicas(unsharded_normalized_path, shards_val, version)?;
            self.check_replicas(unsharded_normalized_path, &shard, &index_settings, 0)?;
            index_settings.shards.push(shard);
            index_settings.num_shards = 1;
        } else if let Some(val) = map_get(&obj, "number_of_shards") {
            let num_shards = value_u64(val).ok_or_else(|| {
                ClientError::InconsistentSettings(
                    unsharded_normalized_path.to_string(),
                    "invalid 'number_of_shards'".to_string(),
                )
            })? as usize;
            index_settings.num_shards = num_shards;
            let mut replicas_size = 0;
            for shard_num in 1..=num_shards {
                let shard_normalized_path = endpoint::shard_path(unsharded_normalized_path, shard_num);
                let (shard_obj, shard_version) =
                    match self.store.get_document(SYSTEM_INDICES, &shard_normalized_path).await {
                        Ok(found) => found,
                        Err(err) if err.is_not_found() => {
                            // Missing replicas; the caller will rebuild.
                            index_settings.shards.push(IndexSettingsShard::default());
                            continue;
                        }
                        Err(err) => return Err(err.into()),
                    };
                let shards_val = map_get(&shard_obj, "shards").cloned().unwrap_or(Value::Nil);
                let shard = load_replicas(&shard_normalized_path, &shards_val, shard_version)?;
                self.check_replicas(unsharded_normalized_path, &shard, &index_settings, replicas_size)?;
                replicas_size = shard.nodes.len();
                index_settings.shards.push(shard);
            }
        } else {
            return Ok(IndexSettings::default());
        }

        index_settings.loaded = true;
        index_settings.saved = true;
        Ok(index_settings)
    }

    fn check_replicas(
        &self,
        path: &str,
        shard: &IndexSettingsShard,
        settings: &IndexSettings,
        previous_size: usize,
    ) -> Result<(), ClientError> {
        let size = shard.nodes.len();
        if size == 0
            || (settings.num_replicas_plus_master != 0 && size > settings.num_replicas_plus_master)
            || (previous_size != 0 && previous_size != size)
        {
            return Err(ClientError::InconsistentSettings(
                path.to_string(),
                "inconsistent number of replicas".to_string(),
            ));
        }
        Ok(())
    }

    /// Persist modified settings, then notify peers (debounced).
    async fn save_settings(
        &self,
        unsharded_normalized_path: &str,
        index_settings: &mut IndexSettings,
    ) -> Result<(), ClientError> {
        debug_assert_eq!(index_settings.shards.len(), index_settings.num_shards);

        let was_saved = index_settings.saved;

        if index_settings.num_shards == 1 {
            self.save_shard(unsharded_normalized_path, index_settings.num_replicas_plus_master, 1, &mut index_settings.shards[0])
                .await?;
            index_settings.saved = true;
            index_settings.loaded = true;
        } else if index_settings.num_shards != 0 {
            if !index_settings.shards[0].nodes.is_empty() {
                if index_settings.modified {
                    let obj = Value::Map(vec![
                        (Value::from(ID_FIELD_NAME), Value::from(unsharded_normalized_path)),
                        (Value::from("number_of_shards"), Value::from(index_settings.num_shards as u64)),
                        (
                            Value::from("number_of_replicas"),
                            Value::from(index_settings.num_replicas_plus_master as u64 - 1),
                        ),
                    ]);
                    let version = self
                        .store
                        .update(SYSTEM_INDICES, unsharded_normalized_path, index_settings.version, true, obj, false)
                        .await?;
                    index_settings.version = version;
                    index_settings.modified = false;
                }
            }
            for (shard_num, shard) in index_settings.shards.iter_mut().enumerate() {
                if !shard.nodes.is_empty() {
                    let shard_normalized_path =
                        endpoint::shard_path(unsharded_normalized_path, shard_num + 1);
                    self.save_shard(&shard_normalized_path, index_settings.num_replicas_plus_master, 1, shard)
                        .await?;
                }
            }
            index_settings.saved = true;
            index_settings.loaded = true;
        }

        if !was_saved && index_settings.saved {
            self.notify_settings_updated(unsharded_normalized_path);
        }
        Ok(())
    }

    async fn save_shard(
        &self,
        path: &str,
        num_replicas_plus_master: usize,
        num_shards: usize,
        shard: &mut IndexSettingsShard,
    ) -> Result<(), StoreError> {
        if !shard.modified {
            return Ok(());
        }
        let obj = Value::Map(vec![
            (Value::from(ID_FIELD_NAME), Value::from(path)),
            (Value::from("number_of_shards"), Value::from(num_shards as u64)),
            (
                Value::from("number_of_replicas"),
                Value::from(num_replicas_plus_master as u64 - 1),
            ),
            (
                Value::from("shards"),
                Value::Array(shard.nodes.iter().map(|name| Value::from(name.as_str())).collect()),
            ),
        ]);
        let version = self.store.update(SYSTEM_INDICES, path, shard.version, true, obj, false).await?;
        shard.version = version;
        shard.modified = false;
        Ok(())
    }

    /// Broadcast a DB_UPDATED for the settings path, at most once per
    /// debounce window.
    fn notify_settings_updated(&self, path: &str) {
        if self.config.solo {
            return;
        }
        let discovery = match &self.discovery {
            Some(discovery) => discovery,
            None => return,
        };
        let now = Instant::now();
        let mut notified = self.notified.lock().unwrap();
        match notified.get(path) {
            Some(&last) if now.duration_since(last) < SETTINGS_NOTIFY_DEBOUNCE => {}
            _ => {
                notified.insert(path.to_string(), now);
                discovery.db_update_send(path);
            }
        }
    }
}

fn load_replicas(path: &str, shards_val: &Value, version: u64) -> Result<IndexSettingsShard, ClientError> {
    let mut shard = IndexSettingsShard {
        version,
        ..IndexSettingsShard::default()
    };
    match shards_val {
        Value::Array(entries) => {
            for entry in entries {
                let name = value_str(entry).ok_or_else(|| {
                    ClientError::InconsistentSettings(path.to_string(), "invalid node name".to_string())
                })?;
                shard.nodes.push(name.to_string());
            }
        }
        Value::Nil => {}
        _ => {
            return Err(ClientError::InconsistentSettings(
                path.to_string(),
                "invalid 'shards' array".to_string(),
            ))
        }
    }
    Ok(shard)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn nodes(names: &[&str]) -> Vec<Arc<Node>> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let mut node = Node::new(*name);
                node.idx = i as u64 + 1;
                Arc::new(node)
            })
            .collect()
    }

    #[test]
    fn jump_hash_is_deterministic_and_in_range() {
        for key in 0..1000u64 {
            let a = jump_consistent_hash(key, 7);
            let b = jump_consistent_hash(key, 7);
            assert_eq!(a, b);
            assert!(a < 7);
        }
    }

    #[test]
    fn jump_hash_movement_is_bounded() {
        // Growing the bucket count by one must only move ~1/n of the keys.
        let keys = 10_000u64;
        let n = 10;
        let moved = (0..keys)
            .filter(|&key| jump_consistent_hash(key, n) != jump_consistent_hash(key, n + 1))
            .count();
        assert!(moved as f64 <= keys as f64 / n as f64 * 1.5, "moved {} of {}", moved, keys);
    }

    #[test]
    fn calculate_shards_is_deterministic() {
        let nodes = nodes(&["n1", "n2", "n3"]);
        let key = routing_key("some/index", nodes.len());
        let a = calculate_shards(key, &nodes, 4);
        let b = calculate_shards(key, &nodes, 4);
        assert_eq!(a, b);
        assert_eq!(a.len(), 4);
        for shard in &a {
            assert_eq!(shard.nodes.len(), 1);
        }
        // Consecutive shards walk the ring, so neighbors differ.
        assert_ne!(a[0].nodes[0], a[1].nodes[0]);
    }

    #[test]
    fn settle_replicas_grows_to_target_without_duplicates() {
        let nodes = nodes(&["n1", "n2", "n3", "n4"]);
        let key = routing_key("some/index", nodes.len());
        let mut settings = IndexSettings::initial(2, 3);
        settings.shards = calculate_shards(key, &nodes, 2);
        settle_replicas(&mut settings, &nodes, 3);
        for shard in &settings.shards {
            assert_eq!(shard.nodes.len(), 3);
            let unique: HashSet<_> = shard.nodes.iter().map(|n| n.to_lowercase()).collect();
            assert_eq!(unique.len(), 3);
        }
    }

    #[test]
    fn settle_replicas_caps_at_total_nodes() {
        let nodes = nodes(&["n1", "n2"]);
        let key = routing_key("idx", nodes.len());
        let mut settings = IndexSettings::initial(1, 5);
        settings.shards = calculate_shards(key, &nodes, 1);
        settle_replicas(&mut settings, &nodes, 5);
        assert_eq!(settings.shards[0].nodes.len(), 2);
    }

    #[test]
    fn settle_replicas_trims_excess() {
        let nodes = nodes(&["n1", "n2", "n3"]);
        let mut settings = IndexSettings::initial(1, 1);
        settings.shards = vec![IndexSettingsShard {
            version: UNKNOWN_VERSION,
            modified: false,
            nodes: vec!["n1".into(), "n2".into(), "n3".into()],
        }];
        settle_replicas(&mut settings, &nodes, 1);
        assert_eq!(settings.shards[0].nodes, vec!["n1".to_string()]);
        assert!(settings.shards[0].modified);
    }
}
