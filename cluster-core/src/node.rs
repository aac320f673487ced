//! Cluster nodes and the process-wide node registry.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::time::Duration;
use std::time::Instant;

use lazy_static::lazy_static;

use crate::wire;
use crate::wire::WireError;
use crate::MessageSummary;

lazy_static! {
    /// Monotonic epoch for node touch timestamps.
    static ref EPOCH: Instant = Instant::now();
}

fn now_millis() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

/// A known cluster node.
///
/// The identity fields are immutable once the record is shared; liveness
/// (`touched`) and activation are atomics so refreshing a node never clones
/// the registry entry. Records with richer identity (a non-zero idx, a host
/// where none was known) replace the shared `Arc` through
/// [`NodeRegistry::touch`].
#[derive(Debug, Default)]
pub struct Node {
    /// The cluster index assigned through the committed Raft log;
    /// 0 means not yet assigned.
    pub idx: u64,
    name: String,
    lower_name: String,
    host: String,
    /// Advertised HTTP port.
    pub http_port: u16,
    /// Advertised remote-protocol port.
    pub remote_port: u16,
    /// Advertised replication port.
    pub replication_port: u16,

    activated: AtomicBool,
    touched: AtomicU64,
}

impl Clone for Node {
    fn clone(&self) -> Self {
        Self {
            idx: self.idx,
            name: self.name.clone(),
            lower_name: self.lower_name.clone(),
            host: self.host.clone(),
            http_port: self.http_port,
            remote_port: self.remote_port,
            replication_port: self.replication_port,
            activated: AtomicBool::new(self.activated.load(Ordering::Acquire)),
            touched: AtomicU64::new(self.touched.load(Ordering::Acquire)),
        }
    }
}

impl Node {
    /// Create a node record with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        let mut node = Node::default();
        node.set_name(name);
        node
    }

    /// Set the node name, refreshing the case-folded key.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.lower_name = self.name.to_lowercase();
    }

    /// Set the node host address.
    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = host.into();
    }

    /// The node name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The case-folded node name (the registry key).
    pub fn lower_name(&self) -> &str {
        &self.lower_name
    }

    /// The node host address, empty when unknown.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// True when this record carries no identity at all.
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }

    /// Whether the node was activated by a WAVE or ENTER.
    pub fn is_activated(&self) -> bool {
        self.activated.load(Ordering::Acquire)
    }

    pub(crate) fn set_activated(&self) {
        self.activated.store(true, Ordering::Release);
    }

    /// Age of the last refresh; `None` when the node was never touched.
    pub fn last_seen_age(&self) -> Option<Duration> {
        match self.touched.load(Ordering::Acquire) {
            0 => None,
            millis => Some(Duration::from_millis(now_millis().saturating_sub(millis))),
        }
    }

    pub(crate) fn touch_now(&self) {
        self.touched.store(now_millis().max(1), Ordering::Release);
    }

    /// Two records describe the same node: same name, and no conflicting
    /// address information (fields one side doesn't know yet don't count).
    pub fn is_similar(&self, other: &Node) -> bool {
        if self.lower_name != other.lower_name {
            return false;
        }
        if !self.host.is_empty() && !other.host.is_empty() && self.host != other.host {
            return false;
        }
        for (a, b) in [
            (self.http_port, other.http_port),
            (self.remote_port, other.remote_port),
            (self.replication_port, other.replication_port),
        ] {
            if a != 0 && b != 0 && a != b {
                return false;
            }
        }
        true
    }

    /// True when `self` carries at least all the identity `other` does.
    pub fn is_superset(&self, other: &Node) -> bool {
        self.is_similar(other)
            && (other.host.is_empty() || !self.host.is_empty())
            && (other.idx == 0 || self.idx == other.idx)
    }

    /// Serialize for inclusion in a cluster message.
    pub fn serialise(&self, buf: &mut Vec<u8>) {
        wire::serialise_length(buf, self.idx);
        wire::serialise_string(buf, &self.name);
        wire::serialise_string(buf, &self.host);
        wire::serialise_length(buf, u64::from(self.http_port));
        wire::serialise_length(buf, u64::from(self.remote_port));
        wire::serialise_length(buf, u64::from(self.replication_port));
    }

    /// Decode a node record from the front of `input`.
    pub fn unserialise(input: &mut &[u8]) -> Result<Node, WireError> {
        let idx = wire::unserialise_length(input)?;
        let name = wire::unserialise_string(input)?;
        let host = wire::unserialise_string(input)?;
        let http_port = wire::unserialise_length(input)? as u16;
        let remote_port = wire::unserialise_length(input)? as u16;
        let replication_port = wire::unserialise_length(input)? as u16;
        let mut node = Node::new(name);
        node.idx = idx;
        node.host = host;
        node.http_port = http_port;
        node.remote_port = remote_port;
        node.replication_port = replication_port;
        Ok(node)
    }
}

impl MessageSummary for Node {
    fn summary(&self) -> String {
        format!("[{}] {}@{}", self.idx, self.name, self.host)
    }
}

/// The outcome of dropping a node from the registry.
#[derive(Debug, PartialEq, Eq)]
pub enum Dropped {
    /// The node was not known.
    NotFound,
    /// The node was removed.
    Removed,
    /// The node was removed and it was the leader; the caller must renew
    /// the leader.
    WasLeader,
}

/// The process-wide set of known nodes.
///
/// Keyed by case-folded name, read-mostly; all mutation goes through
/// [`touch`](NodeRegistry::touch), [`drop_node`](NodeRegistry::drop_node)
/// and the local/leader setters, each of which atomically refreshes the
/// total/alive/active counters. The local and leader slots always hold the
/// same `Arc` as the map entry of the same name, so resolving them through
/// the map yields the same object identity as the slot read.
pub struct NodeRegistry {
    lifespan: Duration,
    nodes: Mutex<HashMap<String, Arc<Node>>>,
    local: RwLock<Arc<Node>>,
    leader: RwLock<Arc<Node>>,
    total: AtomicUsize,
    alive: AtomicUsize,
    active: AtomicUsize,
}

impl NodeRegistry {
    /// Create a registry; `lifespan` is how long a silent node stays alive.
    pub fn new(lifespan: Duration) -> Self {
        Self {
            lifespan,
            nodes: Mutex::new(HashMap::new()),
            local: RwLock::new(Arc::new(Node::default())),
            leader: RwLock::new(Arc::new(Node::default())),
            total: AtomicUsize::new(0),
            alive: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
        }
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<Arc<Node>> {
        let nodes = self.nodes.lock().unwrap();
        nodes.get(&name.to_lowercase()).cloned()
    }

    /// The local node (an empty sentinel before registration).
    pub fn local_node(&self) -> Arc<Node> {
        self.local.read().unwrap().clone()
    }

    /// The leader node (an empty sentinel when unknown).
    pub fn leader_node(&self) -> Arc<Node> {
        self.leader.read().unwrap().clone()
    }

    /// True when the given node is the local node.
    pub fn is_local(&self, node: &Node) -> bool {
        let local = self.local.read().unwrap();
        !local.is_empty() && local.is_similar(node)
    }

    /// True when the given node is the known leader.
    pub fn is_leader(&self, node: &Node) -> bool {
        let leader = self.leader.read().unwrap();
        !leader.is_empty() && leader.is_similar(node)
    }

    /// A node is alive while it was seen within the lifespan, or it is the
    /// local node.
    pub fn is_alive(&self, node: &Node) -> bool {
        match node.last_seen_age() {
            Some(age) if age <= self.lifespan => true,
            _ => self.is_local(node),
        }
    }

    /// A node is active when it is alive and was activated.
    pub fn is_active(&self, node: &Node) -> bool {
        node.is_activated() && self.is_alive(node)
    }

    /// Insert-or-merge a node record.
    ///
    /// Returns `None` when the name is already taken by a different address
    /// (the caller must SNEER the remote). Otherwise returns the shared
    /// record and whether it was newly inserted. `activate` marks the node
    /// activated (WAVE/ENTER only); `touch` refreshes `last_seen`.
    #[tracing::instrument(level = "trace", skip(self, node), fields(node=%node.name()))]
    pub fn touch(&self, node: &Node, activate: bool, touch: bool) -> Option<(Arc<Node>, bool)> {
        if node.is_empty() {
            return None;
        }
        let mut nodes = self.nodes.lock().unwrap();
        let key = node.lower_name().to_string();
        let (entry, inserted) = match nodes.get(&key) {
            None => {
                let entry = Arc::new(node.clone());
                nodes.insert(key.clone(), entry.clone());
                (entry, true)
            }
            Some(existing) => {
                if !existing.is_similar(node) {
                    tracing::debug!(
                        existing = %existing.summary(),
                        remote = %node.summary(),
                        "rejected node with conflicting address"
                    );
                    return None;
                }
                let needs_upgrade = (node.idx != 0 && existing.idx != node.idx)
                    || (existing.host().is_empty() && !node.host().is_empty())
                    || (existing.http_port == 0 && node.http_port != 0)
                    || (existing.remote_port == 0 && node.remote_port != 0)
                    || (existing.replication_port == 0 && node.replication_port != 0);
                if needs_upgrade {
                    let mut merged = (**existing).clone();
                    if node.idx != 0 {
                        merged.idx = node.idx;
                    }
                    if merged.host.is_empty() {
                        merged.host = node.host.clone();
                    }
                    if merged.http_port == 0 {
                        merged.http_port = node.http_port;
                    }
                    if merged.remote_port == 0 {
                        merged.remote_port = node.remote_port;
                    }
                    if merged.replication_port == 0 {
                        merged.replication_port = node.replication_port;
                    }
                    let entry = Arc::new(merged);
                    nodes.insert(key.clone(), entry.clone());
                    (entry, false)
                } else {
                    (existing.clone(), false)
                }
            }
        };
        if activate {
            entry.set_activated();
        }
        if touch {
            entry.touch_now();
        }
        // Keep slot identity in sync with the map entry.
        {
            let mut local = self.local.write().unwrap();
            if !local.is_empty() && local.lower_name() == key {
                entry.set_activated();
                *local = entry.clone();
            }
        }
        {
            let mut leader = self.leader.write().unwrap();
            if !leader.is_empty() && leader.lower_name() == key {
                *leader = entry.clone();
            }
        }
        self.update_counters(&nodes);
        Some((entry, inserted))
    }

    /// Remove a node by name.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn drop_node(&self, name: &str) -> Dropped {
        let key = name.to_lowercase();
        let mut nodes = self.nodes.lock().unwrap();
        if nodes.remove(&key).is_none() {
            return Dropped::NotFound;
        }
        self.update_counters(&nodes);
        let mut leader = self.leader.write().unwrap();
        if !leader.is_empty() && leader.lower_name() == key {
            *leader = Arc::new(Node::default());
            return Dropped::WasLeader;
        }
        Dropped::Removed
    }

    /// Atomically swap the local node, registering it in the map.
    pub fn set_local(&self, node: Node) -> Arc<Node> {
        let entry = Arc::new(node);
        let mut nodes = self.nodes.lock().unwrap();
        if !entry.is_empty() {
            entry.set_activated();
            entry.touch_now();
            nodes.insert(entry.lower_name().to_string(), entry.clone());
        }
        *self.local.write().unwrap() = entry.clone();
        self.update_counters(&nodes);
        entry
    }

    /// Atomically swap the leader node, registering it in the map.
    pub fn set_leader(&self, node: Node) -> Arc<Node> {
        let mut nodes = self.nodes.lock().unwrap();
        let entry = if node.is_empty() {
            Arc::new(node)
        } else {
            let key = node.lower_name().to_string();
            match nodes.get(&key) {
                Some(existing) if existing.is_similar(&node) => existing.clone(),
                _ => {
                    let entry = Arc::new(node);
                    nodes.insert(key, entry.clone());
                    entry
                }
            }
        };
        *self.leader.write().unwrap() = entry.clone();
        self.update_counters(&nodes);
        entry
    }

    /// Snapshot of all known nodes, ordered by (idx, name) so ring walks are
    /// deterministic.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        let nodes = self.nodes.lock().unwrap();
        let mut all: Vec<_> = nodes.values().cloned().collect();
        all.sort_by(|a, b| (a.idx, a.lower_name()).cmp(&(b.idx, b.lower_name())));
        all
    }

    /// Total known nodes.
    pub fn total_nodes(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    /// Nodes currently alive.
    pub fn alive_nodes(&self) -> usize {
        self.alive.load(Ordering::Acquire)
    }

    /// Nodes currently active.
    pub fn active_nodes(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Strict majority over `total`, trivially true for an empty cluster.
    pub fn quorum(total: usize, votes: usize) -> bool {
        total == 0 || votes > total / 2
    }

    /// Clear the registry entirely.
    pub fn reset(&self) {
        let mut nodes = self.nodes.lock().unwrap();
        nodes.clear();
        *self.local.write().unwrap() = Arc::new(Node::default());
        *self.leader.write().unwrap() = Arc::new(Node::default());
        self.update_counters(&nodes);
    }

    fn update_counters(&self, nodes: &HashMap<String, Arc<Node>>) {
        let total = nodes.len();
        let mut alive = 0;
        let mut active = 0;
        let local = self.local.read().unwrap();
        for node in nodes.values() {
            let is_alive = match node.last_seen_age() {
                Some(age) if age <= self.lifespan => true,
                _ => !local.is_empty() && local.lower_name() == node.lower_name(),
            };
            if is_alive {
                alive += 1;
                if node.is_activated() {
                    active += 1;
                }
            }
        }
        self.total.store(total, Ordering::Release);
        self.alive.store(alive, Ordering::Release);
        self.active.store(active, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn registry() -> NodeRegistry {
        NodeRegistry::new(Duration::from_secs(25))
    }

    fn node(name: &str, host: &str) -> Node {
        let mut n = Node::new(name);
        n.set_host(host);
        n.http_port = 8880;
        n.remote_port = 8881;
        n.replication_port = 8882;
        n
    }

    #[test]
    fn node_serialise_roundtrip() {
        let mut n = node("N1", "10.0.0.1");
        n.idx = 3;
        let mut buf = Vec::new();
        n.serialise(&mut buf);
        let mut p = buf.as_slice();
        let back = Node::unserialise(&mut p).unwrap();
        assert!(p.is_empty());
        assert_eq!(back.idx, 3);
        assert_eq!(back.name(), "N1");
        assert_eq!(back.lower_name(), "n1");
        assert_eq!(back.host(), "10.0.0.1");
        assert_eq!(back.http_port, 8880);
    }

    #[test]
    fn touch_is_idempotent() {
        let reg = registry();
        let n = node("n1", "10.0.0.1");
        let (first, inserted) = reg.touch(&n, true, true).unwrap();
        assert!(inserted);
        for _ in 0..5 {
            let (again, inserted) = reg.touch(&n, true, true).unwrap();
            assert!(!inserted);
            assert!(Arc::ptr_eq(&first, &again));
        }
        assert_eq!(reg.total_nodes(), 1);
        assert_eq!(reg.active_nodes(), 1);
    }

    #[test]
    fn touch_rejects_conflicting_address() {
        let reg = registry();
        reg.touch(&node("n1", "10.0.0.1"), true, true).unwrap();
        assert!(reg.touch(&node("n1", "10.0.0.2"), true, true).is_none());
        // Case-insensitive: same conflict under a different case.
        assert!(reg.touch(&node("N1", "10.0.0.2"), true, true).is_none());
    }

    #[test]
    fn touch_merges_richer_records() {
        let reg = registry();
        let mut bare = Node::new("n1");
        bare.idx = 0;
        let (first, _) = reg.touch(&bare, false, true).unwrap();
        assert_eq!(first.idx, 0);
        assert!(first.host().is_empty());

        let mut indexed = node("n1", "10.0.0.1");
        indexed.idx = 7;
        let (merged, inserted) = reg.touch(&indexed, false, true).unwrap();
        assert!(!inserted);
        assert_eq!(merged.idx, 7);
        assert_eq!(merged.host(), "10.0.0.1");
        assert!(Arc::ptr_eq(&reg.get("N1").unwrap(), &merged));
    }

    #[test]
    fn activation_only_when_requested() {
        let reg = registry();
        let (n, _) = reg.touch(&node("n1", "10.0.0.1"), false, true).unwrap();
        assert!(!n.is_activated());
        assert_eq!(reg.active_nodes(), 0);
        reg.touch(&node("n1", "10.0.0.1"), true, true).unwrap();
        assert!(n.is_activated());
        assert_eq!(reg.active_nodes(), 1);
    }

    #[test]
    fn drop_leader_signals_renew() {
        let reg = registry();
        reg.touch(&node("n1", "10.0.0.1"), true, true).unwrap();
        reg.touch(&node("n2", "10.0.0.2"), true, true).unwrap();
        reg.set_leader(node("n2", "10.0.0.2"));
        assert_eq!(reg.drop_node("n1"), Dropped::Removed);
        assert_eq!(reg.drop_node("n2"), Dropped::WasLeader);
        assert!(reg.leader_node().is_empty());
        assert_eq!(reg.drop_node("n2"), Dropped::NotFound);
    }

    #[test]
    fn local_and_leader_resolve_to_map_identity() {
        let reg = registry();
        let local = reg.set_local(node("n1", "10.0.0.1"));
        assert!(Arc::ptr_eq(&reg.get("n1").unwrap(), &local));

        // A touch that upgrades the record must refresh the slot too.
        let mut richer = node("n1", "10.0.0.1");
        richer.idx = 2;
        let (merged, _) = reg.touch(&richer, false, true).unwrap();
        assert!(Arc::ptr_eq(&reg.local_node(), &merged));
        assert_eq!(reg.local_node().idx, 2);
    }

    #[test]
    fn local_node_is_always_alive() {
        let reg = registry();
        let local = reg.set_local(node("n1", "10.0.0.1"));
        assert!(reg.is_alive(&local));
        assert!(reg.is_active(&local));
    }

    #[test]
    fn quorum_monotonicity() {
        for total in 0..16usize {
            for votes in 0..16usize {
                if NodeRegistry::quorum(total, votes) {
                    assert!(NodeRegistry::quorum(total, votes + 1));
                }
            }
        }
        assert!(NodeRegistry::quorum(1, 1));
        assert!(!NodeRegistry::quorum(2, 1));
        assert!(NodeRegistry::quorum(2, 2));
        assert!(!NodeRegistry::quorum(3, 1));
        assert!(NodeRegistry::quorum(3, 2));
    }
}
