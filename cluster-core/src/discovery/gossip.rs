//! The cluster join subprotocol.
//!
//! A booting node advertises a candidate name with HELLO. Peers either WAVE
//! (the name is fine) or SNEER (the name is taken by a different address).
//! Once the discovery window closes the node broadcasts ENTER and starts
//! taking part in Raft. BYE announces departure.

use rand::seq::SliceRandom;
use rand::thread_rng;
use rand::Rng;
use tokio::time::Instant;

use crate::discovery::ClusterEvent;
use crate::discovery::ClusterState;
use crate::discovery::DiscoveryCore;
use crate::error::FatalError;
use crate::node::Dropped;
use crate::node::Node;
use crate::wire::Message;
use crate::wire::WireError;
use crate::MessageSummary;

const NAME_ADJECTIVES: &[&str] = &[
    "amber", "bold", "brisk", "calm", "clever", "crimson", "dapper", "eager", "fuzzy", "gentle",
    "golden", "happy", "keen", "lively", "lucid", "mellow", "nimble", "proud", "quiet", "rapid",
    "silent", "steady", "swift", "vivid",
];

const NAME_NOUNS: &[&str] = &[
    "aurora", "basin", "cedar", "comet", "delta", "ember", "falcon", "garnet", "harbor", "heron",
    "juniper", "lagoon", "maple", "meadow", "nebula", "onyx", "osprey", "quartz", "ridge", "river",
    "sparrow", "summit", "thicket", "willow",
];

/// Generate a fresh candidate node name.
fn generate_name() -> String {
    let mut rng = thread_rng();
    format!(
        "{}-{}{:02}",
        NAME_ADJECTIVES.choose(&mut rng).unwrap(),
        NAME_NOUNS.choose(&mut rng).unwrap(),
        rng.gen_range(0..100u8),
    )
}

impl DiscoveryCore {
    /// The periodic discovery timer, driving RESET → WAITING → WAITING_MORE
    /// → JOINING.
    pub(crate) async fn cluster_discovery_fired(&mut self) -> Result<(), FatalError> {
        match self.state() {
            ClusterState::Reset => {
                let previous = self.registry.local_node();
                let name = match &self.config.node_name {
                    Some(name) => {
                        self.explicit_name = true;
                        name.clone()
                    }
                    None => generate_name(),
                };
                let mut node = Node::new(name);
                node.set_host(self.config.advertise_host.clone());
                node.http_port = self.config.http_port;
                node.remote_port = self.config.remote_port;
                node.replication_port = self.config.replication_port;
                let local = self.registry.set_local(node);
                if !previous.is_empty() && previous.lower_name() != local.lower_name() {
                    self.registry.drop_node(previous.name());
                }

                self.set_state(ClusterState::Waiting);
                tracing::info!("Advertising as {}...", local.name());
                let mut payload = Vec::new();
                local.serialise(&mut payload);
                self.send_message(Message::ClusterHello, &payload).await;
                self.discovery_deadline = Some(Instant::now() + self.config.discovery_waiting_fast);
            }
            ClusterState::Waiting => {
                // No one sneered nor entered during the fast window; wait
                // a little longer at the slow cadence.
                self.set_state(ClusterState::WaitingMore);
                self.discovery_deadline = Some(Instant::now() + self.config.discovery_waiting_slow);
            }
            ClusterState::WaitingMore => {
                self.discovery_deadline = None;
                self.set_state(ClusterState::Joining);
                self.join_cluster().await;
            }
            _ => {}
        }
        Ok(())
    }

    /// Enter the cluster: announce ENTER and start the election clock.
    async fn join_cluster(&mut self) {
        let local = self.registry.local_node();
        tracing::info!("Joining cluster {} as {}", self.config.cluster_name, local.name());
        let mut payload = Vec::new();
        local.serialise(&mut payload);
        self.send_message(Message::ClusterEnter, &payload).await;
        self.reset_election_timeout();
    }

    /// HELLO from a peer: WAVE if we accept the name, SNEER otherwise.
    pub(crate) async fn cluster_hello(&mut self, mut payload: &[u8]) -> Result<(), WireError> {
        let remote = Node::unserialise(&mut payload)?;
        tracing::debug!(">> CLUSTER_HELLO [from {}]", remote.name());

        let local = self.registry.local_node();
        if local.is_superset(&remote) {
            // Our own HELLO coming back through the multicast loop.
            return Ok(());
        }
        match self.registry.touch(&remote, false, true) {
            None => {
                let mut reply = Vec::new();
                remote.serialise(&mut reply);
                self.send_message(Message::ClusterSneer, &reply).await;
            }
            Some(_) => {
                let mut reply = Vec::new();
                local.serialise(&mut reply);
                self.send_message(Message::ClusterWave, &reply).await;
            }
        }
        Ok(())
    }

    /// WAVE from a peer: merge it as activated and extend the discovery
    /// window.
    pub(crate) async fn cluster_wave(&mut self, mut payload: &[u8]) -> Result<(), WireError> {
        let remote = Node::unserialise(&mut payload)?;
        tracing::debug!(">> CLUSTER_WAVE [from {}]", remote.name());

        match self.registry.touch(&remote, true, true) {
            None => {
                tracing::error!("Denied node: {}", remote.summary());
            }
            Some((node, inserted)) => {
                tracing::debug!("Added node: {}", node.summary());
                if inserted {
                    tracing::info!(
                        "Node {} is at the party on ip:{}, tcp:{} (http), tcp:{} (remote)!",
                        node.name(),
                        node.host(),
                        node.http_port,
                        node.remote_port
                    );
                }
                // Hold in WAITING_MORE so the join waits just a little
                // longer instead of switching to the slow cadence.
                if self.state() == ClusterState::Waiting {
                    self.set_state(ClusterState::WaitingMore);
                }
            }
        }
        Ok(())
    }

    /// SNEER targeting us: retry with a new name, or give up when the name
    /// was explicit.
    pub(crate) async fn cluster_sneer(&mut self, mut payload: &[u8]) -> Result<(), FatalError> {
        if !matches!(
            self.state(),
            ClusterState::Reset | ClusterState::Waiting | ClusterState::WaitingMore | ClusterState::Joining
        ) {
            return Ok(());
        }
        let remote = match Node::unserialise(&mut payload) {
            Ok(remote) => remote,
            Err(err) => {
                tracing::debug!(?err, "dropping malformed CLUSTER_SNEER");
                return Ok(());
            }
        };
        tracing::debug!(">> CLUSTER_SNEER [from {}]", remote.name());

        let local = self.registry.local_node();
        if local.is_empty() || !local.is_similar(&remote) {
            return Ok(());
        }
        if !self.explicit_name {
            tracing::debug!("Node name {} already taken. Retrying other name...", local.name());
            self.set_state(ClusterState::Reset);
            self.discovery_deadline = Some(Instant::now());
            Ok(())
        } else {
            self.set_state(ClusterState::Bad);
            let name = local.name().to_string();
            self.registry.set_local(Node::default());
            tracing::error!("Cannot join the party. Node name {} already taken!", name);
            Err(FatalError::NameTaken(name))
        }
    }

    /// ENTER from a peer: merge it as activated.
    pub(crate) async fn cluster_enter_recv(&mut self, mut payload: &[u8]) -> Result<(), WireError> {
        let remote = Node::unserialise(&mut payload)?;
        tracing::debug!(">> CLUSTER_ENTER [from {}]", remote.name());

        match self.registry.touch(&remote, true, true) {
            None => tracing::error!("Denied node: {}", remote.summary()),
            Some((node, inserted)) => {
                tracing::debug!("Added node: {}", node.summary());
                if inserted {
                    tracing::info!(
                        "Node {} joined the party on ip:{}, tcp:{} (http), tcp:{} (remote)!",
                        node.name(),
                        node.host(),
                        node.http_port,
                        node.remote_port
                    );
                }
            }
        }
        Ok(())
    }

    /// BYE from a peer: drop it; losing the leader triggers a renewal.
    pub(crate) async fn cluster_bye(&mut self, mut payload: &[u8]) -> Result<(), WireError> {
        if !matches!(
            self.state(),
            ClusterState::Joining | ClusterState::Setup | ClusterState::Ready
        ) {
            return Ok(());
        }
        let remote = Node::unserialise(&mut payload)?;
        tracing::debug!(">> CLUSTER_BYE [from {}]", remote.name());

        let local = self.registry.local_node();
        if local.is_superset(&remote) {
            return Ok(());
        }
        match self.registry.drop_node(remote.name()) {
            Dropped::WasLeader => {
                tracing::info!("Leader node {} left the party!", remote.name());
                self.emit(ClusterEvent::RenewLeader);
                self.raft_step_down();
            }
            Dropped::Removed => {
                tracing::info!("Node {} left the party!", remote.name());
            }
            Dropped::NotFound => {}
        }
        tracing::debug!(
            "Nodes still active after {} left: {}",
            remote.name(),
            self.registry.active_nodes()
        );
        Ok(())
    }
}
