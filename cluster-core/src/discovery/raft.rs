//! The Raft subprotocol of the discovery actor.
//!
//! Committed commands are `(idx, name)` node identity assignments; applying
//! them to the node registry is how node identities become stable across
//! the cluster. All messages ride the discovery multicast socket, so every
//! node hears every RPC; responses embed the node they concern and
//! receivers filter on role, state and term.

use std::sync::Arc;

use rand::thread_rng;
use rand::Rng;
use tokio::time::Duration;
use tokio::time::Instant;

use crate::discovery::ClusterEvent;
use crate::discovery::ClusterState;
use crate::discovery::DiscoveryCore;
use crate::discovery::Role;
use crate::node::Node;
use crate::wire;
use crate::wire::Message;
use crate::wire::WireError;
use crate::MessageSummary;

/// A Raft log entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RaftLogEntry {
    /// The term in which the entry was created.
    pub term: u64,
    /// The opaque command bytes.
    pub command: Vec<u8>,
}

/// Encode a node identity command: `idx:varint | name:lstr`.
pub fn encode_identity_command(idx: u64, name: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(name.len() + 2);
    wire::serialise_length(&mut buf, idx);
    wire::serialise_string(&mut buf, name);
    buf
}

/// Decode a node identity command.
pub fn decode_identity_command(mut command: &[u8]) -> Result<(u64, String), WireError> {
    let idx = wire::unserialise_length(&mut command)?;
    let name = wire::unserialise_string(&mut command)?;
    Ok((idx, name))
}

impl DiscoveryCore {
    /// Raft messages are only processed once the node takes part in the
    /// cluster.
    pub(crate) fn in_raft_states(&self) -> bool {
        matches!(
            self.state(),
            ClusterState::Joining | ClusterState::Setup | ClusterState::Ready
        )
    }

    /// Consensus over the currently active nodes.
    fn raft_has_consensus(&self, votes: usize) -> bool {
        let active_nodes = self.registry.active_nodes();
        active_nodes == 1 || votes > active_nodes / 2
    }

    /// Arm the election timer and stop the heartbeat.
    pub(crate) fn reset_election_timeout(&mut self) {
        let t = self.config.new_rand_election_timeout();
        tracing::trace!(?t, "election timeout armed");
        self.election_deadline = Some(Instant::now() + t);
        self.heartbeat_deadline = None;
    }

    /// Arm the election timer with a short fuse (leader renewal).
    fn reset_election_timeout_short(&mut self) {
        let span = self.config.election_timeout_max() - self.config.election_timeout_min();
        let t = if span.is_zero() { span } else { thread_rng().gen_range(Duration::ZERO..=span) };
        self.election_deadline = Some(Instant::now() + t);
        self.heartbeat_deadline = None;
    }

    /// Arm the heartbeat timer and stop the election timer.
    fn start_heartbeat(&mut self) {
        self.election_deadline = None;
        self.heartbeat_deadline = Some(Instant::now() + self.config.new_rand_heartbeat_interval());
    }

    /// The universal rule: any RPC carrying a newer term makes us a
    /// follower of that term. Returns true when the term advanced.
    fn observe_term(&mut self, term: u64) -> bool {
        if term > self.current_term {
            self.current_term = term;
            self.role = Role::Follower;
            self.voted_for = None;
            self.next_indexes.clear();
            self.match_indexes.clear();
            self.reset_election_timeout();
            true
        } else {
            false
        }
    }

    /// Step down and schedule a prompt re-election.
    pub(crate) fn raft_step_down(&mut self) {
        self.role = Role::Follower;
        self.voted_for = None;
        self.next_indexes.clear();
        self.match_indexes.clear();
        self.reset_election_timeout_short();
    }

    /// Record a newly observed leader, notifying on change.
    fn set_leader_node(&mut self, node: &Arc<Node>) {
        let leader = self.registry.leader_node();
        if leader.is_empty() || !leader.is_similar(node) {
            let leader = self.registry.set_leader((**node).clone());
            tracing::info!("New leader: {}", leader.name());
            self.emit(ClusterEvent::NewLeader(leader));
        }
    }

    fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    /// JOINING → SETUP, exactly once; the actor then registers its own
    /// identity through the log.
    async fn transition_setup(&mut self) {
        if self.state() == ClusterState::Joining {
            self.set_state(ClusterState::Setup);
            self.emit(ClusterEvent::SetupNode);
            let local = self.registry.local_node();
            let command = encode_identity_command(local.idx, local.name());
            self.raft_add_command_local(command).await;
        }
    }

    /// Election timeout: no AppendEntries from the current leader and no
    /// vote granted; convert to candidate.
    pub(crate) async fn election_timeout_fired(&mut self) {
        if !self.in_raft_states() {
            self.election_deadline = None;
            return;
        }
        if self.role == Role::Leader {
            // We're a leader, we shouldn't be here.
            self.election_deadline = None;
            return;
        }
        self.raft_start_election().await;
    }

    /// Start a new term and campaign.
    async fn raft_start_election(&mut self) {
        self.current_term += 1;
        self.role = Role::Candidate;
        self.voted_for = None;
        self.next_indexes.clear();
        self.match_indexes.clear();
        self.votes_granted = 0;
        self.votes_denied = 0;
        self.reset_election_timeout();

        let last_log_index = self.log.len() as u64;
        let last_log_term = self.last_log_term();
        let local = self.registry.local_node();
        tracing::debug!(
            term = self.current_term,
            last_log_term,
            last_log_index,
            active_nodes = self.registry.active_nodes(),
            "<< REQUEST_VOTE [{}]",
            local.name()
        );
        let mut payload = Vec::new();
        local.serialise(&mut payload);
        wire::serialise_length(&mut payload, self.current_term);
        wire::serialise_length(&mut payload, last_log_term);
        wire::serialise_length(&mut payload, last_log_index);
        self.send_message(Message::RaftRequestVote, &payload).await;
    }

    /// REQUEST_VOTE from a candidate.
    pub(crate) async fn raft_request_vote_recv(&mut self, mut payload: &[u8]) -> Result<(), WireError> {
        if !self.in_raft_states() {
            tracing::debug!(state=?self.state(), ">> REQUEST_VOTE (invalid state)");
            return Ok(());
        }
        let node = match self.touch_remote(&mut payload, false)? {
            Some(node) => node,
            None => return Ok(()),
        };
        let term = wire::unserialise_length(&mut payload)?;
        let remote_last_log_term = wire::unserialise_length(&mut payload)?;
        let remote_last_log_index = wire::unserialise_length(&mut payload)?;

        self.observe_term(term);
        tracing::debug!(
            term,
            current_term = self.current_term,
            ">> REQUEST_VOTE [from {}]",
            node.name()
        );

        let mut granted = false;
        if term == self.current_term {
            if self.voted_for.is_none() {
                if self.registry.is_local(&node) {
                    // Our own campaign echoing back; we vote for ourselves.
                    self.voted_for = Some(node.lower_name().to_string());
                    tracing::debug!("I vote for {} (myself)", node.name());
                } else if self.role == Role::Follower {
                    // §5.4.1: only grant to candidates whose log is
                    // at-least-as-up-to-date.
                    let last_log_index = self.log.len() as u64;
                    let last_log_term = self.last_log_term();
                    if last_log_term < remote_last_log_term
                        || (last_log_term == remote_last_log_term
                            && last_log_index <= remote_last_log_index)
                    {
                        self.voted_for = Some(node.lower_name().to_string());
                        self.reset_election_timeout();
                        tracing::debug!("I vote for {} (log is up-to-date)", node.name());
                    } else {
                        tracing::debug!("I don't vote for {} (log is behind)", node.name());
                    }
                }
            } else {
                tracing::debug!("I already voted for {:?}", self.voted_for);
            }
            granted = self.voted_for.as_deref() == Some(node.lower_name());
        }

        tracing::debug!(term, granted, "<< REQUEST_VOTE_RESPONSE [{}]", node.name());
        let mut reply = Vec::new();
        node.serialise(&mut reply);
        wire::serialise_length(&mut reply, term);
        wire::serialise_length(&mut reply, u64::from(granted));
        self.send_message(Message::RaftRequestVoteResponse, &reply).await;
        Ok(())
    }

    /// REQUEST_VOTE_RESPONSE addressed to a candidate (maybe us).
    pub(crate) async fn raft_request_vote_response(&mut self, mut payload: &[u8]) -> Result<(), WireError> {
        if self.role != Role::Candidate {
            return Ok(());
        }
        if !self.in_raft_states() {
            tracing::debug!(state=?self.state(), ">> REQUEST_VOTE_RESPONSE (invalid state)");
            return Ok(());
        }
        let node = match self.touch_remote(&mut payload, false)? {
            Some(node) => node,
            None => return Ok(()),
        };
        let term = wire::unserialise_length(&mut payload)?;
        if self.observe_term(term) {
            // Someone is campaigning in a newer term; this candidacy is dead.
            return Ok(());
        }
        tracing::debug!(term, current_term = self.current_term, ">> REQUEST_VOTE_RESPONSE [for {}]", node.name());

        if term != self.current_term || !self.registry.is_local(&node) {
            return Ok(());
        }
        let granted = wire::unserialise_length(&mut payload)? != 0;
        if granted {
            self.votes_granted += 1;
        } else {
            self.votes_denied += 1;
        }
        tracing::debug!(
            active_nodes = self.registry.active_nodes(),
            votes_granted = self.votes_granted,
            votes_denied = self.votes_denied,
            "vote tallied"
        );
        if self.raft_has_consensus(self.votes_granted + self.votes_denied)
            && self.votes_granted > self.votes_denied
        {
            self.become_leader().await;
        }
        Ok(())
    }

    /// Won the election: assume leadership and announce it.
    async fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.voted_for = None;
        self.next_indexes.clear();
        self.match_indexes.clear();
        self.start_heartbeat();

        let local = self.registry.local_node();
        self.set_leader_node(&local);

        let last_log_index = self.log.len() as u64;
        let last_log_term = self.last_log_term();
        tracing::debug!(
            term = self.current_term,
            last_log_index,
            commit_index = self.commit_index,
            "<< HEARTBEAT (new leader)"
        );
        let mut payload = Vec::new();
        local.serialise(&mut payload);
        wire::serialise_length(&mut payload, self.current_term);
        wire::serialise_length(&mut payload, last_log_index);
        wire::serialise_length(&mut payload, last_log_term);
        wire::serialise_length(&mut payload, self.commit_index);
        self.send_message(Message::RaftHeartbeat, &payload).await;

        // First time we elect a leader, we set up the node.
        self.transition_setup().await;
    }

    /// The leader heartbeat: ship the next missing entry to the slowest
    /// follower, or a bare heartbeat when everyone is caught up.
    pub(crate) async fn heartbeat_timer_fired(&mut self) {
        if !self.in_raft_states() || self.role != Role::Leader {
            self.heartbeat_deadline = None;
            return;
        }
        self.heartbeat_deadline = Some(Instant::now() + self.config.new_rand_heartbeat_interval());

        let local = self.registry.local_node();
        let last_log_index = self.log.len() as u64;
        if last_log_index > 0 {
            let mut entry_index = last_log_index + 1;
            for &next_index in self.next_indexes.values() {
                if next_index < entry_index {
                    entry_index = next_index;
                }
            }
            if entry_index >= 1 && entry_index <= last_log_index {
                let prev_log_index = entry_index - 1;
                let prev_log_term = if entry_index > 1 {
                    self.log[(prev_log_index - 1) as usize].term
                } else {
                    0
                };
                let entry = self.log[(entry_index - 1) as usize].clone();
                tracing::debug!(
                    term = self.current_term,
                    prev_log_index,
                    prev_log_term,
                    last_log_index,
                    entry_term = entry.term,
                    commit_index = self.commit_index,
                    "<< APPEND_ENTRIES"
                );
                let mut payload = Vec::new();
                local.serialise(&mut payload);
                wire::serialise_length(&mut payload, self.current_term);
                wire::serialise_length(&mut payload, prev_log_index);
                wire::serialise_length(&mut payload, prev_log_term);
                wire::serialise_length(&mut payload, last_log_index);
                wire::serialise_length(&mut payload, entry.term);
                wire::serialise_bytes(&mut payload, &entry.command);
                wire::serialise_length(&mut payload, self.commit_index);
                self.send_message(Message::RaftAppendEntries, &payload).await;
                return;
            }
        }

        let last_log_term = self.last_log_term();
        tracing::trace!(
            term = self.current_term,
            last_log_index,
            commit_index = self.commit_index,
            "<< HEARTBEAT"
        );
        let mut payload = Vec::new();
        local.serialise(&mut payload);
        wire::serialise_length(&mut payload, self.current_term);
        wire::serialise_length(&mut payload, last_log_index);
        wire::serialise_length(&mut payload, last_log_term);
        wire::serialise_length(&mut payload, self.commit_index);
        self.send_message(Message::RaftHeartbeat, &payload).await;
    }

    /// HEARTBEAT / APPEND_ENTRIES from a leader.
    pub(crate) async fn raft_append_entries(&mut self, r#type: Message, mut payload: &[u8]) -> Result<(), WireError> {
        if !self.in_raft_states() {
            tracing::debug!(state=?self.state(), ">> {} (invalid state)", r#type.name());
            return Ok(());
        }
        let node = match self.touch_remote(&mut payload, false)? {
            Some(node) => node,
            None => return Ok(()),
        };
        let term = wire::unserialise_length(&mut payload)?;
        self.observe_term(term);

        if self.role == Role::Leader {
            if !self.registry.is_local(&node) {
                // Another leader is around; immediately run for election.
                self.raft_start_election().await;
            }
            return Ok(());
        }
        tracing::trace!(term, current_term = self.current_term, ">> {} [from {}]", r#type.name(), node.name());

        let mut success = false;
        let mut next_index = 0u64;
        let mut match_index = 0u64;

        if term == self.current_term {
            let prev_log_index = wire::unserialise_length(&mut payload)?;
            let prev_log_term = wire::unserialise_length(&mut payload)?;

            if self.role == Role::Candidate {
                // AppendEntries from the new leader; convert to follower.
                self.role = Role::Follower;
                self.voted_for = None;
                self.next_indexes.clear();
                self.match_indexes.clear();
            }
            self.reset_election_timeout();
            self.set_leader_node(&node);

            // Reply false unless the log contains an entry at prev_log_index
            // whose term matches prev_log_term.
            let last_index = self.log.len() as u64;
            let entry_index = prev_log_index + 1;
            let prev_matches = entry_index <= 1
                || (prev_log_index <= last_index
                    && self.log[(prev_log_index - 1) as usize].term == prev_log_term);
            if prev_matches {
                if r#type == Message::RaftAppendEntries {
                    let leader_last_log_index = wire::unserialise_length(&mut payload)?;
                    let entry_term = wire::unserialise_length(&mut payload)?;
                    let entry_command = wire::unserialise_bytes(&mut payload)?.to_vec();
                    if entry_index <= last_index {
                        if self.log[(entry_index - 1) as usize].term != entry_term {
                            // A conflicting entry: delete it and everything
                            // after it, then append the new entry.
                            self.log.truncate((entry_index - 1) as usize);
                            self.log.push(RaftLogEntry { term: entry_term, command: entry_command });
                        } else if entry_index == leader_last_log_index {
                            // A valid duplicate of the last entry; ignore.
                            return Ok(());
                        }
                    } else {
                        self.log.push(RaftLogEntry { term: entry_term, command: entry_command });
                    }
                }

                let new_last_index = self.log.len() as u64;
                let leader_commit = wire::unserialise_length(&mut payload)?;
                if leader_commit > self.commit_index {
                    self.commit_index = leader_commit.min(new_last_index);
                    if self.commit_index > self.last_applied {
                        tracing::debug!(commit_index = self.commit_index, "committed");
                        self.raft_apply_committed();
                    }
                }

                if leader_commit == self.commit_index {
                    // First time we reach the leader's commit, we set up.
                    self.transition_setup().await;
                }

                next_index = new_last_index + 1;
                match_index = entry_index.min(new_last_index);
                success = true;
            }
        }

        let response_type = if r#type == Message::RaftHeartbeat {
            Message::RaftHeartbeatResponse
        } else {
            Message::RaftAppendEntriesResponse
        };
        let local = self.registry.local_node();
        tracing::trace!(term, success, "<< {} [{}]", response_type.name(), local.name());
        let mut reply = Vec::new();
        local.serialise(&mut reply);
        wire::serialise_length(&mut reply, term);
        wire::serialise_length(&mut reply, u64::from(success));
        if success {
            wire::serialise_length(&mut reply, next_index);
            wire::serialise_length(&mut reply, match_index);
        }
        self.send_message(response_type, &reply).await;
        Ok(())
    }

    /// HEARTBEAT_RESPONSE / APPEND_ENTRIES_RESPONSE from a follower.
    pub(crate) async fn raft_append_entries_response(&mut self, mut payload: &[u8]) -> Result<(), WireError> {
        if !self.in_raft_states() {
            return Ok(());
        }
        let node = match self.touch_remote(&mut payload, false)? {
            Some(node) => node,
            None => return Ok(()),
        };
        if self.role != Role::Leader || self.registry.is_local(&node) {
            return Ok(());
        }
        let term = wire::unserialise_length(&mut payload)?;
        if self.observe_term(term) {
            return Ok(());
        }
        if term != self.current_term {
            return Ok(());
        }
        let success = wire::unserialise_length(&mut payload)? != 0;
        if success {
            // Update nextIndex and matchIndex for the follower.
            let next_index = wire::unserialise_length(&mut payload)?;
            let match_index = wire::unserialise_length(&mut payload)?;
            self.next_indexes.insert(node.lower_name().to_string(), next_index);
            self.match_indexes.insert(node.lower_name().to_string(), match_index);
            tracing::trace!(follower=%node.name(), next_index, match_index, "append success");
        } else {
            // Log inconsistency: decrement nextIndex and retry.
            let next_index = self
                .next_indexes
                .entry(node.lower_name().to_string())
                .or_insert(self.log.len() as u64 + 2);
            if *next_index > 1 {
                *next_index -= 1;
            }
            tracing::debug!(follower=%node.name(), next_index=*next_index, "append rejected");
        }
        self.raft_commit_log();
        Ok(())
    }

    /// RAFT_ADD_COMMAND forwarded from a non-leader.
    pub(crate) async fn raft_add_command_recv(&mut self, mut payload: &[u8]) -> Result<(), WireError> {
        if !self.in_raft_states() {
            tracing::debug!(state=?self.state(), ">> RAFT_ADD_COMMAND (invalid state)");
            return Ok(());
        }
        let node = match self.touch_remote(&mut payload, false)? {
            Some(node) => node,
            None => return Ok(()),
        };
        if self.role != Role::Leader {
            return Ok(());
        }
        tracing::debug!(">> RAFT_ADD_COMMAND [from {}]", node.name());
        let command = wire::unserialise_bytes(&mut payload)?.to_vec();
        self.raft_add_command_local(command).await;
        Ok(())
    }

    /// Append a command: leaders append locally (assigning any missing node
    /// idx), everyone else forwards to the leader.
    pub(crate) async fn raft_add_command_local(&mut self, command: Vec<u8>) {
        if self.role == Role::Leader {
            let command = self.assign_idx(command);
            self.log.push(RaftLogEntry { term: self.current_term, command });
            self.raft_commit_log();
        } else {
            let local = self.registry.local_node();
            let mut payload = Vec::new();
            local.serialise(&mut payload);
            wire::serialise_bytes(&mut payload, &command);
            self.send_message(Message::RaftAddCommand, &payload).await;
        }
    }

    /// Leaders assign the lowest unused cluster idx to identity commands
    /// that carry none; the assignment becomes stable once committed.
    fn assign_idx(&self, command: Vec<u8>) -> Vec<u8> {
        match decode_identity_command(&command) {
            Ok((0, name)) => {
                let mut used: Vec<u64> = self
                    .registry
                    .nodes()
                    .iter()
                    .map(|n| n.idx)
                    .filter(|&idx| idx != 0)
                    .collect();
                for entry in &self.log {
                    if let Ok((idx, _)) = decode_identity_command(&entry.command) {
                        used.push(idx);
                    }
                }
                let mut idx = 1;
                while used.contains(&idx) {
                    idx += 1;
                }
                encode_identity_command(idx, &name)
            }
            _ => command,
        }
    }

    /// Leader commit advancement: an entry of the current term replicated
    /// to a quorum becomes committed, along with everything before it.
    fn raft_commit_log(&mut self) {
        for index in (self.commit_index + 1)..=(self.log.len() as u64) {
            if self.log[(index - 1) as usize].term != self.current_term {
                continue;
            }
            let matches = 1 + self.match_indexes.values().filter(|&&m| m >= index).count();
            if self.raft_has_consensus(matches) {
                self.commit_index = index;
                tracing::debug!(
                    matches,
                    active_nodes = self.registry.active_nodes(),
                    commit_index = self.commit_index,
                    "committed"
                );
                self.raft_apply_committed();
            } else {
                tracing::trace!(
                    matches,
                    active_nodes = self.registry.active_nodes(),
                    commit_index = self.commit_index,
                    "not committed"
                );
            }
        }
    }

    /// Apply every committed-but-unapplied command to the registry.
    fn raft_apply_committed(&mut self) {
        while self.commit_index > self.last_applied {
            self.last_applied += 1;
            let command = self.log[(self.last_applied - 1) as usize].command.clone();
            self.raft_apply(&command);
        }
    }

    /// Apply one committed identity command to the registry.
    fn raft_apply(&mut self, command: &[u8]) {
        let (idx, name) = match decode_identity_command(command) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::error!(?err, "unable to decode committed command");
                return;
            }
        };
        let mut indexed = match self.registry.get(&name) {
            Some(node) => (*node).clone(),
            None => Node::new(name.clone()),
        };
        indexed.idx = idx;
        match self.registry.touch(&indexed, false, true) {
            None => tracing::error!("Denied node: {}", indexed.summary()),
            Some((node, _)) => tracing::debug!("Added node: {}", node.summary()),
        }

        let local = self.registry.local_node();
        if self.state() == ClusterState::Setup && local.lower_name() == name.to_lowercase() {
            self.set_state(ClusterState::Ready);
            tracing::info!("Node {} [{}] is ready!", local.name(), local.idx);
            self.emit(ClusterEvent::Ready);
        }
    }

    /// DB_UPDATED: a peer has a newer version of `path`; replicate from it
    /// after a small randomized delay to spread the load.
    pub(crate) async fn db_updated(&mut self, mut payload: &[u8]) -> Result<(), WireError> {
        if self.state() != ClusterState::Ready {
            return Ok(());
        }
        let remote = Node::unserialise(&mut payload)?;
        let local = self.registry.local_node();
        if local.is_superset(&remote) {
            // It's just us; nothing to do.
            return Ok(());
        }
        let path = String::from_utf8_lossy(payload).into_owned();
        tracing::debug!(">> DB_UPDATED [from {}]: {}", remote.name(), path);

        let node = match self.registry.touch(&remote, false, true) {
            Some((node, _)) => node,
            None => return Ok(()),
        };
        if path.is_empty() {
            tracing::warn!("Ignoring update for empty database path!");
            return Ok(());
        }
        let tx_events = self.tx_events.clone();
        let delay = self.config.new_rand_db_updated_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx_events.send(ClusterEvent::ReplicateFrom { path, from: node });
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn identity_command_roundtrip() {
        let command = encode_identity_command(5, "node-1");
        assert_eq!(decode_identity_command(&command).unwrap(), (5, "node-1".to_string()));
    }

    #[test]
    fn identity_command_rejects_garbage() {
        assert!(decode_identity_command(&[0x80]).is_err());
    }
}
