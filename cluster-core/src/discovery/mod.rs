//! The discovery actor: cluster join gossip + Raft over multicast UDP.
//!
//! One spawned task owns the UDP socket, every timer and the whole Raft
//! state. External actors communicate with it exclusively through the
//! cheap-to-clone [`Discovery`] handle; the actor communicates with the
//! owning process through [`ClusterEvent`]s and a `watch` channel of
//! [`DiscoveryMetrics`] snapshots. Nothing in here blocks on anything but
//! the socket and the queues.

mod gossip;
mod raft;

use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::net::SocketAddrV4;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use socket2::Domain;
use socket2::Protocol;
use socket2::Socket;
use socket2::Type;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::error::FatalError;
use crate::metrics::DiscoveryMetrics;
use crate::metrics::Wait;
use crate::node::Node;
use crate::node::NodeRegistry;
use crate::wire;
use crate::wire::Message;

pub use raft::decode_identity_command;
pub use raft::encode_identity_command;
pub use raft::RaftLogEntry;

/// The cluster join state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterState {
    /// Picking a candidate name and advertising it.
    Reset,
    /// Waiting for the cluster to react to our HELLO.
    Waiting,
    /// Extended discovery window.
    WaitingMore,
    /// Entering the cluster and taking part in elections.
    Joining,
    /// Building the node's persistent identity.
    Setup,
    /// Fully joined.
    Ready,
    /// Terminal: the configured name is taken.
    Bad,
}

/// The Raft role of the local node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// The node is replicating entries from the leader.
    Follower,
    /// The node is campaigning to become the cluster leader.
    Candidate,
    /// The node is the cluster leader.
    Leader,
}

/// Signals the discovery actor emits to the owning process.
#[derive(Debug)]
pub enum ClusterEvent {
    /// The known leader disappeared; a new election will follow.
    RenewLeader,
    /// A new leader was elected.
    NewLeader(Arc<Node>),
    /// JOINING→SETUP happened; the process may build its local identity.
    SetupNode,
    /// The local node's identity command was committed and applied.
    Ready,
    /// A writable resolve wants a primary switch for a stalled shard.
    ElectPrimary(String),
    /// A peer announced a newer version of an index; replicate from it.
    ReplicateFrom {
        /// The index path to replicate.
        path: String,
        /// The node announcing the newer version.
        from: Arc<Node>,
    },
}

/// A message coming from the Discovery API handle.
pub(crate) enum DiscoveryMsg {
    ClusterEnter,
    RaftAddCommand { command: Vec<u8> },
    RaftRequestVote,
    DbUpdateSend { path: String },
}

struct DiscoveryInner {
    tx_api: mpsc::UnboundedSender<DiscoveryMsg>,
    rx_metrics: watch::Receiver<DiscoveryMetrics>,
    handle: std::sync::Mutex<Option<JoinHandle<Result<(), FatalError>>>>,
    tx_shutdown: std::sync::Mutex<Option<oneshot::Sender<()>>>,
}

/// The public interface to a running discovery actor.
///
/// This type implements `Clone`, and should be cloned liberally; the clone
/// is cheap. All methods are "send and return" — none of them waits for the
/// actor to act.
pub struct Discovery {
    inner: Arc<DiscoveryInner>,
}

impl Clone for Discovery {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl Discovery {
    /// Create and spawn a new discovery actor.
    ///
    /// Binds the multicast socket synchronously so configuration errors
    /// surface here, then spawns the event loop. Returns the handle and the
    /// stream of [`ClusterEvent`]s for the owning process to consume.
    #[tracing::instrument(level="debug", skip(config, registry), fields(cluster=%config.cluster_name))]
    pub fn spawn(
        config: Arc<Config>,
        registry: Arc<NodeRegistry>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClusterEvent>), FatalError> {
        let socket = bind_discovery_socket(&config)?;
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_events, rx_events) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(DiscoveryMetrics::new_initial());
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let handle = DiscoveryCore::spawn(
            config,
            registry,
            socket,
            rx_api,
            tx_events,
            tx_metrics,
            rx_shutdown,
        );
        let inner = DiscoveryInner {
            tx_api,
            rx_metrics,
            handle: std::sync::Mutex::new(Some(handle)),
            tx_shutdown: std::sync::Mutex::new(Some(tx_shutdown)),
        };
        Ok((Self { inner: Arc::new(inner) }, rx_events))
    }

    /// Broadcast CLUSTER_ENTER with the local node.
    pub fn cluster_enter(&self) {
        let _ = self.inner.tx_api.send(DiscoveryMsg::ClusterEnter);
    }

    /// Submit a command for replication through the Raft log.
    ///
    /// Leaders append locally; everyone else forwards to the leader.
    pub fn raft_add_command(&self, command: Vec<u8>) {
        let _ = self.inner.tx_api.send(DiscoveryMsg::RaftAddCommand { command });
    }

    /// Step down and restart the election timer with a short fuse.
    pub fn raft_request_vote(&self) {
        let _ = self.inner.tx_api.send(DiscoveryMsg::RaftRequestVote);
    }

    /// Notify peers that the local node has a newer version of `path`.
    pub fn db_update_send(&self, path: impl Into<String>) {
        let _ = self.inner.tx_api.send(DiscoveryMsg::DbUpdateSend { path: path.into() });
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<DiscoveryMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or_else(|| Duration::from_millis(500)),
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Abort the actor immediately, without announcing BYE.
    ///
    /// This is crash semantics: peers only notice once the node's
    /// `last_seen` ages past the configured lifespan.
    pub fn abort(&self) {
        if let Some(handle) = self.inner.handle.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Shutdown the actor, broadcasting BYE first.
    ///
    /// Returns the actor's exit result; a name collision with an explicit
    /// name surfaces here as [`FatalError::NameTaken`].
    pub async fn shutdown(&self) -> Result<(), FatalError> {
        if let Some(tx) = self.inner.tx_shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
        let handle = self.inner.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(res) => res,
                Err(err) => {
                    tracing::error!(error=%err, "discovery task panicked");
                    Ok(())
                }
            }
        } else {
            Ok(())
        }
    }
}

/// Build the discovery socket: `SO_REUSEPORT` so several processes can share
/// the port, multicast membership on all interfaces, loopback on, TTL 3.
fn bind_discovery_socket(config: &Config) -> Result<UdpSocket, FatalError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(FatalError::Socket)?;
    socket.set_reuse_address(true).map_err(FatalError::Socket)?;
    #[cfg(not(target_os = "windows"))]
    socket.set_reuse_port(true).map_err(FatalError::Socket)?;
    socket.set_nonblocking(true).map_err(FatalError::Socket)?;
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.discovery_port);
    socket.bind(&bind_addr.into()).map_err(FatalError::Socket)?;
    socket
        .join_multicast_v4(&config.discovery_group, &Ipv4Addr::UNSPECIFIED)
        .map_err(FatalError::Socket)?;
    socket.set_multicast_loop_v4(true).map_err(FatalError::Socket)?;
    socket.set_multicast_ttl_v4(3).map_err(FatalError::Socket)?;
    UdpSocket::from_std(socket.into()).map_err(FatalError::Socket)
}

/// The core type running the discovery protocol.
pub(crate) struct DiscoveryCore {
    /// This node's runtime config.
    config: Arc<Config>,
    /// The node registry this actor's Raft log is the state machine of.
    registry: Arc<NodeRegistry>,

    socket: UdpSocket,
    group: SocketAddr,

    /// The cluster join state.
    state: ClusterState,
    /// True when the advertised name came from config, not the generator.
    explicit_name: bool,

    /// The Raft role.
    role: Role,
    /// The current term.
    current_term: u64,
    /// Lower name of the candidate which received this node's vote for the
    /// current term.
    voted_for: Option<String>,
    /// The Raft log. Entries are only ever appended by leaders and possibly
    /// truncated during conflict resolution.
    log: Vec<RaftLogEntry>,
    /// The index of the highest log entry known to be committed.
    commit_index: u64,
    /// The index of the highest log entry applied to the registry.
    last_applied: u64,
    /// Candidate vote tally for the current term.
    votes_granted: usize,
    votes_denied: usize,
    /// Leader-only: per-follower next/match indexes, keyed by lower name.
    next_indexes: std::collections::HashMap<String, u64>,
    match_indexes: std::collections::HashMap<String, u64>,

    /// The discovery (gossip) timer, `None` when stopped.
    discovery_deadline: Option<Instant>,
    /// The follower/candidate election timeout, `None` when stopped.
    election_deadline: Option<Instant>,
    /// The leader heartbeat timer, `None` unless leader.
    heartbeat_deadline: Option<Instant>,

    rx_api: mpsc::UnboundedReceiver<DiscoveryMsg>,
    tx_events: mpsc::UnboundedSender<ClusterEvent>,
    tx_metrics: watch::Sender<DiscoveryMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl DiscoveryCore {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        config: Arc<Config>,
        registry: Arc<NodeRegistry>,
        socket: UdpSocket,
        rx_api: mpsc::UnboundedReceiver<DiscoveryMsg>,
        tx_events: mpsc::UnboundedSender<ClusterEvent>,
        tx_metrics: watch::Sender<DiscoveryMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<Result<(), FatalError>> {
        let group = SocketAddr::V4(SocketAddrV4::new(config.discovery_group, config.discovery_port));
        let this = Self {
            config,
            registry,
            socket,
            group,
            state: ClusterState::Reset,
            explicit_name: false,
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            votes_granted: 0,
            votes_denied: 0,
            next_indexes: Default::default(),
            match_indexes: Default::default(),
            discovery_deadline: Some(Instant::now()),
            election_deadline: None,
            heartbeat_deadline: None,
            rx_api,
            tx_events,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("discovery")))
    }

    /// The main loop of the discovery actor.
    #[tracing::instrument(level="debug", skip(self), fields(cluster=%self.config.cluster_name))]
    async fn main(mut self) -> Result<(), FatalError> {
        tracing::debug!("discovery actor starting (exploring)");
        self.report_metrics();

        let mut buf = vec![0u8; 1500];
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                res = self.socket.recv_from(&mut buf) => {
                    match res {
                        Ok((len, from)) => {
                            if let Err(fatal) = self.handle_datagram(&buf[..len], from).await {
                                self.report_metrics();
                                return Err(fatal);
                            }
                        }
                        Err(err) => {
                            // Socket errors are never fatal; the loop goes on.
                            tracing::error!(error=%err, "discovery socket read error");
                        }
                    }
                }
                _ = sleep_until(deadline) => {
                    if let Err(fatal) = self.handle_timers().await {
                        self.report_metrics();
                        return Err(fatal);
                    }
                }
                Some(msg) = self.rx_api.recv() => {
                    self.handle_api_msg(msg).await;
                }
                _ = &mut self.rx_shutdown => {
                    self.stop().await;
                    return Ok(());
                }
            }
            self.report_metrics();
        }
    }

    /// Broadcast BYE and stop.
    async fn stop(&mut self) {
        let local = self.registry.local_node();
        if !local.is_empty() {
            let mut payload = Vec::new();
            local.serialise(&mut payload);
            self.send_message(Message::ClusterBye, &payload).await;
        }
        tracing::info!("Waving goodbye to cluster {}!", self.config.cluster_name);
        self.report_metrics();
    }

    fn next_deadline(&self) -> Instant {
        let far = Instant::now() + Duration::from_secs(3600);
        *[self.discovery_deadline, self.election_deadline, self.heartbeat_deadline]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(&far)
    }

    /// Fire whichever timers are due.
    async fn handle_timers(&mut self) -> Result<(), FatalError> {
        let now = Instant::now();
        if matches!(self.discovery_deadline, Some(t) if t <= now) {
            self.cluster_discovery_fired().await?;
        }
        if matches!(self.election_deadline, Some(t) if t <= now) {
            self.election_timeout_fired().await;
        }
        if matches!(self.heartbeat_deadline, Some(t) if t <= now) {
            self.heartbeat_timer_fired().await;
        }
        Ok(())
    }

    /// Decode and dispatch one datagram.
    async fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr) -> Result<(), FatalError> {
        let (r#type, payload) = match wire::unpack_message(datagram, &self.config.cluster_name) {
            Some(unpacked) => unpacked,
            None => return Ok(()),
        };
        tracing::trace!(kind=%r#type.name(), len=payload.len(), %from, "recv");
        let res = match r#type {
            Message::ClusterHello => self.cluster_hello(payload).await,
            Message::ClusterWave => self.cluster_wave(payload).await,
            Message::ClusterSneer => return self.cluster_sneer(payload).await,
            Message::ClusterEnter => self.cluster_enter_recv(payload).await,
            Message::ClusterBye => self.cluster_bye(payload).await,
            Message::RaftHeartbeat | Message::RaftAppendEntries => {
                self.raft_append_entries(r#type, payload).await
            }
            Message::RaftHeartbeatResponse | Message::RaftAppendEntriesResponse => {
                self.raft_append_entries_response(payload).await
            }
            Message::RaftRequestVote => self.raft_request_vote_recv(payload).await,
            Message::RaftRequestVoteResponse => self.raft_request_vote_response(payload).await,
            Message::RaftAddCommand => self.raft_add_command_recv(payload).await,
            Message::DbUpdated => self.db_updated(payload).await,
        };
        if let Err(err) = res {
            // Malformed payloads are protocol noise, not faults.
            tracing::debug!(kind=%r#type.name(), ?err, "dropping malformed message");
        }
        Ok(())
    }

    async fn handle_api_msg(&mut self, msg: DiscoveryMsg) {
        match msg {
            DiscoveryMsg::ClusterEnter => {
                let local = self.registry.local_node();
                let mut payload = Vec::new();
                local.serialise(&mut payload);
                self.send_message(Message::ClusterEnter, &payload).await;
            }
            DiscoveryMsg::RaftAddCommand { command } => {
                self.raft_add_command_local(command).await;
            }
            DiscoveryMsg::RaftRequestVote => {
                self.raft_step_down();
            }
            DiscoveryMsg::DbUpdateSend { path } => {
                let local = self.registry.local_node();
                let mut payload = Vec::new();
                local.serialise(&mut payload);
                payload.extend_from_slice(path.as_bytes());
                self.send_message(Message::DbUpdated, &payload).await;
                tracing::debug!(%path, "sent database updated signal");
            }
        }
    }

    /// Broadcast a framed message to the multicast group.
    pub(crate) async fn send_message(&self, r#type: Message, payload: &[u8]) {
        tracing::trace!(kind=%r#type.name(), len=payload.len(), "send");
        let datagram = wire::pack_message(r#type, &self.config.cluster_name, payload);
        if let Err(err) = self.socket.send_to(&datagram, self.group).await {
            tracing::error!(error=%err, kind=%r#type.name(), "discovery socket send error");
        }
    }

    pub(crate) fn emit(&self, event: ClusterEvent) {
        let _ = self.tx_events.send(event);
    }

    pub(crate) fn set_state(&mut self, state: ClusterState) {
        if self.state != state {
            tracing::debug!(from=?self.state, to=?state, "state changed");
            self.state = state;
        }
    }

    pub(crate) fn state(&self) -> ClusterState {
        self.state
    }

    /// Report a metrics snapshot on the watch channel.
    fn report_metrics(&self) {
        let local = self.registry.local_node();
        let leader = self.registry.leader_node();
        let metrics = DiscoveryMetrics {
            node_name: local.name().to_string(),
            state: self.state,
            role: self.role,
            current_term: self.current_term,
            last_log_index: self.log.len() as u64,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            current_leader: if leader.is_empty() { None } else { Some(leader.name().to_string()) },
            total_nodes: self.registry.total_nodes(),
            active_nodes: self.registry.active_nodes(),
        };
        if self.tx_metrics.send(metrics).is_err() {
            tracing::trace!("no metrics receivers");
        }
    }

    /// Decode the node at the front of a payload and refresh the registry.
    ///
    /// Returns the shared registry record; `None` (after a debug log) for
    /// nodes the registry rejects. `activate` is only ever true for the
    /// WAVE/ENTER handlers.
    pub(crate) fn touch_remote(&self, input: &mut &[u8], activate: bool) -> Result<Option<Arc<Node>>, wire::WireError> {
        let remote = Node::unserialise(input)?;
        Ok(self.registry.touch(&remote, activate, true).map(|(node, _)| node))
    }
}
