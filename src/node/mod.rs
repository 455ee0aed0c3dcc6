//! Mesh Node
//!
//! Top-level structure representing one running mesh participant. The
//! Node exclusively owns all mutable protocol state — peer directory,
//! session store, dedup cache, reassembly table — and serializes every
//! mutation through a single event loop that merges inbound link traffic
//! with outbound commands. Hosts drive the node through a `NodeHandle`
//! and observe it through the `Event` channel; no locks are involved.

mod commands;
mod handlers;
mod lifecycle;

pub use commands::NodeHandle;
use commands::Command;

use crate::chunker::{ReassemblyTable, TransferError};
use crate::config::{Config, ConfigError};
use crate::dedup::DedupCache;
use crate::event::{event_channel, Event, EventRx, EventTx};
use crate::identity::{IdentityError, NodeIdentity, ShortId};
use crate::link::{LinkDriver, LinkError, LinkEventRx};
use crate::packet::PacketError;
use crate::peer::PeerDirectory;
use crate::session::{CryptoError, SessionStore};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Errors related to node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node not running")]
    NotRunning,

    #[error("no session with {0}; handshake sent, retry once established")]
    SessionNotEstablished(ShortId),

    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("node channel closed")]
    ChannelClosed,

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("link error: {0}")]
    Link(#[from] LinkError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Node operational state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Created but not started.
    Created,
    /// Fully operational.
    Running,
    /// Stopped after running.
    Stopped,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Created => "created",
            NodeState::Running => "running",
            NodeState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A running mesh node instance.
pub struct Node {
    // === Identity & Configuration ===
    identity: NodeIdentity,
    config: Config,
    state: NodeState,

    // === Protocol State (exclusively owned) ===
    directory: PeerDirectory,
    sessions: SessionStore,
    dedup: DedupCache,
    reassembly: ReassemblyTable,
    /// Peers we have already sent our handshake to.
    handshakes_sent: HashSet<ShortId>,

    // === Collaborators ===
    driver: Arc<dyn LinkDriver>,
    link_rx: Option<LinkEventRx>,
    command_tx: mpsc::Sender<Command>,
    command_rx: Option<mpsc::Receiver<Command>>,
    event_tx: EventTx,
    shutdown_tx: watch::Sender<bool>,

    // === Clock ===
    /// Latest stamped origination time; keeps timestamps non-decreasing
    /// within one runtime even if the wall clock steps backwards.
    last_timestamp_ms: u64,
}

impl Node {
    /// Create a node. The driver must feed `link_rx`; returned alongside
    /// is the event stream for the host.
    pub fn new(
        config: Config,
        mut identity: NodeIdentity,
        driver: Arc<dyn LinkDriver>,
        link_rx: LinkEventRx,
    ) -> (Self, EventRx) {
        let buffer = config.channel_buffer();
        let (event_tx, event_rx) = event_channel(buffer);
        let (command_tx, command_rx) = mpsc::channel(buffer);
        let (shutdown_tx, _) = watch::channel(false);

        identity.set_nickname(config.nickname());

        let node = Self {
            sessions: SessionStore::new(*identity.agreement_secret()),
            dedup: DedupCache::new(config.dedup_capacity()),
            reassembly: ReassemblyTable::new(
                config.transfer_expiry_ms(),
                config.transfer_max_inflight(),
            ),
            identity,
            config,
            state: NodeState::Created,
            directory: PeerDirectory::new(),
            handshakes_sent: HashSet::new(),
            driver,
            link_rx: Some(link_rx),
            command_tx,
            command_rx: Some(command_rx),
            event_tx,
            shutdown_tx,
            last_timestamp_ms: 0,
        };
        (node, event_rx)
    }

    /// Get a command handle for this node. Handles stay valid for the
    /// node's lifetime and are cheap to clone.
    pub fn handle(&self) -> NodeHandle {
        NodeHandle::new(self.command_tx.clone())
    }

    // === Accessors ===

    /// This node's identity.
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// This node's short id.
    pub fn short_id(&self) -> ShortId {
        self.identity.short_id()
    }

    /// The loaded configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The node state.
    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Whether the node is operational.
    pub fn is_running(&self) -> bool {
        self.state == NodeState::Running
    }

    /// Number of known peers.
    pub fn peer_count(&self) -> usize {
        self.directory.len()
    }

    /// Number of established sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    // === Internals shared by the handler and command paths ===

    /// Monotonically non-decreasing wall-clock stamp for outbound packets.
    pub(crate) fn next_timestamp(&mut self) -> u64 {
        self.last_timestamp_ms = self.last_timestamp_ms.max(now_ms());
        self.last_timestamp_ms
    }

    /// Push an event to the host without blocking the loop. A full
    /// channel drops the event.
    pub(crate) fn emit(&self, event: Event) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(event = event.name(), "event channel full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!(event = event.name(), "event channel closed");
            }
        }
    }

    /// Snapshot the peer directory into a peer-list event.
    pub(crate) fn emit_peer_list(&self) {
        self.emit(Event::PeerListUpdated {
            peers: self.directory.snapshot(),
        });
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("short_id", &self.identity.short_id())
            .field("state", &self.state)
            .field("peers", &self.directory.len())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
