//! Per-connection protocol state
//!
//! A [`PeerConnection`] is the synchronous half of a connection: it tracks
//! the handshake, answers PING, measures round-trip time and owns the
//! peer's announcement queue. Bytes are moved by the connection task in
//! `server.rs`; messages reach the task through the `outbox` channel.

use crate::core::block::BlockHash;
use crate::network::message::{Message, VersionMessage};
use crate::network::protocol::{
    NetworkAddress, ServiceFlags, INACTIVITY_TIMEOUT, PING_INTERVAL, PING_TIMEOUT,
    VERSION_HANDSHAKE_TIMEOUT,
};
use bitflags::bitflags;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Identifier assigned by the peer set; never reused within a process
pub type PeerId = u64;

/// Reasons a connection must end
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PeerError {
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("Obsolete protocol version {0}")]
    ObsoleteVersion(i32),
    #[error("Connected to self")]
    SelfConnection,
    #[error("Handshake timeout")]
    HandshakeTimeout,
    #[error("Ping timeout")]
    PingTimeout,
    #[error("Inactivity timeout")]
    Inactive,
    #[error("Send queue full")]
    SendQueueFull,
    #[error("Peer disconnected")]
    Disconnected,
}

/// How the connection came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Inbound,
    Outbound,
    /// Operator-requested; exempt from limits and eviction
    Manual,
    /// Short-lived reachability check
    Feeler,
}

impl ConnectionType {
    pub fn is_inbound(&self) -> bool {
        matches!(self, ConnectionType::Inbound)
    }
}

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PeerState {
    Connecting,
    VersionSent,
    VersionReceived,
    Ready,
    Disconnected,
}

bitflags! {
    /// Special treatment granted to a peer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Permissions: u32 {
        /// Misbehavior is recorded but never punished
        const NOBAN = 1 << 0;
        /// Operator-initiated connection
        const MANUAL = 1 << 1;
    }
}

/// Node-wide values a peer needs while handling messages
#[derive(Debug, Clone, Copy)]
pub struct PeerContext {
    /// Nonce this node puts in every VERSION
    pub local_nonce: u64,
    pub local_services: ServiceFlags,
    pub min_protocol_version: i32,
    /// Current active chain height
    pub start_height: i32,
    pub now_ms: i64,
}

/// What the node should do after a message was handled
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Handled,
    /// The handshake just completed
    BecameReady,
    /// A post-handshake message for the node to route
    Forward(Message),
}

/// Traffic counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct PeerStats {
    pub bytes_received: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    /// Milliseconds
    pub last_recv: i64,
    pub last_send: i64,
    /// Last measured round trip in milliseconds
    pub ping_time_ms: Option<i64>,
}

/// Header-sync bookkeeping kept per peer
#[derive(Debug, Clone, Default)]
pub struct PeerSyncState {
    /// This peer was chosen for initial sync at some point
    pub sync_started: bool,
    /// HEADERS batches whose first header did not connect
    pub unconnecting_headers: u32,
    /// The unconnecting penalty was already applied
    pub unconnecting_penalized: bool,
    /// When the outstanding GETHEADERS was sent (ms), if any
    pub headers_requested_at: Option<i64>,
}

/// Snapshot of a peer for status output
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub connection_type: ConnectionType,
    pub state: PeerState,
    pub version: i32,
    pub user_agent: String,
    pub start_height: i32,
    pub misbehavior_score: u32,
    pub ping_time_ms: Option<i64>,
    pub connected_at_ms: i64,
}

/// One live connection
pub struct PeerConnection {
    id: PeerId,
    addr: SocketAddr,
    conn_type: ConnectionType,
    state: PeerState,
    permissions: Permissions,

    /// Zero until the peer's VERSION arrives
    version: i32,
    services: u64,
    user_agent: String,
    start_height: i32,
    peer_nonce: u64,

    connected_at_ms: i64,
    misbehavior_score: u32,

    /// Nonce of the outstanding PING, zero if none
    last_ping_nonce: u64,
    ping_sent_ms: i64,

    stats: PeerStats,
    announcements: Vec<BlockHash>,
    pub sync: PeerSyncState,
    /// GETADDR is answered at most once per connection
    pub getaddr_answered: bool,

    outbox: mpsc::Sender<Message>,
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("type", &self.conn_type)
            .field("state", &self.state)
            .finish()
    }
}

impl PeerConnection {
    pub fn new(
        id: PeerId,
        addr: SocketAddr,
        conn_type: ConnectionType,
        permissions: Permissions,
        outbox: mpsc::Sender<Message>,
        now_ms: i64,
    ) -> Self {
        Self {
            id,
            addr,
            conn_type,
            state: PeerState::Connecting,
            permissions,
            version: 0,
            services: 0,
            user_agent: String::new(),
            start_height: 0,
            peer_nonce: 0,
            connected_at_ms: now_ms,
            misbehavior_score: 0,
            last_ping_nonce: 0,
            ping_sent_ms: 0,
            stats: PeerStats {
                last_recv: now_ms,
                last_send: now_ms,
                ..PeerStats::default()
            },
            announcements: Vec::new(),
            sync: PeerSyncState::default(),
            getaddr_answered: false,
            outbox,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.conn_type
    }

    pub fn is_inbound(&self) -> bool {
        self.conn_type.is_inbound()
    }

    pub fn is_feeler(&self) -> bool {
        self.conn_type == ConnectionType::Feeler
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == PeerState::Ready
    }

    pub fn has_permission(&self, flag: Permissions) -> bool {
        self.permissions.contains(flag)
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn start_height(&self) -> i32 {
        self.start_height
    }

    pub fn services(&self) -> ServiceFlags {
        ServiceFlags::from_bits_truncate(self.services)
    }

    pub fn connected_at_ms(&self) -> i64 {
        self.connected_at_ms
    }

    pub fn stats(&self) -> &PeerStats {
        &self.stats
    }

    pub fn ping_time_ms(&self) -> Option<i64> {
        self.stats.ping_time_ms
    }

    pub fn misbehavior_score(&self) -> u32 {
        self.misbehavior_score
    }

    /// Add penalty points; the score never decreases
    pub fn add_misbehavior(&mut self, points: u32) -> u32 {
        self.misbehavior_score = self.misbehavior_score.saturating_add(points);
        self.misbehavior_score
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id,
            addr: self.addr,
            connection_type: self.conn_type,
            state: self.state,
            version: self.version,
            user_agent: self.user_agent.clone(),
            start_height: self.start_height,
            misbehavior_score: self.misbehavior_score,
            ping_time_ms: self.stats.ping_time_ms,
            connected_at_ms: self.connected_at_ms,
        }
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Queue a message for the connection task without waiting
    pub fn send(&mut self, msg: Message, now_ms: i64) -> Result<(), PeerError> {
        if self.state == PeerState::Disconnected {
            return Err(PeerError::Disconnected);
        }
        match self.outbox.try_send(msg) {
            Ok(()) => {
                self.stats.messages_sent += 1;
                self.stats.last_send = now_ms;
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(PeerError::SendQueueFull),
            Err(TrySendError::Closed(_)) => Err(PeerError::Disconnected),
        }
    }

    fn version_message(&self, ctx: &PeerContext) -> Message {
        let mut version = VersionMessage::new(
            ctx.local_services.bits(),
            ctx.now_ms / 1000,
            ctx.local_nonce,
            ctx.start_height,
        );
        version.addr_recv = NetworkAddress::from_socket_addr(self.addr, ServiceFlags::empty());
        Message::Version(version)
    }

    /// Begin the handshake. Outbound sides speak first; inbound sides wait.
    pub fn start(&mut self, ctx: &PeerContext) -> Result<(), PeerError> {
        if self.state != PeerState::Connecting {
            return Ok(());
        }
        if !self.is_inbound() {
            let version = self.version_message(ctx);
            self.send(version, ctx.now_ms)?;
            self.state = PeerState::VersionSent;
            log::debug!("Peer {} ({}): sent VERSION", self.id, self.addr);
        } else {
            log::debug!("Peer {} ({}): inbound, waiting for VERSION", self.id, self.addr);
        }
        Ok(())
    }

    /// Mark the connection closed and drop anything still queued for it
    pub fn mark_disconnected(&mut self) {
        self.state = PeerState::Disconnected;
        self.announcements.clear();
        self.sync.headers_requested_at = None;
    }

    // =========================================================================
    // Receiving
    // =========================================================================

    /// Process one decoded message. An `Err` means the connection must close.
    pub fn handle_message(
        &mut self,
        msg: Message,
        wire_bytes: usize,
        ctx: &PeerContext,
    ) -> Result<Dispatch, PeerError> {
        self.stats.messages_received += 1;
        self.stats.bytes_received += wire_bytes as u64;
        self.stats.last_recv = ctx.now_ms;

        if self.state == PeerState::Disconnected {
            return Ok(Dispatch::Handled);
        }

        if self.version == 0 && !matches!(msg, Message::Version(_)) {
            log::warn!(
                "Peer {} ({}): {} before VERSION, disconnecting",
                self.id,
                self.addr,
                msg.command()
            );
            return Err(PeerError::ProtocolViolation(format!(
                "{} before version",
                msg.command()
            )));
        }

        match msg {
            Message::Version(version) => {
                self.handle_version(version, ctx)?;
                Ok(Dispatch::Handled)
            }
            Message::Verack => Ok(self.handle_verack(ctx.now_ms)),
            Message::Ping(nonce) => {
                self.send(Message::Pong(nonce), ctx.now_ms)?;
                Ok(Dispatch::Handled)
            }
            Message::Pong(nonce) => {
                self.handle_pong(nonce, ctx.now_ms);
                Ok(Dispatch::Handled)
            }
            Message::Unknown { command, payload_len } => {
                log::debug!(
                    "Peer {}: ignoring unknown command '{}' ({} bytes)",
                    self.id,
                    command,
                    payload_len
                );
                Ok(Dispatch::Handled)
            }
            other => {
                if self.state != PeerState::Ready {
                    log::debug!(
                        "Peer {}: ignoring {} before handshake completed",
                        self.id,
                        other.command()
                    );
                    return Ok(Dispatch::Handled);
                }
                Ok(Dispatch::Forward(other))
            }
        }
    }

    fn handle_version(&mut self, msg: VersionMessage, ctx: &PeerContext) -> Result<(), PeerError> {
        if self.version != 0 {
            log::warn!(
                "Peer {} ({}): duplicate VERSION, ignoring",
                self.id,
                self.addr
            );
            return Ok(());
        }

        if msg.version < ctx.min_protocol_version {
            log::warn!(
                "Peer {} ({}): obsolete protocol version {} (min {})",
                self.id,
                self.addr,
                msg.version,
                ctx.min_protocol_version
            );
            return Err(PeerError::ObsoleteVersion(msg.version));
        }

        if msg.nonce == ctx.local_nonce {
            log::warn!("Peer {} ({}): self-connection detected", self.id, self.addr);
            return Err(PeerError::SelfConnection);
        }

        self.version = msg.version;
        self.services = msg.services;
        self.start_height = msg.start_height;
        self.peer_nonce = msg.nonce;
        self.user_agent = msg.user_agent;

        log::debug!(
            "Peer {} ({}): VERSION {} agent={} height={}",
            self.id,
            self.addr,
            self.version,
            self.user_agent,
            self.start_height
        );

        // Inbound peers answer with their own VERSION before the VERACK
        if self.state == PeerState::Connecting {
            let version = self.version_message(ctx);
            self.send(version, ctx.now_ms)?;
        }
        self.send(Message::Verack, ctx.now_ms)?;
        self.state = PeerState::VersionReceived;
        Ok(())
    }

    fn handle_verack(&mut self, now_ms: i64) -> Dispatch {
        if self.state == PeerState::Ready {
            log::debug!("Peer {}: duplicate VERACK, ignoring", self.id);
            return Dispatch::Handled;
        }
        if self.state != PeerState::VersionReceived {
            // VERSION arrived but we never answered it; nothing to complete
            return Dispatch::Handled;
        }

        self.state = PeerState::Ready;
        // The ping timer starts from the moment the handshake completes
        self.ping_sent_ms = now_ms;
        log::info!(
            "Peer {} ({}) ready: {:?} version={} agent={}",
            self.id,
            self.addr,
            self.conn_type,
            self.version,
            self.user_agent
        );
        Dispatch::BecameReady
    }

    fn handle_pong(&mut self, nonce: u64, now_ms: i64) {
        if self.last_ping_nonce != 0 && nonce == self.last_ping_nonce {
            let rtt = now_ms - self.ping_sent_ms;
            self.stats.ping_time_ms = Some(rtt.max(0));
            self.last_ping_nonce = 0;
            log::trace!("Peer {}: ping {} ms", self.id, rtt);
        }
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Periodic housekeeping: handshake timeout, keep-alive pings and
    /// inactivity detection
    pub fn tick(&mut self, now_ms: i64) -> Result<(), PeerError> {
        if self.state == PeerState::Disconnected {
            return Ok(());
        }

        if self.state != PeerState::Ready {
            if now_ms - self.connected_at_ms > VERSION_HANDSHAKE_TIMEOUT.as_millis() as i64 {
                log::warn!("Peer {} ({}): handshake timeout", self.id, self.addr);
                return Err(PeerError::HandshakeTimeout);
            }
            return Ok(());
        }

        let idle = now_ms - self.stats.last_recv.max(self.stats.last_send);
        if idle > INACTIVITY_TIMEOUT.as_millis() as i64 {
            log::warn!("Peer {} ({}): inactivity timeout", self.id, self.addr);
            return Err(PeerError::Inactive);
        }

        if self.last_ping_nonce != 0 {
            if now_ms - self.ping_sent_ms > PING_TIMEOUT.as_millis() as i64 {
                log::warn!("Peer {} ({}): no PONG, disconnecting", self.id, self.addr);
                return Err(PeerError::PingTimeout);
            }
        } else if now_ms - self.ping_sent_ms >= PING_INTERVAL.as_millis() as i64 {
            let mut nonce = rand::random::<u64>();
            if nonce == 0 {
                nonce = 1;
            }
            self.send(Message::Ping(nonce), now_ms)?;
            self.last_ping_nonce = nonce;
            self.ping_sent_ms = now_ms;
        }
        Ok(())
    }

    // =========================================================================
    // Announcements
    // =========================================================================

    /// Queue a block hash for the next INV flush; duplicates are dropped
    pub fn queue_announcement(&mut self, hash: BlockHash) -> bool {
        if self.announcements.contains(&hash) {
            return false;
        }
        self.announcements.push(hash);
        true
    }

    pub fn pending_announcements(&self) -> &[BlockHash] {
        &self.announcements
    }

    pub fn take_announcements(&mut self) -> Vec<BlockHash> {
        std::mem::take(&mut self.announcements)
    }
}
