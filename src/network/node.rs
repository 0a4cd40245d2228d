//! P2P Node implementation
//!
//! The node that wires every networking component together: it owns the
//! shared state, runs the event loop that connection tasks report into and
//! drives the periodic timers.
//!
//! Shared structures are locked in a fixed order to avoid deadlocks:
//! sync engine, chain, peers, address book, ban registry, announcements.

use crate::core::block::{BlockHash, MINER_ADDRESS_SIZE};
use crate::core::chain_state::{ChainError, ChainState, ChainTip};
use crate::core::params::{ChainType, NetworkParams};
use crate::network::addrman::{AddrManError, AddressBook, PEERS_FILE};
use crate::network::anchors::{self, AnchorError, ANCHORS_FILE, MAX_ANCHORS};
use crate::network::banman::{BanError, BanRegistry};
use crate::network::message::Message;
use crate::network::peer::{
    ConnectionType, Dispatch, PeerContext, PeerId, PeerInfo, Permissions,
};
use crate::network::peer_set::{AdmissionError, PeerSet, PeerSetConfig};
use crate::network::protocol::{
    NetworkAddress, ServiceFlags, DEFAULT_MAX_INBOUND_CONNECTIONS,
    DEFAULT_MAX_OUTBOUND_CONNECTIONS, MAX_ADDR_SIZE, MIN_PROTOCOL_VERSION,
};
use crate::network::relay::AnnouncementScheduler;
use crate::network::server::handle_connection;
use crate::network::sync::ChainSyncEngine;
use crate::network::transport::{BoxedStream, Transport};
use crate::util::SharedClock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Messages queued per peer before the connection is considered stuck
const SEND_QUEUE_SIZE: usize = 1024;

/// Capacity of the channel connection tasks report into
const EVENT_QUEUE_SIZE: usize = 4096;

/// How often timers are checked; the timers themselves use the node clock
const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(250);

/// Spacing of feeler connections
pub const FEELER_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// How often the address book drops stale and terrible entries
const ADDRMAN_CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection refused: {0}")]
    Admission(#[from] AdmissionError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Ban list error: {0}")]
    BanList(#[from] BanError),

    #[error("Address book error: {0}")]
    AddressBook(#[from] AddrManError),

    #[error("Anchors error: {0}")]
    Anchors(#[from] AnchorError),

    #[error("Block generation is only available on regtest (running {0})")]
    MiningUnavailable(ChainType),

    #[error("Node event loop is already running")]
    AlreadyRunning,

    #[error("Unknown peer {0}")]
    UnknownPeer(PeerId),
}

/// P2P node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub chain: ChainType,
    /// Listen port; the chain's default port when unset
    pub port: Option<u16>,
    /// Accept inbound connections
    pub listen: bool,
    pub max_inbound: usize,
    pub max_outbound: usize,
    pub min_protocol_version: i32,
    pub discouragement_threshold: u32,
    pub max_orphan_headers: usize,
    pub max_orphan_headers_per_peer: usize,
    /// Seconds between periodic tip announcements
    pub announce_interval_secs: u64,
    /// Peers dialed as manual connections on start
    pub connect: Vec<SocketAddr>,
    /// Ban list and address book location; nothing is persisted when unset
    pub data_dir: Option<PathBuf>,
    pub feelers: bool,
    /// Keep private and loopback addresses in the address book
    pub allow_private_addresses: bool,
    /// Addresses that bypass bans and receive NoBan permission
    pub whitelist: Vec<IpAddr>,
    /// Reorgs disconnecting this many blocks are refused (0 disables)
    pub suspicious_reorg_depth: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            chain: ChainType::Main,
            port: None,
            listen: true,
            max_inbound: DEFAULT_MAX_INBOUND_CONNECTIONS,
            max_outbound: DEFAULT_MAX_OUTBOUND_CONNECTIONS,
            min_protocol_version: MIN_PROTOCOL_VERSION,
            discouragement_threshold: crate::network::peer_set::DEFAULT_DISCOURAGEMENT_THRESHOLD,
            max_orphan_headers: crate::core::chain_state::MAX_ORPHAN_HEADERS,
            max_orphan_headers_per_peer: crate::core::chain_state::MAX_ORPHAN_HEADERS_PER_PEER,
            announce_interval_secs: crate::network::relay::DEFAULT_ANNOUNCE_INTERVAL.as_secs(),
            connect: Vec::new(),
            data_dir: None,
            feelers: true,
            allow_private_addresses: false,
            whitelist: Vec::new(),
            suspicious_reorg_depth: crate::core::params::DEFAULT_SUSPICIOUS_REORG_DEPTH,
        }
    }
}

impl NodeConfig {
    /// Regtest defaults: private addresses allowed, no feelers
    pub fn regtest() -> Self {
        Self {
            chain: ChainType::Regtest,
            allow_private_addresses: true,
            feelers: false,
            ..Self::default()
        }
    }

    /// Read a JSON config file; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, NodeError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

/// What connection tasks and dialers report to the event loop
pub enum NodeEvent {
    Inbound {
        stream: BoxedStream,
        addr: SocketAddr,
    },
    OutboundConnected {
        stream: BoxedStream,
        addr: SocketAddr,
        conn_type: ConnectionType,
    },
    OutboundFailed {
        addr: SocketAddr,
        conn_type: ConnectionType,
        error: String,
    },
    Message {
        peer_id: PeerId,
        msg: Message,
        bytes: usize,
    },
    Disconnected {
        peer_id: PeerId,
        reason: String,
    },
}

/// Node status information
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub chain: ChainType,
    pub listen_addr: Option<SocketAddr>,
    pub height: u32,
    pub tip: String,
    pub initial_block_download: bool,
    pub peers: usize,
    pub inbound: usize,
    pub outbound: usize,
    pub sync_peer: Option<PeerId>,
    pub known_addresses: usize,
    pub tried_addresses: usize,
    pub banned: usize,
    pub discouraged: usize,
    pub orphan_headers: usize,
}

#[derive(Debug, Default)]
struct Timers {
    next_feeler_ms: i64,
    next_addrman_cleanup_ms: i64,
}

/// The main P2P node. Cloning yields another handle to the same node.
#[derive(Clone)]
pub struct Node {
    config: Arc<NodeConfig>,
    params: Arc<NetworkParams>,
    clock: SharedClock,
    transport: Arc<dyn Transport>,
    local_nonce: u64,

    pub sync: Arc<Mutex<ChainSyncEngine>>,
    pub chain: Arc<RwLock<ChainState>>,
    pub peers: Arc<RwLock<PeerSet>>,
    pub addrman: Arc<Mutex<AddressBook>>,
    pub banman: Arc<Mutex<BanRegistry>>,
    relay: Arc<Mutex<AnnouncementScheduler>>,

    /// Outbound dials in flight
    pending: Arc<Mutex<HashSet<SocketAddr>>>,
    timers: Arc<Mutex<Timers>>,
    listen_addr: Arc<Mutex<Option<SocketAddr>>>,
    listener_task: Arc<Mutex<Option<JoinHandle<()>>>>,

    events_tx: mpsc::Sender<NodeEvent>,
    events_rx: Arc<Mutex<Option<mpsc::Receiver<NodeEvent>>>>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: Arc<Mutex<Option<mpsc::Receiver<()>>>>,
}

impl Node {
    /// Create a node. Persisted ban list and addresses are loaded here when
    /// a data directory is configured.
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        clock: SharedClock,
    ) -> Result<Self, NodeError> {
        let params = Arc::new(NetworkParams::for_chain(config.chain));

        let mut chain = ChainState::new(params.clone(), params.pow(), clock.clone());
        chain.set_orphan_limits(config.max_orphan_headers, config.max_orphan_headers_per_peer);
        chain.set_suspicious_reorg_depth(config.suspicious_reorg_depth);

        let local_nonce = loop {
            let nonce: u64 = rand::random();
            if nonce != 0 {
                break nonce;
            }
        };
        let peers = PeerSet::new(
            PeerSetConfig {
                max_inbound: config.max_inbound,
                max_outbound: config.max_outbound,
                discouragement_threshold: config.discouragement_threshold,
            },
            local_nonce,
        );

        let mut addrman = AddressBook::new(clock.clone()).allow_private(
            config.allow_private_addresses || config.chain == ChainType::Regtest,
        );
        let mut banman = match &config.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                BanRegistry::with_data_dir(clock.clone(), dir, true)
            }
            None => BanRegistry::new(clock.clone()),
        };
        if let Some(dir) = &config.data_dir {
            let bans = banman.load()?;
            let addrs = addrman.load(&dir.join(PEERS_FILE))?;
            log::info!("Loaded {} bans and {} addresses from {}", bans, addrs, dir.display());
        }
        for ip in &config.whitelist {
            banman.add_to_whitelist(ip);
        }

        let relay = AnnouncementScheduler::new(Duration::from_secs(config.announce_interval_secs));
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        Ok(Self {
            config: Arc::new(config),
            params,
            clock,
            transport,
            local_nonce,
            sync: Arc::new(Mutex::new(ChainSyncEngine::new())),
            chain: Arc::new(RwLock::new(chain)),
            peers: Arc::new(RwLock::new(peers)),
            addrman: Arc::new(Mutex::new(addrman)),
            banman: Arc::new(Mutex::new(banman)),
            relay: Arc::new(Mutex::new(relay)),
            pending: Arc::new(Mutex::new(HashSet::new())),
            timers: Arc::new(Mutex::new(Timers::default())),
            listen_addr: Arc::new(Mutex::new(None)),
            listener_task: Arc::new(Mutex::new(None)),
            events_tx,
            events_rx: Arc::new(Mutex::new(Some(events_rx))),
            shutdown_tx,
            shutdown_rx: Arc::new(Mutex::new(Some(shutdown_rx))),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    pub fn local_nonce(&self) -> u64 {
        self.local_nonce
    }

    pub fn port(&self) -> u16 {
        self.config.port.unwrap_or(self.params.default_port)
    }

    /// Listen (if enabled), dial saved anchors and the configured peers,
    /// then run the event loop until [`Node::shutdown`]
    pub async fn start(&self) -> Result<(), NodeError> {
        if self.config.listen {
            self.listen().await?;
        }
        self.connect_anchors().await;
        for addr in &self.config.connect {
            if let Err(e) = self.connect_to(*addr, ConnectionType::Manual).await {
                log::warn!("Failed to connect to {}: {}", addr, e);
            }
        }
        self.run().await
    }

    /// Dial the anchors saved by the previous run and consume the file.
    /// Returns how many dials were started.
    pub async fn connect_anchors(&self) -> usize {
        let Some(dir) = &self.config.data_dir else {
            return 0;
        };
        let mut started = 0;
        for anchor in anchors::take_anchors(&dir.join(ANCHORS_FILE)) {
            let addr = anchor.socket_addr();
            match self.connect_to(addr, ConnectionType::Outbound).await {
                Ok(()) => started += 1,
                Err(e) => log::warn!("Failed to connect to anchor {}: {}", addr, e),
            }
        }
        if started > 0 {
            log::info!("Connecting to {} anchors", started);
        }
        started
    }

    /// Bind the listener and forward accepted connections to the event loop
    pub async fn listen(&self) -> Result<SocketAddr, NodeError> {
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port());
        let mut listener = self.transport.listen(bind).await?;
        let local = listener.local_addr();
        self.peers.write().await.add_local_address(local);
        *self.listen_addr.lock().await = Some(local);
        log::info!("Node listening on {} ({})", local, self.params.chain_type);

        let events = self.events_tx.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        log::debug!("Incoming connection from {}", addr);
                        if events.send(NodeEvent::Inbound { stream, addr }).await.is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotConnected => break,
                    Err(e) => log::error!("Accept error: {}", e),
                }
            }
        });
        *self.listener_task.lock().await = Some(task);
        Ok(local)
    }

    pub async fn listen_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.lock().await
    }

    /// Dial a peer. Admission is checked before dialing; the connection is
    /// registered by the event loop once the dial completes.
    pub async fn connect_to(&self, addr: SocketAddr, conn_type: ConnectionType) -> Result<(), NodeError> {
        {
            let peers = self.peers.read().await;
            let bans = self.banman.lock().await;
            peers.connect_outbound(addr, conn_type, &bans)?;
        }
        if !self.pending.lock().await.insert(addr) {
            return Err(AdmissionError::AlreadyConnected(addr).into());
        }
        if conn_type != ConnectionType::Manual {
            self.addrman
                .lock()
                .await
                .attempt(&NetworkAddress::from_socket_addr(addr, ServiceFlags::empty()));
        }

        log::info!("Connecting to {} ({:?})", addr, conn_type);
        let dial = self.transport.connect(addr);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let event = match dial.await {
                Ok(stream) => NodeEvent::OutboundConnected {
                    stream,
                    addr,
                    conn_type,
                },
                Err(e) => NodeEvent::OutboundFailed {
                    addr,
                    conn_type,
                    error: e.to_string(),
                },
            };
            let _ = events.send(event).await;
        });
        Ok(())
    }

    /// Process events and timers until shutdown
    pub async fn run(&self) -> Result<(), NodeError> {
        let mut events = self.events_rx.lock().await.take().ok_or(NodeError::AlreadyRunning)?;
        let mut shutdown = self.shutdown_rx.lock().await.take().ok_or(NodeError::AlreadyRunning)?;
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);

        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    self.handle_event(event).await;
                    self.after_processing().await;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                    self.after_processing().await;
                }
                _ = shutdown.recv() => {
                    log::info!("Node shutting down...");
                    break;
                }
            }
        }

        self.stop().await
    }

    /// Ask the event loop to stop
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }

    async fn stop(&self) -> Result<(), NodeError> {
        if let Some(task) = self.listener_task.lock().await.take() {
            task.abort();
        }
        {
            let mut peers = self.peers.write().await;
            if let Some(dir) = &self.config.data_dir {
                anchors::save_anchors(&dir.join(ANCHORS_FILE), &peers.anchor_candidates(MAX_ANCHORS))?;
            }
            for id in peers.ids() {
                peers.remove(id, "node shutting down");
            }
        }
        self.cleanup_departed().await;

        if let Some(dir) = &self.config.data_dir {
            self.addrman.lock().await.save(&dir.join(PEERS_FILE))?;
            self.banman.lock().await.save()?;
        }
        Ok(())
    }

    fn peer_context(&self, height: u32) -> PeerContext {
        PeerContext {
            local_nonce: self.local_nonce,
            local_services: ServiceFlags::NODE_NETWORK,
            min_protocol_version: self.config.min_protocol_version,
            start_height: height as i32,
            now_ms: self.clock.now_ms(),
        }
    }

    // =========================================================================
    // Events
    // =========================================================================

    async fn handle_event(&self, event: NodeEvent) {
        match event {
            NodeEvent::Inbound { stream, addr } => self.on_inbound(stream, addr).await,
            NodeEvent::OutboundConnected {
                stream,
                addr,
                conn_type,
            } => self.on_outbound_connected(stream, addr, conn_type).await,
            NodeEvent::OutboundFailed {
                addr,
                conn_type,
                error,
            } => {
                self.pending.lock().await.remove(&addr);
                log::debug!("Connection to {} failed: {}", addr, error);
                if conn_type != ConnectionType::Manual {
                    self.addrman
                        .lock()
                        .await
                        .failed(&NetworkAddress::from_socket_addr(addr, ServiceFlags::empty()));
                }
            }
            NodeEvent::Message { peer_id, msg, bytes } => {
                self.on_message(peer_id, msg, bytes).await
            }
            NodeEvent::Disconnected { peer_id, reason } => {
                self.peers.write().await.remove(peer_id, &reason);
            }
        }
    }

    async fn on_inbound(&self, stream: BoxedStream, addr: SocketAddr) {
        let height = self.chain.read().await.height();
        let now = self.clock.now_ms();
        let mut peers = self.peers.write().await;
        let bans = self.banman.lock().await;

        if let Err(e) = peers.accept_inbound(addr, &bans, now) {
            log::info!("Rejected inbound connection from {}: {}", addr, e);
            return;
        }
        let permissions = if bans.is_whitelisted(&addr.ip()) {
            Permissions::NOBAN
        } else {
            Permissions::empty()
        };
        drop(bans);

        let (tx, rx) = mpsc::channel(SEND_QUEUE_SIZE);
        let peer_id = peers.add(addr, ConnectionType::Inbound, permissions, tx, now);
        if let Some(peer) = peers.get_mut(peer_id) {
            if let Err(e) = peer.start(&self.peer_context(height)) {
                peers.fail(peer_id, &e);
                return;
            }
        }
        log::info!("Accepted inbound peer {} ({})", peer_id, addr);
        self.spawn_connection(peer_id, stream, rx);
    }

    async fn on_outbound_connected(&self, stream: BoxedStream, addr: SocketAddr, conn_type: ConnectionType) {
        self.pending.lock().await.remove(&addr);
        let height = self.chain.read().await.height();
        let now = self.clock.now_ms();
        let mut peers = self.peers.write().await;
        let bans = self.banman.lock().await;

        // Things may have changed while dialing
        if let Err(e) = peers.connect_outbound(addr, conn_type, &bans) {
            log::debug!("Dropping connection to {}: {}", addr, e);
            return;
        }
        let permissions = if bans.is_whitelisted(&addr.ip()) {
            Permissions::NOBAN
        } else {
            Permissions::empty()
        };
        drop(bans);

        let (tx, rx) = mpsc::channel(SEND_QUEUE_SIZE);
        let peer_id = peers.add(addr, conn_type, permissions, tx, now);
        if let Some(peer) = peers.get_mut(peer_id) {
            if let Err(e) = peer.start(&self.peer_context(height)) {
                peers.fail(peer_id, &e);
                return;
            }
        }
        log::info!("Connected to {} as peer {} ({:?})", addr, peer_id, conn_type);
        self.spawn_connection(peer_id, stream, rx);
    }

    fn spawn_connection(&self, peer_id: PeerId, stream: BoxedStream, outbox: mpsc::Receiver<Message>) {
        let magic = self.params.magic;
        let events = self.events_tx.clone();
        tokio::spawn(handle_connection(peer_id, stream, magic, outbox, events));
    }

    async fn on_message(&self, peer_id: PeerId, msg: Message, bytes: usize) {
        let height = self.chain.read().await.height();
        let ctx = self.peer_context(height);

        let dispatch = {
            let mut peers = self.peers.write().await;
            let Some(peer) = peers.get_mut(peer_id) else {
                return;
            };
            log::trace!("Received {} from peer {}", msg.command(), peer_id);
            match peer.handle_message(msg, bytes, &ctx) {
                Ok(dispatch) => dispatch,
                Err(e) => {
                    peers.fail(peer_id, &e);
                    return;
                }
            }
        };

        match dispatch {
            Dispatch::Handled => {}
            Dispatch::BecameReady => self.on_peer_ready(peer_id).await,
            Dispatch::Forward(msg) => self.route_message(peer_id, msg).await,
        }
    }

    async fn on_peer_ready(&self, peer_id: PeerId) {
        let mut sync = self.sync.lock().await;
        let chain = self.chain.read().await;
        let mut peers = self.peers.write().await;
        let now = self.clock.now_ms();

        let Some(peer) = peers.get(peer_id) else {
            return;
        };
        let addr = peer.addr();
        let conn_type = peer.connection_type();
        let net_addr = NetworkAddress::from_socket_addr(addr, peer.services());
        log::info!(
            "Peer {} ({}) ready: version {}, height {}, {:?}",
            peer_id,
            addr,
            peer.version(),
            peer.start_height(),
            conn_type
        );

        match conn_type {
            ConnectionType::Feeler => {
                self.addrman.lock().await.good(&net_addr);
                peers.remove(peer_id, "feeler connection complete");
                return;
            }
            ConnectionType::Outbound => {
                self.addrman.lock().await.good(&net_addr);
                peers.send_to(peer_id, Message::GetAddr, now);
            }
            ConnectionType::Manual => {
                peers.send_to(peer_id, Message::GetAddr, now);
            }
            ConnectionType::Inbound => {}
        }

        self.relay.lock().await.announce_tip_to_peer(&chain, &mut peers, peer_id);
        sync.check_initial_sync(&chain, &mut peers, now);
    }

    async fn route_message(&self, peer_id: PeerId, msg: Message) {
        let now = self.clock.now_ms();
        match msg {
            Message::Addr(addrs) => {
                let added = self.addrman.lock().await.add_many(&addrs);
                log::debug!("Received {} addresses from peer {} ({} new)", addrs.len(), peer_id, added);
            }
            Message::GetAddr => {
                let mut peers = self.peers.write().await;
                let Some(peer) = peers.get_mut(peer_id) else {
                    return;
                };
                // Answering outbound peers would leak our address table
                if !peer.is_inbound() || peer.getaddr_answered {
                    log::debug!("Ignoring getaddr from peer {}", peer_id);
                    return;
                }
                peer.getaddr_answered = true;
                let addrs = self.addrman.lock().await.get_addresses(MAX_ADDR_SIZE);
                log::debug!("Sending {} addresses to peer {}", addrs.len(), peer_id);
                peers.send_to(peer_id, Message::Addr(addrs), now);
            }
            Message::Inv(inventory) => {
                let mut sync = self.sync.lock().await;
                let chain = self.chain.read().await;
                let mut peers = self.peers.write().await;
                sync.handle_inv(&chain, &mut peers, peer_id, &inventory, now);
            }
            Message::GetHeaders(request) => {
                let sync = self.sync.lock().await;
                let chain = self.chain.read().await;
                let mut peers = self.peers.write().await;
                sync.handle_getheaders(&chain, &mut peers, peer_id, &request, now);
            }
            Message::Headers(headers) => {
                let mut sync = self.sync.lock().await;
                let mut chain = self.chain.write().await;
                let mut peers = self.peers.write().await;
                let mut bans = self.banman.lock().await;
                let tip_changed =
                    sync.handle_headers(&mut chain, &mut peers, &mut bans, peer_id, &headers, now);
                drop(bans);
                if tip_changed {
                    self.relay.lock().await.announce_tip_to_peers(&chain, &mut peers);
                }
            }
            other => {
                log::trace!("Ignoring {} from peer {}", other.command(), peer_id);
            }
        }
    }

    /// Clean up after departed peers and push out queued announcements
    async fn after_processing(&self) {
        self.cleanup_departed().await;
        let mut peers = self.peers.write().await;
        self.relay
            .lock()
            .await
            .flush_block_announcements(&mut peers, self.clock.now_ms());
    }

    async fn cleanup_departed(&self) {
        let mut sync = self.sync.lock().await;
        let mut chain = self.chain.write().await;
        let mut peers = self.peers.write().await;
        let departed = peers.take_departed();
        if departed.is_empty() {
            return;
        }

        let mut addrman = self.addrman.lock().await;
        for peer in &departed {
            let orphans = chain.erase_orphans_for_peer(peer.id);
            sync.on_peer_disconnected(peer.id);
            let dialed = matches!(
                peer.connection_type,
                ConnectionType::Outbound | ConnectionType::Feeler
            );
            if dialed && !peer.was_ready {
                addrman.failed(&NetworkAddress::from_socket_addr(peer.addr, ServiceFlags::empty()));
            }
            log::info!(
                "Peer {} ({}) disconnected: {} (score {}, {} orphans dropped)",
                peer.id,
                peer.addr,
                peer.reason,
                peer.misbehavior_score,
                orphans
            );
        }
        drop(addrman);

        sync.check_initial_sync(&chain, &mut peers, self.clock.now_ms());
    }

    // =========================================================================
    // Timers
    // =========================================================================

    async fn tick(&self) {
        let now = self.clock.now_ms();

        {
            let mut peers = self.peers.write().await;
            for id in peers.ids() {
                let result = match peers.get_mut(id) {
                    Some(peer) => peer.tick(now),
                    None => continue,
                };
                if let Err(e) = result {
                    peers.fail(id, &e);
                }
            }
        }

        {
            let mut sync = self.sync.lock().await;
            let mut peers = self.peers.write().await;
            sync.check_stall(&mut peers, now);
        }

        {
            let chain = self.chain.read().await;
            let mut peers = self.peers.write().await;
            self.relay.lock().await.maybe_announce(&chain, &mut peers, now);
        }

        self.chain.write().await.expire_orphans(self.clock.now());

        {
            let mut bans = self.banman.lock().await;
            bans.sweep_banned();
            bans.sweep_discouraged();
        }

        self.maintain_outbound().await;
        self.run_timers(now).await;
    }

    /// Top up outbound connections from the address book
    async fn maintain_outbound(&self) {
        let missing = {
            let peers = self.peers.read().await;
            let pending = self.pending.lock().await.len();
            peers
                .config()
                .max_outbound
                .saturating_sub(peers.outbound_count() + pending)
        };
        if missing == 0 {
            return;
        }

        let candidate = self.addrman.lock().await.select();
        if let Some(addr) = candidate {
            if let Err(e) = self.connect_to(addr.socket_addr(), ConnectionType::Outbound).await {
                log::trace!("Skipping outbound candidate {}: {}", addr, e);
            }
        }
    }

    async fn run_timers(&self, now: i64) {
        let mut timers = self.timers.lock().await;

        if self.config.feelers && now >= timers.next_feeler_ms {
            timers.next_feeler_ms = now + FEELER_INTERVAL.as_millis() as i64;
            let candidate = self.addrman.lock().await.select_new_for_feeler();
            if let Some(addr) = candidate {
                log::debug!("Starting feeler connection to {}", addr);
                if let Err(e) = self.connect_to(addr.socket_addr(), ConnectionType::Feeler).await {
                    log::trace!("Feeler to {} not started: {}", addr, e);
                }
            }
        }

        if now >= timers.next_addrman_cleanup_ms {
            timers.next_addrman_cleanup_ms = now + ADDRMAN_CLEANUP_INTERVAL.as_millis() as i64;
            let removed = self.addrman.lock().await.cleanup_stale();
            if removed > 0 {
                log::debug!("Removed {} stale addresses", removed);
            }
        }
    }

    // =========================================================================
    // Operator API
    // =========================================================================

    /// Mine blocks on the active tip and relay each one immediately
    pub async fn generate_blocks(
        &self,
        count: usize,
        miner_address: [u8; MINER_ADDRESS_SIZE],
    ) -> Result<Vec<BlockHash>, NodeError> {
        if self.params.chain_type != ChainType::Regtest {
            return Err(NodeError::MiningUnavailable(self.params.chain_type));
        }

        let mut hashes = Vec::with_capacity(count);
        for _ in 0..count {
            let hash = self.chain.write().await.mine_block(miner_address)?;
            let mut peers = self.peers.write().await;
            self.relay
                .lock()
                .await
                .relay_block(&mut peers, hash, self.clock.now_ms());
            hashes.push(hash);
        }
        if let Some(last) = hashes.last() {
            log::info!("Generated {} block(s), tip {}", hashes.len(), last.short());
        }
        Ok(hashes)
    }

    /// Invalidate a block and fall back to the best remaining chain
    pub async fn invalidate_block(&self, hash: &BlockHash) -> Result<(), NodeError> {
        let mut chain = self.chain.write().await;
        chain.invalidate_block(hash)?;
        chain.activate_best_chain()?;
        log::info!("Invalidated {}, tip now {} at height {}", hash.short(), chain.tip_hash().short(), chain.height());

        let mut peers = self.peers.write().await;
        self.relay.lock().await.announce_tip_to_peers(&chain, &mut peers);
        Ok(())
    }

    /// Ban an address and drop any connection from it
    pub async fn ban(&self, ip: IpAddr, duration_secs: i64) {
        let mut peers = self.peers.write().await;
        self.banman.lock().await.ban(&ip, duration_secs);
        let victims: Vec<PeerId> = peers
            .iter()
            .filter(|p| p.addr().ip() == ip && !p.has_permission(Permissions::NOBAN))
            .map(|p| p.id())
            .collect();
        for id in victims {
            peers.remove(id, "banned");
        }
    }

    pub async fn unban(&self, ip: IpAddr) -> bool {
        self.banman.lock().await.unban(&ip)
    }

    /// Operator disconnect; leaves the ban registry alone
    pub async fn disconnect_peer(&self, peer_id: PeerId) -> Result<(), NodeError> {
        if self.peers.write().await.disconnect(peer_id) {
            Ok(())
        } else {
            Err(NodeError::UnknownPeer(peer_id))
        }
    }

    pub async fn peer_info(&self) -> Vec<PeerInfo> {
        self.peers.read().await.infos()
    }

    pub async fn chain_tips(&self) -> Vec<ChainTip> {
        self.chain.read().await.chain_tips()
    }

    pub async fn height(&self) -> u32 {
        self.chain.read().await.height()
    }

    pub async fn tip_hash(&self) -> BlockHash {
        self.chain.read().await.tip_hash()
    }

    /// Get node status
    pub async fn status(&self) -> NodeStatus {
        let sync_peer = self.sync.lock().await.sync_peer();
        let chain = self.chain.read().await;
        let peers = self.peers.read().await;
        let addrman = self.addrman.lock().await;
        let bans = self.banman.lock().await;

        NodeStatus {
            chain: self.params.chain_type,
            listen_addr: *self.listen_addr.lock().await,
            height: chain.height(),
            tip: chain.tip_hash().to_string(),
            initial_block_download: chain.is_initial_block_download(),
            peers: peers.len(),
            inbound: peers.inbound_count(),
            outbound: peers.outbound_count(),
            sync_peer,
            known_addresses: addrman.size(),
            tried_addresses: addrman.tried_count(),
            banned: bans.banned().len(),
            discouraged: bans.discouraged_count(),
            orphan_headers: chain.orphan_count(),
        }
    }
}
