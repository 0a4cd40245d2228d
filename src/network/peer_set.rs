//! Connected peer collection
//!
//! Owns every [`PeerConnection`], enforces inbound/outbound capacity,
//! evicts inbound peers when full and turns misbehavior scores into
//! disconnects and discouragement.

use crate::network::banman::BanRegistry;
use crate::network::message::Message;
use crate::network::peer::{
    ConnectionType, PeerConnection, PeerError, PeerId, PeerInfo, Permissions,
};
use crate::network::protocol::{
    NetworkAddress, DEFAULT_MAX_INBOUND_CONNECTIONS, DEFAULT_MAX_OUTBOUND_CONNECTIONS,
    MAX_INBOUND_PER_IP,
};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Score at which a peer is disconnected and discouraged
pub const DEFAULT_DISCOURAGEMENT_THRESHOLD: u32 = 100;

/// Inbound peers younger than this are never evicted
pub const EVICTION_PROTECTION_WINDOW: Duration = Duration::from_secs(10);

/// Scored protocol and consensus violations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Misbehavior {
    InvalidPow,
    OversizedMessage,
    NonContinuousHeaders,
    InvalidHeader,
    TooManyUnconnecting,
    TooManyOrphans,
}

impl Misbehavior {
    pub fn points(&self) -> u32 {
        match self {
            Misbehavior::InvalidPow => 100,
            Misbehavior::OversizedMessage => 20,
            Misbehavior::NonContinuousHeaders => 20,
            Misbehavior::InvalidHeader => 100,
            Misbehavior::TooManyUnconnecting => 20,
            Misbehavior::TooManyOrphans => 100,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Misbehavior::InvalidPow => "header with invalid proof of work",
            Misbehavior::OversizedMessage => "oversized message",
            Misbehavior::NonContinuousHeaders => "non-continuous headers sequence",
            Misbehavior::InvalidHeader => "invalid header",
            Misbehavior::TooManyUnconnecting => "too many unconnecting headers",
            Misbehavior::TooManyOrphans => "exceeded orphan header limit",
        }
    }
}

/// Why a connection was refused before it was added
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdmissionError {
    #[error("Address {0} is banned")]
    Banned(IpAddr),
    #[error("Address {0} is discouraged")]
    Discouraged(IpAddr),
    #[error("No free {0} slots")]
    AtCapacity(&'static str),
    #[error("Too many inbound connections from {0}")]
    TooManyFromAddress(IpAddr),
    #[error("Already connected to {0}")]
    AlreadyConnected(SocketAddr),
    #[error("Refusing to connect to own address {0}")]
    SelfConnection(SocketAddr),
}

#[derive(Debug, Clone, Copy)]
pub struct PeerSetConfig {
    pub max_inbound: usize,
    pub max_outbound: usize,
    pub discouragement_threshold: u32,
}

impl Default for PeerSetConfig {
    fn default() -> Self {
        Self {
            max_inbound: DEFAULT_MAX_INBOUND_CONNECTIONS,
            max_outbound: DEFAULT_MAX_OUTBOUND_CONNECTIONS,
            discouragement_threshold: DEFAULT_DISCOURAGEMENT_THRESHOLD,
        }
    }
}

/// Record of a peer that left the set, kept until the node has cleaned up
/// state attributed to it
#[derive(Debug, Clone)]
pub struct DepartedPeer {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub connection_type: ConnectionType,
    pub was_ready: bool,
    pub misbehavior_score: u32,
    pub reason: String,
}

pub struct PeerSet {
    peers: HashMap<PeerId, PeerConnection>,
    next_id: PeerId,
    config: PeerSetConfig,
    local_nonce: u64,
    local_addrs: HashSet<SocketAddr>,
    departed: Vec<DepartedPeer>,
}

impl PeerSet {
    pub fn new(config: PeerSetConfig, local_nonce: u64) -> Self {
        Self {
            peers: HashMap::new(),
            next_id: 1,
            config,
            local_nonce,
            local_addrs: HashSet::new(),
            departed: Vec::new(),
        }
    }

    pub fn config(&self) -> &PeerSetConfig {
        &self.config
    }

    /// Nonce this node puts in VERSION; a peer echoing it is ourselves
    pub fn local_nonce(&self) -> u64 {
        self.local_nonce
    }

    /// Register an address this node listens on so it is never dialed
    pub fn add_local_address(&mut self, addr: SocketAddr) {
        self.local_addrs.insert(addr);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn get(&self, id: PeerId) -> Option<&PeerConnection> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut PeerConnection> {
        self.peers.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerConnection> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeerConnection> {
        self.peers.values_mut()
    }

    /// Ids in ascending order
    pub fn ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn ready_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| p.is_ready())
            .map(|p| p.id())
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn inbound_count(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.connection_type() == ConnectionType::Inbound)
            .count()
    }

    /// Full outbound connections; feelers and manual peers are not counted
    pub fn outbound_count(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.connection_type() == ConnectionType::Outbound)
            .count()
    }

    pub fn needs_more_outbound(&self) -> bool {
        self.outbound_count() < self.config.max_outbound
    }

    pub fn is_connected_to(&self, addr: &SocketAddr) -> bool {
        self.peers.values().any(|p| p.addr() == *addr)
    }

    /// Inbound connections from one IP, any port
    pub fn inbound_count_from(&self, ip: &IpAddr) -> usize {
        self.peers
            .values()
            .filter(|p| p.connection_type() == ConnectionType::Inbound && p.addr().ip() == *ip)
            .count()
    }

    pub fn find_by_addr(&self, addr: &SocketAddr) -> Option<PeerId> {
        self.peers.values().find(|p| p.addr() == *addr).map(|p| p.id())
    }

    pub fn misbehavior_score(&self, id: PeerId) -> Option<u32> {
        self.peers.get(&id).map(|p| p.misbehavior_score())
    }

    pub fn infos(&self) -> Vec<PeerInfo> {
        let mut infos: Vec<PeerInfo> = self.peers.values().map(|p| p.info()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    // =========================================================================
    // Admission
    // =========================================================================

    /// Whitelisted addresses are admitted whatever the registry says
    fn check_bans(addr: &SocketAddr, bans: &BanRegistry) -> Result<(), AdmissionError> {
        let ip = addr.ip();
        if bans.is_whitelisted(&ip) {
            return Ok(());
        }
        if bans.is_banned(&ip) {
            return Err(AdmissionError::Banned(ip));
        }
        if bans.is_discouraged(&ip) {
            return Err(AdmissionError::Discouraged(ip));
        }
        Ok(())
    }

    /// Admission check for an inbound connection. When inbound slots are
    /// full an eligible peer is evicted to make room.
    pub fn accept_inbound(
        &mut self,
        addr: SocketAddr,
        bans: &BanRegistry,
        now_ms: i64,
    ) -> Result<(), AdmissionError> {
        Self::check_bans(&addr, bans)?;

        if self.inbound_count_from(&addr.ip()) >= MAX_INBOUND_PER_IP {
            log::debug!("Rejecting inbound {}: per-address limit reached", addr);
            return Err(AdmissionError::TooManyFromAddress(addr.ip()));
        }

        if self.inbound_count() >= self.config.max_inbound {
            match self.evict_inbound(now_ms) {
                Some(evicted) => {
                    log::info!("Evicted inbound peer {} to admit {}", evicted, addr);
                }
                None => {
                    log::debug!("Rejecting inbound {}: at capacity", addr);
                    return Err(AdmissionError::AtCapacity("inbound"));
                }
            }
        }
        Ok(())
    }

    /// Admission check performed before dialing
    pub fn connect_outbound(
        &self,
        addr: SocketAddr,
        conn_type: ConnectionType,
        bans: &BanRegistry,
    ) -> Result<(), AdmissionError> {
        if self.local_addrs.contains(&addr) {
            return Err(AdmissionError::SelfConnection(addr));
        }
        if self.is_connected_to(&addr) {
            return Err(AdmissionError::AlreadyConnected(addr));
        }
        Self::check_bans(&addr, bans)?;
        if conn_type == ConnectionType::Outbound && !self.needs_more_outbound() {
            return Err(AdmissionError::AtCapacity("outbound"));
        }
        Ok(())
    }

    /// Add an admitted connection and return its id
    pub fn add(
        &mut self,
        addr: SocketAddr,
        conn_type: ConnectionType,
        mut permissions: Permissions,
        outbox: mpsc::Sender<Message>,
        now_ms: i64,
    ) -> PeerId {
        if conn_type == ConnectionType::Manual {
            permissions |= Permissions::MANUAL;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.peers.insert(
            id,
            PeerConnection::new(id, addr, conn_type, permissions, outbox, now_ms),
        );
        log::debug!("Added {:?} peer {} ({})", conn_type, id, addr);
        id
    }

    /// Drop a peer. Its outbox sender goes with it, which ends the
    /// connection task once queued messages are written.
    pub fn remove(&mut self, id: PeerId, reason: &str) -> Option<PeerConnection> {
        let mut peer = self.peers.remove(&id)?;
        let was_ready = peer.is_ready();
        peer.mark_disconnected();
        log::debug!("Removed peer {} ({}): {}", id, peer.addr(), reason);

        self.departed.push(DepartedPeer {
            id,
            addr: peer.addr(),
            connection_type: peer.connection_type(),
            was_ready,
            misbehavior_score: peer.misbehavior_score(),
            reason: reason.to_string(),
        });
        Some(peer)
    }

    /// Operator-requested disconnect; never touches the ban registry
    pub fn disconnect(&mut self, id: PeerId) -> bool {
        self.remove(id, "manual disconnect").is_some()
    }

    /// Peers removed since the last call, oldest first
    pub fn take_departed(&mut self) -> Vec<DepartedPeer> {
        std::mem::take(&mut self.departed)
    }

    /// Pick the inbound peer to evict: worst ping first (unknown ping counts
    /// as worst), then the oldest connection, then the lowest id
    fn eviction_candidate(&self, now_ms: i64) -> Option<PeerId> {
        let protection = EVICTION_PROTECTION_WINDOW.as_millis() as i64;
        self.peers
            .values()
            .filter(|p| p.connection_type() == ConnectionType::Inbound)
            .filter(|p| now_ms - p.connected_at_ms() > protection)
            .max_by(|a, b| {
                let ping_a = a.ping_time_ms().unwrap_or(i64::MAX);
                let ping_b = b.ping_time_ms().unwrap_or(i64::MAX);
                ping_a
                    .cmp(&ping_b)
                    .then_with(|| b.connected_at_ms().cmp(&a.connected_at_ms()))
                    .then_with(|| b.id().cmp(&a.id()))
            })
            .map(|p| p.id())
    }

    pub fn evict_inbound(&mut self, now_ms: i64) -> Option<PeerId> {
        let id = self.eviction_candidate(now_ms)?;
        self.remove(id, "evicted");
        Some(id)
    }

    /// Ready full outbound peers worth reconnecting to after a restart:
    /// longest connected first, then lowest ping
    pub fn anchor_candidates(&self, max: usize) -> Vec<NetworkAddress> {
        let mut candidates: Vec<&PeerConnection> = self
            .peers
            .values()
            .filter(|p| p.connection_type() == ConnectionType::Outbound && p.is_ready())
            .collect();
        candidates.sort_by_key(|p| {
            (
                p.connected_at_ms(),
                p.ping_time_ms().unwrap_or(i64::MAX),
                p.id(),
            )
        });
        candidates
            .into_iter()
            .take(max)
            .map(|p| NetworkAddress::from_socket_addr(p.addr(), p.services()))
            .collect()
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Send to one peer, dropping it if its queue is full or closed
    pub fn send_to(&mut self, id: PeerId, msg: Message, now_ms: i64) -> bool {
        let result = match self.peers.get_mut(&id) {
            Some(peer) => peer.send(msg, now_ms),
            None => return false,
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Dropping peer {}: {}", id, e);
                self.remove(id, &e.to_string());
                false
            }
        }
    }

    /// Remove a peer whose state machine reported a fatal error
    pub fn fail(&mut self, id: PeerId, error: &PeerError) {
        self.remove(id, &error.to_string());
    }

    // =========================================================================
    // Misbehavior
    // =========================================================================

    /// Add `points` to a peer's score. Returns true if the peer was
    /// disconnected as a result.
    pub fn misbehaving(
        &mut self,
        id: PeerId,
        points: u32,
        reason: &str,
        bans: &mut BanRegistry,
    ) -> bool {
        let threshold = self.config.discouragement_threshold;
        let Some(peer) = self.peers.get_mut(&id) else {
            log::trace!("Misbehavior for unknown peer {}", id);
            return false;
        };

        let score = peer.add_misbehavior(points);
        log::warn!(
            "Misbehaving: peer {} ({}) +{} -> {}: {}",
            id,
            peer.addr(),
            points,
            score,
            reason
        );

        if score < threshold {
            return false;
        }
        let ip = peer.addr().ip();
        if peer.has_permission(Permissions::NOBAN) || bans.is_whitelisted(&ip) {
            log::warn!("Peer {} reached score {} but has noban; keeping connection", id, score);
            return false;
        }

        bans.discourage(&ip);
        self.remove(id, reason);
        true
    }

    pub fn punish(&mut self, id: PeerId, misbehavior: Misbehavior, bans: &mut BanRegistry) -> bool {
        self.misbehaving(id, misbehavior.points(), misbehavior.reason(), bans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::peer::tests::{ctx, remote_version};
    use crate::util::MockClock;

    fn set() -> PeerSet {
        PeerSet::new(PeerSetConfig::default(), 0x1111)
    }

    fn bans() -> BanRegistry {
        BanRegistry::new(MockClock::new(1_700_000_000))
    }

    fn outbox() -> mpsc::Sender<Message> {
        // Receiver dropped on purpose for tests that never send
        let (tx, _rx) = mpsc::channel(16);
        tx
    }

    fn sock(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_misbehavior_points() {
        assert_eq!(Misbehavior::InvalidPow.points(), 100);
        assert_eq!(Misbehavior::OversizedMessage.points(), 20);
        assert_eq!(Misbehavior::NonContinuousHeaders.points(), 20);
        assert_eq!(Misbehavior::InvalidHeader.points(), 100);
        assert_eq!(Misbehavior::TooManyUnconnecting.points(), 20);
        assert_eq!(Misbehavior::TooManyOrphans.points(), 100);
    }

    #[test]
    fn test_scores_accumulate_then_discourage() {
        let mut peers = set();
        let mut bans = bans();
        let id = peers.add(sock("1.2.3.4:9590"), ConnectionType::Inbound, Permissions::empty(), outbox(), 0);

        for _ in 0..4 {
            assert!(!peers.punish(id, Misbehavior::NonContinuousHeaders, &mut bans));
        }
        assert_eq!(peers.misbehavior_score(id), Some(80));
        assert!(peers.punish(id, Misbehavior::OversizedMessage, &mut bans));

        assert!(!peers.contains(id));
        assert!(bans.is_discouraged(&sock("1.2.3.4:9590").ip()));
        assert!(!bans.is_banned(&sock("1.2.3.4:9590").ip()));

        let departed = peers.take_departed();
        assert_eq!(departed.len(), 1);
        assert_eq!(departed[0].misbehavior_score, 100);
    }

    #[test]
    fn test_noban_peer_kept() {
        let mut peers = set();
        let mut bans = bans();
        let id = peers.add(sock("1.2.3.4:9590"), ConnectionType::Inbound, Permissions::NOBAN, outbox(), 0);

        assert!(!peers.punish(id, Misbehavior::InvalidPow, &mut bans));
        assert!(!peers.punish(id, Misbehavior::InvalidPow, &mut bans));
        assert!(peers.contains(id));
        assert_eq!(peers.misbehavior_score(id), Some(200));
        assert!(!bans.is_discouraged(&sock("1.2.3.4:9590").ip()));
    }

    #[test]
    fn test_manual_disconnect_not_discouraged() {
        let mut peers = set();
        let bans = bans();
        let id = peers.add(sock("1.2.3.4:9590"), ConnectionType::Outbound, Permissions::empty(), outbox(), 0);
        assert!(peers.disconnect(id));
        assert!(!peers.disconnect(id));
        assert!(!bans.is_discouraged(&sock("1.2.3.4:9590").ip()));
    }

    #[test]
    fn test_connect_outbound_checks() {
        let mut peers = PeerSet::new(
            PeerSetConfig {
                max_outbound: 1,
                ..PeerSetConfig::default()
            },
            1,
        );
        let mut bans = bans();
        let own = sock("10.0.0.1:9590");
        peers.add_local_address(own);

        assert_eq!(
            peers.connect_outbound(own, ConnectionType::Outbound, &bans),
            Err(AdmissionError::SelfConnection(own))
        );

        let banned = sock("6.6.6.6:9590");
        bans.ban(&banned.ip(), 0);
        assert!(matches!(
            peers.connect_outbound(banned, ConnectionType::Outbound, &bans),
            Err(AdmissionError::Banned(_))
        ));

        let first = sock("1.1.1.1:9590");
        peers.connect_outbound(first, ConnectionType::Outbound, &bans).unwrap();
        peers.add(first, ConnectionType::Outbound, Permissions::empty(), outbox(), 0);
        assert_eq!(
            peers.connect_outbound(first, ConnectionType::Outbound, &bans),
            Err(AdmissionError::AlreadyConnected(first))
        );

        let second = sock("2.2.2.2:9590");
        assert_eq!(
            peers.connect_outbound(second, ConnectionType::Outbound, &bans),
            Err(AdmissionError::AtCapacity("outbound"))
        );
        // Feelers and manual connections do not use outbound slots
        assert!(peers.connect_outbound(second, ConnectionType::Feeler, &bans).is_ok());
        assert!(peers.connect_outbound(second, ConnectionType::Manual, &bans).is_ok());
    }

    #[test]
    fn test_accept_inbound_rejects_banned() {
        let mut peers = set();
        let mut bans = bans();
        let addr = sock("7.7.7.7:5000");
        bans.ban(&addr.ip(), 0);
        assert_eq!(
            peers.accept_inbound(addr, &bans, 0),
            Err(AdmissionError::Banned(addr.ip()))
        );

        bans.unban(&addr.ip());
        bans.discourage(&addr.ip());
        assert!(matches!(
            peers.accept_inbound(addr, &bans, 0),
            Err(AdmissionError::Discouraged(_))
        ));
    }

    #[test]
    fn test_whitelisted_admitted_despite_ban() {
        let mut peers = set();
        let mut bans = bans();
        let addr = sock("8.8.8.8:5000");
        bans.ban(&addr.ip(), 0);
        bans.discourage(&addr.ip());
        bans.add_to_whitelist(&addr.ip());

        assert!(bans.is_banned(&addr.ip()));
        assert!(peers.accept_inbound(addr, &bans, 0).is_ok());
        assert!(peers.connect_outbound(addr, ConnectionType::Outbound, &bans).is_ok());

        bans.remove_from_whitelist(&addr.ip());
        assert_eq!(
            peers.accept_inbound(addr, &bans, 0),
            Err(AdmissionError::Banned(addr.ip()))
        );
    }

    #[test]
    fn test_whitelisted_peer_not_discouraged() {
        let mut peers = set();
        let mut bans = bans();
        let addr = sock("8.8.4.4:5000");
        bans.add_to_whitelist(&addr.ip());
        let id = peers.add(addr, ConnectionType::Inbound, Permissions::empty(), outbox(), 0);

        assert!(!peers.punish(id, Misbehavior::InvalidPow, &mut bans));
        assert!(peers.contains(id));
        assert!(!bans.is_discouraged(&addr.ip()));
    }

    #[test]
    fn test_inbound_limit_per_address() {
        let mut peers = set();
        let bans = bans();
        for port in 0..MAX_INBOUND_PER_IP as u16 {
            let addr = SocketAddr::new(sock("3.3.3.3:1").ip(), 5000 + port);
            peers.accept_inbound(addr, &bans, 0).unwrap();
            peers.add(addr, ConnectionType::Inbound, Permissions::empty(), outbox(), 0);
        }

        assert_eq!(
            peers.accept_inbound(sock("3.3.3.3:6000"), &bans, 0),
            Err(AdmissionError::TooManyFromAddress(sock("3.3.3.3:1").ip()))
        );
        assert!(peers.accept_inbound(sock("3.3.3.4:6000"), &bans, 0).is_ok());

        // Outbound connections to the same host do not count
        let mut outbound_only = set();
        outbound_only.add(sock("3.3.3.3:9590"), ConnectionType::Outbound, Permissions::empty(), outbox(), 0);
        outbound_only.add(sock("3.3.3.3:9591"), ConnectionType::Outbound, Permissions::empty(), outbox(), 0);
        assert!(outbound_only.accept_inbound(sock("3.3.3.3:6000"), &bans, 0).is_ok());
    }

    fn ready_inbound(peers: &mut PeerSet, addr: &str, connected_at: i64) -> (PeerId, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(16);
        let id = peers.add(sock(addr), ConnectionType::Inbound, Permissions::empty(), tx, connected_at);
        let peer = peers.get_mut(id).unwrap();
        peer.handle_message(remote_version(7), 100, &ctx(connected_at)).unwrap();
        peer.handle_message(Message::Verack, 24, &ctx(connected_at)).unwrap();
        (id, rx)
    }

    fn ready_peer(
        peers: &mut PeerSet,
        addr: &str,
        conn_type: ConnectionType,
        connected_at: i64,
    ) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(16);
        let id = peers.add(sock(addr), conn_type, Permissions::empty(), tx, connected_at);
        let peer = peers.get_mut(id).unwrap();
        peer.start(&ctx(connected_at)).unwrap();
        peer.handle_message(remote_version(7), 100, &ctx(connected_at)).unwrap();
        peer.handle_message(Message::Verack, 24, &ctx(connected_at)).unwrap();
        assert!(peer.is_ready());
        rx
    }

    #[test]
    fn test_anchor_candidates() {
        let mut peers = set();
        let _rx = [
            ready_peer(&mut peers, "2.0.0.1:9590", ConnectionType::Outbound, 5_000),
            ready_peer(&mut peers, "2.0.0.2:9590", ConnectionType::Outbound, 1_000),
            ready_peer(&mut peers, "2.0.0.3:9590", ConnectionType::Outbound, 3_000),
            ready_peer(&mut peers, "2.0.0.4:9590", ConnectionType::Feeler, 0),
            ready_peer(&mut peers, "2.0.0.5:9590", ConnectionType::Inbound, 0),
            ready_peer(&mut peers, "2.0.0.6:9590", ConnectionType::Manual, 0),
        ];
        // Still handshaking
        peers.add(sock("2.0.0.7:9590"), ConnectionType::Outbound, Permissions::empty(), outbox(), 0);

        let anchors = peers.anchor_candidates(2);
        let addrs: Vec<SocketAddr> = anchors.iter().map(|a| a.socket_addr()).collect();
        assert_eq!(addrs, vec![sock("2.0.0.2:9590"), sock("2.0.0.3:9590")]);
        assert_eq!(peers.anchor_candidates(10).len(), 3);
    }

    #[test]
    fn test_eviction_prefers_worst_ping() {
        let mut peers = PeerSet::new(
            PeerSetConfig {
                max_inbound: 3,
                ..PeerSetConfig::default()
            },
            1,
        );
        let bans = bans();

        let (fast, mut fast_rx) = ready_inbound(&mut peers, "1.0.0.1:1", 0);
        let (slow, mut slow_rx) = ready_inbound(&mut peers, "1.0.0.2:1", 0);
        let (_young, _young_rx) = ready_inbound(&mut peers, "1.0.0.3:1", 50_000);

        // Measure pings: fast = 10 ms, slow = 500 ms
        let t = crate::network::protocol::PING_INTERVAL.as_millis() as i64;
        for (id, rx, rtt) in [(fast, &mut fast_rx, 10), (slow, &mut slow_rx, 500)] {
            let peer = peers.get_mut(id).unwrap();
            peer.tick(t).unwrap();
            let mut nonce = 0;
            while let Ok(msg) = rx.try_recv() {
                if let Message::Ping(n) = msg {
                    nonce = n;
                }
            }
            peer.handle_message(Message::Pong(nonce), 32, &ctx(t + rtt)).unwrap();
        }

        // The youngest peer is protected even though its ping is unknown
        assert!(peers.accept_inbound(sock("9.9.9.9:1"), &bans, 55_000).is_ok());
        assert!(!peers.contains(slow));
        assert!(peers.contains(fast));
    }

    #[test]
    fn test_eviction_falls_back_to_oldest() {
        let mut peers = PeerSet::new(
            PeerSetConfig {
                max_inbound: 2,
                ..PeerSetConfig::default()
            },
            1,
        );
        let older = peers.add(sock("1.0.0.1:1"), ConnectionType::Inbound, Permissions::empty(), outbox(), 0);
        let newer = peers.add(sock("1.0.0.2:1"), ConnectionType::Inbound, Permissions::empty(), outbox(), 1_000);

        assert_eq!(peers.evict_inbound(60_000), Some(older));
        assert!(peers.contains(newer));
    }

    #[test]
    fn test_noban_peer_can_be_evicted() {
        let mut peers = PeerSet::new(
            PeerSetConfig {
                max_inbound: 2,
                ..PeerSetConfig::default()
            },
            1,
        );
        let older = peers.add(sock("1.0.0.1:1"), ConnectionType::Inbound, Permissions::NOBAN, outbox(), 0);
        let newer = peers.add(sock("1.0.0.2:1"), ConnectionType::Inbound, Permissions::empty(), outbox(), 1_000);

        assert_eq!(peers.evict_inbound(60_000), Some(older));
        assert!(peers.contains(newer));
    }

    #[test]
    fn test_eviction_respects_protection_window() {
        let mut peers = PeerSet::new(
            PeerSetConfig {
                max_inbound: 1,
                ..PeerSetConfig::default()
            },
            1,
        );
        let bans = bans();
        peers.add(sock("1.0.0.1:1"), ConnectionType::Inbound, Permissions::empty(), outbox(), 0);
        assert_eq!(
            peers.accept_inbound(sock("2.0.0.1:1"), &bans, 5_000),
            Err(AdmissionError::AtCapacity("inbound"))
        );

        // Outbound peers are never evicted
        let mut only_outbound = PeerSet::new(
            PeerSetConfig {
                max_inbound: 0,
                ..PeerSetConfig::default()
            },
            1,
        );
        only_outbound.add(sock("1.0.0.1:1"), ConnectionType::Outbound, Permissions::empty(), outbox(), 0);
        assert_eq!(only_outbound.evict_inbound(60_000), None);
    }

    #[test]
    fn test_send_to_closed_peer_removes_it() {
        let mut peers = set();
        let id = peers.add(sock("1.0.0.1:1"), ConnectionType::Inbound, Permissions::empty(), outbox(), 0);
        assert!(!peers.send_to(id, Message::Ping(1), 0));
        assert!(!peers.contains(id));
        assert_eq!(peers.take_departed()[0].id, id);
    }
}
