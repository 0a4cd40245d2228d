//! Header synchronization
//!
//! Headers-first sync over GETHEADERS/HEADERS. One peer at a time acts as
//! the sync peer; everything else only feeds us announcements. Every
//! HEADERS batch passes cheap DoS checks (size, claimed PoW, continuity,
//! anti-DoS work) before any header reaches the chain state.

use crate::core::block::{BlockHash, BlockHeader};
use crate::core::chain_state::{ChainState, ValidationError};
use crate::network::banman::BanRegistry;
use crate::network::message::{GetHeadersMessage, InventoryVector, Message};
use crate::network::peer::PeerId;
use crate::network::peer_set::{Misbehavior, PeerSet};
use crate::network::protocol::{MAX_HEADERS_SIZE, PROTOCOL_VERSION};
use std::time::Duration;

/// HEADERS batches that fail to connect before the peer is penalized
pub const MAX_UNCONNECTING_HEADERS: u32 = 10;

/// How long the sync peer may sit on a GETHEADERS
pub const HEADERS_RESPONSE_TIMEOUT: Duration = Duration::from_secs(120);

/// Each header's prev_hash is the hash of the header before it
pub fn headers_are_continuous(headers: &[BlockHeader]) -> bool {
    headers
        .windows(2)
        .all(|pair| pair[1].prev_hash == pair[0].hash())
}

/// Header sync coordinator
#[derive(Debug, Default)]
pub struct ChainSyncEngine {
    sync_peer: Option<PeerId>,
    /// Peer picked by the initial-sync selection, if any
    initial_sync_peer: Option<PeerId>,
    initial_sync_started: bool,
    last_headers_ms: i64,
}

impl ChainSyncEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sync_peer(&self) -> Option<PeerId> {
        self.sync_peer
    }

    pub fn last_headers_received_ms(&self) -> i64 {
        self.last_headers_ms
    }

    fn set_sync_peer(&mut self, peers: &mut PeerSet, peer_id: PeerId, now_ms: i64) {
        self.sync_peer = Some(peer_id);
        self.last_headers_ms = now_ms;
        if let Some(peer) = peers.get_mut(peer_id) {
            peer.sync.sync_started = true;
        }
    }

    fn clear_sync_peer(&mut self, peer_id: PeerId) {
        if self.sync_peer == Some(peer_id) {
            self.sync_peer = None;
        }
    }

    /// Forget a departed peer. Losing the sync peer lets initial sync pick
    /// another one.
    pub fn on_peer_disconnected(&mut self, peer_id: PeerId) {
        if self.sync_peer == Some(peer_id) || self.initial_sync_peer == Some(peer_id) {
            log::debug!("Sync peer {} disconnected, resetting sync state", peer_id);
            self.sync_peer = None;
            self.initial_sync_peer = None;
            self.initial_sync_started = false;
        }
    }

    /// Pick a sync peer if none is active: a Ready outbound peer that has not
    /// been asked before, falling back to inbound peers
    pub fn check_initial_sync(&mut self, chain: &ChainState, peers: &mut PeerSet, now_ms: i64) {
        if self.initial_sync_started || self.sync_peer.is_some() {
            return;
        }

        let candidates = |inbound: bool| {
            peers
                .iter()
                .filter(|p| p.is_ready() && p.is_inbound() == inbound && !p.sync.sync_started)
                .map(|p| p.id())
                .min()
        };
        let Some(peer_id) = candidates(false).or_else(|| candidates(true)) else {
            return;
        };

        log::debug!("Initial getheaders ({}) peer={}", chain.height(), peer_id);
        self.set_sync_peer(peers, peer_id, now_ms);
        self.initial_sync_peer = Some(peer_id);
        self.initial_sync_started = true;
        self.request_headers(chain, peers, peer_id, now_ms);
    }

    /// Send GETHEADERS with a locator built from the tip's parent
    pub fn request_headers(
        &mut self,
        chain: &ChainState,
        peers: &mut PeerSet,
        peer_id: PeerId,
        now_ms: i64,
    ) -> bool {
        let locator = chain.locator_from_prev();
        log::trace!(
            "Requesting headers from peer {} (locator size {})",
            peer_id,
            locator.hashes.len()
        );
        let msg = Message::GetHeaders(GetHeadersMessage {
            version: PROTOCOL_VERSION as u32,
            locator: locator.hashes,
            hash_stop: BlockHash::ZERO,
        });
        if !peers.send_to(peer_id, msg, now_ms) {
            return false;
        }
        if let Some(peer) = peers.get_mut(peer_id) {
            peer.sync.headers_requested_at = Some(now_ms);
        }
        true
    }

    fn punish(
        &mut self,
        peers: &mut PeerSet,
        bans: &mut BanRegistry,
        peer_id: PeerId,
        misbehavior: Misbehavior,
    ) {
        peers.punish(peer_id, misbehavior, bans);
        self.clear_sync_peer(peer_id);
    }

    /// Process a HEADERS batch. Returns true if the active tip changed.
    pub fn handle_headers(
        &mut self,
        chain: &mut ChainState,
        peers: &mut PeerSet,
        bans: &mut BanRegistry,
        peer_id: PeerId,
        headers: &[BlockHeader],
        now_ms: i64,
    ) -> bool {
        match peers.get_mut(peer_id) {
            Some(peer) => peer.sync.headers_requested_at = None,
            None => return false,
        }
        self.last_headers_ms = now_ms;

        // A batch ending in a header we already validated is a replay of our
        // own chain; it is exempt from the DoS checks below
        let skip_dos_checks = headers
            .last()
            .map(|h| chain.is_valid(&h.hash()))
            .unwrap_or(false);

        if headers.is_empty() {
            log::debug!("Received headers (0) peer={}", peer_id);
            self.clear_sync_peer(peer_id);
            return false;
        }

        // Batches decoded off the wire are already capped by the message
        // decoder; this guards callers that hand headers in directly
        if headers.len() > MAX_HEADERS_SIZE {
            log::error!(
                "Oversized headers message from peer {} ({} > {})",
                peer_id,
                headers.len(),
                MAX_HEADERS_SIZE
            );
            self.punish(peers, bans, peer_id, Misbehavior::OversizedMessage);
            return false;
        }

        log::debug!("Received headers ({}) peer={}", headers.len(), peer_id);

        if !chain.check_headers_pow(headers) {
            log::error!("Headers failed PoW check from peer {}", peer_id);
            self.punish(peers, bans, peer_id, Misbehavior::InvalidPow);
            return false;
        }

        if !headers_are_continuous(headers) {
            log::error!("Non-continuous headers from peer {}", peer_id);
            self.punish(peers, bans, peer_id, Misbehavior::NonContinuousHeaders);
            return false;
        }

        let first_prev = headers[0].prev_hash;
        let chain_start_work = match chain.lookup(&first_prev) {
            Some(node) => node.chain_work,
            None => {
                self.handle_unconnecting(chain, peers, bans, peer_id, headers, now_ms);
                return false;
            }
        };

        if let Some(peer) = peers.get_mut(peer_id) {
            peer.sync.unconnecting_headers = 0;
        }

        if !skip_dos_checks {
            let total_work = chain_start_work.saturating_add(chain.headers_work(headers));
            let minimum_work = chain.anti_dos_work_threshold();
            if total_work < minimum_work {
                if headers.len() != MAX_HEADERS_SIZE {
                    log::debug!(
                        "Ignoring low-work chain from peer {} (work={}, threshold={})",
                        peer_id,
                        total_work,
                        minimum_work
                    );
                    return false;
                }
                // More headers may follow that push the chain over the threshold
                self.request_headers(chain, peers, peer_id, now_ms);
                return false;
            }
        }

        for header in headers {
            match chain.accept_header(header, Some(peer_id)) {
                Ok(_) => {}
                Err(ValidationError::Orphaned) => continue,
                Err(ValidationError::OrphanLimit) => {
                    self.punish(peers, bans, peer_id, Misbehavior::TooManyOrphans);
                    return false;
                }
                Err(ValidationError::Duplicate) if skip_dos_checks => continue,
                Err(e) => {
                    log::error!(
                        "Peer {} sent invalid header {}: {}",
                        peer_id,
                        header.hash().short(),
                        e
                    );
                    self.punish(peers, bans, peer_id, Misbehavior::InvalidHeader);
                    return false;
                }
            }
        }

        let tip_changed = match chain.activate_best_chain() {
            Ok(activation) => activation.changed(),
            Err(e) => {
                log::warn!("Chain activation failed after headers from peer {}: {}", peer_id, e);
                self.clear_sync_peer(peer_id);
                return false;
            }
        };

        if chain.is_initial_block_download() {
            log::debug!("Synchronizing block headers, height: {}", chain.height());
        } else if tip_changed {
            log::info!("New tip: height={} hash={}", chain.height(), chain.tip_hash().short());
        }

        if headers.len() == MAX_HEADERS_SIZE {
            self.request_headers(chain, peers, peer_id, now_ms);
        } else {
            self.clear_sync_peer(peer_id);
        }
        tip_changed
    }

    /// First header's parent is unknown: count it, ask for the gap and keep
    /// the batch as orphans until the parents show up
    fn handle_unconnecting(
        &mut self,
        chain: &mut ChainState,
        peers: &mut PeerSet,
        bans: &mut BanRegistry,
        peer_id: PeerId,
        headers: &[BlockHeader],
        now_ms: i64,
    ) {
        log::warn!(
            "Headers don't connect from peer {} (first prev {})",
            peer_id,
            headers[0].prev_hash.short()
        );

        let penalize = match peers.get_mut(peer_id) {
            Some(peer) if !peer.sync.unconnecting_penalized => {
                peer.sync.unconnecting_headers += 1;
                if peer.sync.unconnecting_headers >= MAX_UNCONNECTING_HEADERS {
                    peer.sync.unconnecting_penalized = true;
                    true
                } else {
                    false
                }
            }
            _ => false,
        };
        if penalize {
            self.punish(peers, bans, peer_id, Misbehavior::TooManyUnconnecting);
            if !peers.contains(peer_id) {
                return;
            }
        }

        self.request_headers(chain, peers, peer_id, now_ms);

        for header in headers {
            if let Err(ValidationError::OrphanLimit) = chain.accept_header(header, Some(peer_id)) {
                self.punish(peers, bans, peer_id, Misbehavior::TooManyOrphans);
                return;
            }
        }
    }

    /// Answer GETHEADERS from the active chain, starting after the first
    /// locator entry we have on it
    pub fn handle_getheaders(
        &self,
        chain: &ChainState,
        peers: &mut PeerSet,
        peer_id: PeerId,
        request: &GetHeadersMessage,
        now_ms: i64,
    ) {
        let fork_height = request
            .locator
            .iter()
            .find(|hash| chain.is_on_active_chain(hash))
            .and_then(|hash| chain.lookup(hash))
            .map(|node| node.height)
            .unwrap_or(0);

        let tip_height = chain.height();
        let mut headers = Vec::new();
        let mut height = fork_height + 1;
        while height <= tip_height && headers.len() < MAX_HEADERS_SIZE {
            let Some(node) = chain.block_at_height(height) else {
                break;
            };
            headers.push(node.header);
            if !request.hash_stop.is_null() && node.hash == request.hash_stop {
                break;
            }
            height += 1;
        }

        log::debug!(
            "Sending headers ({}) peer={} (fork point height {})",
            headers.len(),
            peer_id,
            fork_height
        );
        peers.send_to(peer_id, Message::Headers(headers), now_ms);
    }

    /// Block announcements: fetch headers for any hash we have not seen,
    /// from the sync peer or, if there is none, from the announcer
    pub fn handle_inv(
        &mut self,
        chain: &ChainState,
        peers: &mut PeerSet,
        peer_id: PeerId,
        inventory: &[InventoryVector],
        now_ms: i64,
    ) {
        let unknown = inventory
            .iter()
            .filter(|inv| inv.is_block())
            .find(|inv| !chain.contains(&inv.hash));
        let Some(inv) = unknown else {
            return;
        };
        log::debug!("Peer {} announced unknown block {}", peer_id, inv.hash.short());

        match self.sync_peer {
            Some(sync_peer) if sync_peer == peer_id => {
                self.request_headers(chain, peers, peer_id, now_ms);
            }
            Some(sync_peer) => {
                log::trace!(
                    "Ignoring announcement from peer {} while syncing from {}",
                    peer_id,
                    sync_peer
                );
            }
            None => {
                self.set_sync_peer(peers, peer_id, now_ms);
                self.request_headers(chain, peers, peer_id, now_ms);
            }
        }
    }

    /// Drop a sync peer that has not answered GETHEADERS in time. Returns the
    /// disconnected peer.
    pub fn check_stall(&mut self, peers: &mut PeerSet, now_ms: i64) -> Option<PeerId> {
        let peer_id = self.sync_peer?;
        let requested_at = peers.get(peer_id)?.sync.headers_requested_at?;
        if now_ms - requested_at <= HEADERS_RESPONSE_TIMEOUT.as_millis() as i64 {
            return None;
        }

        log::warn!("Sync peer {} stalled on GETHEADERS, disconnecting", peer_id);
        peers.remove(peer_id, "headers request timed out");
        self.on_peer_disconnected(peer_id);
        Some(peer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chain_state::tests::{build_branch, regtest_state};
    use crate::core::chain_state::MAX_ORPHAN_HEADERS_PER_PEER;
    use crate::core::pow::{PowVerifier, Sha256dPow};
    use crate::network::peer::tests::{ctx, remote_version};
    use crate::network::peer::{ConnectionType, Permissions};
    use crate::network::peer_set::PeerSetConfig;
    use crate::util::{Clock, MockClock};
    use tokio::sync::mpsc;

    struct Harness {
        chain: ChainState,
        peers: PeerSet,
        bans: BanRegistry,
        engine: ChainSyncEngine,
        clock: std::sync::Arc<MockClock>,
    }

    fn harness() -> Harness {
        let (chain, clock) = regtest_state();
        Harness {
            chain,
            peers: PeerSet::new(PeerSetConfig::default(), 0x1111),
            bans: BanRegistry::new(clock.clone()),
            engine: ChainSyncEngine::new(),
            clock,
        }
    }

    fn ready_peer(
        peers: &mut PeerSet,
        addr: &str,
        conn_type: ConnectionType,
        permissions: Permissions,
    ) -> (PeerId, mpsc::Receiver<Message>) {
        let (tx, mut rx) = mpsc::channel(64);
        let id = peers.add(addr.parse().unwrap(), conn_type, permissions, tx, 0);
        let peer = peers.get_mut(id).unwrap();
        peer.start(&ctx(0)).unwrap();
        peer.handle_message(remote_version(99), 100, &ctx(0)).unwrap();
        peer.handle_message(Message::Verack, 24, &ctx(0)).unwrap();
        while rx.try_recv().is_ok() {}
        (id, rx)
    }

    fn sent(rx: &mut mpsc::Receiver<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_continuity_check() {
        let (chain, _) = regtest_state();
        let genesis = chain.tip_hash();
        let headers = build_branch(&chain, &genesis, 3, 1);
        assert!(headers_are_continuous(&headers));
        assert!(headers_are_continuous(&headers[..1]));

        let gapped = vec![headers[0], headers[2]];
        assert!(!headers_are_continuous(&gapped));
    }

    #[test]
    fn test_initial_sync_prefers_outbound() {
        let mut h = harness();
        let (inbound, mut in_rx) = ready_peer(&mut h.peers, "1.0.0.1:1", ConnectionType::Inbound, Permissions::empty());
        let (outbound, mut out_rx) = ready_peer(&mut h.peers, "1.0.0.2:1", ConnectionType::Outbound, Permissions::empty());

        h.engine.check_initial_sync(&h.chain, &mut h.peers, 0);
        assert_eq!(h.engine.sync_peer(), Some(outbound));
        assert!(matches!(sent(&mut out_rx)[..], [Message::GetHeaders(_)]));
        assert!(sent(&mut in_rx).is_empty());

        // Only one sync peer at a time
        h.engine.check_initial_sync(&h.chain, &mut h.peers, 0);
        assert!(sent(&mut in_rx).is_empty());
        assert!(h.peers.get(inbound).unwrap().sync.headers_requested_at.is_none());
    }

    #[test]
    fn test_initial_sync_falls_back_to_inbound() {
        let mut h = harness();
        let (inbound, mut rx) = ready_peer(&mut h.peers, "1.0.0.1:1", ConnectionType::Inbound, Permissions::empty());
        h.engine.check_initial_sync(&h.chain, &mut h.peers, 0);
        assert_eq!(h.engine.sync_peer(), Some(inbound));
        assert_eq!(sent(&mut rx).len(), 1);
    }

    #[test]
    fn test_headers_extend_chain() {
        let mut h = harness();
        let (peer, mut rx) = ready_peer(&mut h.peers, "1.0.0.1:1", ConnectionType::Outbound, Permissions::empty());
        h.engine.check_initial_sync(&h.chain, &mut h.peers, 0);
        sent(&mut rx);

        let genesis = h.chain.tip_hash();
        let headers = build_branch(&h.chain, &genesis, 5, 1);
        assert!(h.engine.handle_headers(&mut h.chain, &mut h.peers, &mut h.bans, peer, &headers, 10));
        assert_eq!(h.chain.height(), 5);
        assert_eq!(h.chain.tip_hash(), headers[4].hash());

        // Short batch: caught up, sync peer released, nothing more requested
        assert_eq!(h.engine.sync_peer(), None);
        assert!(sent(&mut rx).is_empty());
    }

    #[test]
    fn test_full_batch_requests_more() {
        let mut h = harness();
        let (peer, mut rx) = ready_peer(&mut h.peers, "1.0.0.1:1", ConnectionType::Outbound, Permissions::empty());
        h.engine.check_initial_sync(&h.chain, &mut h.peers, 0);
        sent(&mut rx);

        let genesis = h.chain.tip_hash();
        let headers = build_branch(&h.chain, &genesis, MAX_HEADERS_SIZE, 1);
        h.engine.handle_headers(&mut h.chain, &mut h.peers, &mut h.bans, peer, &headers, 10);
        assert_eq!(h.chain.height(), MAX_HEADERS_SIZE as u32);
        assert_eq!(h.engine.sync_peer(), Some(peer));

        let msgs = sent(&mut rx);
        match &msgs[..] {
            [Message::GetHeaders(req)] => {
                // Locator starts at the tip's parent
                assert_eq!(req.locator[0], headers[MAX_HEADERS_SIZE - 2].hash());
            }
            other => panic!("expected getheaders, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_headers_clears_sync_peer() {
        let mut h = harness();
        let (peer, _rx) = ready_peer(&mut h.peers, "1.0.0.1:1", ConnectionType::Outbound, Permissions::empty());
        h.engine.check_initial_sync(&h.chain, &mut h.peers, 0);
        assert!(!h.engine.handle_headers(&mut h.chain, &mut h.peers, &mut h.bans, peer, &[], 5));
        assert_eq!(h.engine.sync_peer(), None);
        assert!(h.peers.contains(peer));
    }

    #[test]
    fn test_invalid_pow_disconnects() {
        let mut h = harness();
        let (peer, _rx) = ready_peer(&mut h.peers, "1.0.0.1:1", ConnectionType::Outbound, Permissions::empty());
        let genesis = h.chain.tip_hash();
        let mut headers = build_branch(&h.chain, &genesis, 2, 1);
        // Impossible target
        headers[1].bits = 0x0300_0001;

        h.engine.handle_headers(&mut h.chain, &mut h.peers, &mut h.bans, peer, &headers, 0);
        assert!(!h.peers.contains(peer));
        assert!(h.bans.is_discouraged(&"1.0.0.1".parse().unwrap()));
        assert_eq!(h.chain.height(), 0);
    }

    #[test]
    fn test_non_continuous_scored() {
        let mut h = harness();
        let (peer, _rx) = ready_peer(&mut h.peers, "1.0.0.1:1", ConnectionType::Outbound, Permissions::empty());
        let genesis = h.chain.tip_hash();
        let headers = build_branch(&h.chain, &genesis, 3, 1);
        let gapped = vec![headers[0], headers[2]];

        h.engine.handle_headers(&mut h.chain, &mut h.peers, &mut h.bans, peer, &gapped, 0);
        assert_eq!(h.peers.misbehavior_score(peer), Some(20));
        assert_eq!(h.chain.height(), 0);
    }

    #[test]
    fn test_oversized_batch_scored() {
        let mut h = harness();
        let (peer, _rx) = ready_peer(&mut h.peers, "1.0.0.1:1", ConnectionType::Outbound, Permissions::empty());
        let genesis = h.chain.tip_hash();
        let one = build_branch(&h.chain, &genesis, 1, 1);
        let oversized = vec![one[0]; MAX_HEADERS_SIZE + 1];

        assert!(!h.engine.handle_headers(&mut h.chain, &mut h.peers, &mut h.bans, peer, &oversized, 0));
        assert_eq!(h.peers.misbehavior_score(peer), Some(20));
        assert!(h.peers.contains(peer));
        assert_eq!(h.chain.height(), 0);
    }

    #[test]
    fn test_invalid_header_disconnects() {
        let mut h = harness();
        let (peer, _rx) = ready_peer(&mut h.peers, "1.0.0.1:1", ConnectionType::Outbound, Permissions::empty());
        let genesis = h.chain.tip_hash();
        let mut headers = build_branch(&h.chain, &genesis, 1, 1);
        // Too far in the future; still solved so the PoW pre-check passes
        headers[0].time = (h.clock.now() + 3 * 3600) as u32;
        let pow = Sha256dPow::new(h.chain.params().pow_limit_bits);
        assert!(pow.solve(&mut headers[0], 10_000));

        h.engine.handle_headers(&mut h.chain, &mut h.peers, &mut h.bans, peer, &headers, 0);
        assert!(!h.peers.contains(peer));
    }

    #[test]
    fn test_unconnecting_headers_penalized_once() {
        let mut h = harness();
        let (peer, mut rx) = ready_peer(&mut h.peers, "1.0.0.1:1", ConnectionType::Outbound, Permissions::empty());
        let genesis = h.chain.tip_hash();
        let branch = build_branch(&h.chain, &genesis, 2, 1);

        for i in 0..MAX_UNCONNECTING_HEADERS + 3 {
            h.engine.handle_headers(&mut h.chain, &mut h.peers, &mut h.bans, peer, &branch[1..], i as i64);
            // Each unconnecting batch asks for the missing parents
            assert!(matches!(sent(&mut rx)[..], [Message::GetHeaders(_)]));
        }
        assert_eq!(h.peers.misbehavior_score(peer), Some(20));
        // The header waits in the orphan cache
        assert_eq!(h.chain.orphan_count_for_peer(peer), 1);

        // Parent arrives: the orphan connects too
        h.engine.handle_headers(&mut h.chain, &mut h.peers, &mut h.bans, peer, &branch[..1], 100);
        assert_eq!(h.chain.height(), 2);
        assert_eq!(h.peers.get(peer).unwrap().sync.unconnecting_headers, 0);
    }

    #[test]
    fn test_orphan_flood_disconnects() {
        let mut h = harness();
        let (honest_peer, _rx0) = ready_peer(&mut h.peers, "1.0.0.9:1", ConnectionType::Outbound, Permissions::empty());
        let genesis = h.chain.tip_hash();
        let honest = build_branch(&h.chain, &genesis, 3, 2);
        h.engine.handle_headers(&mut h.chain, &mut h.peers, &mut h.bans, honest_peer, &honest, 0);
        assert_eq!(h.chain.height(), 3);

        let (attacker, _rx) = ready_peer(&mut h.peers, "6.6.6.6:1", ConnectionType::Inbound, Permissions::empty());
        // Headers whose first parent we never see
        let mut scratch = regtest_state().0;
        let hidden = build_branch(&scratch, &genesis, 1, 9);
        scratch.accept_header(&hidden[0], None).unwrap();
        let flood = build_branch(&scratch, &hidden[0].hash(), MAX_ORPHAN_HEADERS_PER_PEER * 4, 9);

        h.engine.handle_headers(&mut h.chain, &mut h.peers, &mut h.bans, attacker, &flood, 0);
        assert!(!h.peers.contains(attacker));
        assert!(h.bans.is_discouraged(&"6.6.6.6".parse().unwrap()));
        assert_eq!(h.chain.height(), 3);
        assert_eq!(h.chain.tip_hash(), honest[2].hash());
    }

    #[test]
    fn test_noban_peer_survives_flood() {
        let mut h = harness();
        let (peer, _rx) = ready_peer(&mut h.peers, "6.6.6.6:1", ConnectionType::Inbound, Permissions::NOBAN);
        let genesis = h.chain.tip_hash();
        let mut scratch = regtest_state().0;
        let hidden = build_branch(&scratch, &genesis, 1, 9);
        scratch.accept_header(&hidden[0], None).unwrap();
        let flood = build_branch(&scratch, &hidden[0].hash(), MAX_ORPHAN_HEADERS_PER_PEER * 2, 9);

        h.engine.handle_headers(&mut h.chain, &mut h.peers, &mut h.bans, peer, &flood, 0);
        assert!(h.peers.contains(peer));
        assert!(h.peers.misbehavior_score(peer).unwrap() >= 100);
        assert!(!h.bans.is_discouraged(&"6.6.6.6".parse().unwrap()));
    }

    #[test]
    fn test_low_work_headers_ignored() {
        let mut h = harness();
        let (peer, _rx) = ready_peer(&mut h.peers, "1.0.0.1:1", ConnectionType::Outbound, Permissions::empty());
        let genesis = h.chain.tip_hash();
        let main = build_branch(&h.chain, &genesis, 150, 1);
        for header in &main {
            h.chain.accept_header(header, None).unwrap();
        }
        h.chain.activate_best_chain().unwrap();
        assert!(!h.chain.is_initial_block_download());

        let fork = build_branch(&h.chain, &genesis, 3, 2);
        assert!(!h.engine.handle_headers(&mut h.chain, &mut h.peers, &mut h.bans, peer, &fork, 0));
        assert!(!h.chain.contains(&fork[0].hash()));
        assert_eq!(h.peers.misbehavior_score(peer), Some(0));
    }

    #[test]
    fn test_replayed_chain_skips_dos_checks() {
        let mut h = harness();
        let (peer, _rx) = ready_peer(&mut h.peers, "1.0.0.1:1", ConnectionType::Outbound, Permissions::empty());
        let genesis = h.chain.tip_hash();
        let main = build_branch(&h.chain, &genesis, 150, 1);
        h.engine.handle_headers(&mut h.chain, &mut h.peers, &mut h.bans, peer, &main, 0);
        assert_eq!(h.chain.height(), 150);

        // Old low-work prefix of our own chain: already validated, no penalty
        h.engine.handle_headers(&mut h.chain, &mut h.peers, &mut h.bans, peer, &main[..3], 0);
        assert_eq!(h.peers.misbehavior_score(peer), Some(0));
    }

    #[test]
    fn test_getheaders_served_from_fork_point() {
        let mut h = harness();
        let (peer, mut rx) = ready_peer(&mut h.peers, "1.0.0.1:1", ConnectionType::Inbound, Permissions::empty());
        let genesis = h.chain.tip_hash();
        let main = build_branch(&h.chain, &genesis, 10, 1);
        for header in &main {
            h.chain.accept_header(header, None).unwrap();
        }
        h.chain.activate_best_chain().unwrap();

        let unknown = BlockHash([0xab; 32]);
        let request = GetHeadersMessage {
            version: 1,
            locator: vec![unknown, main[3].hash(), genesis],
            hash_stop: BlockHash::ZERO,
        };
        h.engine.handle_getheaders(&h.chain, &mut h.peers, peer, &request, 0);
        match &sent(&mut rx)[..] {
            [Message::Headers(headers)] => assert_eq!(headers, &main[4..].to_vec()),
            other => panic!("unexpected {:?}", other),
        }

        let stop = GetHeadersMessage {
            version: 1,
            locator: vec![genesis],
            hash_stop: main[1].hash(),
        };
        h.engine.handle_getheaders(&h.chain, &mut h.peers, peer, &stop, 0);
        match &sent(&mut rx)[..] {
            [Message::Headers(headers)] => assert_eq!(headers, &main[..2].to_vec()),
            other => panic!("unexpected {:?}", other),
        }

        // Unknown locator falls back to genesis
        let lost = GetHeadersMessage {
            version: 1,
            locator: vec![unknown],
            hash_stop: BlockHash::ZERO,
        };
        h.engine.handle_getheaders(&h.chain, &mut h.peers, peer, &lost, 0);
        match &sent(&mut rx)[..] {
            [Message::Headers(headers)] => assert_eq!(headers.len(), 10),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_inv_adopts_announcer() {
        let mut h = harness();
        let (a, mut a_rx) = ready_peer(&mut h.peers, "1.0.0.1:1", ConnectionType::Outbound, Permissions::empty());
        let (b, mut b_rx) = ready_peer(&mut h.peers, "1.0.0.2:1", ConnectionType::Outbound, Permissions::empty());

        let known = InventoryVector::block(h.chain.tip_hash());
        h.engine.handle_inv(&h.chain, &mut h.peers, a, &[known], 0);
        assert!(sent(&mut a_rx).is_empty());

        let fresh = InventoryVector::block(BlockHash([7; 32]));
        h.engine.handle_inv(&h.chain, &mut h.peers, a, &[known, fresh], 0);
        assert_eq!(h.engine.sync_peer(), Some(a));
        assert_eq!(sent(&mut a_rx).len(), 1);

        // Another peer's announcement is ignored while a is syncing us
        h.engine.handle_inv(&h.chain, &mut h.peers, b, &[fresh], 0);
        assert!(sent(&mut b_rx).is_empty());
    }

    #[test]
    fn test_stalled_sync_peer_dropped() {
        let mut h = harness();
        let (a, _a_rx) = ready_peer(&mut h.peers, "1.0.0.1:1", ConnectionType::Outbound, Permissions::empty());
        let (b, mut b_rx) = ready_peer(&mut h.peers, "1.0.0.2:1", ConnectionType::Outbound, Permissions::empty());

        h.engine.check_initial_sync(&h.chain, &mut h.peers, 0);
        assert_eq!(h.engine.sync_peer(), Some(a));

        let timeout = HEADERS_RESPONSE_TIMEOUT.as_millis() as i64;
        assert_eq!(h.engine.check_stall(&mut h.peers, timeout), None);
        assert_eq!(h.engine.check_stall(&mut h.peers, timeout + 1), Some(a));
        assert!(!h.peers.contains(a));
        assert!(!h.bans.is_discouraged(&"1.0.0.1".parse().unwrap()));

        // Sync moves on to the next peer
        h.engine.check_initial_sync(&h.chain, &mut h.peers, timeout + 1);
        assert_eq!(h.engine.sync_peer(), Some(b));
        assert_eq!(sent(&mut b_rx).len(), 1);
    }
}
