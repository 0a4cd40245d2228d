//! Block announcements
//!
//! Tip announcements are queued per peer and flushed as one INV per peer.
//! Freshly mined blocks skip the queue and go out immediately.

use crate::core::block::BlockHash;
use crate::core::chain_state::ChainState;
use crate::network::message::{InventoryVector, Message};
use crate::network::peer::PeerId;
use crate::network::peer_set::PeerSet;
use std::time::Duration;

/// Default spacing of periodic tip announcements
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct AnnouncementScheduler {
    interval_ms: i64,
    last_announce_ms: Option<i64>,
}

impl Default for AnnouncementScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_ANNOUNCE_INTERVAL)
    }
}

impl AnnouncementScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as i64,
            last_announce_ms: None,
        }
    }

    /// Queue the current tip for one peer. Returns true if it was queued.
    pub fn announce_tip_to_peer(&self, chain: &ChainState, peers: &mut PeerSet, peer_id: PeerId) -> bool {
        if chain.height() == 0 {
            return false;
        }
        let tip = chain.tip_hash();
        match peers.get_mut(peer_id) {
            Some(peer) if peer.is_ready() => peer.queue_announcement(tip),
            _ => false,
        }
    }

    /// Queue the current tip for every Ready peer
    pub fn announce_tip_to_peers(&self, chain: &ChainState, peers: &mut PeerSet) -> usize {
        peers
            .ready_ids()
            .into_iter()
            .filter(|&id| self.announce_tip_to_peer(chain, peers, id))
            .count()
    }

    /// Periodic announcement, at most once per interval
    pub fn maybe_announce(&mut self, chain: &ChainState, peers: &mut PeerSet, now_ms: i64) -> bool {
        if let Some(last) = self.last_announce_ms {
            if now_ms - last < self.interval_ms {
                return false;
            }
        }
        self.last_announce_ms = Some(now_ms);
        self.announce_tip_to_peers(chain, peers);
        true
    }

    /// Send one INV per peer with everything queued for it
    pub fn flush_block_announcements(&self, peers: &mut PeerSet, now_ms: i64) -> usize {
        let mut flushed = 0;
        for id in peers.ids() {
            let hashes = match peers.get_mut(id) {
                Some(peer) if peer.is_ready() => peer.take_announcements(),
                _ => continue,
            };
            if hashes.is_empty() {
                continue;
            }
            log::trace!("Flushing {} announcement(s) to peer {}", hashes.len(), id);
            let inv = hashes.into_iter().map(InventoryVector::block).collect();
            if peers.send_to(id, Message::Inv(inv), now_ms) {
                flushed += 1;
            }
        }
        flushed
    }

    /// Announce a block to every Ready peer right away
    pub fn relay_block(&self, peers: &mut PeerSet, hash: BlockHash, now_ms: i64) -> usize {
        let mut sent = 0;
        for id in peers.ready_ids() {
            if peers.send_to(id, Message::Inv(vec![InventoryVector::block(hash)]), now_ms) {
                sent += 1;
            }
        }
        log::debug!("Relayed block {} to {} peer(s)", hash.short(), sent);
        sent
    }
}
