//! Chain State Management
//!
//! Header validation, the orphan-header cache, fork-choice and
//! invalidation. The active chain is always the valid branch with the most
//! cumulative work; equal-work branches keep whichever was seen first.

use crate::core::block::{BlockHash, BlockHeader, BlockLocator, MINER_ADDRESS_SIZE};
use crate::core::block_index::{BlockIndex, BlockIndexNode, NodeId};
use crate::core::params::NetworkParams;
use crate::core::pow::{block_proof, PowVerifier, Work};
use crate::network::peer::PeerId;
use crate::util::SharedClock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Maximum number of orphan headers kept in memory
pub const MAX_ORPHAN_HEADERS: usize = 1000;

/// Maximum orphan headers attributed to a single peer
pub const MAX_ORPHAN_HEADERS_PER_PEER: usize = 50;

/// Maximum time (in seconds) an orphan header can stay in the pool
pub const ORPHAN_HEADER_EXPIRE_TIME: i64 = 600; // 10 minutes

/// Maximum allowed time drift into the future (2 hours in seconds)
pub const MAX_FUTURE_BLOCK_TIME: i64 = 7200;

/// Nonce attempts per mined header before giving up
const MAX_SOLVE_TRIES: u32 = 10_000_000;

/// Reasons a header is not added to the index
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("duplicate")]
    Duplicate,
    #[error("high-hash")]
    HighHash,
    #[error("bad-genesis")]
    BadGenesis,
    #[error("genesis-via-accept")]
    GenesisViaAccept,
    #[error("orphaned")]
    Orphaned,
    #[error("orphan-limit")]
    OrphanLimit,
    #[error("bad-prevblk")]
    BadPrevBlock,
    #[error("bad-diffbits")]
    BadDiffBits,
    #[error("time-too-old")]
    TimeTooOld,
    #[error("time-too-new")]
    TimeTooNew,
    #[error("bad-version")]
    BadVersion,
}

impl ValidationError {
    /// Consensus-level rejections that justify penalizing the sender
    pub fn is_invalid_header(&self) -> bool {
        !matches!(
            self,
            ValidationError::Duplicate | ValidationError::Orphaned | ValidationError::OrphanLimit
        )
    }
}

/// Chain-level operation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChainError {
    #[error("Unknown block: {0}")]
    UnknownBlock(BlockHash),
    #[error("Cannot invalidate the genesis block")]
    CannotInvalidateGenesis,
    #[error("Block already invalid: {0}")]
    AlreadyInvalid(BlockHash),
    #[error("Refusing reorg of depth {depth} (limit {limit})")]
    SuspiciousReorg { depth: u32, limit: u32 },
    #[error("Header rejected: {0}")]
    Rejected(#[from] ValidationError),
    #[error("Failed to solve proof of work")]
    MiningFailed,
}

/// Represents a chain tip (end of a chain branch)
#[derive(Debug, Clone, PartialEq)]
pub struct ChainTip {
    /// Hash of the tip block
    pub block_hash: BlockHash,
    /// Height of the tip
    pub height: u32,
    /// Total cumulative work on this chain
    pub chain_work: Work,
    /// Whether this is the active (best) chain
    pub is_active: bool,
}

/// A header waiting for its parent
#[derive(Debug, Clone)]
pub struct OrphanHeader {
    pub header: BlockHeader,
    /// Peer that sent it, if any
    pub source: Option<PeerId>,
    /// Timestamp when this orphan was received
    pub received_at: i64,
}

impl OrphanHeader {
    /// Check if this orphan has expired
    pub fn is_expired(&self, now: i64) -> bool {
        now - self.received_at > ORPHAN_HEADER_EXPIRE_TIME
    }
}

/// Outcome of one fork-choice pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    pub disconnected: u32,
    pub connected: u32,
}

impl Activation {
    pub fn changed(&self) -> bool {
        self.disconnected > 0 || self.connected > 0
    }
}

/// Header tree, active chain and orphan cache
pub struct ChainState {
    params: Arc<NetworkParams>,
    pow: Arc<dyn PowVerifier>,
    clock: SharedClock,
    index: BlockIndex,
    /// Active chain, indexed by height
    active: Vec<NodeId>,
    /// Valid nodes that may carry more work than the tip
    candidates: HashSet<NodeId>,
    orphans: HashMap<BlockHash, OrphanHeader>,
    orphans_by_parent: HashMap<BlockHash, Vec<BlockHash>>,
    orphans_per_peer: HashMap<PeerId, usize>,
    max_orphans: usize,
    max_orphans_per_peer: usize,
    suspicious_reorg_depth: u32,
    next_sequence: u64,
    /// Latches once the node leaves initial block download
    left_ibd: AtomicBool,
}

impl ChainState {
    pub fn new(params: Arc<NetworkParams>, pow: Arc<dyn PowVerifier>, clock: SharedClock) -> Self {
        let mut index = BlockIndex::new();
        let genesis_work = pow.compute_work(&params.genesis);
        let genesis = index.insert(params.genesis, None, genesis_work, 0);

        Self {
            suspicious_reorg_depth: params.suspicious_reorg_depth,
            params,
            pow,
            clock,
            index,
            active: vec![genesis],
            candidates: HashSet::new(),
            orphans: HashMap::new(),
            orphans_by_parent: HashMap::new(),
            orphans_per_peer: HashMap::new(),
            max_orphans: MAX_ORPHAN_HEADERS,
            max_orphans_per_peer: MAX_ORPHAN_HEADERS_PER_PEER,
            next_sequence: 1,
            left_ibd: AtomicBool::new(false),
        }
    }

    /// Override the orphan cache limits
    pub fn set_orphan_limits(&mut self, total: usize, per_peer: usize) {
        self.max_orphans = total;
        self.max_orphans_per_peer = per_peer;
    }

    pub fn set_suspicious_reorg_depth(&mut self, depth: u32) {
        self.suspicious_reorg_depth = depth;
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn tip(&self) -> &BlockIndexNode {
        self.index.get(self.tip_id())
    }

    fn tip_id(&self) -> NodeId {
        // The active chain always holds at least genesis
        self.active[self.active.len() - 1]
    }

    pub fn height(&self) -> u32 {
        self.tip().height
    }

    pub fn tip_hash(&self) -> BlockHash {
        self.tip().hash
    }

    pub fn lookup(&self, hash: &BlockHash) -> Option<&BlockIndexNode> {
        self.index.lookup(hash).map(|id| self.index.get(id))
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.index.lookup(hash).is_some()
    }

    /// Whether the hash is indexed and not marked invalid
    pub fn is_valid(&self, hash: &BlockHash) -> bool {
        self.lookup(hash).map(|n| n.is_valid()).unwrap_or(false)
    }

    pub fn block_at_height(&self, height: u32) -> Option<&BlockIndexNode> {
        self.active
            .get(height as usize)
            .map(|id| self.index.get(*id))
    }

    pub fn is_on_active_chain(&self, hash: &BlockHash) -> bool {
        match self.index.lookup(hash) {
            Some(id) => {
                let height = self.index.get(id).height as usize;
                self.active.get(height) == Some(&id)
            }
            None => false,
        }
    }

    pub fn block_count(&self) -> usize {
        self.index.len()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn orphan_count_for_peer(&self, peer: PeerId) -> usize {
        self.orphans_per_peer.get(&peer).copied().unwrap_or(0)
    }

    /// All branch heads: the active tip plus every valid leaf off it
    pub fn chain_tips(&self) -> Vec<ChainTip> {
        let mut has_child = vec![false; self.index.len()];
        for (_, node) in self.index.iter() {
            if let Some(parent) = node.parent {
                has_child[parent] = true;
            }
        }

        let tip = self.tip_id();
        self.index
            .iter()
            .filter(|(id, node)| (!has_child[*id] || *id == tip) && node.is_valid())
            .map(|(id, node)| ChainTip {
                block_hash: node.hash,
                height: node.height,
                chain_work: node.chain_work,
                is_active: id == tip,
            })
            .collect()
    }

    /// Initial block download: tip is genesis, stale, or below minimum work.
    /// Once left, the node never re-enters IBD.
    pub fn is_initial_block_download(&self) -> bool {
        if self.left_ibd.load(Ordering::Relaxed) {
            return false;
        }
        let tip = self.tip();
        if tip.height == 0 {
            return true;
        }
        if tip.chain_work < self.params.minimum_chain_work {
            return true;
        }
        if (tip.header.time as i64) < self.clock.now() - self.params.max_tip_age {
            return true;
        }
        log::info!("Leaving initial block download at height {}", tip.height);
        self.left_ibd.store(true, Ordering::Relaxed);
        false
    }

    /// Minimum total work a header chain must reach to be stored
    pub fn anti_dos_work_threshold(&self) -> Work {
        if self.is_initial_block_download() {
            return 0;
        }
        let tip = self.tip();
        let buffer = block_proof(tip.header.bits)
            .saturating_mul(self.params.anti_dos_work_buffer_blocks as u128);
        let near_tip = tip.chain_work - buffer.min(tip.chain_work);
        near_tip.max(self.params.minimum_chain_work)
    }

    /// Locator for a chain position: last 10 hashes densely, then doubling steps,
    /// always ending at genesis
    pub fn locator(&self, from: &BlockHash) -> BlockLocator {
        let mut hashes = Vec::new();
        let mut current = match self.index.lookup(from) {
            Some(id) => id,
            None => return BlockLocator::new(vec![self.params.genesis_hash]),
        };
        let mut step = 1u32;

        loop {
            let node = self.index.get(current);
            hashes.push(node.hash);
            if node.height == 0 {
                break;
            }
            let next_height = node.height.saturating_sub(step);
            current = match self.index.ancestor(current, next_height) {
                Some(id) => id,
                None => break,
            };
            if hashes.len() > 10 {
                step *= 2;
            }
        }
        BlockLocator::new(hashes)
    }

    /// Locator starting at the tip's parent, so a peer that agrees with us
    /// still answers with at least our tip header
    pub fn locator_from_prev(&self) -> BlockLocator {
        let tip = self.tip();
        match tip.parent {
            Some(parent) => self.locator(&self.index.get(parent).hash),
            None => self.locator(&tip.hash),
        }
    }

    /// Every header in the batch satisfies its claimed work
    pub fn check_headers_pow(&self, headers: &[BlockHeader]) -> bool {
        headers.iter().all(|h| self.pow.verify_work(h))
    }

    /// Sum of the work claimed by a batch
    pub fn headers_work(&self, headers: &[BlockHeader]) -> Work {
        headers
            .iter()
            .fold(0u128, |acc, h| acc.saturating_add(self.pow.compute_work(h)))
    }

    // =========================================================================
    // Header acceptance
    // =========================================================================

    /// Validate a header and add it to the index.
    ///
    /// Headers with an unknown parent go to the orphan cache and yield
    /// `Orphaned` (or `OrphanLimit` when the source peer is over its cap).
    /// Successfully indexed headers become tip candidates; any orphans that
    /// were waiting on them are accepted as well.
    pub fn accept_header(
        &mut self,
        header: &BlockHeader,
        source: Option<PeerId>,
    ) -> Result<BlockHash, ValidationError> {
        let hash = self.connect_header(header, source)?;
        self.process_orphans(hash);
        Ok(hash)
    }

    /// Validate and index one header without touching waiting orphans
    fn connect_header(
        &mut self,
        header: &BlockHeader,
        source: Option<PeerId>,
    ) -> Result<BlockHash, ValidationError> {
        let hash = header.hash();

        if let Some(id) = self.index.lookup(&hash) {
            if !self.index.get(id).is_valid() {
                return Err(ValidationError::Duplicate);
            }
            return Ok(hash);
        }

        if !self.pow.verify_work(header) {
            return Err(ValidationError::HighHash);
        }

        if header.is_genesis_candidate() {
            if hash == self.params.genesis_hash {
                return Err(ValidationError::GenesisViaAccept);
            }
            return Err(ValidationError::BadGenesis);
        }

        let parent = match self.index.lookup(&header.prev_hash) {
            Some(p) => p,
            None => {
                self.add_orphan(*header, source)?;
                return Err(ValidationError::Orphaned);
            }
        };

        if !self.index.get(parent).is_valid() {
            return Err(ValidationError::BadPrevBlock);
        }

        self.contextual_check(header, parent)?;

        let work = self.pow.compute_work(header);
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let id = self.index.insert(*header, Some(parent), work, sequence);
        self.try_add_candidate(id);

        log::trace!(
            "Accepted header {} at height {}",
            hash.short(),
            self.index.get(id).height
        );
        Ok(hash)
    }

    fn contextual_check(&self, header: &BlockHeader, parent: NodeId) -> Result<(), ValidationError> {
        let parent_node = self.index.get(parent);

        if header.version < 1 {
            return Err(ValidationError::BadVersion);
        }
        if header.bits != parent_node.header.bits {
            return Err(ValidationError::BadDiffBits);
        }
        if (header.time as i64) <= self.index.median_time_past(parent) {
            return Err(ValidationError::TimeTooOld);
        }
        if header.time as i64 > self.clock.now() + MAX_FUTURE_BLOCK_TIME {
            return Err(ValidationError::TimeTooNew);
        }
        Ok(())
    }

    fn try_add_candidate(&mut self, id: NodeId) {
        let node = self.index.get(id);
        if node.is_valid() && node.chain_work >= self.tip().chain_work {
            self.candidates.insert(id);
        }
    }

    // =========================================================================
    // Orphan cache
    // =========================================================================

    fn add_orphan(&mut self, header: BlockHeader, source: Option<PeerId>) -> Result<(), ValidationError> {
        let hash = header.hash();
        if self.orphans.contains_key(&hash) {
            return Ok(());
        }

        if let Some(peer) = source {
            if self.orphan_count_for_peer(peer) >= self.max_orphans_per_peer {
                log::debug!("Peer {} exceeded orphan limit ({})", peer, self.max_orphans_per_peer);
                return Err(ValidationError::OrphanLimit);
            }
        }

        if self.orphans.len() >= self.max_orphans {
            let now = self.clock.now();
            self.expire_orphans(now);
        }
        if self.orphans.len() >= self.max_orphans {
            let oldest = self
                .orphans
                .iter()
                .min_by_key(|(_, o)| o.received_at)
                .map(|(h, _)| *h);
            if let Some(oldest) = oldest {
                self.remove_orphan(&oldest);
            }
        }

        self.orphans_by_parent
            .entry(header.prev_hash)
            .or_default()
            .push(hash);
        if let Some(peer) = source {
            *self.orphans_per_peer.entry(peer).or_insert(0) += 1;
        }
        self.orphans.insert(
            hash,
            OrphanHeader {
                header,
                source,
                received_at: self.clock.now(),
            },
        );
        Ok(())
    }

    fn remove_orphan(&mut self, hash: &BlockHash) -> Option<OrphanHeader> {
        let orphan = self.orphans.remove(hash)?;

        if let Some(siblings) = self.orphans_by_parent.get_mut(&orphan.header.prev_hash) {
            siblings.retain(|h| h != hash);
            if siblings.is_empty() {
                self.orphans_by_parent.remove(&orphan.header.prev_hash);
            }
        }
        if let Some(peer) = orphan.source {
            if let Some(count) = self.orphans_per_peer.get_mut(&peer) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.orphans_per_peer.remove(&peer);
                }
            }
        }
        Some(orphan)
    }

    /// Remove expired orphans, returning how many were dropped
    pub fn expire_orphans(&mut self, now: i64) -> usize {
        let expired: Vec<BlockHash> = self
            .orphans
            .iter()
            .filter(|(_, o)| o.is_expired(now))
            .map(|(h, _)| *h)
            .collect();

        for hash in &expired {
            self.remove_orphan(hash);
        }
        expired.len()
    }

    /// Drop everything a disconnected peer left in the orphan cache
    pub fn erase_orphans_for_peer(&mut self, peer: PeerId) -> usize {
        let owned: Vec<BlockHash> = self
            .orphans
            .iter()
            .filter(|(_, o)| o.source == Some(peer))
            .map(|(h, _)| *h)
            .collect();

        for hash in &owned {
            self.remove_orphan(hash);
        }
        owned.len()
    }

    /// Accept orphans whose parent just became known, depth-first
    fn process_orphans(&mut self, parent: BlockHash) {
        let mut pending = vec![parent];

        while let Some(parent_hash) = pending.pop() {
            let children = match self.orphans_by_parent.get(&parent_hash) {
                Some(children) => children.clone(),
                None => continue,
            };

            for child in children {
                let orphan = match self.remove_orphan(&child) {
                    Some(o) => o,
                    None => continue,
                };
                match self.connect_header(&orphan.header, orphan.source) {
                    Ok(hash) => {
                        log::debug!("Connected orphan header {}", hash.short());
                        pending.push(hash);
                    }
                    Err(e) => {
                        log::debug!("Orphan header {} rejected: {}", child.short(), e);
                    }
                }
            }
        }
    }

    // =========================================================================
    // Fork-choice
    // =========================================================================

    fn find_most_work_candidate(&self) -> Option<NodeId> {
        self.candidates
            .iter()
            .copied()
            .filter(|id| self.index.get(*id).is_valid())
            .max_by(|a, b| {
                let na = self.index.get(*a);
                let nb = self.index.get(*b);
                na.chain_work
                    .cmp(&nb.chain_work)
                    .then_with(|| nb.sequence.cmp(&na.sequence))
            })
    }

    /// Switch the active chain to the valid branch with the most work.
    /// A branch only replaces the tip if its work is strictly greater.
    pub fn activate_best_chain(&mut self) -> Result<Activation, ChainError> {
        let mut refused = None;

        // Candidates are tried in order of work; a refused branch is dropped
        // and the next best one gets its turn
        while let Some(best) = self.find_most_work_candidate() {
            let tip = self.tip_id();
            let best_hash = self.index.get(best).hash;
            if best == tip || self.index.get(best).chain_work <= self.tip().chain_work {
                break;
            }

            let fork = self
                .index
                .last_common_ancestor(tip, best)
                .ok_or(ChainError::UnknownBlock(best_hash))?;
            let fork_height = self.index.get(fork).height;
            let depth = self.tip().height - fork_height;

            if self.suspicious_reorg_depth > 0 && depth >= self.suspicious_reorg_depth {
                log::error!(
                    "Refusing reorg to {}: would disconnect {} blocks (limit {})",
                    best_hash.short(),
                    depth,
                    self.suspicious_reorg_depth - 1
                );
                self.candidates.remove(&best);
                refused = Some(ChainError::SuspiciousReorg {
                    depth,
                    limit: self.suspicious_reorg_depth,
                });
                continue;
            }

            let outcome = self.switch_to(best, fork, depth);
            self.prune_candidates();
            return Ok(outcome);
        }

        self.prune_candidates();
        match refused {
            Some(err) => Err(err),
            None => Ok(Activation {
                disconnected: 0,
                connected: 0,
            }),
        }
    }

    /// Rewind the active chain to `fork` and extend it along `best`
    fn switch_to(&mut self, best: NodeId, fork: NodeId, depth: u32) -> Activation {
        let fork_height = self.index.get(fork).height;
        self.active.truncate(fork_height as usize + 1);

        let mut branch = Vec::new();
        let mut current = best;
        while current != fork {
            branch.push(current);
            match self.index.get(current).parent {
                Some(parent) => current = parent,
                None => break,
            }
        }
        branch.reverse();
        let outcome = Activation {
            disconnected: depth,
            connected: branch.len() as u32,
        };
        self.active.extend(branch);

        if depth > 0 {
            log::warn!(
                "Chain reorganization: disconnected {} connected {} new tip {} height {}",
                outcome.disconnected,
                outcome.connected,
                self.tip().hash.short(),
                self.tip().height
            );
        } else {
            log::debug!(
                "New tip {} height {}",
                self.tip().hash.short(),
                self.tip().height
            );
        }
        outcome
    }

    fn prune_candidates(&mut self) {
        let tip_work = self.tip().chain_work;
        let tip = self.tip_id();
        let index = &self.index;
        self.candidates
            .retain(|id| *id != tip && index.get(*id).is_valid() && index.get(*id).chain_work >= tip_work);
    }

    /// Mark a block and all its descendants invalid and rewind the active
    /// chain to its parent. Fork-choice is not re-run here; call
    /// [`ChainState::activate_best_chain`] to move to the best remaining branch.
    pub fn invalidate_block(&mut self, hash: &BlockHash) -> Result<(), ChainError> {
        let id = self
            .index
            .lookup(hash)
            .ok_or(ChainError::UnknownBlock(*hash))?;
        let node = self.index.get(id);

        if node.parent.is_none() {
            return Err(ChainError::CannotInvalidateGenesis);
        }
        if !node.is_valid() {
            return Err(ChainError::AlreadyInvalid(*hash));
        }

        let height = node.height as usize;
        if self.active.get(height) == Some(&id) {
            self.active.truncate(height);
        }

        let marked = self.index.mark_invalid(id);
        log::info!(
            "Invalidated block {} ({} headers marked), tip now {} at height {}",
            hash.short(),
            marked,
            self.tip().hash.short(),
            self.tip().height
        );

        // Any valid branch at least as heavy as the new tip may now win
        let tip_work = self.tip().chain_work;
        let tip = self.tip_id();
        let revived: Vec<NodeId> = self
            .index
            .iter()
            .filter(|(nid, n)| *nid != tip && n.is_valid() && n.chain_work >= tip_work)
            .map(|(nid, _)| nid)
            .collect();
        let index = &self.index;
        self.candidates.retain(|c| index.get(*c).is_valid());
        self.candidates.extend(revived);
        Ok(())
    }

    // =========================================================================
    // Local mining
    // =========================================================================

    /// Template for the next header on the active tip
    pub fn next_header_template(&self, miner_address: [u8; MINER_ADDRESS_SIZE]) -> BlockHeader {
        let tip = self.tip();
        let min_time = self.index.median_time_past(self.tip_id()) + 1;
        let time = self.clock.now().max(min_time).max(tip.header.time as i64 + 1);

        BlockHeader {
            version: 1,
            prev_hash: tip.hash,
            miner_address,
            time: time as u32,
            bits: tip.header.bits,
            nonce: 0,
            hash_randomx: BlockHash::ZERO,
        }
    }

    /// Mine one header on the tip and make it active
    pub fn mine_block(&mut self, miner_address: [u8; MINER_ADDRESS_SIZE]) -> Result<BlockHash, ChainError> {
        let mut header = self.next_header_template(miner_address);
        if !self.pow.solve(&mut header, MAX_SOLVE_TRIES) {
            return Err(ChainError::MiningFailed);
        }
        let hash = self.accept_header(&header, None)?;
        self.activate_best_chain()?;
        Ok(hash)
    }
}
