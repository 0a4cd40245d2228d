//! Block index arena
//!
//! Every known header lives in one `Vec<BlockIndexNode>`; parents are
//! referenced by [`NodeId`] rather than by owning pointers, and a hash map
//! gives O(1) lookup by block hash. A parent is always inserted before any
//! of its children, so iterating the arena in order visits ancestors first.

use crate::core::block::{BlockHash, BlockHeader};
use crate::core::pow::Work;
use bitflags::bitflags;
use std::collections::HashMap;

/// Number of ancestors used for median-time-past
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Stable position of a node in the arena
pub type NodeId = usize;

bitflags! {
    /// Validation status of an indexed header
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockStatus: u32 {
        /// Header passed all context-free and contextual checks
        const VALID_TREE = 1 << 0;
        /// Header itself was invalidated
        const FAILED_VALID = 1 << 5;
        /// Descends from an invalid header
        const FAILED_CHILD = 1 << 6;
        const FAILED_MASK = Self::FAILED_VALID.bits() | Self::FAILED_CHILD.bits();
    }
}

/// A header plus the data derived from its position in the forest
#[derive(Debug, Clone)]
pub struct BlockIndexNode {
    pub header: BlockHeader,
    pub hash: BlockHash,
    pub height: u32,
    /// Total work of the chain ending here
    pub chain_work: Work,
    pub parent: Option<NodeId>,
    pub status: BlockStatus,
    /// Arrival order, used to prefer the first-seen of equal-work chains
    pub sequence: u64,
}

impl BlockIndexNode {
    pub fn is_valid(&self) -> bool {
        !self.status.intersects(BlockStatus::FAILED_MASK)
    }
}

/// Forest of all known headers
#[derive(Debug, Default)]
pub struct BlockIndex {
    nodes: Vec<BlockIndexNode>,
    by_hash: HashMap<BlockHash, NodeId>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            by_hash: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert a header whose parent (if any) is already indexed
    pub fn insert(
        &mut self,
        header: BlockHeader,
        parent: Option<NodeId>,
        work: Work,
        sequence: u64,
    ) -> NodeId {
        let hash = header.hash();
        if let Some(&existing) = self.by_hash.get(&hash) {
            return existing;
        }

        let (height, chain_work) = match parent {
            Some(p) => {
                let parent_node = &self.nodes[p];
                (
                    parent_node.height + 1,
                    parent_node.chain_work.saturating_add(work),
                )
            }
            None => (0, work),
        };

        let id = self.nodes.len();
        self.nodes.push(BlockIndexNode {
            header,
            hash,
            height,
            chain_work,
            parent,
            status: BlockStatus::VALID_TREE,
            sequence,
        });
        self.by_hash.insert(hash, id);
        id
    }

    pub fn get(&self, id: NodeId) -> &BlockIndexNode {
        &self.nodes[id]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut BlockIndexNode {
        &mut self.nodes[id]
    }

    pub fn lookup(&self, hash: &BlockHash) -> Option<NodeId> {
        self.by_hash.get(hash).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &BlockIndexNode)> {
        self.nodes.iter().enumerate()
    }

    /// Ancestor of `id` at `height`, walking parent links
    pub fn ancestor(&self, id: NodeId, height: u32) -> Option<NodeId> {
        let mut current = id;
        if self.nodes[current].height < height {
            return None;
        }
        while self.nodes[current].height > height {
            current = self.nodes[current].parent?;
        }
        Some(current)
    }

    /// Deepest node that is an ancestor of both `a` and `b`
    pub fn last_common_ancestor(&self, a: NodeId, b: NodeId) -> Option<NodeId> {
        let height = self.nodes[a].height.min(self.nodes[b].height);
        let mut pa = self.ancestor(a, height)?;
        let mut pb = self.ancestor(b, height)?;

        while pa != pb {
            pa = self.nodes[pa].parent?;
            pb = self.nodes[pb].parent?;
        }
        Some(pa)
    }

    /// Median timestamp of the last [`MEDIAN_TIME_SPAN`] headers ending at `id`
    pub fn median_time_past(&self, id: NodeId) -> i64 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut current = Some(id);
        while let Some(node) = current {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            times.push(self.nodes[node].header.time as i64);
            current = self.nodes[node].parent;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Mark `id` invalid and every descendant as failed-child.
    /// Returns the number of nodes newly marked.
    pub fn mark_invalid(&mut self, id: NodeId) -> usize {
        let mut marked = 0;
        if self.nodes[id].is_valid() {
            marked += 1;
        }
        self.nodes[id].status.insert(BlockStatus::FAILED_VALID);

        // Children always come after their parents in the arena
        for i in (id + 1)..self.nodes.len() {
            if let Some(parent) = self.nodes[i].parent {
                if !self.nodes[parent].is_valid() && self.nodes[i].is_valid() {
                    self.nodes[i].status.insert(BlockStatus::FAILED_CHILD);
                    marked += 1;
                }
            }
        }
        marked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::MINER_ADDRESS_SIZE;

    fn child_of(prev: BlockHash, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: prev,
            miner_address: [0u8; MINER_ADDRESS_SIZE],
            time: 1_000 + nonce,
            bits: 0x207fffff,
            nonce,
            hash_randomx: BlockHash::ZERO,
        }
    }

    /// genesis -> a1 -> a2 -> a3, genesis -> b1 -> b2
    fn build_fork() -> (BlockIndex, Vec<NodeId>, Vec<NodeId>) {
        let mut index = BlockIndex::new();
        let genesis = index.insert(child_of(BlockHash::ZERO, 0), None, 2, 0);

        let mut a = vec![genesis];
        for n in 1..=3 {
            let prev = *a.last().unwrap();
            let hash = index.get(prev).hash;
            a.push(index.insert(child_of(hash, n), Some(prev), 2, n as u64));
        }

        let mut b = vec![genesis];
        for n in 1..=2 {
            let prev = *b.last().unwrap();
            let hash = index.get(prev).hash;
            b.push(index.insert(child_of(hash, 100 + n), Some(prev), 2, 10 + n as u64));
        }
        (index, a, b)
    }

    #[test]
    fn test_heights_and_work() {
        let (index, a, _) = build_fork();
        assert_eq!(index.get(a[3]).height, 3);
        assert_eq!(index.get(a[3]).chain_work, 8);
        assert_eq!(index.lookup(&index.get(a[2]).hash), Some(a[2]));
    }

    #[test]
    fn test_ancestor_and_common_ancestor() {
        let (index, a, b) = build_fork();
        assert_eq!(index.ancestor(a[3], 1), Some(a[1]));
        assert_eq!(index.ancestor(a[1], 3), None);
        assert_eq!(index.last_common_ancestor(a[3], b[2]), Some(a[0]));
        assert_eq!(index.last_common_ancestor(a[3], a[1]), Some(a[1]));
    }

    #[test]
    fn test_mark_invalid_propagates_to_descendants() {
        let (mut index, a, b) = build_fork();
        assert_eq!(index.mark_invalid(a[2]), 2);

        assert!(index.get(a[1]).is_valid());
        assert!(index.get(a[2]).status.contains(BlockStatus::FAILED_VALID));
        assert!(index.get(a[3]).status.contains(BlockStatus::FAILED_CHILD));
        assert!(index.get(b[2]).is_valid());
    }

    #[test]
    fn test_median_time_past() {
        let (index, a, _) = build_fork();
        // times: 1000, 1001, 1002, 1003
        assert_eq!(index.median_time_past(a[3]), 1002);
        assert_eq!(index.median_time_past(a[0]), 1000);
    }
}
