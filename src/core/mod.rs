//! Core chain components
//!
//! This module contains the header-chain building blocks:
//! - Block headers and hashes
//! - Network parameters
//! - Proof of work (pluggable verifier)
//! - Block index arena
//! - Chain state (fork choice, orphans, reorgs, invalidation)

pub mod block;
pub mod block_index;
pub mod chain_state;
pub mod params;
pub mod pow;

pub use block::{BlockError, BlockHash, BlockHeader, BlockLocator, BLOCK_HEADER_SIZE, MINER_ADDRESS_SIZE};
pub use block_index::{BlockIndex, BlockIndexNode, BlockStatus};
pub use chain_state::{
    Activation, ChainError, ChainState, ChainTip, ValidationError, MAX_FUTURE_BLOCK_TIME,
    MAX_ORPHAN_HEADERS, MAX_ORPHAN_HEADERS_PER_PEER,
};
pub use params::{ChainType, NetworkParams};
pub use pow::{block_proof, PowVerifier, Sha256dPow, Work};
