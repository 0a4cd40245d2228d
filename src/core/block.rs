//! Block header implementation
//!
//! Headers are the only block data this node exchanges: a fixed 100-byte
//! record whose hash (double SHA-256 of the serialized form) identifies it.

use crate::crypto::double_sha256;
use bytes::{Buf, BufMut};
use std::fmt;
use thiserror::Error;

// =============================================================================
// Header Constants
// =============================================================================

/// Serialized header size in bytes
pub const BLOCK_HEADER_SIZE: usize = 4 + 32 + 20 + 4 + 4 + 4 + 32;

/// Size of the miner identity field
pub const MINER_ADDRESS_SIZE: usize = 20;

// =============================================================================
// Block Errors
// =============================================================================

/// Header decoding errors
#[derive(Error, Debug, PartialEq)]
pub enum BlockError {
    #[error("Invalid header size: {0} bytes (expected: 100)")]
    InvalidHeaderSize(usize),
    #[error("Invalid hash hex: {0}")]
    InvalidHashHex(String),
}

// =============================================================================
// Block Hash
// =============================================================================

/// 256-bit block identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// The all-zero hash, used as "no previous block"
    pub const ZERO: BlockHash = BlockHash([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Parse the display form (byte-reversed hex)
    pub fn from_hex(s: &str) -> Result<Self, BlockError> {
        let mut bytes = hex::decode(s).map_err(|e| BlockError::InvalidHashHex(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(BlockError::InvalidHashHex(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        bytes.reverse();
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }

    /// Short prefix for log lines
    pub fn short(&self) -> String {
        let mut s = self.to_string();
        s.truncate(16);
        s
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut reversed = self.0;
        reversed.reverse();
        f.write_str(&hex::encode(reversed))
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.short())
    }
}

// =============================================================================
// Block Header
// =============================================================================

/// Block header as carried in HEADERS messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block version
    pub version: i32,
    /// Hash of the previous block
    pub prev_hash: BlockHash,
    /// Identity of the miner
    pub miner_address: [u8; MINER_ADDRESS_SIZE],
    /// Block creation timestamp (Unix seconds)
    pub time: u32,
    /// Compact difficulty target
    pub bits: u32,
    /// Nonce used for proof of work
    pub nonce: u32,
    /// Proof-of-work commitment
    pub hash_randomx: BlockHash,
}

impl BlockHeader {
    /// Serialize to the fixed 100-byte wire form
    pub fn serialize(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut out = [0u8; BLOCK_HEADER_SIZE];
        let mut buf = &mut out[..];
        buf.put_i32_le(self.version);
        buf.put_slice(&self.prev_hash.0);
        buf.put_slice(&self.miner_address);
        buf.put_u32_le(self.time);
        buf.put_u32_le(self.bits);
        buf.put_u32_le(self.nonce);
        buf.put_slice(&self.hash_randomx.0);
        out
    }

    /// Deserialize from exactly 100 bytes
    pub fn deserialize(data: &[u8]) -> Result<Self, BlockError> {
        if data.len() != BLOCK_HEADER_SIZE {
            return Err(BlockError::InvalidHeaderSize(data.len()));
        }
        let mut buf = data;
        let version = buf.get_i32_le();
        let mut prev = [0u8; 32];
        buf.copy_to_slice(&mut prev);
        let mut miner_address = [0u8; MINER_ADDRESS_SIZE];
        buf.copy_to_slice(&mut miner_address);
        let time = buf.get_u32_le();
        let bits = buf.get_u32_le();
        let nonce = buf.get_u32_le();
        let mut commitment = [0u8; 32];
        buf.copy_to_slice(&mut commitment);

        Ok(Self {
            version,
            prev_hash: BlockHash(prev),
            miner_address,
            time,
            bits,
            nonce,
            hash_randomx: BlockHash(commitment),
        })
    }

    /// Calculate the hash of the block header
    pub fn hash(&self) -> BlockHash {
        BlockHash(double_sha256(&self.serialize()))
    }

    pub fn is_genesis_candidate(&self) -> bool {
        self.prev_hash.is_null()
    }
}

// =============================================================================
// Block Locator
// =============================================================================

/// Sparse list of hashes describing a position in the active chain,
/// dense near the tip and exponentially sparser toward genesis
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockLocator {
    pub hashes: Vec<BlockHash>,
}

impl BlockLocator {
    pub fn new(hashes: Vec<BlockHash>) -> Self {
        Self { hashes }
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}
