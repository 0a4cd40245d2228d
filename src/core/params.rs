//! Network parameters
//!
//! One immutable [`NetworkParams`] value describes a chain (magic, port,
//! genesis, work limits) and is handed to every component at construction.

use crate::core::block::{BlockHash, BlockHeader, MINER_ADDRESS_SIZE};
use crate::core::pow::{PowVerifier, Sha256dPow, Work};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

// =============================================================================
// Constants
// =============================================================================

/// Network magic values (written little-endian on the wire)
pub const MAINNET_MAGIC: u32 = 0x554E_4943;
pub const TESTNET_MAGIC: u32 = 0xA3F8_D412;
pub const REGTEST_MAGIC: u32 = 0x4B7C_2E91;

/// Default listen ports
pub const MAINNET_PORT: u16 = 9590;
pub const TESTNET_PORT: u16 = 19590;
pub const REGTEST_PORT: u16 = 29590;

/// Blocks of work subtracted from the tip when computing the low-work threshold
pub const ANTI_DOS_WORK_BUFFER_BLOCKS: u64 = 144;

/// Reorgs at least this deep are refused
pub const DEFAULT_SUSPICIOUS_REORG_DEPTH: u32 = 100;

/// A tip older than this keeps the node in initial block download (12 hours)
pub const MAX_TIP_AGE: i64 = 12 * 60 * 60;

/// Which chain a node follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    Main,
    Test,
    Regtest,
}

impl fmt::Display for ChainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChainType::Main => "main",
            ChainType::Test => "test",
            ChainType::Regtest => "regtest",
        };
        f.write_str(name)
    }
}

impl FromStr for ChainType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Ok(ChainType::Main),
            "test" | "testnet" => Ok(ChainType::Test),
            "regtest" => Ok(ChainType::Regtest),
            other => Err(format!("unknown chain type: {}", other)),
        }
    }
}

/// Consensus and networking parameters for one chain
#[derive(Debug, Clone)]
pub struct NetworkParams {
    pub chain_type: ChainType,
    /// Message start magic
    pub magic: u32,
    pub default_port: u16,
    pub genesis: BlockHeader,
    pub genesis_hash: BlockHash,
    /// Easiest permitted compact target
    pub pow_limit_bits: u32,
    /// Chains with less work never leave initial block download
    pub minimum_chain_work: Work,
    pub anti_dos_work_buffer_blocks: u64,
    /// 0 disables the guard
    pub suspicious_reorg_depth: u32,
    pub max_tip_age: i64,
    /// Target seconds between blocks
    pub target_spacing: i64,
}

fn create_genesis(time: u32, nonce: u32, bits: u32, version: i32) -> BlockHeader {
    BlockHeader {
        version,
        prev_hash: BlockHash::ZERO,
        miner_address: [0u8; MINER_ADDRESS_SIZE],
        time,
        bits,
        nonce,
        hash_randomx: BlockHash::ZERO,
    }
}

impl NetworkParams {
    pub fn for_chain(chain_type: ChainType) -> Self {
        match chain_type {
            ChainType::Main => Self::mainnet(),
            ChainType::Test => Self::testnet(),
            ChainType::Regtest => Self::regtest(),
        }
    }

    pub fn mainnet() -> Self {
        let genesis = create_genesis(1_760_292_878, 633_285, 0x1e27_0fd8, 1);
        Self {
            chain_type: ChainType::Main,
            magic: MAINNET_MAGIC,
            default_port: MAINNET_PORT,
            genesis_hash: genesis.hash(),
            genesis,
            pow_limit_bits: 0x1f0f_ffff,
            minimum_chain_work: 0,
            anti_dos_work_buffer_blocks: ANTI_DOS_WORK_BUFFER_BLOCKS,
            suspicious_reorg_depth: DEFAULT_SUSPICIOUS_REORG_DEPTH,
            max_tip_age: MAX_TIP_AGE,
            target_spacing: 2 * 60,
        }
    }

    pub fn testnet() -> Self {
        let genesis = create_genesis(1_760_549_555, 253, 0x1f7f_ffff, 1);
        Self {
            chain_type: ChainType::Test,
            magic: TESTNET_MAGIC,
            default_port: TESTNET_PORT,
            genesis_hash: genesis.hash(),
            genesis,
            pow_limit_bits: 0x1f7f_ffff,
            minimum_chain_work: 0,
            anti_dos_work_buffer_blocks: ANTI_DOS_WORK_BUFFER_BLOCKS,
            suspicious_reorg_depth: DEFAULT_SUSPICIOUS_REORG_DEPTH,
            max_tip_age: MAX_TIP_AGE,
            target_spacing: 5,
        }
    }

    pub fn regtest() -> Self {
        let genesis = create_genesis(1_296_688_602, 2, 0x207f_ffff, 1);
        Self {
            chain_type: ChainType::Regtest,
            magic: REGTEST_MAGIC,
            default_port: REGTEST_PORT,
            genesis_hash: genesis.hash(),
            genesis,
            pow_limit_bits: 0x207f_ffff,
            minimum_chain_work: 0,
            anti_dos_work_buffer_blocks: ANTI_DOS_WORK_BUFFER_BLOCKS,
            suspicious_reorg_depth: DEFAULT_SUSPICIOUS_REORG_DEPTH,
            max_tip_age: MAX_TIP_AGE,
            target_spacing: 2 * 60,
        }
    }

    /// The proof-of-work verifier matching these parameters
    pub fn pow(&self) -> Arc<dyn PowVerifier> {
        Arc::new(Sha256dPow::new(self.pow_limit_bits))
    }

    /// Magic as it appears on the wire
    pub fn magic_bytes(&self) -> [u8; 4] {
        self.magic.to_le_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_type_parsing() {
        assert_eq!("regtest".parse::<ChainType>(), Ok(ChainType::Regtest));
        assert_eq!("MAINNET".parse::<ChainType>(), Ok(ChainType::Main));
        assert!("foo".parse::<ChainType>().is_err());
        assert_eq!(ChainType::Test.to_string(), "test");
    }

    #[test]
    fn test_networks_are_distinct() {
        let main = NetworkParams::mainnet();
        let test = NetworkParams::testnet();
        let reg = NetworkParams::regtest();

        assert_ne!(main.magic, test.magic);
        assert_ne!(test.magic, reg.magic);
        assert_ne!(main.genesis_hash, reg.genesis_hash);
        assert_eq!(reg.default_port, 29590);
        assert_eq!(main.magic_bytes(), [0x43, 0x49, 0x4E, 0x55]);
    }

    #[test]
    fn test_genesis_hash_matches_header() {
        let params = NetworkParams::regtest();
        assert_eq!(params.genesis.hash(), params.genesis_hash);
        assert!(params.genesis.prev_hash.is_null());
    }
}
