//! Proof-of-work collaborator
//!
//! The header-sync core never hashes for work itself; it consumes a
//! [`PowVerifier`] that answers `verify_work` and `compute_work`. The
//! bundled [`Sha256dPow`] commits a double SHA-256 work hash into the
//! header's `hash_randomx` field and checks it against the compact target.

use crate::core::block::{BlockHash, BlockHeader};
use crate::crypto::double_sha256;

/// Cumulative chain work
pub type Work = u128;

/// Proof-of-work verification and accounting
pub trait PowVerifier: Send + Sync {
    /// Whether the header's claimed work meets its difficulty target
    fn verify_work(&self, header: &BlockHeader) -> bool;

    /// Expected work represented by one header
    fn compute_work(&self, header: &BlockHeader) -> Work {
        block_proof(header.bits)
    }

    /// Search nonces until the header satisfies `verify_work`.
    /// Returns false if no solution was found within `max_tries`.
    fn solve(&self, header: &mut BlockHeader, max_tries: u32) -> bool;
}

/// Decode a compact target into a 256-bit big-endian integer.
/// Returns `None` for negative, zero or overflowing encodings.
pub fn decode_compact(bits: u32) -> Option<[u8; 32]> {
    let exponent = (bits >> 24) as usize;
    let mantissa = bits & 0x007f_ffff;
    let negative = bits & 0x0080_0000 != 0;

    if mantissa == 0 || negative {
        return None;
    }

    let mantissa_bytes = [(mantissa >> 16) as u8, (mantissa >> 8) as u8, mantissa as u8];
    let mut target = [0u8; 32];

    if exponent <= 3 {
        let value = mantissa >> (8 * (3 - exponent));
        if value == 0 {
            return None;
        }
        target[29] = (value >> 16) as u8;
        target[30] = (value >> 8) as u8;
        target[31] = value as u8;
        return Some(target);
    }

    // Most significant mantissa byte lands at index 32 - exponent
    if exponent > 32 {
        // Only acceptable if the overflowing bytes are zero
        let skip = exponent - 32;
        if skip >= 3 || mantissa_bytes[..skip].iter().any(|b| *b != 0) {
            return None;
        }
        for (i, byte) in mantissa_bytes[skip..].iter().enumerate() {
            target[i] = *byte;
        }
        return Some(target);
    }

    let start = 32 - exponent;
    for (i, byte) in mantissa_bytes.iter().enumerate() {
        if start + i < 32 {
            target[start + i] = *byte;
        }
    }
    Some(target)
}

/// Work represented by a single header at `bits`: roughly 2^256 / target.
///
/// Computed from the top 128 bits of the target, saturating at `u128::MAX`
/// for targets below 2^128.
pub fn block_proof(bits: u32) -> Work {
    let target = match decode_compact(bits) {
        Some(t) => t,
        None => return 0,
    };

    let mut high = [0u8; 16];
    high.copy_from_slice(&target[..16]);
    let high = u128::from_be_bytes(high);

    if high == 0 {
        return u128::MAX;
    }
    (u128::MAX / high).max(1)
}

/// Whether a hash (interpreted as a little-endian 256-bit number) is at
/// or below a big-endian target
pub fn hash_meets_target(hash: &[u8; 32], target: &[u8; 32]) -> bool {
    let mut be = *hash;
    be.reverse();
    be <= *target
}

/// Double SHA-256 proof of work with a committed work hash
#[derive(Debug, Clone)]
pub struct Sha256dPow {
    /// Easiest target any header may claim
    pow_limit: [u8; 32],
}

impl Sha256dPow {
    pub fn new(pow_limit_bits: u32) -> Self {
        Self {
            pow_limit: decode_compact(pow_limit_bits).unwrap_or([0xff; 32]),
        }
    }

    /// Work hash over the header with the commitment field cleared
    pub fn work_hash(header: &BlockHeader) -> [u8; 32] {
        let mut stripped = *header;
        stripped.hash_randomx = BlockHash::ZERO;
        double_sha256(&stripped.serialize())
    }
}

impl PowVerifier for Sha256dPow {
    fn verify_work(&self, header: &BlockHeader) -> bool {
        let target = match decode_compact(header.bits) {
            Some(t) => t,
            None => return false,
        };
        if target > self.pow_limit {
            return false;
        }

        let work_hash = Self::work_hash(header);
        header.hash_randomx.0 == work_hash && hash_meets_target(&work_hash, &target)
    }

    fn solve(&self, header: &mut BlockHeader, max_tries: u32) -> bool {
        let target = match decode_compact(header.bits) {
            Some(t) => t,
            None => return false,
        };

        for _ in 0..max_tries {
            let work_hash = Self::work_hash(header);
            if hash_meets_target(&work_hash, &target) {
                header.hash_randomx = BlockHash(work_hash);
                return true;
            }
            header.nonce = header.nonce.wrapping_add(1);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::MINER_ADDRESS_SIZE;

    const REGTEST_BITS: u32 = 0x207fffff;

    fn header() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: BlockHash([1u8; 32]),
            miner_address: [0u8; MINER_ADDRESS_SIZE],
            time: 1_296_688_700,
            bits: REGTEST_BITS,
            nonce: 0,
            hash_randomx: BlockHash::ZERO,
        }
    }

    #[test]
    fn test_decode_compact() {
        let target = decode_compact(REGTEST_BITS).unwrap();
        assert_eq!(&target[..3], &[0x7f, 0xff, 0xff]);
        assert!(target[3..].iter().all(|b| *b == 0));

        let target = decode_compact(0x1d00ffff).unwrap();
        assert_eq!(&target[..6], &[0, 0, 0, 0, 0xff, 0xff]);

        assert!(decode_compact(0x04800000).is_none()); // negative
        assert!(decode_compact(0x20000000).is_none()); // zero
        assert!(decode_compact(0x23ffffff).is_none()); // overflow
    }

    #[test]
    fn test_block_proof_scales_with_difficulty() {
        assert_eq!(block_proof(REGTEST_BITS), 2);
        let easy = block_proof(0x1f7fffff);
        let hard = block_proof(0x1e270fd8);
        assert!(hard > easy);
        assert!(easy > block_proof(REGTEST_BITS));
        assert_eq!(block_proof(0x20000000), 0);
    }

    #[test]
    fn test_solve_and_verify() {
        let pow = Sha256dPow::new(REGTEST_BITS);
        let mut h = header();
        assert!(pow.solve(&mut h, 10_000));
        assert!(pow.verify_work(&h));

        // Tampering with any field breaks the commitment
        let mut tampered = h;
        tampered.time += 1;
        assert!(!pow.verify_work(&tampered));
    }

    #[test]
    fn test_target_above_limit_rejected() {
        let pow = Sha256dPow::new(0x1f7fffff);
        let mut h = header();
        assert!(pow.solve(&mut h, 10_000));
        assert!(!pow.verify_work(&h));
    }
}
