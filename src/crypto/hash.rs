//! Hashing utilities for the wire protocol and block headers
//!
//! Provides SHA-256 based hashing used for header hashes and the 4-byte
//! message checksum carried in every wire header.

use sha2::{Digest, Sha256};

/// Length of the message checksum in bytes
pub const CHECKSUM_SIZE: usize = 4;

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes double SHA-256 hash (SHA-256 of SHA-256)
/// Used for header hashes and message checksums
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// Computes double SHA-256 hash and returns it as a hex string
pub fn double_sha256_hex(data: &[u8]) -> String {
    hex::encode(double_sha256(data))
}

/// First four bytes of the double SHA-256 of a message payload
pub fn checksum(payload: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let digest = double_sha256(payload);
    [digest[0], digest[1], digest[2], digest[3]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256() {
        let hash = sha256(b"hello world");
        assert_eq!(
            hex::encode(hash),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_empty_payload_checksum() {
        // Well-known checksum of an empty payload (verack, getaddr)
        assert_eq!(checksum(&[]), [0x5d, 0xf6, 0xe0, 0xe2]);
    }

    #[test]
    fn test_double_sha256_differs_from_single() {
        let data = b"hello world";
        assert_ne!(sha256(data), double_sha256(data));
        assert_eq!(double_sha256_hex(data).len(), 64);
    }
}
