//! Hashing seam for the audit chain.
//!
//! The audit store computes each event's hash over a canonical byte form plus
//! the previous event's hash. The digest itself is pluggable so deployments
//! can swap in an HSM-backed implementation; the shipped default is SHA-256.

use sha2::{Digest, Sha256};

/// Computes a lowercase hex digest over a byte slice.
///
/// Implementations must be deterministic and collision-resistant.
pub trait HashFunction: Send + Sync {
    /// Digest `bytes` and return the lowercase hex encoding.
    fn digest_hex(&self, bytes: &[u8]) -> String;
}

/// SHA-256 implementation of [`HashFunction`].
#[derive(Debug, Clone, Default)]
pub struct Sha256Hash;

impl HashFunction for Sha256Hash {
    fn digest_hex(&self, bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        let hash = Sha256Hash.digest_hex(b"abc");
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256_deterministic() {
        let a = Sha256Hash.digest_hex(b"payload");
        let b = Sha256Hash.digest_hex(b"payload");
        assert_eq!(a, b);
    }

    #[test]
    fn test_sha256_sensitive_to_input() {
        let a = Sha256Hash.digest_hex(b"payload");
        let b = Sha256Hash.digest_hex(b"payloae");
        assert_ne!(a, b);
    }
}
