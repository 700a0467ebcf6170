//! SHA-256 content digests for container entries.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Size of a SHA-256 digest in bytes.
pub const DIGEST_SIZE: usize = 32;

/// Length of a hex-encoded digest.
pub const DIGEST_HEX_LEN: usize = DIGEST_SIZE * 2;

/// Type alias for a 32-byte digest.
pub type Digest256 = [u8; DIGEST_SIZE];

/// Errors that can occur when comparing content against a stored digest.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DigestError {
    /// The stored digest is not 64 lowercase hex characters.
    #[error("malformed digest: {value:?}")]
    Malformed {
        /// The offending value.
        value: String,
    },

    /// The content does not hash to the stored digest.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    Mismatch {
        /// The stored digest.
        expected: String,
        /// The digest computed from the content.
        actual: String,
    },
}

/// Hasher for container entries.
pub struct ContentHasher;

impl ContentHasher {
    /// Hashes raw content.
    #[must_use]
    pub fn hash(content: &[u8]) -> Digest256 {
        Sha256::digest(content).into()
    }

    /// Hashes raw content and returns the lowercase hex encoding.
    #[must_use]
    pub fn hash_hex(content: &[u8]) -> String {
        hex::encode(Self::hash(content))
    }

    /// Returns `true` if `value` looks like a hex-encoded SHA-256 digest.
    #[must_use]
    pub fn is_well_formed(value: &str) -> bool {
        value.len() == DIGEST_HEX_LEN
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }

    /// Verifies that `content` hashes to `expected_hex`.
    ///
    /// # Errors
    ///
    /// Returns [`DigestError::Malformed`] if the stored digest is not
    /// well-formed, or [`DigestError::Mismatch`] if the digests differ.
    pub fn verify(content: &[u8], expected_hex: &str) -> Result<(), DigestError> {
        if !Self::is_well_formed(expected_hex) {
            return Err(DigestError::Malformed {
                value: expected_hex.to_string(),
            });
        }
        let actual = Self::hash_hex(content);
        if actual != expected_hex {
            return Err(DigestError::Mismatch {
                expected: expected_hex.to_string(),
                actual,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        // SHA-256("abc")
        assert_eq!(
            ContentHasher::hash_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = ContentHasher::hash(b"payload");
        let b = ContentHasher::hash(b"payload");
        assert_eq!(a, b);
        assert_ne!(a, ContentHasher::hash(b"payload2"));
    }

    #[test]
    fn test_verify_success() {
        let digest = ContentHasher::hash_hex(b"hello");
        assert!(ContentHasher::verify(b"hello", &digest).is_ok());
    }

    #[test]
    fn test_verify_mismatch() {
        let digest = ContentHasher::hash_hex(b"hello");
        let result = ContentHasher::verify(b"hellO", &digest);
        assert!(matches!(result, Err(DigestError::Mismatch { .. })));
    }

    #[test]
    fn test_verify_malformed() {
        let result = ContentHasher::verify(b"hello", "not-a-digest");
        assert!(matches!(result, Err(DigestError::Malformed { .. })));

        let upper = ContentHasher::hash_hex(b"hello").to_uppercase();
        assert!(!ContentHasher::is_well_formed(&upper));
    }
}
