//! Admin PIN digest helpers
//!
//! The PIN itself never leaves process memory; only its SHA-256 hex digest
//! is configured and compared. The HTTP header check lives in the server
//! shell - this module is the single digest implementation it and the
//! tests share.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest of the input
pub fn sha256_hex(input: &str) -> String {
    use std::fmt::Write;

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Compare a presented PIN against the configured hex digest
///
/// Comparison is case-insensitive on the hex digest side.
pub fn verify_admin_pin(pin: &str, configured_hash_hex: &str) -> bool {
    sha256_hex(pin).eq_ignore_ascii_case(configured_hash_hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_known_vector() {
        // SHA-256("1234")
        assert_eq!(
            sha256_hex("1234"),
            "03ac674216f3e15c761ee1a5e255f067953623c8b388b4459e13f978d7c846f4"
        );
    }

    #[test]
    fn test_verify_admin_pin() {
        let hash = sha256_hex("0000");
        assert!(verify_admin_pin("0000", &hash));
        assert!(verify_admin_pin("0000", &hash.to_uppercase()));
        assert!(!verify_admin_pin("0001", &hash));
    }
}
