//! Single-use admission tokens and `quid` generation.
//!
//! Tokens are uniformly random and hex-encoded; 160 bits (20 bytes) sits in
//! the middle of the spec's 160–256 bit range. The server owns the
//! authorized set and one-shot consumption — this module only mints the
//! random value, it is not a store.

use rand::RngCore;

const TOKEN_BYTES: usize = 20;
const QUID_BYTES: usize = 16;

/// Generate a fresh single-use admission token (hex-encoded, 160 bits).
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generate a server-side-unique `quid` for a new data-channel session
/// (hex-encoded 128-bit id).
pub fn generate_quid() -> String {
    let mut bytes = [0u8; QUID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn tokens_are_hex_and_right_length() {
        let token = generate_token();
        assert_eq!(token.len(), TOKEN_BYTES * 2);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn tokens_are_unique() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(generate_token()));
        }
    }

    #[test]
    fn quids_are_unique() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(generate_quid()));
        }
    }
}
