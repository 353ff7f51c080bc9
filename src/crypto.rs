// src/crypto.rs
use std::fmt;

use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Strict withdrawal-token alphabet: uppercase Latin letters and digits,
/// 36 symbols. The wire pattern is `^[A-Z0-9]{4}-[A-Z0-9]{8}$`; the historical
/// Base58-style alphabet is not accepted.
pub const TOKEN_ALPHABET: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub const PREFIX_LEN: usize = 4;
pub const CORE_LEN: usize = 8;
pub const SALT_LEN: usize = 16;
pub const HASH_LEN: usize = 32;

fn draw_symbols(len: usize) -> String {
    // random_range is an unbiased integer draw from the thread-local CSPRNG.
    // Never fold raw bytes with `%`; that biases the low symbols.
    let mut rng = rand::rng();
    (0..len)
        .map(|_| TOKEN_ALPHABET[rng.random_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

/// Draws a fresh `PREFIX-CORE` plaintext. The prefix is a non-secret lookup
/// discriminator; the core carries the entropy (8 symbols over 36 > 41 bits).
pub fn generate_plaintext() -> String {
    format!("{}-{}", draw_symbols(PREFIX_LEN), draw_symbols(CORE_LEN))
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rng().fill(&mut salt);
    salt
}

/// Splits a presented token into `(prefix, core)`, enforcing the wire shape.
/// Returns `None` for anything malformed so callers reject without touching
/// storage.
pub fn parse_plaintext(token: &str) -> Option<(&str, &str)> {
    let (prefix, core) = token.split_once('-')?;
    if prefix.len() != PREFIX_LEN || core.len() != CORE_LEN {
        return None;
    }
    let in_alphabet =
        |s: &str| s.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit());
    (in_alphabet(prefix) && in_alphabet(core)).then_some((prefix, core))
}

/// Salted, peppered token digest: `SHA256(pepper ‖ plaintext ‖ salt)`.
///
/// The pepper is a process-wide secret held in memory only; the salt is the
/// 16-byte per-token value stored with the row. Rotating the pepper
/// invalidates every live token.
pub struct TokenHasher {
    pepper: Vec<u8>,
}

impl TokenHasher {
    pub fn new(pepper: impl Into<Vec<u8>>) -> Self {
        Self {
            pepper: pepper.into(),
        }
    }

    pub fn digest(&self, plaintext: &str, salt: &[u8]) -> [u8; HASH_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(&self.pepper);
        hasher.update(plaintext.as_bytes());
        hasher.update(salt);
        hasher.finalize().into()
    }

    /// Constant-time comparison against a stored digest.
    pub fn verify(&self, plaintext: &str, salt: &[u8], expected: &[u8]) -> bool {
        let computed = self.digest(plaintext, salt);
        computed.as_slice().ct_eq(expected).into()
    }
}

// The pepper must never reach logs or panic payloads.
impl fmt::Debug for TokenHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenHasher(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_matches_wire_pattern() {
        for _ in 0..64 {
            let token = generate_plaintext();
            assert_eq!(token.len(), PREFIX_LEN + 1 + CORE_LEN);
            let (prefix, core) = parse_plaintext(&token).expect("generated token must parse");
            assert_eq!(prefix.len(), PREFIX_LEN);
            assert_eq!(core.len(), CORE_LEN);
        }
    }

    #[test]
    fn parse_rejects_malformed_tokens() {
        assert!(parse_plaintext("abc-xyz").is_none());
        assert!(parse_plaintext("ABCD12345678").is_none());
        assert!(parse_plaintext("ABC-12345678").is_none());
        assert!(parse_plaintext("ABCD-1234567").is_none());
        assert!(parse_plaintext("ABCD-123456789").is_none());
        assert!(parse_plaintext("abcd-12345678").is_none());
        assert!(parse_plaintext("AB D-12345678").is_none());
        assert!(parse_plaintext("").is_none());
        assert!(parse_plaintext("ABCD-1234-678").is_none());
    }

    #[test]
    fn digest_is_deterministic_and_salt_sensitive() {
        let hasher = TokenHasher::new(b"pepper".to_vec());
        let salt_a = [1u8; SALT_LEN];
        let salt_b = [2u8; SALT_LEN];

        assert_eq!(
            hasher.digest("ABCD-12345678", &salt_a),
            hasher.digest("ABCD-12345678", &salt_a)
        );
        assert_ne!(
            hasher.digest("ABCD-12345678", &salt_a),
            hasher.digest("ABCD-12345678", &salt_b)
        );
    }

    #[test]
    fn digest_is_pepper_sensitive() {
        let salt = [7u8; SALT_LEN];
        let a = TokenHasher::new(b"pepper-a".to_vec()).digest("ABCD-12345678", &salt);
        let b = TokenHasher::new(b"pepper-b".to_vec()).digest("ABCD-12345678", &salt);
        assert_ne!(a, b);
    }

    #[test]
    fn verify_accepts_match_and_rejects_near_miss() {
        let hasher = TokenHasher::new(b"pepper".to_vec());
        let salt = generate_salt();
        let stored = hasher.digest("ABCD-12345678", &salt);

        assert!(hasher.verify("ABCD-12345678", &salt, &stored));
        assert!(!hasher.verify("ABCD-12345679", &salt, &stored));
        assert!(!hasher.verify("ABCD-12345678", &salt, &stored[..31]));
    }

    #[test]
    fn salts_are_fresh() {
        assert_ne!(generate_salt(), generate_salt());
    }
}
