//! API key material
//!
//! A token is the fixed prefix followed by a 128-bit random hex value; the
//! first 8 hex characters double as the lookup key id. Only the sha-256 of
//! the full token is persisted.

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, Result};

/// Every API key token starts with this prefix.
pub const API_KEY_PREFIX: &str = "shogun-api-";

/// Length of the key-id portion (hex chars) used for ledger lookup.
const KEY_ID_LEN: usize = 8;

/// Freshly generated key material. The `token` is shown to the caller
/// exactly once; only `hashed_token` is stored.
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    pub key_id: String,
    pub token: String,
    pub hashed_token: String,
}

pub fn generate() -> GeneratedKey {
    let mut secret = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    let body = hex::encode(secret);
    let token = format!("{API_KEY_PREFIX}{body}");
    GeneratedKey {
        key_id: body[..KEY_ID_LEN].to_string(),
        hashed_token: hash_token(&token),
        token,
    }
}

pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Extracts the key id from a presented token.
pub fn key_id_of(token: &str) -> Result<&str> {
    let body = token
        .strip_prefix(API_KEY_PREFIX)
        .ok_or_else(|| CoreError::Unauthenticated("not an api key token".into()))?;
    if body.len() < KEY_ID_LEN {
        return Err(CoreError::Unauthenticated("api key token too short".into()));
    }
    Ok(&body[..KEY_ID_LEN])
}

/// Constant-time byte comparison for token and hash checks.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_token_has_prefix_and_id() {
        let key = generate();
        assert!(key.token.starts_with(API_KEY_PREFIX));
        assert_eq!(key.key_id.len(), KEY_ID_LEN);
        assert_eq!(key_id_of(&key.token).unwrap(), key.key_id);
    }

    #[test]
    fn hash_matches_presented_token() {
        let key = generate();
        assert_eq!(hash_token(&key.token), key.hashed_token);
        assert_ne!(hash_token("shogun-api-other"), key.hashed_token);
    }

    #[test]
    fn two_keys_never_collide() {
        let a = generate();
        let b = generate();
        assert_ne!(a.token, b.token);
    }

    #[test]
    fn key_id_of_rejects_foreign_tokens() {
        assert!(key_id_of("Bearer xyz").is_err());
        assert!(key_id_of("shogun-api-ab").is_err());
    }

    #[test]
    fn constant_time_eq_behaves() {
        assert!(constant_time_eq(b"same", b"same"));
        assert!(!constant_time_eq(b"same", b"Same"));
        assert!(!constant_time_eq(b"short", b"longer"));
    }
}
