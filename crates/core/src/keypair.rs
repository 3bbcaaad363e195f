//! Relay signing identity
//!
//! A secp256k1 keypair persisted as a JSON file. It must survive restarts
//! or every previously signed proof and pulse becomes unverifiable, so the
//! file is created once and loaded thereafter, with owner-only permissions.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::auth::wallet::keccak256;
use crate::error::{CoreError, Result};

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyFile {
    private_key_hex: String,
    public_key_hex: String,
    address: String,
}

pub struct RelayKeypair {
    secret: libsecp256k1::SecretKey,
    public: libsecp256k1::PublicKey,
    address: String,
}

impl RelayKeypair {
    /// Loads the keypair at `path`, generating and persisting a fresh one
    /// on first boot.
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| CoreError::Backend(format!("read key file: {e}")))?;
            let file: KeyFile = serde_json::from_str(&raw)
                .map_err(|e| CoreError::Backend(format!("parse key file: {e}")))?;
            let secret_bytes: [u8; 32] = hex::decode(&file.private_key_hex)
                .ok()
                .and_then(|v| v.try_into().ok())
                .ok_or_else(|| CoreError::Backend("malformed key file".into()))?;
            let secret = libsecp256k1::SecretKey::parse(&secret_bytes)
                .map_err(|e| CoreError::Backend(format!("invalid stored key: {e}")))?;
            return Ok(Self::from_secret(secret));
        }

        let mut bytes = [0u8; 32];
        let secret = loop {
            rand::rngs::OsRng.fill_bytes(&mut bytes);
            if let Ok(sk) = libsecp256k1::SecretKey::parse(&bytes) {
                break sk;
            }
        };
        let keypair = Self::from_secret(secret);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::Backend(format!("create key dir: {e}")))?;
        }
        let file = KeyFile {
            private_key_hex: hex::encode(keypair.secret.serialize()),
            public_key_hex: hex::encode(keypair.public.serialize()),
            address: keypair.address.clone(),
        };
        let encoded = serde_json::to_string_pretty(&file)
            .map_err(|e| CoreError::Backend(format!("encode key file: {e}")))?;
        std::fs::write(path, encoded)
            .map_err(|e| CoreError::Backend(format!("write key file: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| CoreError::Backend(format!("chmod key file: {e}")))?;
        }
        info!(address = %keypair.address, "generated relay keypair");
        Ok(keypair)
    }

    fn from_secret(secret: libsecp256k1::SecretKey) -> Self {
        let public = libsecp256k1::PublicKey::from_secret_key(&secret);
        let serialized = public.serialize();
        let hash = keccak256(&serialized[1..]);
        Self {
            secret,
            public,
            address: format!("0x{}", hex::encode(&hash[12..])),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.serialize())
    }

    /// Signs a 32-byte digest; returns the 65-byte `r||s||v` hex form.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> String {
        let (sig, rec_id) = libsecp256k1::sign(&libsecp256k1::Message::parse(digest), &self.secret);
        let mut raw = [0u8; 65];
        raw[..64].copy_from_slice(&sig.serialize());
        raw[64] = rec_id.serialize() + 27;
        format!("0x{}", hex::encode(raw))
    }

    /// Signs arbitrary bytes by keccak-hashing them first.
    pub fn sign(&self, data: &[u8]) -> String {
        self.sign_digest(&keccak256(data))
    }
}
