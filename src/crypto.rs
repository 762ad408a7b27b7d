//! Encryption-at-rest for entity payloads and RSA private key material.
//!
//! Mirrors `app/settings.py`'s key derivation exactly: the configured
//! `AUTHBRIDGE_CRYPT_KEY` string is SHA-256 hashed to produce a 32-byte key.
//! The original derives a Fernet key from that digest (AES-128-CBC +
//! HMAC-SHA256 under the hood); this crate uses AES-256-GCM directly off the
//! same digest, an AEAD with an equivalent security property expressed in a
//! crate already used elsewhere in this pack (`aes-gcm`) rather than
//! reimplementing Fernet's framing.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::BridgeError;

const NONCE_LEN: usize = 12;

pub struct Cipher {
    key: [u8; 32],
}

impl Cipher {
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Cipher { key }
    }

    /// Encrypt `plaintext`, returning `nonce || ciphertext` as a single blob
    /// suitable for storage in a BLOB column.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, BridgeError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| BridgeError::Crypto(e.to_string()))?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ct = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| BridgeError::Crypto(e.to_string()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, BridgeError> {
        if blob.len() < NONCE_LEN {
            return Err(BridgeError::Crypto("ciphertext too short".into()));
        }
        let (nonce_bytes, ct) = blob.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| BridgeError::Crypto(e.to_string()))?;
        let nonce = Nonce::from_slice(nonce_bytes);
        cipher
            .decrypt(nonce, ct)
            .map_err(|e| BridgeError::Crypto(e.to_string()))
    }

    pub fn encrypt_json(&self, value: &serde_json::Value) -> Result<Vec<u8>, BridgeError> {
        self.encrypt(&serde_json::to_vec(value)?)
    }

    pub fn decrypt_json(&self, blob: &[u8]) -> Result<serde_json::Value, BridgeError> {
        let bytes = self.decrypt(blob)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Random lowercase hex string of `byte_len` bytes, matching
/// `secrets.token_hex(n)` used throughout the original model for ids and
/// API keys.
pub fn random_hex(byte_len: usize) -> String {
    let mut buf = vec![0u8; byte_len];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}
