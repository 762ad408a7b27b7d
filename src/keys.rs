//! Key Ring & Token Authority (Component D): RSA key-ring with kid-based
//! rotation and RS256 JWT mint/verify. Grounded on
//! `app/routers/token.py::generate_rsa_keys`/`load_rsa_keys`, expanded with
//! a kid-indexed ring per the canonical persistence format in
//! `SPEC_FULL.md`.

use std::collections::HashMap;
use std::sync::RwLock;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::crypto::random_hex;
use crate::error::BridgeError;

const RSA_BITS: usize = 2048;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredKey {
    kid: String,
    public_pem: String,
    /// Encrypted PEM bytes of the private key (raw ciphertext, not base64 —
    /// see the ring persistence format note in the design doc).
    private_pem_encrypted: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RingDocument {
    current_kid: String,
    keys: Vec<StoredKey>,
}

struct LoadedKey {
    public_pem: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

/// RSA key ring. All observed kids are retained for verification for the
/// process lifetime; pruning is intentionally left unimplemented.
pub struct KeyRing {
    current_kid: RwLock<String>,
    keys: RwLock<HashMap<String, LoadedKey>>,
    private_pems: RwLock<HashMap<String, String>>,
}

impl KeyRing {
    /// Load the ring from the backend, bootstrapping a fresh kid if none
    /// exists yet (mirroring `load_rsa_keys`' generate-on-first-use path).
    pub fn load_or_bootstrap(backend: &Backend) -> Result<Self, BridgeError> {
        if let Some(blob) = backend.get_ring_document()? {
            return Self::from_document_bytes(backend, &blob);
        }

        // Legacy single-key fallback slots, matching `rsa:public:data` /
        // `rsa:private:data` in the original.
        if let Some((public_pem, private_pem)) = backend.get_rsa()? {
            let ring = Self::new_empty();
            ring.insert_key("legacy", &public_pem, &private_pem)?;
            *ring.current_kid.write().unwrap() = "legacy".to_string();
            ring.persist(backend)?;
            return Ok(ring);
        }

        let ring = Self::new_empty();
        ring.rotate(backend)?;
        Ok(ring)
    }

    fn new_empty() -> Self {
        KeyRing {
            current_kid: RwLock::new(String::new()),
            keys: RwLock::new(HashMap::new()),
            private_pems: RwLock::new(HashMap::new()),
        }
    }

    fn from_document_bytes(backend: &Backend, blob: &[u8]) -> Result<Self, BridgeError> {
        let plaintext = backend_cipher_decrypt(backend, blob)?;
        let doc: RingDocument = serde_json::from_slice(&plaintext)?;
        let ring = Self::new_empty();
        for key in &doc.keys {
            let private_pem = backend_cipher_decrypt(backend, &key.private_pem_encrypted)?;
            let private_pem = String::from_utf8(private_pem)
                .map_err(|e| BridgeError::Crypto(e.to_string()))?;
            ring.insert_key(&key.kid, &key.public_pem, &private_pem)?;
        }
        *ring.current_kid.write().unwrap() = doc.current_kid;
        Ok(ring)
    }

    fn insert_key(&self, kid: &str, public_pem: &str, private_pem: &str) -> Result<(), BridgeError> {
        let encoding_key = EncodingKey::from_rsa_pem(private_pem.as_bytes())
            .map_err(|e| BridgeError::Crypto(e.to_string()))?;
        let decoding_key = DecodingKey::from_rsa_pem(public_pem.as_bytes())
            .map_err(|e| BridgeError::Crypto(e.to_string()))?;
        self.keys.write().unwrap().insert(
            kid.to_string(),
            LoadedKey { public_pem: public_pem.to_string(), encoding_key, decoding_key },
        );
        self.private_pems.write().unwrap().insert(kid.to_string(), private_pem.to_string());
        Ok(())
    }

    /// Generate a fresh 2048-bit keypair, add it under a new kid, make it
    /// current, and persist the ring — the redesigned replacement for the
    /// original's single-slot key generation.
    pub fn rotate(&self, backend: &Backend) -> Result<String, BridgeError> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, RSA_BITS)
            .map_err(|e| BridgeError::Crypto(e.to_string()))?;
        let public_key = RsaPublicKey::from(&private_key);

        let private_pem = private_key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| BridgeError::Crypto(e.to_string()))?
            .to_string();
        let public_pem = public_key
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .map_err(|e| BridgeError::Crypto(e.to_string()))?;

        let kid = random_hex(8);
        self.insert_key(&kid, &public_pem, &private_pem)?;
        *self.current_kid.write().unwrap() = kid.clone();
        self.persist(backend)?;
        backend.audit("key_rotated", "keyring", &kid, serde_json::json!({}));
        Ok(kid)
    }

    fn persist(&self, backend: &Backend) -> Result<(), BridgeError> {
        let current_kid = self.current_kid.read().unwrap().clone();
        let keys = self.keys.read().unwrap();
        let mut stored = Vec::with_capacity(keys.len());
        for (kid, loaded) in keys.iter() {
            let private_pem = self.private_pem_for_persist(kid)?;
            let encrypted = backend_cipher_encrypt(backend, private_pem.as_bytes())?;
            stored.push(StoredKey {
                kid: kid.clone(),
                public_pem: loaded.public_pem.clone(),
                private_pem_encrypted: encrypted,
            });
        }
        let doc = RingDocument { current_kid, keys: stored };
        let blob = backend_cipher_encrypt(backend, &serde_json::to_vec(&doc)?)?;
        backend.save_ring_document(&blob)
    }

    // `jsonwebtoken::EncodingKey` doesn't expose the PEM it was built from,
    // so the ring keeps a side table of private PEMs alongside the loaded
    // signing/verifying keys, populated at `insert_key` time.
    fn private_pem_for_persist(&self, kid: &str) -> Result<String, BridgeError> {
        self.private_pems
            .read()
            .unwrap()
            .get(kid)
            .cloned()
            .ok_or_else(|| BridgeError::Crypto(format!("no private pem cached for kid {kid}")))
    }

    pub fn current_kid(&self) -> String {
        self.current_kid.read().unwrap().clone()
    }

    pub fn public_pem(&self, kid: &str) -> Option<String> {
        self.keys.read().unwrap().get(kid).map(|k| k.public_pem.clone())
    }

    pub fn current_public_pem(&self) -> Option<String> {
        self.public_pem(&self.current_kid())
    }

    /// Export every ring kid in the JWKS shape documented in `spec.md`
    /// §4.D: `{keys:[{kid, kty:"RSA", use:"sig", alg:"RS256", pem}, ...]}`.
    pub fn jwks(&self) -> serde_json::Value {
        let keys = self.keys.read().unwrap();
        let mut entries: Vec<serde_json::Value> = keys
            .iter()
            .map(|(kid, loaded)| {
                serde_json::json!({
                    "kid": kid,
                    "kty": "RSA",
                    "use": "sig",
                    "alg": "RS256",
                    "pem": loaded.public_pem,
                })
            })
            .collect();
        entries.sort_by(|a, b| a["kid"].as_str().cmp(&b["kid"].as_str()));
        serde_json::json!({ "keys": entries })
    }

    pub fn mint(&self, claims: &serde_json::Value, expiration_minutes: u64) -> Result<String, BridgeError> {
        let kid = self.current_kid();
        let keys = self.keys.read().unwrap();
        let key = keys
            .get(&kid)
            .ok_or_else(|| BridgeError::KeysUnavailable("no current signing key".into()))?;

        let mut payload = claims.clone();
        let exp = crate::time::now_secs() + expiration_minutes * 60;
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("exp".to_string(), serde_json::json!(exp));
        }

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(kid);
        jsonwebtoken::encode(&header, &payload, &key.encoding_key)
            .map_err(|e| BridgeError::Crypto(e.to_string()))
    }

    /// Verify a token, trying the kid embedded in its header first and
    /// falling back to every known key (covers tokens minted before a
    /// rotation whose header kid this process hasn't seen yet).
    pub fn verify(&self, token: &str) -> Result<serde_json::Value, BridgeError> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = true;

        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| BridgeError::InvalidToken(e.to_string()))?;
        let keys = self.keys.read().unwrap();

        if let Some(kid) = &header.kid {
            return match keys.get(kid) {
                Some(key) => jsonwebtoken::decode::<serde_json::Value>(token, &key.decoding_key, &validation)
                    .map(|data| data.claims)
                    .map_err(classify_jwt_error),
                None => Err(BridgeError::UnknownKid(kid.clone())),
            };
        }
        for key in keys.values() {
            if let Ok(data) = jsonwebtoken::decode::<serde_json::Value>(token, &key.decoding_key, &validation) {
                return Ok(data.claims);
            }
        }
        Err(BridgeError::InvalidToken("no known key verifies this token".into()))
    }
}

/// Classify a `jsonwebtoken` decode failure into the crate's taxonomy:
/// expired signatures get their own code, everything else is a generic
/// invalid token.
fn classify_jwt_error(e: jsonwebtoken::errors::Error) -> BridgeError {
    use jsonwebtoken::errors::ErrorKind;
    match e.kind() {
        ErrorKind::ExpiredSignature => BridgeError::TokenExpired,
        _ => BridgeError::InvalidToken(e.to_string()),
    }
}

fn backend_cipher_encrypt(backend: &Backend, bytes: &[u8]) -> Result<Vec<u8>, BridgeError> {
    backend.cipher_encrypt(bytes)
}

fn backend_cipher_decrypt(backend: &Backend, bytes: &[u8]) -> Result<Vec<u8>, BridgeError> {
    backend.cipher_decrypt(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::tempdir;

    fn backend() -> (Backend, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("keys_test.sqlite3");
        let cfg = Config::for_tests(db_path.to_str().unwrap());
        (Backend::new(&cfg), dir)
    }

    #[test]
    fn bootstrap_produces_a_usable_signing_key() {
        let (backend, _dir) = backend();
        let ring = KeyRing::load_or_bootstrap(&backend).unwrap();
        assert!(!ring.current_kid().is_empty());
        assert!(ring.current_public_pem().is_some());
    }

    #[test]
    fn mint_and_verify_round_trip() {
        let (backend, _dir) = backend();
        let ring = KeyRing::load_or_bootstrap(&backend).unwrap();
        let claims = serde_json::json!({"iss": "svc_a", "aud": "svc_b", "sub": "wrk_1"});
        let token = ring.mint(&claims, 60).unwrap();
        let decoded = ring.verify(&token).unwrap();
        assert_eq!(decoded["iss"], "svc_a");
    }

    #[test]
    fn rotation_keeps_old_kid_verifiable() {
        let (backend, _dir) = backend();
        let ring = KeyRing::load_or_bootstrap(&backend).unwrap();
        let claims = serde_json::json!({"iss": "svc_a", "aud": "svc_b", "sub": "wrk_1"});
        let old_token = ring.mint(&claims, 60).unwrap();

        ring.rotate(&backend).unwrap();
        let new_token = ring.mint(&claims, 60).unwrap();

        assert!(ring.verify(&old_token).is_ok());
        assert!(ring.verify(&new_token).is_ok());
    }

    #[test]
    fn jwks_lists_every_ring_key_in_the_documented_shape() {
        let (backend, _dir) = backend();
        let ring = KeyRing::load_or_bootstrap(&backend).unwrap();
        ring.rotate(&backend).unwrap();

        let jwks = ring.jwks();
        let keys = jwks["keys"].as_array().unwrap();
        assert_eq!(keys.len(), 2);
        for entry in keys {
            assert_eq!(entry["kty"], "RSA");
            assert_eq!(entry["use"], "sig");
            assert_eq!(entry["alg"], "RS256");
            assert!(entry["kid"].is_string());
            assert!(entry["pem"].as_str().unwrap().contains("PUBLIC KEY"));
        }
    }

    #[test]
    fn verify_rejects_unknown_kid() {
        let (backend, _dir) = backend();
        let ring = KeyRing::load_or_bootstrap(&backend).unwrap();
        let claims = serde_json::json!({"iss": "svc_a", "aud": "svc_b", "sub": "wrk_1"});
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some("bogus-kid".to_string());
        let keys = ring.keys.read().unwrap();
        let key = keys.values().next().unwrap();
        let token = jsonwebtoken::encode(&header, &claims, &key.encoding_key).unwrap();
        drop(keys);
        let err = ring.verify(&token).unwrap_err();
        assert!(matches!(err, BridgeError::UnknownKid(_)));
    }

    #[test]
    fn ring_survives_reload_from_backend() {
        let (backend, _dir) = backend();
        let ring = KeyRing::load_or_bootstrap(&backend).unwrap();
        let kid = ring.current_kid();

        let reloaded = KeyRing::load_or_bootstrap(&backend).unwrap();
        assert_eq!(reloaded.current_kid(), kid);
        assert!(reloaded.public_pem(&kid).is_some());
    }
}
