//! Backend Adapter (Component A): the shared key-value namespace this crate
//! backs with SQLite (see `src/db.rs`, `src/pool.rs`) instead of the
//! original's Redis. Encrypts entity payloads and RSA private key material
//! at rest, tracks per-entity-type system versions, emulates the
//! publish/subscribe contract in-process, and appends a capped audit
//! stream. Grounded on `app/core/redis.py::RedisManager`.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Mutex;

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::crypto::Cipher;
use crate::error::BridgeError;
use crate::model::{EntityType, Service, Workspace};
use crate::pool::{self, SqlitePool};
use crate::time::now_epoch_z;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub op: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub id: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuditEntry {
    action: String,
    subject_type: String,
    subject_id: String,
    payload: serde_json::Value,
}

/// The backend adapter: owns the SQLite path, the derived cipher, the
/// namespace prefix, and an in-process fan-out of [`ChangeEvent`]s.
pub struct Backend {
    db_path: PathBuf,
    pool: &'static SqlitePool,
    cipher: Cipher,
    namespace: String,
    audit_cap: usize,
    subscribers: Mutex<Vec<Sender<ChangeEvent>>>,
}

impl Backend {
    pub fn new(cfg: &Config) -> Self {
        Backend {
            db_path: PathBuf::from(&cfg.db_path),
            pool: pool::global_pool(),
            cipher: Cipher::from_secret(&cfg.crypt_key),
            namespace: cfg.namespace.clone(),
            audit_cap: cfg.audit_stream_cap,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn ns_key(&self, key: &str) -> String {
        let ns = self.namespace.trim_matches(':');
        if ns.is_empty() {
            return key.to_string();
        }
        let prefix = format!("{ns}:");
        if key.starts_with(&prefix) { key.to_string() } else { format!("{prefix}{key}") }
    }

    fn item_key(item_id: &str, prefix: &str) -> String {
        format!("{prefix}:{item_id}:data")
    }

    fn version_key(item_id: &str, prefix: &str) -> String {
        format!("{prefix}:{item_id}:version")
    }

    fn system_key(item_type: &str) -> String {
        format!("system:{item_type}:version")
    }

    fn rsa_key(item_id: &str) -> String {
        format!("rsa:{item_id}:data")
    }

    /// Liveness check, mirroring `RedisManager.is_available`.
    pub fn is_available(&self) -> bool {
        self.pool.with_read(&self.db_path, |conn| {
            conn.query_row("SELECT 1", [], |_| Ok(())).map_err(BridgeError::from)
        }).is_ok()
    }

    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, BridgeError> {
        let k = self.ns_key(key);
        self.pool.with_read(&self.db_path, |conn| {
            conn.query_row("SELECT value FROM kv WHERE key = ?1", params![k], |row| row.get(0))
                .optional()
                .map_err(BridgeError::from)
        })
    }

    fn set_raw(&self, key: &str, value: &[u8]) -> Result<(), BridgeError> {
        let k = self.ns_key(key);
        self.pool.with_write(&self.db_path, |conn| {
            conn.execute(
                "INSERT INTO kv(key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![k, value],
            )?;
            Ok(())
        })
    }

    fn delete_raw(&self, key: &str) -> Result<(), BridgeError> {
        let k = self.ns_key(key);
        self.pool.with_write(&self.db_path, |conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![k])?;
            Ok(())
        })
    }

    /// Increment the counter at `key`, setting a `ttl_secs` expiry when the
    /// first increment in a window creates the row. Backs the fixed-window
    /// rate limiter in `auth.rs`.
    pub fn incr_with_ttl(&self, key: &str, ttl_secs: u64) -> Result<u64, BridgeError> {
        let k = self.ns_key(key);
        let expires_at = crate::time::now_secs() + ttl_secs;
        self.pool.with_write(&self.db_path, |conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS rate_counters (key TEXT PRIMARY KEY, count INTEGER NOT NULL, expires_at INTEGER NOT NULL)",
                [],
            )?;
            let now = crate::time::now_secs() as i64;
            conn.execute(
                "DELETE FROM rate_counters WHERE key = ?1 AND expires_at < ?2",
                params![k, now],
            )?;
            conn.execute(
                "INSERT INTO rate_counters(key, count, expires_at) VALUES (?1, 1, ?2)
                 ON CONFLICT(key) DO UPDATE SET count = count + 1",
                params![k, expires_at as i64],
            )?;
            let count: i64 = conn.query_row(
                "SELECT count FROM rate_counters WHERE key = ?1",
                params![k],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    /// Read path: a backend failure degrades to "no version observed"
    /// rather than surfacing *BACKEND_ERROR*, per `spec.md` §7/§9 — callers
    /// treat an empty string as "reload anyway" and fall back to whatever
    /// is already cached.
    pub fn get_system_version(&self, item_type: &str) -> String {
        self.get_raw(&Self::system_key(item_type))
            .ok()
            .flatten()
            .map(|b| String::from_utf8_lossy(&b).to_string())
            .unwrap_or_default()
    }

    fn set_system_version(&self, item_type: &str, version: &str) -> Result<(), BridgeError> {
        self.set_raw(&Self::system_key(item_type), version.as_bytes())
    }

    /// Second colon-delimited segment of the de-namespaced key, matching
    /// `redis.py::search_ids`. Read path: a backend failure degrades to an
    /// empty result set rather than surfacing *BACKEND_ERROR*, per
    /// `spec.md` §7/§9.
    pub fn search_ids(&self, item_type: &str) -> Vec<String> {
        let pattern = self.ns_key(&format!("{item_type}:"));
        let ns = self.namespace.trim_matches(':');
        let strip = if ns.is_empty() { String::new() } else { format!("{ns}:") };
        let rows: Vec<String> = self
            .pool
            .with_read(&self.db_path, |conn| {
                let mut stmt = conn.prepare("SELECT key FROM kv WHERE key LIKE ?1")?;
                let like = format!("{pattern}%:data");
                let mut ids = Vec::new();
                let mut rows = stmt.query(params![like])?;
                while let Some(row) = rows.next()? {
                    let k: String = row.get(0)?;
                    ids.push(k);
                }
                Ok(ids)
            })
            .unwrap_or_default();
        let mut out = Vec::new();
        for k in rows {
            let stripped = if !strip.is_empty() && k.starts_with(&strip) { &k[strip.len()..] } else { &k[..] };
            let parts: Vec<&str> = stripped.split(':').collect();
            if parts.len() >= 3 {
                out.push(parts[1].to_string());
            }
        }
        out
    }

    pub fn get_workspace(&self, id: &str) -> Result<Option<Workspace>, BridgeError> {
        self.get_entity(id, EntityType::Workspace)
    }

    pub fn get_service(&self, id: &str) -> Result<Option<Service>, BridgeError> {
        self.get_entity(id, EntityType::Service)
    }

    /// Read path: a backend-unavailable failure degrades to *absent*
    /// rather than surfacing *BACKEND_ERROR*, per `spec.md` §4.A/§7. A
    /// successfully-read-but-corrupt payload still fails loudly via the
    /// cipher/deserialize `?`s — only the backend round-trip itself is
    /// tolerated.
    fn get_entity<T: serde::de::DeserializeOwned>(
        &self,
        id: &str,
        entity_type: EntityType,
    ) -> Result<Option<T>, BridgeError> {
        let key = Self::item_key(id, entity_type.as_str());
        let blob = match self.get_raw(&key).unwrap_or(None) {
            Some(b) => b,
            None => return Ok(None),
        };
        let value = self.cipher.decrypt_json(&blob)?;
        Ok(serde_json::from_value(value).ok())
    }

    /// Transactional-in-effect save: encrypt, write data+version+system
    /// version atomically via a single SQLite transaction, then publish and
    /// audit best-effort. `new_system_version` is assigned to
    /// `entity.version` before serialization, matching `save_item`.
    pub fn save_workspace(&self, workspace: &mut Workspace, new_system_version: &str) -> Result<String, BridgeError> {
        workspace.base.version = new_system_version.to_string();
        let value = serde_json::to_value(&*workspace)?;
        self.save_entity(&workspace.base.id, EntityType::Workspace, &value, new_system_version)?;
        Ok(workspace.base.version.clone())
    }

    pub fn save_service(&self, service: &mut Service, new_system_version: &str) -> Result<String, BridgeError> {
        service.base.version = new_system_version.to_string();
        let value = serde_json::to_value(&*service)?;
        self.save_entity(&service.base.id, EntityType::Service, &value, new_system_version)?;
        Ok(service.base.version.clone())
    }

    fn save_entity(
        &self,
        id: &str,
        entity_type: EntityType,
        value: &serde_json::Value,
        new_system_version: &str,
    ) -> Result<(), BridgeError> {
        let enc = self.cipher.encrypt_json(value)?;
        let key_data = self.ns_key(&Self::item_key(id, entity_type.as_str()));
        let key_ver = self.ns_key(&Self::version_key(id, entity_type.as_str()));
        let key_sys = self.ns_key(&Self::system_key(entity_type.as_str()));

        self.pool.with_write(&self.db_path, |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO kv(key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key_data, enc],
            )?;
            tx.execute(
                "INSERT INTO kv(key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key_ver, new_system_version.as_bytes()],
            )?;
            tx.execute(
                "INSERT INTO kv(key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key_sys, new_system_version.as_bytes()],
            )?;
            tx.commit()?;
            Ok(())
        })?;

        self.publish_event("updated", entity_type.as_str(), id, new_system_version);
        self.audit("save_item", entity_type.as_str(), id, serde_json::json!({"version": new_system_version}));
        Ok(())
    }

    pub fn delete_entity(&self, id: &str, entity_type: EntityType, new_system_version: &str) -> Result<(), BridgeError> {
        let key_data = self.ns_key(&Self::item_key(id, entity_type.as_str()));
        let key_ver = self.ns_key(&Self::version_key(id, entity_type.as_str()));
        let key_sys = self.ns_key(&Self::system_key(entity_type.as_str()));

        self.pool.with_write(&self.db_path, |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute("DELETE FROM kv WHERE key = ?1", params![key_data])?;
            tx.execute("DELETE FROM kv WHERE key = ?1", params![key_ver])?;
            tx.execute(
                "INSERT INTO kv(key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key_sys, new_system_version.as_bytes()],
            )?;
            tx.commit()?;
            Ok(())
        })?;

        self.publish_event("deleted", entity_type.as_str(), id, new_system_version);
        self.audit("delete_item", entity_type.as_str(), id, serde_json::json!({"version": new_system_version}));
        Ok(())
    }

    pub fn get_rsa(&self) -> Result<Option<(String, String)>, BridgeError> {
        let pub_raw = self.get_raw(&Self::rsa_key("public"))?;
        let prv_raw = self.get_raw(&Self::rsa_key("private"))?;
        let (pub_raw, prv_raw) = match (pub_raw, prv_raw) {
            (Some(p), Some(k)) => (p, k),
            _ => return Ok(None),
        };
        let prv_dec = self.cipher.decrypt(&prv_raw)?;
        Ok(Some((String::from_utf8_lossy(&pub_raw).to_string(), String::from_utf8_lossy(&prv_dec).to_string())))
    }

    pub fn save_rsa(&self, public_pem: &str, private_pem: &str) -> Result<(), BridgeError> {
        let enc_priv = self.cipher.encrypt(private_pem.as_bytes())?;
        self.set_raw(&Self::rsa_key("public"), public_pem.as_bytes())?;
        self.set_raw(&Self::rsa_key("private"), &enc_priv)?;
        Ok(())
    }

    /// Encrypt arbitrary bytes with the backend's derived cipher. Exposed
    /// so `keys.rs` can encrypt the key-ring document with the same
    /// at-rest cipher used for entity payloads.
    pub fn cipher_encrypt(&self, bytes: &[u8]) -> Result<Vec<u8>, BridgeError> {
        self.cipher.encrypt(bytes)
    }

    pub fn cipher_decrypt(&self, bytes: &[u8]) -> Result<Vec<u8>, BridgeError> {
        self.cipher.decrypt(bytes)
    }

    /// Fetch the canonical JSON key-ring document (see `keys.rs`), or
    /// `None` if it has never been written.
    pub fn get_ring_document(&self) -> Result<Option<Vec<u8>>, BridgeError> {
        self.get_raw("rsa:keys")
    }

    pub fn save_ring_document(&self, blob: &[u8]) -> Result<(), BridgeError> {
        self.set_raw("rsa:keys", blob)
    }

    /// Append a best-effort audit entry, capped at `audit_cap` rows.
    pub fn audit(&self, action: &str, subject_type: &str, subject_id: &str, payload: serde_json::Value) {
        let entry = AuditEntry {
            action: action.to_string(),
            subject_type: subject_type.to_string(),
            subject_id: subject_id.to_string(),
            payload,
        };
        let Ok(serialized) = serde_json::to_string(&entry) else { return };
        let cap = self.audit_cap as i64;
        let _ = self.pool.with_write(&self.db_path, |conn| {
            conn.execute(
                "INSERT INTO audit_stream(recorded_at, event) VALUES (?1, ?2)",
                params![now_epoch_z(), serialized],
            )?;
            conn.execute(
                "DELETE FROM audit_stream WHERE seq NOT IN (SELECT seq FROM audit_stream ORDER BY seq DESC LIMIT ?1)",
                params![cap],
            )?;
            Ok(())
        });
    }

    /// Read back the most recent audit entries, newest first — used by the
    /// demo CLI and tests; not part of the original external contract.
    pub fn recent_audit(&self, limit: usize) -> Result<Vec<String>, BridgeError> {
        self.pool.with_read(&self.db_path, |conn| {
            let mut stmt = conn.prepare(
                "SELECT event FROM audit_stream ORDER BY seq DESC LIMIT ?1",
            )?;
            let mut rows = stmt.query(params![limit as i64])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row.get(0)?);
            }
            Ok(out)
        })
    }

    /// In-process pub/sub emulation: register a receiver that is sent a
    /// [`ChangeEvent`] every time an entity is saved or deleted.
    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    fn publish_event(&self, op: &str, entity_type: &str, id: &str, version: &str) {
        let event = ChangeEvent {
            op: op.to_string(),
            entity_type: entity_type.to_string(),
            id: id.to_string(),
            version: version.to_string(),
        };
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_backend() -> (Backend, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.sqlite3");
        let mut cfg = Config::for_tests(db_path.to_str().unwrap());
        cfg.namespace = "authbridge_test".into();
        (Backend::new(&cfg), dir)
    }

    #[test]
    fn save_and_get_service_round_trips() {
        let (backend, _dir) = test_backend();
        let mut svc = Service::new("billing", "reflection");
        backend.save_service(&mut svc, "v1").unwrap();
        let fetched = backend.get_service(&svc.base.id).unwrap().unwrap();
        assert_eq!(fetched.base.name, "billing");
        assert_eq!(fetched.base.version, "v1");
    }

    #[test]
    fn delete_removes_entity_but_bumps_system_version() {
        let (backend, _dir) = test_backend();
        let mut svc = Service::new("billing", "reflection");
        backend.save_service(&mut svc, "v1").unwrap();
        backend.delete_entity(&svc.base.id, EntityType::Service, "v2").unwrap();
        assert!(backend.get_service(&svc.base.id).unwrap().is_none());
        assert_eq!(backend.get_system_version("service"), "v2");
    }

    #[test]
    fn search_ids_finds_saved_entities() {
        let (backend, _dir) = test_backend();
        let mut svc = Service::new("billing", "reflection");
        backend.save_service(&mut svc, "v1").unwrap();
        let ids = backend.search_ids("service");
        assert_eq!(ids, vec![svc.base.id.clone()]);
    }

    #[test]
    fn subscribers_receive_save_events() {
        let (backend, _dir) = test_backend();
        let rx = backend.subscribe();
        let mut svc = Service::new("billing", "reflection");
        backend.save_service(&mut svc, "v1").unwrap();
        let event = rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(event.op, "updated");
        assert_eq!(event.id, svc.base.id);
    }

    #[test]
    fn audit_trail_is_capped() {
        let (backend, _dir) = test_backend();
        for i in 0..5 {
            backend.audit("save_item", "service", &format!("svc_{i}"), serde_json::json!({}));
        }
        let entries = backend.recent_audit(3).unwrap();
        assert_eq!(entries.len(), 3);
    }
}
