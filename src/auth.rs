//! Auth & Rate Limiter (Component F): admin vs entity API-key
//! classification, and a fixed-window token-bucket rate limiter backed by
//! the same SQLite `kv` table as the rest of the backend. Grounded on
//! `app/core/security.py` and the `check_rate_limit` call sites in
//! `app/routers/service.py`/`app/routers/workspace.py`.

use crate::backend::Backend;
use crate::config::Config;
use crate::error::BridgeError;
use crate::time::now_secs;

pub struct Authenticator<'a> {
    cfg: &'a Config,
}

impl<'a> Authenticator<'a> {
    pub fn new(cfg: &'a Config) -> Self {
        Authenticator { cfg }
    }

    /// `validate_authbridge_api_key`: the caller must present one of the
    /// configured admin keys.
    pub fn require_admin_key(&self, api_key: &str) -> Result<(), BridgeError> {
        if api_key.is_empty() {
            return Err(BridgeError::NoApiKey);
        }
        if self.cfg.admin_api_keys.iter().any(|k| k == api_key) {
            Ok(())
        } else {
            Err(BridgeError::InvalidAdminKey)
        }
    }

    /// `validate_item_api_key`: an admin key always passes; otherwise the
    /// caller's key must equal the target entity's own `api_key`.
    pub fn require_entity_key(&self, api_key: &str, entity_api_key: &str) -> Result<(), BridgeError> {
        if api_key.is_empty() {
            return Err(BridgeError::NoApiKey);
        }
        if self.cfg.admin_api_keys.iter().any(|k| k == api_key) || api_key == entity_api_key {
            Ok(())
        } else {
            Err(BridgeError::InvalidEntityKey)
        }
    }

    /// Strict issuer-key binding for token issuance: only the issuing
    /// service's own key is accepted, admin keys included. `/token/issue`
    /// (body-supplied `iss`) allows an admin key to impersonate any
    /// issuer; the normative `/token/{service_id}/issue` endpoint this
    /// crate implements must not, per the design notes — an admin key
    /// presented here fails the same way any other wrong key would
    /// (`INVALID_ENTITY_KEY`, per `spec.md` §8 scenario 3).
    pub fn require_issuer_key(&self, api_key: &str, issuer_api_key: &str) -> Result<(), BridgeError> {
        if api_key.is_empty() {
            return Err(BridgeError::NoApiKey);
        }
        if api_key == issuer_api_key {
            Ok(())
        } else {
            Err(BridgeError::InvalidEntityKey)
        }
    }
}

/// Fixed-window token bucket: the counter key is
/// `{bucket}:{principal}:{floor(now/window)}`; the first `INCR` in a window
/// sets the TTL for that window. Fails open (returns `Ok`) when the
/// backend is unavailable, but the caller can distinguish that case via
/// [`CheckOutcome::FailedOpen`] to log it loudly, per `spec.md` §9.
pub struct RateLimiter<'a> {
    backend: &'a Backend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Allowed,
    FailedOpen,
}

impl<'a> RateLimiter<'a> {
    pub fn new(backend: &'a Backend) -> Self {
        RateLimiter { backend }
    }

    /// Check and increment the bucket for `principal`. `limit_per_window`
    /// is the allowed count within `window_secs`.
    pub fn check(
        &self,
        bucket: &str,
        principal: &str,
        limit_per_window: u64,
        window_secs: u64,
    ) -> Result<CheckOutcome, BridgeError> {
        if !self.backend.is_available() {
            return Ok(CheckOutcome::FailedOpen);
        }

        let window_index = now_secs() / window_secs.max(1);
        let key = format!("ratelimit:{bucket}:{principal}:{window_index}");

        let count = self.backend.incr_with_ttl(&key, window_secs)?;
        if count > limit_per_window {
            let retry_after_sec = window_secs - (now_secs() % window_secs.max(1));
            return Err(BridgeError::RateLimited { retry_after_sec });
        }
        Ok(CheckOutcome::Allowed)
    }

    /// Convenience wrapper for the admin bucket (120 req/min default).
    pub fn check_admin(&self, cfg: &Config, principal: &str) -> Result<CheckOutcome, BridgeError> {
        self.check("admin", principal, cfg.rl_admin_limit_per_min, 60)
    }

    pub fn check_discovery(&self, cfg: &Config, principal: &str) -> Result<CheckOutcome, BridgeError> {
        self.check("discovery", principal, cfg.rl_discovery_limit_per_min, 60)
    }

    pub fn check_token_issue(&self, cfg: &Config, principal: &str) -> Result<CheckOutcome, BridgeError> {
        self.check("token_issue", principal, cfg.rl_token_issue_limit_per_min, 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_backend() -> (Backend, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("auth_test.sqlite3");
        let cfg = Config::for_tests(db_path.to_str().unwrap());
        (Backend::new(&cfg), dir)
    }

    #[test]
    fn admin_key_check_accepts_configured_key() {
        let cfg = Config::for_tests(":memory:");
        let auth = Authenticator::new(&cfg);
        assert!(auth.require_admin_key("test-admin-key").is_ok());
        assert!(matches!(auth.require_admin_key("wrong").unwrap_err(), BridgeError::InvalidAdminKey));
        assert!(matches!(auth.require_admin_key("").unwrap_err(), BridgeError::NoApiKey));
    }

    #[test]
    fn entity_key_check_accepts_admin_or_own_key() {
        let cfg = Config::for_tests(":memory:");
        let auth = Authenticator::new(&cfg);
        assert!(auth.require_entity_key("test-admin-key", "svc-own-key").is_ok());
        assert!(auth.require_entity_key("svc-own-key", "svc-own-key").is_ok());
        assert!(matches!(
            auth.require_entity_key("someone-else", "svc-own-key").unwrap_err(),
            BridgeError::InvalidEntityKey
        ));
    }

    #[test]
    fn issuer_key_check_rejects_admin_override() {
        let cfg = Config::for_tests(":memory:");
        let auth = Authenticator::new(&cfg);
        assert!(matches!(
            auth.require_issuer_key("test-admin-key", "svc-own-key").unwrap_err(),
            BridgeError::InvalidEntityKey
        ));
        assert!(auth.require_issuer_key("svc-own-key", "svc-own-key").is_ok());
    }

    #[test]
    fn rate_limiter_allows_under_limit_and_blocks_over() {
        let (backend, _dir) = test_backend();
        let limiter = RateLimiter::new(&backend);
        for _ in 0..3 {
            assert_eq!(limiter.check("admin", "svc_1", 3, 60).unwrap(), CheckOutcome::Allowed);
        }
        let err = limiter.check("admin", "svc_1", 3, 60).unwrap_err();
        assert!(matches!(err, BridgeError::RateLimited { .. }));
    }

    #[test]
    fn rate_limiter_buckets_are_independent_per_principal() {
        let (backend, _dir) = test_backend();
        let limiter = RateLimiter::new(&backend);
        assert_eq!(limiter.check("admin", "svc_1", 1, 60).unwrap(), CheckOutcome::Allowed);
        assert_eq!(limiter.check("admin", "svc_2", 1, 60).unwrap(), CheckOutcome::Allowed);
    }
}
