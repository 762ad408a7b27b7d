//! Environment-driven configuration, mirroring `app/settings.py::Settings`.
//!
//! No `.env` parsing (out of scope for this crate); callers that want dotenv
//! behavior load the process environment themselves before constructing a
//! [`Config`].

use std::env;

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_u64_or(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_list(name: &str) -> Vec<String> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => {
            if let Ok(serde_json::Value::Array(items)) = serde_json::from_str(&raw) {
                return items
                    .into_iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect();
            }
            raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
        }
        _ => Vec::new(),
    }
}

/// Default service-type registry, matching
/// `app/core/types_loader.py::load_service_types`'s fallback list exactly.
pub const DEFAULT_SERVICE_TYPES: &[&str] =
    &["unknown", "reflection", "supertable", "mirage", "ai", "bi", "email_api"];

#[derive(Debug, Clone)]
pub struct Config {
    pub build_version: String,
    pub environment: String,
    pub admin_api_keys: Vec<String>,
    pub crypt_key: String,
    pub access_token_expiration_min: u64,
    pub namespace: String,
    pub rl_token_issue_limit_per_min: u64,
    pub rl_discovery_limit_per_min: u64,
    pub rl_admin_limit_per_min: u64,
    pub audit_stream_cap: usize,
    pub service_types: Vec<String>,
    pub db_path: String,
}

impl Config {
    /// Load from the process environment, falling back to the same
    /// defaults as the original `Settings` class.
    pub fn from_env() -> Self {
        let namespace = env_or("AUTHBRIDGE_REDIS_NAMESPACE", "authbridge");
        let mut service_types = env_list("AUTHBRIDGE_APP_TYPES");
        if service_types.is_empty() {
            service_types = DEFAULT_SERVICE_TYPES.iter().map(|s| s.to_string()).collect();
        }
        Config {
            build_version: env_or("AUTHBRIDGE_BUILD_VERSION", "1.0.0"),
            environment: env_or("AUTHBRIDGE_ENVIRONMENT", "dev"),
            admin_api_keys: env_list("AUTHBRIDGE_API_KEYS"),
            crypt_key: env_or("AUTHBRIDGE_CRYPT_KEY", "change-me-please-change-me-32bytes-min"),
            access_token_expiration_min: env_u64_or("ACCESS_TOKEN_EXPIRATION_MIN", 60),
            namespace,
            rl_token_issue_limit_per_min: env_u64_or("RL_TOKEN_ISSUE_LIMIT_PER_MIN", 120),
            rl_discovery_limit_per_min: env_u64_or("RL_DISCOVERY_LIMIT_PER_MIN", 240),
            rl_admin_limit_per_min: env_u64_or("RL_ADMIN_LIMIT_PER_MIN", 120),
            audit_stream_cap: env_u64_or("AUTHBRIDGE_AUDIT_STREAM_CAP", 10_000) as usize,
            service_types,
            db_path: env_or("AUTHBRIDGE_DB_PATH", "authbridge.sqlite3"),
        }
    }

    /// Construct an in-process config for tests/demos, bypassing the
    /// environment entirely.
    pub fn for_tests(db_path: &str) -> Self {
        Config {
            build_version: "test".into(),
            environment: "test".into(),
            admin_api_keys: vec!["test-admin-key".into()],
            crypt_key: "test-crypt-key-not-for-production-use".into(),
            access_token_expiration_min: 60,
            namespace: "authbridge_test".into(),
            rl_token_issue_limit_per_min: 120,
            rl_discovery_limit_per_min: 240,
            rl_admin_limit_per_min: 120,
            audit_stream_cap: 1000,
            service_types: DEFAULT_SERVICE_TYPES.iter().map(|s| s.to_string()).collect(),
            db_path: db_path.to_string(),
        }
    }

    pub fn key(&self, parts: &[&str]) -> String {
        let mut s = self.namespace.clone();
        for p in parts {
            s.push(':');
            s.push_str(p);
        }
        s
    }
}
