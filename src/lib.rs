//! Auth Bridge trust-broker core.
//!
//! A synchronous library implementing a central trust broker: an encrypted
//! versioned entity store for services and workspaces, a directed trust
//! graph scoped to a workspace, a short-lived RS256 JWT authority gated by
//! link existence, and the auth/rate-limit boundary callers sit behind.
//!
//! The HTTP layer, console UI, and CLI/SDK wrappers are out of scope as
//! features; this crate exposes the same operations as plain function
//! calls for an external layer (or the bundled `authbridge-admin` demo
//! binary) to drive.

pub mod auth;
pub mod backend;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod db;
pub mod discovery;
pub mod error;
pub mod keys;
pub mod listener;
pub mod model;
pub mod pool;
pub mod store;
pub mod time;
pub mod token_service;

use std::sync::Arc;

use crate::backend::Backend;
use crate::cache::Caches;
use crate::config::Config;
use crate::error::BridgeError;
use crate::keys::KeyRing;
use crate::listener::Listener;

/// Explicit handle bundling the cache, key ring, and config a caller needs
/// to drive every component in this crate, in place of ad hoc global
/// statics. The backend's own SQLite pool and audit lock remain
/// process-wide `OnceLock`s (see `pool::global_pool`) — the one exception
/// noted in the design notes, since per-call connection ownership doesn't
/// make sense for a shared database file.
pub struct BridgeContext {
    pub config: Config,
    pub backend: Backend,
    pub caches: Caches,
    pub keys: KeyRing,
}

impl BridgeContext {
    /// Build a context from environment configuration, bootstrapping (or
    /// loading) the RSA key ring.
    pub fn from_env() -> Result<Self, BridgeError> {
        Self::with_config(Config::from_env())
    }

    pub fn with_config(config: Config) -> Result<Self, BridgeError> {
        let backend = Backend::new(&config);
        let keys = KeyRing::load_or_bootstrap(&backend)?;
        Ok(BridgeContext { config, backend, caches: Caches::new(), keys })
    }

    pub fn store(&self) -> store::Store<'_> {
        store::Store::new(&self.backend, &self.caches, &self.config)
    }

    pub fn token_service(&self) -> token_service::TokenService<'_> {
        token_service::TokenService::new(
            &self.backend,
            &self.caches,
            &self.config,
            &self.keys,
            self.config.access_token_expiration_min,
        )
    }

    pub fn authenticator(&self) -> auth::Authenticator<'_> {
        auth::Authenticator::new(&self.config)
    }

    pub fn rate_limiter(&self) -> auth::RateLimiter<'_> {
        auth::RateLimiter::new(&self.backend)
    }

    pub fn outbound(&self, service_id: &str) -> Result<Vec<model::DiscoveredService>, BridgeError> {
        self.caches.reload_services_if_needed(&self.backend);
        self.caches.reload_workspaces_if_needed(&self.backend);
        discovery::outbound(&self.caches, service_id)
    }

    pub fn callers(&self, service_id: &str) -> Result<Vec<model::DiscoveredCallers>, BridgeError> {
        self.caches.reload_services_if_needed(&self.backend);
        self.caches.reload_workspaces_if_needed(&self.backend);
        discovery::callers(&self.caches, service_id)
    }

    /// `GET /token/jwks`, per `spec.md` §4.D/§6.
    pub fn jwks(&self) -> serde_json::Value {
        self.keys.jwks()
    }
}

/// Variant of [`BridgeContext`] whose backend and cache are `Arc`-shared so
/// a [`listener::Listener`] can run on its own thread alongside it. Drop or
/// call `shutdown` to stop the listener thread.
pub struct RunningBridge {
    pub config: Config,
    pub backend: Arc<Backend>,
    pub caches: Arc<Caches>,
    pub keys: KeyRing,
    listener: Option<Listener>,
}

impl RunningBridge {
    pub fn start(config: Config) -> Result<Self, BridgeError> {
        let backend = Arc::new(Backend::new(&config));
        let keys = KeyRing::load_or_bootstrap(&backend)?;
        let caches = Arc::new(Caches::new());
        let listener = Listener::spawn(backend.clone(), caches.clone());
        Ok(RunningBridge { config, backend, caches, keys, listener: Some(listener) })
    }

    pub fn shutdown(mut self) {
        if let Some(listener) = self.listener.take() {
            listener.shutdown();
        }
    }
}
