//! Link-gated Token Service (Component E): validates a trust link exists
//! between the calling service and the target audience inside a workspace,
//! composes the JWT claims, and mints the token. Grounded on
//! `app/routers/token.py::issue_token_v2`, which is the normative
//! `/token/{service_id}/issue` endpoint per the design notes.

use std::collections::BTreeMap;

use crate::backend::Backend;
use crate::cache::Caches;
use crate::config::Config;
use crate::error::BridgeError;
use crate::keys::KeyRing;
use crate::model::Json;
use crate::store::Store;

/// The subset of `TokenPayload` a caller supplies beyond the path-derived
/// `iss`.
pub struct IssueRequest {
    pub issuer_service_id: String,
    pub audience_service_id: String,
    pub workspace_id: String,
    pub caller_claims: BTreeMap<String, Json>,
}

const RESERVED_CLAIM_KEYS: &[&str] = &["iss", "aud", "sub", "exp", "claims"];

pub struct TokenService<'a> {
    backend: &'a Backend,
    caches: &'a Caches,
    config: &'a Config,
    keys: &'a KeyRing,
    access_token_expiration_min: u64,
}

/// Read a positive-integer `token_ttl_min` override out of a service's
/// `info` map, per `spec.md` §4.E step 5. Anything else (missing, zero,
/// negative, non-integer) falls through to the global default.
fn ttl_override(info: &Option<BTreeMap<String, Json>>) -> Option<u64> {
    let value = info.as_ref()?.get("token_ttl_min")?;
    let n = value.as_i64()?;
    if n > 0 {
        Some(n as u64)
    } else {
        None
    }
}

impl<'a> TokenService<'a> {
    pub fn new(
        backend: &'a Backend,
        caches: &'a Caches,
        config: &'a Config,
        keys: &'a KeyRing,
        access_token_expiration_min: u64,
    ) -> Self {
        TokenService { backend, caches, config, keys, access_token_expiration_min }
    }

    /// Compose the three-layer claims merge: reserved fields win over
    /// everything, then the link's stored context, then caller-supplied
    /// extras nested under `claims` — caller extras never override
    /// reserved or link-context fields.
    fn compose_claims(
        &self,
        req: &IssueRequest,
        link_context: &Option<BTreeMap<String, Json>>,
    ) -> serde_json::Value {
        let mut merged = serde_json::Map::new();

        if let Some(context) = link_context {
            for (k, v) in context {
                merged.insert(k.clone(), v.clone());
            }
        }

        let filtered_claims: BTreeMap<String, Json> = req
            .caller_claims
            .iter()
            .filter(|(k, _)| !RESERVED_CLAIM_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !filtered_claims.is_empty() {
            merged.insert("claims".to_string(), serde_json::to_value(filtered_claims).unwrap());
        }

        merged.insert("iss".to_string(), Json::from(req.issuer_service_id.clone()));
        merged.insert("aud".to_string(), Json::from(req.audience_service_id.clone()));
        merged.insert("sub".to_string(), Json::from(req.workspace_id.clone()));

        Json::Object(merged)
    }

    /// Issue a token, gated by the link's existence, per
    /// `spec.md` §4.E.
    pub fn issue(&self, req: IssueRequest) -> Result<String, BridgeError> {
        let store = Store::new(self.backend, self.caches, self.config);

        if req.issuer_service_id == req.audience_service_id {
            return Err(BridgeError::BadLink(
                "issuer and audience must be different services".into(),
            ));
        }

        let issuer = store.get_service(&req.issuer_service_id)?;
        store.get_service(&req.audience_service_id)?;
        let workspace = store.get_workspace(&req.workspace_id)?;

        let link = workspace
            .services
            .iter()
            .find(|l| l.issuer_id == req.issuer_service_id && l.audience_id == req.audience_service_id)
            .ok_or_else(|| {
                BridgeError::Unlinked(format!(
                    "iss:{} and aud:{} are not linked in workspace {}",
                    req.issuer_service_id, req.audience_service_id, req.workspace_id
                ))
            })?;

        let ttl = ttl_override(&issuer.base.info).unwrap_or(self.access_token_expiration_min);
        let claims = self.compose_claims(&req, &link.context);
        let token = self.keys.mint(&claims, ttl)?;
        self.backend.audit(
            "token_issued",
            "service",
            &req.issuer_service_id,
            serde_json::json!({"aud": req.audience_service_id, "sub": req.workspace_id}),
        );
        Ok(token)
    }

    /// Verify a previously minted token and return its claims, per
    /// `app/routers/token.py::verify_token`.
    pub fn verify(&self, token: &str) -> Result<serde_json::Value, BridgeError> {
        self.keys.verify(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::{Service, ServiceLink, Workspace};
    use tempfile::tempdir;

    fn harness() -> (Backend, Caches, Config, KeyRing, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("tok_test.sqlite3");
        let cfg = Config::for_tests(db_path.to_str().unwrap());
        let backend = Backend::new(&cfg);
        let caches = Caches::new();
        let keys = KeyRing::load_or_bootstrap(&backend).unwrap();
        (backend, caches, cfg, keys, dir)
    }

    #[test]
    fn issue_rejects_missing_link() {
        let (backend, caches, cfg, keys, _dir) = harness();
        let store = Store::new(&backend, &caches, &cfg);
        let issuer = store.create_service(Service::new("issuer", "ai")).unwrap();
        let audience = store.create_service(Service::new("audience", "bi")).unwrap();
        let workspace = store.create_workspace(Workspace::new("team")).unwrap();

        let svc = TokenService::new(&backend, &caches, &cfg, &keys, 60);
        let req = IssueRequest {
            issuer_service_id: issuer.base.id,
            audience_service_id: audience.base.id,
            workspace_id: workspace.base.id,
            caller_claims: BTreeMap::new(),
        };
        let err = svc.issue(req).unwrap_err();
        assert!(matches!(err, BridgeError::Unlinked(_)));
    }

    #[test]
    fn issue_succeeds_for_linked_services_and_merges_context() {
        let (backend, caches, cfg, keys, _dir) = harness();
        let store = Store::new(&backend, &caches, &cfg);
        let issuer = store.create_service(Service::new("issuer", "ai")).unwrap();
        let audience = store.create_service(Service::new("audience", "bi")).unwrap();
        let workspace = store.create_workspace(Workspace::new("team")).unwrap();

        let mut context = BTreeMap::new();
        context.insert("tier".to_string(), Json::from("gold"));
        let link = ServiceLink {
            issuer_id: issuer.base.id.clone(),
            audience_id: audience.base.id.clone(),
            context: Some(context),
        };
        let workspace = store.link_service(workspace, link, None).unwrap();

        let svc = TokenService::new(&backend, &caches, &cfg, &keys, 60);
        let mut caller_claims = BTreeMap::new();
        caller_claims.insert("note".to_string(), Json::from("hi"));
        caller_claims.insert("iss".to_string(), Json::from("attacker"));
        let req = IssueRequest {
            issuer_service_id: issuer.base.id.clone(),
            audience_service_id: audience.base.id.clone(),
            workspace_id: workspace.base.id.clone(),
            caller_claims,
        };
        let token = svc.issue(req).unwrap();
        let claims = svc.verify(&token).unwrap();
        assert_eq!(claims["iss"], issuer.base.id);
        assert_eq!(claims["tier"], "gold");
        assert_eq!(claims["claims"]["note"], "hi");
    }

    #[test]
    fn issue_rejects_self_link() {
        let (backend, caches, cfg, keys, _dir) = harness();
        let store = Store::new(&backend, &caches, &cfg);
        let svc_entity = store.create_service(Service::new("solo", "ai")).unwrap();
        let workspace = store.create_workspace(Workspace::new("team")).unwrap();

        let svc = TokenService::new(&backend, &caches, &cfg, &keys, 60);
        let req = IssueRequest {
            issuer_service_id: svc_entity.base.id.clone(),
            audience_service_id: svc_entity.base.id,
            workspace_id: workspace.base.id,
            caller_claims: BTreeMap::new(),
        };
        let err = svc.issue(req).unwrap_err();
        assert!(matches!(err, BridgeError::BadLink(_)));
    }

    #[test]
    fn issue_uses_issuer_ttl_override() {
        let (backend, caches, cfg, keys, _dir) = harness();
        let store = Store::new(&backend, &caches, &cfg);
        let mut issuer = store.create_service(Service::new("issuer", "ai")).unwrap();
        let audience = store.create_service(Service::new("audience", "bi")).unwrap();
        let workspace = store.create_workspace(Workspace::new("team")).unwrap();

        let mut info = serde_json::Map::new();
        info.insert("token_ttl_min".to_string(), Json::from(5));
        issuer = store.update_service_info(issuer, info, None).unwrap();

        let link = ServiceLink { issuer_id: issuer.base.id.clone(), audience_id: audience.base.id.clone(), context: None };
        let workspace = store.link_service(workspace, link, None).unwrap();

        let svc = TokenService::new(&backend, &caches, &cfg, &keys, 60);
        let req = IssueRequest {
            issuer_service_id: issuer.base.id.clone(),
            audience_service_id: audience.base.id.clone(),
            workspace_id: workspace.base.id.clone(),
            caller_claims: BTreeMap::new(),
        };
        let before = crate::time::now_secs() as i64;
        let token = svc.issue(req).unwrap();
        let claims = svc.verify(&token).unwrap();
        let exp = claims["exp"].as_i64().unwrap();
        assert!(exp - before <= 5 * 60, "expected ~5 minute TTL, got {} seconds", exp - before);
        assert!(exp - before > 4 * 60, "expected ~5 minute TTL, got {} seconds", exp - before);
    }
}
