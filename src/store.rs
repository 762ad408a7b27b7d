//! Entity Store (Component C): optimistic-concurrency CRUD over workspaces
//! and services, cascading referential-integrity cleanup on service
//! delete, and the link/unlink operations. Grounded on
//! `app/routers/service.py` and `app/routers/workspace.py`.

use crate::backend::Backend;
use crate::cache::Caches;
use crate::config::Config;
use crate::crypto::random_hex;
use crate::error::BridgeError;
use crate::model::{EntityType, Service, ServiceLink, Workspace};
use crate::time::new_id;

pub struct Store<'a> {
    backend: &'a Backend,
    caches: &'a Caches,
    config: &'a Config,
}

/// Optional precondition carried by a mutating call, matching the
/// `If-Match` header semantics in the external interface.
pub type IfMatch<'a> = Option<&'a str>;

impl<'a> Store<'a> {
    pub fn new(backend: &'a Backend, caches: &'a Caches, config: &'a Config) -> Self {
        Store { backend, caches, config }
    }

    fn check_if_match(current_version: &str, if_match: IfMatch) -> Result<(), BridgeError> {
        if let Some(expected) = if_match {
            if expected != current_version {
                return Err(BridgeError::PreconditionFailed(
                    "If-Match does not match current version".into(),
                ));
            }
        }
        Ok(())
    }

    /// Re-fetch-and-compare the version seen by the caller against the
    /// freshest copy in the backend, independent of the cache.
    fn check_not_concurrently_modified_service(
        &self,
        seen: &Service,
    ) -> Result<(), BridgeError> {
        if let Some(current) = self.backend.get_service(&seen.base.id)? {
            if current.base.version != seen.base.version {
                return Err(BridgeError::Conflict("service modified concurrently".into()));
            }
        }
        Ok(())
    }

    fn check_not_concurrently_modified_workspace(
        &self,
        seen: &Workspace,
    ) -> Result<(), BridgeError> {
        if let Some(current) = self.backend.get_workspace(&seen.base.id)? {
            if current.base.version != seen.base.version {
                return Err(BridgeError::Conflict("workspace modified concurrently".into()));
            }
        }
        Ok(())
    }

    // ---------------- lookups ----------------

    pub fn get_service(&self, id: &str) -> Result<Service, BridgeError> {
        self.caches.reload_services_if_needed(self.backend);
        self.caches
            .service(id)
            .ok_or_else(|| BridgeError::NotFound(format!("service {id} not found")))
    }

    pub fn get_workspace(&self, id: &str) -> Result<Workspace, BridgeError> {
        self.caches.reload_workspaces_if_needed(self.backend);
        self.caches
            .workspace(id)
            .ok_or_else(|| BridgeError::NotFound(format!("workspace {id} not found")))
    }

    pub fn service_exists(&self, id: &str) -> Result<bool, BridgeError> {
        Ok(self.backend.get_service(id)?.is_some())
    }

    pub fn workspace_exists(&self, id: &str) -> Result<bool, BridgeError> {
        Ok(self.backend.get_workspace(id)?.is_some())
    }

    pub fn list_services(&self) -> Result<Vec<Service>, BridgeError> {
        self.caches.reload_services_if_needed(self.backend);
        Ok(self.caches.all_services())
    }

    pub fn list_workspaces(&self) -> Result<Vec<Workspace>, BridgeError> {
        self.caches.reload_workspaces_if_needed(self.backend);
        Ok(self.caches.all_workspaces())
    }

    // ---------------- create ----------------

    pub fn create_service(
        &self,
        mut service: Service,
    ) -> Result<Service, BridgeError> {
        if !self.config.service_types.iter().any(|t| t == &service.service_type) {
            return Err(BridgeError::BadRequest(format!(
                "type {} is not in the configured service-type registry",
                service.service_type
            )));
        }
        if self.service_exists(&service.base.id)? {
            return Err(BridgeError::AlreadyExists(format!("service {} already exists", service.base.id)));
        }
        let new_ver = new_id("sys");
        self.backend.save_service(&mut service, &new_ver)?;
        self.backend.audit(
            "service_created",
            "service",
            &service.base.id,
            serde_json::json!({"name": service.base.name, "type": service.service_type}),
        );
        Ok(service)
    }

    pub fn create_workspace(&self, mut workspace: Workspace) -> Result<Workspace, BridgeError> {
        if self.workspace_exists(&workspace.base.id)? {
            return Err(BridgeError::AlreadyExists(format!("workspace {} already exists", workspace.base.id)));
        }
        let new_ver = new_id("sys");
        self.backend.save_workspace(&mut workspace, &new_ver)?;
        self.backend.audit(
            "workspace_created",
            "workspace",
            &workspace.base.id,
            serde_json::json!({"name": workspace.base.name}),
        );
        Ok(workspace)
    }

    // ---------------- delete ----------------

    /// Delete a service, cascading the removal of every link referencing it
    /// (as issuer or audience) across all workspaces.
    pub fn delete_service(&self, service: &Service) -> Result<usize, BridgeError> {
        self.check_not_concurrently_modified_service(service)?;

        self.caches.reload_workspaces_if_needed(self.backend);
        let mut removed_count = 0usize;
        for mut workspace in self.caches.all_workspaces() {
            let before = workspace.services.len();
            workspace
                .services
                .retain(|link| link.issuer_id != service.base.id && link.audience_id != service.base.id);
            let removed = before - workspace.services.len();
            if removed > 0 {
                let new_ver = new_id("sys");
                self.backend.save_workspace(&mut workspace, &new_ver)?;
                removed_count += removed;
            }
        }

        let new_ver = new_id("sys");
        self.backend.delete_entity(&service.base.id, EntityType::Service, &new_ver)?;
        self.backend.audit(
            "service_deleted",
            "service",
            &service.base.id,
            serde_json::json!({"links_removed": removed_count}),
        );
        Ok(removed_count)
    }

    pub fn delete_workspace(&self, workspace: &Workspace) -> Result<(), BridgeError> {
        self.check_not_concurrently_modified_workspace(workspace)?;
        let new_ver = new_id("sys");
        self.backend.delete_entity(&workspace.base.id, EntityType::Workspace, &new_ver)?;
        self.backend.audit("workspace_deleted", "workspace", &workspace.base.id, serde_json::json!({}));
        Ok(())
    }

    // ---------------- rekey ----------------

    pub fn rekey_service(&self, mut service: Service, if_match: IfMatch) -> Result<Service, BridgeError> {
        Self::check_if_match(&service.base.version, if_match)?;
        self.check_not_concurrently_modified_service(&service)?;
        service.base.api_key = random_hex(32);
        let new_ver = new_id("sys");
        self.backend.save_service(&mut service, &new_ver)?;
        self.backend.audit("service_rekey", "service", &service.base.id, serde_json::json!({}));
        Ok(service)
    }

    pub fn rekey_workspace(&self, mut workspace: Workspace, if_match: IfMatch) -> Result<Workspace, BridgeError> {
        Self::check_if_match(&workspace.base.version, if_match)?;
        self.check_not_concurrently_modified_workspace(&workspace)?;
        workspace.base.api_key = random_hex(32);
        let new_ver = new_id("sys");
        self.backend.save_workspace(&mut workspace, &new_ver)?;
        self.backend.audit("workspace_rekey", "workspace", &workspace.base.id, serde_json::json!({}));
        Ok(workspace)
    }

    // ---------------- content/info updates ----------------

    pub fn update_service_content(
        &self,
        mut service: Service,
        content: serde_json::Map<String, serde_json::Value>,
        if_match: IfMatch,
    ) -> Result<Service, BridgeError> {
        Self::check_if_match(&service.base.version, if_match)?;
        self.check_not_concurrently_modified_service(&service)?;
        service.base.content = Some(content.into_iter().collect());
        let new_ver = new_id("sys");
        self.backend.save_service(&mut service, &new_ver)?;
        self.backend.audit("service_content_updated", "service", &service.base.id, serde_json::json!({}));
        Ok(service)
    }

    pub fn update_service_info(
        &self,
        mut service: Service,
        info: serde_json::Map<String, serde_json::Value>,
        if_match: IfMatch,
    ) -> Result<Service, BridgeError> {
        Self::check_if_match(&service.base.version, if_match)?;
        self.check_not_concurrently_modified_service(&service)?;
        service.base.info = Some(info.into_iter().collect());
        let new_ver = new_id("sys");
        self.backend.save_service(&mut service, &new_ver)?;
        self.backend.audit("service_info_updated", "service", &service.base.id, serde_json::json!({}));
        Ok(service)
    }

    pub fn update_workspace_content(
        &self,
        mut workspace: Workspace,
        content: serde_json::Map<String, serde_json::Value>,
        if_match: IfMatch,
    ) -> Result<Workspace, BridgeError> {
        Self::check_if_match(&workspace.base.version, if_match)?;
        self.check_not_concurrently_modified_workspace(&workspace)?;
        workspace.base.content = Some(content.into_iter().collect());
        let new_ver = new_id("sys");
        self.backend.save_workspace(&mut workspace, &new_ver)?;
        self.backend.audit("workspace_content_updated", "workspace", &workspace.base.id, serde_json::json!({}));
        Ok(workspace)
    }

    pub fn update_workspace_info(
        &self,
        mut workspace: Workspace,
        info: serde_json::Map<String, serde_json::Value>,
        if_match: IfMatch,
    ) -> Result<Workspace, BridgeError> {
        Self::check_if_match(&workspace.base.version, if_match)?;
        self.check_not_concurrently_modified_workspace(&workspace)?;
        workspace.base.info = Some(info.into_iter().collect());
        let new_ver = new_id("sys");
        self.backend.save_workspace(&mut workspace, &new_ver)?;
        self.backend.audit("workspace_info_updated", "workspace", &workspace.base.id, serde_json::json!({}));
        Ok(workspace)
    }

    // ---------------- link / unlink ----------------

    pub fn link_service(
        &self,
        mut workspace: Workspace,
        link: ServiceLink,
        if_match: IfMatch,
    ) -> Result<Workspace, BridgeError> {
        self.assert_link_services_exist(&link)?;
        Self::check_if_match(&workspace.base.version, if_match)?;
        self.check_not_concurrently_modified_workspace(&workspace)?;

        if link.issuer_id == link.audience_id {
            return Err(BridgeError::BadLink("service cannot be linked to itself".into()));
        }
        if workspace.services.contains(&link) {
            return Err(BridgeError::AlreadyLinked("service already linked".into()));
        }
        workspace.services.push(link);
        let new_ver = new_id("sys");
        self.backend.save_workspace(&mut workspace, &new_ver)?;
        self.backend.audit("workspace_link_change", "workspace", &workspace.base.id, serde_json::json!({"action": "link-service"}));
        Ok(workspace)
    }

    pub fn unlink_service(
        &self,
        mut workspace: Workspace,
        link: ServiceLink,
        if_match: IfMatch,
    ) -> Result<Workspace, BridgeError> {
        Self::check_if_match(&workspace.base.version, if_match)?;
        self.check_not_concurrently_modified_workspace(&workspace)?;

        let position = workspace.services.iter().position(|l| l == &link);
        match position {
            Some(idx) => {
                workspace.services.remove(idx);
            }
            None => return Err(BridgeError::NotLinked("service is not linked".into())),
        }
        let new_ver = new_id("sys");
        self.backend.save_workspace(&mut workspace, &new_ver)?;
        self.backend.audit("workspace_link_change", "workspace", &workspace.base.id, serde_json::json!({"action": "unlink-service"}));
        Ok(workspace)
    }

    fn assert_link_services_exist(&self, link: &ServiceLink) -> Result<(), BridgeError> {
        self.caches.reload_services_if_needed(self.backend);
        if self.caches.service(&link.issuer_id).is_none() {
            return Err(BridgeError::NotFound(format!("service {} not found", link.issuer_id)));
        }
        if self.caches.service(&link.audience_id).is_none() {
            return Err(BridgeError::NotFound(format!("service {} not found", link.audience_id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::tempdir;

    fn harness() -> (Backend, Caches, Config, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("store_test.sqlite3");
        let cfg = Config::for_tests(db_path.to_str().unwrap());
        (Backend::new(&cfg), Caches::new(), cfg, dir)
    }

    #[test]
    fn create_rejects_duplicate_id() {
        let (backend, caches, cfg, _dir) = harness();
        let store = Store::new(&backend, &caches, &cfg);
        let svc = Service::new("billing", "reflection");
        let created = store.create_service(svc.clone()).unwrap();
        let dup = Service { base: crate::model::EntityBase { id: created.base.id.clone(), ..Service::new("x", "ai").base }, service_type: "ai".into() };
        assert!(store.create_service(dup).is_err());
    }

    #[test]
    fn create_rejects_unregistered_service_type() {
        let (backend, caches, cfg, _dir) = harness();
        let store = Store::new(&backend, &caches, &cfg);
        let svc = Service::new("oddball", "not-a-real-type");
        let err = store.create_service(svc).unwrap_err();
        assert!(matches!(err, BridgeError::BadRequest(_)));
    }

    #[test]
    fn cascading_delete_removes_links_from_all_workspaces() {
        let (backend, caches, cfg, _dir) = harness();
        let store = Store::new(&backend, &caches, &cfg);

        let issuer = store.create_service(Service::new("issuer", "ai")).unwrap();
        let audience = store.create_service(Service::new("audience", "bi")).unwrap();
        let workspace = store.create_workspace(Workspace::new("team-a")).unwrap();

        let link = ServiceLink { issuer_id: issuer.base.id.clone(), audience_id: audience.base.id.clone(), context: None };
        let workspace = store.link_service(workspace, link, None).unwrap();
        assert_eq!(workspace.services.len(), 1);

        let removed = store.delete_service(&audience).unwrap();
        assert_eq!(removed, 1);

        let after = store.get_workspace(&workspace.base.id).unwrap();
        assert!(after.services.is_empty());
    }

    #[test]
    fn link_rejects_self_reference() {
        let (backend, caches, cfg, _dir) = harness();
        let store = Store::new(&backend, &caches, &cfg);
        let svc = store.create_service(Service::new("solo", "ai")).unwrap();
        let workspace = store.create_workspace(Workspace::new("team-b")).unwrap();
        let link = ServiceLink { issuer_id: svc.base.id.clone(), audience_id: svc.base.id.clone(), context: None };
        let err = store.link_service(workspace, link, None).unwrap_err();
        assert!(matches!(err, BridgeError::BadLink(_)));
    }

    #[test]
    fn link_rejects_duplicate() {
        let (backend, caches, cfg, _dir) = harness();
        let store = Store::new(&backend, &caches, &cfg);
        let issuer = store.create_service(Service::new("issuer2", "ai")).unwrap();
        let audience = store.create_service(Service::new("audience2", "bi")).unwrap();
        let workspace = store.create_workspace(Workspace::new("team-c")).unwrap();
        let link = ServiceLink { issuer_id: issuer.base.id.clone(), audience_id: audience.base.id.clone(), context: None };
        let workspace = store.link_service(workspace, link.clone(), None).unwrap();
        let err = store.link_service(workspace, link, None).unwrap_err();
        assert!(matches!(err, BridgeError::AlreadyLinked(_)));
    }

    #[test]
    fn unlink_missing_link_is_not_linked() {
        let (backend, caches, cfg, _dir) = harness();
        let store = Store::new(&backend, &caches, &cfg);
        let issuer = store.create_service(Service::new("issuer3", "ai")).unwrap();
        let audience = store.create_service(Service::new("audience3", "bi")).unwrap();
        let workspace = store.create_workspace(Workspace::new("team-d")).unwrap();
        let link = ServiceLink { issuer_id: issuer.base.id, audience_id: audience.base.id, context: None };
        let err = store.unlink_service(workspace, link, None).unwrap_err();
        assert!(matches!(err, BridgeError::NotLinked(_)));
    }

    #[test]
    fn concurrent_modification_is_rejected() {
        let (backend, caches, cfg, _dir) = harness();
        let store = Store::new(&backend, &caches, &cfg);
        let svc = store.create_service(Service::new("stale", "ai")).unwrap();

        // Simulate another writer rekeying the service underneath us.
        let mut newer = svc.clone();
        backend.save_service(&mut newer, "sys_newer").unwrap();

        let err = store.rekey_service(svc, None).unwrap_err();
        assert!(matches!(err, BridgeError::Conflict(_)));
    }

    #[test]
    fn if_match_precondition_is_enforced() {
        let (backend, caches, cfg, _dir) = harness();
        let store = Store::new(&backend, &caches, &cfg);
        let svc = store.create_service(Service::new("precond", "ai")).unwrap();
        let err = store.rekey_service(svc, Some("not-the-real-version")).unwrap_err();
        assert!(matches!(err, BridgeError::PreconditionFailed(_)));
    }
}
