//! Data model: `Service`, `Workspace`, `ServiceLink` and the shapes used at
//! the discovery/token boundaries. Mirrors `app/models.py`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Json = serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntityType {
    Workspace,
    Service,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Workspace => "workspace",
            EntityType::Service => "service",
        }
    }
}

/// A directed trust link from an issuing service/workspace to an audience
/// service, scoped to the workspace it was declared in. Equality and
/// hashing are by `(issuer_id, audience_id)` only, matching
/// `ServiceLink.__eq__`/`__hash__` in the original model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceLink {
    pub issuer_id: String,
    pub audience_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<BTreeMap<String, Json>>,
}

impl PartialEq for ServiceLink {
    fn eq(&self, other: &Self) -> bool {
        self.issuer_id == other.issuer_id && self.audience_id == other.audience_id
    }
}
impl Eq for ServiceLink {}

impl std::hash::Hash for ServiceLink {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.issuer_id.hash(state);
        self.audience_id.hash(state);
    }
}

/// Base fields shared by every entity kind, matching `AuthBridgeEntity`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityBase {
    pub name: String,
    pub id: String,
    pub api_key: String,
    pub registered_at: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<BTreeMap<String, Json>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<BTreeMap<String, Json>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    #[serde(flatten)]
    pub base: EntityBase,
    #[serde(default)]
    pub services: Vec<ServiceLink>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    #[serde(flatten)]
    pub base: EntityBase,
    #[serde(rename = "type")]
    pub service_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceLimited {
    pub name: String,
    pub id: String,
    pub version: String,
    pub info: Option<BTreeMap<String, Json>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceLimited {
    pub name: String,
    pub id: String,
    #[serde(rename = "type")]
    pub service_type: String,
    pub version: String,
    pub info: Option<BTreeMap<String, Json>>,
}

/// A workspace through which a service is reachable, paired with the
/// context declared on that specific link, per `spec.md` §4.H/§6 ("grouped
/// by audience with workspaces + contexts").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceWithContext {
    #[serde(flatten)]
    pub workspace: WorkspaceLimited,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<BTreeMap<String, Json>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredService {
    pub service: ServiceLimited,
    pub workspaces: Vec<WorkspaceWithContext>,
}

/// Inbound ("callers") view: a workspace, and which services declared as
/// audience within it are reachable from `issuer_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredCallers {
    pub workspace: WorkspaceLimited,
    pub callers: Vec<ServiceLimited>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub detail: String,
    pub system_version: String,
    pub service: Service,
    pub links: Vec<DiscoveredService>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPayload {
    pub sub: String,
    pub aud: String,
    #[serde(default)]
    pub claims: BTreeMap<String, Json>,
}

impl EntityBase {
    pub fn new(name: impl Into<String>) -> Self {
        EntityBase {
            name: name.into(),
            id: crate::time::new_id("ent"),
            api_key: crate::crypto::random_hex(32),
            registered_at: crate::time::now_epoch_z(),
            version: crate::time::new_version(),
            content: None,
            info: None,
        }
    }
}

impl Service {
    pub fn new(name: impl Into<String>, service_type: impl Into<String>) -> Self {
        Service { base: EntityBase::new(name), service_type: service_type.into() }
    }

    pub fn limited(&self) -> ServiceLimited {
        ServiceLimited {
            name: self.base.name.clone(),
            id: self.base.id.clone(),
            service_type: self.service_type.clone(),
            version: self.base.version.clone(),
            info: self.base.info.clone(),
        }
    }
}

impl Workspace {
    pub fn new(name: impl Into<String>) -> Self {
        Workspace { base: EntityBase::new(name), services: Vec::new() }
    }

    pub fn limited(&self) -> WorkspaceLimited {
        WorkspaceLimited {
            name: self.base.name.clone(),
            id: self.base.id.clone(),
            version: self.base.version.clone(),
            info: self.base.info.clone(),
        }
    }
}
