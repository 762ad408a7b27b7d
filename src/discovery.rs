//! Discovery Projector (Component H): pure functions over cache state that
//! compute the outbound ("who can I call") and inbound ("who can call me")
//! views. Grounded on `app/routers/service.py::service_discovery_v1` and
//! `get_service_callers`.

use std::collections::BTreeMap;

use crate::cache::Caches;
use crate::error::BridgeError;
use crate::model::{DiscoveredCallers, DiscoveredService, Json, WorkspaceWithContext};

/// Outbound view: every service reachable from `service_id` as issuer,
/// grouped by audience service, with the workspaces (and any link
/// contexts) through which each is reachable.
pub fn outbound(caches: &Caches, service_id: &str) -> Result<Vec<DiscoveredService>, BridgeError> {
    let service = caches
        .service(service_id)
        .ok_or_else(|| BridgeError::NotFound(format!("service {service_id} not found")))?;
    let _ = service;

    let mut workspaces_by_audience: BTreeMap<String, Vec<(String, Option<BTreeMap<String, Json>>)>> =
        BTreeMap::new();

    for workspace in caches.all_workspaces() {
        for link in &workspace.services {
            if link.issuer_id == service_id {
                workspaces_by_audience
                    .entry(link.audience_id.clone())
                    .or_default()
                    .push((workspace.base.id.clone(), link.context.clone()));
            }
        }
    }

    let mut out = Vec::new();
    for (audience_id, workspace_links) in workspaces_by_audience {
        let Some(audience) = caches.service(&audience_id) else { continue };
        let workspaces = workspace_links
            .into_iter()
            .filter_map(|(id, context)| {
                caches.workspace(&id).map(|w| WorkspaceWithContext { workspace: w.limited(), context })
            })
            .collect();
        out.push(DiscoveredService { service: audience.limited(), workspaces });
    }
    Ok(out)
}

/// Inbound view: for every workspace, which services are permitted to call
/// `service_id` as audience.
pub fn callers(caches: &Caches, service_id: &str) -> Result<Vec<DiscoveredCallers>, BridgeError> {
    caches
        .service(service_id)
        .ok_or_else(|| BridgeError::NotFound(format!("service {service_id} not found")))?;

    let mut out = Vec::new();
    for workspace in caches.all_workspaces() {
        let issuers: Vec<_> = workspace
            .services
            .iter()
            .filter(|link| link.audience_id == service_id)
            .filter_map(|link| caches.service(&link.issuer_id))
            .map(|s| s.limited())
            .collect();
        if !issuers.is_empty() {
            out.push(DiscoveredCallers { workspace: workspace.limited(), callers: issuers });
        }
    }
    Ok(out)
}
