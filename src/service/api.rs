// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read API of the cache service.
//!
//! Every method degrades to the document store when the KV store is
//! unavailable; only document store failures and invalid requests surface as
//! errors.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::cache::{GeneralCache, GeneralResource, InstanceCache};
use crate::error::CacheError;
use crate::keys::ListEntry;
use crate::refresh::RefreshOutcome;
use crate::topo::{NodePath, NodeRef, SearchOption, TreeNode};

use super::{CacheService, EntityKind};

impl CacheService {
    // ═══════════════════════════════════════════════════════════════════════════
    // Entities
    // ═══════════════════════════════════════════════════════════════════════════

    /// One entity by id, projected to `fields` (all fields when empty).
    ///
    /// Returns [`CacheError::NotFound`] when the document store does not have it.
    pub async fn get_entity(&self, kind: &EntityKind, id: i64, fields: &[String]) -> Result<Value, CacheError> {
        if id <= 0 {
            return Err(CacheError::InvalidInput(format!("invalid {} id {}", kind, id)));
        }
        match kind {
            EntityKind::General(resource) => self.general(*resource)?.get(id, fields).await,
            _ => self.hierarchy_cache(kind).await?.get(id, fields).await,
        }
    }

    /// Entities by id. Missing ids are absent from the result and the order
    /// is not guaranteed to follow `ids`.
    pub async fn list_entities(&self, kind: &EntityKind, ids: &[i64], fields: &[String]) -> Result<Vec<Value>, CacheError> {
        match kind {
            EntityKind::General(resource) => self.general(*resource)?.list_detail_by_ids(ids, fields).await,
            _ => self.hierarchy_cache(kind).await?.list(ids, fields).await,
        }
    }

    /// `(id, name, parent)` of every instance in a scope. The scope is the
    /// business id; it is ignored for businesses themselves.
    pub async fn get_entity_base_list(&self, kind: &EntityKind, scope_id: i64) -> Result<Vec<ListEntry>, CacheError> {
        match kind {
            EntityKind::Biz => self.biz.base_list(0).await,
            EntityKind::General(resource) => Err(CacheError::InvalidInput(format!(
                "{} has no base list",
                resource
            ))),
            _ => {
                if scope_id <= 0 {
                    return Err(CacheError::InvalidInput(format!("invalid business id {}", scope_id)));
                }
                self.hierarchy_cache(kind).await?.base_list(scope_id).await
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Topology
    // ═══════════════════════════════════════════════════════════════════════════

    /// Ranked mainline objects, `biz` first.
    pub async fn get_mainline_topology(&self) -> Result<Vec<String>, CacheError> {
        self.mainline.get_topology().await
    }

    /// Ancestors of each node, direct parent first and business last. Nodes
    /// that no longer exist are left out.
    pub async fn resolve_ancestor_path(&self, biz_id: i64, nodes: &[NodeRef]) -> Result<Vec<NodePath>, CacheError> {
        self.topo.resolve_ancestor_path(biz_id, nodes).await
    }

    /// Name search over custom levels, sets or modules of one business.
    ///
    /// Fails with [`CacheError::Overhead`] when more nodes match than the
    /// configured ceiling.
    pub async fn search_topology(&self, option: &SearchOption) -> Result<TreeNode, CacheError> {
        self.topo.search_topology(option).await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Hosts
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn get_host(&self, id: i64, fields: &[String]) -> Result<Value, CacheError> {
        self.get_entity(&EntityKind::General(GeneralResource::Host), id, fields).await
    }

    /// Host by one inner IP and its cloud area.
    pub async fn get_host_by_inner_ip(&self, inner_ip: &str, cloud_id: i64, fields: &[String]) -> Result<Value, CacheError> {
        let inner_ip = inner_ip.trim();
        if inner_ip.is_empty() || inner_ip.contains(',') {
            return Err(CacheError::InvalidInput(format!("invalid inner ip '{}'", inner_ip)));
        }
        if cloud_id < 0 {
            return Err(CacheError::InvalidInput(format!("invalid cloud id {}", cloud_id)));
        }
        self.general(GeneralResource::Host)?
            .get_by_unique_key(&format!("{}:{}", inner_ip, cloud_id), fields)
            .await
    }

    pub async fn list_hosts(&self, ids: &[i64], fields: &[String]) -> Result<Vec<Value>, CacheError> {
        self.list_entities(&EntityKind::General(GeneralResource::Host), ids, fields).await
    }

    /// One page of hosts in id order, with the total host count.
    pub async fn list_hosts_with_page(&self, start: u64, limit: u64, fields: &[String]) -> Result<(u64, Vec<Value>), CacheError> {
        self.general(GeneralResource::Host)?
            .list_with_page(start, limit, fields)
            .await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Forced refresh
    // ═══════════════════════════════════════════════════════════════════════════

    /// Rebuild the sorted id list of a general resource now.
    pub async fn refresh_general_id_list(&self, resource: GeneralResource) -> Result<RefreshOutcome, CacheError> {
        self.general(resource)?.refresh_id_list().await
    }

    /// Reload detail records of a general resource; returns how many were
    /// found in the document store.
    pub async fn refresh_general_detail_by_ids(&self, resource: GeneralResource, ids: &[i64]) -> Result<usize, CacheError> {
        self.general(resource)?.refresh_detail_by_ids(ids).await
    }

    fn general(&self, resource: GeneralResource) -> Result<&Arc<GeneralCache>, CacheError> {
        self.general_cache(resource)
            .ok_or_else(|| CacheError::Config(format!("no cache for {}", resource)))
    }

    /// Cache of a hierarchy entity. Custom levels must be on the mainline.
    async fn hierarchy_cache(&self, kind: &EntityKind) -> Result<Arc<InstanceCache>, CacheError> {
        if let EntityKind::Custom(object) = kind {
            let chain = self.mainline.get_topology().await?;
            if !chain.iter().any(|level| level == object) {
                debug!(object = %object, "Object is not a mainline level");
                return Err(CacheError::InvalidInput(format!("'{}' is not a mainline level", object)));
            }
        }
        self.instance_cache(kind)
            .ok_or_else(|| CacheError::InvalidInput(format!("{} is not a hierarchy entity", kind)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use crate::cache::GeneralResource;
    use crate::config::CacheServiceConfig;
    use crate::error::CacheError;
    use crate::refresh::RefreshOutcome;
    use crate::service::{CacheService, EntityKind};
    use crate::storage::memory::{InMemoryDocumentStore, InMemoryKv};
    use crate::topo::{NameFilter, NodeRef, SearchOption};

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn seeded() -> (CacheService, Arc<InMemoryDocumentStore>) {
        let docs = Arc::new(InMemoryDocumentStore::new());
        for (object, parent) in [("region", "biz"), ("set", "region"), ("module", "set"), ("host", "module")] {
            docs.insert("cc_ObjAsst", json!({"bk_obj_id": object, "bk_asst_obj_id": parent, "bk_asst_id": "bk_mainline"}));
        }
        docs.insert("cc_ApplicationBase", json!({"bk_biz_id": 5, "bk_biz_name": "shop"}));
        docs.insert("cc_ObjectBase", json!({"bk_obj_id": "region", "bk_inst_id": 30, "bk_inst_name": "east", "bk_parent_id": 5, "bk_biz_id": 5}));
        docs.insert("cc_SetBase", json!({"bk_set_id": 100, "bk_set_name": "set-a", "bk_parent_id": 30, "bk_biz_id": 5}));
        docs.insert("cc_ModuleBase", json!({"bk_module_id": 200, "bk_module_name": "m1", "bk_set_id": 100, "bk_biz_id": 5}));
        docs.insert("cc_HostBase", json!({"bk_host_id": 1, "bk_host_innerip": "10.0.0.1,10.0.0.2", "bk_cloud_id": 0}));
        docs.insert("cc_HostBase", json!({"bk_host_id": 2, "bk_host_innerip": "10.0.0.3", "bk_cloud_id": 0}));

        let service = CacheService::new(
            CacheServiceConfig::default(),
            Arc::new(InMemoryKv::new()),
            docs.clone(),
            docs.clone(),
        )
        .unwrap();
        (service, docs)
    }

    #[tokio::test]
    async fn test_get_entity_dispatches_by_kind() {
        let (service, _docs) = seeded();

        let set = service.get_entity(&EntityKind::Set, 100, &fields(&["bk_set_name"])).await.unwrap();
        assert_eq!(set, json!({"bk_set_name": "set-a"}));

        let region = service.get_entity(&EntityKind::Custom("region".into()), 30, &[]).await.unwrap();
        assert_eq!(region["bk_inst_name"], "east");

        let host = service.get_host(2, &fields(&["bk_host_innerip"])).await.unwrap();
        assert_eq!(host, json!({"bk_host_innerip": "10.0.0.3"}));

        let missing = service.get_entity(&EntityKind::Module, 999, &[]).await;
        assert!(matches!(missing, Err(CacheError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_unknown_custom_level_is_invalid() {
        let (service, _docs) = seeded();
        let result = service.get_entity(&EntityKind::Custom("zone".into()), 1, &[]).await;
        assert!(matches!(result, Err(CacheError::InvalidInput(_))));
        let result = service.get_entity(&EntityKind::Set, 0, &[]).await;
        assert!(matches!(result, Err(CacheError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_base_lists() {
        let (service, _docs) = seeded();

        let bizs = service.get_entity_base_list(&EntityKind::Biz, 0).await.unwrap();
        assert_eq!(bizs.len(), 1);
        assert_eq!(bizs[0].name, "shop");

        let regions = service.get_entity_base_list(&EntityKind::Custom("region".into()), 5).await.unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].parent_id, 5);

        let hosts = service.get_entity_base_list(&EntityKind::General(GeneralResource::Host), 5).await;
        assert!(matches!(hosts, Err(CacheError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_list_entities_drops_missing() {
        let (service, _docs) = seeded();
        let sets = service.list_entities(&EntityKind::Set, &[100, 101], &[]).await.unwrap();
        assert_eq!(sets.len(), 1);
        let hosts = service.list_hosts(&[1, 2, 3], &fields(&["bk_host_id"])).await.unwrap();
        assert_eq!(hosts.len(), 2);
    }

    #[tokio::test]
    async fn test_topology_through_service() {
        let (service, _docs) = seeded();
        assert_eq!(
            service.get_mainline_topology().await.unwrap(),
            vec!["biz", "region", "set", "module", "host"]
        );

        let paths = service.resolve_ancestor_path(5, &[NodeRef::new("module", 200)]).await.unwrap();
        assert_eq!(paths.len(), 1);
        let objects: Vec<&str> = paths[0].path.iter().map(|n| n.object.as_str()).collect();
        assert_eq!(objects, vec!["set", "region", "biz"]);

        let tree = service
            .search_topology(&SearchOption {
                biz_id: 5,
                filters: vec![NameFilter::new("set", "SET")],
            })
            .await
            .unwrap();
        assert_eq!(tree.id, 5);
        assert_eq!(tree.children[0].object, "region");
        assert_eq!(tree.children[0].children[0].id, 100);
    }

    #[tokio::test]
    async fn test_host_by_inner_ip() {
        let (service, _docs) = seeded();
        let host = service.get_host_by_inner_ip("10.0.0.2", 0, &fields(&["bk_host_id"])).await.unwrap();
        assert_eq!(host, json!({"bk_host_id": 1}));

        assert!(service.get_host_by_inner_ip("10.0.0.2", 1, &[]).await.unwrap_err().is_not_found());
        assert!(matches!(
            service.get_host_by_inner_ip("10.0.0.1,10.0.0.2", 0, &[]).await,
            Err(CacheError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_host_pages_and_forced_refresh() {
        let (service, _docs) = seeded();

        let outcome = service.refresh_general_id_list(GeneralResource::Host).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Refreshed);

        let (total, page) = service.list_hosts_with_page(1, 10, &fields(&["bk_host_id"])).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(page, vec![json!({"bk_host_id": 2})]);

        let found = service
            .refresh_general_detail_by_ids(GeneralResource::Host, &[1, 2, 9])
            .await
            .unwrap();
        assert_eq!(found, 2);
    }
}
