//! Behavioural properties of the cache against the in-memory backends.
//!
//! Run with: `cargo test --test properties`
//!
//! # Test Organization
//! - `refresh_*` - at most one refresh, bounded staleness
//! - `list_*` - reconciliation
//! - `topo_*` - ancestor paths and the search overhead guard
//! - `delete_*` - eviction through the delete archive

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use cmdb_cache::keys::ListEntry;
use cmdb_cache::refresh::{reconcile_list, RefreshKeys};
use cmdb_cache::topo::{TopoTree, TopologySource};
use cmdb_cache::{
    CacheError, CacheService, CacheServiceConfig, EntityKind, Fetcher, InMemoryDocumentStore, InMemoryKv,
    KvStore, NameFilter, NodeRef, PathNode, RefreshCoordinator, SearchOption,
};

// =============================================================================
// Helpers
// =============================================================================

fn service_over(kv: Arc<InMemoryKv>, docs: Arc<InMemoryDocumentStore>) -> CacheService {
    CacheService::new(CacheServiceConfig::default(), kv, docs.clone(), docs).unwrap()
}

fn mainline(docs: &InMemoryDocumentStore, chain: &[&str]) {
    for pair in chain.windows(2) {
        docs.insert(
            "cc_ObjAsst",
            json!({"bk_obj_id": pair[1], "bk_asst_obj_id": pair[0], "bk_asst_id": "bk_mainline"}),
        );
    }
}

fn biz(docs: &InMemoryDocumentStore, id: i64, name: &str) -> String {
    docs.insert("cc_ApplicationBase", json!({"bk_biz_id": id, "bk_biz_name": name}))
}

fn set(docs: &InMemoryDocumentStore, id: i64, name: &str, parent: i64, biz: i64) -> String {
    docs.insert(
        "cc_SetBase",
        json!({"bk_set_id": id, "bk_set_name": name, "bk_parent_id": parent, "bk_biz_id": biz}),
    )
}

fn module(docs: &InMemoryDocumentStore, id: i64, name: &str, set: i64, biz: i64) -> String {
    docs.insert(
        "cc_ModuleBase",
        json!({"bk_module_id": id, "bk_module_name": name, "bk_set_id": set, "bk_biz_id": biz}),
    )
}

fn path_node(object: &str, id: i64, name: &str) -> PathNode {
    PathNode {
        object: object.to_string(),
        id,
        name: name.to_string(),
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

struct SlowFetcher {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Fetcher for SlowFetcher {
    type Output = Option<String>;

    async fn fetch(&self) -> Result<Option<String>, CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(Some("fresh".to_string()))
    }
}

fn refresh_keys() -> RefreshKeys {
    RefreshKeys::new("cc:set:detail:100", "cc:set:detail:expire:100", "cc:set:detail:lock:100")
}

// =============================================================================
// Refresh
// =============================================================================

#[tokio::test]
async fn refresh_at_most_once_in_one_instance() {
    let kv = Arc::new(InMemoryKv::new());
    let coordinator = RefreshCoordinator::new(kv.clone(), Duration::from_secs(15), CancellationToken::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let spawned = (0..32)
        .filter(|_| {
            coordinator.try_refresh_detail(
                refresh_keys(),
                Duration::from_secs(900),
                SlowFetcher { calls: calls.clone() },
            )
        })
        .count();
    coordinator.wait_idle().await;

    assert_eq!(spawned, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(kv.get("cc:set:detail:100").await.unwrap().as_deref(), Some("fresh"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn refresh_at_most_once_across_instances() {
    let kv = Arc::new(InMemoryKv::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let fleet: Vec<RefreshCoordinator> = (0..4)
        .map(|_| RefreshCoordinator::new(kv.clone(), Duration::from_secs(15), CancellationToken::new()))
        .collect();

    for _ in 0..8 {
        for instance in &fleet {
            instance.try_refresh_detail(
                refresh_keys(),
                Duration::from_secs(900),
                SlowFetcher { calls: calls.clone() },
            );
        }
    }
    for instance in &fleet {
        instance.wait_idle().await;
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn refresh_serves_stale_value_and_reloads_once() {
    let kv = Arc::new(InMemoryKv::new());
    let docs = Arc::new(InMemoryDocumentStore::new());
    set(&docs, 100, "renamed", 5, 5);
    let service = service_over(kv.clone(), docs.clone());

    // A detail written past its window
    let keys = service.key_gen().entity("set");
    let written_at = cmdb_cache::refresh::unix_now() - 901;
    kv.set(&keys.detail(100), &json!({"bk_set_id": 100, "bk_set_name": "original"}).to_string(), None)
        .await
        .unwrap();
    kv.set(&keys.detail_expire(100), &written_at.to_string(), None).await.unwrap();

    let calls_before = docs.find_calls();
    let name = ["bk_set_name".to_string()];
    for _ in 0..10 {
        let doc = service.get_entity(&EntityKind::Set, 100, &name).await.unwrap();
        assert_eq!(doc["bk_set_name"], "original");
    }
    service.refresh_coordinator().wait_idle().await;
    assert_eq!(docs.find_calls() - calls_before, 1);

    let doc = service.get_entity(&EntityKind::Set, 100, &name).await.unwrap();
    assert_eq!(doc["bk_set_name"], "renamed");
}

// =============================================================================
// Lists
// =============================================================================

#[tokio::test]
async fn list_reconcile_is_idempotent() {
    let kv = InMemoryKv::new();

    let desired: Vec<String> = [
        ListEntry::new(100, 5, "set-a"),
        ListEntry::new(101, 5, "set-b"),
    ]
    .iter()
    .map(ListEntry::encode)
    .collect();

    let first = reconcile_list(&kv, "cc:set:list:5", "cc:set:list:expire:5", &desired, 1).await.unwrap();
    assert_eq!(first.added.len(), 2);

    let second = reconcile_list(&kv, "cc:set:list:5", "cc:set:list:expire:5", &desired, 2).await.unwrap();
    assert!(second.is_noop());
    // Only the expire stamp moves
    assert_eq!(kv.get("cc:set:list:expire:5").await.unwrap().as_deref(), Some("2"));

    let mut members = kv.smembers("cc:set:list:5").await.unwrap();
    members.sort();
    let mut expected = desired.clone();
    expected.sort();
    assert_eq!(members, expected);
}

// =============================================================================
// Topology
// =============================================================================

#[tokio::test]
async fn topo_path_round_trip_through_custom_level() {
    let docs = Arc::new(InMemoryDocumentStore::new());
    mainline(&docs, &["biz", "region", "set", "module", "host"]);
    biz(&docs, 5, "shop");
    docs.insert(
        "cc_ObjectBase",
        json!({"bk_obj_id": "region", "bk_inst_id": 30, "bk_inst_name": "east", "bk_parent_id": 5, "bk_biz_id": 5}),
    );
    set(&docs, 100, "set-a", 30, 5);
    module(&docs, 200, "m1", 100, 5);
    let service = service_over(Arc::new(InMemoryKv::new()), docs);

    let chain = ["biz", "region", "set", "module"];
    let paths = service.resolve_ancestor_path(5, &[NodeRef::new("module", 200)]).await.unwrap();
    assert_eq!(paths.len(), 1);
    let path = &paths[0].path;
    assert_eq!(path.len(), chain.len() - 1);
    assert_eq!(path.first(), Some(&path_node("set", 100, "set-a")));
    assert_eq!(path.last(), Some(&path_node("biz", 5, "shop")));
    assert_eq!(path[1], path_node("region", 30, "east"));
}

#[tokio::test]
async fn topo_example_scenario() {
    let docs = Arc::new(InMemoryDocumentStore::new());
    mainline(&docs, &["biz", "set", "module", "host"]);
    biz(&docs, 5, "shop");
    set(&docs, 100, "set-a", 5, 5);
    set(&docs, 101, "set-b", 5, 5);
    module(&docs, 200, "m1", 100, 5);
    let service = service_over(Arc::new(InMemoryKv::new()), docs);

    let paths = service.resolve_ancestor_path(5, &[NodeRef::new("module", 200)]).await.unwrap();
    assert_eq!(paths.len(), 1);
    assert_eq!(paths[0].id, 200);
    assert_eq!(paths[0].name, "m1");
    assert_eq!(
        paths[0].path,
        vec![path_node("set", 100, "set-a"), path_node("biz", 5, "shop")]
    );
}

/// Source that records which levels a request read.
struct RecordingSource {
    modules: usize,
    reads: Mutex<Vec<String>>,
}

#[async_trait]
impl TopologySource for RecordingSource {
    async fn mainline(&self) -> Result<Vec<String>, CacheError> {
        Ok(["biz", "set", "module", "host"].iter().map(|s| s.to_string()).collect())
    }

    async fn base_list(&self, object: &str, biz_id: i64) -> Result<Vec<ListEntry>, CacheError> {
        self.reads.lock().push(object.to_string());
        Ok(match object {
            "set" => vec![ListEntry::new(100, biz_id, "set-a")],
            "module" => (0..self.modules as i64)
                .map(|i| ListEntry::new(1000 + i, 100, format!("web-{}", i)))
                .collect(),
            _ => Vec::new(),
        })
    }

    async fn business_name(&self, biz_id: i64) -> Result<Option<String>, CacheError> {
        Ok((biz_id == 5).then(|| "shop".to_string()))
    }
}

#[tokio::test]
async fn topo_overhead_guard_stops_reading() {
    let source = Arc::new(RecordingSource {
        modules: 21,
        reads: Mutex::new(Vec::new()),
    });
    let tree = TopoTree::new(source.clone(), 20);
    let option = SearchOption {
        biz_id: 5,
        filters: vec![NameFilter::new("module", "web")],
    };

    let err = tree.search_topology(&option).await.unwrap_err();
    assert!(err.is_overhead());
    assert!(matches!(err, CacheError::Overhead { limit: 20, matched: 21 }));
    assert_eq!(*source.reads.lock(), vec!["module".to_string()]);
}

#[tokio::test]
async fn topo_search_at_the_ceiling_succeeds() {
    let source = Arc::new(RecordingSource {
        modules: 20,
        reads: Mutex::new(Vec::new()),
    });
    let tree = TopoTree::new(source, 20);
    let option = SearchOption {
        biz_id: 5,
        filters: vec![NameFilter::new("module", "WEB")],
    };

    let result = tree.search_topology(&option).await.unwrap();
    assert_eq!(result.children.len(), 1);
    assert_eq!(result.children[0].children.len(), 20);
}

// =============================================================================
// Deletes
// =============================================================================

#[tokio::test]
async fn delete_evicts_detail_and_list_membership() {
    let kv = Arc::new(InMemoryKv::new());
    let docs = Arc::new(InMemoryDocumentStore::new());
    mainline(&docs, &["biz", "set", "module", "host"]);
    biz(&docs, 5, "shop");
    set(&docs, 101, "set-b", 5, 5);
    let service = service_over(kv.clone(), docs.clone());
    service.start().await.unwrap();

    let oid = set(&docs, 100, "set-a", 5, 5);
    let keys = service.key_gen().entity("set");
    let oid_key = keys.oid(&oid);
    {
        let kv = kv.clone();
        eventually(move || {
            let kv = kv.clone();
            let oid_key = oid_key.clone();
            async move { kv.exists(&oid_key).await.unwrap_or(false) }
        })
        .await;
    }
    let cached: Value = service.get_entity(&EntityKind::Set, 100, &[]).await.unwrap();
    assert_eq!(cached["bk_set_name"], "set-a");

    docs.delete("cc_SetBase", &oid);
    let detail_key = keys.detail(100);
    {
        let kv = kv.clone();
        eventually(move || {
            let kv = kv.clone();
            let detail_key = detail_key.clone();
            async move { !kv.exists(&detail_key).await.unwrap_or(true) }
        })
        .await;
    }

    let err = service.get_entity(&EntityKind::Set, 100, &[]).await.unwrap_err();
    assert!(err.is_not_found());

    let members = kv.smembers(&keys.list(5)).await.unwrap();
    assert!(members.iter().all(|m| ListEntry::recover_id(m) != Some(100)));
    let listed = service.get_entity_base_list(&EntityKind::Set, 5).await.unwrap();
    assert_eq!(listed.iter().map(|e| e.id).collect::<Vec<_>>(), vec![101]);

    service.shutdown().await;
}
