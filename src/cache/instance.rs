// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache of business hierarchy instances: business, set, module and custom
//! mainline levels.
//!
//! Per instance the cache keeps
//!
//! ```text
//! {ns}:detail:{id}          full document (JSON)
//! {ns}:detail:expire:{id}   unix seconds of the last write
//! {ns}:list:{scope}         SET of "{id}:{parent}:{name}", one per live instance
//! {ns}:list:expire:{scope}
//! {ns}:oid:{_id}            {"id":…, "scope":…} so deletes can find their keys
//! ```
//!
//! The base list of a business is scoped by business id; the business list
//! itself has the single scope `0`.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{check_id_batch, parse_cached, write_quietly, CacheContext};
use crate::document::{lookup_i64, project, Filter, FindOptions};
use crate::error::CacheError;
use crate::event::{Decoded, InstanceFields, InstanceRecord};
use crate::keys::{custom_entity, EntityKeys, ListEntry};
use crate::reflector::{EventHandler, ReflectorEvent, WatchOptions};
use crate::refresh::{is_stale, reconcile_list, unix_now, Fetcher, RefreshKeys};
use crate::storage::traits::{DocumentStore, KvBatch, KvStore};

/// Staleness windows a detail record is kept in the KV store without a write.
const DETAIL_RETENTION_WINDOWS: u32 = 4;

/// Where one instance type lives and how to read it.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSchema {
    /// Key namespace and metric label, e.g. `set` or `custom.region`.
    pub entity: String,
    /// Object id as used in the mainline, e.g. `set` or `region`.
    pub object: String,
    pub collection: &'static str,
    pub fields: InstanceFields,
    /// Restricts a shared collection to this type.
    pub filter: Filter,
}

impl InstanceSchema {
    #[must_use]
    pub fn biz() -> Self {
        Self {
            entity: "biz".into(),
            object: "biz".into(),
            collection: "cc_ApplicationBase",
            fields: InstanceFields {
                id: "bk_biz_id",
                name: "bk_biz_name",
                parent: None,
                scope: None,
            },
            filter: Filter::All,
        }
    }

    #[must_use]
    pub fn set() -> Self {
        Self {
            entity: "set".into(),
            object: "set".into(),
            collection: "cc_SetBase",
            fields: InstanceFields {
                id: "bk_set_id",
                name: "bk_set_name",
                parent: Some("bk_parent_id"),
                scope: Some("bk_biz_id"),
            },
            filter: Filter::All,
        }
    }

    #[must_use]
    pub fn module() -> Self {
        Self {
            entity: "module".into(),
            object: "module".into(),
            collection: "cc_ModuleBase",
            fields: InstanceFields {
                id: "bk_module_id",
                name: "bk_module_name",
                parent: Some("bk_set_id"),
                scope: Some("bk_biz_id"),
            },
            filter: Filter::All,
        }
    }

    /// A custom mainline level, stored in the shared object instance collection.
    #[must_use]
    pub fn custom(object: &str) -> Self {
        Self {
            entity: custom_entity(object),
            object: object.to_string(),
            collection: "cc_ObjectBase",
            fields: InstanceFields {
                id: "bk_inst_id",
                name: "bk_inst_name",
                parent: Some("bk_parent_id"),
                scope: Some("bk_biz_id"),
            },
            filter: Filter::eq("bk_obj_id", object),
        }
    }

    fn by_id(&self, id: i64) -> Filter {
        self.filter.clone().and(Filter::eq(self.fields.id, id))
    }

    fn by_ids(&self, ids: &[i64]) -> Filter {
        self.filter.clone().and(Filter::is_in(self.fields.id, ids.iter().copied()))
    }

    fn by_scope(&self, scope_id: i64) -> Filter {
        match self.fields.scope {
            Some(field) => self.filter.clone().and(Filter::eq(field, scope_id)),
            None => self.filter.clone(),
        }
    }

    fn list_fields(&self) -> Vec<String> {
        [Some(self.fields.id), Some(self.fields.name), self.fields.parent, self.fields.scope]
            .into_iter()
            .flatten()
            .map(String::from)
            .collect()
    }

    fn decode(&self, doc: &Value) -> Decoded<InstanceRecord> {
        if !self.filter.matches(doc) {
            return Decoded::Skip(crate::event::SkipReason::Filtered(format!(
                "not a {} instance",
                self.object
            )));
        }
        self.fields.decode(doc)
    }
}

/// What the oid key of an instance points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct InstanceRef {
    id: i64,
    scope: i64,
}

/// Load the list entries of one scope straight from the document store.
async fn load_entries(docs: &dyn DocumentStore, schema: &InstanceSchema, scope_id: i64) -> Result<Vec<ListEntry>, CacheError> {
    let options = FindOptions::new().fields(&schema.list_fields()).sort_asc(schema.fields.id);
    let found = docs.find(schema.collection, &schema.by_scope(scope_id), &options).await?;
    Ok(found
        .iter()
        .filter_map(|doc| match schema.decode(doc) {
            Decoded::Ok(record) => Some(ListEntry::new(record.id, record.parent_id, record.name)),
            Decoded::Skip(reason) => {
                debug!(entity = %schema.entity, %reason, "Skipping source record in base list");
                None
            }
        })
        .collect())
}

struct DetailFetcher {
    docs: Arc<dyn DocumentStore>,
    collection: &'static str,
    filter: Filter,
}

#[async_trait]
impl Fetcher for DetailFetcher {
    type Output = Option<String>;

    async fn fetch(&self) -> Result<Option<String>, CacheError> {
        let found = self.docs.find_one(self.collection, &self.filter, &[]).await?;
        Ok(found.map(|doc| doc.to_string()))
    }
}

struct ListFetcher {
    docs: Arc<dyn DocumentStore>,
    schema: InstanceSchema,
    scope_id: i64,
}

#[async_trait]
impl Fetcher for ListFetcher {
    type Output = Vec<String>;

    async fn fetch(&self) -> Result<Vec<String>, CacheError> {
        let entries = load_entries(self.docs.as_ref(), &self.schema, self.scope_id).await?;
        Ok(entries.iter().map(ListEntry::encode).collect())
    }
}

/// Cache of one instance type.
pub struct InstanceCache {
    ctx: CacheContext,
    schema: InstanceSchema,
    keys: EntityKeys,
}

impl InstanceCache {
    pub fn new(ctx: CacheContext, schema: InstanceSchema) -> Self {
        let keys = ctx.keys.entity(&schema.entity);
        Self { ctx, schema, keys }
    }

    #[must_use]
    pub fn schema(&self) -> &InstanceSchema {
        &self.schema
    }

    #[must_use]
    pub fn keys(&self) -> &EntityKeys {
        &self.keys
    }

    fn kv(&self) -> &dyn KvStore {
        self.ctx.kv.as_ref()
    }

    fn detail_ttl(&self) -> Duration {
        self.ctx.config.detail_ttl()
    }

    /// KV expiry of detail records, so a record whose delete event was
    /// missed does not outlive a few staleness windows.
    fn detail_retention(&self) -> Option<Duration> {
        Some(self.detail_ttl() * DETAIL_RETENTION_WINDOWS)
    }

    /// Reflector settings for this type's collection.
    #[must_use]
    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            collection: self.schema.collection.to_string(),
            filter: self.schema.filter.clone(),
            page_size: self.ctx.config.list_page_size,
            list_done_key: self.keys.list_done(),
            token_key: self.keys.watch_token(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Read path
    // ═══════════════════════════════════════════════════════════════════════

    /// Detail of one instance, projected to `fields` (empty keeps all).
    pub async fn get(&self, id: i64, fields: &[String]) -> Result<Value, CacheError> {
        let entity = self.schema.entity.as_str();
        let detail_key = self.keys.detail(id);
        let expire_key = self.keys.detail_expire(id);

        match self.kv().mget(&[detail_key.clone(), expire_key]).await {
            Ok(values) => {
                let mut values = values.into_iter();
                let detail = values.next().flatten();
                let expire = values.next().flatten();
                if let Some(raw) = detail {
                    if let Some(doc) = parse_cached(self.kv(), entity, &detail_key, &raw).await {
                        crate::metrics::record_lookup(entity, "hit");
                        if is_stale(expire.as_deref(), self.detail_ttl(), unix_now()) {
                            self.spawn_detail_refresh(id);
                        }
                        return Ok(project(&doc, fields));
                    }
                }
                crate::metrics::record_lookup(entity, "miss");
            }
            Err(e) => {
                warn!(entity, id, error = %e, "Cache read failed, reading document store");
                crate::metrics::record_lookup(entity, "error");
                crate::metrics::record_fallback(entity, "kv_error");
            }
        }

        let doc = self
            .ctx
            .docs
            .find_one(self.schema.collection, &self.schema.by_id(id), &[])
            .await?
            .ok_or_else(|| CacheError::not_found(entity, id))?;

        let mut batch = KvBatch::new();
        batch
            .set(self.keys.detail(id), doc.to_string(), self.detail_retention())
            .set(self.keys.detail_expire(id), unix_now().to_string(), self.detail_retention());
        write_quietly(self.kv(), entity, "write_through", batch).await;

        Ok(project(&doc, fields))
    }

    /// Details of many instances. Missing ids are left out; order follows
    /// the cache, then the document store.
    pub async fn list(&self, ids: &[i64], fields: &[String]) -> Result<Vec<Value>, CacheError> {
        check_id_batch(ids, self.ctx.config.max_ids_per_request)?;
        let entity = self.schema.entity.as_str();

        let mut unique = Vec::with_capacity(ids.len());
        let mut seen = HashSet::new();
        for id in ids {
            if seen.insert(*id) {
                unique.push(*id);
            }
        }

        let mut keys: Vec<String> = unique.iter().map(|id| self.keys.detail(id)).collect();
        keys.extend(unique.iter().map(|id| self.keys.detail_expire(id)));

        let mut found = Vec::with_capacity(unique.len());
        let mut missing = Vec::new();
        match self.kv().mget(&keys).await {
            Ok(values) => {
                let (details, expires) = values.split_at(unique.len());
                for (i, id) in unique.iter().enumerate() {
                    let cached = match &details[i] {
                        Some(raw) => parse_cached(self.kv(), entity, &keys[i], raw).await,
                        None => None,
                    };
                    match cached {
                        Some(doc) => {
                            if is_stale(expires[i].as_deref(), self.detail_ttl(), unix_now()) {
                                self.spawn_detail_refresh(*id);
                            }
                            found.push(project(&doc, fields));
                        }
                        None => missing.push(*id),
                    }
                }
            }
            Err(e) => {
                warn!(entity, count = unique.len(), error = %e, "Cache read failed, reading document store");
                crate::metrics::record_fallback(entity, "kv_error");
                missing = unique.clone();
            }
        }
        crate::metrics::record_lookup(entity, if missing.is_empty() { "hit" } else { "miss" });

        if missing.is_empty() {
            return Ok(found);
        }

        let docs = self
            .ctx
            .docs
            .find(self.schema.collection, &self.schema.by_ids(&missing), &FindOptions::new())
            .await?;
        let now = unix_now().to_string();
        let mut batch = KvBatch::new();
        for doc in &docs {
            if let Some(id) = lookup_i64(doc, self.schema.fields.id) {
                batch
                    .set(self.keys.detail(id), doc.to_string(), self.detail_retention())
                    .set(self.keys.detail_expire(id), now.clone(), self.detail_retention());
            }
            found.push(project(doc, fields));
        }
        write_quietly(self.kv(), entity, "write_through", batch).await;

        Ok(found)
    }

    /// Base list of one scope (business id, `0` for the business list).
    pub async fn base_list(&self, scope_id: i64) -> Result<Vec<ListEntry>, CacheError> {
        let entity = self.schema.entity.as_str();
        let list_key = self.keys.list(scope_id);

        let members = match self.kv().smembers(&list_key).await {
            Ok(members) => members,
            Err(e) => {
                warn!(entity, scope_id, error = %e, "Base list read failed, reading document store");
                crate::metrics::record_fallback(entity, "kv_error");
                return load_entries(self.ctx.docs.as_ref(), &self.schema, scope_id).await;
            }
        };

        if members.is_empty() {
            crate::metrics::record_lookup(entity, "miss");
            let entries = load_entries(self.ctx.docs.as_ref(), &self.schema, scope_id).await?;
            let desired: Vec<String> = entries.iter().map(ListEntry::encode).collect();
            if let Err(e) =
                reconcile_list(self.kv(), &list_key, &self.keys.list_expire(scope_id), &desired, unix_now()).await
            {
                warn!(entity, scope_id, error = %e, "Base list write-through failed");
            }
            return Ok(entries);
        }
        crate::metrics::record_lookup(entity, "hit");

        let mut entries = BTreeMap::new();
        let mut malformed = Vec::new();
        let mut recoverable = Vec::new();
        for member in members {
            match ListEntry::decode(&member) {
                Ok(entry) => {
                    entries.insert(entry.id, entry);
                }
                Err(e) => {
                    warn!(entity, scope_id, error = %e, "Malformed base list member");
                    if let Some(id) = ListEntry::recover_id(&member) {
                        recoverable.push(id);
                    }
                    malformed.push(member);
                }
            }
        }
        if !malformed.is_empty() {
            for entry in self.heal_list(scope_id, malformed, recoverable).await {
                entries.insert(entry.id, entry);
            }
        }

        match self.kv().get(&self.keys.list_expire(scope_id)).await {
            Ok(expire) if is_stale(expire.as_deref(), self.ctx.config.list_ttl(), unix_now()) => {
                self.spawn_list_refresh(scope_id);
            }
            Ok(_) => {}
            Err(e) => debug!(entity, scope_id, error = %e, "Cannot read base list expire key"),
        }

        Ok(entries.into_values().collect())
    }

    /// Drop malformed members and re-derive those whose id survived.
    async fn heal_list(&self, scope_id: i64, malformed: Vec<String>, recoverable: Vec<i64>) -> Vec<ListEntry> {
        let entity = self.schema.entity.as_str();
        crate::metrics::record_self_heal(entity);

        let mut healed = Vec::new();
        if !recoverable.is_empty() {
            let filter = self.schema.by_scope(scope_id).and(Filter::is_in(self.schema.fields.id, recoverable));
            let options = FindOptions::new().fields(&self.schema.list_fields());
            match self.ctx.docs.find(self.schema.collection, &filter, &options).await {
                Ok(docs) => {
                    healed = docs
                        .iter()
                        .filter_map(|doc| self.schema.decode(doc).ok())
                        .map(|record| ListEntry::new(record.id, record.parent_id, record.name))
                        .collect();
                }
                Err(e) => warn!(entity, scope_id, error = %e, "Cannot re-derive malformed members"),
            }
        }

        let list_key = self.keys.list(scope_id);
        let mut batch = KvBatch::new();
        batch
            .srem(&list_key, malformed)
            .sadd(&list_key, healed.iter().map(ListEntry::encode).collect());
        write_quietly(self.kv(), entity, "self_heal", batch).await;
        healed
    }

    fn spawn_detail_refresh(&self, id: i64) {
        let mut keys = RefreshKeys::new(self.keys.detail(id), self.keys.detail_expire(id), self.keys.detail_lock(id));
        if let Some(retention) = self.detail_retention() {
            keys = keys.with_retention(retention);
        }
        let fetcher = DetailFetcher {
            docs: Arc::clone(&self.ctx.docs),
            collection: self.schema.collection,
            filter: self.schema.by_id(id),
        };
        self.ctx.refresh.try_refresh_detail(keys, self.detail_ttl(), fetcher);
    }

    fn spawn_list_refresh(&self, scope_id: i64) {
        let keys = RefreshKeys::new(
            self.keys.list(scope_id),
            self.keys.list_expire(scope_id),
            self.keys.list_lock(scope_id),
        );
        let fetcher = ListFetcher {
            docs: Arc::clone(&self.ctx.docs),
            schema: self.schema.clone(),
            scope_id,
        };
        self.ctx.refresh.try_refresh_list(keys, self.ctx.config.list_ttl(), fetcher);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Write path
    // ═══════════════════════════════════════════════════════════════════════

    async fn read_ref(&self, oid: &str) -> Result<Option<InstanceRef>, CacheError> {
        let key = self.keys.oid(oid);
        let Some(raw) = self.kv().get(&key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(reference) => Ok(Some(reference)),
            Err(e) => {
                warn!(entity = %self.schema.entity, key, error = %e, "Corrupt oid reference");
                Ok(None)
            }
        }
    }

    /// Members of `list_key` that encode instance `id`.
    async fn members_of(&self, list_key: &str, id: i64) -> Result<Vec<String>, CacheError> {
        Ok(self
            .kv()
            .smembers(list_key)
            .await?
            .into_iter()
            .filter(|member| ListEntry::recover_id(member) == Some(id))
            .collect())
    }

    async fn on_upsert(&self, oid: &str, doc: &Value) -> Result<(), CacheError> {
        let record = match self.schema.decode(doc) {
            Decoded::Ok(record) => record,
            Decoded::Skip(reason) => {
                debug!(entity = %self.schema.entity, oid, %reason, "Dropping upsert");
                crate::metrics::record_event(&self.schema.entity, "upsert", "skipped");
                return Ok(());
            }
        };

        let entry = ListEntry::new(record.id, record.parent_id, record.name.clone());
        let member = entry.encode();
        let list_key = self.keys.list(record.scope_id);
        let mut batch = KvBatch::new();

        // Same id under an old name or parent.
        let stale: Vec<String> = self
            .members_of(&list_key, record.id)
            .await?
            .into_iter()
            .filter(|m| *m != member)
            .collect();
        batch.srem(&list_key, stale);

        if let Some(previous) = self.read_ref(oid).await? {
            if previous.scope != record.scope_id {
                let old_list = self.keys.list(previous.scope);
                batch.srem(&old_list, self.members_of(&old_list, previous.id).await?);
            }
            if previous.id != record.id {
                batch.del(self.keys.detail(previous.id)).del(self.keys.detail_expire(previous.id));
            }
        }

        let reference = serde_json::to_string(&InstanceRef {
            id: record.id,
            scope: record.scope_id,
        })
        .map_err(|e| CacheError::InvalidInput(e.to_string()))?;

        batch
            .sadd(&list_key, vec![member])
            .set(self.keys.detail(record.id), doc.to_string(), self.detail_retention())
            .set(self.keys.detail_expire(record.id), unix_now().to_string(), self.detail_retention())
            .set(self.keys.oid(oid), reference, None);
        self.kv().execute(batch).await?;

        debug!(entity = %self.schema.entity, id = record.id, scope = record.scope_id, "Instance cached");
        Ok(())
    }

    async fn on_delete(&self, oid: &str) -> Result<(), CacheError> {
        let Some(reference) = self.read_ref(oid).await? else {
            debug!(entity = %self.schema.entity, oid, "Delete of an instance never cached");
            return Ok(());
        };

        let list_key = self.keys.list(reference.scope);
        let mut batch = KvBatch::new();
        batch
            .srem(&list_key, self.members_of(&list_key, reference.id).await?)
            .del(self.keys.detail(reference.id))
            .del(self.keys.detail_expire(reference.id))
            .del(self.keys.oid(oid));
        self.kv().execute(batch).await?;

        debug!(entity = %self.schema.entity, id = reference.id, "Instance evicted");
        Ok(())
    }

    async fn on_list_done(&self) -> Result<(), CacheError> {
        self.kv().set(&self.keys.list_done(), &unix_now().to_string(), None).await?;
        Ok(())
    }
}

#[async_trait]
impl EventHandler for InstanceCache {
    fn entity(&self) -> &str {
        &self.schema.entity
    }

    async fn handle(&self, event: ReflectorEvent) -> Result<(), CacheError> {
        match event {
            ReflectorEvent::Upsert { oid, document } => self.on_upsert(&oid, &document).await,
            ReflectorEvent::Delete { oid } => self.on_delete(&oid).await,
            ReflectorEvent::ListDone => self.on_list_done().await,
        }
    }
}
