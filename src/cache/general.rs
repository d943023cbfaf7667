// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache of general resources: hosts, business sets, cloud areas and projects.
//!
//! Unlike the hierarchy caches these have no base lists. Per resource:
//!
//! ```text
//! {ns}:detail:{id}       JSON document, or "" for an id the store lacks;
//!                        KV expiry of ttl + random jitter
//! {ns}:unique:{value}    id of the record owning a unique value (host: "ip:cloud")
//! {ns}:id_list           ZSET of every id, score = id
//! {ns}:id_list:expire    unix seconds of the last rebuild
//! {ns}:id_list:lock      rebuild lock
//! {ns}:id_list:temp_key  temporary ZSET of a rebuild in progress
//! ```
//!
//! Detail misses are written back with `SET NX` so a read never clobbers a
//! newer value written by ingestion. Deletes carry no body; the last body is
//! looked up in the delete archive to find the keys to drop.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{check_id_batch, parse_cached, write_quietly, CacheContext};
use crate::document::{lookup, lookup_i64, project, Filter, FindOptions};
use crate::error::CacheError;
use crate::event::required_id;
use crate::keys::EntityKeys;
use crate::reflector::{EventHandler, ReflectorEvent, WatchOptions};
use crate::refresh::{is_stale, unix_now, Fetcher, RefreshKeys, RefreshOutcome};
use crate::storage::traits::{DocumentStore, KvBatch, KvStore};

/// Placeholder stored for ids the document store does not have.
const MISSING: &str = "";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeneralResource {
    Host,
    BizSet,
    CloudArea,
    Project,
}

impl GeneralResource {
    pub const ALL: [GeneralResource; 4] = [
        GeneralResource::Host,
        GeneralResource::BizSet,
        GeneralResource::CloudArea,
        GeneralResource::Project,
    ];

    #[must_use]
    pub fn entity(&self) -> &'static str {
        match self {
            GeneralResource::Host => "host",
            GeneralResource::BizSet => "biz_set",
            GeneralResource::CloudArea => "cloud_area",
            GeneralResource::Project => "project",
        }
    }

    #[must_use]
    pub fn collection(&self) -> &'static str {
        match self {
            GeneralResource::Host => "cc_HostBase",
            GeneralResource::BizSet => "cc_BizSetBase",
            GeneralResource::CloudArea => "cc_PlatBase",
            GeneralResource::Project => "cc_Project",
        }
    }

    #[must_use]
    pub fn id_field(&self) -> &'static str {
        match self {
            GeneralResource::Host => "bk_host_id",
            GeneralResource::BizSet => "bk_biz_set_id",
            GeneralResource::CloudArea => "bk_cloud_id",
            GeneralResource::Project => "id",
        }
    }

    /// Unique values indexed for `doc`. Hosts get one `ip:cloud` per inner IP.
    #[must_use]
    pub fn unique_values(&self, doc: &Value) -> Vec<String> {
        match self {
            GeneralResource::Host => {
                let Some(cloud) = lookup_i64(doc, "bk_cloud_id") else {
                    return Vec::new();
                };
                let ips: Vec<String> = match lookup(doc, "bk_host_innerip") {
                    Some(Value::String(joined)) => joined.split(',').map(|ip| ip.trim().to_string()).collect(),
                    Some(Value::Array(items)) => items.iter().filter_map(|v| v.as_str().map(String::from)).collect(),
                    _ => Vec::new(),
                };
                ips.into_iter()
                    .filter(|ip| !ip.is_empty())
                    .map(|ip| format!("{}:{}", ip, cloud))
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    /// Document store filter for a unique value, `None` when the resource has
    /// no unique index or the value is malformed.
    #[must_use]
    pub fn unique_filter(&self, value: &str) -> Option<Filter> {
        match self {
            GeneralResource::Host => {
                let (ip, cloud) = value.rsplit_once(':')?;
                let cloud: i64 = cloud.parse().ok()?;
                if ip.is_empty() {
                    return None;
                }
                let pattern = format!("(^|,){}(,|$)", regex::escape(ip));
                Some(Filter::eq("bk_cloud_id", cloud).and(Filter::regex("bk_host_innerip", pattern)))
            }
            _ => None,
        }
    }
}

impl fmt::Display for GeneralResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.entity())
    }
}

impl FromStr for GeneralResource {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GeneralResource::ALL
            .into_iter()
            .find(|r| r.entity() == s)
            .ok_or_else(|| CacheError::InvalidInput(format!("unknown general resource '{}'", s)))
    }
}

/// Pages the collection by id into a temporary ZSET and swaps it in.
///
/// The temporary key is published under the id list's temp pointer while the
/// rebuild runs, so ingestion applies events to both lists and nothing that
/// arrives mid-rebuild is lost at the swap.
struct IdListRebuilder {
    kv: Arc<dyn KvStore>,
    docs: Arc<dyn DocumentStore>,
    resource: GeneralResource,
    keys: EntityKeys,
    page_size: usize,
    ttl: Duration,
}

impl IdListRebuilder {
    /// Copy every id into `temp`, returning how many were copied. Each page
    /// renews the expiry of `temp` so an abandoned rebuild leaves nothing
    /// behind.
    async fn fill(&self, temp: &str) -> Result<usize, CacheError> {
        let id_field = self.resource.id_field();
        let page_size = self.page_size.max(1);
        let mut last: Option<i64> = None;
        let mut total = 0usize;

        loop {
            let filter = match last {
                Some(id) => Filter::gt(id_field, id),
                None => Filter::All,
            };
            let options = FindOptions::new().fields(&[id_field]).sort_asc(id_field).limit(page_size as u64);
            let page = self.docs.find(self.resource.collection(), &filter, &options).await?;
            let exhausted = page.len() < page_size;

            let ids: Vec<i64> = page.iter().filter_map(|doc| lookup_i64(doc, id_field)).collect();
            if let Some(max) = ids.iter().max() {
                last = Some(*max);
            }
            total += ids.len();
            let mut batch = KvBatch::new();
            batch
                .zadd(temp, ids.iter().map(|id| (*id as f64, id.to_string())).collect())
                .expire(temp, self.ttl);
            self.kv.execute(batch).await?;

            if exhausted || ids.is_empty() {
                return Ok(total);
            }
        }
    }
}

#[async_trait]
impl Fetcher for IdListRebuilder {
    type Output = ();

    async fn fetch(&self) -> Result<(), CacheError> {
        let temp = self.keys.id_list_temp(uuid::Uuid::new_v4().simple());
        let pointer = self.keys.id_list_temp_pointer();
        self.kv.set(&pointer, &temp, Some(self.ttl)).await?;

        let total = match self.fill(&temp).await {
            Ok(total) => total,
            Err(e) => {
                let mut cleanup = KvBatch::new();
                cleanup.del(&temp).del(&pointer);
                if let Err(cleanup_err) = self.kv.execute(cleanup).await {
                    debug!(resource = %self.resource, error = %cleanup_err, "Cannot drop temporary id list");
                }
                return Err(e);
            }
        };

        let id_list = self.keys.id_list();
        let mut batch = KvBatch::new();
        // Events may have emptied the temporary list since it was filled.
        if total == 0 || !self.kv.exists(&temp).await? {
            batch.del(&id_list).del(&temp);
        } else {
            batch.rename(&temp, &id_list).expire(&id_list, self.ttl * 2);
        }
        batch.del(&pointer);
        self.kv.execute(batch).await?;
        info!(resource = %self.resource, ids = total, "Id list rebuilt");
        Ok(())
    }
}

/// Cache of one general resource.
pub struct GeneralCache {
    ctx: CacheContext,
    resource: GeneralResource,
    keys: EntityKeys,
}

impl GeneralCache {
    pub fn new(ctx: CacheContext, resource: GeneralResource) -> Self {
        let keys = ctx.keys.entity(resource.entity());
        Self { ctx, resource, keys }
    }

    #[must_use]
    pub fn resource(&self) -> GeneralResource {
        self.resource
    }

    #[must_use]
    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            collection: self.resource.collection().to_string(),
            filter: Filter::All,
            page_size: self.ctx.config.list_page_size,
            list_done_key: self.keys.list_done(),
            token_key: self.keys.watch_token(),
        }
    }

    fn kv(&self) -> &dyn KvStore {
        self.ctx.kv.as_ref()
    }

    fn entity(&self) -> &'static str {
        self.resource.entity()
    }

    /// Detail expiry with random jitter, so records loaded together do not
    /// expire together.
    fn detail_ttl(&self) -> Duration {
        let base = self.ctx.config.general_detail_ttl_secs;
        let jitter = self.ctx.config.general_detail_ttl_jitter_secs;
        let extra = if jitter == 0 { 0 } else { rand::thread_rng().gen_range(0..=jitter) };
        Duration::from_secs(base + extra)
    }

    fn id_of(&self, doc: &Value) -> Option<i64> {
        required_id(doc, self.resource.id_field()).ok()
    }

    /// Queue detail and unique index writes of `doc`. `nx` keeps newer values.
    fn stage_detail(&self, batch: &mut KvBatch, id: i64, doc: &Value, nx: bool) {
        let ttl = Some(self.detail_ttl());
        if nx {
            batch.set_nx(self.keys.detail(id), doc.to_string(), ttl);
        } else {
            batch.set(self.keys.detail(id), doc.to_string(), ttl);
        }
        for value in self.resource.unique_values(doc) {
            batch.set(self.keys.unique(&value), id.to_string(), ttl);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Read path
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn get(&self, id: i64, fields: &[String]) -> Result<Value, CacheError> {
        let entity = self.entity();
        let key = self.keys.detail(id);
        match self.kv().get(&key).await {
            Ok(Some(raw)) if raw == MISSING => {
                crate::metrics::record_lookup(entity, "placeholder");
                return Err(CacheError::not_found(entity, id));
            }
            Ok(Some(raw)) => {
                if let Some(doc) = parse_cached(self.kv(), entity, &key, &raw).await {
                    crate::metrics::record_lookup(entity, "hit");
                    return Ok(project(&doc, fields));
                }
            }
            Ok(None) => crate::metrics::record_lookup(entity, "miss"),
            Err(e) => {
                warn!(entity, id, error = %e, "Cache read failed, reading document store");
                crate::metrics::record_lookup(entity, "error");
                crate::metrics::record_fallback(entity, "kv_error");
            }
        }

        let filter = Filter::eq(self.resource.id_field(), id);
        let found = self.ctx.docs.find_one(self.resource.collection(), &filter, &[]).await?;
        let mut batch = KvBatch::new();
        let result = match &found {
            Some(doc) => {
                self.stage_detail(&mut batch, id, doc, true);
                Ok(project(doc, fields))
            }
            None => {
                batch.set_nx(key, MISSING, Some(self.ctx.config.missing_placeholder_ttl()));
                Err(CacheError::not_found(entity, id))
            }
        };
        write_quietly(self.kv(), entity, "write_through", batch).await;
        result
    }

    /// Details of up to `max_ids_per_request` ids. Absent ids are left out.
    pub async fn list_detail_by_ids(&self, ids: &[i64], fields: &[String]) -> Result<Vec<Value>, CacheError> {
        check_id_batch(ids, self.ctx.config.max_ids_per_request)?;
        let entity = self.entity();

        let mut seen = HashSet::new();
        let unique: Vec<i64> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        let keys: Vec<String> = unique.iter().map(|id| self.keys.detail(id)).collect();

        let mut found = Vec::with_capacity(unique.len());
        let mut missing = Vec::new();
        match self.kv().mget(&keys).await {
            Ok(values) => {
                for ((id, key), value) in unique.iter().zip(&keys).zip(values) {
                    match value {
                        Some(raw) if raw == MISSING => {}
                        Some(raw) => match parse_cached(self.kv(), entity, key, &raw).await {
                            Some(doc) => found.push(project(&doc, fields)),
                            None => missing.push(*id),
                        },
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

        let filter = Filter::is_in(self.resource.id_field(), missing.iter().copied());
        let docs = self
            .ctx
            .docs
            .find(self.resource.collection(), &filter, &FindOptions::new())
            .await?;

        let mut batch = KvBatch::new();
        let mut loaded = HashSet::new();
        for doc in &docs {
            if let Some(id) = self.id_of(doc) {
                loaded.insert(id);
                self.stage_detail(&mut batch, id, doc, true);
            }
            found.push(project(doc, fields));
        }
        let placeholder_ttl = Some(self.ctx.config.missing_placeholder_ttl());
        for id in missing.iter().filter(|id| !loaded.contains(*id)) {
            batch.set_nx(self.keys.detail(id), MISSING, placeholder_ttl);
        }
        write_quietly(self.kv(), entity, "write_through", batch).await;

        Ok(found)
    }

    /// Record owning a unique value, e.g. a host's `"10.0.0.1:0"`.
    pub async fn get_by_unique_key(&self, value: &str, fields: &[String]) -> Result<Value, CacheError> {
        let entity = self.entity();
        let Some(filter) = self.resource.unique_filter(value) else {
            return Err(CacheError::InvalidInput(format!("'{}' is not a unique key of {}", value, entity)));
        };
        let index_key = self.keys.unique(value);

        match self.kv().get(&index_key).await {
            Ok(Some(raw)) => match raw.parse::<i64>() {
                Ok(id) => match self.get(id, &[]).await {
                    Ok(doc) if self.resource.unique_values(&doc).iter().any(|v| v == value) => {
                        return Ok(project(&doc, fields));
                    }
                    Ok(_) | Err(CacheError::NotFound { .. }) => {
                        debug!(entity, value, id, "Unique index entry is stale, dropping it");
                        crate::metrics::record_self_heal(entity);
                        if let Err(e) = self.kv().del(&index_key).await {
                            warn!(entity, key = %index_key, error = %e, "Failed to drop stale index entry");
                        }
                    }
                    Err(e) => return Err(e),
                },
                Err(_) => {
                    warn!(entity, key = %index_key, value = %raw, "Corrupt unique index entry");
                    crate::metrics::record_self_heal(entity);
                    if let Err(e) = self.kv().del(&index_key).await {
                        warn!(entity, key = %index_key, error = %e, "Failed to drop corrupt index entry");
                    }
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!(entity, key = %index_key, error = %e, "Cache read failed, reading document store");
                crate::metrics::record_fallback(entity, "kv_error");
            }
        }

        let doc = self
            .ctx
            .docs
            .find_one(self.resource.collection(), &filter, &[])
            .await?
            .ok_or_else(|| CacheError::not_found(entity, value))?;
        if let Some(id) = self.id_of(&doc) {
            let mut batch = KvBatch::new();
            self.stage_detail(&mut batch, id, &doc, true);
            write_quietly(self.kv(), entity, "write_through", batch).await;
        }
        Ok(project(&doc, fields))
    }

    /// One page of records in id order, with the total count.
    pub async fn list_with_page(&self, start: u64, limit: u64, fields: &[String]) -> Result<(u64, Vec<Value>), CacheError> {
        let max = self.ctx.config.max_ids_per_request as u64;
        if limit == 0 || limit > max {
            return Err(CacheError::InvalidInput(format!("page limit must be between 1 and {}, got {}", max, limit)));
        }
        let entity = self.entity();

        match self.read_id_page(start, limit).await {
            Ok(Some((total, ids))) => {
                if ids.is_empty() {
                    return Ok((total, Vec::new()));
                }
                let mut docs = self.list_detail_by_ids(&ids, &[]).await?;
                let id_field = self.resource.id_field();
                docs.sort_by_key(|doc| {
                    lookup_i64(doc, id_field).and_then(|id| ids.iter().position(|wanted| *wanted == id))
                });
                let docs = docs.iter().map(|doc| project(doc, fields)).collect();
                return Ok((total, docs));
            }
            Ok(None) => {
                debug!(entity, "Id list missing, forcing a rebuild");
                self.spawn_rebuild(true);
            }
            Err(e) => {
                warn!(entity, error = %e, "Id list read failed, reading document store");
                crate::metrics::record_fallback(entity, "kv_error");
            }
        }

        let id_field = self.resource.id_field();
        let collection = self.resource.collection();
        let total = self.ctx.docs.count(collection, &Filter::All).await?;
        let options = FindOptions::new()
            .fields(fields)
            .sort_asc(id_field)
            .skip(start)
            .limit(limit);
        let docs = self.ctx.docs.find(collection, &Filter::All, &options).await?;
        Ok((total, docs))
    }

    /// `None` when the id list does not exist.
    async fn read_id_page(&self, start: u64, limit: u64) -> Result<Option<(u64, Vec<i64>)>, CacheError> {
        let id_list = self.keys.id_list();
        let total = self.kv().zcard(&id_list).await?;
        if total == 0 {
            return Ok(None);
        }

        match self.kv().get(&self.keys.id_list_expire()).await {
            Ok(expire) if is_stale(expire.as_deref(), self.ctx.config.id_list_ttl(), unix_now()) => {
                self.spawn_rebuild(false);
            }
            Ok(_) => {}
            Err(e) => debug!(entity = self.entity(), error = %e, "Cannot read id list expire key"),
        }

        if start >= total {
            return Ok(Some((total, Vec::new())));
        }
        let first = i64::try_from(start).unwrap_or(i64::MAX);
        let stop = i64::try_from(start.saturating_add(limit.saturating_sub(1))).unwrap_or(i64::MAX);
        let members = self.kv().zrange(&id_list, first, stop).await?;
        let ids = members
            .iter()
            .filter_map(|member| match member.parse::<i64>() {
                Ok(id) => Some(id),
                Err(_) => {
                    warn!(entity = self.entity(), member = %member, "Malformed id list member");
                    None
                }
            })
            .collect();
        Ok(Some((total, ids)))
    }

    /// Temporary list of a rebuild in progress, if any.
    async fn rebuilding_list(&self) -> Result<Option<String>, CacheError> {
        let temp = self.kv().get(&self.keys.id_list_temp_pointer()).await?;
        Ok(temp.filter(|key| !key.is_empty()))
    }

    fn rebuild_keys(&self) -> RefreshKeys {
        RefreshKeys::new(self.keys.id_list(), self.keys.id_list_expire(), self.keys.id_list_lock())
    }

    fn rebuilder(&self) -> IdListRebuilder {
        IdListRebuilder {
            kv: Arc::clone(&self.ctx.kv),
            docs: Arc::clone(&self.ctx.docs),
            resource: self.resource,
            keys: self.keys.clone(),
            page_size: self.ctx.config.refresh_page_size,
            ttl: self.ctx.config.id_list_ttl(),
        }
    }

    fn spawn_rebuild(&self, force: bool) {
        self.ctx.refresh.try_rebuild(
            self.rebuild_keys(),
            self.ctx.config.id_list_ttl(),
            self.ctx.config.id_list_lock_ttl(),
            force,
            self.rebuilder(),
        );
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Forced refresh
    // ═══════════════════════════════════════════════════════════════════════

    /// Rebuild the id list now, regardless of its age.
    pub async fn refresh_id_list(&self) -> Result<RefreshOutcome, CacheError> {
        self.ctx
            .refresh
            .rebuild_now(
                &self.rebuild_keys(),
                self.ctx.config.id_list_ttl(),
                self.ctx.config.id_list_lock_ttl(),
                true,
                &self.rebuilder(),
            )
            .await
    }

    /// Reload the details of `ids` from the document store. Returns how many
    /// still exist; the rest are evicted.
    pub async fn refresh_detail_by_ids(&self, ids: &[i64]) -> Result<usize, CacheError> {
        check_id_batch(ids, self.ctx.config.max_ids_per_request)?;
        let filter = Filter::is_in(self.resource.id_field(), ids.iter().copied());
        let docs = self
            .ctx
            .docs
            .find(self.resource.collection(), &filter, &FindOptions::new())
            .await?;

        let mut batch = KvBatch::new();
        let mut loaded = HashSet::new();
        for doc in &docs {
            if let Some(id) = self.id_of(doc) {
                loaded.insert(id);
                self.stage_detail(&mut batch, id, doc, false);
            }
        }
        for id in ids.iter().filter(|id| !loaded.contains(*id)) {
            batch.del(self.keys.detail(id));
        }
        self.kv().execute(batch).await?;
        Ok(loaded.len())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Write path
    // ═══════════════════════════════════════════════════════════════════════

    async fn on_upsert(&self, oid: &str, doc: &Value) -> Result<(), CacheError> {
        let id = match required_id(doc, self.resource.id_field()) {
            Ok(id) => id,
            Err(reason) => {
                debug!(entity = self.entity(), oid, %reason, "Dropping upsert");
                crate::metrics::record_event(self.entity(), "upsert", "skipped");
                return Ok(());
            }
        };

        let mut batch = KvBatch::new();
        self.stage_detail(&mut batch, id, doc, false);
        // Only extend a live list; a missing one is rebuilt in full on read.
        if self.kv().exists(&self.keys.id_list()).await? {
            batch.zadd(self.keys.id_list(), vec![(id as f64, id.to_string())]);
        }
        if let Some(temp) = self.rebuilding_list().await? {
            batch
                .zadd(&temp, vec![(id as f64, id.to_string())])
                .expire(&temp, self.ctx.config.id_list_ttl());
        }
        self.kv().execute(batch).await?;
        Ok(())
    }

    async fn on_delete(&self, oid: &str) -> Result<(), CacheError> {
        let Some(doc) = self.ctx.archive.find_deleted(oid, self.resource.collection()).await? else {
            warn!(entity = self.entity(), oid, "Deleted document not archived, cannot evict it");
            return Ok(());
        };
        let Some(id) = self.id_of(&doc) else {
            warn!(entity = self.entity(), oid, "Archived document has no id");
            return Ok(());
        };

        let mut batch = KvBatch::new();
        batch.del(self.keys.detail(id));
        for value in self.resource.unique_values(&doc) {
            batch.del(self.keys.unique(&value));
        }
        batch.zrem(self.keys.id_list(), vec![id.to_string()]);
        if let Some(temp) = self.rebuilding_list().await? {
            batch.zrem(&temp, vec![id.to_string()]);
        }
        self.kv().execute(batch).await?;
        debug!(entity = self.entity(), id, "Evicted deleted record");
        Ok(())
    }
}

#[async_trait]
impl EventHandler for GeneralCache {
    fn entity(&self) -> &str {
        self.resource.entity()
    }

    async fn handle(&self, event: ReflectorEvent) -> Result<(), CacheError> {
        match event {
            ReflectorEvent::Upsert { oid, document } => self.on_upsert(&oid, &document).await,
            ReflectorEvent::Delete { oid } => self.on_delete(&oid).await,
            ReflectorEvent::ListDone => {
                self.kv().set(&self.keys.list_done(), &unix_now().to_string(), None).await?;
                Ok(())
            }
        }
    }
}
