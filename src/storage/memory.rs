//! In-memory backends for tests and embedded use.
//!
//! [`InMemoryKv`] mimics the subset of Redis the cache relies on, including
//! expiry and set-if-absent. [`InMemoryDocumentStore`] keeps collections in
//! memory, records every write in a sequenced change log and serves resumable
//! change streams from it. Its write methods play the authoritative write
//! path: they also fill the delete archive.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::traits::{ChangeStream, DeleteArchive, DocumentStore, KvBatch, KvOp, KvStore, StorageError};
use crate::document::{Filter, FindOptions, OID_FIELD};
use crate::event::{document_oid, ChangeEvent, ChangeOp, ResumeToken};

// ═══════════════════════════════════════════════════════════════════════════
// Key-value store
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
enum KvValue {
    Str(String),
    Set(HashSet<String>),
    ZSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: KvValue,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: KvValue, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

fn wrong_type(key: &str) -> StorageError {
    StorageError::Backend(format!(
        "WRONGTYPE operation against key '{}' holding the wrong kind of value",
        key
    ))
}

pub struct InMemoryKv {
    data: DashMap<String, Slot>,
    offline: AtomicBool,
    write_ops: AtomicU64,
}

impl InMemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            offline: AtomicBool::new(false),
            write_ops: AtomicU64::new(0),
        }
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.iter().filter(|slot| slot.is_live()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live keys starting with `prefix`, sorted.
    #[must_use]
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .data
            .iter()
            .filter(|slot| slot.is_live() && slot.key().starts_with(prefix))
            .map(|slot| slot.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Remaining time to live of a key, `None` when absent or persistent.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let slot = self.data.get(key)?;
        let at = slot.expires_at?;
        at.checked_duration_since(Instant::now())
    }

    /// Total individual writes applied so far.
    #[must_use]
    pub fn write_ops(&self) -> u64 {
        self.write_ops.load(Ordering::Relaxed)
    }

    /// Simulate an outage: every call fails while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.data.clear();
    }

    fn check_online(&self) -> Result<(), StorageError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("in-memory kv is offline".into()));
        }
        Ok(())
    }

    fn live_value(&self, key: &str) -> Option<KvValue> {
        let slot = self.data.get(key)?;
        if slot.is_live() {
            Some(slot.value.clone())
        } else {
            drop(slot);
            self.data.remove_if(key, |_, slot| !slot.is_live());
            None
        }
    }

    fn get_str(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self.live_value(key) {
            None => Ok(None),
            Some(KvValue::Str(s)) => Ok(Some(s)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn sorted_zset(&self, key: &str) -> Result<Vec<(String, f64)>, StorageError> {
        match self.live_value(key) {
            None => Ok(Vec::new()),
            Some(KvValue::ZSet(members)) => {
                let mut sorted: Vec<(String, f64)> = members.into_iter().collect();
                sorted.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                Ok(sorted)
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn apply(&self, op: KvOp) -> Result<(), StorageError> {
        self.write_ops.fetch_add(1, Ordering::Relaxed);
        match op {
            KvOp::Set { key, value, ttl } => {
                self.data.insert(key, Slot::new(KvValue::Str(value), ttl));
            }
            KvOp::SetNx { key, value, ttl } => {
                self.insert_if_absent(key, value, ttl);
            }
            KvOp::Del { key } => {
                self.data.remove(&key);
            }
            KvOp::SAdd { key, members } => {
                let mut slot = self.collection_slot(&key, || KvValue::Set(HashSet::new()));
                match &mut slot.value {
                    KvValue::Set(set) => set.extend(members),
                    _ => return Err(wrong_type(&key)),
                }
            }
            KvOp::SRem { key, members } => {
                let emptied = match self.data.get_mut(&key) {
                    Some(mut slot) => match &mut slot.value {
                        KvValue::Set(set) => {
                            for member in &members {
                                set.remove(member);
                            }
                            set.is_empty()
                        }
                        _ => return Err(wrong_type(&key)),
                    },
                    None => false,
                };
                if emptied {
                    self.data.remove(&key);
                }
            }
            KvOp::ZAdd { key, members } => {
                let mut slot = self.collection_slot(&key, || KvValue::ZSet(HashMap::new()));
                match &mut slot.value {
                    KvValue::ZSet(zset) => {
                        for (score, member) in members {
                            zset.insert(member, score);
                        }
                    }
                    _ => return Err(wrong_type(&key)),
                }
            }
            KvOp::ZRem { key, members } => {
                let emptied = match self.data.get_mut(&key) {
                    Some(mut slot) => match &mut slot.value {
                        KvValue::ZSet(zset) => {
                            for member in &members {
                                zset.remove(member);
                            }
                            zset.is_empty()
                        }
                        _ => return Err(wrong_type(&key)),
                    },
                    None => false,
                };
                if emptied {
                    self.data.remove(&key);
                }
            }
            KvOp::Expire { key, ttl } => {
                if let Some(mut slot) = self.data.get_mut(&key) {
                    slot.expires_at = Some(Instant::now() + ttl);
                }
            }
            KvOp::Rename { from, to } => {
                let Some((_, slot)) = self.data.remove(&from) else {
                    return Err(StorageError::Backend(format!("ERR no such key '{}'", from)));
                };
                if slot.is_live() {
                    self.data.insert(to, slot);
                } else {
                    return Err(StorageError::Backend(format!("ERR no such key '{}'", from)));
                }
            }
        }
        Ok(())
    }

    fn insert_if_absent(&self, key: String, value: String, ttl: Option<Duration>) -> bool {
        match self.data.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live() {
                    false
                } else {
                    occupied.insert(Slot::new(KvValue::Str(value), ttl));
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new(KvValue::Str(value), ttl));
                true
            }
        }
    }

    /// Live slot for a set-like key, replacing an expired one.
    fn collection_slot(
        &self,
        key: &str,
        empty: impl FnOnce() -> KvValue,
    ) -> dashmap::mapref::one::RefMut<'_, String, Slot> {
        let mut slot = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(empty(), None));
        if !slot.is_live() {
            let value = match slot.value {
                KvValue::Set(_) => KvValue::Set(HashSet::new()),
                KvValue::ZSet(_) => KvValue::ZSet(HashMap::new()),
                KvValue::Str(_) => KvValue::Str(String::new()),
            };
            *slot = Slot::new(value, None);
        }
        slot
    }
}

impl Default for InMemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check_online()?;
        self.get_str(key)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StorageError> {
        self.check_online()?;
        // MGET answers nil for keys of another type.
        Ok(keys.iter().map(|key| self.get_str(key).ok().flatten()).collect())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.check_online()?;
        Ok(self.live_value(key).is_some())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError> {
        self.check_online()?;
        self.write_ops.fetch_add(1, Ordering::Relaxed);
        Ok(self.insert_if_absent(key.to_string(), value.to_string(), Some(ttl)))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StorageError> {
        self.check_online()?;
        match self.live_value(key) {
            None => Ok(Vec::new()),
            Some(KvValue::Set(set)) => {
                let mut members: Vec<String> = set.into_iter().collect();
                members.sort();
                Ok(members)
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StorageError> {
        self.check_online()?;
        let sorted = self.sorted_zset(key)?;
        let len = sorted.len() as i64;
        let normalize = |i: i64| if i < 0 { (len + i).max(0) } else { i };
        let (start, stop) = (normalize(start), normalize(stop).min(len - 1));
        if len == 0 || start > stop {
            return Ok(Vec::new());
        }
        Ok(sorted
            .into_iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .map(|(member, _)| member)
            .collect())
    }

    async fn zrange_by_score_after(&self, key: &str, min: f64, limit: usize) -> Result<Vec<String>, StorageError> {
        self.check_online()?;
        Ok(self
            .sorted_zset(key)?
            .into_iter()
            .filter(|(_, score)| *score > min)
            .take(limit)
            .map(|(member, _)| member)
            .collect())
    }

    async fn zcard(&self, key: &str) -> Result<u64, StorageError> {
        self.check_online()?;
        Ok(self.sorted_zset(key)?.len() as u64)
    }

    async fn execute(&self, batch: KvBatch) -> Result<(), StorageError> {
        self.check_online()?;
        for op in batch.into_ops() {
            self.apply(op)?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Document store
// ═══════════════════════════════════════════════════════════════════════════

/// Change log entries kept for resuming streams.
const LOG_RETENTION: usize = 100_000;

struct ChangeLog {
    seq: u64,
    events: VecDeque<(u64, ChangeEvent)>,
}

impl ChangeLog {
    fn after(&self, collection: &str, after: u64) -> Vec<(u64, ChangeEvent)> {
        self.events
            .iter()
            .filter(|(seq, event)| *seq > after && event.collection == collection)
            .cloned()
            .collect()
    }
}

pub struct InMemoryDocumentStore {
    collections: DashMap<String, BTreeMap<String, Value>>,
    archive: DashMap<(String, String), Value>,
    log: Arc<Mutex<ChangeLog>>,
    feed: broadcast::Sender<(u64, ChangeEvent)>,
    find_calls: AtomicU64,
    stream_capacity: usize,
}

impl InMemoryDocumentStore {
    #[must_use]
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(4096);
        Self {
            collections: DashMap::new(),
            archive: DashMap::new(),
            log: Arc::new(Mutex::new(ChangeLog {
                seq: 0,
                events: VecDeque::new(),
            })),
            feed,
            find_calls: AtomicU64::new(0),
            stream_capacity: 1024,
        }
    }

    /// Number of `find`/`count` calls served so far.
    #[must_use]
    pub fn find_calls(&self) -> u64 {
        self.find_calls.load(Ordering::Relaxed)
    }

    /// Insert a document, assigning an `_id` when it has none. Returns the id.
    pub fn insert(&self, collection: &str, mut doc: Value) -> String {
        let oid = document_oid(&doc).unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        if let Value::Object(map) = &mut doc {
            map.insert(OID_FIELD.to_string(), Value::String(oid.clone()));
        }
        let existed = self
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(oid.clone(), doc.clone())
            .is_some();
        let op = if existed { ChangeOp::Replace } else { ChangeOp::Insert };
        self.record(op, collection, &oid, Some(doc));
        oid
    }

    /// Replace the document `oid`. Returns false when it does not exist.
    pub fn update(&self, collection: &str, oid: &str, mut doc: Value) -> bool {
        if let Value::Object(map) = &mut doc {
            map.insert(OID_FIELD.to_string(), Value::String(oid.to_string()));
        }
        let updated = match self.collections.get_mut(collection) {
            Some(mut docs) => match docs.get_mut(oid) {
                Some(slot) => {
                    *slot = doc.clone();
                    true
                }
                None => false,
            },
            None => false,
        };
        if updated {
            self.record(ChangeOp::Update, collection, oid, Some(doc));
        }
        updated
    }

    /// Delete the document `oid`, archiving its last body.
    pub fn delete(&self, collection: &str, oid: &str) -> bool {
        let removed = self
            .collections
            .get_mut(collection)
            .and_then(|mut docs| docs.remove(oid));
        match removed {
            Some(body) => {
                self.archive.insert((oid.to_string(), collection.to_string()), body);
                self.record(ChangeOp::Delete, collection, oid, None);
                true
            }
            None => false,
        }
    }

    /// Drop archived bodies, as the retention job of the write path would.
    pub fn purge_archive(&self) {
        self.archive.clear();
    }

    fn record(&self, op: ChangeOp, collection: &str, oid: &str, document: Option<Value>) {
        let mut log = self.log.lock();
        log.seq += 1;
        let seq = log.seq;
        let event = ChangeEvent {
            op,
            collection: collection.to_string(),
            oid: oid.to_string(),
            document,
            token: ResumeToken::new(seq.to_string()),
        };
        log.events.push_back((seq, event.clone()));
        while log.events.len() > LOG_RETENTION {
            log.events.pop_front();
        }
        // No subscribers is fine, the log serves late joiners.
        let _ = self.feed.send((seq, event));
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_token(token: &ResumeToken) -> Result<u64, StorageError> {
    token
        .as_str()
        .parse()
        .map_err(|_| StorageError::Backend(format!("invalid resume token '{}'", token)))
}

fn passes(filter: &Filter, event: &ChangeEvent) -> bool {
    match &event.document {
        Some(doc) => filter.matches(doc),
        None => true,
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn find(&self, collection: &str, filter: &Filter, options: &FindOptions) -> Result<Vec<Value>, StorageError> {
        self.find_calls.fetch_add(1, Ordering::Relaxed);
        let matched: Vec<Value> = match self.collections.get(collection) {
            Some(docs) => docs.values().filter(|doc| filter.matches(doc)).cloned().collect(),
            None => Vec::new(),
        };
        Ok(options.apply(matched))
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StorageError> {
        self.find_calls.fetch_add(1, Ordering::Relaxed);
        Ok(match self.collections.get(collection) {
            Some(docs) => docs.values().filter(|doc| filter.matches(doc)).count() as u64,
            None => 0,
        })
    }

    async fn current_token(&self, _collection: &str) -> Result<ResumeToken, StorageError> {
        Ok(ResumeToken::new(self.log.lock().seq.to_string()))
    }

    async fn watch(&self, collection: &str, filter: &Filter, from: ResumeToken) -> Result<ChangeStream, StorageError> {
        let after = parse_token(&from)?;
        let (tx, rx) = mpsc::channel(self.stream_capacity);

        // Subscribe before replaying so nothing falls between the two.
        let mut live = self.feed.subscribe();
        let backlog = self.log.lock().after(collection, after);
        let log = Arc::clone(&self.log);
        let collection = collection.to_string();
        let filter = filter.clone();

        tokio::spawn(async move {
            let mut last = after;
            for (seq, event) in backlog {
                last = seq;
                if passes(&filter, &event) && tx.send(event).await.is_err() {
                    return;
                }
            }
            loop {
                tokio::select! {
                    _ = tx.closed() => return,
                    received = live.recv() => match received {
                        Ok((seq, event)) => {
                            if seq <= last || event.collection != collection {
                                continue;
                            }
                            last = seq;
                            if passes(&filter, &event) && tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(collection = %collection, skipped, "Change stream lagged, replaying from log");
                            let missed = log.lock().after(&collection, last);
                            for (seq, event) in missed {
                                last = seq;
                                if passes(&filter, &event) && tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[async_trait]
impl DeleteArchive for InMemoryDocumentStore {
    async fn find_deleted(&self, oid: &str, collection: &str) -> Result<Option<Value>, StorageError> {
        Ok(self
            .archive
            .get(&(oid.to_string(), collection.to_string()))
            .map(|body| body.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let kv = InMemoryKv::new();
        assert!(kv.is_empty());
        assert_eq!(kv.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_get_del() {
        let kv = InMemoryKv::new();
        kv.set("a", "1", None).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap().as_deref(), Some("1"));
        kv.del("a").await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expiry() {
        let kv = InMemoryKv::new();
        kv.set("short", "x", Some(Duration::from_millis(20))).await.unwrap();
        assert!(kv.exists("short").await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!kv.exists("short").await.unwrap());
        assert_eq!(kv.get("short").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_nx_only_once() {
        let kv = InMemoryKv::new();
        assert!(kv.set_nx("lock", "1", Duration::from_secs(15)).await.unwrap());
        assert!(!kv.set_nx("lock", "1", Duration::from_secs(15)).await.unwrap());
        assert!(kv.ttl("lock").is_some());
    }

    #[tokio::test]
    async fn test_set_nx_after_expiry() {
        let kv = InMemoryKv::new();
        assert!(kv.set_nx("lock", "1", Duration::from_millis(10)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(kv.set_nx("lock", "2", Duration::from_secs(1)).await.unwrap());
        assert_eq!(kv.get("lock").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_concurrent_set_nx_single_winner() {
        let kv = Arc::new(InMemoryKv::new());
        let mut handles = vec![];
        for _ in 0..32 {
            let kv = kv.clone();
            handles.push(tokio::spawn(async move {
                kv.set_nx("contended", "1", Duration::from_secs(5)).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_set_members() {
        let kv = InMemoryKv::new();
        let mut batch = KvBatch::new();
        batch.sadd("s", vec!["b".into(), "a".into()]);
        kv.execute(batch).await.unwrap();
        assert_eq!(kv.smembers("s").await.unwrap(), vec!["a", "b"]);

        let mut batch = KvBatch::new();
        batch.srem("s", vec!["a".into(), "b".into()]);
        kv.execute(batch).await.unwrap();
        assert!(!kv.exists("s").await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_type_is_an_error() {
        let kv = InMemoryKv::new();
        kv.set("s", "plain", None).await.unwrap();
        assert!(kv.smembers("s").await.is_err());
        let mut batch = KvBatch::new();
        batch.sadd("s", vec!["x".into()]);
        assert!(kv.execute(batch).await.is_err());
    }

    #[tokio::test]
    async fn test_sorted_set_ranges() {
        let kv = InMemoryKv::new();
        let mut batch = KvBatch::new();
        batch.zadd("z", vec![(3.0, "3".into()), (1.0, "1".into()), (2.0, "2".into())]);
        kv.execute(batch).await.unwrap();

        assert_eq!(kv.zrange("z", 0, -1).await.unwrap(), vec!["1", "2", "3"]);
        assert_eq!(kv.zrange("z", 1, 1).await.unwrap(), vec!["2"]);
        assert_eq!(kv.zrange("z", 5, 10).await.unwrap(), Vec::<String>::new());
        assert_eq!(kv.zrange_by_score_after("z", 1.0, 10).await.unwrap(), vec!["2", "3"]);
        assert_eq!(kv.zcard("z").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_rename_replaces_target() {
        let kv = InMemoryKv::new();
        let mut batch = KvBatch::new();
        batch.zadd("old", vec![(1.0, "1".into())]).zadd("tmp", vec![(2.0, "2".into())]);
        batch.rename("tmp", "old");
        kv.execute(batch).await.unwrap();
        assert_eq!(kv.zrange("old", 0, -1).await.unwrap(), vec!["2"]);
        assert!(!kv.exists("tmp").await.unwrap());

        let mut batch = KvBatch::new();
        batch.rename("missing", "old");
        assert!(kv.execute(batch).await.is_err());
    }

    #[tokio::test]
    async fn test_offline_fails_every_call() {
        let kv = InMemoryKv::new();
        kv.set_offline(true);
        assert!(kv.get("a").await.is_err());
        assert!(kv.set("a", "1", None).await.is_err());
        kv.set_offline(false);
        assert!(kv.set("a", "1", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_documents_find_and_count() {
        let docs = InMemoryDocumentStore::new();
        docs.insert("cc_SetBase", json!({"bk_set_id": 1, "bk_biz_id": 5}));
        docs.insert("cc_SetBase", json!({"bk_set_id": 2, "bk_biz_id": 6}));

        let found = docs
            .find("cc_SetBase", &Filter::eq("bk_biz_id", 5), &FindOptions::new())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(docs.count("cc_SetBase", &Filter::All).await.unwrap(), 2);
        assert_eq!(docs.count("cc_Unknown", &Filter::All).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_fills_archive() {
        let docs = InMemoryDocumentStore::new();
        let oid = docs.insert("cc_HostBase", json!({"bk_host_id": 9}));
        assert!(docs.delete("cc_HostBase", &oid));
        assert!(!docs.delete("cc_HostBase", &oid));

        let body = docs.find_deleted(&oid, "cc_HostBase").await.unwrap().unwrap();
        assert_eq!(body["bk_host_id"], 9);
        assert!(docs.find_deleted(&oid, "cc_SetBase").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_watch_replays_then_streams() {
        let docs = InMemoryDocumentStore::new();
        let start = docs.current_token("c").await.unwrap();
        docs.insert("c", json!({"_id": "a", "v": 1}));

        let mut stream = docs.watch("c", &Filter::All, start).await.unwrap();
        let first = stream.recv().await.unwrap();
        assert_eq!(first.op, ChangeOp::Insert);
        assert_eq!(first.oid, "a");

        docs.update("c", "a", json!({"v": 2}));
        docs.insert("other", json!({"_id": "x"}));
        docs.delete("c", "a");

        let second = stream.recv().await.unwrap();
        assert_eq!(second.op, ChangeOp::Update);
        assert_eq!(second.document.as_ref().unwrap()["v"], 2);
        let third = stream.recv().await.unwrap();
        assert_eq!(third.op, ChangeOp::Delete);
        assert!(third.document.is_none());
    }

    #[tokio::test]
    async fn test_watch_resumes_after_token() {
        let docs = InMemoryDocumentStore::new();
        docs.insert("c", json!({"_id": "a"}));
        let mid = docs.current_token("c").await.unwrap();
        docs.insert("c", json!({"_id": "b"}));

        let mut stream = docs.watch("c", &Filter::All, mid).await.unwrap();
        assert_eq!(stream.recv().await.unwrap().oid, "b");
    }

    #[tokio::test]
    async fn test_watch_filters_upserts_but_not_deletes() {
        let docs = InMemoryDocumentStore::new();
        let start = docs.current_token("c").await.unwrap();
        docs.insert("c", json!({"_id": "a", "bk_obj_id": "zone"}));
        docs.insert("c", json!({"_id": "b", "bk_obj_id": "region"}));
        docs.delete("c", "a");

        let mut stream = docs
            .watch("c", &Filter::eq("bk_obj_id", "region"), start)
            .await
            .unwrap();
        assert_eq!(stream.recv().await.unwrap().oid, "b");
        let delete = stream.recv().await.unwrap();
        assert_eq!((delete.op, delete.oid.as_str()), (ChangeOp::Delete, "a"));
    }
}
