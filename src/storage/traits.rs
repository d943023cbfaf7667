use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::document::{Filter, FindOptions};
use crate::event::{ChangeEvent, ResumeToken};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Data corruption detected for '{key}': {reason}")]
    Corruption { key: String, reason: String },
    #[error("Circuit breaker open for {0}")]
    CircuitOpen(String),
}

/// One write of a pipelined batch.
#[derive(Debug, Clone, PartialEq)]
pub enum KvOp {
    Set { key: String, value: String, ttl: Option<Duration> },
    SetNx { key: String, value: String, ttl: Option<Duration> },
    Del { key: String },
    SAdd { key: String, members: Vec<String> },
    SRem { key: String, members: Vec<String> },
    ZAdd { key: String, members: Vec<(f64, String)> },
    ZRem { key: String, members: Vec<String> },
    Expire { key: String, ttl: Duration },
    Rename { from: String, to: String },
}

/// Ordered list of writes sent to the KV store in one round trip.
///
/// Pipelines buy throughput, not atomicity across keys: a crash midway
/// leaves a prefix applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KvBatch {
    ops: Vec<KvOp>,
}

impl KvBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) -> &mut Self {
        self.ops.push(KvOp::Set { key: key.into(), value: value.into(), ttl });
        self
    }

    pub fn set_nx(&mut self, key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) -> &mut Self {
        self.ops.push(KvOp::SetNx { key: key.into(), value: value.into(), ttl });
        self
    }

    pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(KvOp::Del { key: key.into() });
        self
    }

    pub fn sadd(&mut self, key: impl Into<String>, members: Vec<String>) -> &mut Self {
        if !members.is_empty() {
            self.ops.push(KvOp::SAdd { key: key.into(), members });
        }
        self
    }

    pub fn srem(&mut self, key: impl Into<String>, members: Vec<String>) -> &mut Self {
        if !members.is_empty() {
            self.ops.push(KvOp::SRem { key: key.into(), members });
        }
        self
    }

    pub fn zadd(&mut self, key: impl Into<String>, members: Vec<(f64, String)>) -> &mut Self {
        if !members.is_empty() {
            self.ops.push(KvOp::ZAdd { key: key.into(), members });
        }
        self
    }

    pub fn zrem(&mut self, key: impl Into<String>, members: Vec<String>) -> &mut Self {
        if !members.is_empty() {
            self.ops.push(KvOp::ZRem { key: key.into(), members });
        }
        self
    }

    pub fn expire(&mut self, key: impl Into<String>, ttl: Duration) -> &mut Self {
        self.ops.push(KvOp::Expire { key: key.into(), ttl });
        self
    }

    pub fn rename(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.ops.push(KvOp::Rename { from: from.into(), to: to.into() });
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[must_use]
    pub fn ops(&self) -> &[KvOp] {
        &self.ops
    }

    #[must_use]
    pub fn into_ops(self) -> Vec<KvOp> {
        self.ops
    }
}

/// The key-value store the cache lives in.
///
/// Reads are individual calls; every write goes through [`KvStore::execute`]
/// so a cache update costs one round trip.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StorageError>;
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Atomic set-if-absent with expiry. Returns whether the key was set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StorageError>;

    /// Members by rank, `stop` inclusive, negative indexes count from the end.
    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StorageError>;

    /// Up to `limit` members with a score strictly greater than `min`.
    async fn zrange_by_score_after(&self, key: &str, min: f64, limit: usize) -> Result<Vec<String>, StorageError>;

    async fn zcard(&self, key: &str) -> Result<u64, StorageError>;

    async fn execute(&self, batch: KvBatch) -> Result<(), StorageError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        let mut batch = KvBatch::new();
        batch.set(key, value, ttl);
        self.execute(batch).await
    }

    async fn del(&self, key: &str) -> Result<(), StorageError> {
        let mut batch = KvBatch::new();
        batch.del(key);
        self.execute(batch).await
    }
}

/// Receiving end of a change feed subscription. Closed when the feed ends.
pub type ChangeStream = mpsc::Receiver<ChangeEvent>;

/// The authoritative document store, read-only from the cache's point of view.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find(&self, collection: &str, filter: &Filter, options: &FindOptions) -> Result<Vec<Value>, StorageError>;

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StorageError>;

    /// Current head of a collection's change feed.
    async fn current_token(&self, collection: &str) -> Result<ResumeToken, StorageError>;

    /// Subscribe to changes strictly after `from`, restricted to documents
    /// matching `filter` (deletes always pass, they carry no body).
    async fn watch(&self, collection: &str, filter: &Filter, from: ResumeToken) -> Result<ChangeStream, StorageError>;

    async fn find_one(&self, collection: &str, filter: &Filter, fields: &[String]) -> Result<Option<Value>, StorageError> {
        let options = FindOptions {
            fields: fields.to_vec(),
            limit: Some(1),
            ..FindOptions::default()
        };
        Ok(self.find(collection, filter, &options).await?.into_iter().next())
    }
}

/// Bodies of deleted documents, keyed by (document id, source collection).
///
/// Populated by the authoritative write path with a bounded retention.
#[async_trait]
pub trait DeleteArchive: Send + Sync {
    async fn find_deleted(&self, oid: &str, collection: &str) -> Result<Option<Value>, StorageError>;
}
