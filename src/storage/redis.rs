// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis backend of the KV store.
//!
//! Data layout per key kind (see [`crate::keys`]):
//!
//! ```text
//! detail, expire, lock, oid, unique   STRING   SET key value [PX ttl] [NX]
//! list                                SET      SADD / SREM / SMEMBERS
//! id_list                             ZSET     ZADD / ZREM / ZRANGE / ZRANGEBYSCORE
//! ```
//!
//! Every call runs through the `redis_kv` circuit breaker and a short query
//! retry. Batches are sent as one non-transactional pipeline.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, Client, Pipeline, RedisError};

use super::traits::{KvBatch, KvOp, KvStore, StorageError};
use crate::metrics::LatencyTimer;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig};
use crate::resilience::retry::{retry, RetryConfig};

const CIRCUIT_NAME: &str = "redis_kv";

pub struct RedisKv {
    connection: ConnectionManager,
    circuit: CircuitBreaker,
}

impl RedisKv {
    /// Connect with startup-mode retry (fails fast if config is wrong).
    pub async fn connect(connection_string: &str) -> Result<Self, StorageError> {
        let client = Client::open(connection_string)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: RedisError| StorageError::Backend(e.to_string()))?;

        Ok(Self {
            connection,
            circuit: CircuitBreaker::new(CIRCUIT_NAME, CircuitConfig::lenient()),
        })
    }

    /// Get a clone of the connection manager.
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    #[must_use]
    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    /// Run one Redis call behind the circuit breaker with query retry.
    async fn guarded<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T, StorageError>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: Future<Output = Result<T, RedisError>>,
    {
        let _timer = LatencyTimer::new("redis", operation);
        let config = RetryConfig::query();
        self.circuit
            .call_storage(|| retry(operation, &config, || f(self.connection.clone())))
            .await
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Append one batch op to the pipeline; replies are discarded.
fn push_op(pipeline: &mut Pipeline, op: &KvOp) {
    match op {
        KvOp::Set { key, value, ttl } => {
            pipeline.cmd("SET").arg(key).arg(value);
            if let Some(ttl) = ttl {
                pipeline.arg("PX").arg(millis(*ttl));
            }
        }
        KvOp::SetNx { key, value, ttl } => {
            pipeline.cmd("SET").arg(key).arg(value).arg("NX");
            if let Some(ttl) = ttl {
                pipeline.arg("PX").arg(millis(*ttl));
            }
        }
        KvOp::Del { key } => {
            pipeline.cmd("DEL").arg(key);
        }
        KvOp::SAdd { key, members } => {
            pipeline.cmd("SADD").arg(key).arg(members);
        }
        KvOp::SRem { key, members } => {
            pipeline.cmd("SREM").arg(key).arg(members);
        }
        KvOp::ZAdd { key, members } => {
            pipeline.cmd("ZADD").arg(key);
            for (score, member) in members {
                pipeline.arg(*score).arg(member);
            }
        }
        KvOp::ZRem { key, members } => {
            pipeline.cmd("ZREM").arg(key).arg(members);
        }
        KvOp::Expire { key, ttl } => {
            pipeline.cmd("PEXPIRE").arg(key).arg(millis(*ttl));
        }
        KvOp::Rename { from, to } => {
            pipeline.cmd("RENAME").arg(from).arg(to);
        }
    }
    pipeline.ignore();
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.guarded("get", |mut conn| async move {
            cmd("GET").arg(key).query_async::<Option<String>>(&mut conn).await
        })
        .await
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StorageError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.guarded("mget", |mut conn| async move {
            cmd("MGET").arg(keys).query_async::<Vec<Option<String>>>(&mut conn).await
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.guarded("exists", |mut conn| async move {
            cmd("EXISTS").arg(key).query_async::<bool>(&mut conn).await
        })
        .await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError> {
        let reply: Option<String> = self
            .guarded("set_nx", |mut conn| async move {
                cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(millis(ttl))
                    .query_async::<Option<String>>(&mut conn)
                    .await
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StorageError> {
        self.guarded("smembers", |mut conn| async move {
            cmd("SMEMBERS").arg(key).query_async::<Vec<String>>(&mut conn).await
        })
        .await
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StorageError> {
        self.guarded("zrange", |mut conn| async move {
            cmd("ZRANGE")
                .arg(key)
                .arg(start)
                .arg(stop)
                .query_async::<Vec<String>>(&mut conn)
                .await
        })
        .await
    }

    async fn zrange_by_score_after(&self, key: &str, min: f64, limit: usize) -> Result<Vec<String>, StorageError> {
        self.guarded("zrangebyscore", |mut conn| async move {
            cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg(format!("({}", min))
                .arg("+inf")
                .arg("LIMIT")
                .arg(0)
                .arg(limit)
                .query_async::<Vec<String>>(&mut conn)
                .await
        })
        .await
    }

    async fn zcard(&self, key: &str) -> Result<u64, StorageError> {
        self.guarded("zcard", |mut conn| async move {
            cmd("ZCARD").arg(key).query_async::<u64>(&mut conn).await
        })
        .await
    }

    async fn execute(&self, batch: KvBatch) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut pipeline = pipe();
        for op in batch.ops() {
            push_op(&mut pipeline, op);
        }
        let pipeline = &pipeline;
        self.guarded("pipeline", |mut conn| async move {
            pipeline.query_async::<()>(&mut conn).await
        })
        .await
    }
}
