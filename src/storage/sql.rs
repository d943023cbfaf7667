// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL backend of the document store.
//!
//! Documents are schemaless JSON kept as text, one row per `(collection, _id)`.
//! Every write also appends to a change log whose sequence number is the
//! resume token of the change feed, and deletes archive the last body:
//!
//! ```sql
//! CREATE TABLE cmdb_documents (
//!   collection VARCHAR(64),
//!   oid        VARCHAR(64),     -- the document's `_id`
//!   payload    LONGTEXT,        -- JSON as text (sqlx Any driver limitation)
//!   PRIMARY KEY (collection, oid)
//! )
//! CREATE TABLE cmdb_change_log (
//!   seq        BIGINT AUTO_INCREMENT PRIMARY KEY,
//!   collection VARCHAR(64),
//!   oid        VARCHAR(64),
//!   op         VARCHAR(16),     -- insert | update | replace | delete
//!   payload    LONGTEXT NULL,   -- body after the change, NULL for deletes
//!   created_at BIGINT
//! )
//! CREATE TABLE cmdb_del_archive (
//!   oid VARCHAR(64), coll VARCHAR(64), detail LONGTEXT, created_at BIGINT,
//!   PRIMARY KEY (oid, coll)
//! )
//! ```
//!
//! ## Filter pushdown
//!
//! `Eq`, `In` and `Gt` over plain field paths become `JSON_EXTRACT`
//! predicates (`_id` maps to the `oid` column). When the whole filter
//! translates, ordering and paging run in SQL too; otherwise the translated
//! part narrows the scan and the rest is evaluated in process.
//!
//! ## Change feed
//!
//! The feed is a polling reader over `cmdb_change_log` ordered by `seq`. It
//! stops when the receiving side is dropped.

use std::future::Future;
use std::sync::Once;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::traits::{ChangeStream, DeleteArchive, DocumentStore, StorageError};
use crate::document::{Filter, FindOptions, SortOrder, OID_FIELD};
use crate::event::{document_oid, ChangeEvent, ChangeOp, ResumeToken};
use crate::metrics::LatencyTimer;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig};
use crate::resilience::retry::{retry, RetryConfig};

const CIRCUIT_NAME: &str = "sql_documents";

/// Change log rows read per poll.
const WATCH_BATCH: i64 = 500;

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Read a text column. The Any driver reports LONGTEXT as a blob on MySQL.
fn text_column(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<String, _>(column)
        .ok()
        .or_else(|| {
            row.try_get::<Vec<u8>, _>(column)
                .ok()
                .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
        })
}

fn payload_of(row: &AnyRow, column: &str) -> Result<Value, StorageError> {
    let text = text_column(row, column).ok_or_else(|| StorageError::Corruption {
        key: column.to_string(),
        reason: "missing payload".into(),
    })?;
    serde_json::from_str(&text).map_err(|e| StorageError::Corruption {
        key: column.to_string(),
        reason: e.to_string(),
    })
}

pub struct SqlDocumentStore {
    pool: AnyPool,
    is_sqlite: bool,
    circuit: CircuitBreaker,
    poll_interval: Duration,
    stream_capacity: usize,
}

impl SqlDocumentStore {
    /// Create a new SQL store with startup-mode retry (fails fast if config is wrong).
    pub async fn connect(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(20)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(backend)
        })
        .await?;

        let store = Self {
            pool,
            is_sqlite,
            circuit: CircuitBreaker::new(CIRCUIT_NAME, CircuitConfig::aggressive()),
            poll_interval: Duration::from_millis(500),
            stream_capacity: 1024,
        };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    /// Polling interval and buffer size of change streams.
    #[must_use]
    pub fn with_watch_settings(mut self, poll_interval: Duration, stream_capacity: usize) -> Self {
        self.poll_interval = poll_interval;
        self.stream_capacity = stream_capacity.max(1);
        self
    }

    /// Get a clone of the connection pool for sharing with other stores.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    #[must_use]
    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    /// Enable WAL mode so the change feed poller never blocks writers.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        // TEXT/LONGTEXT instead of native JSON: the Any driver has no MySQL
        // JSON mapping. JSON_EXTRACT() still works on text columns.
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS cmdb_documents (
                    collection TEXT NOT NULL,
                    oid TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    PRIMARY KEY (collection, oid)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS cmdb_change_log (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    collection TEXT NOT NULL,
                    oid TEXT NOT NULL,
                    op TEXT NOT NULL,
                    payload TEXT,
                    created_at INTEGER NOT NULL
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_change_log_collection ON cmdb_change_log (collection, seq)",
                r#"
                CREATE TABLE IF NOT EXISTS cmdb_del_archive (
                    oid TEXT NOT NULL,
                    coll TEXT NOT NULL,
                    detail TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    PRIMARY KEY (oid, coll)
                )
                "#,
            ]
        } else {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS cmdb_documents (
                    collection VARCHAR(64) NOT NULL,
                    oid VARCHAR(64) COLLATE utf8mb4_bin NOT NULL,
                    payload LONGTEXT NOT NULL,
                    PRIMARY KEY (collection, oid)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS cmdb_change_log (
                    seq BIGINT AUTO_INCREMENT PRIMARY KEY,
                    collection VARCHAR(64) NOT NULL,
                    oid VARCHAR(64) NOT NULL,
                    op VARCHAR(16) NOT NULL,
                    payload LONGTEXT,
                    created_at BIGINT NOT NULL,
                    INDEX idx_change_log_collection (collection, seq)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS cmdb_del_archive (
                    oid VARCHAR(64) NOT NULL,
                    coll VARCHAR(64) NOT NULL,
                    detail LONGTEXT NOT NULL,
                    created_at BIGINT NOT NULL,
                    PRIMARY KEY (oid, coll),
                    INDEX idx_del_archive_created (created_at)
                )
                "#,
            ]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql).execute(&self.pool).await.map_err(backend)
            })
            .await?;
        }
        Ok(())
    }

    /// Run one read behind the circuit breaker with query retry.
    async fn guarded<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T, StorageError>
    where
        F: Fn(AnyPool) -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let _timer = LatencyTimer::new("sql", operation);
        let config = RetryConfig::query();
        self.circuit
            .call_storage(|| retry(operation, &config, || f(self.pool.clone())))
            .await
    }

    fn upsert_document_sql(&self) -> &'static str {
        if self.is_sqlite {
            "INSERT INTO cmdb_documents (collection, oid, payload) VALUES (?, ?, ?) \
             ON CONFLICT(collection, oid) DO UPDATE SET payload = excluded.payload"
        } else {
            "INSERT INTO cmdb_documents (collection, oid, payload) VALUES (?, ?, ?) \
             ON DUPLICATE KEY UPDATE payload = VALUES(payload)"
        }
    }

    fn upsert_archive_sql(&self) -> &'static str {
        if self.is_sqlite {
            "INSERT INTO cmdb_del_archive (oid, coll, detail, created_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(oid, coll) DO UPDATE SET detail = excluded.detail, created_at = excluded.created_at"
        } else {
            "INSERT INTO cmdb_del_archive (oid, coll, detail, created_at) VALUES (?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE detail = VALUES(detail), created_at = VALUES(created_at)"
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Write path
    // ═══════════════════════════════════════════════════════════════════════

    /// Insert or replace a document, assigning an `_id` when it has none.
    /// Returns the id.
    pub async fn insert(&self, collection: &str, mut doc: Value) -> Result<String, StorageError> {
        let oid = document_oid(&doc).unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        if let Value::Object(map) = &mut doc {
            map.insert(OID_FIELD.to_string(), Value::String(oid.clone()));
        }
        let payload = doc.to_string();

        let mut tx = self.pool.begin().await.map_err(backend)?;
        let existed = sqlx::query("SELECT 1 AS hit FROM cmdb_documents WHERE collection = ? AND oid = ?")
            .bind(collection)
            .bind(&oid)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?
            .is_some();
        sqlx::query(self.upsert_document_sql())
            .bind(collection)
            .bind(&oid)
            .bind(&payload)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        let op = if existed { ChangeOp::Replace } else { ChangeOp::Insert };
        append_change(&mut tx, collection, &oid, op, Some(&payload)).await?;
        tx.commit().await.map_err(backend)?;

        Ok(oid)
    }

    /// Replace the document `oid`. Returns false when it does not exist.
    pub async fn update(&self, collection: &str, oid: &str, mut doc: Value) -> Result<bool, StorageError> {
        if let Value::Object(map) = &mut doc {
            map.insert(OID_FIELD.to_string(), Value::String(oid.to_string()));
        }
        let payload = doc.to_string();

        let mut tx = self.pool.begin().await.map_err(backend)?;
        let updated = sqlx::query("UPDATE cmdb_documents SET payload = ? WHERE collection = ? AND oid = ?")
            .bind(&payload)
            .bind(collection)
            .bind(oid)
            .execute(&mut *tx)
            .await
            .map_err(backend)?
            .rows_affected();
        if updated == 0 {
            tx.rollback().await.map_err(backend)?;
            return Ok(false);
        }
        append_change(&mut tx, collection, oid, ChangeOp::Update, Some(&payload)).await?;
        tx.commit().await.map_err(backend)?;
        Ok(true)
    }

    /// Delete the document `oid`, archiving its last body.
    pub async fn delete(&self, collection: &str, oid: &str) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let row = sqlx::query("SELECT payload FROM cmdb_documents WHERE collection = ? AND oid = ?")
            .bind(collection)
            .bind(oid)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?;
        let Some(row) = row else {
            tx.rollback().await.map_err(backend)?;
            return Ok(false);
        };
        let body = text_column(&row, "payload").unwrap_or_else(|| "{}".to_string());

        sqlx::query("DELETE FROM cmdb_documents WHERE collection = ? AND oid = ?")
            .bind(collection)
            .bind(oid)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        sqlx::query(self.upsert_archive_sql())
            .bind(oid)
            .bind(collection)
            .bind(&body)
            .bind(now_secs())
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        append_change(&mut tx, collection, oid, ChangeOp::Delete, None).await?;
        tx.commit().await.map_err(backend)?;
        Ok(true)
    }

    /// Drop archived bodies older than `retention`. Returns how many went.
    pub async fn purge_archive(&self, retention: Duration) -> Result<u64, StorageError> {
        let cutoff = now_secs() - retention.as_secs() as i64;
        let result = sqlx::query("DELETE FROM cmdb_del_archive WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Filter translation
    // ═══════════════════════════════════════════════════════════════════════

    /// SQL expression of a field, or `None` when the path cannot be pushed down.
    fn column(&self, field: &str, sample: &Value) -> Option<String> {
        if field == OID_FIELD {
            return sample.is_string().then(|| "oid".to_string());
        }
        if !safe_path(field) {
            return None;
        }
        if self.is_sqlite {
            Some(format!("json_extract(payload, '$.{}')", field))
        } else if sample.is_string() {
            Some(format!("JSON_UNQUOTE(JSON_EXTRACT(payload, '$.{}'))", field))
        } else {
            Some(format!("JSON_EXTRACT(payload, '$.{}')", field))
        }
    }

    fn sort_column(&self, field: &str) -> Option<String> {
        if field == OID_FIELD {
            return Some("oid".to_string());
        }
        if !safe_path(field) {
            return None;
        }
        Some(if self.is_sqlite {
            format!("json_extract(payload, '$.{}')", field)
        } else {
            format!("JSON_EXTRACT(payload, '$.{}')", field)
        })
    }

    fn translate(&self, filter: &Filter, out: &mut Translated) {
        match filter {
            Filter::All => {}
            Filter::Eq(field, value) => match (self.column(field, value), SqlBind::of(value)) {
                (Some(column), Some(bind)) => {
                    out.clauses.push(format!("{} = ?", column));
                    out.binds.push(bind);
                }
                _ => out.complete = false,
            },
            Filter::Gt(field, value) => match (self.column(field, value), SqlBind::of(value)) {
                (Some(column), Some(bind)) => {
                    out.clauses.push(format!("{} > ?", column));
                    out.binds.push(bind);
                }
                _ => out.complete = false,
            },
            Filter::In(field, values) => {
                let Some(first) = values.first() else {
                    out.clauses.push("1 = 0".to_string());
                    return;
                };
                let same_kind = values.iter().all(|v| v.is_string() == first.is_string());
                let binds: Option<Vec<SqlBind>> = values.iter().map(SqlBind::of).collect();
                match (same_kind, self.column(field, first), binds) {
                    (true, Some(column), Some(binds)) => {
                        let marks = vec!["?"; binds.len()].join(", ");
                        out.clauses.push(format!("{} IN ({})", column, marks));
                        out.binds.extend(binds);
                    }
                    _ => out.complete = false,
                }
            }
            Filter::Regex(..) => out.complete = false,
            Filter::And(parts) => {
                for part in parts {
                    self.translate(part, out);
                }
            }
        }
    }

    fn where_clause(translated: &Translated) -> String {
        let mut sql = String::from(" WHERE collection = ?");
        for clause in &translated.clauses {
            sql.push_str(" AND ");
            sql.push_str(clause);
        }
        sql
    }
}

/// Field paths are spliced into SQL text, so only plain identifiers pass.
fn safe_path(field: &str) -> bool {
    !field.is_empty()
        && field.split('.').all(|segment| {
            !segment.is_empty() && segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

#[derive(Debug, Clone, PartialEq)]
enum SqlBind {
    Int(i64),
    Float(f64),
    Text(String),
}

impl SqlBind {
    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(SqlBind::Text(s.clone())),
            Value::Number(n) => n
                .as_i64()
                .map(SqlBind::Int)
                .or_else(|| n.as_f64().map(SqlBind::Float)),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Translated {
    clauses: Vec<String>,
    binds: Vec<SqlBind>,
    /// Whether the SQL predicate is exactly the filter.
    complete: bool,
}

impl Translated {
    fn new() -> Self {
        Self {
            clauses: Vec::new(),
            binds: Vec::new(),
            complete: true,
        }
    }
}

fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
    collection: &'q str,
    binds: &'q [SqlBind],
) -> sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>> {
    query = query.bind(collection);
    for bind in binds {
        query = match bind {
            SqlBind::Int(v) => query.bind(*v),
            SqlBind::Float(v) => query.bind(*v),
            SqlBind::Text(v) => query.bind(v.as_str()),
        };
    }
    query
}

async fn append_change(
    tx: &mut sqlx::Transaction<'_, sqlx::Any>,
    collection: &str,
    oid: &str,
    op: ChangeOp,
    payload: Option<&str>,
) -> Result<(), StorageError> {
    sqlx::query("INSERT INTO cmdb_change_log (collection, oid, op, payload, created_at) VALUES (?, ?, ?, ?, ?)")
        .bind(collection)
        .bind(oid)
        .bind(op.as_str())
        .bind(payload.map(str::to_string))
        .bind(now_secs())
        .execute(&mut **tx)
        .await
        .map_err(backend)?;
    Ok(())
}

fn parse_token(token: &ResumeToken) -> Result<i64, StorageError> {
    token.as_str().parse().map_err(|_| StorageError::Corruption {
        key: "resume_token".into(),
        reason: format!("'{}' is not a change log sequence", token),
    })
}

fn event_from_row(row: &AnyRow, collection: &str) -> Result<(i64, ChangeEvent), StorageError> {
    let seq: i64 = row.try_get("seq").map_err(backend)?;
    let oid = text_column(row, "oid").unwrap_or_default();
    let op_text = text_column(row, "op").unwrap_or_default();
    let op = ChangeOp::parse(&op_text).ok_or_else(|| StorageError::Corruption {
        key: format!("cmdb_change_log:{}", seq),
        reason: format!("unknown op '{}'", op_text),
    })?;
    let document = match op {
        ChangeOp::Delete => None,
        _ => Some(payload_of(row, "payload")?),
    };
    Ok((
        seq,
        ChangeEvent {
            op,
            collection: collection.to_string(),
            oid,
            document,
            token: ResumeToken::new(seq.to_string()),
        },
    ))
}

async fn read_changes(pool: &AnyPool, collection: &str, after: i64) -> Result<Vec<AnyRow>, sqlx::Error> {
    sqlx::query(
        "SELECT seq, oid, op, payload FROM cmdb_change_log \
         WHERE collection = ? AND seq > ? ORDER BY seq LIMIT ?",
    )
    .bind(collection)
    .bind(after)
    .bind(WATCH_BATCH)
    .fetch_all(pool)
    .await
}

#[async_trait]
impl DocumentStore for SqlDocumentStore {
    async fn find(&self, collection: &str, filter: &Filter, options: &FindOptions) -> Result<Vec<Value>, StorageError> {
        let mut translated = Translated::new();
        self.translate(filter, &mut translated);

        let sort = match &options.sort {
            Some((field, order)) => self.sort_column(field).map(|column| (column, *order)),
            None => Some(("oid".to_string(), SortOrder::Ascending)),
        };
        let in_sql = translated.complete && sort.is_some();

        let mut sql = format!("SELECT payload FROM cmdb_documents{}", Self::where_clause(&translated));
        if in_sql {
            if let Some((column, order)) = &sort {
                let direction = match order {
                    SortOrder::Ascending => "ASC",
                    SortOrder::Descending => "DESC",
                };
                sql.push_str(&format!(" ORDER BY {} {}", column, direction));
            }
            if options.limit.is_some() || options.skip > 0 {
                let limit = options.limit.map_or(i64::MAX, |l| i64::try_from(l).unwrap_or(i64::MAX));
                sql.push_str(&format!(
                    " LIMIT {} OFFSET {}",
                    limit,
                    i64::try_from(options.skip).unwrap_or(i64::MAX)
                ));
            }
        }

        let sql = sql.as_str();
        let binds = translated.binds.as_slice();
        let rows = self
            .guarded("find", |pool| async move {
                bind_all(sqlx::query(sql), collection, binds).fetch_all(&pool).await
            })
            .await?;

        let mut docs = Vec::with_capacity(rows.len());
        for row in &rows {
            match payload_of(row, "payload") {
                Ok(doc) => docs.push(doc),
                Err(e) => warn!(collection, error = %e, "Skipping unreadable document"),
            }
        }

        if in_sql {
            let projection = FindOptions {
                fields: options.fields.clone(),
                ..FindOptions::default()
            };
            Ok(projection.apply(docs))
        } else {
            debug!(collection, "Filter evaluated in process");
            let matched = docs.into_iter().filter(|doc| filter.matches(doc)).collect();
            Ok(options.apply(matched))
        }
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64, StorageError> {
        let mut translated = Translated::new();
        self.translate(filter, &mut translated);

        if !translated.complete {
            let docs = self.find(collection, filter, &FindOptions::default()).await?;
            return Ok(docs.len() as u64);
        }

        let sql = format!("SELECT COUNT(*) AS cnt FROM cmdb_documents{}", Self::where_clause(&translated));
        let sql = sql.as_str();
        let binds = translated.binds.as_slice();
        let row = self
            .guarded("count", |pool| async move {
                bind_all(sqlx::query(sql), collection, binds).fetch_one(&pool).await
            })
            .await?;
        let count: i64 = row.try_get("cnt").map_err(backend)?;
        Ok(count.max(0) as u64)
    }

    async fn current_token(&self, _collection: &str) -> Result<ResumeToken, StorageError> {
        let row = self
            .guarded("current_token", |pool| async move {
                sqlx::query("SELECT COALESCE(MAX(seq), 0) AS head FROM cmdb_change_log")
                    .fetch_one(&pool)
                    .await
            })
            .await?;
        let head: i64 = row.try_get("head").map_err(backend)?;
        Ok(ResumeToken::new(head.to_string()))
    }

    async fn watch(&self, collection: &str, filter: &Filter, from: ResumeToken) -> Result<ChangeStream, StorageError> {
        let mut cursor = parse_token(&from)?;
        let (tx, rx) = mpsc::channel(self.stream_capacity);
        let pool = self.pool.clone();
        let collection = collection.to_string();
        let filter = filter.clone();
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            loop {
                let polled = tokio::select! {
                    _ = tx.closed() => return,
                    polled = read_changes(&pool, &collection, cursor) => polled,
                };

                let mut full_batch = false;
                match polled {
                    Ok(rows) => {
                        full_batch = rows.len() as i64 == WATCH_BATCH;
                        for row in &rows {
                            let (seq, event) = match event_from_row(row, &collection) {
                                Ok(parsed) => parsed,
                                Err(e) => {
                                    warn!(collection = %collection, error = %e, "Skipping unreadable change");
                                    if let Ok(seq) = row.try_get::<i64, _>("seq") {
                                        cursor = seq;
                                    }
                                    continue;
                                }
                            };
                            cursor = seq;
                            let passes = event.document.as_ref().map_or(true, |doc| filter.matches(doc));
                            if passes && tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!(collection = %collection, error = %e, "Change log poll failed"),
                }

                if full_batch {
                    continue;
                }
                tokio::select! {
                    _ = tx.closed() => return,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        });

        Ok(rx)
    }
}

#[async_trait]
impl DeleteArchive for SqlDocumentStore {
    async fn find_deleted(&self, oid: &str, collection: &str) -> Result<Option<Value>, StorageError> {
        let row = self
            .guarded("find_deleted", |pool| async move {
                sqlx::query("SELECT detail FROM cmdb_del_archive WHERE oid = ? AND coll = ?")
                    .bind(oid)
                    .bind(collection)
                    .fetch_optional(&pool)
                    .await
            })
            .await?;
        row.map(|row| payload_of(&row, "detail")).transpose()
    }
}
