// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change feed events and typed decoding at the ingestion boundary.
//!
//! Documents arrive schemaless. Each cache decodes the fields it needs into a
//! typed record exactly once, here, and gets back a [`Decoded`]:
//!
//! ```text
//! document ──decode──► Decoded::Ok(record)   apply to the cache
//!                  └─► Decoded::Skip(reason)  log at debug, drop the event
//! ```
//!
//! A skipped event never touches the cache, so a half-valid document can not
//! corrupt a list or a detail record.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::document::{lookup, lookup_i64, lookup_str, OID_FIELD};

/// Kind of change reported by the document store feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOp {
    Insert,
    Update,
    Replace,
    Delete,
}

impl ChangeOp {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Insert => "insert",
            ChangeOp::Update => "update",
            ChangeOp::Replace => "replace",
            ChangeOp::Delete => "delete",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(ChangeOp::Insert),
            "update" => Some(ChangeOp::Update),
            "replace" => Some(ChangeOp::Replace),
            "delete" => Some(ChangeOp::Delete),
            _ => None,
        }
    }

    /// Insert, update and replace all resolve to an upsert of the cache.
    #[must_use]
    pub fn is_upsert(&self) -> bool {
        !matches!(self, ChangeOp::Delete)
    }
}

/// Opaque position in a collection's change feed.
///
/// Tokens are ordered by the store that issued them; the cache only stores
/// and hands them back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResumeToken(pub String);

impl ResumeToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One notification from the change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub collection: String,
    /// Document id (`_id`) of the changed document.
    pub oid: String,
    /// Full document after the change; `None` for deletes.
    pub document: Option<Value>,
    /// Feed position just after this event.
    pub token: ResumeToken,
}

// ═══════════════════════════════════════════════════════════════════════════
// Decoding
// ═══════════════════════════════════════════════════════════════════════════

/// Why an event was dropped at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("missing field {0}")]
    MissingField(String),
    #[error("field {field} has invalid id {value}")]
    InvalidId { field: String, value: String },
    #[error("field {0} is empty")]
    EmptyName(String),
    #[error("filtered out: {0}")]
    Filtered(String),
}

/// Result of decoding a schemaless document into a typed record.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    Ok(T),
    Skip(SkipReason),
}

impl<T> Decoded<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Decoded<U> {
        match self {
            Decoded::Ok(v) => Decoded::Ok(f(v)),
            Decoded::Skip(reason) => Decoded::Skip(reason),
        }
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Decoded::Ok(v) => Some(v),
            Decoded::Skip(_) => None,
        }
    }
}

/// Read a strictly positive id; absent and zero ids both skip.
pub fn required_id(doc: &Value, field: &str) -> Result<i64, SkipReason> {
    match lookup_i64(doc, field) {
        Some(id) if id > 0 => Ok(id),
        Some(id) => Err(SkipReason::InvalidId {
            field: field.to_string(),
            value: id.to_string(),
        }),
        None => match lookup(doc, field) {
            Some(raw) => Err(SkipReason::InvalidId {
                field: field.to_string(),
                value: raw.to_string(),
            }),
            None => Err(SkipReason::MissingField(field.to_string())),
        },
    }
}

pub fn required_name(doc: &Value, field: &str) -> Result<String, SkipReason> {
    match lookup_str(doc, field) {
        Some(name) if !name.trim().is_empty() => Ok(name.to_string()),
        Some(_) => Err(SkipReason::EmptyName(field.to_string())),
        None => Err(SkipReason::MissingField(field.to_string())),
    }
}

/// Document id of a document, if it carries one.
#[must_use]
pub fn document_oid(doc: &Value) -> Option<String> {
    match lookup(doc, OID_FIELD)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Field names of one business-hierarchy instance type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceFields {
    pub id: &'static str,
    pub name: &'static str,
    /// Parent instance id; `None` for the root level.
    pub parent: Option<&'static str>,
    /// Business id scoping the base list; `None` means one global list.
    pub scope: Option<&'static str>,
}

/// Typed view of a biz, set, module or custom level instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: i64,
    pub name: String,
    pub parent_id: i64,
    pub scope_id: i64,
}

impl InstanceFields {
    pub fn decode(&self, doc: &Value) -> Decoded<InstanceRecord> {
        match self.try_decode(doc) {
            Ok(record) => Decoded::Ok(record),
            Err(reason) => Decoded::Skip(reason),
        }
    }

    fn try_decode(&self, doc: &Value) -> Result<InstanceRecord, SkipReason> {
        let id = required_id(doc, self.id)?;
        let name = required_name(doc, self.name)?;
        let parent_id = match self.parent {
            Some(field) => required_id(doc, field)?,
            None => 0,
        };
        let scope_id = match self.scope {
            Some(field) => required_id(doc, field)?,
            None => 0,
        };
        Ok(InstanceRecord {
            id,
            name,
            parent_id,
            scope_id,
        })
    }
}

/// Association type of mainline relations.
pub const MAINLINE_ASSOCIATION: &str = "bk_mainline";

/// One parent/child edge of the mainline object chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MainlineAssociation {
    /// Child object, e.g. `set`.
    pub object: String,
    /// Parent object, e.g. `biz`.
    pub parent: String,
}

impl MainlineAssociation {
    pub fn new(object: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            parent: parent.into(),
        }
    }

    pub fn decode(doc: &Value) -> Decoded<Self> {
        match lookup_str(doc, "bk_asst_id") {
            Some(MAINLINE_ASSOCIATION) => {}
            Some(other) => {
                return Decoded::Skip(SkipReason::Filtered(format!("association {}", other)))
            }
            None => return Decoded::Skip(SkipReason::MissingField("bk_asst_id".into())),
        }
        let object = match required_name(doc, "bk_obj_id") {
            Ok(v) => v,
            Err(reason) => return Decoded::Skip(reason),
        };
        let parent = match required_name(doc, "bk_asst_obj_id") {
            Ok(v) => v,
            Err(reason) => return Decoded::Skip(reason),
        };
        Decoded::Ok(Self { object, parent })
    }
}
