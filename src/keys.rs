// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache key derivation and list-entry encoding.
//!
//! Every key the cache writes has the shape
//!
//! ```text
//! {prefix}:{entity}:{kind}[:{id}]
//!
//! cc:module:detail:200          detail record of module 200
//! cc:module:detail:expire:200   unix seconds of the last detail write
//! cc:module:detail:lock:200     distributed refresh lock
//! cc:module:list:5              base list of the modules of business 5
//! cc:module:list:expire:5
//! cc:module:list:lock:5
//! cc:module:oid:65f0c1…         document id -> instance reference
//! cc:module:list_done           bulk list completed marker
//! cc:host:unique:10.0.0.1:0     unique key side index -> host id
//! cc:host:id_list               sorted id list (ZSET)
//! ```
//!
//! Keys are derived on demand and never stored as objects. Entity segments are
//! registered once in a [`NamespaceRegistry`] so two caches can never share a
//! namespace.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::error::CacheError;

/// Objects of the mainline that have dedicated caches and never get a
/// custom-level watch.
pub const BUILTIN_OBJECTS: [&str; 4] = ["biz", "set", "module", "host"];

/// Namespace of the mainline topology key.
pub const MAINLINE_ENTITY: &str = "mainline";

#[must_use]
pub fn is_builtin_object(object: &str) -> bool {
    BUILTIN_OBJECTS.contains(&object)
}

/// Entity segment used for a custom mainline level, e.g. `custom.region`.
#[must_use]
pub fn custom_entity(object: &str) -> String {
    format!("custom.{}", object)
}

/// What a key holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Detail,
    DetailExpire,
    DetailLock,
    List,
    ListExpire,
    ListLock,
    Oid,
    ListDone,
    WatchToken,
    Unique,
    IdList,
    IdListExpire,
    IdListLock,
    IdListTemp,
    IdListTempPointer,
    Topology,
}

impl KeyKind {
    /// Longer kinds first so that `detail:expire` is never read as `detail`.
    const PARSE_ORDER: [KeyKind; 16] = [
        KeyKind::DetailExpire,
        KeyKind::DetailLock,
        KeyKind::ListExpire,
        KeyKind::ListLock,
        KeyKind::IdListExpire,
        KeyKind::IdListLock,
        KeyKind::IdListTempPointer,
        KeyKind::IdListTemp,
        KeyKind::ListDone,
        KeyKind::WatchToken,
        KeyKind::IdList,
        KeyKind::Detail,
        KeyKind::List,
        KeyKind::Oid,
        KeyKind::Unique,
        KeyKind::Topology,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detail => "detail",
            Self::DetailExpire => "detail:expire",
            Self::DetailLock => "detail:lock",
            Self::List => "list",
            Self::ListExpire => "list:expire",
            Self::ListLock => "list:lock",
            Self::Oid => "oid",
            Self::ListDone => "list_done",
            Self::WatchToken => "watch_token",
            Self::Unique => "unique",
            Self::IdList => "id_list",
            Self::IdListExpire => "id_list:expire",
            Self::IdListLock => "id_list:lock",
            Self::IdListTemp => "id_list:temp",
            Self::IdListTempPointer => "id_list:temp_key",
            Self::Topology => "topology",
        }
    }

    /// Whether keys of this kind carry a trailing id segment.
    #[must_use]
    pub fn has_id(&self) -> bool {
        !matches!(
            self,
            Self::ListDone
                | Self::WatchToken
                | Self::IdList
                | Self::IdListExpire
                | Self::IdListLock
                | Self::IdListTempPointer
                | Self::Topology
        )
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key split back into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    pub entity: String,
    pub kind: KeyKind,
    pub id: Option<String>,
}

/// Derives every key of one service prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyGen {
    prefix: String,
}

impl KeyGen {
    /// Create a generator; the prefix must be non-empty and free of `:`.
    pub fn new(prefix: impl Into<String>) -> Result<Self, CacheError> {
        let prefix = prefix.into();
        validate_segment(&prefix).map_err(|reason| {
            CacheError::Config(format!("key prefix '{}' {}", prefix, reason))
        })?;
        Ok(Self { prefix })
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Keys of one entity namespace.
    #[must_use]
    pub fn entity(&self, entity: &str) -> EntityKeys {
        EntityKeys {
            base: format!("{}:{}", self.prefix, entity),
        }
    }

    /// Key of the ranked mainline object chain.
    #[must_use]
    pub fn topology(&self) -> String {
        format!("{}:{}:{}", self.prefix, MAINLINE_ENTITY, KeyKind::Topology)
    }

    /// Split a key produced by this generator. Keys of other prefixes yield `None`.
    #[must_use]
    pub fn parse(&self, key: &str) -> Option<ParsedKey> {
        let rest = key.strip_prefix(&self.prefix)?.strip_prefix(':')?;
        let (entity, rest) = rest.split_once(':')?;
        if entity.is_empty() {
            return None;
        }

        for kind in KeyKind::PARSE_ORDER {
            let Some(tail) = rest.strip_prefix(kind.as_str()) else {
                continue;
            };
            if kind.has_id() {
                match tail.strip_prefix(':') {
                    Some(id) if !id.is_empty() => {
                        return Some(ParsedKey {
                            entity: entity.to_string(),
                            kind,
                            id: Some(id.to_string()),
                        })
                    }
                    _ => continue,
                }
            } else if tail.is_empty() {
                return Some(ParsedKey {
                    entity: entity.to_string(),
                    kind,
                    id: None,
                });
            }
        }
        None
    }
}

/// Keys of a single entity namespace, e.g. `cc:module`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityKeys {
    base: String,
}

impl EntityKeys {
    fn with_id(&self, kind: KeyKind, id: impl fmt::Display) -> String {
        format!("{}:{}:{}", self.base, kind, id)
    }

    fn bare(&self, kind: KeyKind) -> String {
        format!("{}:{}", self.base, kind)
    }

    pub fn detail(&self, id: impl fmt::Display) -> String {
        self.with_id(KeyKind::Detail, id)
    }

    pub fn detail_expire(&self, id: impl fmt::Display) -> String {
        self.with_id(KeyKind::DetailExpire, id)
    }

    pub fn detail_lock(&self, id: impl fmt::Display) -> String {
        self.with_id(KeyKind::DetailLock, id)
    }

    pub fn list(&self, scope: impl fmt::Display) -> String {
        self.with_id(KeyKind::List, scope)
    }

    pub fn list_expire(&self, scope: impl fmt::Display) -> String {
        self.with_id(KeyKind::ListExpire, scope)
    }

    pub fn list_lock(&self, scope: impl fmt::Display) -> String {
        self.with_id(KeyKind::ListLock, scope)
    }

    pub fn oid(&self, oid: &str) -> String {
        self.with_id(KeyKind::Oid, oid)
    }

    pub fn unique(&self, value: &str) -> String {
        self.with_id(KeyKind::Unique, value)
    }

    pub fn id_list_temp(&self, run: impl fmt::Display) -> String {
        self.with_id(KeyKind::IdListTemp, run)
    }

    #[must_use]
    pub fn list_done(&self) -> String {
        self.bare(KeyKind::ListDone)
    }

    #[must_use]
    pub fn watch_token(&self) -> String {
        self.bare(KeyKind::WatchToken)
    }

    #[must_use]
    pub fn id_list(&self) -> String {
        self.bare(KeyKind::IdList)
    }

    #[must_use]
    pub fn id_list_expire(&self) -> String {
        self.bare(KeyKind::IdListExpire)
    }

    #[must_use]
    pub fn id_list_lock(&self) -> String {
        self.bare(KeyKind::IdListLock)
    }

    /// Names the temporary id list of a rebuild in progress.
    #[must_use]
    pub fn id_list_temp_pointer(&self) -> String {
        self.bare(KeyKind::IdListTempPointer)
    }
}

fn validate_segment(segment: &str) -> Result<(), &'static str> {
    if segment.is_empty() {
        return Err("must not be empty");
    }
    if segment.contains(':') || segment.chars().any(char::is_whitespace) {
        return Err("must not contain ':' or whitespace");
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// List entries
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ListEntryError {
    #[error("list entry '{0}' does not have three segments")]
    Malformed(String),
    #[error("list entry '{0}' has a non-numeric or zero id")]
    InvalidId(String),
    #[error("list entry '{0}' has a non-numeric parent id")]
    InvalidParent(String),
    #[error("list entry '{0}' has an empty name")]
    EmptyName(String),
}

/// One member of a base list set: `{id}:{parent_id}:{name}`.
///
/// The name is the last segment and may itself contain `:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ListEntry {
    pub id: i64,
    pub parent_id: i64,
    pub name: String,
}

impl ListEntry {
    pub fn new(id: i64, parent_id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            parent_id,
            name: name.into(),
        }
    }

    #[must_use]
    pub fn encode(&self) -> String {
        format!("{}:{}:{}", self.id, self.parent_id, self.name)
    }

    pub fn decode(member: &str) -> Result<Self, ListEntryError> {
        let mut parts = member.splitn(3, ':');
        let (Some(id), Some(parent), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(ListEntryError::Malformed(member.to_string()));
        };

        let id: i64 = match id.parse() {
            Ok(id) if id > 0 => id,
            _ => return Err(ListEntryError::InvalidId(member.to_string())),
        };
        let parent_id: i64 = parent
            .parse()
            .map_err(|_| ListEntryError::InvalidParent(member.to_string()))?;
        if name.is_empty() {
            return Err(ListEntryError::EmptyName(member.to_string()));
        }

        Ok(Self {
            id,
            parent_id,
            name: name.to_string(),
        })
    }

    /// Best-effort id of a member that failed to decode.
    #[must_use]
    pub fn recover_id(member: &str) -> Option<i64> {
        let head = member.split(':').next()?;
        head.parse::<i64>().ok().filter(|id| *id > 0)
    }

    /// Whether `member` encodes the same instance id as this entry.
    #[must_use]
    pub fn same_instance(&self, member: &str) -> bool {
        Self::recover_id(member) == Some(self.id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Namespace registry
// ═══════════════════════════════════════════════════════════════════════════

/// Startup-time registry of entity namespaces.
///
/// A duplicate registration is a build defect, so it is reported as
/// [`CacheError::Config`] and aborts service construction.
#[derive(Debug, Default)]
pub struct NamespaceRegistry {
    owners: HashMap<String, String>,
}

impl NamespaceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entity: &str, owner: &str) -> Result<(), CacheError> {
        validate_segment(entity).map_err(|reason| {
            CacheError::Config(format!("entity namespace '{}' {}", entity, reason))
        })?;
        if entity == MAINLINE_ENTITY {
            return Err(CacheError::Config(format!(
                "entity namespace '{}' is reserved",
                entity
            )));
        }
        if let Some(existing) = self.owners.get(entity) {
            return Err(CacheError::Config(format!(
                "entity namespace '{}' registered by both {} and {}",
                entity, existing, owner
            )));
        }
        self.owners.insert(entity.to_string(), owner.to_string());
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, entity: &str) -> bool {
        self.owners.contains_key(entity)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}
