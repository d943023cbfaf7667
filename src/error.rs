// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy of the cache layer.
//!
//! ```text
//! StorageError ──(#[from])──► CacheError::Storage     infra, usually absorbed
//!                             CacheError::NotFound    entity absent at the source
//!                             CacheError::InvalidInput  rejected at the boundary
//!                             CacheError::Overhead    query too broad, narrow it
//!                             CacheError::Config      startup defect, fail fast
//! ```
//!
//! Only errors that prevent returning any usable data reach the read API.
//! Everything else is logged where it happens and degraded away.

use thiserror::Error;

use crate::storage::traits::StorageError;

/// Errors surfaced by the cache read API and service construction.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The entity does not exist in the cache nor in the document store.
    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: String },

    /// Unknown object type, empty required field, id out of range.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Topology search matched more than the configured ceiling.
    ///
    /// Distinct from not-found and infra failures: the caller has to narrow
    /// the filter, retrying will not help.
    #[error("too much data: {matched} matches exceed the limit of {limit}, narrow the filter")]
    Overhead { limit: usize, matched: usize },

    /// Duplicate key namespace or unusable configuration at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Backend failure that left no fallback.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl CacheError {
    pub fn not_found(entity: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Storage(StorageError::NotFound))
    }

    #[must_use]
    pub fn is_overhead(&self) -> bool {
        matches!(self, Self::Overhead { .. })
    }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
