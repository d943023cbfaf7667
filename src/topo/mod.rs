// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Business topology queries over the entity caches.
//!
//! Nothing here writes: [`TopoTree`] reads through a [`TopologySource`],
//! which the service backs with the entity caches.

pub mod tree;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cache::{InstanceCache, MainlineCache};
use crate::error::CacheError;
use crate::keys::ListEntry;

pub use tree::TopoTree;

/// Read side the topology engine works on.
#[async_trait]
pub trait TopologySource: Send + Sync {
    /// Ranked mainline objects, `biz` first.
    async fn mainline(&self) -> Result<Vec<String>, CacheError>;

    /// Instances of `object` in business `biz_id`.
    async fn base_list(&self, object: &str, biz_id: i64) -> Result<Vec<ListEntry>, CacheError>;

    /// `None` when the business does not exist.
    async fn business_name(&self, biz_id: i64) -> Result<Option<String>, CacheError>;
}

/// A node of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    pub object: String,
    pub id: i64,
}

impl NodeRef {
    pub fn new(object: impl Into<String>, id: i64) -> Self {
        Self {
            object: object.into(),
            id,
        }
    }
}

/// One resolved node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathNode {
    pub object: String,
    pub id: i64,
    pub name: String,
}

/// A requested node and its ancestors, direct parent first and business last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePath {
    pub object: String,
    pub id: i64,
    pub name: String,
    pub path: Vec<PathNode>,
}

/// Case-insensitive name pattern on one mainline level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameFilter {
    pub object: String,
    pub pattern: String,
}

impl NameFilter {
    pub fn new(object: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            pattern: pattern.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchOption {
    pub biz_id: i64,
    /// Filters on custom levels, sets or modules. The deepest one selects the
    /// matches; the others constrain their ancestors.
    pub filters: Vec<NameFilter>,
}

/// A node of a search result tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub object: String,
    pub id: i64,
    pub name: String,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    fn leaf(node: &PathNode) -> Self {
        Self {
            object: node.object.clone(),
            id: node.id,
            name: node.name.clone(),
            children: Vec::new(),
        }
    }

    /// Merge a root-first chain of nodes below `self`.
    fn insert_chain(&mut self, chain: &[PathNode]) {
        let Some((head, rest)) = chain.split_first() else {
            return;
        };
        let position = self
            .children
            .iter()
            .position(|child| child.object == head.object && child.id == head.id);
        let child = match position {
            Some(index) => &mut self.children[index],
            None => {
                self.children.push(TreeNode::leaf(head));
                let last = self.children.len() - 1;
                &mut self.children[last]
            }
        };
        child.insert_chain(rest);
    }

    fn sort(&mut self) {
        self.children.sort_by_key(|child| child.id);
        for child in &mut self.children {
            child.sort();
        }
    }
}

/// [`TopologySource`] backed by the entity caches.
pub struct CacheTopologySource {
    pub mainline: Arc<MainlineCache>,
    pub biz: Arc<InstanceCache>,
    pub set: Arc<InstanceCache>,
    pub module: Arc<InstanceCache>,
}

#[async_trait]
impl TopologySource for CacheTopologySource {
    async fn mainline(&self) -> Result<Vec<String>, CacheError> {
        self.mainline.get_topology().await
    }

    async fn base_list(&self, object: &str, biz_id: i64) -> Result<Vec<ListEntry>, CacheError> {
        match object {
            "biz" => self.biz.base_list(0).await,
            "set" => self.set.base_list(biz_id).await,
            "module" => self.module.base_list(biz_id).await,
            "host" => Err(CacheError::InvalidInput("hosts have no base list".into())),
            custom => self.mainline.custom_cache(custom).base_list(biz_id).await,
        }
    }

    async fn business_name(&self, biz_id: i64) -> Result<Option<String>, CacheError> {
        match self.biz.get(biz_id, &["bk_biz_name".to_string()]).await {
            Ok(doc) => Ok(doc.get("bk_biz_name").and_then(|v| v.as_str()).map(String::from)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
