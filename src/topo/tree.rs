// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ancestor path resolution and name search.
//!
//! Both queries walk the mainline bottom-up. Levels are numbered by their
//! position in the chain, `biz` being level 0:
//!
//! ```text
//! level   0      1        2      3
//!         biz ── region ── set ── module
//!
//! module 200 ─parent─► set 100 ─parent─► region 7 ─parent─► biz 5
//! path of 200 = [set 100, region 7, biz 5]
//! ```
//!
//! Within one query every level's base list is read at most once, and the
//! ancestors of every visited node are memoized, so siblings share their
//! parent's lookup.

use std::collections::HashMap;
use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use tracing::debug;

use super::{NodePath, NodeRef, PathNode, SearchOption, TopologySource, TreeNode};
use crate::error::CacheError;
use crate::keys::ListEntry;

type Ancestors = Option<Vec<PathNode>>;

/// Memo of one query.
struct Resolver<'a> {
    source: &'a dyn TopologySource,
    chain: Vec<String>,
    biz_id: i64,
    biz_name: Option<Option<String>>,
    levels: HashMap<usize, HashMap<i64, ListEntry>>,
    paths: HashMap<(usize, i64), Ancestors>,
}

impl<'a> Resolver<'a> {
    fn new(source: &'a dyn TopologySource, chain: Vec<String>, biz_id: i64) -> Self {
        Self {
            source,
            chain,
            biz_id,
            biz_name: None,
            levels: HashMap::new(),
            paths: HashMap::new(),
        }
    }

    /// Level of `object`, rejecting hosts and objects off the mainline.
    fn level_of(&self, object: &str) -> Result<usize, CacheError> {
        if object == "host" {
            return Err(CacheError::InvalidInput("host nodes are not supported".into()));
        }
        self.chain
            .iter()
            .position(|o| o == object)
            .ok_or_else(|| CacheError::InvalidInput(format!("'{}' is not a mainline object", object)))
    }

    async fn biz_name(&mut self) -> Result<Option<String>, CacheError> {
        if let Some(name) = &self.biz_name {
            return Ok(name.clone());
        }
        let name = self.source.business_name(self.biz_id).await?;
        self.biz_name = Some(name.clone());
        Ok(name)
    }

    async fn load_level(&mut self, level: usize) -> Result<(), CacheError> {
        if self.levels.contains_key(&level) {
            return Ok(());
        }
        let object = &self.chain[level];
        let entries = self.source.base_list(object, self.biz_id).await?;
        debug!(object = %object, biz_id = self.biz_id, count = entries.len(), "Loaded topology level");
        self.levels
            .insert(level, entries.into_iter().map(|entry| (entry.id, entry)).collect());
        Ok(())
    }

    fn entry(&self, level: usize, id: i64) -> Option<&ListEntry> {
        self.levels.get(&level)?.get(&id)
    }

    /// The node itself, `None` when it no longer exists.
    async fn node(&mut self, level: usize, id: i64) -> Result<Option<PathNode>, CacheError> {
        if level == 0 {
            if id != self.biz_id {
                return Ok(None);
            }
            return Ok(self.biz_name().await?.map(|name| PathNode {
                object: self.chain[0].clone(),
                id,
                name,
            }));
        }
        self.load_level(level).await?;
        Ok(self.entry(level, id).map(|entry| PathNode {
            object: self.chain[level].clone(),
            id,
            name: entry.name.clone(),
        }))
    }

    /// Where the parent `parent_id` of a node at `level` lives. The parent
    /// is usually one level up, but a node may hang directly under a coarser
    /// level, such as an idle pool set whose parent is the business even
    /// when custom levels exist.
    async fn parent_of(&mut self, level: usize, parent_id: i64) -> Result<Option<(usize, i64)>, CacheError> {
        for candidate in (1..level).rev() {
            self.load_level(candidate).await?;
            if self.entry(candidate, parent_id).is_some() {
                return Ok(Some((candidate, parent_id)));
            }
        }
        Ok((parent_id == self.biz_id).then_some((0, parent_id)))
    }

    /// Ancestors of a node, direct parent first. `None` when the node or any
    /// ancestor is gone, or the chain ends outside the business.
    async fn ancestors(&mut self, level: usize, id: i64) -> Result<Ancestors, CacheError> {
        let mut walked = Vec::new();
        let mut current = (level, id);

        let top = loop {
            if let Some(known) = self.paths.get(&current) {
                break known.clone();
            }
            if current.0 == 0 {
                let found = self.node(0, current.1).await?.map(|_| Vec::new());
                self.paths.insert(current, found.clone());
                break found;
            }
            self.load_level(current.0).await?;
            let parent = match self.entry(current.0, current.1) {
                Some(entry) => self.parent_of(current.0, entry.parent_id).await?,
                None => None,
            };
            match parent {
                Some(parent) => {
                    walked.push(current);
                    current = parent;
                }
                None => {
                    self.paths.insert(current, None);
                    break None;
                }
            }
        };

        // Unwind: each walked node's ancestors are its parent plus the parent's.
        let mut above = top;
        let mut parent = current;
        for node in walked.into_iter().rev() {
            above = match above {
                Some(mut path) => match self.node(parent.0, parent.1).await? {
                    Some(parent_node) => {
                        path.insert(0, parent_node);
                        Some(path)
                    }
                    None => None,
                },
                None => None,
            };
            self.paths.insert(node, above.clone());
            parent = node;
        }
        Ok(above)
    }
}

fn compile(pattern: &str) -> Result<Regex, CacheError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| CacheError::InvalidInput(format!("invalid name pattern '{}': {}", pattern, e)))
}

/// Topology query engine.
pub struct TopoTree {
    source: Arc<dyn TopologySource>,
    ceiling: usize,
}

impl TopoTree {
    /// `ceiling` is the most matches a search may return before it is
    /// rejected as too broad.
    pub fn new(source: Arc<dyn TopologySource>, ceiling: usize) -> Self {
        Self { source, ceiling }
    }

    /// Resolve the ancestor path of every node. Nodes that no longer exist
    /// are left out of the result.
    #[tracing::instrument(skip_all, fields(biz_id = biz_id, nodes = nodes.len()))]
    pub async fn resolve_ancestor_path(&self, biz_id: i64, nodes: &[NodeRef]) -> Result<Vec<NodePath>, CacheError> {
        if biz_id <= 0 {
            return Err(CacheError::InvalidInput(format!("invalid business id {}", biz_id)));
        }
        if nodes.is_empty() {
            return Ok(Vec::new());
        }

        let chain = self.source.mainline().await?;
        let mut resolver = Resolver::new(self.source.as_ref(), chain, biz_id);
        let levels = nodes
            .iter()
            .map(|node| resolver.level_of(&node.object))
            .collect::<Result<Vec<_>, _>>()?;

        let mut resolved = Vec::with_capacity(nodes.len());
        for (node, level) in nodes.iter().zip(levels) {
            let Some(this) = resolver.node(level, node.id).await? else {
                debug!(object = %node.object, id = node.id, "Node no longer exists, dropping it");
                continue;
            };
            let Some(path) = resolver.ancestors(level, node.id).await? else {
                debug!(object = %node.object, id = node.id, "Ancestor missing, dropping node");
                continue;
            };
            resolved.push(NodePath {
                object: this.object,
                id: this.id,
                name: this.name,
                path,
            });
        }
        Ok(resolved)
    }

    /// Search instances by name and return them as a tree rooted at the
    /// business. Fails with [`CacheError::Overhead`] instead of truncating.
    #[tracing::instrument(skip_all, fields(biz_id = option.biz_id))]
    pub async fn search_topology(&self, option: &SearchOption) -> Result<TreeNode, CacheError> {
        if option.biz_id <= 0 {
            return Err(CacheError::InvalidInput(format!("invalid business id {}", option.biz_id)));
        }
        if option.filters.is_empty() {
            return Err(CacheError::InvalidInput("at least one name filter is required".into()));
        }

        let chain = self.source.mainline().await?;
        let mut resolver = Resolver::new(self.source.as_ref(), chain, option.biz_id);

        let mut filters = Vec::with_capacity(option.filters.len());
        for filter in &option.filters {
            let level = resolver.level_of(&filter.object)?;
            if level == 0 {
                return Err(CacheError::InvalidInput("the business level cannot be filtered by name".into()));
            }
            filters.push((level, compile(&filter.pattern)?));
        }
        filters.sort_by_key(|(level, _)| std::cmp::Reverse(*level));
        let Some(((deepest, pattern), constraints)) = filters.split_first() else {
            return Err(CacheError::InvalidInput("at least one name filter is required".into()));
        };
        let deepest = *deepest;

        let Some(root) = resolver.node(0, option.biz_id).await? else {
            return Err(CacheError::not_found("biz", option.biz_id));
        };

        resolver.load_level(deepest).await?;
        let mut matched: Vec<(i64, String)> = resolver
            .levels
            .get(&deepest)
            .map(|entries| {
                entries
                    .values()
                    .filter(|entry| pattern.is_match(&entry.name))
                    .map(|entry| (entry.id, entry.name.clone()))
                    .collect()
            })
            .unwrap_or_default();
        if matched.len() > self.ceiling {
            let object = &resolver.chain[deepest];
            crate::metrics::record_overhead_rejection(object);
            debug!(object = %object, matched = matched.len(), limit = self.ceiling, "Search too broad");
            return Err(CacheError::Overhead {
                limit: self.ceiling,
                matched: matched.len(),
            });
        }
        matched.sort();

        let object = resolver.chain[deepest].clone();
        let mut tree = TreeNode::leaf(&root);
        for (id, name) in matched {
            let Some(path) = resolver.ancestors(deepest, id).await? else {
                continue;
            };
            // A constraint on a level the node skips cannot be met.
            let admitted = constraints.iter().all(|(level, regex)| {
                if *level == deepest {
                    return regex.is_match(&name);
                }
                let object = &resolver.chain[*level];
                path.iter()
                    .find(|ancestor| &ancestor.object == object)
                    .is_some_and(|ancestor| regex.is_match(&ancestor.name))
            });
            if !admitted {
                continue;
            }

            let mut chain: Vec<PathNode> = path.into_iter().rev().skip(1).collect();
            chain.push(PathNode {
                object: object.clone(),
                id,
                name,
            });
            tree.insert_chain(&chain);
        }
        tree.sort();
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topo::NameFilter;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSource {
        chain: Vec<&'static str>,
        lists: HashMap<&'static str, Vec<ListEntry>>,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl TopologySource for FakeSource {
        async fn mainline(&self) -> Result<Vec<String>, CacheError> {
            Ok(self.chain.iter().map(|s| s.to_string()).collect())
        }

        async fn base_list(&self, object: &str, _biz_id: i64) -> Result<Vec<ListEntry>, CacheError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.lists.get(object).cloned().unwrap_or_default())
        }

        async fn business_name(&self, biz_id: i64) -> Result<Option<String>, CacheError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok((biz_id == 5).then(|| "demo".to_string()))
        }
    }

    fn plain_source() -> Arc<FakeSource> {
        Arc::new(FakeSource {
            chain: vec!["biz", "set", "module", "host"],
            lists: HashMap::from([
                ("set", vec![ListEntry::new(100, 5, "set-a"), ListEntry::new(101, 5, "set-b")]),
                (
                    "module",
                    vec![
                        ListEntry::new(200, 100, "m1"),
                        ListEntry::new(201, 100, "m2"),
                        ListEntry::new(202, 101, "m1"),
                        ListEntry::new(203, 999, "orphan"),
                    ],
                ),
            ]),
            reads: AtomicUsize::new(0),
        })
    }

    fn regional_source() -> Arc<FakeSource> {
        Arc::new(FakeSource {
            chain: vec!["biz", "region", "set", "module", "host"],
            lists: HashMap::from([
                ("region", vec![ListEntry::new(7, 5, "north"), ListEntry::new(8, 5, "south")]),
                ("set", vec![ListEntry::new(100, 7, "web"), ListEntry::new(101, 8, "web")]),
                ("module", vec![ListEntry::new(200, 100, "nginx"), ListEntry::new(201, 101, "nginx")]),
            ]),
            reads: AtomicUsize::new(0),
        })
    }

    fn idle_pool_source() -> Arc<FakeSource> {
        Arc::new(FakeSource {
            chain: vec!["biz", "region", "set", "module", "host"],
            lists: HashMap::from([
                ("region", vec![ListEntry::new(7, 5, "north")]),
                ("set", vec![ListEntry::new(100, 7, "web"), ListEntry::new(150, 5, "idle pool")]),
                (
                    "module",
                    vec![ListEntry::new(200, 100, "nginx"), ListEntry::new(250, 150, "idle")],
                ),
            ]),
            reads: AtomicUsize::new(0),
        })
    }

    fn node(object: &str, id: i64, name: &str) -> PathNode {
        PathNode {
            object: object.into(),
            id,
            name: name.into(),
        }
    }

    #[tokio::test]
    async fn test_resolve_module_path() {
        let tree = TopoTree::new(plain_source(), 20);
        let paths = tree.resolve_ancestor_path(5, &[NodeRef::new("module", 200)]).await.unwrap();
        assert_eq!(
            paths,
            vec![NodePath {
                object: "module".into(),
                id: 200,
                name: "m1".into(),
                path: vec![node("set", 100, "set-a"), node("biz", 5, "demo")],
            }]
        );
    }

    #[tokio::test]
    async fn test_resolve_through_custom_level_memoizes_reads() {
        let source = regional_source();
        let tree = TopoTree::new(source.clone(), 20);
        let paths = tree
            .resolve_ancestor_path(
                5,
                &[
                    NodeRef::new("module", 200),
                    NodeRef::new("module", 201),
                    NodeRef::new("set", 100),
                    NodeRef::new("region", 8),
                    NodeRef::new("biz", 5),
                ],
            )
            .await
            .unwrap();

        assert_eq!(paths[0].path, vec![node("set", 100, "web"), node("region", 7, "north"), node("biz", 5, "demo")]);
        assert_eq!(paths[1].path[1], node("region", 8, "south"));
        assert_eq!(paths[2].path.len(), 2);
        assert_eq!(paths[3].path, vec![node("biz", 5, "demo")]);
        assert!(paths[4].path.is_empty());
        // module, set and region lists plus the business name, each once.
        assert_eq!(source.reads.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_resolve_set_directly_under_business() {
        let tree = TopoTree::new(idle_pool_source(), 20);
        let paths = tree
            .resolve_ancestor_path(5, &[NodeRef::new("module", 250), NodeRef::new("set", 150)])
            .await
            .unwrap();

        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0].path, vec![node("set", 150, "idle pool"), node("biz", 5, "demo")]);
        assert_eq!(paths[1].path, vec![node("biz", 5, "demo")]);

        // Skipping a level never reaches another business
        let paths = tree.resolve_ancestor_path(6, &[NodeRef::new("set", 150)]).await.unwrap();
        assert!(paths.is_empty());
    }

    #[tokio::test]
    async fn test_search_keeps_sets_under_business() {
        let tree = TopoTree::new(idle_pool_source(), 20);
        let option = SearchOption {
            biz_id: 5,
            filters: vec![NameFilter::new("module", ".")],
        };
        let root = tree.search_topology(&option).await.unwrap();

        let children: Vec<(&str, i64)> = root.children.iter().map(|c| (c.object.as_str(), c.id)).collect();
        assert_eq!(children, vec![("region", 7), ("set", 150)]);
        assert_eq!(root.children[1].children[0].id, 250);

        // A region constraint excludes the set that has no region
        let option = SearchOption {
            biz_id: 5,
            filters: vec![NameFilter::new("region", "north"), NameFilter::new("module", ".")],
        };
        let root = tree.search_topology(&option).await.unwrap();
        assert_eq!(root.children.len(), 1);
        assert_eq!(root.children[0].id, 7);
    }

    #[tokio::test]
    async fn test_resolve_drops_missing_nodes() {
        let tree = TopoTree::new(plain_source(), 20);
        let paths = tree
            .resolve_ancestor_path(5, &[NodeRef::new("module", 203), NodeRef::new("module", 404), NodeRef::new("module", 202)])
            .await
            .unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].id, 202);

        assert!(tree.resolve_ancestor_path(6, &[NodeRef::new("module", 200)]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_rejects_bad_input() {
        let tree = TopoTree::new(plain_source(), 20);
        for object in ["host", "rack"] {
            let err = tree.resolve_ancestor_path(5, &[NodeRef::new(object, 1)]).await.unwrap_err();
            assert!(matches!(err, CacheError::InvalidInput(_)));
        }
        assert!(tree.resolve_ancestor_path(0, &[NodeRef::new("set", 1)]).await.is_err());
    }

    #[tokio::test]
    async fn test_search_builds_tree() {
        let tree = TopoTree::new(plain_source(), 20);
        let option = SearchOption {
            biz_id: 5,
            filters: vec![NameFilter::new("module", "^M1$")],
        };
        let root = tree.search_topology(&option).await.unwrap();

        assert_eq!((root.object.as_str(), root.id, root.name.as_str()), ("biz", 5, "demo"));
        let sets: Vec<i64> = root.children.iter().map(|c| c.id).collect();
        assert_eq!(sets, vec![100, 101]);
        assert_eq!(root.children[0].children[0].id, 200);
        assert_eq!(root.children[1].children[0].id, 202);
    }

    #[tokio::test]
    async fn test_search_applies_ancestor_filters() {
        let tree = TopoTree::new(regional_source(), 20);
        let option = SearchOption {
            biz_id: 5,
            filters: vec![NameFilter::new("region", "north"), NameFilter::new("module", "nginx")],
        };
        let root = tree.search_topology(&option).await.unwrap();

        assert_eq!(root.children.len(), 1);
        let region = &root.children[0];
        assert_eq!(region.id, 7);
        assert_eq!(region.children[0].id, 100);
        assert_eq!(region.children[0].children[0].id, 200);
    }

    #[tokio::test]
    async fn test_search_overhead_guard_stops_reading() {
        let mut modules = Vec::new();
        for i in 0..21 {
            modules.push(ListEntry::new(1000 + i, 100, format!("app-{}", i)));
        }
        let source = Arc::new(FakeSource {
            chain: vec!["biz", "set", "module", "host"],
            lists: HashMap::from([("set", vec![ListEntry::new(100, 5, "set-a")]), ("module", modules)]),
            reads: AtomicUsize::new(0),
        });
        let tree = TopoTree::new(source.clone(), 20);
        let option = SearchOption {
            biz_id: 5,
            filters: vec![NameFilter::new("module", "app")],
        };

        let err = tree.search_topology(&option).await.unwrap_err();
        assert!(err.is_overhead());
        // Business name and the module list only; no ancestor reads.
        assert_eq!(source.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_search_rejects_bad_input() {
        let tree = TopoTree::new(plain_source(), 20);
        let cases = [
            SearchOption { biz_id: 0, filters: vec![NameFilter::new("set", "a")] },
            SearchOption { biz_id: 5, filters: vec![] },
            SearchOption { biz_id: 5, filters: vec![NameFilter::new("set", "(")] },
            SearchOption { biz_id: 5, filters: vec![NameFilter::new("host", "a")] },
            SearchOption { biz_id: 5, filters: vec![NameFilter::new("biz", "a")] },
        ];
        for option in cases {
            let err = tree.search_topology(&option).await.unwrap_err();
            assert!(matches!(err, CacheError::InvalidInput(_)), "{:?}", option);
        }
    }
}
