// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query vocabulary shared by every document store backend.
//!
//! The cache only ever asks the document store a handful of question shapes:
//! equality, membership, "greater than" paging cursors and case-insensitive
//! name patterns, optionally combined. [`Filter`] models exactly those, and
//! evaluates them against a JSON document so that backends which cannot push a
//! condition down can still apply it after loading.
//!
//! Field paths are dotted (`detail.bk_host_id`).

use std::cmp::Ordering;

use regex::RegexBuilder;
use serde_json::{Map, Value};

/// Field holding the document id in every collection.
pub const OID_FIELD: &str = "_id";

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Filter {
    /// Matches every document.
    #[default]
    All,
    Eq(String, Value),
    In(String, Vec<Value>),
    /// Strictly greater than, numbers compared numerically, strings lexically.
    Gt(String, Value),
    /// Case-insensitive regular expression over a string field.
    Regex(String, String),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(field.into(), value.into())
    }

    pub fn is_in<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self::In(field.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gt(field.into(), value.into())
    }

    pub fn regex(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Regex(field.into(), pattern.into())
    }

    /// Conjunction that flattens nested `And`s and drops `All`.
    #[must_use]
    pub fn and(self, other: Filter) -> Self {
        let mut parts = Vec::new();
        for filter in [self, other] {
            match filter {
                Filter::All => {}
                Filter::And(inner) => parts.extend(inner),
                other => parts.push(other),
            }
        }
        match parts.len() {
            0 => Filter::All,
            1 => parts.pop().unwrap_or(Filter::All),
            _ => Filter::And(parts),
        }
    }

    /// Evaluate against a document. An invalid regex matches nothing.
    #[must_use]
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(field, expected) => {
                lookup(doc, field).is_some_and(|actual| values_equal(actual, expected))
            }
            Filter::In(field, candidates) => lookup(doc, field)
                .is_some_and(|actual| candidates.iter().any(|c| values_equal(actual, c))),
            Filter::Gt(field, bound) => lookup(doc, field)
                .and_then(|actual| compare_values(actual, bound))
                .is_some_and(|ord| ord == Ordering::Greater),
            Filter::Regex(field, pattern) => {
                let Some(Value::String(actual)) = lookup(doc, field) else {
                    return false;
                };
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map(|re| re.is_match(actual))
                    .unwrap_or(false)
            }
            Filter::And(parts) => parts.iter().all(|f| f.matches(doc)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Projection, ordering and paging of a find.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// Fields to keep; empty keeps the whole document.
    pub fields: Vec<String>,
    pub sort: Option<(String, SortOrder)>,
    pub skip: u64,
    pub limit: Option<u64>,
}

impl FindOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn fields<S: AsRef<str>>(mut self, fields: &[S]) -> Self {
        self.fields = fields.iter().map(|f| f.as_ref().to_string()).collect();
        self
    }

    #[must_use]
    pub fn sort_asc(mut self, field: impl Into<String>) -> Self {
        self.sort = Some((field.into(), SortOrder::Ascending));
        self
    }

    #[must_use]
    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Apply sort, skip, limit and projection to an already filtered set.
    pub fn apply(&self, mut docs: Vec<Value>) -> Vec<Value> {
        if let Some((field, order)) = &self.sort {
            docs.sort_by(|a, b| {
                let ord = match (lookup(a, field), lookup(b, field)) {
                    (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                    (None, Some(_)) => Ordering::Less,
                    (Some(_), None) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                match order {
                    SortOrder::Ascending => ord,
                    SortOrder::Descending => ord.reverse(),
                }
            });
        }

        let skip = usize::try_from(self.skip).unwrap_or(usize::MAX);
        let limit = self
            .limit
            .map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));

        docs.into_iter()
            .skip(skip)
            .take(limit)
            .map(|doc| project(&doc, &self.fields))
            .collect()
    }
}

/// Resolve a dotted path inside a document.
#[must_use]
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, segment| current.get(segment))
}

/// Integer value of a field, accepting numbers and numeric strings.
#[must_use]
pub fn lookup_i64(doc: &Value, path: &str) -> Option<i64> {
    match lookup(doc, path)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[must_use]
pub fn lookup_str<'a>(doc: &'a Value, path: &str) -> Option<&'a str> {
    lookup(doc, path)?.as_str()
}

/// Keep only `fields` (top-level or dotted) of a document. Empty keeps all.
#[must_use]
pub fn project(doc: &Value, fields: &[String]) -> Value {
    if fields.is_empty() {
        return doc.clone();
    }
    let mut out = Value::Object(Map::new());
    for field in fields {
        if let Some(value) = lookup(doc, field) {
            insert_path(&mut out, field, value.clone());
        }
    }
    out
}

fn insert_path(target: &mut Value, path: &str, value: Value) {
    let mut current = target;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let Value::Object(map) = current else {
            return;
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Total order within a type, `None` across types.
#[must_use]
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
