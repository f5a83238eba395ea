//! Query expressions and their evaluation contract.
//!
//! An [`Expression`] is a set of target namespaces plus a predicate tree
//! ([`Node`]). Parsing query text is someone else's job; this module only
//! evaluates an already-built tree against a single record.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{OnceLock, RwLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ExpressionEvalError, ViewError, ViewResult};
use crate::record::MetadataRecord;
use crate::transport::topic_matches;

const REGEX_CACHE_MAX: usize = 1024;

static REGEX_CACHE: OnceLock<RwLock<HashMap<String, Regex>>> = OnceLock::new();

fn cached_regex(pattern: &str) -> Result<Regex, ExpressionEvalError> {
    let cache = REGEX_CACHE.get_or_init(|| RwLock::new(HashMap::new()));

    if let Ok(guard) = cache.read() {
        if let Some(re) = guard.get(pattern) {
            return Ok(re.clone());
        }
    }

    let compiled = Regex::new(pattern).map_err(|e| ExpressionEvalError::InvalidRegex {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;

    // A poisoned cache only costs recompilation.
    if let Ok(mut guard) = cache.write() {
        if guard.len() >= REGEX_CACHE_MAX {
            guard.clear();
        }
        guard
            .entry(pattern.to_string())
            .or_insert_with(|| compiled.clone());
    }
    Ok(compiled)
}

/// Anything that can decide whether a record matches.
pub trait Evaluate {
    /// Returns whether `record` satisfies this predicate.
    fn eval(&self, record: &MetadataRecord) -> Result<bool, ExpressionEvalError>;
}

/// Predicate tree over a single [`MetadataRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Node {
    /// Matches every record.
    All,
    /// Record key equals `key`.
    KeyEquals { key: String },
    /// Record key matches a regex.
    KeyMatches { pattern: String },
    /// Record value equals `value` byte-for-byte.
    ValueEquals { value: String },
    /// Record value (UTF-8) matches a regex.
    ValueMatches { pattern: String },
    /// Key equals `key` and value equals `value`.
    Entry { key: String, value: String },
    /// URI starts with `prefix`.
    UriPrefix { prefix: String },
    /// URI matches a topic pattern (`+` one segment, `*` any depth).
    UriMatches { pattern: String },
    /// Published by the given identity.
    PublishedBy { publisher: String },
    And { nodes: Vec<Node> },
    Or { nodes: Vec<Node> },
    Not { node: Box<Node> },
}

impl Node {
    #[must_use]
    pub fn key_equals(key: impl Into<String>) -> Self {
        Self::KeyEquals { key: key.into() }
    }

    #[must_use]
    pub fn value_equals(value: impl Into<String>) -> Self {
        Self::ValueEquals { value: value.into() }
    }

    #[must_use]
    pub fn entry(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Entry {
            key: key.into(),
            value: value.into(),
        }
    }

    #[must_use]
    pub fn uri_prefix(prefix: impl Into<String>) -> Self {
        Self::UriPrefix { prefix: prefix.into() }
    }

    #[must_use]
    pub fn and(nodes: Vec<Node>) -> Self {
        Self::And { nodes }
    }

    #[must_use]
    pub fn or(nodes: Vec<Node>) -> Self {
        Self::Or { nodes }
    }

    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn not(node: Node) -> Self {
        Self::Not { node: Box::new(node) }
    }
}

impl Evaluate for Node {
    fn eval(&self, record: &MetadataRecord) -> Result<bool, ExpressionEvalError> {
        match self {
            Self::All => Ok(true),
            Self::KeyEquals { key } => Ok(record.key == *key),
            Self::KeyMatches { pattern } => Ok(cached_regex(pattern)?.is_match(&record.key)),
            Self::ValueEquals { value } => Ok(record.value == value.as_bytes()),
            Self::ValueMatches { pattern } => {
                let re = cached_regex(pattern)?;
                let s = record.value_str().ok_or_else(|| ExpressionEvalError::NonUtf8Value {
                    uri: record.uri.clone(),
                })?;
                Ok(re.is_match(s))
            }
            Self::Entry { key, value } => Ok(record.key == *key && record.value == value.as_bytes()),
            Self::UriPrefix { prefix } => Ok(record.uri.starts_with(prefix.as_str())),
            Self::UriMatches { pattern } => Ok(topic_matches(pattern, &record.uri)),
            Self::PublishedBy { publisher } => Ok(record.publisher_id == *publisher),
            Self::And { nodes } => {
                for n in nodes {
                    if !n.eval(record)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Or { nodes } => {
                for n in nodes {
                    if n.eval(record)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Not { node } => Ok(!node.eval(record)?),
        }
    }
}

/// Content hash of an expression. Equal expressions share a hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExpressionHash(String);

impl ExpressionHash {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExpressionHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A parsed query: target namespaces plus a predicate tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expression {
    pub namespaces: BTreeSet<String>,
    pub node: Node,
}

impl Expression {
    #[must_use]
    pub fn new<I, S>(namespaces: I, node: Node) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            namespaces: namespaces.into_iter().map(Into::into).collect(),
            node,
        }
    }

    /// Copy of this expression targeting `namespaces` instead.
    #[must_use]
    pub fn with_namespaces<I, S>(&self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(namespaces, self.node.clone())
    }

    #[must_use]
    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.namespaces.contains(namespace)
    }

    /// blake3 digest of the canonical JSON form.
    pub fn hash(&self) -> ViewResult<ExpressionHash> {
        let bytes = serde_json::to_vec(self).map_err(|e| ViewError::internal(format!("serialize expression: {e}")))?;
        Ok(ExpressionHash(blake3::hash(&bytes).to_hex().to_string()))
    }
}

impl Evaluate for Expression {
    /// Namespace membership first, then the predicate tree.
    fn eval(&self, record: &MetadataRecord) -> Result<bool, ExpressionEvalError> {
        if !self.has_namespace(&record.namespace) {
            return Ok(false);
        }
        self.node.eval(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(key: &str, value: &[u8]) -> MetadataRecord {
        MetadataRecord::new("ns1", "ns1/bldg1/rm1/*", key, value.to_vec(), "vk1", 1)
    }

    #[test]
    fn leaf_predicates() {
        let r = rec("location", b"floor2");
        assert!(Node::key_equals("location").eval(&r).unwrap());
        assert!(!Node::key_equals("owner").eval(&r).unwrap());
        assert!(Node::value_equals("floor2").eval(&r).unwrap());
        assert!(Node::entry("location", "floor2").eval(&r).unwrap());
        assert!(!Node::entry("location", "floor3").eval(&r).unwrap());
        assert!(Node::uri_prefix("ns1/bldg1").eval(&r).unwrap());
        assert!(Node::UriMatches { pattern: "ns1/+/rm1/*".to_string() }.eval(&r).unwrap());
        assert!(Node::PublishedBy { publisher: "vk1".to_string() }.eval(&r).unwrap());
        assert!(Node::KeyMatches { pattern: "^loc".to_string() }.eval(&r).unwrap());
    }

    #[test]
    fn boolean_combinators() {
        let r = rec("location", b"floor2");
        let yes = Node::key_equals("location");
        let no = Node::key_equals("owner");
        assert!(Node::and(vec![yes.clone(), Node::All]).eval(&r).unwrap());
        assert!(!Node::and(vec![yes.clone(), no.clone()]).eval(&r).unwrap());
        assert!(Node::or(vec![no.clone(), yes]).eval(&r).unwrap());
        assert!(Node::not(no).eval(&r).unwrap());
        assert!(Node::and(Vec::new()).eval(&r).unwrap());
        assert!(!Node::or(Vec::new()).eval(&r).unwrap());
    }

    #[test]
    fn invalid_regex_is_eval_error() {
        let err = Node::KeyMatches { pattern: "(".to_string() }.eval(&rec("k", b"v")).unwrap_err();
        assert!(matches!(err, ExpressionEvalError::InvalidRegex { .. }));
    }

    #[test]
    fn value_regex_requires_utf8() {
        let node = Node::ValueMatches { pattern: ".*".to_string() };
        let err = node.eval(&rec("k", &[0xff, 0xfe])).unwrap_err();
        assert!(matches!(err, ExpressionEvalError::NonUtf8Value { .. }));
        assert!(node.eval(&rec("k", b"ok")).unwrap());
    }

    #[test]
    fn expression_filters_namespace_first() {
        let expr = Expression::new(["ns2"], Node::All);
        assert!(!expr.eval(&rec("k", b"v")).unwrap());
        let expr = expr.with_namespaces(["ns1"]);
        assert!(expr.eval(&rec("k", b"v")).unwrap());
    }

    #[test]
    fn hash_ignores_namespace_order() {
        let a = Expression::new(["b", "a"], Node::key_equals("rm1"));
        let b = Expression::new(["a", "b"], Node::key_equals("rm1"));
        assert_eq!(a.hash().unwrap(), b.hash().unwrap());
        let c = Expression::new(["a", "b"], Node::key_equals("rm2"));
        assert_ne!(a.hash().unwrap(), c.hash().unwrap());
    }

    #[test]
    fn node_serializes_tagged() {
        let json = serde_json::to_value(Node::key_equals("rm1")).unwrap();
        assert_eq!(json["op"], "key_equals");
        let back: Node = serde_json::from_value(json).unwrap();
        assert_eq!(back, Node::key_equals("rm1"));
    }
}
