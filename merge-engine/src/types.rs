//! Core types for the merge engine.
//!
//! A resource is reduced to a [`PathMap`]: every populated leaf, keyed by the
//! dotted/indexed path that reaches it. Leaves come in a handful of kinds:
//! - **Text**: non-empty strings
//! - **Integer** / **Float** / **Bool**: scalars, kept even when zero/false
//! - **Temporal**: dates and instants, compared as one unit

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate};
use chartmerge_core::Resource;
use serde_json::Value;

use crate::paths;

/// Address of one leaf inside a resource, e.g. `name[0].family`.
pub type Path = String;

/// Flattened path → leaf view of one resource.
pub type PathMap = BTreeMap<Path, LeafValue>;

/// A date or a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Temporal {
    /// Day precision, no time zone (`2021-03-04`).
    Date(NaiveDate),
    /// Full timestamp with its original offset.
    Instant(DateTime<FixedOffset>),
}

impl Temporal {
    /// Recognize `YYYY-MM-DD` dates and RFC 3339 timestamps. Partial dates
    /// (`YYYY`, `YYYY-MM`) and local times without an offset are not
    /// temporal leaves.
    pub fn parse(s: &str) -> Option<Self> {
        let bytes = s.as_bytes();
        if bytes.len() == 10 && bytes[4] == b'-' && bytes[7] == b'-' {
            return NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .map(Temporal::Date);
        }
        if bytes.len() > 10 && bytes[10] == b'T' {
            return DateTime::parse_from_rfc3339(s).ok().map(Temporal::Instant);
        }
        None
    }
}

impl fmt::Display for Temporal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Temporal::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Temporal::Instant(t) => write!(f, "{}", t.to_rfc3339()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LeafValue {
    Text(String),
    Integer(i128),
    Float(f64),
    Bool(bool),
    Temporal(Temporal),
}

impl LeafValue {
    pub fn kind(&self) -> &'static str {
        match self {
            LeafValue::Text(_) => "text",
            LeafValue::Integer(_) => "integer",
            LeafValue::Float(_) => "float",
            LeafValue::Bool(_) => "bool",
            LeafValue::Temporal(_) => "temporal",
        }
    }

    /// Leaf for a JSON scalar. `None` for absent values: null, empty
    /// strings, and containers.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(match Temporal::parse(s) {
                Some(t) => LeafValue::Temporal(t),
                None => LeafValue::Text(s.clone()),
            }),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(LeafValue::Integer(i128::from(i)))
                } else if let Some(u) = n.as_u64() {
                    Some(LeafValue::Integer(i128::from(u)))
                } else {
                    n.as_f64().map(LeafValue::Float)
                }
            }
            Value::Bool(b) => Some(LeafValue::Bool(*b)),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }
}

impl fmt::Display for LeafValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeafValue::Text(s) => write!(f, "{s}"),
            LeafValue::Integer(i) => write!(f, "{i}"),
            LeafValue::Float(x) => write!(f, "{x}"),
            LeafValue::Bool(b) => write!(f, "{b}"),
            LeafValue::Temporal(t) => write!(f, "{t}"),
        }
    }
}

/// A resource together with its PathMap, built once and shared by the
/// matcher and the conflict detector.
#[derive(Debug, Clone)]
pub struct IndexedResource {
    pub resource: Resource,
    pub paths: PathMap,
}

impl IndexedResource {
    pub fn new(resource: Resource) -> Self {
        let paths = paths::extract(&resource);
        Self { resource, paths }
    }

    pub fn resource_type(&self) -> &str {
        self.resource.resource_type()
    }
}

/// Two resources, one from each collection, judged to be the same entity.
/// Both sides always share `resource_type`.
#[derive(Debug, Clone)]
pub struct Match {
    pub resource_type: String,
    pub left: IndexedResource,
    pub right: IndexedResource,
}

/// Result of pairing two collections.
#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    pub matches: Vec<Match>,
    /// Left-collection leftovers first, then right-collection leftovers.
    pub unmatched: Vec<Resource>,
}
