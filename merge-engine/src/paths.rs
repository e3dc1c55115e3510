//! Path extraction: flatten a resource into a [`PathMap`].
//!
//! The walk is driven entirely by the JSON shape, so any resource type works
//! without per-type code. Objects contribute a `.field` segment, arrays an
//! `[index]` segment, and every populated scalar becomes one leaf.

use chartmerge_core::Resource;
use serde_json::Value;

use crate::types::{LeafValue, PathMap};

/// Top-level fields that are store bookkeeping rather than content.
const BOOKKEEPING_FIELDS: &[&str] = &["resourceType", "id", "meta"];

pub fn extract(resource: &Resource) -> PathMap {
    let mut out = PathMap::new();
    for (field, value) in resource.fields() {
        if BOOKKEEPING_FIELDS.contains(&field.as_str()) {
            continue;
        }
        visit(field.clone(), value, &mut out);
    }
    out
}

fn visit(path: String, value: &Value, out: &mut PathMap) {
    match value {
        Value::Null => {}
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                visit(format!("{path}[{i}]"), item, out);
            }
        }
        Value::Object(fields) => {
            for (field, child) in fields {
                let child_path = if path.is_empty() {
                    field.clone()
                } else {
                    format!("{path}.{field}")
                };
                visit(child_path, child, out);
            }
        }
        scalar => {
            if let Some(leaf) = LeafValue::from_json(scalar) {
                out.insert(path, leaf);
            }
        }
    }
}
