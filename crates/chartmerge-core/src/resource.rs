//! Self-describing clinical resources.
//!
//! A resource is kept as the JSON object it arrived as. Every resource carries
//! a `resourceType` tag and (usually) an `id`; everything else is an opaque
//! nested tree that the merge engine walks generically.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Resource {
    body: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("resource must be a JSON object")]
    NotAnObject,
    #[error("resource has no resourceType")]
    MissingType,
}

impl Resource {
    /// Empty resource of the given type.
    pub fn new(resource_type: &str) -> Self {
        let mut body = Map::new();
        body.insert("resourceType".into(), Value::String(resource_type.into()));
        Self { body }
    }

    pub fn from_value(value: Value) -> Result<Self, ResourceError> {
        let Value::Object(body) = value else {
            return Err(ResourceError::NotAnObject);
        };
        match body.get("resourceType") {
            Some(Value::String(t)) if !t.is_empty() => Ok(Self { body }),
            _ => Err(ResourceError::MissingType),
        }
    }

    pub fn resource_type(&self) -> &str {
        self.body
            .get("resourceType")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn id(&self) -> Option<&str> {
        self.body
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.body.insert("id".into(), Value::String(id.into()));
    }

    /// Copy of this resource under a freshly generated id.
    pub fn with_new_id(&self) -> Self {
        let mut copy = self.clone();
        copy.set_id(uuid::Uuid::new_v4().to_string());
        copy
    }

    /// Relative reference in `Type/id` form, if the resource has an id.
    pub fn reference(&self) -> Option<String> {
        self.id().map(|id| format!("{}/{}", self.resource_type(), id))
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.body
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.body.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) {
        self.body.insert(field.into(), value);
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.body)
    }
}

impl TryFrom<Value> for Resource {
    type Error = ResourceError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Resource::from_value(value)
    }
}

impl From<Resource> for Value {
    fn from(resource: Resource) -> Self {
        resource.into_value()
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id() {
            Some(id) => write!(f, "{}/{}", self.resource_type(), id),
            None => write!(f, "{}/<new>", self.resource_type()),
        }
    }
}

/// Pull `entry[].resource` out of a Bundle, skipping anything that is not a
/// usable resource.
pub fn bundle_entries(bundle: &Resource) -> Vec<Resource> {
    bundle
        .get("entry")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.get("resource").cloned())
                .filter_map(|value| Resource::from_value(value).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Wrap resources in a `collection` Bundle.
pub fn collection_bundle(resources: impl IntoIterator<Item = Resource>) -> Resource {
    let entry: Vec<Value> = resources
        .into_iter()
        .map(|r| serde_json::json!({ "resource": r.into_value() }))
        .collect();
    let mut bundle = Resource::new("Bundle");
    bundle.insert("type", Value::String("collection".into()));
    bundle.insert("total", Value::from(entry.len()));
    bundle.insert("entry", Value::Array(entry));
    bundle
}
