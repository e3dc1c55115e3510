//! Conflict detection over matched pairs.
//!
//! Unlike matching, detection is exact and unfiltered: every common path
//! whose values differ, and every path present on only one side, is a
//! disagreement the operator has to settle.

use std::collections::BTreeSet;

use chartmerge_core::Resource;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::compare;
use crate::types::{Match, Path, PathMap};

pub const CONFLICT_SEVERITY: &str = "information";
pub const CONFLICT_CODE: &str = "conflict";
pub const REPORT_TYPE: &str = "OperationOutcome";

/// A disagreement inside one Match, and the target resource that must
/// eventually be overwritten to settle it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    pub conflict_id: String,
    pub target_type: String,
    pub target_id: String,
    pub locations: Vec<Path>,
}

impl ConflictReport {
    /// Render as an `OperationOutcome` whose id is the conflict id.
    pub fn to_resource(&self) -> Resource {
        let mut resource = Resource::new(REPORT_TYPE);
        resource.set_id(self.conflict_id.clone());
        resource.insert(
            "issue",
            json!([{
                "severity": CONFLICT_SEVERITY,
                "code": CONFLICT_CODE,
                "diagnostics": format!("{}:{}", self.target_type, self.target_id),
                "location": self.locations,
            }]),
        );
        resource
    }

    /// Parse a stored report back. `None` if it is not one of ours.
    pub fn from_resource(resource: &Resource) -> Option<Self> {
        if resource.resource_type() != REPORT_TYPE {
            return None;
        }
        let issue = resource.get("issue")?.as_array()?.first()?;
        if issue.get("code")?.as_str()? != CONFLICT_CODE {
            return None;
        }
        let (target_type, target_id) = issue.get("diagnostics")?.as_str()?.split_once(':')?;
        let locations: Vec<Path> = issue
            .get("location")
            .and_then(Value::as_array)
            .map(|locs| {
                locs.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        Some(Self {
            conflict_id: resource.id()?.to_string(),
            target_type: target_type.to_string(),
            target_id: target_id.to_string(),
            locations,
        })
    }

    pub fn report_location(&self) -> String {
        format!("{REPORT_TYPE}/{}", self.conflict_id)
    }
}

/// Outcome of checking one Match.
#[derive(Debug, Clone)]
pub struct Detection {
    /// The resource that stands for this Match in the merged record.
    pub target: Resource,
    pub conflict: Option<ConflictReport>,
}

/// Sorted, duplicate-free list of disagreeing paths: differing common
/// paths plus every one-sided path.
pub fn conflict_locations(left: &PathMap, right: &PathMap) -> Vec<Path> {
    let all: BTreeSet<&Path> = left.keys().chain(right.keys()).collect();
    all.into_iter()
        .filter(|path| match (left.get(*path), right.get(*path)) {
            (Some(l), Some(r)) => !compare::equal(l, r),
            _ => true,
        })
        .cloned()
        .collect()
}

pub fn detect(m: &Match) -> Detection {
    let locations = conflict_locations(&m.left.paths, &m.right.paths);
    if locations.is_empty() {
        return Detection {
            target: m.left.resource.clone(),
            conflict: None,
        };
    }

    let target = m.left.resource.with_new_id();
    let conflict = ConflictReport {
        conflict_id: uuid::Uuid::new_v4().to_string(),
        target_type: m.resource_type.clone(),
        target_id: target.id().unwrap_or_default().to_string(),
        locations,
    };
    tracing::debug!(
        resource_type = %m.resource_type,
        conflict_id = %conflict.conflict_id,
        paths = conflict.locations.len(),
        "Conflict detected"
    );
    Detection {
        target,
        conflict: Some(conflict),
    }
}
