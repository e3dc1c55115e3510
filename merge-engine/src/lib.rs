//! # merge-engine
//!
//! Merges two independently kept patient records into one, surfacing every
//! disagreement as an individually resolvable conflict instead of silently
//! picking a winner.
//!
//! ## Pipeline
//!
//! 1. **Path extraction**: each resource is flattened into a map from leaf
//!    path (`name[0].family`) to typed leaf value. Dates and timestamps stay
//!    single leaves; empty strings and nulls are absences, zero and `false`
//!    are values.
//!
//! 2. **Record matching**: resources are grouped by type and paired greedily
//!    without replacement. A pair matches when enough of their shared,
//!    identity-neutral paths agree under fuzzy comparison (float tolerance,
//!    same-UTC-day timestamps).
//!
//! 3. **Conflict detection**: within each pair, every path that differs
//!    exactly or exists on one side only becomes a conflict location.
//!
//! 4. **Orchestration**: the target record is assembled from unmatched
//!    resources and one resource per pair. Without conflicts it is returned
//!    directly; otherwise it is stored alongside one `OperationOutcome` per
//!    conflict and a merge session tracks resolution until completion or
//!    abort.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use chartmerge_core::config::MergeSettings;
//! use chartmerge_core::store::{MemoryResourceStore, MemorySessionStore};
//! use chartmerge_core::Resource;
//! use merge_engine::MergeEngine;
//!
//! let engine = MergeEngine::new(
//!     Arc::new(MemoryResourceStore::new()),
//!     Arc::new(MemorySessionStore::new()),
//!     &MergeSettings::default(),
//! );
//! let patient = Resource::from_value(serde_json::json!({
//!     "resourceType": "Patient",
//!     "gender": "female",
//!     "birthDate": "1984-02-11"
//! })).unwrap();
//!
//! let plan = engine.plan(vec![patient.clone()], vec![patient]).unwrap();
//! assert!(plan.conflicts.is_empty());
//! assert_eq!(plan.target.len(), 1);
//! ```

pub mod compare;
pub mod conflict;
pub mod error;
pub mod matcher;
pub mod orchestrator;
pub mod paths;
pub mod strategy;
pub mod types;
pub mod workflow;

#[cfg(test)]
mod properties;

// Re-export primary public API
pub use conflict::{ConflictReport, Detection};
pub use error::{ErrorCategory, MergeError};
pub use matcher::Matcher;
pub use orchestrator::{MergeEngine, MergeOutcome, MergePlan, TargetEntry};
pub use strategy::{MatchPolicy, MatchStrategy, PathMapStrategy, RequiredPathsStrategy, StrategyTable};
pub use types::{IndexedResource, LeafValue, Match, MatchOutcome, PathMap, Temporal};
pub use workflow::ResolveOutcome;
