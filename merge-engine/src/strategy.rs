//! Matching strategies, selected per resource type.
//!
//! The matcher is handed a [`StrategyTable`] when it is built. Types without
//! a registered strategy fall back to [`PathMapStrategy`].

use std::collections::HashMap;
use std::sync::Arc;

use chartmerge_core::config::MergeSettings;

use crate::compare::Comparator;
use crate::types::{IndexedResource, PathMap};

pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.8;

/// Knobs shared by every strategy.
#[derive(Debug, Clone)]
pub struct MatchPolicy {
    pub threshold: f64,
    pub comparator: Comparator,
    /// Lowercased path substrings that never count toward a match ratio.
    unsuitable_tokens: Vec<String>,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self::from_settings(&MergeSettings::default())
    }
}

impl MatchPolicy {
    pub fn from_settings(settings: &MergeSettings) -> Self {
        Self {
            threshold: settings.match_threshold,
            comparator: Comparator::new(settings.float_tolerance),
            unsuitable_tokens: settings
                .unsuitable_path_tokens
                .iter()
                .map(|t| t.to_lowercase())
                .collect(),
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Identifiers, coding systems, references and free text say nothing
    /// about whether two records describe the same entity.
    pub fn is_unsuitable(&self, path: &str) -> bool {
        let lowered = path.to_lowercase();
        self.unsuitable_tokens
            .iter()
            .any(|token| lowered.contains(token.as_str()))
    }

    /// Fraction of usable common paths whose values fuzzy-match, or `None`
    /// when there are no usable common paths at all.
    pub fn score(&self, left: &PathMap, right: &PathMap) -> Option<f64> {
        let mut usable = 0usize;
        let mut agreeing = 0usize;
        for (path, lv) in left {
            let Some(rv) = right.get(path) else {
                continue;
            };
            if self.is_unsuitable(path) {
                continue;
            }
            usable += 1;
            if self.comparator.fuzzy_match(lv, rv) {
                agreeing += 1;
            }
        }
        if usable == 0 {
            None
        } else {
            Some(agreeing as f64 / usable as f64)
        }
    }
}

/// Decides whether two same-typed resources describe the same entity.
pub trait MatchStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn is_match(
        &self,
        left: &IndexedResource,
        right: &IndexedResource,
        policy: &MatchPolicy,
    ) -> bool;
}

/// Generic PathMap ratio comparison.
#[derive(Debug, Default, Clone, Copy)]
pub struct PathMapStrategy;

impl MatchStrategy for PathMapStrategy {
    fn name(&self) -> &str {
        "path-map"
    }

    fn is_match(
        &self,
        left: &IndexedResource,
        right: &IndexedResource,
        policy: &MatchPolicy,
    ) -> bool {
        match policy.score(&left.paths, &right.paths) {
            Some(ratio) => ratio >= policy.threshold,
            None => false,
        }
    }
}

/// Stricter variant: the listed paths must exist on both sides and agree
/// before the ratio is even considered.
#[derive(Debug, Clone)]
pub struct RequiredPathsStrategy {
    required: Vec<String>,
}

impl RequiredPathsStrategy {
    pub fn new(required: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            required: required.into_iter().map(Into::into).collect(),
        }
    }
}

impl MatchStrategy for RequiredPathsStrategy {
    fn name(&self) -> &str {
        "required-paths"
    }

    fn is_match(
        &self,
        left: &IndexedResource,
        right: &IndexedResource,
        policy: &MatchPolicy,
    ) -> bool {
        let required_agree = self.required.iter().all(|path| {
            match (left.paths.get(path), right.paths.get(path)) {
                (Some(l), Some(r)) => policy.comparator.fuzzy_match(l, r),
                _ => false,
            }
        });
        required_agree && PathMapStrategy.is_match(left, right, policy)
    }
}

#[derive(Clone)]
pub struct StrategyTable {
    default: Arc<dyn MatchStrategy>,
    by_type: HashMap<String, Arc<dyn MatchStrategy>>,
}

impl Default for StrategyTable {
    fn default() -> Self {
        Self {
            default: Arc::new(PathMapStrategy),
            by_type: HashMap::new(),
        }
    }
}

impl StrategyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        resource_type: impl Into<String>,
        strategy: Arc<dyn MatchStrategy>,
    ) -> Self {
        self.by_type.insert(resource_type.into(), strategy);
        self
    }

    pub fn for_type(&self, resource_type: &str) -> &dyn MatchStrategy {
        self.by_type
            .get(resource_type)
            .unwrap_or(&self.default)
            .as_ref()
    }
}
