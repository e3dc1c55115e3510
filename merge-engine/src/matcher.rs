//! Pairing resources across two record collections.
//!
//! Resources are grouped by type. Types present on only one side cannot
//! match and go straight to the leftovers. For shared types, each left
//! resource claims the first still-unclaimed right resource its strategy
//! accepts (greedy matching without replacement), so results depend only on
//! input order.

use std::collections::HashMap;

use chartmerge_core::Resource;

use crate::strategy::{MatchPolicy, StrategyTable};
use crate::types::{IndexedResource, Match, MatchOutcome};

pub struct Matcher {
    policy: MatchPolicy,
    strategies: StrategyTable,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new(MatchPolicy::default(), StrategyTable::default())
    }
}

impl Matcher {
    pub fn new(policy: MatchPolicy, strategies: StrategyTable) -> Self {
        Self { policy, strategies }
    }

    pub fn policy(&self) -> &MatchPolicy {
        &self.policy
    }

    pub fn match_collections(&self, left: Vec<Resource>, right: Vec<Resource>) -> MatchOutcome {
        let left_groups = group_by_type(left);
        let mut right_groups = group_by_type(right);

        let mut matches = Vec::new();
        let mut unmatched_left = Vec::new();
        let mut unmatched_right = Vec::new();

        for (resource_type, left_group) in left_groups {
            let Some(idx) = right_groups.iter().position(|(t, _)| *t == resource_type) else {
                unmatched_left.extend(left_group.into_iter().map(|r| r.resource));
                continue;
            };
            let (_, right_group) = right_groups.remove(idx);
            let (found, left_rest, right_rest) =
                self.match_group(&resource_type, left_group, right_group);
            tracing::debug!(
                resource_type = %resource_type,
                matched = found.len(),
                left_unmatched = left_rest.len(),
                right_unmatched = right_rest.len(),
                "Matched resource group"
            );
            matches.extend(found);
            unmatched_left.extend(left_rest);
            unmatched_right.extend(right_rest);
        }

        // Whatever is left had no counterpart type on the left side.
        let mut right_only = Vec::new();
        for (_, group) in right_groups {
            right_only.extend(group.into_iter().map(|r| r.resource));
        }

        let mut unmatched = unmatched_left;
        unmatched.extend(unmatched_right);
        unmatched.extend(right_only);
        MatchOutcome { matches, unmatched }
    }

    fn match_group(
        &self,
        resource_type: &str,
        left: Vec<IndexedResource>,
        right: Vec<IndexedResource>,
    ) -> (Vec<Match>, Vec<Resource>, Vec<Resource>) {
        let strategy = self.strategies.for_type(resource_type);
        let mut remaining: Vec<Option<IndexedResource>> = right.into_iter().map(Some).collect();
        let mut matches = Vec::new();
        let mut left_rest = Vec::new();

        for l in left {
            let claimed = remaining.iter_mut().find(|slot| {
                slot.as_ref()
                    .is_some_and(|r| strategy.is_match(&l, r, &self.policy))
            });
            match claimed.and_then(Option::take) {
                Some(r) => matches.push(Match {
                    resource_type: resource_type.to_string(),
                    left: l,
                    right: r,
                }),
                None => left_rest.push(l.resource),
            }
        }

        let right_rest = remaining.into_iter().flatten().map(|r| r.resource).collect();
        (matches, left_rest, right_rest)
    }
}

/// Group by resource type, keeping types in order of first appearance and
/// resources in input order within each type.
fn group_by_type(resources: Vec<Resource>) -> Vec<(String, Vec<IndexedResource>)> {
    let mut groups: Vec<(String, Vec<IndexedResource>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for resource in resources {
        let resource_type = resource.resource_type().to_string();
        let slot = *index.entry(resource_type.clone()).or_insert_with(|| {
            groups.push((resource_type, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(IndexedResource::new(resource));
    }
    groups
}
