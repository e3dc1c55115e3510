//! Property tests over randomly generated resources.

use std::collections::BTreeSet;

use chartmerge_core::Resource;
use proptest::prelude::*;
use serde_json::{Map, Value, json};

use crate::conflict::{conflict_locations, detect};
use crate::matcher::Matcher;
use crate::paths::extract;
use crate::strategy::{MatchPolicy, MatchStrategy, PathMapStrategy, StrategyTable};
use crate::types::{IndexedResource, Match};

const FIELDS: &[&str] = &[
    "gender", "status", "birthDate", "active", "count", "value", "code", "system",
];

fn leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        "[a-c]{1,3}".prop_map(Value::from),
        (0i64..5).prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
        (1u8..4).prop_map(|d| json!(format!("2020-01-0{d}"))),
        (0i32..50).prop_map(|x| json!(f64::from(x) + 0.5)),
        Just(json!("")),
    ]
}

fn field_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        3 => leaf(),
        1 => leaf().prop_map(|v| json!({ "coding": [{ "code": v }] })),
        1 => prop::collection::vec(leaf(), 0..3).prop_map(Value::Array),
    ]
}

fn body(resource_type: &'static str) -> impl Strategy<Value = Resource> {
    prop::collection::btree_map(prop::sample::select(FIELDS), field_value(), 1..6).prop_map(
        move |fields| {
            let mut body = Map::new();
            body.insert("resourceType".into(), json!(resource_type));
            for (k, v) in fields {
                body.insert(k.to_string(), v);
            }
            Resource::from_value(Value::Object(body)).unwrap()
        },
    )
}

fn any_resource() -> impl Strategy<Value = Resource> {
    prop_oneof![body("Patient"), body("Observation"), body("Encounter")]
}

fn tagged(resources: Vec<Resource>, prefix: &str) -> Vec<Resource> {
    resources
        .into_iter()
        .enumerate()
        .map(|(i, mut r)| {
            r.set_id(format!("{prefix}{i}"));
            r
        })
        .collect()
}

fn pair(left: Resource, right: Resource) -> Match {
    Match {
        resource_type: left.resource_type().to_string(),
        left: IndexedResource::new(left),
        right: IndexedResource::new(right),
    }
}

proptest! {
    /// Extraction ignores bookkeeping and sees the same leaves every time.
    #[test]
    fn extraction_is_stable(resource in any_resource()) {
        let first = extract(&resource);
        prop_assert_eq!(&first, &extract(&resource));
        prop_assert_eq!(&first, &extract(&resource.with_new_id()));
        prop_assert!(first.keys().all(|p| p != "resourceType" && p != "id"));
    }

    /// Raising the threshold can only turn matches into non-matches.
    #[test]
    fn threshold_is_monotonic(
        left in body("Patient"),
        right in body("Patient"),
        low in 0.05f64..1.0,
        bump in 0.0f64..0.5,
    ) {
        let high = (low + bump).min(1.0);
        let (l, r) = (IndexedResource::new(left), IndexedResource::new(right));
        let strict = MatchPolicy::default().with_threshold(high);
        let loose = MatchPolicy::default().with_threshold(low);
        if PathMapStrategy.is_match(&l, &r, &strict) {
            prop_assert!(PathMapStrategy.is_match(&l, &r, &loose));
        }
    }

    /// The match ratio does not depend on which side a resource is on.
    #[test]
    fn score_is_symmetric(left in body("Observation"), right in body("Observation")) {
        let policy = MatchPolicy::default();
        let (l, r) = (extract(&left), extract(&right));
        prop_assert_eq!(policy.score(&l, &r), policy.score(&r, &l));
    }

    /// Every input resource ends up exactly once: on one side of a match or
    /// among the leftovers. Matches never cross types.
    #[test]
    fn matching_accounts_for_every_resource(
        left in prop::collection::vec(any_resource(), 0..8),
        right in prop::collection::vec(any_resource(), 0..8),
    ) {
        let left = tagged(left, "l");
        let right = tagged(right, "r");
        let expected: BTreeSet<String> = left
            .iter()
            .chain(&right)
            .filter_map(Resource::reference)
            .collect();

        let outcome = Matcher::new(MatchPolicy::default(), StrategyTable::default())
            .match_collections(left, right);

        let mut seen = Vec::new();
        for m in &outcome.matches {
            prop_assert_eq!(m.left.resource_type(), m.resource_type.as_str());
            prop_assert_eq!(m.right.resource_type(), m.resource_type.as_str());
            prop_assert!(m.left.resource.id().is_some_and(|id| id.starts_with('l')));
            prop_assert!(m.right.resource.id().is_some_and(|id| id.starts_with('r')));
            seen.extend(m.left.resource.reference());
            seen.extend(m.right.resource.reference());
        }
        seen.extend(outcome.unmatched.iter().filter_map(Resource::reference));

        prop_assert_eq!(seen.len(), expected.len());
        prop_assert_eq!(seen.into_iter().collect::<BTreeSet<_>>(), expected);
    }

    /// When every resource has at most one acceptable counterpart, swapping
    /// the collections yields the same pairs.
    #[test]
    fn pairing_is_symmetric_when_unambiguous(
        left_codes in prop::collection::btree_set("[a-f]", 0..6),
        right_codes in prop::collection::btree_set("[a-f]", 0..6),
    ) {
        let build = |codes: &BTreeSet<String>| -> Vec<Resource> {
            codes
                .iter()
                .map(|c| {
                    Resource::from_value(json!({ "resourceType": "Condition", "id": c, "status": c }))
                        .unwrap()
                })
                .collect()
        };
        let pairs = |left: Vec<Resource>, right: Vec<Resource>, swap: bool| -> BTreeSet<(String, String)> {
            Matcher::default()
                .match_collections(left, right)
                .matches
                .iter()
                .map(|m| {
                    let l = m.left.resource.id().unwrap_or_default().to_string();
                    let r = m.right.resource.id().unwrap_or_default().to_string();
                    if swap { (r, l) } else { (l, r) }
                })
                .collect()
        };

        let forward = pairs(build(&left_codes), build(&right_codes), false);
        let backward = pairs(build(&right_codes), build(&left_codes), true);
        prop_assert_eq!(&forward, &backward);
        prop_assert_eq!(forward.len(), left_codes.intersection(&right_codes).count());
    }

    /// Conflict locations are exactly the one-sided paths plus the common
    /// paths whose values differ.
    #[test]
    fn conflicts_cover_every_disagreement(left in body("Patient"), right in body("Patient")) {
        let (l, r) = (extract(&left), extract(&right));
        let locations = conflict_locations(&l, &r);

        let mut sorted = locations.clone();
        sorted.sort();
        sorted.dedup();
        prop_assert_eq!(&sorted, &locations);

        for path in l.keys().chain(r.keys()) {
            let differs = match (l.get(path), r.get(path)) {
                (Some(a), Some(b)) => a != b,
                _ => true,
            };
            prop_assert_eq!(differs, locations.contains(path), "path {}", path);
        }
    }

    /// A resource matched against a copy of itself never conflicts.
    #[test]
    fn perfect_match_has_no_conflicts(resource in any_resource()) {
        let copy = resource.with_new_id();
        let detection = detect(&pair(resource.clone(), copy));
        prop_assert!(detection.conflict.is_none());
        prop_assert_eq!(detection.target, resource);
    }
}
