//! Whole-record merge.
//!
//! Pairs the two collections, checks the anchor identity, runs conflict
//! detection over every pair and assembles the target record. A merge with
//! no conflicts is returned directly and leaves no trace in either store; a
//! merge with conflicts writes the target and one report per conflict to the
//! resource store and opens a session to track their resolution.

use std::collections::BTreeMap;
use std::sync::Arc;

use chartmerge_core::config::MergeSettings;
use chartmerge_core::resource::{bundle_entries, collection_bundle};
use chartmerge_core::{ConflictState, MergeSession, Resource, ResourceStore, SessionStore, StoreError};
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::conflict::{self, ConflictReport};
use crate::error::MergeError;
use crate::matcher::Matcher;
use crate::strategy::{MatchPolicy, StrategyTable};

pub const TARGET_LIST_TYPE: &str = "List";

/// One resource of the target record.
#[derive(Debug, Clone)]
pub struct TargetEntry {
    pub resource: Resource,
    /// Whether a conflict report points at this entry.
    pub conflicted: bool,
}

/// Store-independent result of merging two collections.
#[derive(Debug, Clone)]
pub struct MergePlan {
    pub target: Vec<TargetEntry>,
    pub conflicts: Vec<ConflictReport>,
}

impl MergePlan {
    pub fn target_bundle(&self) -> Resource {
        collection_bundle(self.target.iter().map(|e| e.resource.clone()))
    }
}

#[derive(Debug, Clone)]
pub enum MergeOutcome {
    /// No conflicts: the merged record, as a collection Bundle.
    Merged(Resource),
    /// Conflicts were found and a session now tracks them.
    Conflicts {
        session: MergeSession,
        conflicts: Vec<ConflictReport>,
    },
}

pub struct MergeEngine {
    pub(crate) resources: Arc<dyn ResourceStore>,
    pub(crate) sessions: Arc<dyn SessionStore>,
    matcher: Matcher,
    anchor_type: String,
    /// One lock per session id. Every workflow operation on a session holds
    /// it from its guard check through its last store write.
    session_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl MergeEngine {
    pub fn new(
        resources: Arc<dyn ResourceStore>,
        sessions: Arc<dyn SessionStore>,
        settings: &MergeSettings,
    ) -> Self {
        Self {
            resources,
            sessions,
            matcher: Matcher::new(MatchPolicy::from_settings(settings), StrategyTable::default()),
            anchor_type: settings.anchor_type.clone(),
            session_locks: DashMap::new(),
        }
    }

    /// Swap in a strategy table built by the caller.
    pub fn with_strategies(mut self, strategies: StrategyTable) -> Self {
        self.matcher = Matcher::new(self.matcher.policy().clone(), strategies);
        self
    }

    pub fn anchor_type(&self) -> &str {
        &self.anchor_type
    }

    /// Match, check the anchor, detect conflicts and assemble the target.
    pub fn plan(&self, left: Vec<Resource>, right: Vec<Resource>) -> Result<MergePlan, MergeError> {
        let outcome = self.matcher.match_collections(left, right);

        let anchors = outcome
            .matches
            .iter()
            .filter(|m| m.resource_type == self.anchor_type)
            .count();
        match anchors {
            0 => return Err(MergeError::AnchorUnmatched(self.anchor_type.clone())),
            1 => {}
            count => {
                return Err(MergeError::AnchorAmbiguous {
                    resource_type: self.anchor_type.clone(),
                    count,
                })
            }
        }

        let mut clean = Vec::new();
        let mut conflicted = Vec::new();
        let mut conflicts = Vec::new();
        for m in &outcome.matches {
            let detection = conflict::detect(m);
            match detection.conflict {
                Some(report) => {
                    conflicts.push(report);
                    conflicted.push(detection.target);
                }
                None => clean.push(detection.target),
            }
        }

        let mut target: Vec<TargetEntry> = outcome
            .unmatched
            .into_iter()
            .chain(clean)
            .map(|resource| TargetEntry {
                resource,
                conflicted: false,
            })
            .collect();
        target.extend(conflicted.into_iter().map(|resource| TargetEntry {
            resource,
            conflicted: true,
        }));

        Ok(MergePlan { target, conflicts })
    }

    pub async fn merge(&self, source1: &str, source2: &str) -> Result<MergeOutcome, MergeError> {
        if source1.trim().is_empty() || source2.trim().is_empty() {
            return Err(MergeError::InvalidInput(
                "two source record locations are required".into(),
            ));
        }

        let left = self.load_collection(source1).await?;
        let right = self.load_collection(source2).await?;
        tracing::info!(
            source1,
            source2,
            left = left.len(),
            right = right.len(),
            "Merging records"
        );

        let plan = self.plan(left, right)?;
        if plan.conflicts.is_empty() {
            tracing::info!(entries = plan.target.len(), "Merged without conflicts");
            return Ok(MergeOutcome::Merged(plan.target_bundle()));
        }

        let session = self.persist(&plan, source1, source2).await?;
        tracing::info!(
            session_id = %session.session_id,
            conflicts = plan.conflicts.len(),
            target = %session.target_location,
            "Merge session opened"
        );
        Ok(MergeOutcome::Conflicts {
            session,
            conflicts: plan.conflicts,
        })
    }

    /// Load a source record: a Bundle's entries, or a single resource.
    async fn load_collection(&self, location: &str) -> Result<Vec<Resource>, MergeError> {
        let resource = self
            .resources
            .fetch_url(location)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => MergeError::SourceNotFound(location.to_string()),
                other => MergeError::Store(other),
            })?;
        if resource.resource_type() == "Bundle" {
            Ok(bundle_entries(&resource))
        } else {
            Ok(vec![resource])
        }
    }

    async fn persist(
        &self,
        plan: &MergePlan,
        source1: &str,
        source2: &str,
    ) -> Result<MergeSession, MergeError> {
        let mut references = Vec::with_capacity(plan.target.len());
        for entry in &plan.target {
            // Conflicted entries keep the id their report points at; the
            // rest are stored as fresh copies so sources are never touched.
            let stored = if entry.conflicted {
                self.resources.replace(&entry.resource).await?
            } else {
                self.resources.create(&entry.resource).await?
            };
            references.extend(stored.reference());
        }

        let list = self.resources.create(&target_list(&references)).await?;
        let target_location = list.reference().ok_or_else(|| {
            MergeError::Store(StoreError::Decode("stored target list has no id".into()))
        })?;

        let mut states = BTreeMap::new();
        for report in &plan.conflicts {
            self.resources.replace(&report.to_resource()).await?;
            states.insert(
                report.conflict_id.clone(),
                ConflictState {
                    report_location: report.report_location(),
                    target_type: report.target_type.clone(),
                    target_id: report.target_id.clone(),
                    resolved: false,
                    deleted: false,
                },
            );
        }

        let session = MergeSession::new(target_location, states).with_sources(source1, source2);
        self.sessions.insert(&session).await?;
        Ok(session)
    }

    pub(crate) async fn lock_session(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .session_locks
            .entry(session_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    pub(crate) fn forget_session_lock(&self, session_id: &str) {
        self.session_locks.remove(session_id);
    }

    /// The target record as a collection Bundle.
    pub(crate) async fn read_target(&self, location: &str) -> Result<Resource, MergeError> {
        let list = self
            .resources
            .fetch_url(location)
            .await
            .map_err(MergeError::artifact)?;
        let mut resources = Vec::new();
        for reference in list_references(&list) {
            let resource = self
                .resources
                .fetch_url(&reference)
                .await
                .map_err(MergeError::artifact)?;
            resources.push(resource);
        }
        Ok(collection_bundle(resources))
    }

    /// Remove one entry from the stored target list.
    pub(crate) async fn unlink_target_entry(
        &self,
        location: &str,
        reference: &str,
    ) -> Result<(), MergeError> {
        let list = self
            .resources
            .fetch_url(location)
            .await
            .map_err(MergeError::artifact)?;
        let remaining: Vec<String> = list_references(&list)
            .into_iter()
            .filter(|r| r != reference)
            .collect();
        let mut updated = target_list(&remaining);
        if let Some(id) = list.id() {
            updated.set_id(id);
        }
        self.resources.replace(&updated).await?;
        Ok(())
    }
}

fn target_list(references: &[String]) -> Resource {
    let mut list = Resource::new(TARGET_LIST_TYPE);
    list.insert("status", json!("current"));
    list.insert("mode", json!("working"));
    list.insert("title", json!("Merge target"));
    let entries: Vec<Value> = references
        .iter()
        .map(|r| json!({ "item": { "reference": r } }))
        .collect();
    list.insert("entry", Value::Array(entries));
    list
}

pub(crate) fn list_references(list: &Resource) -> Vec<String> {
    list.get("entry")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| e.pointer("/item/reference").and_then(Value::as_str))
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}
