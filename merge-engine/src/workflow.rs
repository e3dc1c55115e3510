//! Merge session lifecycle: resolve, complete, abort, delete-conflict, and
//! the read-only views over a session.
//!
//! Each mutating operation holds the engine's lock for its session from the
//! guard check through its final store write, so operations on one session
//! never interleave within a process. The session store's conditional update
//! still re-checks every guard, which is what arbitrates between processes
//! sharing a session store.
//!
//! Store writes are ordered so that a failure part-way leaves the session in
//! a state from which the same call can simply be retried: artifacts are
//! deleted before the session stops pointing at them.

use chartmerge_core::resource::collection_bundle;
use chartmerge_core::session::{Rejection, UpdateError};
use chartmerge_core::{ConflictState, MergeSession, Resource, SessionUpdate, StoreError};
use serde_json::Value;

use crate::error::MergeError;
use crate::orchestrator::{MergeEngine, list_references};

#[derive(Debug, Clone)]
pub enum ResolveOutcome {
    /// Other conflicts remain; Bundle of their reports.
    Open(Resource),
    /// That was the last one; Bundle of the finished target.
    Completed(Resource),
}

impl MergeEngine {
    pub async fn session(&self, session_id: &str) -> Result<MergeSession, MergeError> {
        self.sessions
            .find(session_id)
            .await?
            .ok_or_else(|| MergeError::SessionNotFound(session_id.to_string()))
    }

    pub async fn sessions(&self) -> Result<Vec<MergeSession>, MergeError> {
        Ok(self.sessions.list().await?)
    }

    /// Overwrite a conflict's target with `replacement` and mark it resolved.
    /// Resolving the last open conflict completes the session.
    ///
    /// If an earlier call resolved the last conflict but failed while
    /// completing, calling again with any of the session's conflicts finishes
    /// the completion.
    pub async fn resolve(
        &self,
        session_id: &str,
        conflict_id: &str,
        replacement: Value,
    ) -> Result<ResolveOutcome, MergeError> {
        let _lock = self.lock_session(session_id).await;
        let session = self.session(session_id).await?;

        if completion_pending(&session) && session.conflicts.contains_key(conflict_id) {
            tracing::info!(session_id, "Resuming interrupted completion");
            let target = self.finish(session_id).await?;
            return Ok(ResolveOutcome::Completed(target));
        }

        let state = open_conflict(&session, conflict_id)
            .inspect_err(|e| tracing::warn!(session_id, conflict_id, "Resolve rejected: {e}"))?;

        let mut resource = Resource::from_value(replacement)
            .map_err(|e| MergeError::InvalidInput(format!("replacement resource: {e}")))?;
        if resource.resource_type() != state.target_type {
            return Err(MergeError::InvalidInput(format!(
                "replacement must be a {}, got {}",
                state.target_type,
                resource.resource_type()
            )));
        }
        resource.set_id(state.target_id.clone());
        self.resources.replace(&resource).await?;

        let updated = self
            .sessions
            .update(
                session_id,
                SessionUpdate::ResolveConflict {
                    conflict_id: conflict_id.to_string(),
                },
            )
            .await
            .map_err(|e| MergeError::from_update(session_id, e))?;
        tracing::info!(
            session_id,
            conflict_id,
            remaining = updated.unresolved_count(),
            "Conflict resolved"
        );

        if updated.unresolved_count() == 0 {
            let target = self.finish(session_id).await?;
            return Ok(ResolveOutcome::Completed(target));
        }
        Ok(ResolveOutcome::Open(self.report_bundle(updated.unresolved()).await?))
    }

    /// Finish a fully resolved session: delete every conflict report, mark
    /// the conflicts deleted, mark the session completed, and return the
    /// target.
    ///
    /// Safe to call again after a partial failure; steps already done are
    /// skipped.
    pub async fn complete(&self, session_id: &str) -> Result<Resource, MergeError> {
        let _lock = self.lock_session(session_id).await;
        self.finish(session_id).await
    }

    async fn finish(&self, session_id: &str) -> Result<Resource, MergeError> {
        let session = self.session(session_id).await?;
        let open = session.unresolved_count();
        if open > 0 {
            return Err(MergeError::ConflictsUnresolved {
                session_id: session_id.to_string(),
                open,
            });
        }

        if session.conflicts.values().any(|c| !c.deleted) {
            for state in session.conflicts.values().filter(|c| !c.deleted) {
                delete_if_present(self, &state.report_location).await?;
            }
            self.sessions
                .update(session_id, SessionUpdate::MarkConflictsDeleted)
                .await
                .map_err(|e| MergeError::from_update(session_id, e))?;
        }

        if !session.completed {
            match self
                .sessions
                .update(session_id, SessionUpdate::CompleteSession)
                .await
            {
                Ok(_) => tracing::info!(session_id, "Merge session completed"),
                // Another process got there first.
                Err(UpdateError::Rejected(Rejection::SessionCompleted(_))) => {}
                Err(e) => return Err(MergeError::from_update(session_id, e)),
            }
        }

        self.read_target(&session.target_location).await
    }

    /// Cancel a session: delete the target, every report, and the session.
    /// The session record goes last, so a failed abort can be retried.
    pub async fn abort(&self, session_id: &str) -> Result<(), MergeError> {
        let lock = self.lock_session(session_id).await;
        let session = self.session(session_id).await?;

        match self.resources.fetch_url(&session.target_location).await {
            Ok(list) => {
                for reference in list_references(&list) {
                    delete_if_present(self, &reference).await?;
                }
                delete_if_present(self, &session.target_location).await?;
            }
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        for state in session.conflicts.values() {
            // A conflict target that was unlinked from the list goes too.
            delete_if_present(self, &target_reference(state)).await?;
            delete_if_present(self, &state.report_location).await?;
        }

        match self.sessions.remove(session_id).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        drop(lock);
        self.forget_session_lock(session_id);
        tracing::info!(session_id, "Merge session aborted");
        Ok(())
    }

    /// Discard one unresolved conflict along with its target resource.
    ///
    /// The conflict stays in the session until its target and report are
    /// gone, so a failed call can be retried and an abort still finds them.
    pub async fn delete_conflict(
        &self,
        session_id: &str,
        conflict_id: &str,
    ) -> Result<(), MergeError> {
        let _lock = self.lock_session(session_id).await;
        let session = self.session(session_id).await?;
        let state = open_conflict(&session, conflict_id)
            .inspect_err(|e| tracing::warn!(session_id, conflict_id, "Delete rejected: {e}"))?;

        let reference = target_reference(state);
        self.unlink_target_entry(&session.target_location, &reference)
            .await?;
        delete_if_present(self, &reference).await?;
        delete_if_present(self, &state.report_location).await?;

        let updated = self
            .sessions
            .update(
                session_id,
                SessionUpdate::DropConflict {
                    conflict_id: conflict_id.to_string(),
                },
            )
            .await
            .map_err(|e| MergeError::from_update(session_id, e))?;
        tracing::info!(session_id, conflict_id, "Conflict deleted");

        if updated.unresolved_count() == 0 {
            self.finish(session_id).await?;
        }
        Ok(())
    }

    /// Reports of the conflicts still awaiting resolution.
    pub async fn open_conflicts(&self, session_id: &str) -> Result<Resource, MergeError> {
        let session = self.session(session_id).await?;
        self.report_bundle(session.unresolved()).await
    }

    /// Reports of resolved conflicts whose reports still exist.
    pub async fn resolved_conflicts(&self, session_id: &str) -> Result<Resource, MergeError> {
        let session = self.session(session_id).await?;
        self.report_bundle(session.resolved().filter(|(_, c)| !c.deleted))
            .await
    }

    /// Current state of the target record.
    pub async fn target(&self, session_id: &str) -> Result<Resource, MergeError> {
        let session = self.session(session_id).await?;
        self.read_target(&session.target_location).await
    }

    async fn report_bundle<'a>(
        &self,
        conflicts: impl Iterator<Item = (&'a String, &'a ConflictState)>,
    ) -> Result<Resource, MergeError> {
        let mut reports = Vec::new();
        for (_, state) in conflicts {
            let report = self
                .resources
                .fetch_url(&state.report_location)
                .await
                .map_err(MergeError::artifact)?;
            reports.push(report);
        }
        Ok(collection_bundle(reports))
    }
}

/// Every conflict is resolved but the session never reached `completed`.
fn completion_pending(session: &MergeSession) -> bool {
    !session.completed && session.unresolved_count() == 0
}

fn open_conflict<'a>(
    session: &'a MergeSession,
    conflict_id: &str,
) -> Result<&'a ConflictState, MergeError> {
    if session.completed {
        return Err(MergeError::SessionCompleted(session.session_id.clone()));
    }
    let state = session
        .conflicts
        .get(conflict_id)
        .ok_or_else(|| MergeError::ConflictNotFound {
            session_id: session.session_id.clone(),
            conflict_id: conflict_id.to_string(),
        })?;
    if state.deleted {
        return Err(MergeError::ConflictDeleted(conflict_id.to_string()));
    }
    if state.resolved {
        return Err(MergeError::ConflictAlreadyResolved(conflict_id.to_string()));
    }
    Ok(state)
}

fn target_reference(state: &ConflictState) -> String {
    format!("{}/{}", state.target_type, state.target_id)
}

/// Delete, treating "already gone" as success so retries converge.
async fn delete_if_present(engine: &MergeEngine, url: &str) -> Result<(), MergeError> {
    match engine.resources.delete_url(url).await {
        Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCategory;
    use crate::orchestrator::MergeOutcome;
    use chartmerge_core::config::MergeSettings;
    use chartmerge_core::resource::bundle_entries;
    use chartmerge_core::store::{MemoryResourceStore, MemorySessionStore};
    use chartmerge_core::{ResourceStore, SessionStore};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Memory store with injectable faults: a one-shot delete failure for
    /// urls with a given prefix, and a slow `replace` for patients with a
    /// given marital status code.
    struct FaultyStore {
        inner: Arc<MemoryResourceStore>,
        faults: Mutex<Faults>,
    }

    #[derive(Default)]
    struct Faults {
        fail_delete: Option<String>,
        slow_marital: Option<String>,
    }

    impl FaultyStore {
        fn fail_next_delete(&self, prefix: &str) {
            self.faults.lock().unwrap().fail_delete = Some(prefix.to_string());
        }

        fn slow_replace_for(&self, marital: &str) {
            self.faults.lock().unwrap().slow_marital = Some(marital.to_string());
        }
    }

    fn marital_code(resource: &Resource) -> Option<&str> {
        resource
            .get("maritalStatus")?
            .pointer("/coding/0/code")?
            .as_str()
    }

    #[async_trait::async_trait]
    impl ResourceStore for FaultyStore {
        async fn fetch(&self, resource_type: &str, id: &str) -> Result<Resource, StoreError> {
            self.inner.fetch(resource_type, id).await
        }

        async fn fetch_url(&self, url: &str) -> Result<Resource, StoreError> {
            self.inner.fetch_url(url).await
        }

        async fn create(&self, resource: &Resource) -> Result<Resource, StoreError> {
            self.inner.create(resource).await
        }

        async fn replace(&self, resource: &Resource) -> Result<Resource, StoreError> {
            let slow = {
                let faults = self.faults.lock().unwrap();
                faults.slow_marital.is_some() && faults.slow_marital.as_deref() == marital_code(resource)
            };
            if slow {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            self.inner.replace(resource).await
        }

        async fn delete_url(&self, url: &str) -> Result<(), StoreError> {
            let fail = {
                let mut faults = self.faults.lock().unwrap();
                let hit = faults
                    .fail_delete
                    .as_deref()
                    .is_some_and(|prefix| url.starts_with(prefix));
                if hit {
                    faults.fail_delete = None;
                }
                hit
            };
            if fail {
                return Err(StoreError::Transport("store unreachable".into()));
            }
            self.inner.delete_url(url).await
        }
    }

    struct Fixture {
        resources: Arc<MemoryResourceStore>,
        faults: Arc<FaultyStore>,
        sessions: Arc<MemorySessionStore>,
        engine: Arc<MergeEngine>,
    }

    fn fixture() -> Fixture {
        let resources = Arc::new(MemoryResourceStore::new());
        let faults = Arc::new(FaultyStore {
            inner: resources.clone(),
            faults: Mutex::new(Faults::default()),
        });
        let sessions = Arc::new(MemorySessionStore::new());
        let engine = Arc::new(MergeEngine::new(
            faults.clone(),
            sessions.clone(),
            &MergeSettings::default(),
        ));
        Fixture {
            resources,
            faults,
            sessions,
            engine,
        }
    }

    fn patient(id: &str, marital: &str) -> Value {
        json!({
            "resourceType": "Patient",
            "id": id,
            "name": [{ "family": "Okafor", "given": ["Ada"] }],
            "gender": "female",
            "birthDate": "1961-09-30",
            "address": [{ "city": "Lowell", "line": ["22 Mill Rd"] }],
            "maritalStatus": { "coding": [{
                "system": "http://terminology.hl7.org/CodeSystem/v3-MaritalStatus",
                "code": marital
            }] }
        })
    }

    fn glucose(id: &str, subject: &str, value: f64) -> Value {
        json!({
            "resourceType": "Observation",
            "id": id,
            "status": "final",
            "code": { "coding": [{ "system": "http://loinc.org", "code": "2345-7" }] },
            "subject": { "reference": subject },
            "effectiveDateTime": "2022-03-01T09:15:00-05:00",
            "valueQuantity": { "value": value, "unit": "mg/dL" }
        })
    }

    fn bundle(values: Vec<Value>) -> Resource {
        collection_bundle(
            values
                .into_iter()
                .map(|v| Resource::from_value(v).unwrap()),
        )
    }

    impl Fixture {
        async fn open_session(
            &self,
            left: Vec<Value>,
            right: Vec<Value>,
        ) -> (MergeSession, Vec<crate::ConflictReport>) {
            let a = self.resources.seed(bundle(left));
            let b = self.resources.seed(bundle(right));
            match self.engine.merge(&a, &b).await.unwrap() {
                MergeOutcome::Conflicts { session, conflicts } => (session, conflicts),
                MergeOutcome::Merged(_) => panic!("expected conflicts"),
            }
        }
    }

    #[tokio::test]
    async fn test_resolve_marital_status_completes() {
        let fx = fixture();
        let (session, conflicts) = fx
            .open_session(vec![patient("p1", "M")], vec![patient("p2", "S")])
            .await;
        assert_eq!(conflicts.len(), 1);
        let conflict = &conflicts[0];
        assert_eq!(conflict.locations, vec!["maritalStatus.coding[0].code"]);

        let outcome = fx
            .engine
            .resolve(&session.session_id, &conflict.conflict_id, patient("ignored", "W"))
            .await
            .unwrap();
        let ResolveOutcome::Completed(target) = outcome else {
            panic!("expected completion");
        };
        let entries = bundle_entries(&target);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id(), Some(conflict.target_id.as_str()));
        assert_eq!(
            entries[0].fields()["maritalStatus"]["coding"][0]["code"],
            json!("W")
        );

        let stored = fx.engine.session(&session.session_id).await.unwrap();
        assert!(stored.completed);
        assert!(stored.conflicts.values().all(|c| c.resolved && c.deleted));
        assert!(!fx.resources.contains(&conflict.report_location()));
    }

    #[tokio::test]
    async fn test_resolve_guards() {
        let fx = fixture();
        let (session, conflicts) = fx
            .open_session(
                vec![patient("p1", "M"), glucose("o1", "Patient/p1", 101.0)],
                vec![patient("p2", "S"), glucose("o2", "Patient/p2", 99.0)],
            )
            .await;
        assert_eq!(conflicts.len(), 2);
        let sid = session.session_id.as_str();
        let patient_conflict = conflicts
            .iter()
            .find(|c| c.target_type == "Patient")
            .unwrap();

        assert!(matches!(
            fx.engine.resolve("nope", &patient_conflict.conflict_id, patient("x", "M")).await,
            Err(MergeError::SessionNotFound(_))
        ));
        assert!(matches!(
            fx.engine.resolve(sid, "nope", patient("x", "M")).await,
            Err(MergeError::ConflictNotFound { .. })
        ));
        let wrong_type = fx
            .engine
            .resolve(sid, &patient_conflict.conflict_id, glucose("x", "Patient/x", 1.0))
            .await
            .unwrap_err();
        assert_eq!(wrong_type.category(), ErrorCategory::Input);

        let outcome = fx
            .engine
            .resolve(sid, &patient_conflict.conflict_id, patient("x", "M"))
            .await
            .unwrap();
        let ResolveOutcome::Open(open) = outcome else {
            panic!("one conflict should remain");
        };
        assert_eq!(bundle_entries(&open).len(), 1);
        assert!(matches!(
            fx.engine.resolve(sid, &patient_conflict.conflict_id, patient("x", "M")).await,
            Err(MergeError::ConflictAlreadyResolved(_))
        ));
        assert_eq!(
            bundle_entries(&fx.engine.resolved_conflicts(sid).await.unwrap()).len(),
            1
        );
    }

    #[tokio::test]
    async fn test_resolution_converges() {
        let fx = fixture();
        let (session, conflicts) = fx
            .open_session(
                vec![
                    patient("p1", "M"),
                    glucose("o1", "Patient/p1", 101.0),
                    glucose("o2", "Patient/p1", 140.0),
                ],
                vec![
                    patient("p2", "S"),
                    glucose("o3", "Patient/p2", 101.0),
                    glucose("o4", "Patient/p2", 140.0),
                ],
            )
            .await;
        assert_eq!(conflicts.len(), 3);

        let sid = session.session_id.as_str();
        let mut last = None;
        for conflict in &conflicts {
            let replacement = if conflict.target_type == "Patient" {
                patient("x", "M")
            } else {
                glucose("x", "Patient/p1", 100.0)
            };
            last = Some(
                fx.engine
                    .resolve(sid, &conflict.conflict_id, replacement)
                    .await
                    .unwrap(),
            );
        }
        assert!(matches!(last, Some(ResolveOutcome::Completed(_))));
        let stored = fx.engine.session(sid).await.unwrap();
        assert!(stored.completed);
        assert_eq!(stored.unresolved_count(), 0);
        assert!(matches!(
            fx.engine.resolve(sid, &conflicts[0].conflict_id, patient("x", "M")).await,
            Err(MergeError::SessionCompleted(_))
        ));
    }

    #[tokio::test]
    async fn test_abort_removes_every_artifact() {
        let fx = fixture();
        let (session, conflicts) = fx
            .open_session(
                vec![
                    patient("p1", "M"),
                    glucose("o1", "Patient/p1", 101.0),
                    json!({ "resourceType": "Encounter", "id": "e1", "status": "finished" }),
                ],
                vec![patient("p2", "S"), glucose("o2", "Patient/p2", 99.0)],
            )
            .await;
        let sid = session.session_id.clone();
        fx.engine
            .resolve(&sid, &conflicts[0].conflict_id, {
                if conflicts[0].target_type == "Patient" {
                    patient("x", "M")
                } else {
                    glucose("x", "Patient/p1", 100.0)
                }
            })
            .await
            .unwrap();

        let target = fx.engine.target(&sid).await.unwrap();
        let references: Vec<String> = bundle_entries(&target)
            .iter()
            .filter_map(Resource::reference)
            .collect();
        assert_eq!(references.len(), 3);

        fx.engine.abort(&sid).await.unwrap();

        assert!(!fx.resources.contains(&session.target_location));
        for reference in &references {
            assert!(!fx.resources.contains(reference));
        }
        for conflict in &conflicts {
            assert!(!fx.resources.contains(&conflict.report_location()));
        }
        assert_eq!(fx.sessions.find(&sid).await.unwrap(), None);
        assert!(matches!(
            fx.engine.abort(&sid).await,
            Err(MergeError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_conflict_leaves_others() {
        let fx = fixture();
        let (session, conflicts) = fx
            .open_session(
                vec![patient("p1", "M"), glucose("o1", "Patient/p1", 101.0)],
                vec![patient("p2", "S"), glucose("o2", "Patient/p2", 99.0)],
            )
            .await;
        let sid = session.session_id.as_str();
        let obs = conflicts
            .iter()
            .find(|c| c.target_type == "Observation")
            .unwrap();
        let pat = conflicts
            .iter()
            .find(|c| c.target_type == "Patient")
            .unwrap();

        fx.engine.delete_conflict(sid, &obs.conflict_id).await.unwrap();

        let stored = fx.engine.session(sid).await.unwrap();
        assert!(!stored.conflicts.contains_key(&obs.conflict_id));
        assert!(!stored.conflicts[&pat.conflict_id].resolved);
        assert!(!fx.resources.contains(&obs.report_location()));
        assert!(!fx.resources.contains(&format!("Observation/{}", obs.target_id)));
        let target = fx.engine.target(sid).await.unwrap();
        assert!(bundle_entries(&target)
            .iter()
            .all(|r| r.resource_type() != "Observation"));
        assert!(matches!(
            fx.engine.delete_conflict(sid, &obs.conflict_id).await,
            Err(MergeError::ConflictNotFound { .. })
        ));

        fx.engine
            .resolve(sid, &pat.conflict_id, patient("x", "M"))
            .await
            .unwrap();
        assert!(matches!(
            fx.engine.delete_conflict(sid, &pat.conflict_id).await,
            Err(MergeError::SessionCompleted(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_resolved_conflict_rejected() {
        let fx = fixture();
        let (session, conflicts) = fx
            .open_session(
                vec![patient("p1", "M"), glucose("o1", "Patient/p1", 101.0)],
                vec![patient("p2", "S"), glucose("o2", "Patient/p2", 99.0)],
            )
            .await;
        let sid = session.session_id.as_str();
        fx.engine
            .resolve(sid, &conflicts[0].conflict_id, {
                if conflicts[0].target_type == "Patient" {
                    patient("x", "M")
                } else {
                    glucose("x", "Patient/p1", 100.0)
                }
            })
            .await
            .unwrap();
        assert!(matches!(
            fx.engine.delete_conflict(sid, &conflicts[0].conflict_id).await,
            Err(MergeError::ConflictAlreadyResolved(_))
        ));
    }

    #[tokio::test]
    async fn test_anchor_only_overlap() {
        let fx = fixture();
        let (session, conflicts) = fx
            .open_session(
                vec![
                    patient("p1", "M"),
                    json!({ "resourceType": "Encounter", "id": "e1", "status": "finished" }),
                ],
                vec![
                    patient("p2", "D"),
                    json!({ "resourceType": "AllergyIntolerance", "id": "a1", "criticality": "low" }),
                ],
            )
            .await;
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].target_type, "Patient");

        let target = fx.engine.target(&session.session_id).await.unwrap();
        let mut types: Vec<String> = bundle_entries(&target)
            .iter()
            .map(|r| r.resource_type().to_string())
            .collect();
        types.sort();
        assert_eq!(types, vec!["AllergyIntolerance", "Encounter", "Patient"]);
    }

    #[tokio::test]
    async fn test_concurrent_resolve_completes_once() {
        let fx = fixture();
        let (session, conflicts) = fx
            .open_session(vec![patient("p1", "M")], vec![patient("p2", "S")])
            .await;

        let mut handles = Vec::new();
        for _ in 0..6 {
            let engine = fx.engine.clone();
            let sid = session.session_id.clone();
            let cid = conflicts[0].conflict_id.clone();
            handles.push(tokio::spawn(async move {
                engine.resolve(&sid, &cid, patient("x", "W")).await
            }));
        }

        let mut completed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(ResolveOutcome::Completed(_)) => completed += 1,
                Ok(ResolveOutcome::Open(_)) => panic!("no conflicts should remain open"),
                Err(e) => assert_eq!(e.category(), ErrorCategory::State),
            }
        }
        assert_eq!(completed, 1);
        assert!(fx.engine.session(&session.session_id).await.unwrap().completed);
    }

    #[tokio::test]
    async fn test_views_on_unknown_session() {
        let fx = fixture();
        assert!(matches!(
            fx.engine.target("missing").await,
            Err(MergeError::SessionNotFound(_))
        ));
        assert!(matches!(
            fx.engine.open_conflicts("missing").await,
            Err(MergeError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_artifact_is_external_failure() {
        let fx = fixture();
        let (session, _) = fx
            .open_session(vec![patient("p1", "M")], vec![patient("p2", "S")])
            .await;
        fx.resources
            .delete_url(&session.target_location)
            .await
            .unwrap();
        let err = fx.engine.target(&session.session_id).await.unwrap_err();
        assert!(matches!(err, MergeError::MissingArtifact(_)));
        assert_eq!(err.category(), ErrorCategory::External);
    }

    #[tokio::test]
    async fn test_racing_resolves_keep_the_winning_body() {
        let fx = fixture();
        let (session, conflicts) = fx
            .open_session(vec![patient("p1", "M")], vec![patient("p2", "S")])
            .await;
        fx.faults.slow_replace_for("D");

        let mut handles = Vec::new();
        for code in ["D", "W"] {
            let engine = fx.engine.clone();
            let sid = session.session_id.clone();
            let cid = conflicts[0].conflict_id.clone();
            handles.push(tokio::spawn(async move {
                (code, engine.resolve(&sid, &cid, patient("x", code)).await)
            }));
        }

        let mut winners = Vec::new();
        for handle in handles {
            let (code, result) = handle.await.unwrap();
            match result {
                Ok(ResolveOutcome::Completed(target)) => winners.push((code, target)),
                Ok(ResolveOutcome::Open(_)) => panic!("no conflicts should remain open"),
                Err(e) => assert_eq!(e.category(), ErrorCategory::State),
            }
        }
        assert_eq!(winners.len(), 1);
        let (code, returned) = &winners[0];

        let target = fx.engine.target(&session.session_id).await.unwrap();
        assert_eq!(&target, returned);
        let entries = bundle_entries(&target);
        assert_eq!(marital_code(&entries[0]), Some(*code));
    }

    #[tokio::test]
    async fn test_resolve_retry_finishes_interrupted_completion() {
        let fx = fixture();
        let (session, conflicts) = fx
            .open_session(vec![patient("p1", "M")], vec![patient("p2", "S")])
            .await;
        let sid = session.session_id.as_str();
        let conflict = &conflicts[0];

        fx.faults.fail_next_delete("OperationOutcome/");
        let err = fx
            .engine
            .resolve(sid, &conflict.conflict_id, patient("x", "W"))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::External);

        let stalled = fx.engine.session(sid).await.unwrap();
        assert!(!stalled.completed);
        assert_eq!(stalled.unresolved_count(), 0);
        assert!(fx.resources.contains(&conflict.report_location()));

        let outcome = fx
            .engine
            .resolve(sid, &conflict.conflict_id, patient("x", "W"))
            .await
            .unwrap();
        let ResolveOutcome::Completed(target) = outcome else {
            panic!("retry should complete the session");
        };
        assert_eq!(marital_code(&bundle_entries(&target)[0]), Some("W"));

        let stored = fx.engine.session(sid).await.unwrap();
        assert!(stored.completed);
        assert!(stored.conflicts.values().all(|c| c.resolved && c.deleted));
        assert!(!fx.resources.contains(&conflict.report_location()));
    }

    #[tokio::test]
    async fn test_complete_retry_after_failed_report_delete() {
        let fx = fixture();
        let (session, conflicts) = fx
            .open_session(vec![patient("p1", "M")], vec![patient("p2", "S")])
            .await;
        let sid = session.session_id.as_str();

        fx.faults.fail_next_delete("OperationOutcome/");
        assert!(fx
            .engine
            .resolve(sid, &conflicts[0].conflict_id, patient("x", "W"))
            .await
            .is_err());

        fx.engine.complete(sid).await.unwrap();
        let stored = fx.engine.session(sid).await.unwrap();
        assert!(stored.completed);
        assert!(stored.conflicts.values().all(|c| c.deleted));
        assert!(!fx.resources.contains(&conflicts[0].report_location()));

        // Completing again is a no-op that still returns the target.
        assert_eq!(bundle_entries(&fx.engine.complete(sid).await.unwrap()).len(), 1);
    }

    #[tokio::test]
    async fn test_complete_rejects_open_conflicts() {
        let fx = fixture();
        let (session, _) = fx
            .open_session(vec![patient("p1", "M")], vec![patient("p2", "S")])
            .await;
        assert!(matches!(
            fx.engine.complete(&session.session_id).await,
            Err(MergeError::ConflictsUnresolved { open: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_conflict_retry_after_failed_report_delete() {
        let fx = fixture();
        let (session, conflicts) = fx
            .open_session(
                vec![patient("p1", "M"), glucose("o1", "Patient/p1", 101.0)],
                vec![patient("p2", "S"), glucose("o2", "Patient/p2", 99.0)],
            )
            .await;
        let sid = session.session_id.as_str();
        let obs = conflicts
            .iter()
            .find(|c| c.target_type == "Observation")
            .unwrap();

        fx.faults.fail_next_delete("OperationOutcome/");
        let err = fx
            .engine
            .delete_conflict(sid, &obs.conflict_id)
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::External);
        let stored = fx.engine.session(sid).await.unwrap();
        assert!(stored.conflicts.contains_key(&obs.conflict_id));

        fx.engine.delete_conflict(sid, &obs.conflict_id).await.unwrap();
        let stored = fx.engine.session(sid).await.unwrap();
        assert!(!stored.conflicts.contains_key(&obs.conflict_id));
        assert!(!fx.resources.contains(&obs.report_location()));
    }

    #[tokio::test]
    async fn test_abort_after_failed_delete_conflict_leaves_nothing() {
        let fx = fixture();
        let (session, conflicts) = fx
            .open_session(
                vec![patient("p1", "M"), glucose("o1", "Patient/p1", 101.0)],
                vec![patient("p2", "S"), glucose("o2", "Patient/p2", 99.0)],
            )
            .await;
        let sid = session.session_id.as_str();
        let obs = conflicts
            .iter()
            .find(|c| c.target_type == "Observation")
            .unwrap();

        fx.faults.fail_next_delete("OperationOutcome/");
        assert!(fx.engine.delete_conflict(sid, &obs.conflict_id).await.is_err());

        fx.engine.abort(sid).await.unwrap();
        for conflict in &conflicts {
            assert!(!fx.resources.contains(&conflict.report_location()));
            assert!(!fx
                .resources
                .contains(&format!("{}/{}", conflict.target_type, conflict.target_id)));
        }
        assert!(!fx.resources.contains(&session.target_location));
    }

    #[tokio::test]
    async fn test_abort_retry_after_failed_delete() {
        let fx = fixture();
        let (session, conflicts) = fx
            .open_session(
                vec![
                    patient("p1", "M"),
                    json!({ "resourceType": "Encounter", "id": "e1", "status": "finished" }),
                ],
                vec![patient("p2", "S")],
            )
            .await;
        let sid = session.session_id.clone();
        let target = fx.engine.target(&sid).await.unwrap();
        let references: Vec<String> = bundle_entries(&target)
            .iter()
            .filter_map(Resource::reference)
            .collect();

        fx.faults.fail_next_delete("List/");
        let err = fx.engine.abort(&sid).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::External);
        assert!(fx.sessions.find(&sid).await.unwrap().is_some());

        fx.engine.abort(&sid).await.unwrap();
        assert!(!fx.resources.contains(&session.target_location));
        for reference in &references {
            assert!(!fx.resources.contains(reference));
        }
        assert!(!fx.resources.contains(&conflicts[0].report_location()));
        assert_eq!(fx.sessions.find(&sid).await.unwrap(), None);
    }
}
