//! Persisted merge-session records and the conditional updates applied to
//! them.
//!
//! Every mutation of a stored session goes through [`SessionUpdate`], whose
//! guard is evaluated by the session store under the same lock as the write.
//! That makes each update a compare-and-swap against the stored flags: two
//! concurrent resolves of one conflict cannot both observe "unresolved".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeSession {
    pub session_id: String,
    pub completed: bool,
    pub target_location: String,
    #[serde(default)]
    pub conflicts: BTreeMap<String, ConflictState>,
    #[serde(default)]
    pub source1: String,
    #[serde(default)]
    pub source2: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictState {
    pub report_location: String,
    pub target_type: String,
    pub target_id: String,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub deleted: bool,
}

/// Field-level mutation of one stored session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    /// Flip one conflict to resolved; only if it is still open.
    ResolveConflict { conflict_id: String },
    /// Mark the session completed; only if every conflict is resolved.
    CompleteSession,
    /// Mark every (resolved) conflict deleted after its report was removed.
    MarkConflictsDeleted,
    /// Remove one unresolved conflict from the map.
    DropConflict { conflict_id: String },
}

/// Why a [`SessionUpdate`] guard refused to apply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("session {0} is already completed")]
    SessionCompleted(String),
    #[error("conflict {0} does not exist")]
    UnknownConflict(String),
    #[error("conflict {0} is already resolved")]
    AlreadyResolved(String),
    #[error("conflict {0} has been deleted")]
    Deleted(String),
    #[error("session {session} still has {open} unresolved conflict(s)")]
    Unresolved { session: String, open: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Rejected(#[from] Rejection),
}

impl MergeSession {
    pub fn new(
        target_location: impl Into<String>,
        conflicts: BTreeMap<String, ConflictState>,
    ) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            completed: false,
            target_location: target_location.into(),
            conflicts,
            source1: String::new(),
            source2: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_sources(mut self, source1: impl Into<String>, source2: impl Into<String>) -> Self {
        self.source1 = source1.into();
        self.source2 = source2.into();
        self
    }

    pub fn unresolved(&self) -> impl Iterator<Item = (&String, &ConflictState)> {
        self.conflicts.iter().filter(|(_, c)| !c.resolved)
    }

    pub fn resolved(&self) -> impl Iterator<Item = (&String, &ConflictState)> {
        self.conflicts.iter().filter(|(_, c)| c.resolved)
    }

    pub fn unresolved_count(&self) -> usize {
        self.unresolved().count()
    }

    /// Evaluate the update's guard and, if it holds, apply it in place.
    /// On rejection the session is left untouched.
    pub fn apply(&mut self, update: &SessionUpdate) -> Result<(), Rejection> {
        match update {
            SessionUpdate::ResolveConflict { conflict_id } => {
                self.ensure_open()?;
                let conflict = self.open_conflict_mut(conflict_id)?;
                conflict.resolved = true;
            }
            SessionUpdate::CompleteSession => {
                self.ensure_open()?;
                let open = self.unresolved_count();
                if open > 0 {
                    return Err(Rejection::Unresolved {
                        session: self.session_id.clone(),
                        open,
                    });
                }
                self.completed = true;
            }
            SessionUpdate::MarkConflictsDeleted => {
                let open = self.unresolved_count();
                if open > 0 {
                    return Err(Rejection::Unresolved {
                        session: self.session_id.clone(),
                        open,
                    });
                }
                for conflict in self.conflicts.values_mut() {
                    conflict.deleted = true;
                }
            }
            SessionUpdate::DropConflict { conflict_id } => {
                self.ensure_open()?;
                self.open_conflict_mut(conflict_id)?;
                self.conflicts.remove(conflict_id);
            }
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), Rejection> {
        if self.completed {
            Err(Rejection::SessionCompleted(self.session_id.clone()))
        } else {
            Ok(())
        }
    }

    fn open_conflict_mut(&mut self, conflict_id: &str) -> Result<&mut ConflictState, Rejection> {
        let conflict = self
            .conflicts
            .get_mut(conflict_id)
            .ok_or_else(|| Rejection::UnknownConflict(conflict_id.to_string()))?;
        if conflict.deleted {
            return Err(Rejection::Deleted(conflict_id.to_string()));
        }
        if conflict.resolved {
            return Err(Rejection::AlreadyResolved(conflict_id.to_string()));
        }
        Ok(conflict)
    }
}
