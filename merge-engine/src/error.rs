use chartmerge_core::StoreError;
use chartmerge_core::session::{Rejection, UpdateError};
use thiserror::Error;

/// Broad class of a [`MergeError`], for callers that map errors onto
/// responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad request; retrying unchanged will fail again.
    Input,
    NotFound,
    /// Guard rejection against the current session state.
    State,
    /// The resource or session store failed.
    External,
}

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("no {0} resource matched across the two records")]
    AnchorUnmatched(String),

    #[error("{resource_type} matched {count} times; identity is ambiguous")]
    AnchorAmbiguous { resource_type: String, count: usize },

    #[error("source record not found: {0}")]
    SourceNotFound(String),

    #[error("merge session {0} not found")]
    SessionNotFound(String),

    #[error("conflict {conflict_id} not found in merge session {session_id}")]
    ConflictNotFound {
        session_id: String,
        conflict_id: String,
    },

    #[error("conflict {0} is already resolved")]
    ConflictAlreadyResolved(String),

    #[error("conflict {0} has been deleted")]
    ConflictDeleted(String),

    #[error("merge session {0} is already completed")]
    SessionCompleted(String),

    #[error("merge session {session_id} still has {open} unresolved conflict(s)")]
    ConflictsUnresolved { session_id: String, open: usize },

    /// An artifact the session points at is gone from the resource store.
    #[error("merge artifact missing from resource store: {0}")]
    MissingArtifact(String),

    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

impl MergeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            // A missing source is a bad reference in the request, not a
            // missing API resource.
            MergeError::InvalidInput(_)
            | MergeError::SourceNotFound(_)
            | MergeError::AnchorUnmatched(_)
            | MergeError::AnchorAmbiguous { .. } => ErrorCategory::Input,
            MergeError::SessionNotFound(_)
            | MergeError::ConflictNotFound { .. } => ErrorCategory::NotFound,
            MergeError::ConflictAlreadyResolved(_)
            | MergeError::ConflictDeleted(_)
            | MergeError::SessionCompleted(_)
            | MergeError::ConflictsUnresolved { .. } => ErrorCategory::State,
            MergeError::MissingArtifact(_) | MergeError::Store(_) => ErrorCategory::External,
        }
    }

    /// Translate a session-store update failure for `session_id`.
    pub(crate) fn from_update(session_id: &str, err: UpdateError) -> Self {
        match err {
            UpdateError::Store(StoreError::NotFound(_)) => {
                MergeError::SessionNotFound(session_id.to_string())
            }
            UpdateError::Store(e) => MergeError::Store(e),
            UpdateError::Rejected(rejection) => Self::from_rejection(session_id, rejection),
        }
    }

    pub(crate) fn from_rejection(session_id: &str, rejection: Rejection) -> Self {
        match rejection {
            Rejection::SessionCompleted(id) => MergeError::SessionCompleted(id),
            Rejection::UnknownConflict(conflict_id) => MergeError::ConflictNotFound {
                session_id: session_id.to_string(),
                conflict_id,
            },
            Rejection::AlreadyResolved(id) => MergeError::ConflictAlreadyResolved(id),
            Rejection::Deleted(id) => MergeError::ConflictDeleted(id),
            Rejection::Unresolved { session, open } => MergeError::ConflictsUnresolved {
                session_id: session,
                open,
            },
        }
    }

    /// A store `NotFound` for something the session references means the
    /// artifact vanished, which is a failure rather than a 404.
    pub(crate) fn artifact(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => MergeError::MissingArtifact(what),
            other => MergeError::Store(other),
        }
    }
}
