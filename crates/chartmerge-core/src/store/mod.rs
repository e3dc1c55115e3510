//! Boundaries to the two external stores the merge engine talks to.
//!
//! Both are consumed as black boxes: one round trip per call, no retries.
//! Implementations here cover an in-memory backend (tests, offline merges),
//! a FHIR REST client, and a file-backed session store.

mod fhir;
mod file;
mod memory;

pub use fhir::FhirHttpStore;
pub use file::FileSessionStore;
pub use memory::{MemoryResourceStore, MemorySessionStore};

use crate::error::StoreError;
use crate::resource::Resource;
use crate::session::{MergeSession, SessionUpdate, UpdateError};

/// CRUD access to clinical resources.
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync + 'static {
    async fn fetch(&self, resource_type: &str, id: &str) -> Result<Resource, StoreError>;

    /// Fetch whatever lives at `url`: an absolute URL or a `Type/id` reference.
    async fn fetch_url(&self, url: &str) -> Result<Resource, StoreError>;

    /// Store a copy under a store-assigned id. Returns the stored resource.
    async fn create(&self, resource: &Resource) -> Result<Resource, StoreError>;

    /// Create-or-overwrite at the resource's own `Type/id`.
    async fn replace(&self, resource: &Resource) -> Result<Resource, StoreError>;

    async fn delete_url(&self, url: &str) -> Result<(), StoreError>;
}

/// Document store of [`MergeSession`] records keyed by session id.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn find(&self, session_id: &str) -> Result<Option<MergeSession>, StoreError>;

    async fn list(&self) -> Result<Vec<MergeSession>, StoreError>;

    async fn insert(&self, session: &MergeSession) -> Result<(), StoreError>;

    /// Apply a conditional update atomically and return the stored result.
    /// An unknown session yields `StoreError::NotFound`.
    async fn update(
        &self,
        session_id: &str,
        update: SessionUpdate,
    ) -> Result<MergeSession, UpdateError>;

    async fn remove(&self, session_id: &str) -> Result<(), StoreError>;
}

/// Split a reference or URL into `(type, id)` using its last two segments.
pub fn parse_reference(url: &str) -> Option<(&str, &str)> {
    let trimmed = url.trim_end_matches('/');
    let trimmed = trimmed.split(['?', '#']).next().unwrap_or(trimmed);
    let mut parts = trimmed.rsplit('/');
    let id = parts.next().filter(|s| !s.is_empty())?;
    let resource_type = parts.next().filter(|s| !s.is_empty())?;
    Some((resource_type, id))
}
