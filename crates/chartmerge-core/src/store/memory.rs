use dashmap::DashMap;

use super::{parse_reference, ResourceStore, SessionStore};
use crate::error::StoreError;
use crate::resource::Resource;
use crate::session::{MergeSession, SessionUpdate, UpdateError};

/// Resource store held entirely in memory, keyed by `(type, id)`.
#[derive(Default)]
pub struct MemoryResourceStore {
    resources: DashMap<(String, String), Resource>,
}

impl MemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a resource as-is, assigning an id if it has none. Returns the
    /// `Type/id` reference it can be fetched by.
    pub fn seed(&self, mut resource: Resource) -> String {
        if resource.id().is_none() {
            resource.set_id(uuid::Uuid::new_v4().to_string());
        }
        let key = key_of(&resource);
        let reference = format!("{}/{}", key.0, key.1);
        self.resources.insert(key, resource);
        reference
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn contains(&self, reference: &str) -> bool {
        parse_reference(reference)
            .map(|(t, id)| self.resources.contains_key(&(t.to_string(), id.to_string())))
            .unwrap_or(false)
    }
}

fn key_of(resource: &Resource) -> (String, String) {
    (
        resource.resource_type().to_string(),
        resource.id().unwrap_or_default().to_string(),
    )
}

#[async_trait::async_trait]
impl ResourceStore for MemoryResourceStore {
    async fn fetch(&self, resource_type: &str, id: &str) -> Result<Resource, StoreError> {
        self.resources
            .get(&(resource_type.to_string(), id.to_string()))
            .map(|r| r.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("{resource_type}/{id}")))
    }

    async fn fetch_url(&self, url: &str) -> Result<Resource, StoreError> {
        let (resource_type, id) =
            parse_reference(url).ok_or_else(|| StoreError::NotFound(url.to_string()))?;
        self.fetch(resource_type, id).await
    }

    async fn create(&self, resource: &Resource) -> Result<Resource, StoreError> {
        let stored = resource.with_new_id();
        self.resources.insert(key_of(&stored), stored.clone());
        Ok(stored)
    }

    async fn replace(&self, resource: &Resource) -> Result<Resource, StoreError> {
        if resource.id().is_none() {
            return Err(StoreError::Rejected {
                status: 400,
                message: format!("{} has no id to replace", resource.resource_type()),
            });
        }
        self.resources.insert(key_of(resource), resource.clone());
        Ok(resource.clone())
    }

    async fn delete_url(&self, url: &str) -> Result<(), StoreError> {
        let (resource_type, id) =
            parse_reference(url).ok_or_else(|| StoreError::NotFound(url.to_string()))?;
        self.resources
            .remove(&(resource_type.to_string(), id.to_string()))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(url.to_string()))
    }
}

/// Session store held in memory. The dashmap shard lock taken by `get_mut`
/// is the per-session serialization point for conditional updates.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, MergeSession>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SessionStore for MemorySessionStore {
    async fn find(&self, session_id: &str) -> Result<Option<MergeSession>, StoreError> {
        Ok(self.sessions.get(session_id).map(|s| s.value().clone()))
    }

    async fn list(&self) -> Result<Vec<MergeSession>, StoreError> {
        let mut sessions: Vec<MergeSession> =
            self.sessions.iter().map(|s| s.value().clone()).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    async fn insert(&self, session: &MergeSession) -> Result<(), StoreError> {
        self.sessions
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn update(
        &self,
        session_id: &str,
        update: SessionUpdate,
    ) -> Result<MergeSession, UpdateError> {
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
        entry.apply(&update)?;
        Ok(entry.value().clone())
    }

    async fn remove(&self, session_id: &str) -> Result<(), StoreError> {
        self.sessions
            .remove(session_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))
    }
}
