use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{StoreError, WorkStore};
use crate::state_machine::{ApplicationStatus, WorkItem};

/// One successful `commit`, in the order they happened.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub id: Uuid,
    pub status: ApplicationStatus,
    pub token: Uuid,
}

#[derive(Default)]
struct Inner {
    items: HashMap<Uuid, WorkItem>,
    /// Insertion order, so claims are oldest first.
    order: Vec<Uuid>,
    contents: HashMap<String, String>,
    #[cfg(test)]
    commits: Vec<CommitRecord>,
}

/// In-process store. Clones share the same data, so several dispatchers
/// can run against one instance.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_content(&self, reference: impl Into<String>, text: impl Into<String>) {
        self.lock().contents.insert(reference.into(), text.into());
    }

    /// The enqueue interface: add a `queued` item and return its id.
    pub fn enqueue(&self, subject_ref: impl Into<String>, target_ref: impl Into<String>) -> Uuid {
        self.insert(WorkItem::queued(subject_ref, target_ref))
    }

    /// Add an item as-is.
    pub fn insert(&self, item: WorkItem) -> Uuid {
        let id = item.id;
        let mut inner = self.lock();
        inner.order.push(id);
        inner.items.insert(id, item);
        id
    }

    pub fn snapshot(&self, id: Uuid) -> Option<WorkItem> {
        self.lock().items.get(&id).cloned()
    }

    #[cfg(test)]
    pub fn commits(&self) -> Vec<CommitRecord> {
        self.lock().commits.clone()
    }
}

impl WorkStore for MemoryStore {
    async fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut claimed = Vec::new();

        for id in &inner.order {
            if claimed.len() >= limit {
                break;
            }
            let Some(item) = inner.items.get_mut(id) else {
                continue;
            };
            let claimable = match item.status {
                ApplicationStatus::Queued => true,
                ApplicationStatus::Processing => item
                    .meta
                    .claimed_at
                    .is_none_or(|claimed_at| claimed_at < stale_before),
                _ => false,
            };
            if !claimable {
                continue;
            }
            item.claim(Uuid::new_v4(), now)?;
            claimed.push(item.clone());
        }

        Ok(claimed)
    }

    async fn resolve_content(&self, reference: &str) -> Result<String, StoreError> {
        self.lock()
            .contents
            .get(reference)
            .cloned()
            .ok_or_else(|| StoreError::MissingContent(reference.to_string()))
    }

    async fn commit(&self, item: &WorkItem, token: Uuid) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let stored = inner
            .items
            .get_mut(&item.id)
            .ok_or(StoreError::NotFound(item.id))?;

        if stored.status != ApplicationStatus::Processing || stored.meta.claim_token != Some(token)
        {
            return Err(StoreError::ClaimLost(item.id));
        }

        *stored = item.clone();
        #[cfg(test)]
        inner.commits.push(CommitRecord {
            id: item.id,
            status: item.status,
            token,
        });
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<WorkItem>, StoreError> {
        Ok(self.snapshot(id))
    }
}
