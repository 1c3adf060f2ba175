//! Persistence seam for work items.
//!
//! The store is the only synchronization point between dispatcher
//! instances: [`WorkStore::claim_batch`] hands each item to exactly one
//! caller, and [`WorkStore::commit`] is a compare-and-swap on the claim
//! token, so a dispatcher whose claim was reclaimed cannot overwrite the
//! new owner's result.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::state_machine::{TransitionError, WorkItem};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no content found for reference '{0}'")]
    MissingContent(String),

    #[error("claim on work item {0} was lost to another dispatcher")]
    ClaimLost(Uuid),

    #[error("work item {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("corrupt work item {id}: {message}")]
    Corrupt { id: Uuid, message: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub trait WorkStore {
    /// Atomically claim up to `limit` items, oldest first: every `queued`
    /// item, plus `processing` items whose claim is older than
    /// `stale_before`. Each returned item carries a fresh claim token and
    /// an incremented attempt count.
    async fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>, StoreError>;

    /// Text behind a subject or target reference.
    async fn resolve_content(&self, reference: &str) -> Result<String, StoreError>;

    /// Write status, artifacts and meta, but only while the stored item is
    /// still `processing` under `token`. Otherwise [`StoreError::ClaimLost`].
    async fn commit(&self, item: &WorkItem, token: Uuid) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<WorkItem>, StoreError>;
}
