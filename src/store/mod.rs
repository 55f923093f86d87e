//! Persisted aggregate access
//!
//! The persisted `RebalanceRequest` row is the only shared mutable resource.
//! Every write is a whole-aggregate compare-and-swap on the version column;
//! a conflict means another writer got there first and the caller must
//! re-read before mutating again.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::RebalanceRequest;
use crate::error::{RebalanceError, Result};

pub use memory::InMemoryRequestStore;
pub use postgres::PgRequestStore;

#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Insert a freshly created request (version 0)
    async fn insert(&self, request: &RebalanceRequest) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<RebalanceRequest>>;

    /// Version-checked whole-aggregate write. On success the request's
    /// version is bumped in place; on conflict the write is not applied.
    async fn update(&self, request: &mut RebalanceRequest) -> Result<()>;

    /// All requests in a non-terminal status, for the reconciliation sweep
    async fn list_active(&self) -> Result<Vec<RebalanceRequest>>;
}

/// Fetch a request or fail with RequestNotFound
pub async fn require(store: &dyn RequestStore, id: Uuid) -> Result<RebalanceRequest> {
    store
        .get(id)
        .await?
        .ok_or_else(|| RebalanceError::RequestNotFound(id.to_string()))
}
