//! In-memory store with the same compare-and-swap semantics as Postgres.
//! Used by the scenario tests; not suitable for multi-instance deployments.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::domain::RebalanceRequest;
use crate::error::{RebalanceError, Result};

use super::RequestStore;

#[derive(Default)]
pub struct InMemoryRequestStore {
    rows: Mutex<HashMap<Uuid, RebalanceRequest>>,
}

impl InMemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn insert(&self, request: &RebalanceRequest) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(&request.id) {
            return Err(RebalanceError::Internal(format!(
                "duplicate request id {}",
                request.id
            )));
        }
        rows.insert(request.id, request.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<RebalanceRequest>> {
        Ok(self.rows.lock().unwrap().get(&id).cloned())
    }

    async fn update(&self, request: &mut RebalanceRequest) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        let stored = rows
            .get(&request.id)
            .ok_or_else(|| RebalanceError::RequestNotFound(request.id.to_string()))?;
        if stored.version != request.version {
            return Err(RebalanceError::Internal(format!(
                "version conflict for request {}: stored {}, caller {}",
                request.id, stored.version, request.version
            )));
        }
        request.version += 1;
        rows.insert(request.id, request.clone());
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<RebalanceRequest>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect())
    }
}
