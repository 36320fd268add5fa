//! An in-memory snapshot repository.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::instrument;

use crate::snapshot::{AggregateRepository, Snapshot};
use crate::{Error, Result};

/// An in-memory, thread-safe snapshot repository.
///
/// Useful for testing or for applications that do not need snapshots to
/// survive a restart.
#[derive(Debug)]
pub struct InMemoryAggregateRepository<S> {
    snapshots: DashMap<String, Snapshot<S>>,
}

impl<S> Default for InMemoryAggregateRepository<S> {
    fn default() -> Self {
        Self {
            snapshots: DashMap::new(),
        }
    }
}

impl<S> InMemoryAggregateRepository<S> {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<S> AggregateRepository<S> for InMemoryAggregateRepository<S>
where
    S: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    #[instrument(skip(self))]
    async fn get_one(&self, id: &str) -> Result<Option<Snapshot<S>>> {
        Ok(self.snapshots.get(id).map(|entry| entry.value().clone()))
    }

    async fn get_all(&self) -> Result<HashMap<String, Snapshot<S>>> {
        Ok(self
            .snapshots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }

    #[instrument(skip(self, snapshot), fields(id = %snapshot.id))]
    async fn create(&self, snapshot: &Snapshot<S>) -> Result<()> {
        self.snapshots.insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    #[instrument(skip(self, snapshot))]
    async fn update(&self, id: &str, snapshot: &Snapshot<S>) -> Result<()> {
        if !self.snapshots.contains_key(id) {
            return Err(Error::NotFound(format!("no snapshot stored for `{id}`")));
        }
        self.snapshots.insert(id.to_string(), snapshot.clone());
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> Result<()> {
        self.snapshots.remove(id);
        Ok(())
    }

    async fn delete_all(&self) -> Result<()> {
        self.snapshots.clear();
        Ok(())
    }
}
