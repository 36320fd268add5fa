//! An in-memory event log, useful for testing and development.

use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::instrument;

use crate::{Error, Event, EventsRepository, Result};

/// An in-memory, thread-safe event log.
///
/// Events are kept in dispatch order, which the repository queries depend
/// on. Useful for testing or for applications that do not need the log to
/// survive a restart.
#[derive(Debug, Default)]
pub struct InMemoryEventsRepository {
    log: RwLock<Vec<Event>>,
}

impl InMemoryEventsRepository {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the full log in dispatch order.
    pub fn events(&self) -> Vec<Event> {
        self.log.read().unwrap().clone()
    }
}

#[async_trait]
impl EventsRepository for InMemoryEventsRepository {
    #[instrument(skip(self, event), fields(event_id = %event.id))]
    async fn create(&self, event: &Event) -> Result<()> {
        let mut log = self.log.write().unwrap();
        if log.iter().any(|e| e.id == event.id) {
            return Err(Error::Storage(format!(
                "event `{}` already exists in the log",
                event.id
            )));
        }
        log.push(event.clone());
        Ok(())
    }

    async fn delete_all(&self) -> Result<()> {
        self.log.write().unwrap().clear();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_recorded(
        &self,
        event_id: &str,
        recorded_at: DateTime<Utc>,
        created_by: Option<&str>,
    ) -> Result<()> {
        let mut log = self.log.write().unwrap();
        let event = log
            .iter_mut()
            .find(|e| e.id == event_id)
            .ok_or_else(|| Error::NotFound(format!("event `{event_id}` is not in the log")))?;
        if event.recorded_at.is_none() {
            event.recorded_at = Some(recorded_at);
        }
        if event.created_by.is_none() {
            event.created_by = created_by.map(str::to_string);
        }
        Ok(())
    }

    async fn unrecorded(&self) -> Result<Vec<Event>> {
        Ok(self
            .log
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.recorded_at.is_none())
            .cloned()
            .collect())
    }

    async fn last_received(&self, device_id: &str) -> Result<Option<Event>> {
        Ok(self
            .log
            .read()
            .unwrap()
            .iter()
            .rev()
            .find(|e| e.recorded_at.is_some() && e.created_on != device_id)
            .cloned())
    }
}
