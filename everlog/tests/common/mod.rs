//! Shared fixtures for the integration tests: a small task aggregate and
//! scriptable fakes for the auth, server, and connection adapters.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use everlog::adapter::{
    AuthAdapter, ConnectionHandler, ConnectionStatusAdapter, EventServerAdapter, PushHandler,
    Unsubscribe,
};
use everlog::async_trait;
use everlog::store::in_memory::InMemoryEventsRepository;
use everlog::store::in_memory_snapshot::InMemoryAggregateRepository;
use everlog::{
    AggregateConfig, Error, Event, EventConfig, EventsRepository, Operation, Result,
};

// -- Test aggregate ------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub title: String,
    pub done: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTask {
    pub title: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RenameTask {
    pub title: String,
}

/// The task aggregate used throughout the tests: create, rename, a
/// payload-less complete, and delete.
pub fn task_config(
    repository: Arc<InMemoryAggregateRepository<Task>>,
) -> AggregateConfig<Task, String> {
    AggregateConfig::<Task, String>::builder("task")
        .repository(repository)
        .event(EventConfig::create::<CreateTask, _>(
            "task.create",
            |_event, payload| Task {
                title: payload.title,
                done: false,
            },
        ))
        .event(EventConfig::update::<RenameTask, _>(
            "task.rename",
            |task: &Task, _event, payload| Task {
                title: payload.title,
                ..task.clone()
            },
        ))
        .event(EventConfig::update::<(), _>(
            "task.complete",
            |task: &Task, _event, _payload| Task {
                done: true,
                ..task.clone()
            },
        ))
        .event(EventConfig::delete("task.delete"))
        .build()
}

/// Builds an event as another device would have produced it, already
/// recorded on the server.
pub fn remote_event(
    id: &str,
    operation: Operation,
    aggregate_id: &str,
    event_type: &str,
    payload: Value,
    device: &str,
    prev_id: Option<&str>,
) -> Event {
    Event {
        id: id.to_string(),
        operation,
        aggregate_type: "task".to_string(),
        aggregate_id: aggregate_id.to_string(),
        event_type: event_type.to_string(),
        payload: Some(payload),
        dispatched_at: Utc::now(),
        created_by: Some("remote-account".to_string()),
        created_on: device.to_string(),
        prev_id: prev_id.map(str::to_string),
        recorded_at: Some(Utc::now()),
    }
}

// -- Auth ----------------------------------------------------------------

/// Auth adapter with a fixed device id and a switchable account.
pub struct StaticAuthAdapter {
    device_id: String,
    account: Mutex<Option<String>>,
}

impl StaticAuthAdapter {
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            account: Mutex::new(None),
        }
    }

    pub fn sign_in(&self, account: &str) {
        *self.account.lock().unwrap() = Some(account.to_string());
    }

    pub fn sign_out(&self) {
        *self.account.lock().unwrap() = None;
    }
}

#[async_trait]
impl AuthAdapter<String> for StaticAuthAdapter {
    async fn device_id(&self) -> Result<String> {
        Ok(self.device_id.clone())
    }

    async fn account(&self) -> Result<Option<String>> {
        Ok(self.account.lock().unwrap().clone())
    }
}

// -- Server --------------------------------------------------------------

/// Scriptable event server: can be taken offline, seeded with remote
/// events, slowed down, and driven through its push handler.
#[derive(Default)]
pub struct FakeServerAdapter {
    offline: AtomicBool,
    slow: AtomicBool,
    resolve_account: Mutex<Option<String>>,
    recorded: Mutex<Vec<Event>>,
    remote: Mutex<Vec<Event>>,
    record_calls: AtomicUsize,
    fetch_after: Mutex<Vec<Option<String>>>,
    push: Mutex<Option<PushHandler>>,
}

impl FakeServerAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Makes `fetch` suspend briefly, so overlapping syncs can be observed.
    pub fn set_slow(&self, slow: bool) {
        self.slow.store(slow, Ordering::SeqCst);
    }

    /// The account the server resolves `created_by` to on record.
    pub fn resolve_account(&self, account: Option<&str>) {
        *self.resolve_account.lock().unwrap() = account.map(str::to_string);
    }

    pub fn seed_remote(&self, events: Vec<Event>) {
        self.remote.lock().unwrap().extend(events);
    }

    pub fn recorded(&self) -> Vec<Event> {
        self.recorded.lock().unwrap().clone()
    }

    pub fn record_calls(&self) -> usize {
        self.record_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_after(&self) -> Vec<Option<String>> {
        self.fetch_after.lock().unwrap().clone()
    }

    /// Delivers one event through the push subscription, if the broker
    /// installed one.
    pub async fn push_event(&self, event: Event) {
        let handler = self.push.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(event).await;
        }
    }
}

#[async_trait]
impl EventServerAdapter for FakeServerAdapter {
    async fn record(&self, event: &Event) -> Result<Event> {
        self.record_calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Network("server unreachable".to_string()));
        }
        let mut recorded = self.recorded.lock().unwrap();
        // Records are idempotent by event id.
        if let Some(existing) = recorded.iter().find(|e| e.id == event.id) {
            return Ok(existing.clone());
        }
        let mut stamped = event.clone();
        stamped.recorded_at = Some(Utc::now());
        if stamped.created_by.is_none() {
            stamped.created_by = self.resolve_account.lock().unwrap().clone();
        }
        recorded.push(stamped.clone());
        Ok(stamped)
    }

    async fn fetch(&self, after: Option<&str>) -> Result<Vec<Event>> {
        self.fetch_after
            .lock()
            .unwrap()
            .push(after.map(str::to_string));
        if self.slow.load(Ordering::SeqCst) {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Network("server unreachable".to_string()));
        }
        let remote = self.remote.lock().unwrap();
        let events = match after {
            None => remote.clone(),
            Some(id) => match remote.iter().position(|e| e.id == id) {
                Some(position) => remote[position + 1..].to_vec(),
                None => remote.clone(),
            },
        };
        Ok(events)
    }

    fn subscribe(&self, handler: PushHandler) -> Option<Unsubscribe> {
        *self.push.lock().unwrap() = Some(handler);
        Some(Box::new(|| ()))
    }
}

// -- Connection ----------------------------------------------------------

/// Connection adapter whose status the test flips by hand.
#[derive(Default)]
pub struct ToggleConnectionAdapter {
    status: Mutex<Option<bool>>,
    handlers: Mutex<Vec<ConnectionHandler>>,
}

impl ToggleConnectionAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, online: bool) {
        *self.status.lock().unwrap() = Some(online);
        for handler in self.handlers.lock().unwrap().iter() {
            handler(Some(online));
        }
    }
}

#[async_trait]
impl ConnectionStatusAdapter for ToggleConnectionAdapter {
    async fn get(&self) -> Result<Option<bool>> {
        Ok(*self.status.lock().unwrap())
    }

    fn subscribe(&self, handler: ConnectionHandler) {
        self.handlers.lock().unwrap().push(handler);
    }
}

// -- Failing event log ---------------------------------------------------

/// Event log whose next `create` can be armed to fail, for rollback tests.
#[derive(Default)]
pub struct FailingEventsRepository {
    inner: InMemoryEventsRepository,
    fail_next_create: AtomicBool,
}

impl FailingEventsRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_create(&self) {
        self.fail_next_create.store(true, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Event> {
        self.inner.events()
    }
}

#[async_trait]
impl EventsRepository for FailingEventsRepository {
    async fn create(&self, event: &Event) -> Result<()> {
        if self.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(Error::Storage("injected write failure".to_string()));
        }
        self.inner.create(event).await
    }

    async fn delete_all(&self) -> Result<()> {
        self.inner.delete_all().await
    }

    async fn mark_recorded(
        &self,
        event_id: &str,
        recorded_at: DateTime<Utc>,
        created_by: Option<&str>,
    ) -> Result<()> {
        self.inner
            .mark_recorded(event_id, recorded_at, created_by)
            .await
    }

    async fn unrecorded(&self) -> Result<Vec<Event>> {
        self.inner.unrecorded().await
    }

    async fn last_received(&self, device_id: &str) -> Result<Option<Event>> {
        self.inner.last_received(device_id).await
    }
}
