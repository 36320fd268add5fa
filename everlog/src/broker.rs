//! The broker couples the event bus, the registered aggregate stores, and
//! the server/connection adapters into one self-contained runtime instance.
//!
//! It installs a bus subscriber that records every locally produced event on
//! the central server, and runs a background sync pass whenever connectivity
//! returns or a retry interval elapses: unrecorded local events are flushed
//! up, then events from other devices are fetched and applied through the
//! owning stores.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::adapter::{
    AuthAdapter, ConnectionStatusAdapter, EventServerAdapter, PushHandler, Unsubscribe,
};
use crate::aggregate::{AggregateStore, StoreContext, StoreHandle};
use crate::bus::EventBus;
use crate::config::{AggregateConfig, DefaultDispatchPolicy};
use crate::{Error, Event, EventsRepository, IdGenerator, Identity, Result};

/// How long the broker waits between sync retries when nothing else triggers
/// one. Five minutes.
pub const DEFAULT_RETRY_SYNC_INTERVAL: Duration = Duration::from_secs(300);

/// The coordinator owning the bus, the stores, and the sync loop.
///
/// Cheap to clone; clones share the same runtime instance. Each broker is
/// fully self-contained — there is no global state, and tests simply build
/// fresh brokers.
pub struct Broker<U: Identity> {
    inner: Arc<BrokerInner<U>>,
}

impl<U: Identity> Clone for Broker<U> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct BrokerInner<U: Identity> {
    bus: Arc<EventBus>,
    auth: Arc<dyn AuthAdapter<U>>,
    events_repository: Option<Arc<dyn EventsRepository>>,
    server: Option<Arc<dyn EventServerAdapter>>,
    connection: Option<Arc<dyn ConnectionStatusAdapter>>,
    retry_sync_interval: Duration,
    event_id_generator: IdGenerator,
    default_policy: Option<DefaultDispatchPolicy<U>>,
    stores: RwLock<HashMap<String, Arc<dyn StoreHandle>>>,
    /// In-flight sync shared by every concurrent caller.
    sync_state: Mutex<Option<Shared<BoxFuture<'static, ()>>>>,
    last_sync: Mutex<Option<Instant>>,
    sync_paused: AtomicBool,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    push_unsubscribe: Mutex<Option<Unsubscribe>>,
}

impl<U: Identity> Drop for BrokerInner<U> {
    fn drop(&mut self) {
        if let Some(task) = self.loop_task.get_mut().unwrap().take() {
            task.abort();
        }
    }
}

impl<U: Identity> Broker<U> {
    /// Starts building a broker around the given auth adapter.
    pub fn builder(auth: Arc<dyn AuthAdapter<U>>) -> BrokerBuilder<U> {
        BrokerBuilder {
            auth,
            events_repository: None,
            server: None,
            connection: None,
            retry_sync_interval: DEFAULT_RETRY_SYNC_INTERVAL,
            event_id_generator: None,
            default_policy: None,
            on_termination: None,
        }
    }

    /// The event bus shared by this broker and its stores.
    ///
    /// External consumers may subscribe to observe every applied event.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    /// Instantiates an [`AggregateStore`] from `config` and indexes it by its
    /// aggregate type.
    ///
    /// Fails with [`Error::InvalidInput`] when the configuration is malformed
    /// or the aggregate type is already registered.
    pub fn register<S>(&self, config: AggregateConfig<S, U>) -> Result<Arc<AggregateStore<S, U>>>
    where
        S: Clone + Serialize + Send + Sync + 'static,
    {
        config.validate()?;
        let mut stores = self.inner.stores.write().unwrap();
        if stores.contains_key(config.aggregate_type()) {
            return Err(Error::invalid_input(format!(
                "aggregate `{}` is already registered",
                config.aggregate_type()
            )));
        }
        let context = StoreContext {
            bus: self.inner.bus.clone(),
            auth: self.inner.auth.clone(),
            events_repository: self.inner.events_repository.clone(),
            event_id_generator: self.inner.event_id_generator.clone(),
            default_policy: self.inner.default_policy.clone(),
        };
        let store = Arc::new(AggregateStore::new(config, context));
        stores.insert(
            store.aggregate_type().to_string(),
            store.clone() as Arc<dyn StoreHandle>,
        );
        Ok(store)
    }

    /// Runs one sync pass: flush unrecorded local events to the server, then
    /// fetch and apply events from other devices.
    ///
    /// Single-flight: concurrent callers await the same in-flight pass.
    /// Failures are swallowed and retried on the next cycle.
    pub async fn sync(&self) {
        BrokerInner::sync_future(&self.inner).await;
    }

    /// Deletes every locally stored event and snapshot, resets the bus, and
    /// resets every registered store, then resumes syncing.
    pub async fn reset(&self) -> Result<()> {
        let inner = &self.inner;
        inner.sync_paused.store(true, Ordering::SeqCst);
        if let Some(unsubscribe) = inner.push_unsubscribe.lock().unwrap().take() {
            unsubscribe();
        }

        if let Some(events_repository) = &inner.events_repository {
            events_repository.delete_all().await?;
        }
        inner.bus.reset();
        let stores: Vec<Arc<dyn StoreHandle>> =
            inner.stores.read().unwrap().values().cloned().collect();
        for store in stores {
            store.reset().await?;
        }

        *inner.last_sync.lock().unwrap() = None;
        BrokerInner::subscribe_push(inner);
        inner.sync_paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Stops the sync loop and the push subscription, leaving all data
    /// intact. Explicit [`sync`](Broker::sync) calls still work afterwards.
    pub fn shutdown(&self) {
        if let Some(task) = self.inner.loop_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(unsubscribe) = self.inner.push_unsubscribe.lock().unwrap().take() {
            unsubscribe();
        }
    }
}

impl<U: Identity> BrokerInner<U> {
    /// Returns the shared future of the in-flight sync, starting one when
    /// none is running.
    fn sync_future(inner: &Arc<Self>) -> Shared<BoxFuture<'static, ()>> {
        let mut state = inner.sync_state.lock().unwrap();
        if let Some(shared) = state.as_ref() {
            // A completed future that was never cleared must not satisfy new
            // callers.
            if shared.peek().is_none() {
                return shared.clone();
            }
        }
        let owner = inner.clone();
        let shared = async move {
            *owner.last_sync.lock().unwrap() = Some(Instant::now());
            owner.run_sync().await;
            owner.sync_state.lock().unwrap().take();
        }
        .boxed()
        .shared();
        *state = Some(shared.clone());
        shared
    }

    /// Loop-triggered sync, rate-limited to one pass per a fifth of the
    /// retry interval so flapping connectivity cannot thrash the server.
    async fn sync_throttled(inner: &Arc<Self>) {
        let min_gap = inner.retry_sync_interval / 5;
        let due = inner
            .last_sync
            .lock()
            .unwrap()
            .is_none_or(|last| last.elapsed() >= min_gap);
        if !due {
            tracing::debug!("sync trigger throttled");
            return;
        }
        Self::sync_future(inner).await;
    }

    async fn run_sync(&self) {
        if let Some(connection) = &self.connection {
            if let Ok(Some(false)) = connection.get().await {
                tracing::debug!("skipping sync while offline");
                return;
            }
        }
        tracing::debug!("sync pass started");

        if let Some(events_repository) = &self.events_repository {
            match events_repository.unrecorded().await {
                Ok(unrecorded) => {
                    futures::future::join_all(
                        unrecorded.iter().map(|event| self.record_event(event)),
                    )
                    .await;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to load unrecorded events");
                }
            }
        }

        let Some(server) = &self.server else { return };
        let device_id = match self.auth.device_id().await {
            Ok(device_id) => device_id,
            Err(err) => {
                tracing::warn!(error = %err, "auth adapter failed during sync");
                return;
            }
        };
        let last_received = match &self.events_repository {
            Some(repository) => match repository.last_received(&device_id).await {
                Ok(last) => last,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to look up last received event");
                    None
                }
            },
            None => None,
        };
        match server.fetch(last_received.as_ref().map(|e| e.id.as_str())).await {
            Ok(events) => {
                for event in events {
                    self.ingest(event, &device_id).await;
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "fetch failed, will retry on next sync");
            }
        }
    }

    /// Records one event on the server and marks it recorded locally.
    ///
    /// Skipped while signed out or without a server adapter; failures are
    /// swallowed so the event stays unrecorded and the retry loop picks it
    /// up again.
    async fn record_event(&self, event: &Event) {
        let Some(server) = &self.server else { return };
        match self.auth.account().await {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::debug!(event_id = %event.id, "signed out, leaving event unrecorded");
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "auth adapter failed while recording");
                return;
            }
        }
        match server.record(event).await {
            Ok(recorded) => {
                let store = self
                    .stores
                    .read()
                    .unwrap()
                    .get(&recorded.aggregate_type)
                    .cloned();
                match store {
                    Some(store) => {
                        if let Err(err) = store.mark_recorded(&recorded).await {
                            tracing::warn!(
                                error = %err,
                                event_id = %recorded.id,
                                "failed to mark event recorded"
                            );
                        }
                    }
                    None => tracing::warn!(
                        aggregate_type = %recorded.aggregate_type,
                        "no store registered for recorded event"
                    ),
                }
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    event_id = %event.id,
                    "failed to record event, will retry on next sync"
                );
            }
        }
    }

    /// Routes one remote event to its owning store. Echoes of events this
    /// device produced are skipped.
    async fn ingest(&self, event: Event, device_id: &str) {
        if event.created_on == device_id {
            tracing::debug!(event_id = %event.id, "skipping echo of own event");
            return;
        }
        let store = self
            .stores
            .read()
            .unwrap()
            .get(&event.aggregate_type)
            .cloned();
        match store {
            Some(store) => {
                if let Err(err) = store.apply_event(event).await {
                    tracing::warn!(error = %err, "failed to apply remote event");
                }
            }
            None => tracing::warn!(
                aggregate_type = %event.aggregate_type,
                "no store registered for remote event"
            ),
        }
    }

    /// Spawns the background loop that syncs on every retry interval and on
    /// every connectivity transition to online.
    fn spawn_sync_loop(inner: &Arc<Self>, mut connectivity: mpsc::UnboundedReceiver<Option<bool>>) {
        let weak = Arc::downgrade(inner);
        let retry_sync_interval = inner.retry_sync_interval;
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(retry_sync_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut connectivity_closed = false;
            loop {
                // The first tick fires immediately and doubles as the
                // startup sync.
                let triggered = tokio::select! {
                    _ = interval.tick() => true,
                    status = connectivity.recv(), if !connectivity_closed => {
                        match status {
                            Some(Some(true)) => true,
                            Some(_) => false,
                            None => {
                                connectivity_closed = true;
                                false
                            }
                        }
                    }
                };
                if !triggered {
                    continue;
                }
                let Some(inner) = weak.upgrade() else { break };
                if inner.sync_paused.load(Ordering::SeqCst) {
                    continue;
                }
                Self::sync_throttled(&inner).await;
            }
        });
        *inner.loop_task.lock().unwrap() = Some(task);
    }

    /// Subscribes to server push, routing pushed events through the owning
    /// stores.
    fn subscribe_push(inner: &Arc<Self>) {
        let Some(server) = &inner.server else { return };
        let weak = Arc::downgrade(inner);
        let handler: PushHandler = Arc::new(move |event| {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else { return };
                let device_id = match inner.auth.device_id().await {
                    Ok(device_id) => device_id,
                    Err(err) => {
                        tracing::warn!(error = %err, "auth adapter failed on push");
                        return;
                    }
                };
                inner.ingest(event, &device_id).await;
            }
            .boxed()
        });
        if let Some(unsubscribe) = server.subscribe(handler) {
            *inner.push_unsubscribe.lock().unwrap() = Some(unsubscribe);
        }
    }
}

/// Builder assembling a [`Broker`] from its collaborators.
pub struct BrokerBuilder<U: Identity> {
    auth: Arc<dyn AuthAdapter<U>>,
    events_repository: Option<Arc<dyn EventsRepository>>,
    server: Option<Arc<dyn EventServerAdapter>>,
    connection: Option<Arc<dyn ConnectionStatusAdapter>>,
    retry_sync_interval: Duration,
    event_id_generator: Option<IdGenerator>,
    default_policy: Option<DefaultDispatchPolicy<U>>,
    on_termination: Option<Box<dyn Fn(Option<&Error>) + Send + Sync>>,
}

impl<U: Identity> BrokerBuilder<U> {
    /// Sets the local event log. Without one events are not persisted
    /// locally and cannot be re-recorded after a restart.
    pub fn events_repository(mut self, repository: Arc<dyn EventsRepository>) -> Self {
        self.events_repository = Some(repository);
        self
    }

    /// Sets the central event server adapter.
    pub fn event_server(mut self, server: Arc<dyn EventServerAdapter>) -> Self {
        self.server = Some(server);
        self
    }

    /// Sets the connectivity adapter driving the sync loop.
    pub fn connection_status(mut self, connection: Arc<dyn ConnectionStatusAdapter>) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Overrides the retry interval of the sync loop. Default: five minutes.
    pub fn retry_sync_interval(mut self, interval: Duration) -> Self {
        self.retry_sync_interval = interval;
        self
    }

    /// Overrides the generator for event ids (and aggregate ids of
    /// aggregates that do not configure their own). Default: UUID v4.
    pub fn event_id_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.event_id_generator = Some(Arc::new(generator));
        self
    }

    /// Sets the broker-wide fallback dispatch policy.
    pub fn dispatch_policy<F>(mut self, policy: F) -> Self
    where
        F: Fn(Option<&U>, &Event) -> bool + Send + Sync + 'static,
    {
        self.default_policy = Some(Arc::new(policy));
        self
    }

    /// Registers a callback fired when the event bus terminates — the single
    /// funnel for terminal conditions such as failed persistence.
    pub fn on_termination<F>(mut self, callback: F) -> Self
    where
        F: Fn(Option<&Error>) + Send + Sync + 'static,
    {
        self.on_termination = Some(Box::new(callback));
        self
    }

    /// Builds the broker: creates the bus, installs the recorder, starts the
    /// sync loop, and subscribes to server push.
    ///
    /// Must be called within a Tokio runtime.
    pub async fn build(self) -> Broker<U> {
        let bus = Arc::new(EventBus::new());
        if let Some(callback) = self.on_termination {
            bus.on_termination(move |error| callback(error));
        }

        let inner = Arc::new(BrokerInner {
            bus: bus.clone(),
            auth: self.auth,
            events_repository: self.events_repository,
            server: self.server,
            connection: self.connection,
            retry_sync_interval: self.retry_sync_interval,
            event_id_generator: self
                .event_id_generator
                .unwrap_or_else(|| Arc::new(|| Uuid::new_v4().to_string())),
            default_policy: self.default_policy,
            stores: RwLock::new(HashMap::new()),
            sync_state: Mutex::new(None),
            last_sync: Mutex::new(None),
            sync_paused: AtomicBool::new(false),
            loop_task: Mutex::new(None),
            push_unsubscribe: Mutex::new(None),
        });

        // Record every event that reaches the bus without a server timestamp.
        let weak = Arc::downgrade(&inner);
        bus.subscribe(move |event: Event| {
            let weak = weak.clone();
            async move {
                if event.recorded_at.is_some() {
                    return Ok(());
                }
                if let Some(inner) = weak.upgrade() {
                    inner.record_event(&event).await;
                }
                Ok(())
            }
        })
        .await
        .expect("a fresh bus has no replay history to fail on");

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(connection) = &inner.connection {
            connection.subscribe(Box::new(move |status| {
                let _ = tx.send(status);
            }));
        }
        BrokerInner::spawn_sync_loop(&inner, rx);
        BrokerInner::subscribe_push(&inner);

        Broker { inner }
    }
}
