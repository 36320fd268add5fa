//! The per-aggregate-type projection engine.
//!
//! An [`AggregateStore`] owns the in-memory collection of snapshots for one
//! aggregate type and is the only writer of its repositories. Dispatching an
//! event validates and authorizes it, applies it optimistically to the
//! collection, persists it to the event log and the snapshot repository, and
//! broadcasts it on the event bus. A failed persistence rolls the collection
//! back and terminates the bus: after a suspected divergence no further
//! events may propagate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::instrument;

use crate::adapter::AuthAdapter;
use crate::bus::{EventBus, SubscriptionId};
use crate::config::{
    AggregateConfig, DefaultDispatchPolicy, DispatchPolicy, EventApplier, EventConfig,
};
use crate::schema::Validator;
use crate::snapshot::{AggregateRepository, Snapshot};
use crate::{Error, Event, EventsRepository, IdGenerator, Identity, Operation, Result};

/// Callback invoked with the full collection after every observable change.
pub type StateSubscriber<S> = Arc<dyn Fn(&HashMap<String, Snapshot<S>>) + Send + Sync>;

/// Shared runtime context handed to every store by the broker.
pub(crate) struct StoreContext<U: Identity> {
    pub(crate) bus: Arc<EventBus>,
    pub(crate) auth: Arc<dyn AuthAdapter<U>>,
    pub(crate) events_repository: Option<Arc<dyn EventsRepository>>,
    pub(crate) event_id_generator: IdGenerator,
    pub(crate) default_policy: Option<DefaultDispatchPolicy<U>>,
}

impl<U: Identity> Clone for StoreContext<U> {
    fn clone(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            auth: self.auth.clone(),
            events_repository: self.events_repository.clone(),
            event_id_generator: self.event_id_generator.clone(),
            default_policy: self.default_policy.clone(),
        }
    }
}

/// Projection engine for one aggregate type.
///
/// Constructed through [`Broker::register`](crate::Broker::register); the
/// broker injects the shared bus, auth adapter, and event log.
pub struct AggregateStore<S, U: Identity>
where
    S: Clone + Serialize + Send + Sync + 'static,
{
    aggregate_type: String,
    events: HashMap<String, EventConfig<S, U>>,
    state_schema: Option<Arc<dyn Validator>>,
    repository: Option<Arc<dyn AggregateRepository<S>>>,
    aggregate_id_generator: IdGenerator,
    aggregate_policy: Option<DispatchPolicy<S, U>>,
    context: StoreContext<U>,
    collection: RwLock<HashMap<String, Snapshot<S>>>,
    subscribers: Mutex<Vec<(u64, StateSubscriber<S>)>>,
    next_subscriber_id: AtomicU64,
    init_lock: tokio::sync::Mutex<()>,
    initialized: AtomicBool,
}

impl<S, U: Identity> AggregateStore<S, U>
where
    S: Clone + Serialize + Send + Sync + 'static,
{
    pub(crate) fn new(config: AggregateConfig<S, U>, context: StoreContext<U>) -> Self {
        let aggregate_id_generator = config
            .aggregate_id_generator
            .unwrap_or_else(|| context.event_id_generator.clone());
        Self {
            aggregate_type: config.aggregate_type,
            events: config
                .events
                .into_iter()
                .map(|e| (e.event_type.clone(), e))
                .collect(),
            state_schema: config.state_schema,
            repository: config.repository,
            aggregate_id_generator,
            aggregate_policy: config.dispatch_policy,
            context,
            collection: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber_id: AtomicU64::new(0),
            init_lock: tokio::sync::Mutex::new(()),
            initialized: AtomicBool::new(false),
        }
    }

    /// The aggregate type this store owns.
    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    /// Loads the collection from the snapshot repository.
    ///
    /// Runs at most once; every dispatcher and `apply_event` awaits it
    /// implicitly, so calling this up front is optional.
    pub async fn initialize(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.init_lock.lock().await;
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(repository) = &self.repository {
            let all = repository.get_all().await?;
            *self.collection.write().unwrap() = all;
        }
        self.initialized.store(true, Ordering::Release);
        self.notify_subscribers();
        Ok(())
    }

    /// Whether the collection has been loaded from the repository.
    pub fn initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Returns a copy of the current collection, keyed by aggregate id.
    pub fn state(&self) -> HashMap<String, Snapshot<S>> {
        self.collection.read().unwrap().clone()
    }

    /// Returns the current snapshot of one aggregate, if it is live.
    pub fn get(&self, aggregate_id: &str) -> Option<Snapshot<S>> {
        self.collection.read().unwrap().get(aggregate_id).cloned()
    }

    /// Attaches a collection subscriber.
    ///
    /// The subscriber is invoked immediately with the current collection,
    /// then after every change that survived persistence.
    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn(&HashMap<String, Snapshot<S>>) + Send + Sync + 'static,
    {
        let subscriber: StateSubscriber<S> = Arc::new(subscriber);
        subscriber(&self.collection.read().unwrap().clone());
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().unwrap().push((id, subscriber));
        SubscriptionId(id)
    }

    /// Detaches a collection subscriber. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|(sid, _)| *sid != id.0);
    }

    /// Dispatches a `create` event and returns the new aggregate id.
    ///
    /// Use `()` as the payload for payload-less events.
    pub async fn create<P: Serialize>(&self, event_type: &str, payload: P) -> Result<String> {
        self.dispatch(Operation::Create, event_type, None, normalize(payload)?)
            .await
    }

    /// Dispatches an `update` event against a live aggregate.
    pub async fn update<P: Serialize>(
        &self,
        event_type: &str,
        aggregate_id: &str,
        payload: P,
    ) -> Result<()> {
        self.dispatch(
            Operation::Update,
            event_type,
            Some(aggregate_id),
            normalize(payload)?,
        )
        .await
        .map(|_| ())
    }

    /// Dispatches a `delete` event against a live aggregate.
    pub async fn delete<P: Serialize>(
        &self,
        event_type: &str,
        aggregate_id: &str,
        payload: P,
    ) -> Result<()> {
        self.dispatch(
            Operation::Delete,
            event_type,
            Some(aggregate_id),
            normalize(payload)?,
        )
        .await
        .map(|_| ())
    }

    /// Builds, validates, authorizes, and applies one locally produced event.
    #[instrument(skip(self, payload), fields(aggregate_type = %self.aggregate_type))]
    async fn dispatch(
        &self,
        operation: Operation,
        event_type: &str,
        aggregate_id: Option<&str>,
        payload: Option<Value>,
    ) -> Result<String> {
        self.initialize().await?;
        if self.context.bus.is_terminated() {
            return Err(Error::Terminated);
        }

        let config = self.events.get(event_type).ok_or_else(|| {
            Error::invalid_input(format!(
                "no event `{event_type}` configured for aggregate `{}`",
                self.aggregate_type
            ))
        })?;
        if config.operation != operation {
            return Err(Error::invalid_input(format!(
                "event `{event_type}` is a {} event, dispatched as {}",
                config.operation.as_str(),
                operation.as_str()
            )));
        }
        if let Some(validator) = &config.payload_schema {
            validator
                .validate(payload.as_ref().unwrap_or(&Value::Null))
                .map_err(|issues| Error::InvalidInput {
                    message: format!("payload for `{event_type}` failed validation"),
                    issues,
                })?;
        }

        let device_id = self.context.auth.device_id().await?;
        let account = self.context.auth.account().await?;

        let aggregate_id = match aggregate_id {
            Some(id) => id.to_string(),
            None => (self.aggregate_id_generator)(),
        };
        let current = self.get(&aggregate_id);
        if operation != Operation::Create && current.is_none() {
            return Err(Error::NotFound(format!(
                "aggregate `{}/{aggregate_id}` does not exist",
                self.aggregate_type
            )));
        }

        let event = Event {
            id: (self.context.event_id_generator)(),
            operation,
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: aggregate_id.clone(),
            event_type: event_type.to_string(),
            payload,
            dispatched_at: Utc::now(),
            created_by: account.as_ref().map(|a| a.id().to_string()),
            created_on: device_id,
            prev_id: current.as_ref().map(|s| s.last_event_id.clone()),
            recorded_at: None,
        };

        let allowed = if let Some(policy) = &config.dispatch_policy {
            policy(account.as_ref(), current.as_ref(), &event)
        } else if let Some(policy) = &self.aggregate_policy {
            policy(account.as_ref(), current.as_ref(), &event)
        } else if let Some(policy) = &self.context.default_policy {
            policy(account.as_ref(), &event)
        } else {
            true
        };
        if !allowed {
            return Err(Error::Unauthorized(format!(
                "dispatch of `{event_type}` rejected by policy"
            )));
        }

        self.apply_event(event).await?;
        Ok(aggregate_id)
    }

    /// Applies one event, locally produced or received from another device.
    ///
    /// On success the collection, the event log, the snapshot repository,
    /// and the bus all reflect the transition. When a persistence step fails
    /// the collection is restored to its previous value and the bus is
    /// terminated with the failure; the error is not re-thrown here but
    /// surfaces through the bus termination hooks.
    #[instrument(
        skip(self, event),
        fields(
            aggregate_type = %event.aggregate_type,
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
        )
    )]
    pub async fn apply_event(&self, event: Event) -> Result<()> {
        if event.aggregate_type != self.aggregate_type {
            return Err(Error::AggregateTypeMismatch {
                expected: self.aggregate_type.clone(),
                actual: event.aggregate_type,
            });
        }
        self.initialize().await?;

        let config = self.events.get(&event.event_type).ok_or_else(|| {
            Error::invalid_input(format!(
                "no event `{}` configured for aggregate `{}`",
                event.event_type, self.aggregate_type
            ))
        })?;

        let current = self.get(&event.aggregate_id);
        match event.operation {
            Operation::Create if current.is_some() => {
                return Err(Error::Conflict(format!(
                    "aggregate `{}/{}` already exists",
                    self.aggregate_type, event.aggregate_id
                )));
            }
            Operation::Update | Operation::Delete if current.is_none() => {
                return Err(Error::NotFound(format!(
                    "aggregate `{}/{}` does not exist",
                    self.aggregate_type, event.aggregate_id
                )));
            }
            _ => {}
        }

        // Compute the next snapshot before touching the collection so a
        // failing applier or schema leaves no side effect behind.
        let next = match &config.applier {
            EventApplier::Construct(construct) => {
                let state = construct(&event, event.payload.as_ref())?;
                let snapshot = Snapshot {
                    id: event.aggregate_id.clone(),
                    created_by: event.created_by.clone(),
                    created_on: event.created_on.clone(),
                    last_event_id: event.id.clone(),
                    created_at: event.dispatched_at,
                    updated_at: event.dispatched_at,
                    version: 1,
                    last_recorded_at: event.recorded_at,
                    state,
                };
                self.check_state(&snapshot)?;
                Some(snapshot)
            }
            EventApplier::Reduce(reduce) => {
                let current = current.as_ref().expect("liveness checked above");
                let state = reduce(&current.state, &event, event.payload.as_ref())?;
                let snapshot = Snapshot {
                    state,
                    updated_at: event.dispatched_at,
                    last_event_id: event.id.clone(),
                    last_recorded_at: event.recorded_at.or(current.last_recorded_at),
                    version: current.version + 1,
                    ..current.clone()
                };
                self.check_state(&snapshot)?;
                Some(snapshot)
            }
            EventApplier::Destruct(destruct) => {
                if let Some(destruct) = destruct {
                    let current = current.as_ref().expect("liveness checked above");
                    destruct(&current.state, &event, event.payload.as_ref());
                }
                None
            }
        };

        // Apply optimistically; reads see the new state while persistence is
        // in flight.
        let previous = self.collection.read().unwrap().clone();
        {
            let mut collection = self.collection.write().unwrap();
            match &next {
                Some(snapshot) => {
                    collection.insert(event.aggregate_id.clone(), snapshot.clone());
                }
                None => {
                    collection.remove(&event.aggregate_id);
                }
            }
        }

        let persisted: Result<()> = async {
            if let Some(events_repository) = &self.context.events_repository {
                events_repository.create(&event).await?;
            }
            if let Some(repository) = &self.repository {
                match (&next, event.operation) {
                    (Some(snapshot), Operation::Create) => repository.create(snapshot).await?,
                    (Some(snapshot), _) => {
                        repository.update(&event.aggregate_id, snapshot).await?;
                    }
                    (None, _) => repository.delete(&event.aggregate_id).await?,
                }
            }
            self.context.bus.dispatch(&event).await?;
            Ok(())
        }
        .await;

        match persisted {
            Ok(()) => {
                self.notify_subscribers();
                Ok(())
            }
            Err(err) => {
                *self.collection.write().unwrap() = previous;
                tracing::error!(
                    error = %err,
                    "persistence failed while applying event; rolled back and terminating"
                );
                self.context.bus.terminate(Some(err));
                Ok(())
            }
        }
    }

    /// Marks an event of this aggregate as recorded on the server.
    ///
    /// Updates the snapshot's `last_recorded_at`, backfills its `created_by`
    /// when previously absent, and delegates to the event log. A missing
    /// aggregate is tolerated silently — it may have been deleted since.
    #[instrument(skip(self, event), fields(event_id = %event.id))]
    pub async fn mark_recorded(&self, event: &Event) -> Result<()> {
        if event.aggregate_type != self.aggregate_type {
            return Err(Error::AggregateTypeMismatch {
                expected: self.aggregate_type.clone(),
                actual: event.aggregate_type.clone(),
            });
        }
        self.initialize().await?;
        let recorded_at = event.recorded_at.ok_or_else(|| {
            Error::invalid_input(format!("event `{}` carries no recorded_at", event.id))
        })?;

        let updated = {
            let mut collection = self.collection.write().unwrap();
            collection.get_mut(&event.aggregate_id).map(|snapshot| {
                snapshot.last_recorded_at = Some(recorded_at);
                if snapshot.created_by.is_none() {
                    snapshot.created_by = event.created_by.clone();
                }
                snapshot.clone()
            })
        };
        if let Some(snapshot) = &updated {
            if let Some(repository) = &self.repository {
                repository.update(&event.aggregate_id, snapshot).await?;
            }
        }
        if let Some(events_repository) = &self.context.events_repository {
            events_repository
                .mark_recorded(&event.id, recorded_at, event.created_by.as_deref())
                .await?;
        }
        if updated.is_some() {
            self.notify_subscribers();
        }
        Ok(())
    }

    /// Clears the collection and the snapshot repository and re-arms lazy
    /// initialization. Subscribers observe the empty collection.
    pub async fn reset(&self) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        self.collection.write().unwrap().clear();
        if let Some(repository) = &self.repository {
            repository.delete_all().await?;
        }
        self.initialized.store(false, Ordering::Release);
        self.notify_subscribers();
        Ok(())
    }

    fn check_state(&self, snapshot: &Snapshot<S>) -> Result<()> {
        let Some(validator) = &self.state_schema else {
            return Ok(());
        };
        let value = serde_json::to_value(&snapshot.state).map_err(|e| Error::InvalidInput {
            message: format!(
                "state of aggregate `{}/{}` is not serializable",
                self.aggregate_type, snapshot.id
            ),
            issues: vec![e.to_string()],
        })?;
        validator.validate(&value).map_err(|issues| Error::InvalidInput {
            message: format!(
                "state of aggregate `{}/{}` failed schema validation",
                self.aggregate_type, snapshot.id
            ),
            issues,
        })
    }

    fn notify_subscribers(&self) {
        let collection = self.collection.read().unwrap().clone();
        let subscribers: Vec<StateSubscriber<S>> = self
            .subscribers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, s)| s.clone())
            .collect();
        for subscriber in subscribers {
            subscriber(&collection);
        }
    }
}

/// Object-safe view of a store used by the broker to route events without
/// knowing the state type.
#[async_trait]
pub(crate) trait StoreHandle: Send + Sync {
    fn aggregate_type(&self) -> &str;
    async fn apply_event(&self, event: Event) -> Result<()>;
    async fn mark_recorded(&self, event: &Event) -> Result<()>;
    async fn reset(&self) -> Result<()>;
}

#[async_trait]
impl<S, U: Identity> StoreHandle for AggregateStore<S, U>
where
    S: Clone + Serialize + Send + Sync + 'static,
{
    fn aggregate_type(&self) -> &str {
        AggregateStore::aggregate_type(self)
    }

    async fn apply_event(&self, event: Event) -> Result<()> {
        AggregateStore::apply_event(self, event).await
    }

    async fn mark_recorded(&self, event: &Event) -> Result<()> {
        AggregateStore::mark_recorded(self, event).await
    }

    async fn reset(&self) -> Result<()> {
        AggregateStore::reset(self).await
    }
}

/// Serializes a dispatcher payload to its wire form; JSON null becomes "no
/// payload".
fn normalize<P: Serialize>(payload: P) -> Result<Option<Value>> {
    match serde_json::to_value(payload) {
        Ok(Value::Null) => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(e) => Err(Error::InvalidInput {
            message: "payload is not serializable".to_string(),
            issues: vec![e.to_string()],
        }),
    }
}
