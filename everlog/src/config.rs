//! Aggregate and event configuration.
//!
//! An [`AggregateConfig`] is the immutable metadata a broker turns into an
//! [`AggregateStore`](crate::AggregateStore): the aggregate type, the state
//! schema, the snapshot repository, and one [`EventConfig`] per event kind.
//! Each event config carries exactly one applier — construct, reduce, or
//! destruct — selected by its [`Operation`].

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::schema::{self, Validator};
use crate::snapshot::{AggregateRepository, Snapshot};
use crate::{Error, Event, IdGenerator, Identity, Operation, Result};

/// Event type names that collide with the store's own operations and are
/// refused at registration.
const RESTRICTED_NAMES: &[&str] = &[
    "state",
    "subscribe",
    "reset",
    "initialize",
    "initialized",
    "mark_recorded",
    "apply_event",
];

/// Decides whether an account may dispatch an event against the current
/// snapshot. Evaluated after the event is built and before it is applied.
pub type DispatchPolicy<S, U> =
    Arc<dyn Fn(Option<&U>, Option<&Snapshot<S>>, &Event) -> bool + Send + Sync>;

/// Broker-wide fallback policy, applied when neither the event nor the
/// aggregate configures one. It cannot see the typed snapshot, only the
/// account and the event.
pub type DefaultDispatchPolicy<U> = Arc<dyn Fn(Option<&U>, &Event) -> bool + Send + Sync>;

pub(crate) type ConstructFn<S> =
    Arc<dyn Fn(&Event, Option<&Value>) -> Result<S> + Send + Sync>;
pub(crate) type ReduceFn<S> =
    Arc<dyn Fn(&S, &Event, Option<&Value>) -> Result<S> + Send + Sync>;
pub(crate) type DestructFn<S> = Arc<dyn Fn(&S, &Event, Option<&Value>) + Send + Sync>;

/// The state transition attached to one event kind, tagged by operation.
pub(crate) enum EventApplier<S> {
    Construct(ConstructFn<S>),
    Reduce(ReduceFn<S>),
    Destruct(Option<DestructFn<S>>),
}

/// Immutable metadata for one event kind.
pub struct EventConfig<S, U> {
    pub(crate) event_type: String,
    pub(crate) operation: Operation,
    pub(crate) payload_schema: Option<Arc<dyn Validator>>,
    pub(crate) dispatch_policy: Option<DispatchPolicy<S, U>>,
    pub(crate) applier: EventApplier<S>,
}

fn decode_payload<P>(event_type: &str, payload: Option<&Value>) -> Result<P>
where
    P: DeserializeOwned,
{
    serde_json::from_value(payload.cloned().unwrap_or(Value::Null)).map_err(|e| {
        Error::InvalidInput {
            message: format!("payload for `{event_type}` could not be decoded"),
            issues: vec![e.to_string()],
        }
    })
}

impl<S, U> EventConfig<S, U> {
    /// Configures a `create` event: `construct` builds the initial state from
    /// the typed payload.
    ///
    /// A [`SerdeValidator`](crate::schema::SerdeValidator) for `P` is
    /// installed as the payload schema; override it with
    /// [`with_payload_schema`](EventConfig::with_payload_schema). Use `()` as
    /// the payload type for payload-less events.
    pub fn create<P, F>(event_type: impl Into<String>, construct: F) -> Self
    where
        P: DeserializeOwned + 'static,
        F: Fn(&Event, P) -> S + Send + Sync + 'static,
    {
        let event_type = event_type.into();
        let name = event_type.clone();
        Self {
            event_type,
            operation: Operation::Create,
            payload_schema: Some(schema::typed::<P>()),
            dispatch_policy: None,
            applier: EventApplier::Construct(Arc::new(move |event, payload| {
                let payload = decode_payload::<P>(&name, payload)?;
                Ok(construct(event, payload))
            })),
        }
    }

    /// Configures an `update` event: `reduce` derives the next state from the
    /// current state and the typed payload.
    pub fn update<P, F>(event_type: impl Into<String>, reduce: F) -> Self
    where
        P: DeserializeOwned + 'static,
        F: Fn(&S, &Event, P) -> S + Send + Sync + 'static,
    {
        let event_type = event_type.into();
        let name = event_type.clone();
        Self {
            event_type,
            operation: Operation::Update,
            payload_schema: Some(schema::typed::<P>()),
            dispatch_policy: None,
            applier: EventApplier::Reduce(Arc::new(move |state, event, payload| {
                let payload = decode_payload::<P>(&name, payload)?;
                Ok(reduce(state, event, payload))
            })),
        }
    }

    /// Configures a `delete` event with no side-effect hook.
    pub fn delete(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            operation: Operation::Delete,
            payload_schema: None,
            dispatch_policy: None,
            applier: EventApplier::Destruct(None),
        }
    }

    /// Configures a `delete` event whose `destruct` hook runs against the
    /// state being removed, e.g. to release resources it owned.
    pub fn delete_with<P, F>(event_type: impl Into<String>, destruct: F) -> Self
    where
        P: DeserializeOwned + 'static,
        F: Fn(&S, &Event, P) + Send + Sync + 'static,
    {
        let event_type = event_type.into();
        let name = event_type.clone();
        Self {
            event_type,
            operation: Operation::Delete,
            payload_schema: Some(schema::typed::<P>()),
            dispatch_policy: None,
            applier: EventApplier::Destruct(Some(Arc::new(move |state, event, payload| {
                match decode_payload::<P>(&name, payload) {
                    Ok(payload) => destruct(state, event, payload),
                    // The payload was validated before dispatch; a decode
                    // failure here would only drop the side-effect hook.
                    Err(err) => tracing::warn!(error = %err, "destruct hook skipped"),
                }
            }))),
        }
    }

    /// Overrides the payload schema installed by the typed constructor.
    pub fn with_payload_schema(mut self, validator: Arc<dyn Validator>) -> Self {
        self.payload_schema = Some(validator);
        self
    }

    /// Sets the dispatch policy for this event kind.
    pub fn with_policy<F>(mut self, policy: F) -> Self
    where
        F: Fn(Option<&U>, Option<&Snapshot<S>>, &Event) -> bool + Send + Sync + 'static,
    {
        self.dispatch_policy = Some(Arc::new(policy));
        self
    }

    /// The logical event name.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The operation this event performs.
    pub fn operation(&self) -> Operation {
        self.operation
    }
}

/// Immutable configuration for one aggregate type.
pub struct AggregateConfig<S, U> {
    pub(crate) aggregate_type: String,
    pub(crate) state_schema: Option<Arc<dyn Validator>>,
    pub(crate) repository: Option<Arc<dyn AggregateRepository<S>>>,
    pub(crate) events: Vec<EventConfig<S, U>>,
    pub(crate) aggregate_id_generator: Option<IdGenerator>,
    pub(crate) dispatch_policy: Option<DispatchPolicy<S, U>>,
}

impl<S, U: Identity> AggregateConfig<S, U> {
    /// Starts building a configuration for `aggregate_type`.
    pub fn builder(aggregate_type: impl Into<String>) -> AggregateConfigBuilder<S, U> {
        AggregateConfigBuilder {
            config: AggregateConfig {
                aggregate_type: aggregate_type.into(),
                state_schema: None,
                repository: None,
                events: Vec::new(),
                aggregate_id_generator: None,
                dispatch_policy: None,
            },
        }
    }

    /// The aggregate type this configuration describes.
    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    /// Checks the configuration for shape errors; run by the broker before a
    /// store is created.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.aggregate_type.is_empty() {
            return Err(Error::invalid_input("aggregate type must not be empty"));
        }
        let mut seen = std::collections::HashSet::new();
        for event in &self.events {
            if RESTRICTED_NAMES.contains(&event.event_type.as_str()) {
                return Err(Error::invalid_input(format!(
                    "event type `{}` collides with a store operation",
                    event.event_type
                )));
            }
            if !seen.insert(event.event_type.as_str()) {
                return Err(Error::invalid_input(format!(
                    "event type `{}` configured twice for aggregate `{}`",
                    event.event_type, self.aggregate_type
                )));
            }
        }
        Ok(())
    }
}

/// Fluent builder producing a validated [`AggregateConfig`].
pub struct AggregateConfigBuilder<S, U> {
    config: AggregateConfig<S, U>,
}

impl<S, U: Identity> AggregateConfigBuilder<S, U> {
    /// Sets the schema the computed state is validated against after every
    /// construct/reduce.
    pub fn state_schema(mut self, validator: Arc<dyn Validator>) -> Self {
        self.config.state_schema = Some(validator);
        self
    }

    /// Sets the snapshot repository. Without one the store keeps its
    /// collection in memory only.
    pub fn repository(mut self, repository: Arc<dyn AggregateRepository<S>>) -> Self {
        self.config.repository = Some(repository);
        self
    }

    /// Adds one event kind.
    pub fn event(mut self, event: EventConfig<S, U>) -> Self {
        self.config.events.push(event);
        self
    }

    /// Overrides the broker's event id generator for newly minted aggregate
    /// ids of this type.
    pub fn aggregate_id_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.config.aggregate_id_generator = Some(Arc::new(generator));
        self
    }

    /// Sets the default dispatch policy for every event of this aggregate
    /// that does not configure its own.
    pub fn dispatch_policy<F>(mut self, policy: F) -> Self
    where
        F: Fn(Option<&U>, Option<&Snapshot<S>>, &Event) -> bool + Send + Sync + 'static,
    {
        self.config.dispatch_policy = Some(Arc::new(policy));
        self
    }

    /// Finishes the configuration. Shape validation happens at registration.
    pub fn build(self) -> AggregateConfig<S, U> {
        self.config
    }
}
