//! # Offline-First Event Sourcing Runtime
//!
//! `everlog` is a Rust runtime for building offline-first, event-sourced
//! client applications. Application state lives in aggregates whose snapshots
//! are derived exclusively from an append-only log of events. Events
//! dispatched locally are applied to in-memory state immediately, persisted to
//! the local event log and snapshot repository, and recorded on a central
//! server in the background. Events produced on other devices arrive through
//! fetch or push and are applied through the same path, so every device
//! converges on the same state once connectivity returns.
//!
//! ## Core Concepts
//!
//! - **[`Event`]**: An immutable record describing one state transition on a
//!   single aggregate.
//! - **[`EventBus`]**: A replaying, terminable pub/sub conduit shared by the
//!   whole runtime.
//! - **[`AggregateStore`]**: The per-aggregate-type projection engine:
//!   validation, authorization, reducers, and dual-write persistence with
//!   rollback.
//! - **[`Broker`]**: The coordinator that owns the bus, registers stores,
//!   records events on the server, and runs the retry/connection-driven sync
//!   loop.
//! - **Repositories and adapters**: Narrow contracts ([`EventsRepository`],
//!   [`AggregateRepository`], [`AuthAdapter`], [`EventServerAdapter`],
//!   [`ConnectionStatusAdapter`]) supplied by the embedding application.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use serde::{Deserialize, Serialize};
//!
//! use everlog::adapter::AuthAdapter;
//! use everlog::async_trait;
//! use everlog::store::in_memory::InMemoryEventsRepository;
//! use everlog::store::in_memory_snapshot::InMemoryAggregateRepository;
//! use everlog::{AggregateConfig, Broker, EventConfig};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Profile {
//!     name: String,
//! }
//!
//! #[derive(Serialize, Deserialize)]
//! struct CreateProfile {
//!     name: String,
//! }
//!
//! #[derive(Serialize, Deserialize)]
//! struct RenameProfile {
//!     name: String,
//! }
//!
//! struct DeviceAuth;
//!
//! #[async_trait]
//! impl AuthAdapter<String> for DeviceAuth {
//!     async fn device_id(&self) -> everlog::Result<String> {
//!         Ok("device-1".into())
//!     }
//!
//!     async fn account(&self) -> everlog::Result<Option<String>> {
//!         Ok(Some("account-1".into()))
//!     }
//! }
//!
//! async fn profile_example() -> everlog::Result<()> {
//!     let broker = Broker::<String>::builder(Arc::new(DeviceAuth))
//!         .events_repository(Arc::new(InMemoryEventsRepository::new()))
//!         .build()
//!         .await;
//!
//!     let profiles = broker.register(
//!         AggregateConfig::<Profile, String>::builder("profile")
//!             .repository(Arc::new(InMemoryAggregateRepository::new()))
//!             .event(EventConfig::create::<CreateProfile, _>(
//!                 "profile.create",
//!                 |_event, payload| Profile { name: payload.name },
//!             ))
//!             .event(EventConfig::update::<RenameProfile, _>(
//!                 "profile.rename",
//!                 |_profile, _event, payload| Profile { name: payload.name },
//!             ))
//!             .build(),
//!     )?;
//!
//!     let id = profiles
//!         .create("profile.create", CreateProfile { name: "Ada".into() })
//!         .await?;
//!     profiles
//!         .update("profile.rename", &id, RenameProfile { name: "Grace".into() })
//!         .await?;
//!
//!     assert_eq!(profiles.state()[&id].state.name, "Grace");
//!     Ok(())
//! }
//! ```
#![deny(missing_docs)]

use std::sync::Arc;

pub use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod adapter;
pub mod aggregate;
pub mod broker;
pub mod bus;
pub mod config;
pub mod schema;
pub mod snapshot;
pub mod store;

pub use adapter::{AuthAdapter, ConnectionStatusAdapter, EventServerAdapter};
pub use aggregate::AggregateStore;
pub use broker::{Broker, BrokerBuilder};
pub use bus::{EventBus, SubscriptionId};
pub use config::{AggregateConfig, AggregateConfigBuilder, EventConfig};
pub use schema::Validator;
pub use snapshot::{AggregateRepository, Snapshot};

/// The error type for this crate.
///
/// Variants are coarse error kinds rather than precise types; the payload
/// carries the diagnostics. All variants are `Clone` so a terminal error can
/// be fanned out to every termination hook on the [`EventBus`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A payload or configuration failed validation. `issues` holds the
    /// individual findings reported by the [`Validator`].
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Human-readable summary of what was rejected.
        message: String,
        /// Individual validation findings, if any.
        issues: Vec<String>,
    },
    /// A dispatch policy rejected the event before any side effect.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// An update, delete, or record referenced an aggregate or event that
    /// does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// A repository write failed. Raised inside `apply_event`, handled by
    /// rollback plus bus termination, and reported through termination hooks.
    #[error("storage error: {0}")]
    Storage(String),
    /// Two state transitions contended for the same aggregate.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The server adapter failed transiently; the operation will be retried
    /// on the next sync cycle.
    #[error("network error: {0}")]
    Network(String),
    /// An event was routed to a store for a different aggregate type. This is
    /// a programmer error and is raised before any side effect.
    #[error("aggregate type mismatch: expected `{expected}`, got `{actual}`")]
    AggregateTypeMismatch {
        /// The aggregate type the store owns.
        expected: String,
        /// The aggregate type carried by the event.
        actual: String,
    },
    /// The event bus is sealed; no further events can be dispatched until it
    /// is reset.
    #[error("event bus terminated")]
    Terminated,
}

impl Error {
    /// Shorthand for an [`Error::InvalidInput`] without individual issues.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Error::InvalidInput {
            message: message.into(),
            issues: Vec::new(),
        }
    }
}

/// A specialized `Result` type for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The kind of state transition an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Brings a new aggregate into existence.
    Create,
    /// Transforms the state of a live aggregate.
    Update,
    /// Removes an aggregate from the live set.
    Delete,
}

impl Operation {
    /// Returns the lowercase name of the operation.
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

/// An immutable record describing one state transition on one aggregate.
///
/// Events are append-only: once written to the log they never change, with
/// one exception — when an event is first recorded on the central server it
/// gains `recorded_at`, and `created_by` may be filled in if it was absent
/// (an event dispatched while signed out is stamped with its account on
/// sync).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier, generated on the originating device.
    pub id: String,
    /// The kind of transition this event describes.
    pub operation: Operation,
    /// Routes the event to the store owning this aggregate type.
    pub aggregate_type: String,
    /// Identifier of the target aggregate.
    pub aggregate_id: String,
    /// Logical event name, e.g. `profile.create`.
    pub event_type: String,
    /// Operation-specific data, validated against the configured schema.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Wall-clock timestamp at the origin device.
    pub dispatched_at: DateTime<Utc>,
    /// Originating account id; absent when dispatched while signed out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    /// Originating device id.
    pub created_on: String,
    /// Id of the last event on this aggregate known to the originator;
    /// absent for `create`. Kept to detect causality and divergent chains.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_id: Option<String>,
    /// Server-assigned timestamp set when the event is durably recorded
    /// centrally; absent until then.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
}

/// The account contract consumed by dispatch policies and event authorship.
///
/// Implemented for `String` so applications that only need an account id can
/// use one directly.
pub trait Identity: Clone + Send + Sync + 'static {
    /// Returns the stable identifier of this account.
    fn id(&self) -> &str;
}

impl Identity for String {
    fn id(&self) -> &str {
        self
    }
}

/// Generates fresh event or aggregate identifiers.
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// The local append-only event log.
///
/// Written only from within a store's `apply_event`/`mark_recorded`/`reset`;
/// the broker reads it to drive the sync loop.
#[async_trait]
pub trait EventsRepository: Send + Sync {
    /// Appends one event to the log.
    async fn create(&self, event: &Event) -> Result<()>;

    /// Deletes every event. Used by broker reset.
    async fn delete_all(&self) -> Result<()>;

    /// Stamps an event as recorded on the server.
    ///
    /// Sets `recorded_at`, and fills `created_by` only when it was previously
    /// absent. Fails with [`Error::NotFound`] when no event has the given id.
    async fn mark_recorded(
        &self,
        event_id: &str,
        recorded_at: DateTime<Utc>,
        created_by: Option<&str>,
    ) -> Result<()>;

    /// Returns every event not yet recorded on the server, in dispatch order.
    async fn unrecorded(&self) -> Result<Vec<Event>>;

    /// Returns the most recent recorded event that originated on a different
    /// device, or `None` if nothing has been received yet.
    async fn last_received(&self, device_id: &str) -> Result<Option<Event>>;
}
