//! The snapshot module contains the materialized aggregate state record and
//! the repository contract that persists it.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// The materialized current state of one aggregate, derived from its event
/// history.
///
/// The base metadata is maintained by the runtime; `state` is the
/// user-defined projection produced by the configured construct/reduce
/// appliers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "S: Serialize",
    deserialize = "S: serde::de::DeserializeOwned"
))]
pub struct Snapshot<S> {
    /// The aggregate id.
    pub id: String,
    /// Account that created the aggregate; absent when created while signed
    /// out and not yet recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    /// Device the aggregate was created on.
    pub created_on: String,
    /// Id of the last event applied to this aggregate.
    pub last_event_id: String,
    /// Dispatch timestamp of the create event.
    pub created_at: DateTime<Utc>,
    /// Dispatch timestamp of the last applied event.
    pub updated_at: DateTime<Utc>,
    /// Monotonic count of applied events; starts at 1 on create.
    pub version: u64,
    /// Server timestamp of the most recent recorded event applied to this
    /// aggregate, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_recorded_at: Option<DateTime<Utc>>,
    /// The user-defined projection.
    pub state: S,
}

/// Persists aggregate snapshots for one aggregate type.
///
/// A repository is written only through the [`AggregateStore`] owning its
/// aggregate type; external readers go through the store's `state` and
/// `subscribe` instead.
///
/// [`AggregateStore`]: crate::AggregateStore
#[async_trait]
pub trait AggregateRepository<S>: Send + Sync {
    /// Loads one snapshot by aggregate id.
    async fn get_one(&self, id: &str) -> Result<Option<Snapshot<S>>>;

    /// Loads every snapshot, keyed by aggregate id.
    async fn get_all(&self) -> Result<HashMap<String, Snapshot<S>>>;

    /// Persists a snapshot for a newly created aggregate.
    async fn create(&self, snapshot: &Snapshot<S>) -> Result<()>;

    /// Replaces the snapshot of a live aggregate.
    async fn update(&self, id: &str, snapshot: &Snapshot<S>) -> Result<()>;

    /// Removes the snapshot of a deleted aggregate.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Removes every snapshot. Used by store reset.
    async fn delete_all(&self) -> Result<()>;
}
