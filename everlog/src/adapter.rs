//! Adapter contracts the embedding application provides to the runtime:
//! authentication, the central event server, and connectivity.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::{Event, Identity, Result};

/// Async callback invoked for every event pushed by the server.
pub type PushHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// Tears down a server push subscription when called.
pub type Unsubscribe = Box<dyn FnOnce() + Send>;

/// Callback invoked on connectivity changes; `None` means unknown.
pub type ConnectionHandler = Box<dyn Fn(Option<bool>) + Send + Sync>;

/// Supplies the device identity and the currently signed-in account.
///
/// `account` may legitimately return `None`: events dispatched while signed
/// out stay unrecorded (with no `created_by`) until a later sync stamps them.
#[async_trait]
pub trait AuthAdapter<U: Identity>: Send + Sync {
    /// Returns the stable identifier of this device.
    async fn device_id(&self) -> Result<String>;

    /// Returns the currently signed-in account, if any.
    async fn account(&self) -> Result<Option<U>>;
}

/// The central server that durably records events and serves events from
/// other devices.
#[async_trait]
pub trait EventServerAdapter: Send + Sync {
    /// Durably records one event.
    ///
    /// Echoes the input with `recorded_at` set and `created_by` resolved.
    /// Transient failures should surface as [`Error::Network`] so the broker
    /// retries on the next sync cycle.
    ///
    /// [`Error::Network`]: crate::Error::Network
    async fn record(&self, event: &Event) -> Result<Event>;

    /// Fetches events recorded after `after` (an event id), or the full
    /// history when `None`.
    async fn fetch(&self, after: Option<&str>) -> Result<Vec<Event>>;

    /// Subscribes to server push, if the server supports it.
    ///
    /// The default implementation reports no push support.
    fn subscribe(&self, handler: PushHandler) -> Option<Unsubscribe> {
        let _ = handler;
        None
    }
}

/// Reports whether the device currently has connectivity.
#[async_trait]
pub trait ConnectionStatusAdapter: Send + Sync {
    /// Returns the current status; `None` means unknown and is treated as
    /// potentially online.
    async fn get(&self) -> Result<Option<bool>>;

    /// Registers a callback invoked on every status change.
    fn subscribe(&self, handler: ConnectionHandler);
}
