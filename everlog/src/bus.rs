//! A resettable, replaying, terminable event bus.
//!
//! The bus is the integrity boundary of the runtime: every applied event is
//! broadcast through it, every subscriber observes the same total order, and
//! a failed persistence anywhere seals it so no further events propagate.
//! It is a plain in-memory primitive — a replay buffer plus a subscriber
//! list with a one-shot terminal flag — and needs no stream library.

use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use crate::{Error, Event, Result};

/// Async callback invoked once per dispatched event.
pub type BusSubscriber = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Callback invoked when the bus transitions into its terminal state.
pub type TerminationHook = Arc<dyn Fn(Option<&Error>) + Send + Sync>;

/// Handle identifying one subscriber or termination hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

#[derive(Default)]
struct BusInner {
    buffer: Vec<Event>,
    subscribers: Vec<(u64, BusSubscriber)>,
    hooks: Vec<(u64, TerminationHook)>,
    /// `Some` once terminated; holds the terminal error, if one was given.
    terminal: Option<Option<Error>>,
    next_id: u64,
}

/// A single-producer-multi-consumer conduit with full replay.
///
/// Every dispatched event is delivered to every current subscriber and, via
/// the replay buffer, to every future subscriber in the original dispatch
/// order. [`terminate`](EventBus::terminate) seals the bus;
/// [`reset`](EventBus::reset) clears the replay history and revives it while
/// keeping subscribers attached.
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    /// Creates an open bus with an empty replay buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Broadcasts `event` to every subscriber in subscription order.
    ///
    /// Fails with [`Error::Terminated`] when the bus is sealed. A subscriber
    /// error is not swallowed: delivery stops and the error is returned to
    /// the caller, which is expected to route it into
    /// [`terminate`](EventBus::terminate).
    pub async fn dispatch(&self, event: &Event) -> Result<()> {
        let subscribers = {
            let mut inner = self.inner.lock().unwrap();
            if inner.terminal.is_some() {
                return Err(Error::Terminated);
            }
            inner.buffer.push(event.clone());
            inner.subscribers.clone()
        };

        for (_, subscriber) in subscribers {
            if self.is_terminated() {
                return Err(Error::Terminated);
            }
            subscriber(event.clone()).await?;
        }
        Ok(())
    }

    /// Attaches a subscriber.
    ///
    /// The subscriber first receives every previously dispatched event in
    /// original order, then every subsequent event until
    /// [`unsubscribe`](EventBus::unsubscribe) or termination. An error
    /// returned during replay aborts the subscription and is handed back to
    /// the caller.
    pub async fn subscribe<F, Fut>(&self, subscriber: F) -> Result<SubscriptionId>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let subscriber: BusSubscriber = Arc::new(move |event| Box::pin(subscriber(event)));
        let mut cursor = 0;

        // Replay until caught up with the live buffer, then attach. Events
        // dispatched while a replay batch was awaited are picked up by the
        // next round, preserving the total order.
        loop {
            let pending: Vec<Event> = {
                let mut inner = self.inner.lock().unwrap();
                if inner.buffer.len() == cursor {
                    let id = inner.next_id;
                    inner.next_id += 1;
                    inner.subscribers.push((id, subscriber.clone()));
                    return Ok(SubscriptionId(id));
                }
                inner.buffer[cursor..].to_vec()
            };
            for event in pending {
                cursor += 1;
                subscriber(event).await?;
            }
        }
    }

    /// Detaches a subscriber. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.retain(|(sid, _)| *sid != id.0);
    }

    /// Seals the bus, stopping all further delivery.
    ///
    /// Idempotent: only the first call takes effect. The replay buffer is
    /// preserved until [`reset`](EventBus::reset). Termination hooks are
    /// invoked with `error`; subscribers are not.
    pub fn terminate(&self, error: Option<Error>) {
        let (hooks, error) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.terminal.is_some() {
                return;
            }
            inner.terminal = Some(error.clone());
            (inner.hooks.clone(), error)
        };
        if let Some(err) = &error {
            tracing::error!(error = %err, "event bus terminated");
        }
        for (_, hook) in hooks {
            hook(error.as_ref());
        }
    }

    /// Registers a hook invoked once per terminal transition.
    ///
    /// If the bus is already terminated the hook fires immediately with the
    /// stored error; it stays registered and fires again should the bus be
    /// reset and terminated anew.
    pub fn on_termination<F>(&self, hook: F) -> SubscriptionId
    where
        F: Fn(Option<&Error>) + Send + Sync + 'static,
    {
        let hook: TerminationHook = Arc::new(hook);
        let (id, fire_now) = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.hooks.push((id, hook.clone()));
            (id, inner.terminal.clone())
        };
        if let Some(error) = fire_now {
            hook(error.as_ref());
        }
        SubscriptionId(id)
    }

    /// Clears the replay buffer and restores the non-terminated state.
    ///
    /// Existing subscribers stay attached and eligible for future events.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.buffer.clear();
        inner.terminal = None;
    }

    /// Whether the bus is currently sealed.
    pub fn is_terminated(&self) -> bool {
        self.inner.lock().unwrap().terminal.is_some()
    }

    /// The error the bus was terminated with, if any.
    pub fn terminal_error(&self) -> Option<Error> {
        self.inner.lock().unwrap().terminal.clone().flatten()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("EventBus")
            .field("buffered", &inner.buffer.len())
            .field("subscribers", &inner.subscribers.len())
            .field("terminated", &inner.terminal.is_some())
            .finish()
    }
}
