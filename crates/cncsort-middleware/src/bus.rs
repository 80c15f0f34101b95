//! Synchronous, kind-routed publish/subscribe event channel.
//!
//! [`EventChannel::publish`] runs every handler registered for the event's
//! [`EventKind`] in the caller's context, in registration order, before it
//! returns.  Handlers are isolated from one another: an `Err` or a panic in
//! one handler is logged and recorded, and the rest still run.
//!
//! # Re-entrancy
//!
//! The handler list is snapshotted before dispatch and no lock is held while
//! a handler runs, so handlers may publish further events or (un)subscribe.
//! A handler added during dispatch first sees the *next* event of its kind.
//!
//! # Async observers
//!
//! [`EventChannel::tap`] returns a [`tokio::sync::broadcast`] receiver that
//! mirrors every published event.  Taps see only events published after they
//! were created; slow taps lag rather than block the publisher.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use cncsort_types::{Event, EventKind, SorterError};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Number of buffered events per tap before slow taps start lagging.
const TAP_CAPACITY: usize = 256;

/// Most recent handler failures retained by [`EventChannel::failures`].
const FAILURE_LOG_CAPACITY: usize = 128;

/// A registered event handler.
pub type Handler = Arc<dyn Fn(&Event) -> Result<(), SorterError> + Send + Sync>;

/// Opaque handle returned by [`EventChannel::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Outcome of one [`EventChannel::publish`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishReport {
    /// Handlers that returned `Ok`.
    pub delivered: usize,
    /// Handlers that returned `Err` or panicked.
    pub failed: usize,
}

/// One isolated handler failure.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerFailure {
    pub subscription: SubscriptionId,
    pub kind: EventKind,
    pub event_id: Uuid,
    pub message: String,
}

struct Inner {
    handlers: RwLock<HashMap<EventKind, Vec<(SubscriptionId, Handler)>>>,
    next_id: AtomicU64,
    failures: Mutex<VecDeque<HandlerFailure>>,
    tap: broadcast::Sender<Event>,
}

/// Shared event channel.  Clone it cheaply – all clones share the same
/// handler registry.
#[derive(Clone)]
pub struct EventChannel {
    inner: Arc<Inner>,
}

impl EventChannel {
    pub fn new() -> Self {
        let (tap, _) = broadcast::channel(TAP_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                handlers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                failures: Mutex::new(VecDeque::with_capacity(FAILURE_LOG_CAPACITY)),
                tap,
            }),
        }
    }

    /// Register `handler` for every event of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<(), SorterError> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        debug!(%kind, subscription = id.0, "handler subscribed");
        id
    }

    /// Remove a handler.  Returns `false` if `id` was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.inner.handlers.write().unwrap_or_else(PoisonError::into_inner);
        for list in handlers.values_mut() {
            if let Some(pos) = list.iter().position(|(sid, _)| *sid == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Drop every registered handler.  Taps are unaffected.
    pub fn clear(&self) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Deliver `event` to every handler registered for its kind.
    ///
    /// Never fails: handler errors and panics are contained and reported
    /// through the returned [`PublishReport`] and [`EventChannel::failures`].
    pub fn publish(&self, event: Event) -> PublishReport {
        let kind = event.kind();
        let snapshot: Vec<(SubscriptionId, Handler)> = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        let mut report = PublishReport::default();
        for (id, handler) in snapshot {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&event)));
            let message = match outcome {
                Ok(Ok(())) => {
                    report.delivered += 1;
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(payload) => format!("handler panicked: {}", panic_message(payload.as_ref())),
            };
            report.failed += 1;
            warn!(%kind, subscription = id.0, event_id = %event.id, error = %message, "event handler failed");
            self.record_failure(HandlerFailure {
                subscription: id,
                kind,
                event_id: event.id,
                message,
            });
        }

        // No taps is the normal case.
        let _ = self.inner.tap.send(event);
        report
    }

    /// A receiver mirroring every event published from now on.
    pub fn tap(&self) -> broadcast::Receiver<Event> {
        self.inner.tap.subscribe()
    }

    /// The most recent handler failures, oldest first.
    pub fn failures(&self) -> Vec<HandlerFailure> {
        self.inner
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn record_failure(&self, failure: HandlerFailure) {
        let mut log = self.inner.failures.lock().unwrap_or_else(PoisonError::into_inner);
        if log.len() == FAILURE_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(failure);
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.inner.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let total: usize = handlers.values().map(Vec::len).sum();
        f.debug_struct("EventChannel")
            .field("handlers", &total)
            .field("taps", &self.inner.tap.receiver_count())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
