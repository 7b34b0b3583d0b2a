//! Listeners and the manager that fans events out to them.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::protocol::presence_name;
use crate::types::{Event, Membership, Message, Operation, Presence, Status, StatusCategory};

type Handler<T> = Box<dyn Fn(&T) + Send + Sync>;

/// A set of optional per-kind handlers. Only the handlers that are set are
/// ever invoked.
///
/// ```
/// use pubnub_subscriber::Listener;
///
/// let listener = Listener::new()
///     .on_message(|m| println!("{}: {}", m.channel, m.payload))
///     .on_status(|s| println!("status: {:?}", s.category));
/// ```
#[derive(Default)]
pub struct Listener {
    message: Option<Handler<Message>>,
    signal: Option<Handler<Message>>,
    presence: Option<Handler<Presence>>,
    status: Option<Handler<Status>>,
    stream: Option<StreamSender>,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("message", &self.message.is_some())
            .field("signal", &self.signal.is_some())
            .field("presence", &self.presence.is_some())
            .field("status", &self.status.is_some())
            .field("stream", &self.stream.is_some())
            .finish()
    }
}

impl Listener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message(mut self, handler: impl Fn(&Message) + Send + Sync + 'static) -> Self {
        self.message = Some(Box::new(handler));
        self
    }

    pub fn on_signal(mut self, handler: impl Fn(&Message) + Send + Sync + 'static) -> Self {
        self.signal = Some(Box::new(handler));
        self
    }

    pub fn on_presence(mut self, handler: impl Fn(&Presence) + Send + Sync + 'static) -> Self {
        self.presence = Some(Box::new(handler));
        self
    }

    pub fn on_status(mut self, handler: impl Fn(&Status) + Send + Sync + 'static) -> Self {
        self.status = Some(Box::new(handler));
        self
    }

    /// A listener that forwards every event kind into an [`EventStream`].
    ///
    /// Messages, signals and presence events are dropped once `capacity`
    /// events are queued. Statuses use a small reserved headroom on top of
    /// that and are only dropped if the reader stops draining altogether.
    /// Once the [`EventStream`] is dropped the listener stops buffering and
    /// is removed on the next delivery.
    pub fn channel(capacity: usize) -> (Listener, EventStream) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity.saturating_add(STATUS_HEADROOM));
        let dropped = Arc::new(AtomicU64::new(0));
        let listener = Listener {
            stream: Some(StreamSender {
                tx,
                dropped: Arc::clone(&dropped),
            }),
            ..Listener::default()
        };
        (listener, EventStream { rx, dropped })
    }

    /// True once the receiving half of a [`Listener::channel`] is gone.
    fn is_closed(&self) -> bool {
        self.stream.as_ref().is_some_and(|stream| stream.tx.is_closed())
    }

    /// Run the matching handler, converting a panic into its message.
    fn invoke(&self, event: &Event) -> Result<(), String> {
        if let Some(stream) = &self.stream {
            stream.push(event.clone());
            return Ok(());
        }
        let call = || match event {
            Event::Message(message) => {
                if let Some(handler) = &self.message {
                    handler(message);
                }
            }
            Event::Signal(signal) => {
                if let Some(handler) = &self.signal {
                    handler(signal);
                }
            }
            Event::Presence(presence) => {
                if let Some(handler) = &self.presence {
                    handler(presence);
                }
            }
            Event::Status(status) => {
                if let Some(handler) = &self.status {
                    handler(status);
                }
            }
        };
        catch_unwind(AssertUnwindSafe(call)).map_err(|payload| panic_message(payload.as_ref()))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "listener panicked".to_string()
    }
}

// ---------------------------------------------------------------------------
// Event stream
// ---------------------------------------------------------------------------

/// Slots kept free for statuses once data events fill the stream.
const STATUS_HEADROOM: usize = 16;

struct StreamSender {
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

impl StreamSender {
    fn push(&self, event: Event) {
        if !matches!(event, Event::Status(_)) && self.tx.capacity() <= STATUS_HEADROOM {
            self.record_drop();
            return;
        }
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.record_drop(),
            Err(TrySendError::Closed(_)) => {
                debug!("event stream closed, not buffering");
            }
        }
    }

    fn record_drop(&self) {
        if self.tx.is_closed() {
            return;
        }
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(total_dropped = total, "event stream full, dropping event");
    }
}

/// Receiving half of [`Listener::channel`].
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
    dropped: Arc<AtomicU64>,
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("queued", &self.rx.len())
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl EventStream {
    /// Receive the next event. Returns `None` once the listener has been
    /// removed (or the client stopped) and the queue is drained.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Number of events dropped under backpressure so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn into_stream(self) -> impl futures_util::Stream<Item = Event> {
        futures_util::stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Handle returned when registering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

struct Entry {
    id: ListenerId,
    /// Subscription or set id; `None` for client-wide listeners.
    scope: Option<u64>,
    listener: Listener,
}

/// Fans events out to registered listeners. Lives on the event loop.
#[derive(Default)]
pub(crate) struct ListenerManager {
    entries: Vec<Entry>,
    scopes: HashMap<u64, Membership>,
}

impl ListenerManager {
    pub(crate) fn add(&mut self, id: ListenerId, scope: Option<u64>, listener: Listener) {
        self.entries.push(Entry {
            id,
            scope,
            listener,
        });
    }

    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        before != self.entries.len()
    }

    pub(crate) fn register_names(&mut self, scope: u64, names: &Membership) {
        self.scopes.entry(scope).or_default().extend(names);
    }

    pub(crate) fn unregister_names(&mut self, scope: u64, names: &Membership) {
        if let Some(current) = self.scopes.get_mut(&scope) {
            *current = current.difference(names);
        }
    }

    /// Forget a scope and every listener attached to it.
    pub(crate) fn drop_scope(&mut self, scope: u64) {
        self.scopes.remove(&scope);
        self.entries.retain(|entry| entry.scope != Some(scope));
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.scopes.clear();
    }

    fn in_scope(&self, scope: Option<u64>, event: &Event) -> bool {
        let Some(scope) = scope else {
            return true;
        };
        let Some(names) = self.scopes.get(&scope) else {
            return false;
        };
        match event {
            Event::Message(message) | Event::Signal(message) => {
                names.contains_channel(&message.channel)
                    || names.contains_channel(&message.subscription)
                    || names.contains_group(&message.subscription)
            }
            Event::Presence(presence) => {
                names.contains_channel(&presence_name(&presence.channel))
                    || names.contains_channel(&presence.subscription)
                    || names.contains_group(&presence.subscription)
            }
            Event::Status(_) => false,
        }
    }

    /// Deliver `event` to every listener in scope. Panics inside handlers are
    /// contained and reported once as an `Unknown` status to client-wide
    /// listeners. Stream listeners whose reader has gone away are removed.
    pub(crate) fn announce(&mut self, event: &Event) {
        let mut failures = Vec::new();
        for entry in &self.entries {
            if !self.in_scope(entry.scope, event) {
                continue;
            }
            if let Err(message) = entry.listener.invoke(event) {
                warn!(listener = entry.id.0, error = %message, "listener panicked");
                failures.push(message);
            }
        }
        if !failures.is_empty() {
            self.report_failures(&failures);
        }
        self.prune_closed();
    }

    fn report_failures(&self, failures: &[String]) {
        let mut status = Status::new(StatusCategory::Unknown, Operation::Subscribe);
        status.error = true;
        status.error_data = Some(format!("listener error: {}", failures.join("; ")));
        let report = Event::Status(status);

        let mut delivered = false;
        for entry in self.entries.iter().filter(|entry| entry.scope.is_none()) {
            delivered = true;
            if let Err(message) = entry.listener.invoke(&report) {
                warn!(listener = entry.id.0, error = %message, "listener panicked on error report");
            }
        }
        if !delivered {
            warn!(
                failures = failures.len(),
                "no client-wide listener to receive listener error report"
            );
        }
    }

    fn prune_closed(&mut self) {
        self.entries.retain(|entry| {
            let closed = entry.listener.is_closed();
            if closed {
                debug!(listener = entry.id.0, "event stream dropped, removing listener");
            }
            !closed
        });
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
