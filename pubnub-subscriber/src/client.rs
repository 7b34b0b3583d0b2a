//! Client handle and the background event loop behind it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};

use crate::config::{Configuration, ResolvedConfig};
use crate::dedupe::DedupeCache;
use crate::dispatcher::{Completion, Dispatcher, LoopMessage};
use crate::event_engine::presence::{HeartbeatEffect, HeartbeatEvent, HeartbeatMachine, HeartbeatState};
use crate::event_engine::subscribe::{SubscribeEffect, SubscribeEvent, SubscribeMachine, SubscribeState};
use crate::event_engine::{EffectFamily, EngineState, EventEngine};
use crate::listener::{Listener, ListenerId, ListenerManager};
use crate::protocol::{self, Envelope, presence_name};
use crate::retry::RetryPolicy;
use crate::subscription::{Subscription, SubscriptionOptions, SubscriptionSet};
use crate::transport::{ReqwestTransport, Transport};
use crate::types::{CryptoModule, Cursor, Error, Event, Membership, Result};

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Who asked for a set of names. Effective membership is the union over
/// every origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Origin {
    Client,
    Handle(u64),
}

#[derive(Debug)]
pub(crate) enum Command {
    Subscribe {
        origin: Origin,
        membership: Membership,
        cursor: Option<Cursor>,
    },
    Unsubscribe {
        origin: Origin,
        membership: Membership,
    },
    UnsubscribeAll,
    Reconnect {
        cursor: Option<Cursor>,
    },
    Disconnect,
    AddListener {
        id: ListenerId,
        scope: Option<u64>,
        listener: Listener,
    },
    RemoveListener {
        id: ListenerId,
    },
    RegisterNames {
        scope: u64,
        membership: Membership,
    },
    UnregisterNames {
        scope: u64,
        membership: Membership,
    },
    DropScope {
        scope: u64,
    },
    SetPresenceState {
        channels: Vec<String>,
        state: Value,
    },
    Snapshot {
        reply: oneshot::Sender<ClientSnapshot>,
    },
    Shutdown,
}

/// Cheap clonable sender shared by the client and its handles.
#[derive(Debug, Clone)]
pub(crate) struct CommandSender {
    queue: mpsc::UnboundedSender<LoopMessage>,
    ids: Arc<AtomicU64>,
}

impl CommandSender {
    pub(crate) fn send(&self, command: Command) -> Result<()> {
        self.queue
            .send(LoopMessage::Command(command))
            .map_err(|_| Error::ClientStopped)
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<LoopMessage>) {
        let (queue, rx) = mpsc::unbounded_channel();
        (
            Self {
                queue,
                ids: Arc::default(),
            },
            rx,
        )
    }
}

/// Point-in-time view of the loop, mostly useful for diagnostics and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSnapshot {
    pub channels: Vec<String>,
    pub groups: Vec<String>,
    pub cursor: Option<Cursor>,
    pub subscribe_state: &'static str,
    pub heartbeat_state: Option<&'static str>,
}

/// Reject empty or malformed names before anything reaches the loop.
pub(crate) fn build_membership(
    channels: &[String],
    groups: &[String],
    with_presence: bool,
) -> Result<Membership> {
    if channels.is_empty() && groups.is_empty() {
        return Err(Error::Validation(
            "at least one channel or channel group is required".into(),
        ));
    }
    for name in channels.iter().chain(groups) {
        if name.trim().is_empty() || name.contains(',') {
            return Err(Error::Validation(format!("invalid channel name {name:?}")));
        }
    }
    let mut membership = Membership::new(channels.iter().cloned(), groups.iter().cloned());
    if with_presence {
        let presence = Membership::new(
            channels.iter().map(|c| presence_name(c)),
            groups.iter().map(|g| presence_name(g)),
        );
        membership.extend(&presence);
    }
    Ok(membership)
}

// ---------------------------------------------------------------------------
// Public client
// ---------------------------------------------------------------------------

/// Parameters for [`Client::subscribe`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscribeRequest {
    pub channels: Vec<String>,
    pub groups: Vec<String>,
    pub with_presence: bool,
    pub cursor: Option<Cursor>,
}

impl SubscribeRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channels<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn groups<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups.extend(names.into_iter().map(Into::into));
        self
    }

    /// Also subscribe to the `-pnpres` companion of every name.
    pub fn with_presence(mut self) -> Self {
        self.with_presence = true;
        self
    }

    /// Resume from a known position instead of the current one.
    pub fn cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }
}

pub struct ClientBuilder {
    config: Configuration,
    transport: Option<Arc<dyn Transport>>,
    crypto: Option<Arc<dyn CryptoModule>>,
}

impl ClientBuilder {
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn crypto(mut self, crypto: impl CryptoModule + 'static) -> Self {
        self.crypto = Some(Arc::new(crypto));
        self
    }

    /// Validate the configuration and start the event loop on the current
    /// tokio runtime.
    pub fn build(self) -> Result<Client> {
        let config = Arc::new(self.config.resolve()?);
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Validation("a tokio runtime is required".into()))?;
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(&config)?),
        };

        let (queue, rx) = mpsc::unbounded_channel();
        let event_loop = EventLoop::new(Arc::clone(&config), transport, self.crypto, queue.downgrade());
        runtime.spawn(event_loop.run(rx));

        info!(
            origin = %config.origin,
            user_id = %config.user_id,
            heartbeat = config.heartbeat_interval.is_some(),
            "client started"
        );
        Ok(Client {
            sender: CommandSender {
                queue,
                ids: Arc::default(),
            },
            config,
        })
    }
}

/// Entry point: owns the event loop and hands out subscription handles.
///
/// Dropping the client (or calling [`destroy`](Client::destroy)) unsubscribes
/// from everything and stops the loop.
pub struct Client {
    sender: CommandSender,
    config: Arc<ResolvedConfig>,
}

impl Client {
    /// Start a client with the default `reqwest` transport.
    pub fn new(config: Configuration) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: Configuration) -> ClientBuilder {
        ClientBuilder {
            config,
            transport: None,
            crypto: None,
        }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Add names to the client-wide subscription. Subscribing again after
    /// the loop stopped on an error restarts it with a fresh handshake, even
    /// when the names are unchanged.
    pub fn subscribe(&self, request: SubscribeRequest) -> Result<()> {
        let membership =
            build_membership(&request.channels, &request.groups, request.with_presence)?;
        self.sender.send(Command::Subscribe {
            origin: Origin::Client,
            membership,
            cursor: request.cursor,
        })
    }

    /// Remove names (and their presence companions) added via
    /// [`subscribe`](Client::subscribe).
    pub fn unsubscribe(&self, channels: &[&str], groups: &[&str]) -> Result<()> {
        let channels: Vec<String> = channels.iter().map(|c| c.to_string()).collect();
        let groups: Vec<String> = groups.iter().map(|g| g.to_string()).collect();
        let membership = build_membership(&channels, &groups, true)?;
        self.sender.send(Command::Unsubscribe {
            origin: Origin::Client,
            membership,
        })
    }

    pub fn unsubscribe_all(&self) -> Result<()> {
        self.sender.send(Command::UnsubscribeAll)
    }

    /// Resume after `disconnect` or a stopped state, optionally from `cursor`.
    pub fn reconnect(&self, cursor: Option<Cursor>) -> Result<()> {
        self.sender.send(Command::Reconnect { cursor })
    }

    /// Pause the subscribe and heartbeat loops, keeping the current names.
    pub fn disconnect(&self) -> Result<()> {
        self.sender.send(Command::Disconnect)
    }

    pub fn add_listener(&self, listener: Listener) -> Result<ListenerId> {
        let id = ListenerId(self.sender.next_id());
        self.sender.send(Command::AddListener {
            id,
            scope: None,
            listener,
        })?;
        Ok(id)
    }

    pub fn remove_listener(&self, id: ListenerId) -> Result<()> {
        self.sender.send(Command::RemoveListener { id })
    }

    /// Presence state sent with heartbeats for `channels`; `Value::Null`
    /// clears it.
    pub fn set_presence_state(&self, channels: &[&str], state: Value) -> Result<()> {
        if channels.is_empty() {
            return Err(Error::Validation("at least one channel is required".into()));
        }
        if !(state.is_object() || state.is_null()) {
            return Err(Error::Validation("presence state must be a JSON object".into()));
        }
        self.sender.send(Command::SetPresenceState {
            channels: channels.iter().map(|c| c.to_string()).collect(),
            state,
        })
    }

    pub fn subscription(
        &self,
        channels: &[&str],
        groups: &[&str],
        options: SubscriptionOptions,
    ) -> Result<Subscription> {
        let channels: Vec<String> = channels.iter().map(|c| c.to_string()).collect();
        let groups: Vec<String> = groups.iter().map(|g| g.to_string()).collect();
        let membership = build_membership(&channels, &groups, options.receive_presence_events)?;
        Subscription::new(self.sender.clone(), membership)
    }

    /// A set holding one subscription per name.
    pub fn subscription_set(
        &self,
        channels: &[&str],
        groups: &[&str],
        options: SubscriptionOptions,
    ) -> Result<SubscriptionSet> {
        let mut set = SubscriptionSet::new(self.sender.clone());
        for channel in channels {
            set.add_subscription(&self.subscription(&[*channel], &[], options)?)?;
        }
        for group in groups {
            set.add_subscription(&self.subscription(&[], &[*group], options)?)?;
        }
        Ok(set)
    }

    pub async fn snapshot(&self) -> Result<ClientSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.sender.send(Command::Snapshot { reply })?;
        rx.await.map_err(|_| Error::ClientStopped)
    }

    /// Unsubscribe from everything and stop the event loop.
    pub fn destroy(self) {
        drop(self);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Shutdown);
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

enum LoopAction {
    Continue,
    Stop,
}

pub(crate) struct EventLoop {
    config: Arc<ResolvedConfig>,
    subscribe: EventEngine<SubscribeMachine>,
    heartbeat: Option<EventEngine<HeartbeatMachine>>,
    dispatcher: Dispatcher,
    listeners: ListenerManager,
    dedupe: DedupeCache,
    crypto: Option<Arc<dyn CryptoModule>>,
    origins: HashMap<Origin, Membership>,
    membership: Membership,
    presence_state: BTreeMap<String, Value>,
}

impl EventLoop {
    pub(crate) fn new(
        config: Arc<ResolvedConfig>,
        transport: Arc<dyn Transport>,
        crypto: Option<Arc<dyn CryptoModule>>,
        queue: mpsc::WeakUnboundedSender<LoopMessage>,
    ) -> Self {
        let retry = RetryPolicy::new(config.retry.clone());
        let subscribe = EventEngine::new(
            "subscribe",
            SubscribeMachine {
                retry: retry.clone(),
                recovery: config.receive_recovery.clone(),
                suppress_leave_events: config.suppress_leave_events,
                message_count_threshold: config.request_message_count_threshold,
            },
            SubscribeState::Unsubscribed,
        );
        let heartbeat = config.heartbeat_interval.map(|interval| {
            EventEngine::new(
                "heartbeat",
                HeartbeatMachine {
                    interval,
                    retry,
                    announce_success: config.announce_successful_heartbeats,
                    announce_failure: config.announce_failed_heartbeats,
                },
                HeartbeatState::HeartbeatInactive,
            )
        });

        Self {
            dispatcher: Dispatcher::new(transport, Arc::clone(&config), queue),
            dedupe: DedupeCache::new(config.enable_dedupe, config.dedupe_cache_size),
            config,
            subscribe,
            heartbeat,
            listeners: ListenerManager::default(),
            crypto,
            origins: HashMap::new(),
            membership: Membership::default(),
            presence_state: BTreeMap::new(),
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<LoopMessage>) {
        while let Some(message) = rx.recv().await {
            if let LoopAction::Stop = self.handle(message) {
                break;
            }
        }
        self.dispatcher.cancel_all();
        self.listeners.clear();
        info!("event loop stopped");
    }

    fn handle(&mut self, message: LoopMessage) -> LoopAction {
        match message {
            LoopMessage::Command(command) => self.handle_command(command),
            LoopMessage::Completion {
                family,
                generation,
                completion,
            } => {
                if self.dispatcher.accept(family, generation) {
                    match completion {
                        Completion::Subscribe(event) => self.process_subscribe(event),
                        Completion::Heartbeat(event) => self.process_heartbeat(event),
                    }
                }
                LoopAction::Continue
            }
        }
    }

    fn handle_command(&mut self, command: Command) -> LoopAction {
        trace!(?command, "command");
        match command {
            Command::Subscribe {
                origin,
                membership,
                cursor,
            } => {
                self.origins.entry(origin).or_default().extend(&membership);
                self.apply_membership(cursor);
            }
            Command::Unsubscribe { origin, membership } => {
                if let Some(names) = self.origins.get_mut(&origin) {
                    *names = names.difference(&membership);
                    if names.is_empty() {
                        self.origins.remove(&origin);
                    }
                }
                self.apply_membership(None);
            }
            Command::UnsubscribeAll => {
                self.origins.clear();
                self.apply_membership(None);
            }
            Command::Reconnect { cursor } => self.reconnect(cursor),
            Command::Disconnect => {
                self.process_subscribe(SubscribeEvent::Disconnect);
                self.process_heartbeat(HeartbeatEvent::Disconnect);
            }
            Command::AddListener {
                id,
                scope,
                listener,
            } => self.listeners.add(id, scope, listener),
            Command::RemoveListener { id } => {
                if !self.listeners.remove(id) {
                    debug!(listener = id.0, "listener was not registered");
                }
            }
            Command::RegisterNames { scope, membership } => {
                self.listeners.register_names(scope, &membership)
            }
            Command::UnregisterNames { scope, membership } => {
                self.listeners.unregister_names(scope, &membership)
            }
            Command::DropScope { scope } => self.listeners.drop_scope(scope),
            Command::SetPresenceState { channels, state } => {
                for channel in channels {
                    if state.is_null() {
                        self.presence_state.remove(&channel);
                    } else {
                        self.presence_state.insert(channel, state.clone());
                    }
                }
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => {
                self.origins.clear();
                self.apply_membership(None);
                return LoopAction::Stop;
            }
        }
        LoopAction::Continue
    }

    fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            channels: self.membership.channels.iter().cloned().collect(),
            groups: self.membership.groups.iter().cloned().collect(),
            cursor: self.subscribe.state().cursor(),
            subscribe_state: self.subscribe.state().name(),
            heartbeat_state: self.heartbeat.as_ref().map(|engine| engine.state().name()),
        }
    }

    /// Recompute the effective membership and forward the difference to
    /// both engines. An unchanged, non-empty membership still restarts the
    /// loop when it is unsubscribed or stopped.
    fn apply_membership(&mut self, cursor: Option<Cursor>) {
        let next = self
            .origins
            .values()
            .fold(Membership::default(), |acc, names| acc.union(names));
        let previous = std::mem::replace(&mut self.membership, next.clone());
        let idle = matches!(
            self.subscribe.state(),
            SubscribeState::Unsubscribed
                | SubscribeState::HandshakeStopped { .. }
                | SubscribeState::ReceiveStopped { .. }
        );

        if next == previous && cursor.is_none() && !(idle && !next.is_empty()) {
            return;
        }

        self.forward_presence_changes(&previous, &next);
        if idle && !next.is_empty() {
            self.resume_heartbeat();
        }

        let event = match cursor {
            Some(cursor) if !next.is_empty() => SubscribeEvent::Restore {
                membership: next,
                cursor,
            },
            _ => SubscribeEvent::SubscriptionChange { membership: next },
        };
        self.process_subscribe(event);
    }

    fn forward_presence_changes(&mut self, previous: &Membership, next: &Membership) {
        if self.heartbeat.is_none() {
            return;
        }
        let before = previous.without_presence();
        let after = next.without_presence();
        if after.is_empty() {
            if !before.is_empty() {
                self.process_heartbeat(HeartbeatEvent::LeftAll);
            }
            return;
        }
        let left = before.difference(&after);
        let joined = after.difference(&before);
        if !left.is_empty() {
            self.process_heartbeat(HeartbeatEvent::Left { membership: left });
        }
        if !joined.is_empty() {
            self.process_heartbeat(HeartbeatEvent::Joined { membership: joined });
        }
    }

    fn resume_heartbeat(&mut self) {
        let stopped = matches!(
            self.heartbeat.as_ref().map(|engine| engine.state()),
            Some(HeartbeatState::HeartbeatStopped { .. })
        );
        if stopped {
            self.process_heartbeat(HeartbeatEvent::Reconnect);
        }
    }

    fn reconnect(&mut self, cursor: Option<Cursor>) {
        if matches!(self.subscribe.state(), SubscribeState::Unsubscribed) {
            if self.membership.is_empty() {
                debug!("reconnect ignored: nothing to subscribe to");
                return;
            }
            let membership = self.membership.clone();
            self.process_subscribe(match cursor {
                Some(cursor) => SubscribeEvent::Restore { membership, cursor },
                None => SubscribeEvent::SubscriptionChange { membership },
            });
        } else {
            self.process_subscribe(SubscribeEvent::Reconnect { cursor });
        }
        self.process_heartbeat(HeartbeatEvent::Reconnect);
    }

    // -----------------------------------------------------------------------
    // Effects
    // -----------------------------------------------------------------------

    fn process_subscribe(&mut self, event: SubscribeEvent) {
        for effect in self.subscribe.process(event) {
            match effect {
                SubscribeEffect::Handshake { membership, cursor } => {
                    let state = self.presence_state_for(&membership);
                    self.dispatcher.handshake(membership, cursor, state);
                }
                SubscribeEffect::Receive { membership, cursor } => {
                    self.dispatcher.receive(membership, cursor)
                }
                SubscribeEffect::Wait { delay } => self.dispatcher.wait(
                    EffectFamily::SubscribeTimer,
                    delay,
                    Completion::Subscribe(SubscribeEvent::RetryTimerFired),
                ),
                SubscribeEffect::EmitMessages { envelopes } => self.announce_envelopes(envelopes),
                SubscribeEffect::EmitStatus(status) => {
                    self.listeners.announce(&Event::Status(status))
                }
                SubscribeEffect::Leave { membership } => self.dispatcher.leave(membership),
                SubscribeEffect::Cancel(family) => self.dispatcher.cancel(family),
            }
        }
    }

    fn process_heartbeat(&mut self, event: HeartbeatEvent) {
        let effects = match self.heartbeat.as_mut() {
            Some(engine) => engine.process(event),
            None => return,
        };
        for effect in effects {
            match effect {
                HeartbeatEffect::Heartbeat { membership } => {
                    let state = self.presence_state_for(&membership);
                    self.dispatcher.heartbeat(membership, state);
                }
                HeartbeatEffect::Wait { delay } => self.dispatcher.wait(
                    EffectFamily::HeartbeatTimer,
                    delay,
                    Completion::Heartbeat(HeartbeatEvent::TimerFired),
                ),
                HeartbeatEffect::EmitStatus(status) => {
                    self.listeners.announce(&Event::Status(status))
                }
                HeartbeatEffect::Cancel(family) => self.dispatcher.cancel(family),
            }
        }
    }

    fn announce_envelopes(&mut self, envelopes: Vec<Envelope>) {
        for envelope in envelopes {
            let Some((key, event)) = protocol::decode_envelope(envelope, self.crypto.as_deref())
            else {
                continue;
            };
            if !self.dedupe.should_announce(key) {
                trace!("duplicate event suppressed");
                continue;
            }
            self.listeners.announce(&event);
        }
    }

    fn presence_state_for(&self, membership: &Membership) -> Option<Value> {
        if !self.config.maintain_presence_state {
            return None;
        }
        let state: serde_json::Map<String, Value> = membership
            .channels
            .iter()
            .filter_map(|channel| {
                self.presence_state
                    .get(channel)
                    .map(|state| (channel.clone(), state.clone()))
            })
            .collect();
        (!state.is_empty()).then_some(Value::Object(state))
    }
}
