//! User-facing subscription handles.
//!
//! A [`Subscription`] names a fixed set of channels and groups. A
//! [`SubscriptionSet`] aggregates subscriptions; a name stays registered for
//! the set while at least one member references it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::client::{Command, CommandSender, Origin};
use crate::listener::{Listener, ListenerId};
use crate::types::{Cursor, Membership, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Also subscribe to the `-pnpres` companion of every name.
    pub receive_presence_events: bool,
}

impl SubscriptionOptions {
    pub fn with_presence() -> Self {
        Self {
            receive_presence_events: true,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn add_listener(sender: &CommandSender, scope: u64, listener: Listener) -> Result<ListenerId> {
    let id = ListenerId(sender.next_id());
    sender.send(Command::AddListener {
        id,
        scope: Some(scope),
        listener,
    })?;
    Ok(id)
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

struct SubscriptionInner {
    id: u64,
    membership: Membership,
    subscribed: AtomicBool,
    /// Ids of the sets this subscription belongs to.
    sets: Mutex<BTreeSet<u64>>,
    sender: CommandSender,
}

impl Drop for SubscriptionInner {
    fn drop(&mut self) {
        if self.subscribed.swap(false, Ordering::AcqRel) {
            let _ = self.sender.send(Command::Unsubscribe {
                origin: Origin::Handle(self.id),
                membership: self.membership.clone(),
            });
        }
        let _ = self.sender.send(Command::DropScope { scope: self.id });
    }
}

/// Handle for a fixed group of channels and channel groups.
///
/// Clones share state. Listeners added here only see events for this
/// handle's names. Dropping the last clone unsubscribes.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("membership", &self.inner.membership)
            .field("subscribed", &self.is_subscribed())
            .finish()
    }
}

impl Subscription {
    pub(crate) fn new(sender: CommandSender, membership: Membership) -> Result<Self> {
        let id = sender.next_id();
        sender.send(Command::RegisterNames {
            scope: id,
            membership: membership.clone(),
        })?;
        Ok(Self {
            inner: Arc::new(SubscriptionInner {
                id,
                membership,
                subscribed: AtomicBool::new(false),
                sets: Mutex::default(),
                sender,
            }),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn membership(&self) -> &Membership {
        &self.inner.membership
    }

    pub fn subscribe(&self) -> Result<()> {
        self.start(None)
    }

    /// Subscribe, resuming the stream from `cursor`.
    pub fn subscribe_from(&self, cursor: Cursor) -> Result<()> {
        self.start(Some(cursor))
    }

    fn start(&self, cursor: Option<Cursor>) -> Result<()> {
        self.inner.sender.send(Command::Subscribe {
            origin: Origin::Handle(self.inner.id),
            membership: self.inner.membership.clone(),
            cursor,
        })?;
        self.inner.subscribed.store(true, Ordering::Release);
        Ok(())
    }

    pub fn unsubscribe(&self) -> Result<()> {
        if !self.inner.subscribed.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.sender.send(Command::Unsubscribe {
            origin: Origin::Handle(self.inner.id),
            membership: self.inner.membership.clone(),
        })
    }

    pub fn is_subscribed(&self) -> bool {
        self.inner.subscribed.load(Ordering::Acquire)
    }

    pub fn channels(&self) -> Vec<String> {
        self.inner.membership.channels.iter().cloned().collect()
    }

    pub fn groups(&self) -> Vec<String> {
        self.inner.membership.groups.iter().cloned().collect()
    }

    pub fn add_listener(&self, listener: Listener) -> Result<ListenerId> {
        add_listener(&self.inner.sender, self.inner.id, listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> Result<()> {
        self.inner.sender.send(Command::RemoveListener { id })
    }

    fn join(&self, set: u64) -> bool {
        lock(&self.inner.sets).insert(set)
    }

    fn leave(&self, set: u64) -> bool {
        lock(&self.inner.sets).remove(&set)
    }
}

// ---------------------------------------------------------------------------
// Subscription set
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RefCounts(BTreeMap<String, usize>);

impl RefCounts {
    /// Returns the names that were not referenced before.
    fn acquire<'a>(&mut self, names: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        let mut introduced = Vec::new();
        for name in names {
            let count = self.0.entry(name.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                introduced.push(name.clone());
            }
        }
        introduced
    }

    /// Returns the names that are no longer referenced.
    fn release<'a>(&mut self, names: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        let mut released = Vec::new();
        for name in names {
            if let Some(count) = self.0.get_mut(name) {
                *count -= 1;
                if *count == 0 {
                    self.0.remove(name);
                    released.push(name.clone());
                }
            }
        }
        released
    }

    fn names(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }
}

struct Member {
    subscription: Subscription,
    /// Subscribed as a side effect of joining a subscribed set.
    automatic: bool,
}

/// A group of [`Subscription`]s subscribed and listened to as one.
pub struct SubscriptionSet {
    id: u64,
    sender: CommandSender,
    members: BTreeMap<u64, Member>,
    channels: RefCounts,
    groups: RefCounts,
    subscribed: bool,
}

impl std::fmt::Debug for SubscriptionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionSet")
            .field("id", &self.id)
            .field("members", &self.members.keys().collect::<Vec<_>>())
            .field("subscribed", &self.subscribed)
            .finish()
    }
}

impl SubscriptionSet {
    pub(crate) fn new(sender: CommandSender) -> Self {
        Self {
            id: sender.next_id(),
            sender,
            members: BTreeMap::new(),
            channels: RefCounts::default(),
            groups: RefCounts::default(),
            subscribed: false,
        }
    }

    fn origin(&self) -> Origin {
        Origin::Handle(self.id)
    }

    /// Union of every member's names.
    pub fn membership(&self) -> Membership {
        Membership::new(self.channels.names().cloned(), self.groups.names().cloned())
    }

    pub fn channels(&self) -> Vec<String> {
        self.channels.names().cloned().collect()
    }

    pub fn groups(&self) -> Vec<String> {
        self.groups.names().cloned().collect()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.members
            .values()
            .map(|member| member.subscription.clone())
            .collect()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    pub fn add_subscription(&mut self, subscription: &Subscription) -> Result<()> {
        if !subscription.join(self.id) {
            return Ok(());
        }
        let names = subscription.membership();
        let introduced = Membership::new(
            self.channels.acquire(&names.channels),
            self.groups.acquire(&names.groups),
        );
        self.members.insert(
            subscription.id(),
            Member {
                subscription: subscription.clone(),
                automatic: false,
            },
        );

        if !introduced.is_empty() {
            self.sender.send(Command::RegisterNames {
                scope: self.id,
                membership: introduced.clone(),
            })?;
        }
        if !self.subscribed {
            return Ok(());
        }
        if !introduced.is_empty() {
            self.sender.send(Command::Subscribe {
                origin: self.origin(),
                membership: introduced,
                cursor: None,
            })?;
        }
        if !subscription.is_subscribed() {
            subscription.subscribe()?;
            if let Some(member) = self.members.get_mut(&subscription.id()) {
                member.automatic = true;
            }
        }
        Ok(())
    }

    pub fn remove_subscription(&mut self, subscription: &Subscription) -> Result<()> {
        let Some(member) = self.members.remove(&subscription.id()) else {
            return Ok(());
        };
        member.subscription.leave(self.id);
        let names = member.subscription.membership();
        let released = Membership::new(
            self.channels.release(&names.channels),
            self.groups.release(&names.groups),
        );

        if !released.is_empty() {
            self.sender.send(Command::UnregisterNames {
                scope: self.id,
                membership: released.clone(),
            })?;
            if self.subscribed {
                self.sender.send(Command::Unsubscribe {
                    origin: self.origin(),
                    membership: released,
                })?;
            }
        }
        if member.automatic {
            member.subscription.unsubscribe()?;
        }
        Ok(())
    }

    pub fn add_subscription_set(&mut self, other: &SubscriptionSet) -> Result<()> {
        for subscription in other.subscriptions() {
            self.add_subscription(&subscription)?;
        }
        Ok(())
    }

    pub fn remove_subscription_set(&mut self, other: &SubscriptionSet) -> Result<()> {
        for subscription in other.subscriptions() {
            self.remove_subscription(&subscription)?;
        }
        Ok(())
    }

    pub fn subscribe(&mut self) -> Result<()> {
        self.start(None)
    }

    pub fn subscribe_from(&mut self, cursor: Cursor) -> Result<()> {
        self.start(Some(cursor))
    }

    fn start(&mut self, cursor: Option<Cursor>) -> Result<()> {
        let membership = self.membership();
        if membership.is_empty() {
            debug!(set = self.id, "subscribing an empty set");
        } else {
            self.sender.send(Command::Subscribe {
                origin: self.origin(),
                membership,
                cursor,
            })?;
        }
        self.subscribed = true;
        Ok(())
    }

    pub fn unsubscribe(&mut self) -> Result<()> {
        if !self.subscribed {
            return Ok(());
        }
        self.subscribed = false;
        self.sender.send(Command::Unsubscribe {
            origin: self.origin(),
            membership: self.membership(),
        })?;
        for member in self.members.values_mut() {
            if std::mem::take(&mut member.automatic) {
                member.subscription.unsubscribe()?;
            }
        }
        Ok(())
    }

    /// Listener that sees events for every name in the set.
    pub fn add_listener(&self, listener: Listener) -> Result<ListenerId> {
        add_listener(&self.sender, self.id, listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> Result<()> {
        self.sender.send(Command::RemoveListener { id })
    }
}

impl Drop for SubscriptionSet {
    fn drop(&mut self) {
        let _ = self.unsubscribe();
        for member in self.members.values() {
            member.subscription.leave(self.id);
        }
        let _ = self.sender.send(Command::DropScope { scope: self.id });
    }
}
