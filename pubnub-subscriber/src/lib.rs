//! Subscribe-side pub/sub client over HTTP long-poll.
//!
//! A single background task owns two state machines: the subscribe loop
//! (handshake, then repeated long-poll receives that advance a cursor) and
//! the optional presence heartbeat loop. Network calls run as spawned tasks
//! whose results are fed back through one ordered queue, so every state
//! change happens in arrival order.
//!
//! # Features
//! - Automatic retry with linear or exponential backoff
//! - Cursor restore and catch-up after disconnects
//! - Presence heartbeats, join/leave announcements and presence state
//! - Optional message dedupe and payload decryption
//! - Subscription handles and sets with scoped listeners
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), pubnub_subscriber::Error> {
//! use pubnub_subscriber::{Client, Configuration, Event, Listener, SubscribeRequest};
//!
//! let client = Client::new(Configuration::new("demo", "user-1"))?;
//! let (listener, mut events) = Listener::channel(128);
//! client.add_listener(listener)?;
//! client.subscribe(SubscribeRequest::new().channels(["my-channel"]))?;
//!
//! while let Some(event) = events.next().await {
//!     match event {
//!         Event::Message(msg) => println!("got: {}", msg.payload),
//!         Event::Status(status) => println!("status: {:?}", status.category),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod dedupe;
mod dispatcher;
mod event_engine;
mod listener;
mod protocol;
mod retry;
mod subscription;
mod transport;
mod types;

pub use client::{Client, ClientBuilder, ClientSnapshot, SubscribeRequest};
pub use config::{Configuration, ResolvedConfig};
pub use listener::{EventStream, Listener, ListenerId};
pub use protocol::{PRESENCE_SUFFIX, is_presence_name, presence_name};
pub use retry::{
    ErrorClass, ReceiveRecovery, RecoveryAction, RetryConfiguration, RetryDecision, RetryPolicy,
    RetryPolicyKind,
};
pub use subscription::{Subscription, SubscriptionOptions, SubscriptionSet};
pub use transport::{ReqwestTransport, Transport, TransportRequest, TransportResponse};
pub use types::{
    BoxError, CryptoModule, Cursor, Error, Event, Membership, Message, Operation, Presence,
    PresenceAction, Result, Status, StatusCategory,
};
