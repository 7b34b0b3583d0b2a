//! Public types for the pubnub-subscriber crate.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::is_presence_name;

/// A boxed error type for user-supplied collaborators (crypto module).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T> = std::result::Result<T, Error>;

/// Server-assigned position in the subscribe stream.
///
/// The timetoken is a 17-digit value; it is carried as a decimal string on
/// the wire so it never passes through a lossy numeric type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    pub timetoken: u64,
    pub region: u32,
}

impl Cursor {
    pub fn new(timetoken: u64, region: u32) -> Self {
        Self { timetoken, region }
    }

    /// A cursor is usable for resuming only once the server assigned it a
    /// non-zero timetoken.
    pub fn is_valid(&self) -> bool {
        self.timetoken > 0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.timetoken, self.region)
    }
}

/// Set of channel and channel-group names.
///
/// Ordered sets keep the subscribe URL stable across cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    pub channels: BTreeSet<String>,
    pub groups: BTreeSet<String>,
}

impl Membership {
    pub fn new<C, G>(channels: C, groups: G) -> Self
    where
        C: IntoIterator,
        C::Item: Into<String>,
        G: IntoIterator,
        G::Item: Into<String>,
    {
        Self {
            channels: channels.into_iter().map(Into::into).collect(),
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.groups.is_empty()
    }

    pub fn extend(&mut self, other: &Membership) {
        self.channels.extend(other.channels.iter().cloned());
        self.groups.extend(other.groups.iter().cloned());
    }

    pub fn union(&self, other: &Membership) -> Membership {
        let mut merged = self.clone();
        merged.extend(other);
        merged
    }

    pub fn difference(&self, other: &Membership) -> Membership {
        Membership {
            channels: self.channels.difference(&other.channels).cloned().collect(),
            groups: self.groups.difference(&other.groups).cloned().collect(),
        }
    }

    /// Names that take part in heartbeats and leave calls (presence
    /// companions dropped).
    pub fn without_presence(&self) -> Membership {
        Membership {
            channels: self
                .channels
                .iter()
                .filter(|c| !is_presence_name(c))
                .cloned()
                .collect(),
            groups: self
                .groups
                .iter()
                .filter(|g| !is_presence_name(g))
                .cloned()
                .collect(),
        }
    }

    pub fn contains_channel(&self, name: &str) -> bool {
        self.channels.contains(name)
    }

    pub fn contains_group(&self, name: &str) -> bool {
        self.groups.contains(name)
    }
}

/// A message or signal received on a subscribed channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Channel the message was published to.
    pub channel: String,
    /// Subscription name that matched (channel, wildcard or group).
    pub subscription: String,
    /// Publish timetoken.
    pub timetoken: u64,
    /// Publisher's user id.
    pub publisher: Option<String>,
    /// Decoded (and decrypted, when a crypto module is set) payload.
    pub payload: serde_json::Value,
    pub user_metadata: Option<serde_json::Value>,
    /// Set when decryption failed; `payload` then holds the raw value.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresenceAction {
    Join,
    Leave,
    Timeout,
    StateChange,
    Interval,
}

/// A presence event delivered on a `-pnpres` companion channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Presence {
    /// Channel the presence change happened on (suffix stripped).
    pub channel: String,
    /// Subscription name that matched (e.g. `ch1-pnpres`).
    pub subscription: String,
    pub action: PresenceAction,
    pub uuid: Option<String>,
    pub occupancy: u32,
    pub timestamp: Option<u64>,
    pub timetoken: u64,
    pub state: Option<serde_json::Value>,
    /// `interval` deltas.
    pub join: Vec<String>,
    pub leave: Vec<String>,
    pub timeout: Vec<String>,
    pub here_now_refresh: bool,
}

/// Operation a status refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Subscribe,
    Heartbeat,
    Leave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCategory {
    Connected,
    Reconnected,
    SubscriptionChanged,
    Disconnected,
    DisconnectedUnexpectedly,
    ConnectionError,
    Acknowledgment,
    BadRequest,
    AccessDenied,
    Timeout,
    NetworkIssues,
    MalformedResponse,
    RequestMessageCountExceeded,
    Unknown,
}

/// Connection / operation status delivered to `status` handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub category: StatusCategory,
    pub operation: Operation,
    pub error: bool,
    pub status_code: Option<u16>,
    pub error_data: Option<String>,
    pub affected_channels: Vec<String>,
    pub affected_groups: Vec<String>,
    pub current_timetoken: Option<u64>,
}

impl Status {
    pub(crate) fn new(category: StatusCategory, operation: Operation) -> Self {
        Self {
            category,
            operation,
            error: false,
            status_code: None,
            error_data: None,
            affected_channels: Vec::new(),
            affected_groups: Vec::new(),
            current_timetoken: None,
        }
    }

    /// Failure status; the category is supplied by the caller since the same
    /// error maps to different categories per operation.
    pub(crate) fn failure(category: StatusCategory, operation: Operation, error: &Error) -> Self {
        Self {
            error: true,
            status_code: error.status_code(),
            error_data: Some(error.to_string()),
            ..Self::new(category, operation)
        }
    }

    pub(crate) fn with_membership(mut self, membership: &Membership) -> Self {
        self.affected_channels = membership.channels.iter().cloned().collect();
        self.affected_groups = membership.groups.iter().cloned().collect();
        self
    }

    pub(crate) fn with_cursor(mut self, cursor: Cursor) -> Self {
        self.current_timetoken = Some(cursor.timetoken);
        self
    }
}

/// Events delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Message(Message),
    Signal(Message),
    Presence(Presence),
    Status(Status),
}

/// Payload decryption collaborator, invoked per message before dedupe and
/// announcement.
pub trait CryptoModule: Send + Sync {
    fn decrypt(&self, data: &[u8]) -> std::result::Result<Vec<u8>, BoxError>;
}

/// Errors returned by this crate.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("service error: status={status}, {message}")]
    Service { status: u16, message: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("listener error: {0}")]
    Listener(String),

    #[error("client stopped")]
    ClientStopped,
}

impl Error {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Service { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Status category reported for a failed operation.
    pub fn category(&self) -> StatusCategory {
        match self {
            Error::Network(_) => StatusCategory::NetworkIssues,
            Error::Timeout => StatusCategory::Timeout,
            Error::Decode(_) => StatusCategory::MalformedResponse,
            Error::Service { status: 400, .. } => StatusCategory::BadRequest,
            Error::Service { status: 403, .. } => StatusCategory::AccessDenied,
            _ => StatusCategory::Unknown,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Validation(format!("invalid origin: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_union_and_difference() {
        let a = Membership::new(["ch1", "ch2"], ["cg1"]);
        let b = Membership::new(["ch2", "ch3"], Vec::<String>::new());

        let union = a.union(&b);
        assert_eq!(union.channels.len(), 3);
        assert!(union.contains_group("cg1"));

        let diff = a.difference(&b);
        assert_eq!(diff, Membership::new(["ch1"], ["cg1"]));
    }

    #[test]
    fn membership_without_presence_drops_companions() {
        let m = Membership::new(["ch1", "ch1-pnpres"], ["cg1-pnpres"]);
        let hb = m.without_presence();
        assert_eq!(hb, Membership::new(["ch1"], Vec::<String>::new()));
    }

    #[test]
    fn cursor_validity() {
        assert!(!Cursor::default().is_valid());
        assert!(Cursor::new(14607577960925503, 1).is_valid());
        assert_eq!(Cursor::new(3, 1).to_string(), "3@1");
    }

    #[test]
    fn error_categories() {
        let bad = Error::Service {
            status: 400,
            message: "Bad Request".into(),
        };
        assert_eq!(bad.category(), StatusCategory::BadRequest);
        assert_eq!(bad.status_code(), Some(400));

        let denied = Error::Service {
            status: 403,
            message: "Forbidden".into(),
        };
        assert_eq!(denied.category(), StatusCategory::AccessDenied);
        assert_eq!(Error::Timeout.category(), StatusCategory::Timeout);
        assert_eq!(
            Error::Network("reset".into()).category(),
            StatusCategory::NetworkIssues
        );
        assert_eq!(Error::Network("reset".into()).status_code(), None);
    }

    #[test]
    fn serde_json_error_maps_to_decode() {
        let err = serde_json::from_str::<serde_json::Value>("{").map(|_| ());
        let mapped: Error = err.map_err(Error::from).unwrap_err();
        assert!(matches!(mapped, Error::Decode(_)));
    }
}
