//! PubNub REST wire format: request construction and response decoding.

use base64::Engine as _;
use serde::Deserialize;
use serde_json::Value;

use crate::config::ResolvedConfig;
use crate::dedupe::DedupeKey;
use crate::transport::{TransportRequest, TransportResponse};
use crate::types::{
    CryptoModule, Cursor, Error, Event, Membership, Message, Operation, Presence, PresenceAction,
    Result,
};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const PRESENCE_SUFFIX: &str = "-pnpres";

pub mod message_type {
    pub const MESSAGE: i64 = 0;
    pub const SIGNAL: i64 = 1;
    pub const OBJECTS: i64 = 2;
    pub const MESSAGE_ACTION: i64 = 3;
    pub const FILES: i64 = 4;
}

pub fn is_presence_name(name: &str) -> bool {
    name.ends_with(PRESENCE_SUFFIX)
}

pub fn presence_name(name: &str) -> String {
    format!("{name}{PRESENCE_SUFFIX}")
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Timetokens arrive as strings from the service, but some proxies and
/// fixtures send bare numbers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub(crate) enum Timetoken {
    Text(String),
    Number(u64),
}

impl Timetoken {
    fn value(&self) -> Result<u64> {
        match self {
            Timetoken::Text(text) => text
                .parse()
                .map_err(|e| Error::Decode(format!("invalid timetoken {text:?}: {e}"))),
            Timetoken::Number(n) => Ok(*n),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireCursor {
    #[serde(rename = "t")]
    timetoken: Timetoken,
    #[serde(rename = "r", default)]
    region: u32,
}

impl WireCursor {
    fn cursor(&self) -> Result<Cursor> {
        Ok(Cursor::new(self.timetoken.value()?, self.region))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SubscribeBody {
    #[serde(rename = "t")]
    cursor: WireCursor,
    #[serde(rename = "m", default)]
    messages: Vec<Envelope>,
}

/// One entry of the subscribe response's `m` array.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Envelope {
    #[serde(rename = "a")]
    pub shard: Option<String>,
    #[serde(rename = "f")]
    pub flags: Option<i64>,
    #[serde(rename = "i")]
    pub publisher: Option<String>,
    #[serde(rename = "p")]
    pub publish: Option<EnvelopeCursor>,
    #[serde(rename = "k")]
    pub subscribe_key: Option<String>,
    #[serde(rename = "c")]
    pub channel: String,
    #[serde(rename = "d")]
    pub payload: Value,
    #[serde(rename = "b")]
    pub subscription: Option<String>,
    #[serde(rename = "u")]
    pub user_metadata: Option<Value>,
    #[serde(rename = "e")]
    pub message_type: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EnvelopeCursor {
    #[serde(rename = "t")]
    pub timetoken: Option<Timetoken>,
    #[serde(rename = "r")]
    pub region: Option<u32>,
}

impl Envelope {
    fn timetoken(&self) -> u64 {
        self.publish
            .as_ref()
            .and_then(|p| p.timetoken.as_ref())
            .and_then(|t| t.value().ok())
            .unwrap_or(0)
    }

    fn subscription_name(&self) -> String {
        self.subscription
            .clone()
            .unwrap_or_else(|| self.channel.clone())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WirePresence {
    action: Option<PresenceAction>,
    uuid: Option<String>,
    occupancy: u32,
    timestamp: Option<u64>,
    data: Option<Value>,
    join: Vec<String>,
    leave: Vec<String>,
    timeout: Vec<String>,
    here_now_refresh: bool,
}

/// Decoded subscribe response.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeResponse {
    pub cursor: Cursor,
    pub messages: Vec<Envelope>,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

fn channel_segment(membership: &Membership) -> String {
    if membership.channels.is_empty() {
        ",".to_string()
    } else {
        join(membership.channels.iter())
    }
}

fn join<'a>(names: impl Iterator<Item = &'a String>) -> String {
    names.map(String::as_str).collect::<Vec<_>>().join(",")
}

fn common_query(config: &ResolvedConfig, membership: &Membership) -> Vec<(String, String)> {
    let mut query = vec![("uuid".to_string(), config.user_id.clone())];
    if !membership.groups.is_empty() {
        query.push(("channel-group".to_string(), join(membership.groups.iter())));
    }
    query
}

fn subscribe_request(
    config: &ResolvedConfig,
    membership: &Membership,
    cursor: Option<Cursor>,
    state: Option<&Value>,
) -> TransportRequest {
    let mut query = vec![("uuid".to_string(), config.user_id.clone())];
    if config.heartbeat_interval.is_some() {
        query.push((
            "heartbeat".to_string(),
            config.presence_timeout.as_secs().to_string(),
        ));
    }
    if !membership.groups.is_empty() {
        query.push(("channel-group".to_string(), join(membership.groups.iter())));
    }
    if let Some(cursor) = cursor {
        query.push(("tt".to_string(), cursor.timetoken.to_string()));
        query.push(("tr".to_string(), cursor.region.to_string()));
    }
    if let Some(filter) = &config.filter_expression {
        query.push(("filter-expr".to_string(), filter.clone()));
    }
    if let Some(state) = state {
        query.push(("state".to_string(), state.to_string()));
    }

    TransportRequest {
        operation: Operation::Subscribe,
        path: vec![
            "v2".to_string(),
            "subscribe".to_string(),
            config.subscribe_key.clone(),
            channel_segment(membership),
            "0".to_string(),
        ],
        query,
        timeout: config.subscribe_request_timeout,
    }
}

/// Initial subscribe call: no cursor, returns the starting position.
pub fn handshake_request(
    config: &ResolvedConfig,
    membership: &Membership,
    state: Option<&Value>,
) -> TransportRequest {
    subscribe_request(config, membership, None, state)
}

/// Long-poll for messages after `cursor`.
pub fn receive_request(
    config: &ResolvedConfig,
    membership: &Membership,
    cursor: Cursor,
) -> TransportRequest {
    subscribe_request(config, membership, Some(cursor), None)
}

fn presence_path(config: &ResolvedConfig, membership: &Membership, action: &str) -> Vec<String> {
    vec![
        "v2".to_string(),
        "presence".to_string(),
        "sub-key".to_string(),
        config.subscribe_key.clone(),
        "channel".to_string(),
        channel_segment(membership),
        action.to_string(),
    ]
}

pub fn heartbeat_request(
    config: &ResolvedConfig,
    membership: &Membership,
    state: Option<&Value>,
) -> TransportRequest {
    let mut query = common_query(config, membership);
    query.push((
        "heartbeat".to_string(),
        config.presence_timeout.as_secs().to_string(),
    ));
    if let Some(state) = state {
        query.push(("state".to_string(), state.to_string()));
    }
    TransportRequest {
        operation: Operation::Heartbeat,
        path: presence_path(config, membership, "heartbeat"),
        query,
        timeout: config.transactional_request_timeout,
    }
}

pub fn leave_request(config: &ResolvedConfig, membership: &Membership) -> TransportRequest {
    TransportRequest {
        operation: Operation::Leave,
        path: presence_path(config, membership, "leave"),
        query: common_query(config, membership),
        timeout: config.transactional_request_timeout,
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Map a non-2xx response to `Error::Service`, pulling the service's
/// `message` field when the body carries one.
fn check_status(response: &TransportResponse) -> Result<()> {
    if (200..300).contains(&response.status) {
        return Ok(());
    }
    let message = serde_json::from_slice::<Value>(&response.body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| {
            let text = String::from_utf8_lossy(&response.body).trim().to_string();
            if text.is_empty() {
                format!("HTTP {}", response.status)
            } else {
                text
            }
        });
    Err(Error::Service {
        status: response.status,
        message,
    })
}

pub fn parse_subscribe_response(response: &TransportResponse) -> Result<SubscribeResponse> {
    check_status(response)?;
    // Two-step decode: bytes → serde_json::Value → SubscribeBody.
    // serde_json::Value keeps the last of duplicated keys (envelopes have
    // been seen carrying "i" twice), which the struct deserializer rejects.
    let value: Value = serde_json::from_slice(&response.body)?;
    let body: SubscribeBody = serde_json::from_value(value)?;
    Ok(SubscribeResponse {
        cursor: body.cursor.cursor()?,
        messages: body.messages,
    })
}

/// Heartbeat and leave responses only carry an acknowledgment.
pub fn parse_ack_response(response: &TransportResponse) -> Result<()> {
    check_status(response)
}

// ---------------------------------------------------------------------------
// Envelope decoding
// ---------------------------------------------------------------------------

/// Turn an envelope into a listener event plus its dedupe identifier.
///
/// Returns `None` for envelope types this client does not deliver.
pub(crate) fn decode_envelope(
    envelope: Envelope,
    crypto: Option<&dyn CryptoModule>,
) -> Option<(DedupeKey, Event)> {
    if is_presence_name(&envelope.channel) {
        return decode_presence(envelope);
    }

    let timetoken = envelope.timetoken();
    let subscription = envelope.subscription_name();
    match envelope.message_type.unwrap_or(message_type::MESSAGE) {
        message_type::MESSAGE => {
            let (payload, error) = decrypt_payload(envelope.payload, crypto);
            let key = DedupeKey::new(
                &envelope.channel,
                timetoken,
                envelope.publisher.as_deref(),
                &payload,
            );
            let message = Message {
                channel: envelope.channel,
                subscription,
                timetoken,
                publisher: envelope.publisher,
                payload,
                user_metadata: envelope.user_metadata,
                error,
            };
            Some((key, Event::Message(message)))
        }
        message_type::SIGNAL => {
            let key = DedupeKey::new(
                &envelope.channel,
                timetoken,
                envelope.publisher.as_deref(),
                &envelope.payload,
            );
            let signal = Message {
                channel: envelope.channel,
                subscription,
                timetoken,
                publisher: envelope.publisher,
                payload: envelope.payload,
                user_metadata: envelope.user_metadata,
                error: None,
            };
            Some((key, Event::Signal(signal)))
        }
        kind @ (message_type::OBJECTS | message_type::MESSAGE_ACTION | message_type::FILES) => {
            tracing::debug!(
                channel = %envelope.channel,
                message_type = kind,
                "skipping envelope type without a listener kind"
            );
            None
        }
        other => {
            tracing::warn!(
                channel = %envelope.channel,
                message_type = other,
                "skipping unknown envelope type"
            );
            None
        }
    }
}

fn decode_presence(envelope: Envelope) -> Option<(DedupeKey, Event)> {
    let timetoken = envelope.timetoken();
    let subscription = envelope.subscription_name();
    let channel = envelope
        .channel
        .strip_suffix(PRESENCE_SUFFIX)
        .unwrap_or(&envelope.channel)
        .to_string();

    let wire: WirePresence = match serde_json::from_value(envelope.payload.clone()) {
        Ok(wire) => wire,
        Err(e) => {
            tracing::warn!(channel = %channel, error = %e, "malformed presence payload");
            return None;
        }
    };
    let Some(action) = wire.action else {
        tracing::warn!(channel = %channel, "presence payload without action");
        return None;
    };

    let key = DedupeKey::new(
        &envelope.channel,
        timetoken,
        wire.uuid.as_deref(),
        &envelope.payload,
    );
    let presence = Presence {
        channel,
        subscription,
        action,
        uuid: wire.uuid,
        occupancy: wire.occupancy,
        timestamp: wire.timestamp,
        timetoken,
        state: wire.data,
        join: wire.join,
        leave: wire.leave,
        timeout: wire.timeout,
        here_now_refresh: wire.here_now_refresh,
    };
    Some((key, Event::Presence(presence)))
}

/// Decrypt a base64 string payload. On failure the raw payload is kept and
/// an error description returned alongside it.
fn decrypt_payload(payload: Value, crypto: Option<&dyn CryptoModule>) -> (Value, Option<String>) {
    let (Some(crypto), Value::String(encoded)) = (crypto, &payload) else {
        return (payload, None);
    };
    let describe = |e: &dyn std::fmt::Display| format!("Error while decrypting message content: {e}");

    let bytes = match base64::engine::general_purpose::STANDARD.decode(encoded) {
        Ok(bytes) => bytes,
        Err(e) => return (payload, Some(describe(&e))),
    };
    let plain = match crypto.decrypt(&bytes) {
        Ok(plain) => plain,
        Err(e) => return (payload, Some(describe(&e))),
    };
    if let Ok(value) = serde_json::from_slice::<Value>(&plain) {
        return (value, None);
    }
    match String::from_utf8(plain) {
        Ok(text) => (Value::String(text), None),
        Err(e) => (payload, Some(describe(&e))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::types::BoxError;
    use bytes::Bytes;
    use serde_json::json;
    use std::time::Duration;

    fn config() -> ResolvedConfig {
        let mut config = Configuration::new("mySubKey", "myUUID");
        config.heartbeat_interval = Some(149);
        config.resolve().unwrap()
    }

    fn response(status: u16, body: &str) -> TransportResponse {
        TransportResponse {
            status,
            body: Bytes::from(body.to_string()),
        }
    }

    fn query_value<'a>(request: &'a TransportRequest, key: &str) -> Option<&'a str> {
        request
            .query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn presence_names() {
        assert!(is_presence_name("ch1-pnpres"));
        assert!(!is_presence_name("ch1"));
        assert_eq!(presence_name("ch1"), "ch1-pnpres");
    }

    #[test]
    fn handshake_request_shape() {
        let membership = Membership::new(["ch2", "ch1-pnpres", "ch1", "ch2-pnpres"], ["cg1"]);
        let request = handshake_request(&config(), &membership, None);
        assert_eq!(
            request.path,
            vec!["v2", "subscribe", "mySubKey", "ch1,ch1-pnpres,ch2,ch2-pnpres", "0"]
        );
        assert_eq!(query_value(&request, "uuid"), Some("myUUID"));
        assert_eq!(query_value(&request, "heartbeat"), Some("300"));
        assert_eq!(query_value(&request, "channel-group"), Some("cg1"));
        assert_eq!(query_value(&request, "tt"), None);
        assert_eq!(request.timeout, Duration::from_secs(310));
        assert_eq!(request.operation, Operation::Subscribe);
    }

    #[test]
    fn receive_request_carries_cursor() {
        let membership = Membership::new(["ch1"], Vec::<String>::new());
        let request = receive_request(&config(), &membership, Cursor::new(3, 1));
        assert_eq!(query_value(&request, "tt"), Some("3"));
        assert_eq!(query_value(&request, "tr"), Some("1"));
        assert_eq!(query_value(&request, "channel-group"), None);
    }

    #[test]
    fn group_only_uses_comma_placeholder() {
        let membership = Membership::new(Vec::<String>::new(), ["cg1", "cg2"]);
        let request = handshake_request(&config(), &membership, None);
        assert_eq!(request.path.get(3).map(String::as_str), Some(","));
        assert_eq!(query_value(&request, "channel-group"), Some("cg1,cg2"));
    }

    #[test]
    fn heartbeat_request_shape() {
        let membership = Membership::new(["ch1", "ch2"], Vec::<String>::new());
        let state = json!({ "ch1": { "mood": "happy" } });
        let request = heartbeat_request(&config(), &membership, Some(&state));
        assert_eq!(
            request.path,
            vec!["v2", "presence", "sub-key", "mySubKey", "channel", "ch1,ch2", "heartbeat"]
        );
        assert_eq!(query_value(&request, "heartbeat"), Some("300"));
        assert_eq!(
            query_value(&request, "state"),
            Some(r#"{"ch1":{"mood":"happy"}}"#)
        );
        assert_eq!(request.timeout, Duration::from_secs(15));
    }

    #[test]
    fn leave_request_shape() {
        let membership = Membership::new(["ch1"], ["cg1"]);
        let request = leave_request(&config(), &membership);
        assert_eq!(request.path.last().map(String::as_str), Some("leave"));
        assert_eq!(query_value(&request, "channel-group"), Some("cg1"));
        assert_eq!(request.operation, Operation::Leave);
    }

    #[test]
    fn filter_expression_forwarded() {
        let mut raw = Configuration::new("mySubKey", "myUUID");
        raw.filter_expression = Some("uuid != 'me'".into());
        let config = raw.resolve().unwrap();
        let membership = Membership::new(["ch1"], Vec::<String>::new());
        let request = receive_request(&config, &membership, Cursor::new(1, 0));
        assert_eq!(query_value(&request, "filter-expr"), Some("uuid != 'me'"));
        assert_eq!(query_value(&request, "heartbeat"), None);
    }

    #[test]
    fn parse_subscribe_with_message() {
        let body = r#"{"t":{"t":"3","r":1},"m":[{"a":"4","f":0,"i":"Client-g5d4g","p":{"t":"14607577960925503","r":1},"k":"mySubKey","c":"ch1","d":{"text":"customttresponse"},"b":"ch1","u":{"cool":"meta"}}]}"#;
        let parsed = parse_subscribe_response(&response(200, body)).unwrap();
        assert_eq!(parsed.cursor, Cursor::new(3, 1));
        assert_eq!(parsed.messages.len(), 1);
        let envelope = parsed.messages.first().unwrap();
        assert_eq!(envelope.channel, "ch1");
        assert_eq!(envelope.publisher.as_deref(), Some("Client-g5d4g"));
    }

    #[test]
    fn parse_subscribe_tolerates_duplicate_keys() {
        let body = r#"{"t":{"t":"5","r":2},"m":[{"i":"first","c":"ch1","d":"x","i":"client1"}]}"#;
        let parsed = parse_subscribe_response(&response(200, body)).unwrap();
        assert_eq!(
            parsed.messages.first().and_then(|m| m.publisher.as_deref()),
            Some("client1")
        );
    }

    #[test]
    fn parse_subscribe_numeric_timetoken() {
        let parsed = parse_subscribe_response(&response(200, r#"{"t":{"t":42,"r":0}}"#)).unwrap();
        assert_eq!(parsed.cursor, Cursor::new(42, 0));
        assert!(parsed.messages.is_empty());
    }

    #[test]
    fn parse_subscribe_errors() {
        let err = parse_subscribe_response(&response(
            403,
            r#"{"status":403,"error":true,"message":"Forbidden"}"#,
        ))
        .unwrap_err();
        assert_eq!(
            err,
            Error::Service {
                status: 403,
                message: "Forbidden".into()
            }
        );

        let err = parse_subscribe_response(&response(200, "not json")).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));

        let err = parse_subscribe_response(&response(200, r#"{"t":{"t":"abc"}}"#)).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn parse_ack() {
        assert!(parse_ack_response(&response(200, r#"{"status":200}"#)).is_ok());
        let err = parse_ack_response(&response(400, "")).unwrap_err();
        assert_eq!(err.status_code(), Some(400));
        assert_eq!(
            err,
            Error::Service {
                status: 400,
                message: "HTTP 400".into()
            }
        );
    }

    fn envelope(channel: &str, payload: Value) -> Envelope {
        Envelope {
            channel: channel.to_string(),
            subscription: Some(channel.to_string()),
            publisher: Some("client1".to_string()),
            payload,
            publish: Some(EnvelopeCursor {
                timetoken: Some(Timetoken::Text("14523669555221452".into())),
                region: Some(1),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn decode_message() {
        let (_, event) =
            decode_envelope(envelope("ch1", json!({"text": "hi"})), None).unwrap();
        match event {
            Event::Message(m) => {
                assert_eq!(m.channel, "ch1");
                assert_eq!(m.subscription, "ch1");
                assert_eq!(m.timetoken, 14523669555221452);
                assert_eq!(m.payload, json!({"text": "hi"}));
                assert!(m.error.is_none());
            }
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[test]
    fn decode_signal_and_skip_other_types() {
        let mut signal = envelope("ch1", json!("ping"));
        signal.message_type = Some(message_type::SIGNAL);
        assert!(matches!(
            decode_envelope(signal, None),
            Some((_, Event::Signal(_)))
        ));

        for kind in [
            message_type::OBJECTS,
            message_type::MESSAGE_ACTION,
            message_type::FILES,
            42,
        ] {
            let mut skipped = envelope("ch1", json!({}));
            skipped.message_type = Some(kind);
            assert!(decode_envelope(skipped, None).is_none(), "type {kind}");
        }
    }

    #[test]
    fn numeric_publish_timetoken_is_kept() {
        let raw = json!({
            "c": "ch1",
            "d": {"text": "hi"},
            "p": {"t": 17000000000000001u64, "r": 2}
        });
        let envelope: Envelope = serde_json::from_value(raw).unwrap();
        let (_, event) = decode_envelope(envelope, None).unwrap();
        match event {
            Event::Message(m) => assert_eq!(m.timetoken, 17000000000000001),
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[test]
    fn decode_presence_join() {
        let payload = json!({
            "action": "join",
            "timestamp": 1461451222,
            "uuid": "testid",
            "occupancy": 1,
            "data": { "mood": "happy" }
        });
        let (_, event) = decode_envelope(envelope("ch1-pnpres", payload), None).unwrap();
        match event {
            Event::Presence(p) => {
                assert_eq!(p.channel, "ch1");
                assert_eq!(p.subscription, "ch1-pnpres");
                assert_eq!(p.action, PresenceAction::Join);
                assert_eq!(p.uuid.as_deref(), Some("testid"));
                assert_eq!(p.occupancy, 1);
                assert_eq!(p.timestamp, Some(1461451222));
                assert_eq!(p.state, Some(json!({ "mood": "happy" })));
            }
            other => panic!("expected Presence, got {other:?}"),
        }
    }

    #[test]
    fn decode_presence_interval() {
        let payload = json!({
            "action": "interval",
            "timestamp": 1461451222,
            "occupancy": 3,
            "join": ["a", "b"],
            "timeout": ["c"],
            "here_now_refresh": true
        });
        let (_, event) = decode_envelope(envelope("ch1-pnpres", payload), None).unwrap();
        match event {
            Event::Presence(p) => {
                assert_eq!(p.action, PresenceAction::Interval);
                assert_eq!(p.join, vec!["a", "b"]);
                assert_eq!(p.timeout, vec!["c"]);
                assert!(p.leave.is_empty());
                assert!(p.here_now_refresh);
            }
            other => panic!("expected Presence, got {other:?}"),
        }
    }

    #[test]
    fn decode_presence_state_change() {
        let payload = json!({ "action": "state-change", "uuid": "u", "occupancy": 1 });
        let decoded = decode_envelope(envelope("ch1-pnpres", payload), None);
        assert!(matches!(
            decoded,
            Some((_, Event::Presence(Presence { action: PresenceAction::StateChange, .. })))
        ));
    }

    #[test]
    fn malformed_presence_is_skipped() {
        assert!(decode_envelope(envelope("ch1-pnpres", json!("oops")), None).is_none());
        assert!(decode_envelope(envelope("ch1-pnpres", json!({"uuid": "u"})), None).is_none());
    }

    struct Reverse;

    impl CryptoModule for Reverse {
        fn decrypt(&self, data: &[u8]) -> std::result::Result<Vec<u8>, BoxError> {
            Ok(data.iter().rev().copied().collect())
        }
    }

    struct Failing;

    impl CryptoModule for Failing {
        fn decrypt(&self, _data: &[u8]) -> std::result::Result<Vec<u8>, BoxError> {
            Err("bad key".into())
        }
    }

    #[test]
    fn decrypts_string_payload() {
        let cipher: Vec<u8> = br#"{"text":"hi"}"#.iter().rev().copied().collect();
        let encoded = base64::engine::general_purpose::STANDARD.encode(cipher);
        let (_, event) = decode_envelope(envelope("ch1", json!(encoded)), Some(&Reverse)).unwrap();
        match event {
            Event::Message(m) => {
                assert_eq!(m.payload, json!({"text": "hi"}));
                assert!(m.error.is_none());
            }
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[test]
    fn decrypt_failure_keeps_raw_payload() {
        let (_, event) = decode_envelope(envelope("ch1", json!("hello")), Some(&Failing)).unwrap();
        match event {
            Event::Message(m) => {
                assert_eq!(m.payload, json!("hello"));
                assert!(m
                    .error
                    .as_deref()
                    .unwrap()
                    .starts_with("Error while decrypting message content"));
            }
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[test]
    fn non_string_payload_not_decrypted() {
        let (_, event) =
            decode_envelope(envelope("ch1", json!({"plain": true})), Some(&Failing)).unwrap();
        assert!(matches!(event, Event::Message(Message { error: None, .. })));
    }
}
