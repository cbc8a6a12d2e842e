//! Wire framing
//!
//! Text frames exchanged with front ends, outbound instance links and the
//! broker. Everything here is pure so the adapters can be exercised with
//! synthetic frames.

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

/// Prefix of an instance announcement on an outbound link.
pub const ANNOUNCE_PREFIX: &str = "CON:";

/// Prefix of the presence frame sent to front ends.
pub const PRESENCE_PREFIX: &str = "CLI:";

/// Channel that most recently reported an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Link,
    Broker,
}

/// Presence record announced by an instance.
///
/// The announcement body is kept as-is, in its original field order, and
/// re-emitted verbatim in the presence frame. Only `instance` is
/// interpreted.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRecord {
    instance: String,
    body: Map<String, Value>,
    /// Channel that most recently reported this record. Not serialised.
    pub transport: Transport,
}

impl InstanceRecord {
    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn hostname(&self) -> Option<&str> {
        self.field("hostname").and_then(Value::as_str)
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }
}

impl Serialize for InstanceRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.body.serialize(serializer)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("announcement is not a JSON object")]
    NotAnObject,

    #[error("announcement has no instance id")]
    MissingInstance,
}

/// Parse an announcement body (`{"instance": ..., ...}`).
///
/// The `instance` field must be a string with at least one non-whitespace
/// character. Every other field is opaque.
pub fn parse_announcement(payload: &str, transport: Transport) -> Result<InstanceRecord, FrameError> {
    let value: Value = serde_json::from_str(payload)?;
    let Value::Object(body) = value else {
        return Err(FrameError::NotAnObject);
    };

    let instance = match body.get("instance") {
        Some(Value::String(id)) if !id.trim().is_empty() => id.clone(),
        _ => return Err(FrameError::MissingInstance),
    };

    Ok(InstanceRecord {
        instance,
        body,
        transport,
    })
}

/// Parse a broker status body published on `.../status/<id>`. The body's
/// own `instance` names the record; the topic id only addresses the
/// publisher.
pub fn parse_status(payload: &str) -> Result<InstanceRecord, FrameError> {
    parse_announcement(payload, Transport::Broker)
}

#[derive(Serialize)]
struct PresenceBody<'a> {
    clients: &'a [InstanceRecord],
}

/// Encode the `CLI:{"clients":[...]}` presence frame.
pub fn presence_frame(records: &[InstanceRecord]) -> Result<String, serde_json::Error> {
    let body = serde_json::to_string(&PresenceBody { clients: records })?;
    Ok(format!("{PRESENCE_PREFIX}{body}"))
}

/// Inbound text frame from an outbound link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFrame<'a> {
    /// Body of a `CON:` frame.
    Announcement(&'a str),
    /// Anything else, forwarded to front ends untouched.
    Passthrough(&'a str),
}

pub fn classify_link_frame(text: &str) -> LinkFrame<'_> {
    match text.strip_prefix(ANNOUNCE_PREFIX) {
        Some(body) => LinkFrame::Announcement(body),
        None => LinkFrame::Passthrough(text),
    }
}

/// Meaning of an inbound broker topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind<'a> {
    /// The configured command-receive topic.
    Receive,
    /// `.../status/<id>`: presence update for `id`.
    Status(&'a str),
    /// `.../status/<id>/log`: log line from `id`.
    Log(&'a str),
    Unexpected,
}

/// Classify a broker topic. The receive topic wins over the status patterns
/// and the log pattern is checked before the plain status pattern.
pub fn classify_topic<'a>(topic: &'a str, receive_topic: &str) -> TopicKind<'a> {
    if topic == receive_topic {
        return TopicKind::Receive;
    }

    let parts: Vec<&str> = topic.split('/').collect();
    let n = parts.len();
    if n >= 3 && parts[n - 3] == "status" && parts[n - 1] == "log" {
        return TopicKind::Log(parts[n - 2]);
    }
    if n >= 2 && parts[n - 2] == "status" {
        return TopicKind::Status(parts[n - 1]);
    }
    TopicKind::Unexpected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announcement_keeps_unknown_fields() {
        let record = parse_announcement(
            r#"{"instance":"living-room","hostname":"ir-1","description":"TV","url":"http://ir-1","rssi":-61}"#,
            Transport::Link,
        )
        .unwrap();
        assert_eq!(record.instance(), "living-room");
        assert_eq!(record.hostname(), Some("ir-1"));
        assert_eq!(record.field("rssi").unwrap(), -61);
        assert_eq!(record.transport, Transport::Link);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["rssi"], -61);
        assert!(json.get("transport").is_none());
    }

    #[test]
    fn metadata_of_any_type_is_accepted() {
        let record = parse_announcement(
            r#"{"instance":"den","description":42,"hostname":null,"url":["a"]}"#,
            Transport::Link,
        )
        .unwrap();
        assert_eq!(record.instance(), "den");
        assert_eq!(record.field("description").unwrap(), 42);
        assert!(record.hostname().is_none());

        let frame = presence_frame(&[record]).unwrap();
        assert_eq!(
            frame,
            r#"CLI:{"clients":[{"instance":"den","description":42,"hostname":null,"url":["a"]}]}"#
        );
    }

    #[test]
    fn announcement_field_order_is_preserved() {
        let body = r#"{"url":"http://ir-1","instance":"den","hostname":"ir-1"}"#;
        let record = parse_announcement(body, Transport::Link).unwrap();
        assert_eq!(serde_json::to_string(&record).unwrap(), body);
    }

    #[test]
    fn announcement_without_instance_is_rejected() {
        assert!(matches!(
            parse_announcement(r#"{"hostname":"ir-1"}"#, Transport::Link),
            Err(FrameError::MissingInstance)
        ));
        assert!(matches!(
            parse_announcement(r#"{"instance":"   "}"#, Transport::Link),
            Err(FrameError::MissingInstance)
        ));
        assert!(matches!(
            parse_announcement(r#"{"instance":42}"#, Transport::Broker),
            Err(FrameError::MissingInstance)
        ));
    }

    #[test]
    fn malformed_announcement_is_a_json_error() {
        assert!(matches!(
            parse_announcement("{not json", Transport::Link),
            Err(FrameError::Json(_))
        ));
        assert!(matches!(
            parse_announcement("[1,2]", Transport::Link),
            Err(FrameError::NotAnObject)
        ));
    }

    #[test]
    fn status_is_named_by_its_body() {
        let record = parse_status(r#"{"instance":"Living Room"}"#).unwrap();
        assert_eq!(record.instance(), "Living Room");
        assert_eq!(record.transport, Transport::Broker);

        assert!(matches!(
            parse_status(r#"{"instance":" "}"#),
            Err(FrameError::MissingInstance)
        ));
    }

    #[test]
    fn presence_frame_format() {
        let record = parse_announcement(r#"{"instance":"a","hostname":"h"}"#, Transport::Link).unwrap();
        let frame = presence_frame(&[record]).unwrap();
        assert_eq!(frame, r#"CLI:{"clients":[{"instance":"a","hostname":"h"}]}"#);

        assert_eq!(presence_frame(&[]).unwrap(), r#"CLI:{"clients":[]}"#);
    }

    #[test]
    fn link_frames() {
        assert_eq!(
            classify_link_frame(r#"CON:{"instance":"a"}"#),
            LinkFrame::Announcement(r#"{"instance":"a"}"#)
        );
        assert_eq!(
            classify_link_frame("LOG:received NEC 0x20DF10EF"),
            LinkFrame::Passthrough("LOG:received NEC 0x20DF10EF")
        );
        assert_eq!(classify_link_frame("ACK:{}"), LinkFrame::Passthrough("ACK:{}"));
    }

    #[test]
    fn topic_classification() {
        assert_eq!(classify_topic("ir/receive", "ir/receive"), TopicKind::Receive);
        assert_eq!(classify_topic("ir/status/den", "ir/receive"), TopicKind::Status("den"));
        assert_eq!(classify_topic("ir/status/den/log", "ir/receive"), TopicKind::Log("den"));
        assert_eq!(classify_topic("status/", "ir/receive"), TopicKind::Status(""));
        assert_eq!(classify_topic("ir/other/den", "ir/receive"), TopicKind::Unexpected);
        assert_eq!(classify_topic("status", "ir/receive"), TopicKind::Unexpected);
    }

    #[test]
    fn receive_topic_wins_over_status_pattern() {
        assert_eq!(classify_topic("ir/status/relay", "ir/status/relay"), TopicKind::Receive);
    }
}
