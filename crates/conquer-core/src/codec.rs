//! Wire envelope codec and acknowledgment bookkeeping.
//!
//! Every frame on the socket is one UTF-8 JSON object:
//!
//! ```text
//! { "id": <uuid>, "num": "<int>", "date": "<ISO-8601>", "type": "<msg-type>", "payload": <any> }
//! ```
//!
//! `num` travels as a string. Decoding also accepts a bare JSON integer.

use std::fmt;
use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::error::DecodeError;

/// Message types understood by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Ack,
    Config,
    Done,
    Env,
    Error,
    Report,
    Schedule,
    Schedules,
    Suite,
}

impl MessageType {
    pub const ALL: [Self; 9] = [
        Self::Ack,
        Self::Config,
        Self::Done,
        Self::Env,
        Self::Error,
        Self::Report,
        Self::Schedule,
        Self::Schedules,
        Self::Suite,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Config => "config",
            Self::Done => "done",
            Self::Env => "env",
            Self::Error => "error",
            Self::Report => "report",
            Self::Schedule => "schedule",
            Self::Schedules => "schedules",
            Self::Suite => "suite",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|ty| ty.as_str() == lowered)
            .ok_or_else(|| DecodeError::UnknownType(s.to_string()))
    }
}

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: String,
    pub num: i64,
    pub date: String,
    pub message_type: MessageType,
    pub payload: Value,
}

impl Envelope {
    /// Build an envelope with a fresh id and the current UTC time.
    #[must_use]
    pub fn new(num: i64, message_type: MessageType, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            num,
            date: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            message_type,
            payload,
        }
    }

    /// Serialize to the JSON text sent in one frame.
    #[must_use]
    pub fn to_json(&self) -> String {
        json!({
            "id": self.id,
            "num": self.num.to_string(),
            "date": self.date,
            "type": self.message_type.as_str(),
            "payload": self.payload,
        })
        .to_string()
    }
}

/// Encode a message into its frame text.
#[must_use]
pub fn encode(num: i64, message_type: MessageType, payload: Value) -> String {
    Envelope::new(num, message_type, payload).to_json()
}

/// Decode one frame.
pub fn decode(raw: &str) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| DecodeError::Json(e.to_string()))?;
    let Value::Object(mut object) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let id = take_string(&mut object, "id")?;
    let num = take_num(&mut object)?;
    let date = take_string(&mut object, "date")?;
    let message_type = take_string(&mut object, "type")?.parse()?;
    let payload = object
        .remove("payload")
        .ok_or(DecodeError::MissingField("payload"))?;

    Ok(Envelope {
        id,
        num,
        date,
        message_type,
        payload,
    })
}

fn take_string(object: &mut Map<String, Value>, field: &'static str) -> Result<String, DecodeError> {
    match object.remove(field) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(DecodeError::InvalidField {
            field,
            reason: format!("expected string, got {other}"),
        }),
        None => Err(DecodeError::MissingField(field)),
    }
}

fn take_num(object: &mut Map<String, Value>) -> Result<i64, DecodeError> {
    let invalid = |reason: String| DecodeError::InvalidField {
        field: "num",
        reason,
    };
    match object.remove("num") {
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map_err(|e| invalid(format!("'{s}': {e}"))),
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| invalid(format!("'{n}' is not an integer"))),
        Some(other) => Err(invalid(format!("expected integer string, got {other}"))),
        None => Err(DecodeError::MissingField("num")),
    }
}

// =============================================================================
// Acknowledgments
// =============================================================================

/// Result of comparing an incoming sequence number with the last one seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckStatus {
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "duplicate")]
    Duplicate,
    #[serde(rename = "out-of-order")]
    OutOfOrder,
}

impl AckStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Duplicate => "duplicate",
            Self::OutOfOrder => "out-of-order",
        }
    }
}

impl fmt::Display for AckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify `incoming` against `last_seen`. Pure.
#[must_use]
pub fn classify(last_seen: i64, incoming: i64) -> AckStatus {
    if incoming <= last_seen {
        AckStatus::Duplicate
    } else if incoming == last_seen.saturating_add(1) {
        AckStatus::Success
    } else {
        AckStatus::OutOfOrder
    }
}

/// Whether a message with this status and type reaches subscribers.
///
/// `error` messages are dispatched even when out of order; duplicates never are.
#[must_use]
pub fn should_dispatch(status: AckStatus, message_type: MessageType) -> bool {
    match status {
        AckStatus::Success => true,
        AckStatus::Duplicate => false,
        AckStatus::OutOfOrder => message_type == MessageType::Error,
    }
}

/// Payload of the transport-level ack sent for every inbound message.
#[must_use]
pub fn ack_payload(num: i64, status: AckStatus) -> Value {
    json!({ "message_num": num, "status": status.as_str() })
}

/// Tracks the last inbound sequence number across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckTracker {
    last_seen: i64,
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AckTracker {
    /// Nothing seen yet: the first expected number is 1.
    #[must_use]
    pub const fn new() -> Self {
        Self { last_seen: 0 }
    }

    #[must_use]
    pub const fn last_seen(&self) -> i64 {
        self.last_seen
    }

    /// Classify `num` and advance the watermark on success.
    pub fn observe(&mut self, num: i64) -> AckStatus {
        let status = classify(self.last_seen, num);
        if status == AckStatus::Success {
            self.last_seen = num;
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_produces_string_num_and_lowercase_type() {
        let raw = encode(7, MessageType::Config, json!({"a": 1}));
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["num"], json!("7"));
        assert_eq!(value["type"], json!("config"));
        assert_eq!(value["payload"], json!({"a": 1}));
        assert!(Uuid::parse_str(value["id"].as_str().unwrap()).is_ok());
        assert!(value["date"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn decode_reverses_encode() {
        let raw = encode(3, MessageType::Schedules, json!([{"items": []}]));
        let envelope = decode(&raw).unwrap();
        assert_eq!(envelope.num, 3);
        assert_eq!(envelope.message_type, MessageType::Schedules);
        assert_eq!(envelope.payload, json!([{"items": []}]));
    }

    #[test]
    fn decode_accepts_integer_num_and_uppercase_type() {
        let raw = r#"{"id":"x","num":5,"date":"d","type":"DONE","payload":null}"#;
        let envelope = decode(raw).unwrap();
        assert_eq!(envelope.num, 5);
        assert_eq!(envelope.message_type, MessageType::Done);
        assert_eq!(envelope.payload, Value::Null);
    }

    #[test]
    fn decode_rejects_malformed_json() {
        assert!(matches!(decode("{not json"), Err(DecodeError::Json(_))));
        assert_eq!(decode("[1,2]"), Err(DecodeError::NotAnObject));
    }

    #[test]
    fn decode_rejects_missing_fields() {
        let raw = r#"{"id":"x","date":"d","type":"done","payload":null}"#;
        assert_eq!(decode(raw), Err(DecodeError::MissingField("num")));
        let raw = r#"{"id":"x","num":"1","date":"d","type":"done"}"#;
        assert_eq!(decode(raw), Err(DecodeError::MissingField("payload")));
        let raw = r#"{"num":"1","date":"d","type":"done","payload":1}"#;
        assert_eq!(decode(raw), Err(DecodeError::MissingField("id")));
    }

    #[test]
    fn decode_rejects_bad_num_and_type() {
        let raw = r#"{"id":"x","num":"one","date":"d","type":"done","payload":null}"#;
        assert!(matches!(
            decode(raw),
            Err(DecodeError::InvalidField { field: "num", .. })
        ));
        let raw = r#"{"id":"x","num":"1","date":"d","type":"gossip","payload":null}"#;
        assert_eq!(decode(raw), Err(DecodeError::UnknownType("gossip".into())));
    }

    #[test]
    fn classify_cases() {
        assert_eq!(classify(0, 1), AckStatus::Success);
        assert_eq!(classify(4, 5), AckStatus::Success);
        assert_eq!(classify(4, 4), AckStatus::Duplicate);
        assert_eq!(classify(4, 2), AckStatus::Duplicate);
        assert_eq!(classify(4, 6), AckStatus::OutOfOrder);
    }

    #[test]
    fn error_type_dispatches_out_of_order() {
        assert!(should_dispatch(AckStatus::OutOfOrder, MessageType::Error));
        assert!(!should_dispatch(AckStatus::OutOfOrder, MessageType::Schedule));
        assert!(!should_dispatch(AckStatus::Duplicate, MessageType::Error));
        assert!(should_dispatch(AckStatus::Success, MessageType::Done));
    }

    #[test]
    fn tracker_only_advances_on_success() {
        let mut tracker = AckTracker::new();
        assert_eq!(tracker.observe(1), AckStatus::Success);
        assert_eq!(tracker.observe(3), AckStatus::OutOfOrder);
        assert_eq!(tracker.last_seen(), 1);
        assert_eq!(tracker.observe(1), AckStatus::Duplicate);
        assert_eq!(tracker.observe(2), AckStatus::Success);
        assert_eq!(tracker.observe(3), AckStatus::Success);
        assert_eq!(tracker.last_seen(), 3);
    }

    #[test]
    fn ack_payload_shape() {
        assert_eq!(
            ack_payload(9, AckStatus::OutOfOrder),
            json!({"message_num": 9, "status": "out-of-order"})
        );
    }
}
