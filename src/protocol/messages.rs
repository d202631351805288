//! Event and probe message types
//!
//! The backend publishes JSON text frames shaped as
//! `{"type": "risk_update", "data": {...}}`. `topic`/`payload` are accepted
//! as aliases so other producers can use the generic field names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Text frame sent by the client as a liveness probe
pub const PROBE_REQUEST: &str = "ping";

/// Text frame the server answers a probe with
pub const PROBE_REPLY: &str = "pong";

/// Decoded inbound event, handed to the dispatcher and then dropped
///
/// # Examples
/// ```
/// use riskstream::protocol::DomainEvent;
/// use serde_json::json;
///
/// let event = DomainEvent::new("risk_update", json!({"score": 0.8}));
/// assert_eq!(event.topic, "risk_update");
/// assert!(event.server_timestamp.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainEvent {
    /// Routing key used by the dispatcher
    pub topic: String,
    /// Structured event body
    pub payload: Value,
    /// Server-side production time, when the producer supplied one
    pub server_timestamp: Option<DateTime<Utc>>,
}

impl DomainEvent {
    pub fn new<S: Into<String>>(topic: S, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            server_timestamp: None,
        }
    }

    pub fn with_server_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.server_timestamp = Some(timestamp);
        self
    }

    /// Decode a JSON text frame into an event
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let envelope: WireEvent = serde_json::from_str(text)?;
        Ok(envelope.into_event())
    }
}

/// JSON envelope as it appears on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(rename = "type", alias = "topic")]
    pub topic: String,
    #[serde(rename = "data", alias = "payload", default)]
    pub payload: Value,
    #[serde(
        default,
        alias = "server_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<String>,
}

impl WireEvent {
    pub fn new<S: Into<String>>(topic: S, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            timestamp: None,
        }
    }

    /// Convert into a domain event, resolving the server timestamp
    ///
    /// An unparseable timestamp is dropped rather than failing the decode.
    pub fn into_event(self) -> DomainEvent {
        let server_timestamp = self
            .timestamp
            .as_deref()
            .or_else(|| self.payload.get("timestamp").and_then(Value::as_str))
            .and_then(parse_timestamp);

        DomainEvent {
            topic: self.topic,
            payload: self.payload,
            server_timestamp,
        }
    }

    /// Render as a JSON text frame body
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|timestamp| timestamp.with_timezone(&Utc))
}

/// Check whether a text frame is the server's probe reply
pub fn is_probe_reply(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case(PROBE_REPLY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_decode_backend_risk_update() {
        let text = r#"{"type":"risk_update","data":{"score":0.8,"symbol":"NIFTY"}}"#;
        let event = DomainEvent::from_json(text).unwrap();

        assert_eq!(event.topic, "risk_update");
        assert_eq!(event.payload["score"], json!(0.8));
        assert_eq!(event.server_timestamp, None);
    }

    #[test]
    fn test_decode_generic_field_names() {
        let text = r#"{"topic":"alert","payload":{"level":"high"}}"#;
        let event = DomainEvent::from_json(text).unwrap();

        assert_eq!(event.topic, "alert");
        assert_eq!(event.payload, json!({"level": "high"}));
    }

    #[test]
    fn test_decode_top_level_timestamp() {
        let text = r#"{"type":"alert","data":{},"timestamp":"2024-03-01T09:30:00Z"}"#;
        let event = DomainEvent::from_json(text).unwrap();

        assert_eq!(
            event.server_timestamp,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_decode_timestamp_from_payload() {
        let text = r#"{"type":"risk_update","data":{"timestamp":"2024-03-01T09:30:00+05:30"}}"#;
        let event = DomainEvent::from_json(text).unwrap();

        assert_eq!(
            event.server_timestamp,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 4, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_bad_timestamp_is_dropped() {
        let text = r#"{"type":"risk_update","data":{},"timestamp":"yesterday"}"#;
        let event = DomainEvent::from_json(text).unwrap();
        assert_eq!(event.server_timestamp, None);
    }

    #[test]
    fn test_missing_data_defaults_to_null() {
        let event = DomainEvent::from_json(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(event.payload, Value::Null);
    }

    #[test]
    fn test_rejects_frames_without_topic() {
        assert!(DomainEvent::from_json(r#"{"data":{"score":1}}"#).is_err());
        assert!(DomainEvent::from_json("Received: hello").is_err());
    }

    #[test]
    fn test_wire_event_serializes_backend_shape() {
        let json = WireEvent::new("alert", json!({"id": 7})).to_json().unwrap();
        assert_eq!(json, r#"{"type":"alert","data":{"id":7}}"#);
    }

    #[test]
    fn test_probe_reply_detection() {
        assert!(is_probe_reply("pong"));
        assert!(is_probe_reply(" PONG\n"));
        assert!(!is_probe_reply("ping"));
        assert!(!is_probe_reply(r#"{"type":"pong"}"#));
    }
}
