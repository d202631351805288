//! Inbound frame routing
//!
//! Pure decisions about what an inbound frame is. Every frame counts as
//! heartbeat activity regardless of its route; only `Event` reaches the
//! dispatcher.

use crate::protocol::{is_probe_reply, DomainEvent, WireEvent};
use crate::transport::Frame;
use tracing::debug;

/// What to do with an inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum FrameRoute {
    /// Server answered our text probe
    ProbeReply,
    /// Decoded event for the dispatcher
    Event(DomainEvent),
    /// WebSocket ping/pong control frame
    ControlFrame,
    /// Text or binary that is not an event envelope
    Undecodable(String),
}

/// Pure frame classification
pub struct MessageHandler;

impl MessageHandler {
    pub fn route_frame(frame: Frame) -> FrameRoute {
        match frame {
            Frame::Text(text) if is_probe_reply(&text) => FrameRoute::ProbeReply,
            Frame::Text(text) => Self::decode(serde_json::from_str::<WireEvent>(&text), &text),
            Frame::Binary(bytes) => Self::decode(
                serde_json::from_slice::<WireEvent>(&bytes),
                &String::from_utf8_lossy(&bytes),
            ),
            Frame::Ping(_) | Frame::Pong(_) => FrameRoute::ControlFrame,
        }
    }

    fn decode(result: Result<WireEvent, serde_json::Error>, raw: &str) -> FrameRoute {
        match result {
            Ok(envelope) => FrameRoute::Event(envelope.into_event()),
            Err(e) => {
                debug!(frame = %preview(raw), error = %e, "Discarding undecodable frame");
                FrameRoute::Undecodable(e.to_string())
            }
        }
    }
}

/// First 80 characters of a frame for log lines
fn preview(raw: &str) -> String {
    const LIMIT: usize = 80;
    match raw.char_indices().nth(LIMIT) {
        Some((cut, _)) => format!("{}...", &raw[..cut]),
        None => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::json;

    #[test]
    fn test_routes_backend_event() {
        let route = MessageHandler::route_frame(Frame::text(
            r#"{"type":"alert","data":{"message":"VaR breach"}}"#,
        ));
        assert_eq!(
            route,
            FrameRoute::Event(DomainEvent::new("alert", json!({"message": "VaR breach"})))
        );
    }

    #[test]
    fn test_routes_probe_reply() {
        assert_eq!(MessageHandler::route_frame(Frame::text("pong")), FrameRoute::ProbeReply);
    }

    #[test]
    fn test_routes_control_frames() {
        assert_eq!(
            MessageHandler::route_frame(Frame::Pong(Bytes::new())),
            FrameRoute::ControlFrame
        );
        assert_eq!(
            MessageHandler::route_frame(Frame::Ping(Bytes::from_static(b"x"))),
            FrameRoute::ControlFrame
        );
    }

    #[test]
    fn test_server_echo_is_undecodable() {
        let route = MessageHandler::route_frame(Frame::text("Received: ping2"));
        assert!(matches!(route, FrameRoute::Undecodable(_)));
    }

    #[test]
    fn test_binary_json_is_decoded() {
        let route = MessageHandler::route_frame(Frame::Binary(Bytes::from_static(
            br#"{"type":"risk_update","data":{"score":0.4}}"#,
        )));
        assert!(matches!(route, FrameRoute::Event(ref event) if event.topic == "risk_update"));
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let long = "é".repeat(100);
        let shown = preview(&long);
        assert!(shown.ends_with("..."));
        assert_eq!(shown.chars().count(), 83);
        assert_eq!(preview("short"), "short");
    }
}
