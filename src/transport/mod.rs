//! Transport layer for the real-time stream
//!
//! A [`Transport`] opens one [`TransportSession`] per physical connection
//! attempt. Sessions report upward through a [`SessionEventSender`] with
//! exactly three notifications: `Opened`, `Message(frame)` and `Closed`.
//! `Closed` fires exactly once per session, whatever ended it.

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod websocket;

pub use websocket::WebSocketTransport;

/// Close code for an explicit, clean shutdown
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code reported when the connection dropped without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Close code used when the heartbeat declares the session dead
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4000;

/// Close code used when an open attempt is abandoned by the watchdog
pub const CLOSE_OPEN_TIMEOUT: u16 = 4001;

/// One unit of transport traffic
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    /// Transport-level ping control frame
    Ping(Bytes),
    /// Transport-level pong control frame
    Pong(Bytes),
}

impl Frame {
    pub fn text<S: Into<String>>(text: S) -> Self {
        Frame::Text(text.into())
    }

    /// Serialize a value as a JSON text frame
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_string(value).map(Frame::Text)
    }

    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) | Frame::Ping(bytes) | Frame::Pong(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn new<S: Into<String>>(code: u16, reason: S) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Termination without a close handshake (errors, resets, failed opens)
    pub fn abnormal<S: Into<String>>(reason: S) -> Self {
        Self::new(CLOSE_ABNORMAL, reason)
    }
}

/// Lifecycle notification emitted by a session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Opened,
    Message(Frame),
    Closed(CloseInfo),
}

/// Session notification tagged with the generation of the session that produced it
pub type GenerationEvent = (u64, SessionEvent);

/// Channel a transport uses to report session events upward
pub type SessionEventSender = mpsc::UnboundedSender<GenerationEvent>;

/// Receiving half of [`SessionEventSender`]
pub type SessionEventReceiver = mpsc::UnboundedReceiver<GenerationEvent>;

/// Transport errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("Session {generation} is closed")]
    SessionClosed { generation: u64 },
    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Factory for physical connection attempts
///
/// `open` must not block: the attempt proceeds in the background and its
/// outcome arrives as `Opened` or `Closed` on the event channel, tagged
/// with `generation`.
pub trait Transport: Send {
    fn open(&self, endpoint: &str, generation: u64) -> Box<dyn TransportSession>;
}

/// Handle to one physical connection attempt
///
/// Dropping the handle abandons the session without waiting for `Closed`.
pub trait TransportSession: Send {
    fn generation(&self) -> u64;

    /// Hand a frame to the transport for delivery
    fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Begin closing; `Closed` follows on the event channel
    fn close(&mut self, code: u16, reason: &str);
}
