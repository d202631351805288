//! Error types for the real-time stream client
//!
//! Public API failures surface as [`ClientError`]. Connection-level failures
//! that the state machine recovers from on its own are modelled as
//! [`ConnectionFailure`] and are only observable through status changes.

use crate::config::ConfigError;
use crate::protocol::TopicError;
use crate::realtime::connection::ConnectionState;
use crate::transport::TransportError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by the public facade
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Not connected - current state: {state}")]
    NotConnected { state: ConnectionState },

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Client driver is not running")]
    DriverStopped,

    #[error("Timed out after {waited:?} waiting for {expected}, last observed {observed}")]
    WaitTimeout {
        expected: ConnectionState,
        observed: ConnectionState,
        waited: Duration,
    },
}

impl ClientError {
    /// Create invalid endpoint error
    pub fn invalid_endpoint<S: Into<String>>(message: S) -> Self {
        Self::InvalidEndpoint(message.into())
    }
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Failure shapes that drive the state machine into `Reconnecting` or `Failed`
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectionFailure {
    /// Network, DNS or handshake failure while connecting
    #[error("transport open failed: {reason}")]
    TransportOpenFailure { reason: String },

    /// The open neither succeeded nor failed within the open timeout
    #[error("transport open timed out after {after:?}")]
    OpenTimeout { after: Duration },

    /// Session ended after it had been open
    #[error("transport closed (code {code}): {reason}")]
    TransportClosed { code: u16, reason: String },

    /// No inbound traffic within the staleness window
    #[error("heartbeat timeout: no inbound activity for {silent_for:?}")]
    HeartbeatTimeout { silent_for: Duration },
}

impl ConnectionFailure {
    /// Short machine-readable label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionFailure::TransportOpenFailure { .. } => "transport_open_failure",
            ConnectionFailure::OpenTimeout { .. } => "open_timeout",
            ConnectionFailure::TransportClosed { .. } => "transport_closed",
            ConnectionFailure::HeartbeatTimeout { .. } => "heartbeat_timeout",
        }
    }
}

/// Error reported by a subscriber callback
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SubscriberError {
    pub message: String,
}

impl SubscriberError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }
}

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*[^\s&]+").ok());

static USERINFO_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(wss?://)[^/@\s]+@").ok());

const MAX_REASON_LEN: usize = 500;

/// Redact credentials from transport error text before it is logged or stored
///
/// Endpoints frequently carry tokens in query strings or userinfo, and
/// tungstenite echoes the request URL back in its errors.
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(pattern) = SECRET_PATTERN.as_ref() {
        sanitized = pattern.replace_all(&sanitized, "${1}=***").to_string();
    }

    if let Some(pattern) = USERINFO_PATTERN.as_ref() {
        sanitized = pattern.replace_all(&sanitized, "${1}***@").to_string();
    }

    if sanitized.len() > MAX_REASON_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_REASON_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}
