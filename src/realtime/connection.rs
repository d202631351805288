//! Connection state, status reporting and endpoint validation
//!
//! Pure types and functions shared by the state machine and the facade.

use crate::error::{ClientError, ConnectionFailure};
use serde::Serialize;
use std::fmt;
use tracing::{error, info, warn};
use url::Url;

/// Lifecycle state of the real-time connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    /// Idle; no session and no pending attempt
    Disconnected,
    /// A transport session is being opened
    Connecting,
    /// Session open and heartbeat running
    Connected,
    /// Waiting out a backoff delay before the next attempt
    Reconnecting,
    /// Attempt ceiling reached; only an explicit connect restarts the cycle
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting => "Reconnecting",
            ConnectionState::Failed => "Failed",
        }
    }

    /// Numeric encoding used by the metrics gauge
    pub fn as_gauge(&self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Reconnecting => 3,
            ConnectionState::Failed => 4,
        }
    }

    pub fn from_gauge(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            4 => ConnectionState::Failed,
            _ => ConnectionState::Disconnected,
        }
    }

    /// Whether a connect request should be ignored in this state
    pub fn is_cycle_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot returned by `status()`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Consecutive failed attempts in the current cycle
    pub attempt: u32,
}

impl ConnectionStatus {
    pub fn new(state: ConnectionState, attempt: u32) -> Self {
        Self { state, attempt }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new(ConnectionState::Disconnected, 0)
    }
}

/// Lifecycle notifications broadcast to the application
#[derive(Debug, Clone, PartialEq)]
pub enum ClientNotice {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
        attempt: u32,
    },
    /// The cycle gave up; a manual `connect()` is required
    AttemptsExhausted {
        attempts: u32,
        last_failure: ConnectionFailure,
    },
}

/// Check that an endpoint is an absolute `ws://` or `wss://` URL
///
/// `wss://` is only accepted when the `tls` feature is enabled; without it
/// every open would fail the TLS handshake.
pub fn validate_endpoint(endpoint: &str) -> Result<Url, ClientError> {
    let url = Url::parse(endpoint)
        .map_err(|e| ClientError::invalid_endpoint(format!("{endpoint}: {e}")))?;

    match url.scheme() {
        "ws" => {}
        "wss" if cfg!(feature = "tls") => {}
        "wss" => {
            return Err(ClientError::invalid_endpoint(format!(
                "{endpoint}: wss requires the `tls` feature"
            )))
        }
        other => {
            return Err(ClientError::invalid_endpoint(format!(
                "{endpoint}: unsupported scheme '{other}', expected ws or wss"
            )))
        }
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(ClientError::invalid_endpoint(format!(
            "{endpoint}: missing host"
        )));
    }

    Ok(url)
}

/// Log a state transition at a level matching its severity
pub fn log_state_transition(from: ConnectionState, to: ConnectionState, attempt: u32) {
    match (from, to) {
        (ConnectionState::Connecting, ConnectionState::Connected) => {
            info!("Real-time connection established");
        }
        (ConnectionState::Connected, ConnectionState::Reconnecting) => {
            warn!("Real-time connection lost, scheduling reconnection");
        }
        (ConnectionState::Connecting, ConnectionState::Reconnecting) => {
            warn!(attempt, "Connection attempt failed, backing off");
        }
        (ConnectionState::Reconnecting, ConnectionState::Connecting) => {
            info!(attempt, "Starting reconnection attempt");
        }
        (_, ConnectionState::Failed) => {
            error!(attempt, "Real-time connection failed permanently");
        }
        (_, ConnectionState::Disconnected) => {
            info!("Real-time connection closed");
        }
        _ => {
            info!("Connection state: {} -> {}", from, to);
        }
    }
}
