//! Riskstream - resilient real-time client for the risk stream backend
//!
//! Keeps one logical WebSocket stream alive on top of a transport that drops,
//! stalls and half-opens, and fans decoded events out to per-topic
//! subscribers.
//!
//! # Overview
//!
//! - Connection lifecycle state machine with exactly one live session
//! - Application-level heartbeat that detects silent connections
//! - Exponential backoff with jitter and a retry ceiling
//! - Topic subscriptions that survive reconnects, with per-subscriber isolation
//! - Structured logging, per-client metrics and an optional health endpoint
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use riskstream::{ClientConfig, ConnectionState, DomainEvent, RealtimeClient, SubscriberError};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = RealtimeClient::new(ClientConfig::default())?;
//!
//! client.subscribe("risk_update", |event: &DomainEvent| -> Result<(), SubscriberError> {
//!     println!("risk update: {}", event.payload);
//!     Ok(())
//! })?;
//!
//! client.connect("ws://localhost:8000/ws/risk-stream")?;
//! client
//!     .wait_for_state(ConnectionState::Connected, Duration::from_secs(10))
//!     .await?;
//!
//! client.send_text("hello").await?;
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod realtime;
pub mod testing;
pub mod transport;

pub use config::{ClientConfig, ConfigError, DEFAULT_ENDPOINT};
pub use error::{ClientError, ClientResult, ConnectionFailure, SubscriberError};
pub use protocol::{DomainEvent, TopicError};
pub use realtime::{
    ClientNotice, ConnectionState, ConnectionStatus, RealtimeClient, Subscriber, SubscriptionId,
};
pub use transport::Frame;
