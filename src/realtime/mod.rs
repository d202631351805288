//! Real-time connection management
//!
//! Lifecycle state machine, heartbeat, reconnection backoff and topic
//! fan-out, plus the async [`RealtimeClient`] facade that drives them.

pub mod backoff;
pub mod client;
pub mod connection;
pub mod dispatcher;
pub mod heartbeat;
pub mod message_handler;
pub mod scheduler;
pub mod state_machine;

pub use backoff::{BackoffDecision, BackoffPolicy, ReconnectionDecision};
pub use client::RealtimeClient;
pub use connection::{validate_endpoint, ClientNotice, ConnectionState, ConnectionStatus};
pub use dispatcher::{DispatchReport, EventDispatcher, Subscriber, SubscriptionId};
pub use heartbeat::{HeartbeatConfig, HeartbeatMonitor, StaleVerdict};
pub use message_handler::{FrameRoute, MessageHandler};
pub use scheduler::{FiredTimer, Scheduler, TimerId, TimerKind, TokioScheduler};
pub use state_machine::{ConnectionStateMachine, Input, StateMachineConfig};
