//! Connection and delivery counters
//!
//! One [`ClientMetrics`] is owned by each client and shared by `Arc` with
//! the driver task and the health server. Counters are relaxed atomics;
//! readers get a consistent-enough [`MetricsSnapshot`].

use crate::realtime::connection::ConnectionState;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Atomic counters for one client instance
#[derive(Debug)]
pub struct ClientMetrics {
    // Connection lifecycle
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    open_failures: AtomicU64,
    open_timeouts: AtomicU64,
    connections_lost: AtomicU64,
    heartbeat_timeouts: AtomicU64,
    attempts_exhausted: AtomicU64,
    state_transitions: AtomicU64,
    state: AtomicU8,
    connected_since: AtomicU64,

    // Traffic
    probes_sent: AtomicU64,
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    undecodable_frames: AtomicU64,
    last_activity: AtomicU64,

    // Fan-out
    events_dispatched: AtomicU64,
    deliveries: AtomicU64,
    subscriber_failures: AtomicU64,

    started_at: AtomicU64,
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self {
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            open_failures: AtomicU64::new(0),
            open_timeouts: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            heartbeat_timeouts: AtomicU64::new(0),
            attempts_exhausted: AtomicU64::new(0),
            state_transitions: AtomicU64::new(0),
            state: AtomicU8::new(ConnectionState::Disconnected.as_gauge()),
            connected_since: AtomicU64::new(0),
            probes_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            undecodable_frames: AtomicU64::new(0),
            last_activity: AtomicU64::new(0),
            events_dispatched: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            subscriber_failures: AtomicU64::new(0),
            started_at: AtomicU64::new(current_timestamp()),
        }
    }

    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected_since
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn open_failed(&self) {
        self.open_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn open_timed_out(&self) {
        self.open_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
        self.connected_since.store(0, Ordering::Relaxed);
    }

    pub fn heartbeat_timed_out(&self) {
        self.heartbeat_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn attempts_exhausted(&self) {
        self.attempts_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_state(&self, state: ConnectionState) {
        let previous = self.state.swap(state.as_gauge(), Ordering::Relaxed);
        if previous != state.as_gauge() {
            self.state_transitions.fetch_add(1, Ordering::Relaxed);
        }
        if state != ConnectionState::Connected {
            self.connected_since.store(0, Ordering::Relaxed);
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_gauge(self.state.load(Ordering::Relaxed))
    }

    pub fn probe_sent(&self) {
        self.probes_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an inbound frame and stamp last activity
    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.last_activity
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn undecodable_frame(&self) {
        self.undecodable_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of one fan-out
    pub fn event_dispatched(&self, delivered: usize, failed: usize) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
        self.deliveries
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.subscriber_failures
            .fetch_add(failed as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let connected_since = self.connected_since.load(Ordering::Relaxed);
        let last_activity = self.last_activity.load(Ordering::Relaxed);

        MetricsSnapshot {
            timestamp: now,
            uptime_seconds: now.saturating_sub(self.started_at.load(Ordering::Relaxed)),
            connection: ConnectionMetrics {
                state: self.state(),
                attempts: self.connection_attempts.load(Ordering::Relaxed),
                established: self.connections_established.load(Ordering::Relaxed),
                open_failures: self.open_failures.load(Ordering::Relaxed),
                open_timeouts: self.open_timeouts.load(Ordering::Relaxed),
                lost: self.connections_lost.load(Ordering::Relaxed),
                heartbeat_timeouts: self.heartbeat_timeouts.load(Ordering::Relaxed),
                attempts_exhausted: self.attempts_exhausted.load(Ordering::Relaxed),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
                connected_seconds: if connected_since > 0 {
                    now.saturating_sub(connected_since)
                } else {
                    0
                },
            },
            traffic: TrafficMetrics {
                probes_sent: self.probes_sent.load(Ordering::Relaxed),
                frames_received: self.frames_received.load(Ordering::Relaxed),
                frames_sent: self.frames_sent.load(Ordering::Relaxed),
                undecodable_frames: self.undecodable_frames.load(Ordering::Relaxed),
                last_activity: (last_activity > 0).then_some(last_activity),
            },
            dispatch: DispatchMetrics {
                events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
                deliveries: self.deliveries.load(Ordering::Relaxed),
                subscriber_failures: self.subscriber_failures.load(Ordering::Relaxed),
            },
        }
    }
}

/// Point-in-time view of [`ClientMetrics`]
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Unix seconds when the snapshot was taken
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub connection: ConnectionMetrics,
    pub traffic: TrafficMetrics,
    pub dispatch: DispatchMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub state: ConnectionState,
    pub attempts: u64,
    pub established: u64,
    pub open_failures: u64,
    pub open_timeouts: u64,
    pub lost: u64,
    pub heartbeat_timeouts: u64,
    pub attempts_exhausted: u64,
    pub state_transitions: u64,
    /// Seconds in the current `Connected` stretch, 0 otherwise
    pub connected_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrafficMetrics {
    pub probes_sent: u64,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub undecodable_frames: u64,
    /// Unix seconds of the last inbound frame
    pub last_activity: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchMetrics {
    pub events_dispatched: u64,
    pub deliveries: u64,
    pub subscriber_failures: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_metrics_are_zero() {
        let metrics = ClientMetrics::new();
        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.connection.state, ConnectionState::Disconnected);
        assert_eq!(snapshot.connection.attempts, 0);
        assert_eq!(snapshot.traffic.frames_received, 0);
        assert_eq!(snapshot.traffic.last_activity, None);
        assert_eq!(snapshot.dispatch.events_dispatched, 0);
    }

    #[test]
    fn test_connection_counters() {
        let metrics = ClientMetrics::new();

        metrics.connection_attempt();
        metrics.open_failed();
        metrics.connection_attempt();
        metrics.open_timed_out();
        metrics.connection_attempt();
        metrics.connection_established();
        metrics.connection_lost();
        metrics.heartbeat_timed_out();
        metrics.attempts_exhausted();

        let connection = metrics.snapshot().connection;
        assert_eq!(connection.attempts, 3);
        assert_eq!(connection.open_failures, 1);
        assert_eq!(connection.open_timeouts, 1);
        assert_eq!(connection.established, 1);
        assert_eq!(connection.lost, 1);
        assert_eq!(connection.heartbeat_timeouts, 1);
        assert_eq!(connection.attempts_exhausted, 1);
        assert_eq!(connection.connected_seconds, 0);
    }

    #[test]
    fn test_state_transitions_only_count_changes() {
        let metrics = ClientMetrics::new();

        metrics.set_state(ConnectionState::Connecting);
        metrics.set_state(ConnectionState::Connecting);
        metrics.set_state(ConnectionState::Connected);

        assert_eq!(metrics.state(), ConnectionState::Connected);
        assert_eq!(metrics.snapshot().connection.state_transitions, 2);
    }

    #[test]
    fn test_traffic_and_dispatch_counters() {
        let metrics = ClientMetrics::new();

        metrics.frame_received();
        metrics.frame_received();
        metrics.undecodable_frame();
        metrics.frame_sent();
        metrics.probe_sent();
        metrics.event_dispatched(2, 1);
        metrics.event_dispatched(3, 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.traffic.frames_received, 2);
        assert_eq!(snapshot.traffic.undecodable_frames, 1);
        assert_eq!(snapshot.traffic.frames_sent, 1);
        assert_eq!(snapshot.traffic.probes_sent, 1);
        assert!(snapshot.traffic.last_activity.is_some());
        assert_eq!(snapshot.dispatch.events_dispatched, 2);
        assert_eq!(snapshot.dispatch.deliveries, 5);
        assert_eq!(snapshot.dispatch.subscriber_failures, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = ClientMetrics::new();
        metrics.set_state(ConnectionState::Reconnecting);

        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["connection"]["state"], "Reconnecting");
        assert!(json["traffic"]["last_activity"].is_null());
    }
}
