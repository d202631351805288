//! Reconnection lifecycle tests
//!
//! Drives the connection state machine with a manual clock and a recording
//! transport, so every scenario is deterministic and runs without a network.

use riskstream::realtime::{
    BackoffPolicy, ClientNotice, ConnectionState, ConnectionStateMachine, ConnectionStatus,
    EventDispatcher, HeartbeatConfig, Input, StateMachineConfig, TimerKind,
};
use riskstream::testing::{ManualScheduler, MockTransport, RecordingSubscriber};
use riskstream::transport::{CloseInfo, Frame, SessionEvent};
use riskstream::observability::ClientMetrics;
use std::sync::Arc;
use std::time::Duration;

const ENDPOINT: &str = "ws://risk.internal:8000/ws/risk-stream";

struct Rig {
    machine: ConnectionStateMachine,
    transport: MockTransport,
    clock: ManualScheduler,
    dispatcher: Arc<EventDispatcher>,
}

impl Rig {
    fn new(max_attempts: u32) -> Self {
        let transport = MockTransport::new();
        let clock = ManualScheduler::new();
        let dispatcher = Arc::new(EventDispatcher::new());
        let config = StateMachineConfig {
            policy: BackoffPolicy {
                base_delay: Duration::from_millis(1_000),
                cap_delay: Duration::from_millis(30_000),
                jitter_fraction: 0.1,
                max_attempts,
            },
            heartbeat: HeartbeatConfig {
                probe_interval: Duration::from_millis(30_000),
                stale_after: Duration::from_millis(15_000),
            },
            open_timeout: Duration::from_millis(10_000),
        };
        let machine = ConnectionStateMachine::new(
            config,
            Box::new(transport.clone()),
            Box::new(clock.clone()),
            dispatcher.clone(),
            Arc::new(ClientMetrics::new()),
        );
        Self {
            machine,
            transport,
            clock,
            dispatcher,
        }
    }

    fn connect(&mut self) {
        self.machine.handle(Input::Connect {
            endpoint: ENDPOINT.to_string(),
        });
    }

    fn current_generation(&self) -> u64 {
        self.transport.last_session().expect("a session was opened").generation
    }

    fn emit(&mut self, generation: u64, event: SessionEvent) {
        self.machine.handle(Input::Session { generation, event });
    }

    fn open(&mut self) -> u64 {
        let generation = self.current_generation();
        self.emit(generation, SessionEvent::Opened);
        generation
    }

    fn refuse(&mut self) {
        let generation = self.current_generation();
        self.emit(
            generation,
            SessionEvent::Closed(CloseInfo::abnormal("open failed: connection refused")),
        );
    }

    /// Advance until the pending backoff fires
    fn wait_out_backoff(&mut self) {
        let Some(delay) = self
            .clock
            .pending()
            .into_iter()
            .find_map(|kind| match kind {
                TimerKind::Backoff { .. } => self.clock.remaining(kind),
                _ => None,
            })
        else {
            panic!("no backoff pending");
        };
        self.run_for(delay);
    }

    fn run_for(&mut self, duration: Duration) {
        let machine = &mut self.machine;
        self.clock
            .run_for(duration, |timer| machine.handle(Input::Timer(timer)));
    }
}

fn drain(notices: &mut tokio::sync::broadcast::Receiver<ClientNotice>) -> Vec<ClientNotice> {
    std::iter::from_fn(|| notices.try_recv().ok()).collect()
}

#[test]
fn test_double_connect_opens_single_session() {
    let mut rig = Rig::new(10);

    rig.connect();
    rig.connect();

    assert_eq!(rig.transport.open_count(), 1);
    assert_eq!(rig.machine.state(), ConnectionState::Connecting);
}

#[test]
fn test_exhaustion_after_three_failures_then_manual_retry() {
    let mut rig = Rig::new(3);
    let mut notices = rig.machine.notices();

    rig.connect();
    rig.refuse();
    rig.wait_out_backoff();
    rig.refuse();
    rig.wait_out_backoff();
    rig.refuse();

    assert_eq!(rig.machine.state(), ConnectionState::Failed);
    assert!(drain(&mut notices)
        .iter()
        .any(|notice| matches!(notice, ClientNotice::AttemptsExhausted { attempts: 3, .. })));

    // Nothing further happens on its own
    rig.run_for(Duration::from_secs(600));
    assert_eq!(rig.transport.open_count(), 3);
    assert_eq!(rig.machine.state(), ConnectionState::Failed);

    rig.connect();
    assert_eq!(
        rig.machine.status(),
        ConnectionStatus::new(ConnectionState::Connecting, 0)
    );
    assert_eq!(rig.transport.open_count(), 4);
}

#[test]
fn test_attempt_counter_resets_after_successful_reconnect() {
    let mut rig = Rig::new(10);
    rig.connect();
    let first = rig.open();

    rig.emit(first, SessionEvent::Closed(CloseInfo::abnormal("connection reset")));
    assert_eq!(
        rig.machine.status(),
        ConnectionStatus::new(ConnectionState::Reconnecting, 1)
    );

    rig.wait_out_backoff();
    rig.refuse();
    assert_eq!(rig.machine.attempt(), 2);

    rig.wait_out_backoff();
    assert_eq!(rig.machine.state(), ConnectionState::Connecting);
    rig.open();

    assert_eq!(
        rig.machine.status(),
        ConnectionStatus::new(ConnectionState::Connected, 0)
    );
}

#[test]
fn test_backoff_delays_stay_within_jitter_bounds() {
    let mut rig = Rig::new(10);
    rig.connect();

    for attempt in 1..=7u32 {
        rig.refuse();
        let delay = rig
            .clock
            .remaining(TimerKind::Backoff { attempt })
            .expect("backoff scheduled");

        let floor =
            Duration::from_millis(1_000 * 2u64.pow(attempt - 1)).min(Duration::from_secs(30));
        assert!(delay >= floor, "attempt {attempt}: {delay:?} below {floor:?}");
        assert!(delay <= floor.mul_f64(1.1), "attempt {attempt}: {delay:?} above jitter bound");

        rig.wait_out_backoff();
    }
}

#[test]
fn test_silent_connection_reconnects_exactly_once() {
    let mut rig = Rig::new(10);
    let mut notices = rig.machine.notices();
    rig.connect();
    rig.open();

    rig.run_for(Duration::from_secs(45));

    let reconnects = drain(&mut notices)
        .into_iter()
        .filter(|notice| {
            matches!(
                notice,
                ClientNotice::StateChanged {
                    from: ConnectionState::Connected,
                    to: ConnectionState::Reconnecting,
                    ..
                }
            )
        })
        .count();
    assert_eq!(reconnects, 1);
    assert_eq!(rig.machine.state(), ConnectionState::Reconnecting);
}

#[test]
fn test_steady_traffic_keeps_session_alive() {
    let mut rig = Rig::new(10);
    rig.connect();
    let generation = rig.open();

    // A data frame every 10s, no probe replies at all
    for _ in 0..30 {
        rig.run_for(Duration::from_secs(10));
        rig.emit(
            generation,
            SessionEvent::Message(Frame::text(r#"{"type":"risk_update","data":{}}"#)),
        );
    }

    assert_eq!(rig.machine.state(), ConnectionState::Connected);
    assert_eq!(rig.transport.open_count(), 1);
}

#[test]
fn test_late_probe_reply_from_old_generation_is_ignored() {
    let mut rig = Rig::new(10);
    rig.connect();
    let old = rig.open();
    rig.run_for(Duration::from_secs(45));
    rig.emit(old, SessionEvent::Closed(CloseInfo::new(4000, "heartbeat timeout")));

    rig.wait_out_backoff();
    let new = rig.open();
    assert_ne!(old, new);

    rig.emit(old, SessionEvent::Message(Frame::text("pong")));
    rig.emit(old, SessionEvent::Closed(CloseInfo::abnormal("late")));

    assert_eq!(
        rig.machine.status(),
        ConnectionStatus::new(ConnectionState::Connected, 0)
    );
    assert_eq!(rig.machine.session_generation(), Some(new));
}

#[test]
fn test_disconnect_during_connecting_discards_late_open() {
    let mut rig = Rig::new(10);
    rig.connect();
    let generation = rig.current_generation();

    rig.machine.handle(Input::Disconnect {
        reason: "user navigated away".to_string(),
    });
    rig.emit(generation, SessionEvent::Opened);
    rig.run_for(Duration::from_secs(60));

    assert_eq!(rig.machine.state(), ConnectionState::Disconnected);
    assert!(!rig.machine.heartbeat_running());
    assert_eq!(rig.transport.open_count(), 1);
}

#[test]
fn test_disconnect_during_backoff_cancels_retry() {
    let mut rig = Rig::new(10);
    rig.connect();
    rig.refuse();
    assert_eq!(rig.machine.state(), ConnectionState::Reconnecting);

    rig.machine.disconnect("stop");
    rig.run_for(Duration::from_secs(60));

    assert_eq!(rig.machine.status(), ConnectionStatus::default());
    assert_eq!(rig.transport.open_count(), 1);
    assert!(rig.clock.pending().is_empty());
}

#[test]
fn test_only_one_session_is_live_at_a_time() {
    let mut rig = Rig::new(10);
    rig.connect();

    for _ in 0..5 {
        let generation = rig.open();
        rig.emit(generation, SessionEvent::Closed(CloseInfo::abnormal("flaky network")));
        rig.wait_out_backoff();
    }

    // Every session but the newest was released before the next one opened
    let sessions = rig.transport.sessions();
    assert_eq!(sessions.len(), 6);
    assert!(sessions[..5].iter().all(|record| record.dropped));
    assert!(!sessions[5].dropped);
}

#[test]
fn test_subscriptions_outlive_reconnects() {
    let mut rig = Rig::new(10);
    let recorder = RecordingSubscriber::new();
    rig.dispatcher.subscribe("risk", recorder.clone()).unwrap();
    rig.connect();

    for round in 0..3 {
        let generation = rig.open();
        rig.emit(
            generation,
            SessionEvent::Message(Frame::text(format!(
                r#"{{"type":"risk","data":{{"round":{round}}}}}"#
            ))),
        );
        rig.emit(generation, SessionEvent::Closed(CloseInfo::abnormal("drop")));
        rig.wait_out_backoff();
    }

    assert_eq!(recorder.count(), 3);
}
