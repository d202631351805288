//! Connection state machine
//!
//! Owns at most one transport session, the heartbeat monitor and all
//! lifecycle timers. It performs no I/O and never waits: the driver feeds it
//! [`Input`]s one at a time and it reacts synchronously by opening or closing
//! sessions, scheduling timers and publishing status.
//!
//! Every session and its timers carry a generation number. Events and timers
//! from any generation other than the live one are dropped, which is how late
//! opens, late probe replies and cancel/fire races are discarded.

use super::backoff::{BackoffPolicy, ReconnectionDecision};
use super::connection::{log_state_transition, ClientNotice, ConnectionState, ConnectionStatus};
use super::dispatcher::EventDispatcher;
use super::heartbeat::{HeartbeatConfig, HeartbeatMonitor, StaleVerdict};
use super::message_handler::{FrameRoute, MessageHandler};
use super::scheduler::{FiredTimer, Scheduler, TimerId, TimerKind};
use crate::config::ClientConfig;
use crate::error::{sanitize_error_message, ClientError, ConnectionFailure};
use crate::observability::metrics::ClientMetrics;
use crate::protocol::PROBE_REQUEST;
use crate::transport::{
    CloseInfo, Frame, SessionEvent, Transport, TransportSession, CLOSE_HEARTBEAT_TIMEOUT,
    CLOSE_NORMAL, CLOSE_OPEN_TIMEOUT,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, trace, warn};

/// Capacity of the lifecycle notice channel
const NOTICE_CAPACITY: usize = 64;

/// Timing and retry parameters
#[derive(Debug, Clone, PartialEq)]
pub struct StateMachineConfig {
    pub policy: BackoffPolicy,
    pub heartbeat: HeartbeatConfig,
    pub open_timeout: Duration,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            policy: BackoffPolicy::default(),
            heartbeat: HeartbeatConfig::default(),
            open_timeout: Duration::from_millis(10_000),
        }
    }
}

impl From<&ClientConfig> for StateMachineConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            policy: config.backoff_policy(),
            heartbeat: config.heartbeat_config(),
            open_timeout: config.open_timeout(),
        }
    }
}

/// Everything the state machine reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Connect { endpoint: String },
    Disconnect { reason: String },
    Session { generation: u64, event: SessionEvent },
    Timer(FiredTimer),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    /// Open requested, outcome pending
    Opening,
    Open,
    /// Close requested, waiting for `Closed`
    Closing,
}

struct ActiveSession {
    generation: u64,
    handle: Box<dyn TransportSession>,
    phase: SessionPhase,
}

pub struct ConnectionStateMachine {
    transport: Box<dyn Transport>,
    scheduler: Box<dyn Scheduler>,
    dispatcher: Arc<EventDispatcher>,
    metrics: Arc<ClientMetrics>,
    policy: BackoffPolicy,
    open_timeout: Duration,
    heartbeat: HeartbeatMonitor,
    status_tx: watch::Sender<ConnectionStatus>,
    notices_tx: broadcast::Sender<ClientNotice>,

    state: ConnectionState,
    attempt: u32,
    endpoint: Option<String>,
    next_generation: u64,
    session: Option<ActiveSession>,
    /// Generation waiting for the previous session to finish closing
    deferred_open: Option<u64>,
    open_timer: Option<TimerId>,
    backoff_timer: Option<TimerId>,
}

impl ConnectionStateMachine {
    pub fn new(
        config: StateMachineConfig,
        transport: Box<dyn Transport>,
        scheduler: Box<dyn Scheduler>,
        dispatcher: Arc<EventDispatcher>,
        metrics: Arc<ClientMetrics>,
    ) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::default());
        let (notices_tx, _) = broadcast::channel(NOTICE_CAPACITY);

        Self {
            transport,
            scheduler,
            dispatcher,
            metrics,
            policy: config.policy,
            open_timeout: config.open_timeout,
            heartbeat: HeartbeatMonitor::new(config.heartbeat),
            status_tx,
            notices_tx,
            state: ConnectionState::Disconnected,
            attempt: 0,
            endpoint: None,
            next_generation: 1,
            session: None,
            deferred_open: None,
            open_timer: None,
            backoff_timer: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::new(self.state, self.attempt)
    }

    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<ClientNotice> {
        self.notices_tx.subscribe()
    }

    /// Sending half of the notice channel, for handing out receivers later
    pub fn notice_sender(&self) -> &broadcast::Sender<ClientNotice> {
        &self.notices_tx
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Generation of the session currently held, in any phase
    pub fn session_generation(&self) -> Option<u64> {
        self.session.as_ref().map(|session| session.generation)
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn heartbeat_running(&self) -> bool {
        self.heartbeat.is_running()
    }

    pub fn handle(&mut self, input: Input) {
        match input {
            Input::Connect { endpoint } => self.connect(endpoint),
            Input::Disconnect { reason } => self.disconnect(&reason),
            Input::Session { generation, event } => self.on_session_event(generation, event),
            Input::Timer((id, kind)) => self.on_timer(id, kind),
        }
    }

    /// Start a connection cycle; no-op while one is already live
    pub fn connect(&mut self, endpoint: String) {
        if self.state.is_cycle_active() {
            debug!(state = %self.state, "Connect ignored, connection cycle already active");
            return;
        }

        info!(endpoint = %sanitize_error_message(&endpoint), "Connecting to event stream");
        self.endpoint = Some(endpoint);
        self.attempt = 0;
        self.set_state(ConnectionState::Connecting);
        self.begin_attempt();
    }

    /// End the cycle: cancel timers, close the session, go `Disconnected`
    pub fn disconnect(&mut self, reason: &str) {
        self.cancel_timers();
        self.heartbeat.stop(self.scheduler.as_ref());
        self.deferred_open = None;

        if let Some(session) = self.session.as_mut() {
            if session.phase != SessionPhase::Closing {
                session.handle.close(CLOSE_NORMAL, reason);
                session.phase = SessionPhase::Closing;
            }
        }

        if self.state != ConnectionState::Disconnected {
            info!(reason, "Disconnect requested");
        }
        self.attempt = 0;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Hand a frame to the transport; only accepted while `Connected`
    pub fn send(&mut self, frame: Frame) -> Result<(), ClientError> {
        if self.state != ConnectionState::Connected {
            return Err(ClientError::NotConnected { state: self.state });
        }
        let Some(session) = self
            .session
            .as_mut()
            .filter(|session| session.phase == SessionPhase::Open)
        else {
            return Err(ClientError::NotConnected { state: self.state });
        };

        session.handle.send(frame)?;
        self.metrics.frame_sent();
        Ok(())
    }

    /// Drop the session handle without waiting for its close handshake
    pub fn abandon_session(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(generation = session.generation, "Abandoning session");
        }
        self.deferred_open = None;
    }

    fn begin_attempt(&mut self) {
        let generation = self.next_generation;
        self.next_generation += 1;

        self.metrics.connection_attempt();
        self.open_timer = Some(
            self.scheduler
                .schedule(self.open_timeout, TimerKind::OpenTimeout { generation }),
        );

        match &self.session {
            None => self.open_session(generation),
            Some(previous) => {
                debug!(
                    generation,
                    previous = previous.generation,
                    "Previous session still closing, deferring open"
                );
                self.deferred_open = Some(generation);
            }
        }
    }

    fn open_session(&mut self, generation: u64) {
        let Some(endpoint) = self.endpoint.as_deref() else {
            return;
        };
        debug!(generation, "Opening transport session");
        let handle = self.transport.open(endpoint, generation);
        self.session = Some(ActiveSession {
            generation,
            handle,
            phase: SessionPhase::Opening,
        });
    }

    fn on_session_event(&mut self, generation: u64, event: SessionEvent) {
        let Some(phase) = self
            .session
            .as_ref()
            .filter(|session| session.generation == generation)
            .map(|session| session.phase)
        else {
            trace!(generation, "Ignoring event from stale session");
            return;
        };

        match (phase, event) {
            (SessionPhase::Opening, SessionEvent::Opened) => self.on_opened(generation),
            (SessionPhase::Opening, SessionEvent::Closed(info)) => {
                self.session = None;
                self.handle_failure(ConnectionFailure::TransportOpenFailure {
                    reason: sanitize_error_message(&info.reason),
                });
            }
            (SessionPhase::Open, SessionEvent::Message(frame)) => self.on_frame(generation, frame),
            (SessionPhase::Open, SessionEvent::Closed(CloseInfo { code, reason })) => {
                self.session = None;
                self.handle_failure(ConnectionFailure::TransportClosed {
                    code,
                    reason: sanitize_error_message(&reason),
                });
            }
            (SessionPhase::Closing, SessionEvent::Closed(_)) => {
                self.session = None;
                if let Some(deferred) = self.deferred_open.take() {
                    self.open_session(deferred);
                }
            }
            (phase, event) => {
                trace!(generation, ?phase, ?event, "Ignoring session event");
            }
        }
    }

    fn on_opened(&mut self, generation: u64) {
        if let Some(session) = self.session.as_mut() {
            session.phase = SessionPhase::Open;
        }
        if let Some(id) = self.open_timer.take() {
            self.scheduler.cancel(id);
        }

        self.metrics.connection_established();
        self.heartbeat.start(generation, self.scheduler.as_ref());
        self.attempt = 0;
        self.set_state(ConnectionState::Connected);
    }

    fn on_frame(&mut self, generation: u64, frame: Frame) {
        self.metrics.frame_received();
        self.heartbeat.record_activity(generation, self.scheduler.now());

        match MessageHandler::route_frame(frame) {
            FrameRoute::Event(event) => {
                let report = self.dispatcher.dispatch(&event);
                self.metrics.event_dispatched(report.delivered, report.failed);
            }
            FrameRoute::ProbeReply => trace!(generation, "Probe reply received"),
            FrameRoute::ControlFrame => trace!(generation, "Control frame received"),
            FrameRoute::Undecodable(_) => self.metrics.undecodable_frame(),
        }
    }

    fn on_timer(&mut self, id: TimerId, kind: TimerKind) {
        match kind {
            TimerKind::OpenTimeout { generation } => {
                if self.open_timer != Some(id) {
                    return;
                }
                self.open_timer = None;
                self.on_open_timeout(generation);
            }
            TimerKind::Backoff { attempt } => {
                if self.backoff_timer != Some(id) || self.state != ConnectionState::Reconnecting {
                    return;
                }
                self.backoff_timer = None;
                debug!(attempt, "Backoff elapsed");
                self.set_state(ConnectionState::Connecting);
                self.begin_attempt();
            }
            TimerKind::HeartbeatProbe { generation } => {
                if self
                    .heartbeat
                    .on_probe_tick(id, generation, self.scheduler.as_ref())
                {
                    self.send_probe(generation);
                }
            }
            TimerKind::StaleCheck { generation } => {
                let verdict =
                    self.heartbeat.on_stale_check(id, generation, self.scheduler.as_ref());
                if let StaleVerdict::Stale { silent_for } = verdict {
                    self.close_session(generation, CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout");
                    self.handle_failure(ConnectionFailure::HeartbeatTimeout { silent_for });
                }
            }
        }
    }

    fn on_open_timeout(&mut self, generation: u64) {
        if self.state != ConnectionState::Connecting {
            return;
        }

        if self.deferred_open == Some(generation) {
            // The previous session never finished closing; give up on it
            self.deferred_open = None;
            self.abandon_session();
        } else {
            self.close_session(generation, CLOSE_OPEN_TIMEOUT, "open timeout");
        }

        self.handle_failure(ConnectionFailure::OpenTimeout {
            after: self.open_timeout,
        });
    }

    fn send_probe(&mut self, generation: u64) {
        let Some(session) = self.session.as_mut().filter(|session| {
            session.generation == generation && session.phase == SessionPhase::Open
        }) else {
            return;
        };

        match session.handle.send(Frame::text(PROBE_REQUEST)) {
            Ok(()) => {
                self.metrics.probe_sent();
                trace!(generation, "Probe sent");
            }
            Err(e) => debug!(generation, error = %e, "Probe could not be sent"),
        }
    }

    fn close_session(&mut self, generation: u64, code: u16, reason: &str) {
        if let Some(session) = self
            .session
            .as_mut()
            .filter(|session| session.generation == generation)
        {
            if session.phase != SessionPhase::Closing {
                session.handle.close(code, reason);
                session.phase = SessionPhase::Closing;
            }
        }
    }

    /// Single entry point for every recoverable failure
    fn handle_failure(&mut self, failure: ConnectionFailure) {
        self.heartbeat.stop(self.scheduler.as_ref());
        if let Some(id) = self.open_timer.take() {
            self.scheduler.cancel(id);
        }

        let decision = match &failure {
            ConnectionFailure::TransportOpenFailure { .. } => {
                self.metrics.open_failed();
                self.attempt += 1;
                self.policy.after_failures(self.attempt)
            }
            ConnectionFailure::OpenTimeout { .. } => {
                self.metrics.open_timed_out();
                self.attempt += 1;
                self.policy.after_failures(self.attempt)
            }
            ConnectionFailure::TransportClosed { .. } => {
                self.metrics.connection_lost();
                self.attempt = 1;
                ReconnectionDecision::Proceed(self.policy.decision_for(1))
            }
            ConnectionFailure::HeartbeatTimeout { .. } => {
                self.metrics.heartbeat_timed_out();
                self.metrics.connection_lost();
                self.attempt = 1;
                ReconnectionDecision::Proceed(self.policy.decision_for(1))
            }
        };

        warn!(
            kind = failure.kind(),
            attempt = self.attempt,
            error = %failure,
            "Connection failure"
        );

        match decision {
            ReconnectionDecision::Proceed(backoff) => {
                self.set_state(ConnectionState::Reconnecting);
                info!(
                    attempt = backoff.attempt,
                    delay_ms = backoff.delay.as_millis() as u64,
                    "Reconnection scheduled"
                );
                self.backoff_timer = Some(self.scheduler.schedule(
                    backoff.delay,
                    TimerKind::Backoff {
                        attempt: backoff.attempt,
                    },
                ));
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                self.metrics.attempts_exhausted();
                self.set_state(ConnectionState::Failed);
                let _ = self.notices_tx.send(ClientNotice::AttemptsExhausted {
                    attempts: self.attempt,
                    last_failure: failure,
                });
            }
        }
    }

    fn cancel_timers(&mut self) {
        for id in [self.open_timer.take(), self.backoff_timer.take()]
            .into_iter()
            .flatten()
        {
            self.scheduler.cancel(id);
        }
    }

    fn set_state(&mut self, to: ConnectionState) {
        let from = self.state;
        self.state = to;
        if from == ConnectionState::Connected && to != ConnectionState::Connected {
            self.heartbeat.stop(self.scheduler.as_ref());
        }

        let status = self.status();
        self.status_tx.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
        self.metrics.set_state(to);

        if from != to {
            log_state_transition(from, to, self.attempt);
            let _ = self.notices_tx.send(ClientNotice::StateChanged {
                from,
                to,
                attempt: self.attempt,
            });
        }
    }
}

impl Drop for ConnectionStateMachine {
    fn drop(&mut self) {
        self.cancel_timers();
        self.heartbeat.stop(self.scheduler.as_ref());
    }
}
