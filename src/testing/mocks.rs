//! Test doubles: manual clock, recording transport and canned subscribers
//!
//! All doubles are cheap `Clone` handles over shared state, so a test keeps
//! one handle for assertions and gives another to the code under test.

use crate::error::SubscriberError;
use crate::protocol::DomainEvent;
use crate::realtime::dispatcher::Subscriber;
use crate::realtime::scheduler::{FiredTimer, Scheduler, TimerId, TimerKind};
use crate::transport::{
    CloseInfo, Frame, SessionEvent, SessionEventSender, Transport, TransportError,
    TransportSession,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Manual scheduler
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PendingTimer {
    deadline: Duration,
    id: TimerId,
    kind: TimerKind,
}

#[derive(Debug)]
struct ManualClock {
    origin: Instant,
    elapsed: Duration,
    next_id: u64,
    timers: Vec<PendingTimer>,
}

impl ManualClock {
    /// Remove the earliest timer due at or before `limit`, moving the clock to it
    fn pop_due(&mut self, limit: Duration) -> Option<FiredTimer> {
        let index = self
            .timers
            .iter()
            .enumerate()
            .filter(|(_, timer)| timer.deadline <= limit)
            .min_by_key(|(_, timer)| (timer.deadline, timer.id))
            .map(|(index, _)| index)?;
        let timer = self.timers.remove(index);
        self.elapsed = self.elapsed.max(timer.deadline);
        Some((timer.id, timer.kind))
    }

    fn sorted(&self) -> Vec<&PendingTimer> {
        let mut timers: Vec<&PendingTimer> = self.timers.iter().collect();
        timers.sort_by_key(|timer| (timer.deadline, timer.id));
        timers
    }
}

/// Fake clock whose timers fire only when the test advances it
#[derive(Debug, Clone)]
pub struct ManualScheduler {
    clock: Arc<Mutex<ManualClock>>,
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(Mutex::new(ManualClock {
                origin: Instant::now(),
                elapsed: Duration::ZERO,
                next_id: 1,
                timers: Vec::new(),
            })),
        }
    }

    /// Time since the scheduler was created
    pub fn elapsed(&self) -> Duration {
        lock(&self.clock).elapsed
    }

    /// Move the clock forward and return every timer that came due, in deadline order
    pub fn advance(&self, by: Duration) -> Vec<FiredTimer> {
        let mut clock = lock(&self.clock);
        let target = clock.elapsed + by;
        let mut fired = Vec::new();
        while let Some(timer) = clock.pop_due(target) {
            fired.push(timer);
        }
        clock.elapsed = target;
        fired
    }

    /// Jump to the earliest pending timer and fire it
    pub fn advance_to_next(&self) -> Option<FiredTimer> {
        let mut clock = lock(&self.clock);
        let deadline = clock.timers.iter().map(|timer| timer.deadline).min()?;
        clock.pop_due(deadline)
    }

    /// Advance by `duration`, handing each due timer to `on_fire` as it comes due
    ///
    /// Timers scheduled from inside `on_fire` are honoured if they fall
    /// within the window, and the clock reads the firing deadline while the
    /// callback runs.
    pub fn run_for(&self, duration: Duration, mut on_fire: impl FnMut(FiredTimer)) {
        let target = self.elapsed() + duration;
        loop {
            let next = lock(&self.clock).pop_due(target);
            match next {
                Some(timer) => on_fire(timer),
                None => break,
            }
        }
        let mut clock = lock(&self.clock);
        clock.elapsed = clock.elapsed.max(target);
    }

    /// Kinds of pending timers, in deadline order
    pub fn pending(&self) -> Vec<TimerKind> {
        lock(&self.clock)
            .sorted()
            .into_iter()
            .map(|timer| timer.kind)
            .collect()
    }

    /// Ids of pending timers, in deadline order
    pub fn pending_ids(&self) -> Vec<TimerId> {
        lock(&self.clock)
            .sorted()
            .into_iter()
            .map(|timer| timer.id)
            .collect()
    }

    /// Delay until the pending timer of `kind` fires, if one exists
    pub fn remaining(&self, kind: TimerKind) -> Option<Duration> {
        let clock = lock(&self.clock);
        clock
            .timers
            .iter()
            .find(|timer| timer.kind == kind)
            .map(|timer| timer.deadline.saturating_sub(clock.elapsed))
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> Instant {
        let clock = lock(&self.clock);
        clock.origin + clock.elapsed
    }

    fn schedule(&self, delay: Duration, kind: TimerKind) -> TimerId {
        let mut clock = lock(&self.clock);
        let id = TimerId(clock.next_id);
        clock.next_id += 1;
        let deadline = clock.elapsed + delay;
        clock.timers.push(PendingTimer { deadline, id, kind });
        id
    }

    fn cancel(&self, id: TimerId) {
        lock(&self.clock).timers.retain(|timer| timer.id != id);
    }
}

// ---------------------------------------------------------------------------
// Mock transport
// ---------------------------------------------------------------------------

/// Everything that happened to one mock session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub endpoint: String,
    pub generation: u64,
    pub sent: Vec<Frame>,
    pub closes: Vec<CloseInfo>,
    pub dropped: bool,
}

#[derive(Debug, Default)]
struct MockState {
    sessions: Vec<SessionRecord>,
    events: Option<SessionEventSender>,
    auto_open: bool,
    echo_close: bool,
    reject_sends: bool,
}

/// Transport that records opens, sends and closes
///
/// By default it reports nothing; tests drive session events by hand. With
/// an attached event channel it can open sessions and echo closes on its
/// own, which is what the facade tests use.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `Opened` immediately after every open (needs an event channel)
    pub fn with_auto_open(self) -> Self {
        lock(&self.state).auto_open = true;
        self
    }

    /// Report `Closed` with the requested code whenever a session is closed
    pub fn with_echo_close(self) -> Self {
        lock(&self.state).echo_close = true;
        self
    }

    /// Fail every `send` with `SendFailed`
    pub fn with_rejected_sends(self) -> Self {
        lock(&self.state).reject_sends = true;
        self
    }

    /// Connect the mock to the channel its sessions report on
    pub fn attach(&self, events: SessionEventSender) {
        lock(&self.state).events = Some(events);
    }

    pub fn open_count(&self) -> usize {
        lock(&self.state).sessions.len()
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        lock(&self.state).sessions.clone()
    }

    pub fn session(&self, generation: u64) -> Option<SessionRecord> {
        lock(&self.state)
            .sessions
            .iter()
            .find(|record| record.generation == generation)
            .cloned()
    }

    pub fn last_session(&self) -> Option<SessionRecord> {
        lock(&self.state).sessions.last().cloned()
    }

    /// Text frames sent on session `generation`
    pub fn sent_text(&self, generation: u64) -> Vec<String> {
        self.session(generation)
            .map(|record| {
                record
                    .sent
                    .into_iter()
                    .filter_map(|frame| match frame {
                        Frame::Text(text) => Some(text),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Push a session event through the attached channel
    pub fn emit(&self, generation: u64, event: SessionEvent) -> bool {
        lock(&self.state)
            .events
            .as_ref()
            .is_some_and(|events| events.send((generation, event)).is_ok())
    }
}

impl Transport for MockTransport {
    fn open(&self, endpoint: &str, generation: u64) -> Box<dyn TransportSession> {
        let mut state = lock(&self.state);
        state.sessions.push(SessionRecord {
            endpoint: endpoint.to_string(),
            generation,
            sent: Vec::new(),
            closes: Vec::new(),
            dropped: false,
        });
        if state.auto_open {
            if let Some(events) = &state.events {
                let _ = events.send((generation, SessionEvent::Opened));
            }
        }
        drop(state);

        Box::new(MockSession {
            generation,
            state: self.state.clone(),
            closed: false,
        })
    }
}

struct MockSession {
    generation: u64,
    state: Arc<Mutex<MockState>>,
    closed: bool,
}

impl MockSession {
    fn with_record(&self, f: impl FnOnce(&mut SessionRecord)) {
        let mut state = lock(&self.state);
        if let Some(record) = state
            .sessions
            .iter_mut()
            .find(|record| record.generation == self.generation)
        {
            f(record);
        }
    }
}

impl TransportSession for MockSession {
    fn generation(&self) -> u64 {
        self.generation
    }

    fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::SessionClosed {
                generation: self.generation,
            });
        }
        if lock(&self.state).reject_sends {
            return Err(TransportError::SendFailed("mock rejects sends".to_string()));
        }
        self.with_record(|record| record.sent.push(frame));
        Ok(())
    }

    fn close(&mut self, code: u16, reason: &str) {
        self.closed = true;
        let info = CloseInfo::new(code, reason);
        self.with_record(|record| record.closes.push(info.clone()));

        let state = lock(&self.state);
        if state.echo_close {
            if let Some(events) = &state.events {
                let _ = events.send((self.generation, SessionEvent::Closed(info)));
            }
        }
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.with_record(|record| record.dropped = true);
    }
}

// ---------------------------------------------------------------------------
// Subscribers
// ---------------------------------------------------------------------------

/// Records every event it receives
#[derive(Debug, Clone, Default)]
pub struct RecordingSubscriber {
    events: Arc<Mutex<Vec<DomainEvent>>>,
}

impl RecordingSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        lock(&self.events).clone()
    }

    pub fn count(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn payloads(&self) -> Vec<serde_json::Value> {
        lock(&self.events)
            .iter()
            .map(|event| event.payload.clone())
            .collect()
    }
}

impl Subscriber for RecordingSubscriber {
    fn on_event(&self, event: &DomainEvent) -> Result<(), SubscriberError> {
        lock(&self.events).push(event.clone());
        Ok(())
    }
}

/// Always returns an error
#[derive(Debug, Clone)]
pub struct FailingSubscriber {
    message: String,
    calls: Arc<AtomicUsize>,
}

impl FailingSubscriber {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Subscriber for FailingSubscriber {
    fn on_event(&self, _event: &DomainEvent) -> Result<(), SubscriberError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(SubscriberError::new(self.message.clone()))
    }
}

/// Panics on every event
#[derive(Debug, Clone, Copy)]
pub struct PanickingSubscriber;

impl Subscriber for PanickingSubscriber {
    fn on_event(&self, event: &DomainEvent) -> Result<(), SubscriberError> {
        panic!("subscriber panicked on {}", event.topic);
    }
}
