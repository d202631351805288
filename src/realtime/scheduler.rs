//! Clock and timer abstraction
//!
//! The state machine never sleeps. It asks a [`Scheduler`] for timers and
//! is handed `(TimerId, TimerKind)` pairs back when they fire, which lets
//! tests substitute a manual clock for wall-clock time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Opaque handle to a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// What a timer is for, and which session or attempt it belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Watchdog on a pending open
    OpenTimeout { generation: u64 },
    /// Backoff delay before retry `attempt`
    Backoff { attempt: u32 },
    /// Periodic liveness probe
    HeartbeatProbe { generation: u64 },
    /// Single-shot staleness check following a probe
    StaleCheck { generation: u64 },
}

/// A timer that came due
pub type FiredTimer = (TimerId, TimerKind);

/// Injected clock and timer source
pub trait Scheduler: Send {
    fn now(&self) -> Instant;

    /// Arrange for `kind` to be delivered after `delay`
    fn schedule(&self, delay: Duration, kind: TimerKind) -> TimerId;

    /// Cancel a pending timer; unknown or already-fired ids are ignored
    fn cancel(&self, id: TimerId);
}

/// Scheduler backed by `tokio::time`
///
/// Each timer is a small sleeping task that reports on an unbounded channel.
/// Honours `tokio::time::pause()`.
pub struct TokioScheduler {
    fired: mpsc::UnboundedSender<FiredTimer>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<TimerId, JoinHandle<()>>>,
}

impl TokioScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FiredTimer>) {
        let (fired, fired_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            fired,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        };
        (scheduler, fired_rx)
    }

    /// Number of timers not yet fired or cancelled
    pub fn pending_count(&self) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|_, handle| !handle.is_finished());
        pending.len()
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn schedule(&self, delay: Duration, kind: TimerKind) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let fired = self.fired.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = fired.send((id, kind));
        });

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|_, handle| !handle.is_finished());
        pending.insert(id, handle);
        id
    }

    fn cancel(&self, id: TimerId) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = pending.remove(&id) {
            handle.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        let pending = self.pending.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, handle) in pending.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let (scheduler, mut fired) = TokioScheduler::new();
        let start = scheduler.now();

        let id = scheduler.schedule(Duration::from_secs(5), TimerKind::Backoff { attempt: 1 });

        let (fired_id, kind) = fired.recv().await.unwrap();
        assert_eq!(fired_id, id);
        assert_eq!(kind, TimerKind::Backoff { attempt: 1 });
        assert!(scheduler.now().duration_since(start) >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let (scheduler, mut fired) = TokioScheduler::new();

        let cancelled =
            scheduler.schedule(Duration::from_secs(1), TimerKind::OpenTimeout { generation: 1 });
        let kept =
            scheduler.schedule(Duration::from_secs(2), TimerKind::OpenTimeout { generation: 2 });
        scheduler.cancel(cancelled);

        let (fired_id, _) = fired.recv().await.unwrap();
        assert_eq!(fired_id, kept);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_fire_in_deadline_order() {
        let (scheduler, mut fired) = TokioScheduler::new();

        let late =
            scheduler.schedule(Duration::from_secs(3), TimerKind::StaleCheck { generation: 1 });
        let early =
            scheduler.schedule(Duration::from_secs(1), TimerKind::HeartbeatProbe { generation: 1 });

        assert_eq!(fired.recv().await.unwrap().0, early);
        assert_eq!(fired.recv().await.unwrap().0, late);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_count_prunes_finished_timers() {
        let (scheduler, mut fired) = TokioScheduler::new();
        scheduler.schedule(Duration::from_millis(10), TimerKind::Backoff { attempt: 1 });
        assert_eq!(scheduler.pending_count(), 1);

        fired.recv().await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(scheduler.pending_count(), 0);
    }
}
