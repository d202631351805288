//! Heartbeat monitor
//!
//! Detects sessions that are open at the transport layer but silent at the
//! application layer. Every probe tick schedules one staleness check; if no
//! inbound activity has been recorded within `stale_after` when the check
//! fires, the monitor reports the session stale exactly once and stops.
//!
//! The monitor is bound to a session generation. Activity, ticks and checks
//! carrying any other generation are ignored.

use super::scheduler::{Scheduler, TimerId, TimerKind};
use std::time::{Duration, Instant};
use tracing::debug;

/// Probe timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub probe_interval: Duration,
    pub stale_after: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_millis(30_000),
            stale_after: Duration::from_millis(15_000),
        }
    }
}

/// Result of a staleness check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleVerdict {
    /// Activity was seen within the window
    Alive,
    /// No activity for longer than `stale_after`; the monitor has stopped
    Stale { silent_for: Duration },
    /// The check belonged to another generation or a superseded timer
    Ignored,
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    generation: Option<u64>,
    last_activity: Option<Instant>,
    probe_timer: Option<TimerId>,
    stale_timer: Option<TimerId>,
    /// When the outstanding staleness check was armed
    check_armed_at: Option<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            generation: None,
            last_activity: None,
            probe_timer: None,
            stale_timer: None,
            check_armed_at: None,
        }
    }

    pub fn config(&self) -> HeartbeatConfig {
        self.config
    }

    pub fn is_running(&self) -> bool {
        self.generation.is_some()
    }

    /// Generation the monitor is currently bound to
    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    pub fn last_activity(&self) -> Option<Instant> {
        self.last_activity
    }

    /// Bind to `generation` and start the probe timer
    ///
    /// Starting counts as activity, so a fresh session gets a full window.
    pub fn start(&mut self, generation: u64, scheduler: &dyn Scheduler) {
        self.stop(scheduler);
        self.generation = Some(generation);
        self.last_activity = Some(scheduler.now());
        self.probe_timer = Some(scheduler.schedule(
            self.config.probe_interval,
            TimerKind::HeartbeatProbe { generation },
        ));
        debug!(
            generation,
            probe_interval_ms = self.config.probe_interval.as_millis() as u64,
            "Heartbeat started"
        );
    }

    /// Note inbound traffic for `generation`
    pub fn record_activity(&mut self, generation: u64, now: Instant) {
        if self.generation == Some(generation) {
            self.last_activity = Some(now);
        }
    }

    /// Handle a probe tick; returns true when a probe should be sent
    pub fn on_probe_tick(
        &mut self,
        id: TimerId,
        generation: u64,
        scheduler: &dyn Scheduler,
    ) -> bool {
        if self.generation != Some(generation) || self.probe_timer != Some(id) {
            return false;
        }

        self.probe_timer = Some(scheduler.schedule(
            self.config.probe_interval,
            TimerKind::HeartbeatProbe { generation },
        ));

        // One outstanding check at a time keeps detection bounded even when
        // stale_after exceeds probe_interval
        if self.stale_timer.is_none() {
            self.stale_timer = Some(scheduler.schedule(
                self.config.stale_after,
                TimerKind::StaleCheck { generation },
            ));
            self.check_armed_at = Some(scheduler.now());
        }
        true
    }

    /// Handle a staleness check
    pub fn on_stale_check(
        &mut self,
        id: TimerId,
        generation: u64,
        scheduler: &dyn Scheduler,
    ) -> StaleVerdict {
        if self.generation != Some(generation) || self.stale_timer != Some(id) {
            return StaleVerdict::Ignored;
        }
        self.stale_timer = None;
        let armed_at = self.check_armed_at.take();

        let now = scheduler.now();
        let silent_for = self
            .last_activity
            .map_or(Duration::ZERO, |last| now.saturating_duration_since(last));
        // A reply to the probe that armed this check means the peer is alive,
        // even when the check itself fired late
        let answered = matches!(
            (self.last_activity, armed_at),
            (Some(last), Some(armed)) if last >= armed
        );

        if silent_for > self.config.stale_after && !answered {
            debug!(generation, silent_for_ms = silent_for.as_millis() as u64, "Heartbeat stale");
            self.stop(scheduler);
            StaleVerdict::Stale { silent_for }
        } else {
            StaleVerdict::Alive
        }
    }

    /// Cancel pending timers and unbind; idempotent
    pub fn stop(&mut self, scheduler: &dyn Scheduler) {
        if let Some(id) = self.probe_timer.take() {
            scheduler.cancel(id);
        }
        if let Some(id) = self.stale_timer.take() {
            scheduler.cancel(id);
        }
        self.check_armed_at = None;
        if let Some(generation) = self.generation.take() {
            debug!(generation, "Heartbeat stopped");
        }
    }
}
