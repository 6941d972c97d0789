//! Countdown scheduler: deadline arithmetic, alarm-point generation,
//! pause/resume, and restart-safe persistence.
//!
//! The scheduler owns the persisted [`TimerRuntime`] exclusively. All time
//! arithmetic runs on the monotonic clock of a [`TimeSource`]; the wall
//! clock is never consulted, so NTP drift cannot move a deadline. Monotonic
//! wrap (49.7 days on 32-bit millisecond counters) is tolerated: when `now`
//! has run past the deadline by more than a one-hour grace the scheduler
//! treats it as a wrap and rebases instead of firing.
//!
//! Warning points ("alarms") are derived from the settings, never persisted:
//! with `n` alarms and a total of `total` seconds, alarms cluster one unit
//! apart inside the final `n` units when the interval is long enough, and
//! are spread evenly otherwise. Delivery is strictly ordered: `alarm_due`
//! keeps returning index `i` until the supervisor acknowledges it, so an
//! alarm survives a crash between due and acknowledge.

use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use thiserror::Error;

use crate::config::{ConfigStore, TimerRuntime, TimerSettings, MAX_ALARMS, MAX_GROUPS};
use crate::device::TimeSource;

/// Grace period before an overdue deadline is interpreted as clock wrap.
const WRAP_GRACE_MS: u64 = 3_600_000;

/// Periodic persistence cadence while the timer is active.
const PERSIST_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("timer is not enabled")]
    NotEnabled,

    #[error("persist failed: {0}")]
    Persist(#[from] crate::config::ConfigError),
}

/// Derived warning offsets, sorted strictly ascending, each in
/// `(0, total_seconds)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlarmSchedule {
    offsets: Vec<u64>,
}

impl AlarmSchedule {
    /// Generate the schedule for the given settings.
    ///
    /// With `step` = one unit in seconds and `n` alarms: a total of one unit
    /// or less carries no alarms; a total of at least `(n+1)` units places
    /// alarm `i` at `total - (n-i)·step`; anything shorter distributes
    /// evenly at `total·(i+1)/(n+1)`.
    pub fn generate(settings: &TimerSettings) -> Self {
        let step = settings.unit.step_seconds();
        let total = settings.total_seconds();
        let mut count = usize::from(settings.alarm_count).min(MAX_ALARMS);
        if total <= step {
            count = 0;
        }

        let mut offsets = Vec::with_capacity(count);
        if count > 0 {
            let minimum_required = step * (count as u64 + 1);
            if total < minimum_required {
                for i in 0..count as u64 {
                    offsets.push(total * (i + 1) / (count as u64 + 1));
                }
            } else {
                for i in 0..count as u64 {
                    let remaining_alarms = count as u64 - i;
                    offsets.push(total - remaining_alarms * step);
                }
            }
        }
        Self { offsets }
    }

    pub fn count(&self) -> usize {
        self.offsets.len()
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    pub fn offset(&self, index: usize) -> Option<u64> {
        self.offsets.get(index).copied()
    }
}

/// Read-only view of the scheduler state.
#[derive(Debug, Clone)]
pub struct SchedulerStatus {
    pub timer_active: bool,
    pub paused: bool,
    pub remaining_seconds: u64,
    pub total_seconds: u64,
    pub next_alarm_index: usize,
    pub total_alarms: usize,
    pub final_triggered: bool,
    pub final_groups_sent: [bool; MAX_GROUPS],
    pub alarm_offsets: Vec<u64>,
}

/// The countdown state machine.
///
/// All operations are local and synchronous; a persistence failure is
/// returned to the caller but never rolls back in-memory state.
pub struct CountdownScheduler {
    settings: TimerSettings,
    runtime: TimerRuntime,
    schedule: AlarmSchedule,
    clock: Arc<dyn TimeSource>,
    store: ConfigStore,
    last_persist_ms: u64,
}

impl CountdownScheduler {
    /// Load settings and runtime from the store, clamping stale state:
    /// a remaining of zero or above the total resets to the full interval,
    /// an out-of-range alarm index is pulled back, and an active deadline is
    /// rebased onto the current monotonic clock.
    pub fn load(store: ConfigStore, clock: Arc<dyn TimeSource>) -> Self {
        let settings = store.load_timer_settings();
        let mut runtime = store.load_runtime();
        let schedule = AlarmSchedule::generate(&settings);
        let total = settings.total_seconds();

        // A persisted final keeps remaining at zero so it stays actionable
        // after the restart; anything else with a stale remaining is
        // clamped back to the full interval.
        if !runtime.final_triggered
            && (runtime.remaining_seconds == 0 || runtime.remaining_seconds > total)
        {
            runtime.remaining_seconds = total;
        }
        if runtime.next_alarm_index > schedule.count() {
            runtime.next_alarm_index = schedule.count();
        }
        if runtime.timer_active {
            runtime.deadline_millis =
                clock.monotonic_ms() + runtime.remaining_seconds.saturating_mul(1000);
        }

        let last_persist_ms = clock.monotonic_ms();
        Self {
            settings,
            runtime,
            schedule,
            clock,
            store,
            last_persist_ms,
        }
    }

    pub fn settings(&self) -> &TimerSettings {
        &self.settings
    }

    pub fn total_seconds(&self) -> u64 {
        self.settings.total_seconds()
    }

    pub fn remaining_seconds(&self) -> u64 {
        self.runtime.remaining_seconds
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            timer_active: self.runtime.timer_active,
            paused: self.runtime.paused,
            remaining_seconds: self.runtime.remaining_seconds,
            total_seconds: self.total_seconds(),
            next_alarm_index: self.runtime.next_alarm_index,
            total_alarms: self.schedule.count(),
            final_triggered: self.runtime.final_triggered,
            final_groups_sent: self.runtime.final_groups_sent,
            alarm_offsets: self.schedule.offsets().to_vec(),
        }
    }

    /// Replace the settings, carrying elapsed time over to the new interval.
    ///
    /// If the already-elapsed portion exceeds the new total, the timer drops
    /// to reset-but-not-started: settings valid, countdown stopped, user
    /// action required. Otherwise the deadline is rebased and every alarm
    /// whose new offset lies at or before the elapsed time counts as past.
    pub fn configure(&mut self, settings: TimerSettings) -> Result<(), SchedulerError> {
        let settings = settings.clamped();
        let old_total = self.total_seconds();
        let was_active = self.runtime.timer_active;

        let mut old_elapsed = 0;
        if was_active {
            self.update_remaining();
            old_elapsed = old_total.saturating_sub(self.runtime.remaining_seconds);
        }

        self.settings = settings;
        self.schedule = AlarmSchedule::generate(&self.settings);
        let new_total = self.total_seconds();

        if was_active {
            if old_elapsed >= new_total {
                info!(
                    "reconfigure: elapsed {}s exceeds new total {}s, stopping countdown",
                    old_elapsed, new_total
                );
                self.runtime.timer_active = false;
                self.runtime.paused = false;
                self.runtime.final_triggered = false;
                self.runtime.next_alarm_index = 0;
                self.runtime.remaining_seconds = new_total;
                self.runtime.deadline_millis = 0;
            } else {
                self.runtime.remaining_seconds = new_total - old_elapsed;
                self.runtime.deadline_millis = self.clock.monotonic_ms()
                    + self.runtime.remaining_seconds.saturating_mul(1000);
                self.runtime.next_alarm_index = 0;
                for (i, offset) in self.schedule.offsets().iter().enumerate() {
                    if old_elapsed >= *offset {
                        self.runtime.next_alarm_index = i + 1;
                    }
                }
                debug!(
                    "reconfigure: elapsed {}s carried over, remaining {}s, next alarm {}",
                    old_elapsed, self.runtime.remaining_seconds, self.runtime.next_alarm_index
                );
            }
        } else {
            self.runtime.remaining_seconds = new_total;
        }

        self.store.save_timer_settings(&self.settings)?;
        self.persist()
    }

    /// Start the countdown from a full interval. Requires enabled settings
    /// and a stopped timer.
    pub fn start(&mut self) -> Result<(), SchedulerError> {
        if !self.settings.enabled {
            return Err(SchedulerError::NotEnabled);
        }
        if self.runtime.timer_active {
            // Already running or paused.
            return Ok(());
        }
        self.arm();
        info!(
            "countdown started: {}s, {} warning points",
            self.total_seconds(),
            self.schedule.count()
        );
        self.persist()
    }

    /// Freeze the countdown, keeping the remaining time.
    pub fn pause(&mut self) -> Result<(), SchedulerError> {
        if !self.runtime.timer_active || self.runtime.paused {
            return Ok(());
        }
        self.update_remaining();
        self.runtime.paused = true;
        info!(
            "countdown paused with {}s remaining",
            self.runtime.remaining_seconds
        );
        self.persist()
    }

    /// Continue a paused countdown; the deadline is rebased to now.
    pub fn resume(&mut self) -> Result<(), SchedulerError> {
        if !self.runtime.timer_active || !self.runtime.paused {
            return Ok(());
        }
        self.runtime.paused = false;
        self.runtime.deadline_millis =
            self.clock.monotonic_ms() + self.runtime.remaining_seconds.saturating_mul(1000);
        info!(
            "countdown resumed with {}s remaining",
            self.runtime.remaining_seconds
        );
        self.persist()
    }

    /// The user "alive" signal: restart the full interval unconditionally,
    /// clearing any warning or final state.
    pub fn reset(&mut self) -> Result<(), SchedulerError> {
        self.arm();
        info!("countdown reset to {}s", self.total_seconds());
        self.persist()
    }

    fn arm(&mut self) {
        self.runtime.timer_active = true;
        self.runtime.paused = false;
        self.runtime.final_triggered = false;
        self.runtime.next_alarm_index = 0;
        self.runtime.final_groups_sent = [false; MAX_GROUPS];
        self.runtime.remaining_seconds = self.total_seconds();
        self.runtime.deadline_millis =
            self.clock.monotonic_ms() + self.total_seconds().saturating_mul(1000);
    }

    /// Recompute the remaining time; on reaching zero the countdown stops
    /// and the final fires. Idempotent, safe at any rate of 1 Hz or above.
    pub fn tick(&mut self) -> Result<(), SchedulerError> {
        if !self.runtime.timer_active || self.runtime.paused {
            return Ok(());
        }
        self.update_remaining();

        if self.runtime.remaining_seconds == 0 {
            self.runtime.timer_active = false;
            self.runtime.paused = false;
            self.runtime.final_triggered = true;
            warn!("countdown expired, final triggered");
            return self.persist();
        }

        let now = self.clock.monotonic_ms();
        if now.wrapping_sub(self.last_persist_ms) >= PERSIST_INTERVAL_MS {
            return self.persist();
        }
        Ok(())
    }

    /// The next un-acknowledged alarm index, if its offset has elapsed.
    /// Returns the same index until [`Self::acknowledge_alarm`] advances it.
    pub fn alarm_due(&mut self) -> Option<usize> {
        if !self.runtime.timer_active
            || self.runtime.paused
            || self.runtime.next_alarm_index >= self.schedule.count()
        {
            return None;
        }
        self.update_remaining();
        let elapsed = self
            .total_seconds()
            .saturating_sub(self.runtime.remaining_seconds);
        let index = self.runtime.next_alarm_index;
        if elapsed >= self.schedule.offset(index)? {
            Some(index)
        } else {
            None
        }
    }

    /// True once the interval has fully elapsed and the final has not been
    /// acknowledged yet.
    pub fn final_due(&self) -> bool {
        self.runtime.final_triggered && self.runtime.remaining_seconds == 0
    }

    /// Advance past alarm `index`. Ignored unless `index` is exactly the
    /// next un-acknowledged alarm, so progress is strictly monotonic and no
    /// index can be skipped.
    pub fn acknowledge_alarm(&mut self, index: usize) -> Result<(), SchedulerError> {
        if index == self.runtime.next_alarm_index
            && self.runtime.next_alarm_index < self.schedule.count()
        {
            self.runtime.next_alarm_index += 1;
            debug!("alarm {} acknowledged", index);
            return self.persist();
        }
        Ok(())
    }

    /// Clear the final state and the per-group delivery flags.
    pub fn acknowledge_final(&mut self) -> Result<(), SchedulerError> {
        self.runtime.final_triggered = false;
        self.runtime.final_groups_sent = [false; MAX_GROUPS];
        self.persist()
    }

    /// Record that the final notification reached group `group`; consulted
    /// after a restart so already-delivered groups are not re-fired.
    pub fn mark_group_sent(&mut self, group: usize) -> Result<(), SchedulerError> {
        if let Some(slot) = self.runtime.final_groups_sent.get_mut(group) {
            *slot = true;
            return self.persist();
        }
        Ok(())
    }

    pub fn group_already_sent(&self, group: usize) -> bool {
        self.runtime
            .final_groups_sent
            .get(group)
            .copied()
            .unwrap_or(false)
    }

    /// Write a snapshot of the runtime, refreshing the remaining time first
    /// when the countdown is live.
    pub fn persist(&mut self) -> Result<(), SchedulerError> {
        if self.runtime.timer_active && !self.runtime.paused {
            self.update_remaining();
        }
        self.last_persist_ms = self.clock.monotonic_ms();
        self.store.save_runtime(&self.runtime)?;
        Ok(())
    }

    /// Deadline arithmetic with wrap protection. A deadline in the future
    /// yields the true remaining time; a deadline overdue by more than the
    /// one-hour grace means the monotonic clock wrapped, so rebase; anything
    /// in between is a genuine expiry.
    fn update_remaining(&mut self) {
        if !self.runtime.timer_active || self.runtime.paused {
            return;
        }
        let now = self.clock.monotonic_ms();
        if self.runtime.deadline_millis > now {
            let remaining = (self.runtime.deadline_millis - now) / 1000;
            let total = self.total_seconds();
            if remaining > total {
                // The clock jumped backwards (wrap): keep the last known
                // remaining and rebase the deadline onto the new timeline.
                self.runtime.remaining_seconds = self.runtime.remaining_seconds.min(total);
                self.runtime.deadline_millis =
                    now + self.runtime.remaining_seconds.saturating_mul(1000);
            } else {
                self.runtime.remaining_seconds = remaining;
            }
        } else if now > self.runtime.deadline_millis + WRAP_GRACE_MS {
            self.runtime.deadline_millis =
                now + self.runtime.remaining_seconds.saturating_mul(1000);
        } else {
            self.runtime.remaining_seconds = 0;
        }
    }
}

/// Cloneable, mutex-serialised handle to the scheduler.
///
/// This is the only way collaborators reach scheduler state; the mail agent
/// uses it to check and flip per-group delivery flags under the same lock
/// the supervisor ticks under.
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Arc<Mutex<CountdownScheduler>>,
}

impl SchedulerHandle {
    pub fn new(scheduler: CountdownScheduler) -> Self {
        Self {
            inner: Arc::new(Mutex::new(scheduler)),
        }
    }

    /// Run `f` with the scheduler locked.
    pub fn with<R>(&self, f: impl FnOnce(&mut CountdownScheduler) -> R) -> R {
        let mut guard = self.inner.lock().expect("scheduler mutex poisoned");
        f(&mut guard)
    }

    pub fn status(&self) -> SchedulerStatus {
        self.with(|s| s.status())
    }

    pub fn mark_group_sent(&self, group: usize) -> Result<(), SchedulerError> {
        self.with(|s| s.mark_group_sent(group))
    }

    pub fn group_already_sent(&self, group: usize) -> bool {
        self.with(|s| s.group_already_sent(group))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimerUnit;
    use crate::device::ManualClock;

    fn settings(unit: TimerUnit, total_value: u16, alarm_count: u8) -> TimerSettings {
        TimerSettings {
            unit,
            total_value,
            alarm_count,
            enabled: true,
        }
    }

    fn scheduler_with(
        unit: TimerUnit,
        total_value: u16,
        alarm_count: u8,
    ) -> (tempfile::TempDir, Arc<ManualClock>, CountdownScheduler) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = ConfigStore::open(tmp.path()).expect("store");
        store
            .save_timer_settings(&settings(unit, total_value, alarm_count))
            .unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let scheduler = CountdownScheduler::load(store, clock.clone());
        (tmp, clock, scheduler)
    }

    #[test]
    fn schedule_empty_when_no_alarms() {
        let schedule = AlarmSchedule::generate(&settings(TimerUnit::Hours, 5, 0));
        assert_eq!(schedule.count(), 0);
    }

    #[test]
    fn schedule_empty_when_total_is_one_unit() {
        let schedule = AlarmSchedule::generate(&settings(TimerUnit::Hours, 1, 4));
        assert_eq!(schedule.count(), 0);
    }

    #[test]
    fn schedule_clusters_in_final_units() {
        // 5 minutes with 2 alarms: alarms at total - 2*60 and total - 1*60.
        let schedule = AlarmSchedule::generate(&settings(TimerUnit::Minutes, 5, 2));
        assert_eq!(schedule.offsets(), &[180, 240]);
    }

    #[test]
    fn schedule_max_alarms_exact_boundary() {
        // total = step * (MAX_ALARMS + 1): offsets are total - k*step for
        // k in MAX_ALARMS..=1.
        let schedule = AlarmSchedule::generate(&settings(TimerUnit::Minutes, 11, 10));
        let total = 11 * 60;
        let expected: Vec<u64> = (1..=10).rev().map(|k| total - k * 60).collect();
        assert_eq!(schedule.offsets(), expected.as_slice());
    }

    #[test]
    fn schedule_short_interval_distributes_evenly() {
        // 5 minutes with 5 alarms: 300 < 6*60, so offsets are 300*i/6.
        let schedule = AlarmSchedule::generate(&settings(TimerUnit::Minutes, 5, 5));
        assert_eq!(schedule.offsets(), &[50, 100, 150, 200, 250]);
    }

    #[test]
    fn schedule_offsets_sorted_and_bounded() {
        for alarm_count in 0..=10u8 {
            for total_value in 1..=20u16 {
                let s = settings(TimerUnit::Minutes, total_value, alarm_count);
                let schedule = AlarmSchedule::generate(&s);
                let total = s.total_seconds();
                let offsets = schedule.offsets();
                for window in offsets.windows(2) {
                    assert!(window[0] < window[1], "offsets must ascend: {:?}", offsets);
                }
                for &offset in offsets {
                    assert!(offset > 0 && offset < total);
                }
            }
        }
    }

    #[test]
    fn start_counts_down_and_fires_final() {
        let (_tmp, clock, mut sched) = scheduler_with(TimerUnit::Minutes, 5, 2);
        sched.start().unwrap();
        assert_eq!(sched.remaining_seconds(), 300);

        clock.advance_ms(180_000);
        sched.tick().unwrap();
        assert_eq!(sched.remaining_seconds(), 120);
        assert_eq!(sched.alarm_due(), Some(0));
        sched.acknowledge_alarm(0).unwrap();
        assert_eq!(sched.alarm_due(), None);

        clock.advance_ms(60_000);
        sched.tick().unwrap();
        assert_eq!(sched.alarm_due(), Some(1));
        sched.acknowledge_alarm(1).unwrap();

        clock.advance_ms(60_000);
        sched.tick().unwrap();
        assert!(sched.final_due());
        assert_eq!(sched.remaining_seconds(), 0);
        assert!(!sched.status().timer_active);
    }

    #[test]
    fn start_requires_enabled() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(tmp.path()).unwrap();
        let mut s = settings(TimerUnit::Minutes, 5, 0);
        s.enabled = false;
        store.save_timer_settings(&s).unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let mut sched = CountdownScheduler::load(store, clock);
        assert!(matches!(sched.start(), Err(SchedulerError::NotEnabled)));
        // reset works regardless of the enabled flag
        sched.reset().unwrap();
        assert!(sched.status().timer_active);
    }

    #[test]
    fn remaining_never_exceeds_total() {
        let (_tmp, clock, mut sched) = scheduler_with(TimerUnit::Minutes, 2, 3);
        sched.start().unwrap();
        let total = sched.total_seconds();
        for _ in 0..200 {
            clock.advance_ms(1_000);
            sched.tick().unwrap();
            assert!(sched.remaining_seconds() <= total);
        }
        assert_eq!(sched.remaining_seconds(), 0);
    }

    #[test]
    fn reset_equals_start_state() {
        let (_tmp, _clock, mut sched) = scheduler_with(TimerUnit::Minutes, 5, 2);
        sched.start().unwrap();
        let after_start = sched.status();
        sched.reset().unwrap();
        let after_reset = sched.status();
        assert_eq!(after_start.remaining_seconds, after_reset.remaining_seconds);
        assert_eq!(after_start.next_alarm_index, after_reset.next_alarm_index);
        assert_eq!(after_start.timer_active, after_reset.timer_active);
        assert_eq!(after_start.final_triggered, after_reset.final_triggered);
    }

    #[test]
    fn double_reset_is_idempotent() {
        let (_tmp, _clock, mut sched) = scheduler_with(TimerUnit::Minutes, 5, 2);
        sched.reset().unwrap();
        let first = sched.status();
        sched.reset().unwrap();
        let second = sched.status();
        assert_eq!(first.remaining_seconds, second.remaining_seconds);
        assert_eq!(first.next_alarm_index, second.next_alarm_index);
    }

    #[test]
    fn acknowledge_wrong_index_is_noop() {
        let (_tmp, clock, mut sched) = scheduler_with(TimerUnit::Minutes, 5, 2);
        sched.start().unwrap();
        clock.advance_ms(180_000);
        sched.tick().unwrap();
        assert_eq!(sched.alarm_due(), Some(0));
        sched.acknowledge_alarm(1).unwrap();
        assert_eq!(sched.status().next_alarm_index, 0);
        assert_eq!(sched.alarm_due(), Some(0));
    }

    #[test]
    fn acknowledge_final_is_idempotent_and_clears_groups() {
        let (_tmp, clock, mut sched) = scheduler_with(TimerUnit::Minutes, 1, 0);
        sched.start().unwrap();
        clock.advance_ms(60_000);
        sched.tick().unwrap();
        assert!(sched.final_due());
        sched.mark_group_sent(0).unwrap();
        assert!(sched.group_already_sent(0));

        sched.acknowledge_final().unwrap();
        let first = sched.status();
        sched.acknowledge_final().unwrap();
        let second = sched.status();
        assert!(!first.final_triggered);
        assert_eq!(first.final_groups_sent, [false; MAX_GROUPS]);
        assert_eq!(first.final_groups_sent, second.final_groups_sent);
    }

    #[test]
    fn pause_and_resume_keep_remaining() {
        let (_tmp, clock, mut sched) = scheduler_with(TimerUnit::Minutes, 5, 0);
        sched.start().unwrap();
        clock.advance_ms(100_000);
        sched.tick().unwrap();
        sched.pause().unwrap();
        let frozen = sched.remaining_seconds();

        clock.advance_ms(500_000);
        sched.tick().unwrap();
        assert_eq!(sched.remaining_seconds(), frozen);
        assert_eq!(sched.alarm_due(), None);

        sched.resume().unwrap();
        clock.advance_ms(1_000);
        sched.tick().unwrap();
        assert_eq!(sched.remaining_seconds(), frozen - 1);
    }

    #[test]
    fn reconfigure_carries_elapsed_time() {
        // 2 hours with 1 alarm (offset 3600); at t=1800s switch to 3 hours.
        let (_tmp, clock, mut sched) = scheduler_with(TimerUnit::Hours, 2, 1);
        sched.start().unwrap();
        clock.advance_ms(1_800_000);
        sched.tick().unwrap();

        sched
            .configure(settings(TimerUnit::Hours, 3, 1))
            .unwrap();
        assert_eq!(sched.remaining_seconds(), 9_000);
        assert_eq!(sched.status().next_alarm_index, 0);
        assert_eq!(sched.status().alarm_offsets, vec![7_200]);
        assert!(sched.status().timer_active);
    }

    #[test]
    fn reconfigure_past_new_total_stops_timer() {
        // At t=5400s shrink the interval to 1 hour: elapsed exceeds total.
        let (_tmp, clock, mut sched) = scheduler_with(TimerUnit::Hours, 2, 1);
        sched.start().unwrap();
        clock.advance_ms(5_400_000);
        sched.tick().unwrap();

        sched
            .configure(settings(TimerUnit::Hours, 1, 1))
            .unwrap();
        let status = sched.status();
        assert!(!status.timer_active);
        assert_eq!(status.remaining_seconds, 3_600);
        assert_eq!(status.next_alarm_index, 0);
        assert!(!status.final_triggered);
    }

    #[test]
    fn reconfigure_skips_already_past_alarms() {
        // 10 minutes, 4 alarms -> offsets 360,420,480,540. After 7 minutes
        // elapsed, reconfigure to the same settings: alarms at 360 and 420
        // are already past.
        let (_tmp, clock, mut sched) = scheduler_with(TimerUnit::Minutes, 10, 4);
        sched.start().unwrap();
        clock.advance_ms(420_000);
        sched.tick().unwrap();

        sched
            .configure(settings(TimerUnit::Minutes, 10, 4))
            .unwrap();
        assert_eq!(sched.status().next_alarm_index, 2);
    }

    #[test]
    fn clock_wrap_rebases_instead_of_firing() {
        let (_tmp, clock, mut sched) = scheduler_with(TimerUnit::Hours, 2, 0);
        clock.set_ms(u64::from(u32::MAX) - 10_000);
        sched.reset().unwrap();
        clock.advance_ms(5_000);
        sched.tick().unwrap();
        let before = sched.remaining_seconds();

        // Simulated 32-bit wrap: the monotonic value jumps far backwards.
        clock.set_ms(2_000);
        sched.tick().unwrap();
        let after = sched.remaining_seconds();
        assert!(!sched.final_due(), "wrap must not fire the final");
        assert_eq!(
            after, before,
            "wrap must neither slash nor inflate remaining"
        );
        assert!(after <= sched.total_seconds());
    }

    #[test]
    fn overdue_within_grace_fires() {
        let (_tmp, clock, mut sched) = scheduler_with(TimerUnit::Minutes, 1, 0);
        sched.start().unwrap();
        // 10 minutes past the deadline is inside the one-hour grace.
        clock.advance_ms(60_000 + 600_000);
        sched.tick().unwrap();
        assert!(sched.final_due());
    }

    #[test]
    fn restart_restores_active_countdown() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(tmp.path()).unwrap();
        store
            .save_timer_settings(&settings(TimerUnit::Minutes, 5, 2))
            .unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let mut sched = CountdownScheduler::load(store.clone(), clock.clone());
        sched.start().unwrap();
        clock.advance_ms(120_000);
        sched.tick().unwrap();
        sched.persist().unwrap();

        // Fresh process, fresh monotonic origin.
        let clock2 = Arc::new(ManualClock::new(7));
        let sched2 = CountdownScheduler::load(store, clock2);
        assert_eq!(sched2.remaining_seconds(), 180);
        assert!(sched2.status().timer_active);
    }

    #[test]
    fn restart_mid_final_keeps_group_flags() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(tmp.path()).unwrap();
        store
            .save_timer_settings(&settings(TimerUnit::Minutes, 1, 0))
            .unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let mut sched = CountdownScheduler::load(store.clone(), clock.clone());
        sched.start().unwrap();
        clock.advance_ms(60_000);
        sched.tick().unwrap();
        assert!(sched.final_due());
        sched.mark_group_sent(0).unwrap();

        let sched2 = CountdownScheduler::load(store, Arc::new(ManualClock::new(0)));
        assert!(sched2.final_due());
        assert_eq!(sched2.status().final_groups_sent, [true, false, false]);
    }
}
