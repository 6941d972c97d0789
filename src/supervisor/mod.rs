//! Supervisor: the 1 Hz control loop that wires the scheduler, the mail
//! agent, the network controller and the relay together.
//!
//! Alive signals from the button, the web UI and the remote GET endpoint
//! all converge on `Scheduler::reset()`. Scheduler events flow the other
//! way: a due warning point forces an aggressive reconnect, dispatches the
//! warning template to every enabled group and acknowledges on the first
//! delivered group (or after a 60 s guard, so a dead mail server cannot
//! stall the alarm ladder). The final dispatches per-group with restart
//! dedup, then fires the relay — by default even when every notification
//! failed, because the relay is the mechanical fallback.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::button::ButtonEvent;
use crate::config::ConfigStore;
use crate::device::TimeSource;
use crate::mail::{MailAgentHandle, MailEvent, MailOrigin, TemplateKind};
use crate::net::{NetEvent, NetHandle};
use crate::ota::HttpReleaseChecker;
use crate::relay::RelayDriver;
use crate::scheduler::SchedulerHandle;
use crate::web::AliveSource;

/// Tunable safety policy.
#[derive(Debug, Clone)]
pub struct SupervisorPolicy {
    /// Acknowledge a warning anyway after this long without a delivered
    /// group, to avoid livelock on a dead mail path.
    pub warning_ack_timeout: Duration,
    /// Cadence of the background connectivity re-check.
    pub net_recheck_interval: Duration,
    /// Fire the relay on final even when no notification group could be
    /// reached. The relay is the mechanical fallback; disabling this trades
    /// fail-safe behaviour for fewer false triggers.
    pub relay_on_mail_failure: bool,
    /// Release manifest to consult once after the first connect.
    pub ota_manifest_url: Option<String>,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            warning_ack_timeout: Duration::from_secs(60),
            net_recheck_interval: Duration::from_secs(30),
            relay_on_mail_failure: true,
            ota_manifest_url: None,
        }
    }
}

/// How the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// Clean shutdown (signal).
    Shutdown,
    /// Factory reset performed; the process should restart.
    Restart,
}

struct PendingWarning {
    index: usize,
    deadline: Instant,
}

struct FinalProgress {
    awaiting: HashSet<usize>,
    any_success: bool,
}

pub struct Supervisor {
    scheduler: SchedulerHandle,
    mail: MailAgentHandle,
    net: NetHandle,
    relay: Arc<RelayDriver>,
    store: ConfigStore,
    clock: Arc<dyn TimeSource>,
    policy: SupervisorPolicy,

    alive_tx: mpsc::UnboundedSender<AliveSource>,
    alive_rx: mpsc::UnboundedReceiver<AliveSource>,
    button_tx: mpsc::UnboundedSender<ButtonEvent>,
    button_rx: mpsc::UnboundedReceiver<ButtonEvent>,
    mail_events: mpsc::UnboundedReceiver<MailEvent>,
    net_events: mpsc::UnboundedReceiver<NetEvent>,

    pending_warning: Option<PendingWarning>,
    final_progress: Option<FinalProgress>,
    last_net_check: Instant,
    last_daily_report_day: Option<i64>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scheduler: SchedulerHandle,
        mail: MailAgentHandle,
        net: NetHandle,
        relay: Arc<RelayDriver>,
        store: ConfigStore,
        clock: Arc<dyn TimeSource>,
        policy: SupervisorPolicy,
        mail_events: mpsc::UnboundedReceiver<MailEvent>,
        net_events: mpsc::UnboundedReceiver<NetEvent>,
    ) -> Self {
        let (alive_tx, alive_rx) = mpsc::unbounded_channel();
        let (button_tx, button_rx) = mpsc::unbounded_channel();
        Self {
            scheduler,
            mail,
            net,
            relay,
            store,
            clock,
            policy,
            alive_tx,
            alive_rx,
            button_tx,
            button_rx,
            mail_events,
            net_events,
            pending_warning: None,
            final_progress: None,
            last_net_check: Instant::now(),
            last_daily_report_day: None,
        }
    }

    /// Channel for alive signals from the web router and remote GET.
    pub fn alive_sender(&self) -> mpsc::UnboundedSender<AliveSource> {
        self.alive_tx.clone()
    }

    /// Channel for debounced button events.
    pub fn button_sender(&self) -> mpsc::UnboundedSender<ButtonEvent> {
        self.button_tx.clone()
    }

    /// Drive the control loop until shutdown or factory reset.
    pub async fn run(mut self) -> SupervisorExit {
        info!("supervisor started");
        let mut tick = interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.on_tick().await;
                }
                Some(source) = self.alive_rx.recv() => {
                    self.on_alive(source);
                }
                Some(event) = self.button_rx.recv() => {
                    if let Some(exit) = self.on_button(event) {
                        self.stop_workers().await;
                        return exit;
                    }
                }
                Some(event) = self.mail_events.recv() => {
                    self.on_mail_event(event);
                }
                Some(event) = self.net_events.recv() => {
                    self.on_net_event(event);
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received shutdown signal");
                    self.stop_workers().await;
                    return SupervisorExit::Shutdown;
                }
            }
        }
    }

    async fn stop_workers(&mut self) {
        if let Err(e) = self.scheduler.with(|s| s.persist()) {
            warn!("final persist failed: {}", e);
        }
        self.mail.shutdown();
        self.net.shutdown().await;
    }

    async fn on_tick(&mut self) {
        if let Err(e) = self.scheduler.with(|s| s.tick()) {
            warn!("scheduler persist failed during tick: {}", e);
        }

        self.check_warning_guard();

        if self.pending_warning.is_none() && self.final_progress.is_none() {
            if let Some(index) = self.scheduler.with(|s| s.alarm_due()) {
                self.dispatch_warning(index).await;
            }
        }

        if self.final_progress.is_none() && self.scheduler.with(|s| s.final_due()) {
            self.dispatch_final().await;
        }

        if self.last_net_check.elapsed() >= self.policy.net_recheck_interval {
            self.last_net_check = Instant::now();
            let net = self.net.clone();
            tokio::spawn(async move {
                net.ensure_connected(false).await;
            });
        }

        self.maybe_send_daily_status();
    }

    /// Livelock guard: a warning with no delivered group after the timeout
    /// is acknowledged anyway, with a surfaced error.
    fn check_warning_guard(&mut self) {
        let Some(pending) = &self.pending_warning else {
            return;
        };
        if Instant::now() < pending.deadline {
            return;
        }
        let index = pending.index;
        error!(
            "no warning mail delivered for alarm {} within {:?}, acknowledging anyway",
            index, self.policy.warning_ack_timeout
        );
        if let Err(e) = self.scheduler.with(|s| s.acknowledge_alarm(index)) {
            warn!("acknowledge after timeout failed to persist: {}", e);
        }
        self.pending_warning = None;
    }

    async fn dispatch_warning(&mut self, index: usize) {
        info!("warning point {} due", index);
        if !self.net.ensure_connected(true).await {
            warn!("aggressive reconnect failed before warning {}", index);
        }

        let remaining = self.scheduler.with(|s| s.remaining_seconds());
        let remaining_minutes = remaining.div_ceil(60);
        let dispatched = self.mail.send_to_all_enabled_groups(
            TemplateKind::Warning { remaining_minutes },
            Some(index),
        );
        if dispatched.is_empty() {
            // Nothing to deliver: no groups or queue refused everything.
            warn!("warning {} had no dispatchable group, acknowledging", index);
            if let Err(e) = self.scheduler.with(|s| s.acknowledge_alarm(index)) {
                warn!("acknowledge failed to persist: {}", e);
            }
            return;
        }
        self.pending_warning = Some(PendingWarning {
            index,
            deadline: Instant::now() + self.policy.warning_ack_timeout,
        });
    }

    async fn dispatch_final(&mut self) {
        warn!("final due: interval elapsed without alive signal");
        if !self.net.ensure_connected(true).await {
            warn!("aggressive reconnect failed before final dispatch");
        }

        let dispatched = self
            .mail
            .send_to_all_enabled_groups(TemplateKind::Alarm, None);
        if dispatched.is_empty() {
            // All groups already delivered before a restart, or none are
            // configured: go straight to the relay.
            let any_sent = self
                .scheduler
                .status()
                .final_groups_sent
                .iter()
                .any(|sent| *sent);
            self.finish_final(any_sent);
            return;
        }
        info!("final dispatched to groups {:?}", dispatched);
        self.final_progress = Some(FinalProgress {
            awaiting: dispatched.into_iter().collect(),
            any_success: false,
        });
    }

    fn finish_final(&mut self, any_success: bool) {
        if any_success || self.policy.relay_on_mail_failure {
            self.relay.trigger();
        } else {
            error!("final reached no group and relay-on-failure is disabled; relay not fired");
        }
        if let Err(e) = self.scheduler.with(|s| s.acknowledge_final()) {
            warn!("final acknowledge failed to persist: {}", e);
        }
        self.final_progress = None;
    }

    fn on_alive(&mut self, source: AliveSource) {
        info!("alive signal via {}", source.label());
        if let Err(e) = self.scheduler.with(|s| s.reset()) {
            warn!("reset failed to persist: {}", e);
        }
        self.pending_warning = None;
        self.final_progress = None;

        // Best effort: a full queue must never delay the reset itself.
        let dispatched = self
            .mail
            .send_to_all_enabled_groups(TemplateKind::ResetNotification, None);
        debug!("reset notification queued for groups {:?}", dispatched);
    }

    fn on_button(&mut self, event: ButtonEvent) -> Option<SupervisorExit> {
        match event {
            ButtonEvent::Press => {
                self.on_alive(AliveSource::Button);
                None
            }
            ButtonEvent::LongPress => {
                debug!("long press ignored");
                None
            }
            ButtonEvent::VeryLongPress => {
                warn!("very long press: factory reset");
                if let Err(e) = self.store.erase_all() {
                    error!("factory reset failed: {}", e);
                    return None;
                }
                Some(SupervisorExit::Restart)
            }
            ButtonEvent::Release => None,
        }
    }

    fn on_mail_event(&mut self, event: MailEvent) {
        match event.origin {
            MailOrigin::Warning { alarm_index, group } => {
                if event.success {
                    debug!("warning for alarm {} delivered to group {}", alarm_index, group);
                    if let Some(pending) = &self.pending_warning {
                        if pending.index == alarm_index {
                            if let Err(e) =
                                self.scheduler.with(|s| s.acknowledge_alarm(alarm_index))
                            {
                                warn!("acknowledge failed to persist: {}", e);
                            }
                            self.pending_warning = None;
                        }
                    }
                } else {
                    warn!(
                        "warning for alarm {} failed for group {}: {}",
                        alarm_index,
                        group,
                        event.error.as_deref().unwrap_or("unknown")
                    );
                }
            }
            MailOrigin::Final { group } => {
                let Some(progress) = &mut self.final_progress else {
                    return;
                };
                progress.awaiting.remove(&group);
                if event.success {
                    progress.any_success = true;
                    info!("final delivered to group {}", group);
                } else {
                    error!(
                        "final exhausted retries for group {}: {}",
                        group,
                        event.error.as_deref().unwrap_or("unknown")
                    );
                }
                if progress.awaiting.is_empty() {
                    let any_success = progress.any_success;
                    self.finish_final(any_success);
                }
            }
            MailOrigin::Adhoc => {
                if !event.success {
                    debug!(
                        "{} mail failed: {}",
                        event.kind.label(),
                        event.error.as_deref().unwrap_or("unknown")
                    );
                }
            }
        }
    }

    fn on_net_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Connected { which, ssid } => {
                debug!("network up: {} via {:?}", ssid, which);
                if self.clock.is_synced() {
                    debug!("wall clock already synced");
                }
                self.maybe_startup_ota_check();
            }
            NetEvent::ApStarted { ssid } => {
                warn!("setup access point {} active", ssid);
            }
        }
    }

    /// One release check per boot, once connectivity exists.
    fn maybe_startup_ota_check(&mut self) {
        let Some(manifest_url) = self.policy.ota_manifest_url.clone() else {
            return;
        };
        let mut state = self.store.load_ota_state();
        if state.startup_check_done {
            return;
        }
        state.startup_check_done = true;
        state.check_count += 1;
        state.last_check_millis = self.clock.monotonic_ms();
        if let Err(e) = self.store.save_ota_state(&state) {
            warn!("failed to persist ota state: {}", e);
        }

        tokio::spawn(async move {
            let checker = match HttpReleaseChecker::new(manifest_url) {
                Ok(checker) => checker,
                Err(e) => {
                    warn!("ota checker unavailable: {}", e);
                    return;
                }
            };
            match checker.newer_release(env!("CARGO_PKG_VERSION")).await {
                Ok(Some(tag)) => info!("firmware update available: {}", tag),
                Ok(None) => debug!("firmware up to date"),
                Err(e) => warn!("release check failed: {}", e),
            }
        });
    }

    /// Daily status mail at the midnight UTC boundary, deduplicated per
    /// day.
    fn maybe_send_daily_status(&mut self) {
        if !self.mail.config().daily_status_enabled {
            return;
        }
        let Some(now) = self.clock.wall_clock() else {
            return;
        };
        use chrono::Timelike;
        if now.hour() != 0 || now.minute() != 0 {
            return;
        }
        let day = now.timestamp() / 86_400;
        if self.last_daily_report_day == Some(day) {
            return;
        }
        self.last_daily_report_day = Some(day);
        let dispatched = self
            .mail
            .send_to_all_enabled_groups(TemplateKind::DailyStatus, None);
        info!("daily status queued for groups {:?}", dispatched);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_values() {
        let policy = SupervisorPolicy::default();
        assert_eq!(policy.warning_ack_timeout, Duration::from_secs(60));
        assert_eq!(policy.net_recheck_interval, Duration::from_secs(30));
        assert!(policy.relay_on_mail_failure);
        assert!(policy.ota_manifest_url.is_none());
    }
}
