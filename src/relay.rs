//! Relay output driver.
//!
//! The relay is the mechanical fallback of the switch: it must fire even
//! when every notification fails. Timing follows the configured profile:
//! an optional delay before energising, then either a steady output or a
//! pulse train, and an optional automatic cut-off after a duration
//! (duration zero latches until [`RelayDriver::off`]).
//!
//! The GPIO itself sits behind [`RelayPin`]; the driver only decides
//! *when* the logical output is energised and translates through the
//! inverted flag. [`LogPin`] is the host implementation.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

/// Relay timing profile, persisted as `relay.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    /// true: energised output drives the pin low.
    pub inverted: bool,
    /// Wait before energising (0 = immediately).
    pub delay_seconds: u32,
    /// Automatic cut-off (0 = latched until turned off).
    pub duration_seconds: u32,
    pub pulse_enabled: bool,
    pub pulse_on_ms: u32,
    pub pulse_off_ms: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            inverted: false,
            delay_seconds: 0,
            duration_seconds: 0,
            pulse_enabled: false,
            pulse_on_ms: 500,
            pulse_off_ms: 500,
        }
    }
}

/// Physical pin seam.
pub trait RelayPin: Send + Sync {
    fn set_level(&self, high: bool);
}

/// Host pin: transitions go to the log.
pub struct LogPin;

impl RelayPin for LogPin {
    fn set_level(&self, high: bool) {
        info!("relay pin -> {}", if high { "HIGH" } else { "LOW" });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Delay,
    Active,
    Pulsing,
}

/// Read-only snapshot for the status surface.
#[derive(Debug, Clone)]
pub struct RelayStatus {
    pub state: RelayState,
    pub energised: bool,
    pub trigger_count: u32,
    pub pulse_count: u64,
}

pub struct RelayDriver {
    pin: Arc<dyn RelayPin>,
    config: Mutex<RelayConfig>,
    energised: AtomicBool,
    running: AtomicBool,
    /// Invalidates an in-flight timing task when off() preempts it.
    generation: AtomicU64,
    trigger_count: AtomicU32,
    pulse_count: AtomicU64,
}

impl RelayDriver {
    pub fn new(pin: Arc<dyn RelayPin>, config: RelayConfig) -> Arc<Self> {
        let driver = Arc::new(Self {
            pin,
            config: Mutex::new(config),
            energised: AtomicBool::new(false),
            running: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            trigger_count: AtomicU32::new(0),
            pulse_count: AtomicU64::new(0),
        });
        // Known de-energised level at startup.
        driver.apply(false);
        driver
    }

    pub fn configure(&self, config: RelayConfig) {
        *self.config.lock().expect("relay config poisoned") = config;
    }

    pub fn config(&self) -> RelayConfig {
        self.config.lock().expect("relay config poisoned").clone()
    }

    /// Run the configured sequence: delay, energise (steady or pulsing),
    /// optional automatic cut-off. A trigger while a sequence runs is
    /// ignored.
    pub fn trigger(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("relay trigger ignored, sequence already running");
            return;
        }
        self.trigger_count.fetch_add(1, Ordering::Relaxed);
        let generation = self.generation.load(Ordering::SeqCst);
        let driver = self.clone();
        tokio::spawn(async move {
            driver.run_sequence(generation).await;
        });
    }

    /// Energise immediately, skipping delay and duration handling.
    pub fn on(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.apply(true);
    }

    /// De-energise and cancel any in-flight sequence.
    pub fn off(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.apply(false);
    }

    pub fn is_energised(&self) -> bool {
        self.energised.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> RelayStatus {
        let state = if self.running.load(Ordering::SeqCst) {
            let config = self.config();
            if self.is_energised() {
                if config.pulse_enabled {
                    RelayState::Pulsing
                } else {
                    RelayState::Active
                }
            } else {
                RelayState::Delay
            }
        } else if self.is_energised() {
            RelayState::Active
        } else {
            RelayState::Idle
        };
        RelayStatus {
            state,
            energised: self.is_energised(),
            trigger_count: self.trigger_count.load(Ordering::Relaxed),
            pulse_count: self.pulse_count.load(Ordering::Relaxed),
        }
    }

    async fn run_sequence(self: Arc<Self>, generation: u64) {
        let config = self.config();
        info!(
            "relay sequence: delay={}s duration={}s pulse={}",
            config.delay_seconds, config.duration_seconds, config.pulse_enabled
        );

        if config.delay_seconds > 0 {
            sleep(Duration::from_secs(u64::from(config.delay_seconds))).await;
            if self.cancelled(generation) {
                return;
            }
        }

        let deadline = (config.duration_seconds > 0).then(|| {
            tokio::time::Instant::now() + Duration::from_secs(u64::from(config.duration_seconds))
        });

        if config.pulse_enabled {
            let on = Duration::from_millis(u64::from(config.pulse_on_ms.max(1)));
            let off = Duration::from_millis(u64::from(config.pulse_off_ms.max(1)));
            loop {
                if self.cancelled(generation) {
                    return;
                }
                self.apply(true);
                self.pulse_count.fetch_add(1, Ordering::Relaxed);
                sleep(on).await;
                self.apply(false);
                sleep(off).await;
                if let Some(deadline) = deadline {
                    if tokio::time::Instant::now() >= deadline {
                        break;
                    }
                }
            }
        } else {
            self.apply(true);
            if let Some(deadline) = deadline {
                tokio::time::sleep_until(deadline).await;
            } else {
                // Latched: stay energised until off().
                self.running.store(false, Ordering::SeqCst);
                return;
            }
        }

        if !self.cancelled(generation) {
            self.apply(false);
            self.running.store(false, Ordering::SeqCst);
        }
    }

    fn cancelled(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }

    fn apply(&self, energised: bool) {
        self.energised.store(energised, Ordering::SeqCst);
        let inverted = self.config.lock().expect("relay config poisoned").inverted;
        self.pin.set_level(level_for(energised, inverted));
    }
}

/// Physical level for a logical energy state.
fn level_for(energised: bool, inverted: bool) -> bool {
    energised != inverted
}
