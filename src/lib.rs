//! # LifeSign - Dead-Man's-Switch Controller
//!
//! LifeSign is the controller daemon for a small networked dead-man's-switch
//! device. A human periodically signals "I am alive" (physical button, web
//! request, or an authenticated remote GET). If the configured interval
//! elapses without such a signal, the controller first emits escalating
//! warning notifications, then triggers the alarm: it energises a relay
//! output and dispatches a final notification to each configured recipient
//! group.
//!
//! ## Core subsystems
//!
//! - [`scheduler`] - Countdown scheduler: monotonic deadline arithmetic,
//!   alarm-point generation, pause/resume, persistence that survives restart
//!   and clock wrap, at-least-once alarm delivery.
//! - [`mail`] - Mail agent: bounded priority queue, SMTPS worker with retry
//!   and backoff, per-group templates, restart dedup for final deliveries.
//! - [`net`] - Network controller: primary/secondary/open connection state
//!   machine, scan cache, static IP, mDNS advertisement, captive fallback
//!   access point for setup.
//! - [`supervisor`] - Wires the three together at 1 Hz, fans in alive
//!   signals and drives the relay on the final.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use lifesign::config::ConfigStore;
//! use lifesign::device::{DeviceId, SystemTimeSource};
//! use lifesign::scheduler::{CountdownScheduler, SchedulerHandle};
//!
//! # fn main() -> anyhow::Result<()> {
//! let store = ConfigStore::open("./data")?;
//! let clock = Arc::new(SystemTimeSource::new());
//! let device_id = DeviceId::from_mac(store.load_or_create_device_mac()?);
//! let scheduler = SchedulerHandle::new(CountdownScheduler::load(store, clock));
//! println!("device {} remaining {}s", device_id, scheduler.status().remaining_seconds);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! button ─┐                    ┌─> MailAgent ──> SMTPS / callback URLs
//! web ────┼─> Supervisor <─────┤
//! remote ─┘       │            └─> NetController ──> radio / mDNS / AP
//!                 v
//!            Scheduler ── runtime.json (restart-safe)
//!                 │
//!                 └─> RelayDriver (mechanical fallback)
//! ```
//!
//! External collaborators (HTTP router, GPIO, OTA flashing, NTP) appear
//! only as the thin contracts in [`web`], [`relay`], [`button`], [`ota`]
//! and [`device`].

pub mod button;
pub mod config;
pub mod device;
pub mod mail;
pub mod net;
pub mod ota;
pub mod relay;
pub mod scheduler;
pub mod supervisor;
pub mod web;
