//! # Mail Agent
//!
//! Asynchronous, bounded, priority-ordered SMTPS sender.
//!
//! Submissions go through a capacity-5 queue ([`queue`]) that orders by
//! priority and never blocks the caller; a single worker task drains it,
//! sending through a [`MailTransport`] (SMTPS on 465 by default, STARTTLS
//! on 587) with a 15 s wall timeout per attempt. Transient SMTP failures
//! retry with bounded exponential backoff; permanent failures (5xx, auth
//! rejection) do not.
//!
//! Final-notification items are deduplicated against restarts: success for
//! a group is recorded in the scheduler's persisted runtime before the item
//! leaves the queue, and enqueue skips groups already marked sent.

pub mod agent;
pub mod queue;
pub mod templates;

pub use agent::{start_mail_agent, MailAgentHandle, MailEvent, OutboundMail, SmtpsTransport};
pub use agent::MailTransport;
pub use queue::{MailOrigin, MailPriority, MailQueue, QueuedMail};
pub use templates::TemplateKind;

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;

/// Maximum delivery attempts per queued item.
pub const MAX_RETRIES: u32 = 3;

/// Bounded queue capacity.
pub const MAIL_QUEUE_CAPACITY: usize = 5;

/// Wall timeout for one SMTP conversation.
pub const SMTP_SEND_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail queue full")]
    QueueFull,

    #[error("smtp transient failure{}: {msg}", fmt_code(.code))]
    Transient { code: Option<u16>, msg: String },

    #[error("smtp permanent failure{}: {msg}", fmt_code(.code))]
    Permanent { code: Option<u16>, msg: String },

    #[error("no network connectivity")]
    NoNetwork,

    #[error("send timed out")]
    Timeout,

    #[error("mail configuration invalid: {0}")]
    Config(String),
}

fn fmt_code(code: &Option<u16>) -> String {
    match code {
        Some(code) => format!(" ({})", code),
        None => String::new(),
    }
}

impl MailError {
    /// Permanent failures skip the retry loop entirely.
    pub fn is_permanent(&self) -> bool {
        matches!(self, MailError::Permanent { .. } | MailError::Config(_))
    }

    pub fn smtp_code(&self) -> Option<u16> {
        match self {
            MailError::Transient { code, .. } | MailError::Permanent { code, .. } => *code,
            _ => None,
        }
    }
}

/// Outcome of a synchronous send or connection test.
#[derive(Debug, Clone)]
pub struct MailResult {
    pub success: bool,
    pub smtp_code: Option<u16>,
    pub error: Option<String>,
    pub send_time_ms: u64,
}

impl MailResult {
    pub(crate) fn ok(send_time_ms: u64) -> Self {
        Self {
            success: true,
            smtp_code: None,
            error: None,
            send_time_ms,
        }
    }

    pub(crate) fn failed(err: &MailError, send_time_ms: u64) -> Self {
        Self {
            success: false,
            smtp_code: err.smtp_code(),
            error: Some(err.to_string()),
            send_time_ms,
        }
    }
}

/// Lock-free delivery counters shared between the worker and its handle.
#[derive(Debug, Default)]
pub(crate) struct StatsInner {
    pub sent: AtomicU64,
    pub failed: AtomicU64,
    pub retries: AtomicU64,
    /// Epoch milliseconds of the last successful send; 0 means never.
    pub last_send_epoch_ms: AtomicU64,
}

impl StatsInner {
    pub fn record_success(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now().timestamp_millis().max(0) as u64;
        self.last_send_epoch_ms.store(now, Ordering::Relaxed);
    }
}

/// Snapshot of the agent's counters.
#[derive(Debug, Clone, Default)]
pub struct MailStats {
    pub total_sent: u64,
    pub total_failed: u64,
    pub total_retries: u64,
    pub queue_depth: usize,
    pub last_send: Option<DateTime<Utc>>,
}

impl MailStats {
    pub(crate) fn from_inner(inner: &StatsInner, queue_depth: usize) -> Self {
        let last = inner.last_send_epoch_ms.load(Ordering::Relaxed);
        Self {
            total_sent: inner.sent.load(Ordering::Relaxed),
            total_failed: inner.failed.load(Ordering::Relaxed),
            total_retries: inner.retries.load(Ordering::Relaxed),
            queue_depth,
            last_send: (last > 0)
                .then(|| Utc.timestamp_millis_opt(last as i64).single())
                .flatten(),
        }
    }
}
