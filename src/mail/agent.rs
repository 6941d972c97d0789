//! Mail worker: queue drain, SMTPS delivery, retry with backoff, dedup.
//!
//! The agent owns its queue and in-flight items; callers interact through
//! [`MailAgentHandle`], which is cheap to clone. A single worker task pops
//! the queue (waiting at most one second so it can observe the shutdown
//! flag), sends through the configured [`MailTransport`], and reports every
//! terminal outcome on the event channel the supervisor listens to.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

use super::queue::{MailOrigin, MailPriority, MailQueue, QueuedMail};
use super::templates::{self, TemplateContext, TemplateKind};
use super::{MailError, MailResult, MailStats, StatsInner, MAX_RETRIES, SMTP_SEND_TIMEOUT_SECS};
use crate::config::MailConfig;
use crate::scheduler::SchedulerHandle;

/// Ceiling for the exponential retry backoff.
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// How long the worker waits on an empty queue before re-checking the
/// shutdown flag.
const POP_WAIT: Duration = Duration::from_secs(1);

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// A fully composed message ready for the wire.
#[derive(Debug, Clone)]
pub struct OutboundMail {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub is_html: bool,
    pub attachments: Vec<String>,
    /// Best-effort GET issued after a successful send.
    pub callback_url: Option<String>,
}

/// Transport seam: the production implementation speaks SMTPS through
/// lettre; tests substitute a scripted one.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Full delivery of one message.
    async fn send(&self, config: &MailConfig, mail: &OutboundMail) -> Result<(), MailError>;

    /// Handshake only (connect, EHLO, TLS, AUTH), no message body.
    async fn handshake(&self, config: &MailConfig) -> Result<(), MailError>;
}

/// lettre-backed SMTPS transport. Port 587 selects STARTTLS, anything else
/// implicit TLS.
pub struct SmtpsTransport;

impl SmtpsTransport {
    fn build(config: &MailConfig) -> Result<AsyncSmtpTransport<Tokio1Executor>, MailError> {
        if config.smtp_server.is_empty() {
            return Err(MailError::Config("smtp server not configured".into()));
        }
        let builder = if config.smtp_port == 587 {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_server)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_server)
        }
        .map_err(|e| MailError::Config(e.to_string()))?;

        let mut builder = builder
            .port(config.smtp_port)
            .timeout(Some(Duration::from_secs(SMTP_SEND_TIMEOUT_SECS)));
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }
        Ok(builder.build())
    }

    fn classify(e: lettre::transport::smtp::Error) -> MailError {
        let code = e.status().and_then(|c| c.to_string().parse::<u16>().ok());
        if e.is_permanent() {
            MailError::Permanent {
                code,
                msg: e.to_string(),
            }
        } else {
            MailError::Transient {
                code,
                msg: e.to_string(),
            }
        }
    }

    async fn build_message(config: &MailConfig, mail: &OutboundMail) -> Result<Message, MailError> {
        let from: Mailbox = if config.sender_name.is_empty() {
            config.username.parse()
        } else {
            format!("{} <{}>", config.sender_name, config.username).parse()
        }
        .map_err(|e| MailError::Config(format!("sender address: {}", e)))?;

        let mut builder = Message::builder().from(from).subject(mail.subject.clone());
        for to in &mail.to {
            let mailbox: Mailbox = to
                .parse()
                .map_err(|e| MailError::Config(format!("recipient {}: {}", to, e)))?;
            builder = builder.to(mailbox);
        }

        let body_part = if mail.is_html {
            SinglePart::html(mail.body.clone())
        } else {
            SinglePart::plain(mail.body.clone())
        };

        let mut parts = Vec::new();
        for path in &mail.attachments {
            match tokio::fs::read(path).await {
                Ok(bytes) => {
                    let filename = std::path::Path::new(path)
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or("attachment")
                        .to_string();
                    let content_type = ContentType::parse("application/octet-stream")
                        .map_err(|e| MailError::Config(e.to_string()))?;
                    parts.push(Attachment::new(filename).body(bytes, content_type));
                }
                // A missing attachment is a warning, not a failed send.
                Err(e) => warn!("attachment {} unreadable, skipping: {}", path, e),
            }
        }

        let message = if parts.is_empty() {
            builder.singlepart(body_part)
        } else {
            let mut multipart = MultiPart::mixed().singlepart(body_part);
            for part in parts {
                multipart = multipart.singlepart(part);
            }
            builder.multipart(multipart)
        }
        .map_err(|e| MailError::Config(e.to_string()))?;
        Ok(message)
    }
}

#[async_trait]
impl MailTransport for SmtpsTransport {
    async fn send(&self, config: &MailConfig, mail: &OutboundMail) -> Result<(), MailError> {
        if mail.to.is_empty() {
            return Err(MailError::Config("no recipients".into()));
        }
        let transport = Self::build(config)?;
        let message = Self::build_message(config, mail).await?;
        transport.send(message).await.map_err(Self::classify)?;
        Ok(())
    }

    async fn handshake(&self, config: &MailConfig) -> Result<(), MailError> {
        let transport = Self::build(config)?;
        match transport.test_connection().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(MailError::Transient {
                code: None,
                msg: "smtp server rejected NOOP".into(),
            }),
            Err(e) => Err(Self::classify(e)),
        }
    }
}

/// Terminal outcome of a queued item, published to the supervisor.
#[derive(Debug, Clone)]
pub struct MailEvent {
    pub origin: MailOrigin,
    pub kind: TemplateKind,
    pub success: bool,
    pub error: Option<String>,
}

struct Shared {
    queue: Mutex<MailQueue>,
    notify: Notify,
    shutdown: AtomicBool,
    stats: StatsInner,
    config: Mutex<MailConfig>,
}

/// Cloneable front-end to the mail worker.
#[derive(Clone)]
pub struct MailAgentHandle {
    shared: Arc<Shared>,
    transport: Arc<dyn MailTransport>,
    scheduler: SchedulerHandle,
    device_id: String,
}

impl MailAgentHandle {
    /// Enqueue a composed message. Never blocks; fails with
    /// [`MailError::QueueFull`] when the queue cannot admit the item.
    pub fn send_async(
        &self,
        mail: OutboundMail,
        priority: MailPriority,
        kind: TemplateKind,
        origin: MailOrigin,
    ) -> Result<(), MailError> {
        {
            let mut queue = self.shared.queue.lock().expect("mail queue poisoned");
            queue.enqueue(mail, priority, kind, origin)?;
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Blocking send that bypasses the queue. Used by the *Test
    /// Connection* flow and CLI tooling.
    pub async fn send_sync(&self, mail: OutboundMail) -> MailResult {
        let config = self.config();
        let started = Instant::now();
        let outcome = timeout(
            Duration::from_secs(SMTP_SEND_TIMEOUT_SECS),
            self.transport.send(&config, &mail),
        )
        .await
        .unwrap_or(Err(MailError::Timeout));
        let elapsed = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(()) => {
                self.shared.stats.record_success();
                MailResult::ok(elapsed)
            }
            Err(e) => {
                self.shared.stats.failed.fetch_add(1, Ordering::Relaxed);
                MailResult::failed(&e, elapsed)
            }
        }
    }

    /// SMTP handshake only; no message is produced.
    pub async fn test_connection(&self) -> MailResult {
        let config = self.config();
        let started = Instant::now();
        let outcome = timeout(
            Duration::from_secs(SMTP_SEND_TIMEOUT_SECS),
            self.transport.handshake(&config),
        )
        .await
        .unwrap_or(Err(MailError::Timeout));
        let elapsed = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(()) => MailResult::ok(elapsed),
            Err(e) => MailResult::failed(&e, elapsed),
        }
    }

    /// Compose from the group's templates and enqueue one multi-recipient
    /// message for group `group_idx`.
    pub fn send_to_group(&self, group_idx: usize, kind: TemplateKind) -> Result<(), MailError> {
        let config = self.config();
        let group = config
            .groups
            .get(group_idx)
            .ok_or_else(|| MailError::Config(format!("no mail group {}", group_idx)))?;
        if group.recipients.is_empty() {
            return Err(MailError::Config(format!(
                "mail group {} has no recipients",
                group_idx
            )));
        }
        let composed = templates::compose(kind, group, &self.template_context());
        let callback_url = (kind.fires_callback() && !group.get_url.is_empty())
            .then(|| group.get_url.clone());
        let mail = OutboundMail {
            to: group.recipients.clone(),
            subject: composed.subject,
            body: composed.body,
            is_html: composed.is_html,
            attachments: group.attachments.clone(),
            callback_url,
        };
        let origin = match kind {
            TemplateKind::Alarm => MailOrigin::Final { group: group_idx },
            TemplateKind::Warning { .. } => MailOrigin::Warning {
                alarm_index: 0,
                group: group_idx,
            },
            _ => MailOrigin::Adhoc,
        };
        self.send_async(mail, priority_for(kind), kind, origin)
    }

    /// Dispatch `kind` to every enabled group with recipients; returns the
    /// group indices actually enqueued.
    ///
    /// For the final (`Alarm`) template the per-group sent flags in the
    /// scheduler runtime are consulted under the scheduler mutex, so a
    /// restart mid-final does not re-fire delivered groups.
    pub fn send_to_all_enabled_groups(
        &self,
        kind: TemplateKind,
        alarm_index: Option<usize>,
    ) -> Vec<usize> {
        let config = self.config();
        let ctx = self.template_context();
        let mut dispatched = Vec::new();
        for (group_idx, group) in config.enabled_groups() {
            if group.recipients.is_empty() {
                continue;
            }
            let origin = match kind {
                TemplateKind::Alarm => {
                    if self.scheduler.group_already_sent(group_idx) {
                        debug!("final group {} already sent, skipping", group_idx);
                        continue;
                    }
                    MailOrigin::Final { group: group_idx }
                }
                TemplateKind::Warning { .. } => MailOrigin::Warning {
                    alarm_index: alarm_index.unwrap_or(0),
                    group: group_idx,
                },
                _ => MailOrigin::Adhoc,
            };
            let composed = templates::compose(kind, group, &ctx);
            let callback_url = (kind.fires_callback() && !group.get_url.is_empty())
                .then(|| group.get_url.clone());
            let mail = OutboundMail {
                to: group.recipients.clone(),
                subject: composed.subject,
                body: composed.body,
                is_html: composed.is_html,
                attachments: group.attachments.clone(),
                callback_url,
            };
            match self.send_async(mail, priority_for(kind), kind, origin) {
                Ok(()) => dispatched.push(group_idx),
                Err(e) => error!(
                    "failed to enqueue {} for group {}: {}",
                    kind.label(),
                    group_idx,
                    e
                ),
            }
        }
        dispatched
    }

    pub fn stats(&self) -> MailStats {
        let depth = self.shared.queue.lock().expect("mail queue poisoned").len();
        MailStats::from_inner(&self.shared.stats, depth)
    }

    pub fn update_config(&self, config: MailConfig) {
        *self.shared.config.lock().expect("mail config poisoned") = config;
    }

    pub fn config(&self) -> MailConfig {
        self.shared
            .config
            .lock()
            .expect("mail config poisoned")
            .clone()
    }

    /// Ask the worker to stop after the in-flight item, if any.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
    }

    fn template_context(&self) -> TemplateContext {
        let status = self.scheduler.status();
        TemplateContext {
            device_id: self.device_id.clone(),
            remaining_seconds: status.remaining_seconds,
            total_seconds: status.total_seconds,
            wall_clock: Some(chrono::Utc::now()),
        }
    }
}

fn priority_for(kind: TemplateKind) -> MailPriority {
    match kind {
        TemplateKind::Alarm | TemplateKind::Warning { .. } => MailPriority::High,
        TemplateKind::Test | TemplateKind::ResetNotification => MailPriority::Normal,
        TemplateKind::DailyStatus => MailPriority::Low,
    }
}

/// Spawn the worker and return its handle plus the join handle.
pub fn start_mail_agent(
    config: MailConfig,
    transport: Arc<dyn MailTransport>,
    scheduler: SchedulerHandle,
    device_id: String,
    events: mpsc::UnboundedSender<MailEvent>,
) -> (MailAgentHandle, JoinHandle<()>) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(MailQueue::default()),
        notify: Notify::new(),
        shutdown: AtomicBool::new(false),
        stats: StatsInner::default(),
        config: Mutex::new(config),
    });
    let handle = MailAgentHandle {
        shared: shared.clone(),
        transport: transport.clone(),
        scheduler: scheduler.clone(),
        device_id,
    };

    let join = tokio::spawn(async move {
        worker_loop(shared, transport, scheduler, events).await;
    });
    (handle, join)
}

async fn worker_loop(
    shared: Arc<Shared>,
    transport: Arc<dyn MailTransport>,
    scheduler: SchedulerHandle,
    events: mpsc::UnboundedSender<MailEvent>,
) {
    let http = reqwest::Client::builder()
        .timeout(CALLBACK_TIMEOUT)
        .build()
        .ok();
    info!("mail worker started");

    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        let item = {
            let mut queue = shared.queue.lock().expect("mail queue poisoned");
            queue.pop()
        };
        let Some(mut item) = item else {
            let _ = timeout(POP_WAIT, shared.notify.notified()).await;
            continue;
        };

        item.attempts += 1;
        let config = shared.config.lock().expect("mail config poisoned").clone();
        let outcome = timeout(
            Duration::from_secs(SMTP_SEND_TIMEOUT_SECS),
            transport.send(&config, &item.mail),
        )
        .await
        .unwrap_or(Err(MailError::Timeout));

        match outcome {
            Ok(()) => {
                // Record group delivery in the persisted runtime before the
                // item is dropped, so a crash right here cannot re-fire the
                // group after reboot.
                if let MailOrigin::Final { group } = item.origin {
                    if let Err(e) = scheduler.mark_group_sent(group) {
                        error!("failed to persist final flag for group {}: {}", group, e);
                    }
                }
                shared.stats.record_success();
                info!(
                    "{} mail delivered to {} recipient(s) (attempt {})",
                    item.kind.label(),
                    item.mail.to.len(),
                    item.attempts
                );
                if let (Some(url), Some(client)) = (&item.mail.callback_url, &http) {
                    fire_callback(client, url).await;
                }
                let _ = events.send(MailEvent {
                    origin: item.origin,
                    kind: item.kind,
                    success: true,
                    error: None,
                });
            }
            Err(e) if e.is_permanent() || item.attempts >= MAX_RETRIES => {
                shared
                    .stats
                    .failed
                    .fetch_add(u64::from(item.attempts), Ordering::Relaxed);
                error!(
                    "{} mail failed terminally after {} attempt(s): {}",
                    item.kind.label(),
                    item.attempts,
                    e
                );
                let _ = events.send(MailEvent {
                    origin: item.origin,
                    kind: item.kind,
                    success: false,
                    error: Some(e.to_string()),
                });
            }
            Err(e) => {
                let backoff = backoff_for(item.attempts);
                warn!(
                    "{} mail attempt {} failed ({}), retrying in {:?}",
                    item.kind.label(),
                    item.attempts,
                    e,
                    backoff
                );
                shared.stats.retries.fetch_add(1, Ordering::Relaxed);
                {
                    let mut queue = shared.queue.lock().expect("mail queue poisoned");
                    queue.requeue(item);
                }
                sleep(backoff).await;
            }
        }
    }
    info!("mail worker stopped");
}

/// Bounded exponential backoff: `min(2^attempt seconds, 30 s)`.
fn backoff_for(attempt: u32) -> Duration {
    let secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(BACKOFF_CAP)
}

async fn fire_callback(client: &reqwest::Client, url: &str) {
    match client.get(url).send().await {
        Ok(resp) if resp.status().is_success() => {
            debug!("callback GET {} ok", url);
        }
        Ok(resp) => warn!("callback GET {} returned {}", url, resp.status()),
        Err(e) => warn!("callback GET {} failed: {}", url, e),
    }
}
