//! Message templates.
//!
//! Each outbound message is composed from a template kind plus the target
//! group's settings. Warning and alarm messages prefer the group's custom
//! subject and body; empty strings fall back to the built-in defaults.
//! Test, reset and status messages always use the built-ins.

use chrono::{DateTime, Utc};

use crate::config::MailGroup;

/// Kinds of templated messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Test,
    Warning { remaining_minutes: u64 },
    Alarm,
    ResetNotification,
    DailyStatus,
}

impl TemplateKind {
    pub fn label(&self) -> &'static str {
        match self {
            TemplateKind::Test => "test",
            TemplateKind::Warning { .. } => "warning",
            TemplateKind::Alarm => "alarm",
            TemplateKind::ResetNotification => "reset",
            TemplateKind::DailyStatus => "daily-status",
        }
    }

    /// Callback URLs fire only for warning and alarm deliveries.
    pub fn fires_callback(&self) -> bool {
        matches!(self, TemplateKind::Warning { .. } | TemplateKind::Alarm)
    }
}

/// Device-side facts available to every template.
#[derive(Debug, Clone)]
pub struct TemplateContext {
    pub device_id: String,
    pub remaining_seconds: u64,
    pub total_seconds: u64,
    pub wall_clock: Option<DateTime<Utc>>,
}

impl TemplateContext {
    fn timestamp(&self) -> String {
        match self.wall_clock {
            Some(ts) => ts.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            None => "---".to_string(),
        }
    }
}

/// Composed subject and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Composed {
    pub subject: String,
    pub body: String,
    pub is_html: bool,
}

/// Build the message for `kind` addressed to `group`.
pub fn compose(kind: TemplateKind, group: &MailGroup, ctx: &TemplateContext) -> Composed {
    match kind {
        TemplateKind::Test => Composed {
            subject: format!("[{}] Test message", ctx.device_id),
            body: format!(
                "This is a test message from dead-man's-switch {}.\n\
                 If you can read this, mail delivery works.\n\nSent: {}",
                ctx.device_id,
                ctx.timestamp()
            ),
            is_html: false,
        },
        TemplateKind::Warning { remaining_minutes } => {
            let subject = if group.subject.is_empty() {
                format!("[{}] Warning: check-in required", ctx.device_id)
            } else {
                group.subject.clone()
            };
            let body = if group.body.is_empty() {
                format!(
                    "No alive signal has been received by {}.\n\
                     The alarm fires in about {} minute(s) unless the switch is reset.\n\n\
                     Sent: {}",
                    ctx.device_id,
                    remaining_minutes,
                    ctx.timestamp()
                )
            } else {
                group.body.clone()
            };
            Composed {
                subject,
                body,
                is_html: false,
            }
        }
        TemplateKind::Alarm => {
            let subject = if group.subject.is_empty() {
                format!("[{}] ALARM: interval elapsed", ctx.device_id)
            } else {
                group.subject.clone()
            };
            let body = if group.body.is_empty() {
                format!(
                    "The full interval elapsed without an alive signal on {}.\n\
                     This is the final notification; the relay output has been triggered.\n\n\
                     Sent: {}",
                    ctx.device_id,
                    ctx.timestamp()
                )
            } else {
                group.body.clone()
            };
            Composed {
                subject,
                body,
                is_html: false,
            }
        }
        TemplateKind::ResetNotification => Composed {
            subject: format!("[{}] Countdown reset", ctx.device_id),
            body: format!(
                "An alive signal reset the countdown on {}.\n\
                 Next full interval: {} second(s).\n\nSent: {}",
                ctx.device_id,
                ctx.total_seconds,
                ctx.timestamp()
            ),
            is_html: false,
        },
        TemplateKind::DailyStatus => Composed {
            subject: format!("[{}] Daily status", ctx.device_id),
            body: format!(
                "Daily report from {}.\n\
                 Remaining: {} of {} second(s).\n\nSent: {}",
                ctx.device_id,
                ctx.remaining_seconds,
                ctx.total_seconds,
                ctx.timestamp()
            ),
            is_html: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TemplateContext {
        TemplateContext {
            device_id: "LS-TEST000001".into(),
            remaining_seconds: 120,
            total_seconds: 300,
            wall_clock: None,
        }
    }

    #[test]
    fn custom_strings_win_for_alarm() {
        let group = MailGroup {
            subject: "Goodbye".into(),
            body: "Open the envelope in the safe.".into(),
            ..MailGroup::default()
        };
        let composed = compose(TemplateKind::Alarm, &group, &ctx());
        assert_eq!(composed.subject, "Goodbye");
        assert_eq!(composed.body, "Open the envelope in the safe.");
    }

    #[test]
    fn empty_strings_fall_back_to_defaults() {
        let group = MailGroup::default();
        let composed = compose(
            TemplateKind::Warning {
                remaining_minutes: 2,
            },
            &group,
            &ctx(),
        );
        assert!(composed.subject.contains("LS-TEST000001"));
        assert!(composed.body.contains("2 minute"));
    }

    #[test]
    fn test_template_ignores_group_strings() {
        let group = MailGroup {
            subject: "custom".into(),
            body: "custom".into(),
            ..MailGroup::default()
        };
        let composed = compose(TemplateKind::Test, &group, &ctx());
        assert!(composed.subject.contains("Test message"));
    }

    #[test]
    fn callback_rules() {
        assert!(TemplateKind::Alarm.fires_callback());
        assert!(TemplateKind::Warning {
            remaining_minutes: 1
        }
        .fires_callback());
        assert!(!TemplateKind::Test.fires_callback());
        assert!(!TemplateKind::ResetNotification.fires_callback());
    }
}
