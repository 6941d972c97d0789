//! Test utilities & fixtures shared by the integration suites.

use std::sync::Arc;

use lifesign::config::{ConfigStore, MailConfig, MailGroup, TimerSettings, TimerUnit};
use lifesign::device::ManualClock;

/// Fresh data directory plus store.
pub fn store() -> (tempfile::TempDir, ConfigStore) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = ConfigStore::open(tmp.path()).expect("open store");
    (tmp, store)
}

/// A store pre-seeded with timer settings and a manual clock at t=0.
pub fn seeded_store(
    unit: TimerUnit,
    total_value: u16,
    alarm_count: u8,
) -> (tempfile::TempDir, ConfigStore, Arc<ManualClock>) {
    let (tmp, store) = store();
    store
        .save_timer_settings(&TimerSettings {
            unit,
            total_value,
            alarm_count,
            enabled: true,
        })
        .expect("save settings");
    (tmp, store, Arc::new(ManualClock::new(0)))
}

/// Mail config with `n` enabled single-recipient groups.
pub fn mail_config(groups: usize) -> MailConfig {
    MailConfig {
        smtp_server: "smtp.example.org".into(),
        smtp_port: 465,
        username: "switch@example.org".into(),
        password: "secret".into(),
        sender_name: "LifeSign".into(),
        groups: (0..groups)
            .map(|i| MailGroup {
                name: format!("group-{}", i),
                enabled: true,
                recipients: vec![format!("recipient{}@example.org", i)],
                ..MailGroup::default()
            })
            .collect(),
        ..MailConfig::default()
    }
}
