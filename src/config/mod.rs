//! # Configuration Management Module
//!
//! All user-facing settings and the persisted runtime state of the
//! controller live in small JSON files under the data directory, one file
//! per concern:
//!
//! | File | Contents |
//! |---|---|
//! | `timer.json` | [`TimerSettings`] |
//! | `runtime.json` | [`TimerRuntime`] |
//! | `mail.json` | [`MailConfig`] (groups layout; legacy flat layout migrated on read) |
//! | `wifi.json` | [`WifiSettings`] |
//! | `api.json` | [`ApiSettings`] |
//! | `relay.json` | [`crate::relay::RelayConfig`] |
//! | `ota_state.json` | [`crate::ota::OtaState`] |
//! | `device_id.json` | first-boot host identity fallback |
//!
//! Field names on disk are camelCase and match the device's historical wire
//! format, so a data directory written by older firmware loads unchanged.
//!
//! Loading never fails: a missing or corrupt file yields defaults (with a
//! warning in the log) and out-of-range values are clamped. Writes are
//! atomic per file: temp file + rename under an exclusive `fs2` lock, so a
//! reader never observes a torn snapshot.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum warning points within one interval.
pub const MAX_ALARMS: usize = 10;
/// Maximum recipient groups.
pub const MAX_GROUPS: usize = 3;
/// Maximum recipient addresses per group.
pub const MAX_RECIPIENTS_PER_GROUP: usize = 10;
/// Maximum stored attachment paths per group.
pub const MAX_ATTACHMENTS_PER_GROUP: usize = 5;

const TIMER_FILE: &str = "timer.json";
const RUNTIME_FILE: &str = "runtime.json";
const MAIL_FILE: &str = "mail.json";
const WIFI_FILE: &str = "wifi.json";
const API_FILE: &str = "api.json";
const RELAY_FILE: &str = "relay.json";
const OTA_STATE_FILE: &str = "ota_state.json";
const DEVICE_ID_FILE: &str = "device_id.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Countdown interval unit. Stored on disk as `0|1|2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum TimerUnit {
    Minutes,
    Hours,
    Days,
}

impl TimerUnit {
    /// One unit expressed in seconds.
    pub fn step_seconds(self) -> u64 {
        match self {
            TimerUnit::Minutes => 60,
            TimerUnit::Hours => 60 * 60,
            TimerUnit::Days => 24 * 60 * 60,
        }
    }
}

impl From<TimerUnit> for u8 {
    fn from(unit: TimerUnit) -> u8 {
        match unit {
            TimerUnit::Minutes => 0,
            TimerUnit::Hours => 1,
            TimerUnit::Days => 2,
        }
    }
}

impl TryFrom<u8> for TimerUnit {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TimerUnit::Minutes),
            1 => Ok(TimerUnit::Hours),
            // Anything else collapses to days, matching the device's
            // historical reader.
            _ => Ok(TimerUnit::Days),
        }
    }
}

/// User-chosen countdown period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimerSettings {
    pub unit: TimerUnit,
    pub total_value: u16,
    pub alarm_count: u8,
    pub enabled: bool,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            unit: TimerUnit::Hours,
            total_value: 24,
            alarm_count: 2,
            enabled: false,
        }
    }
}

impl TimerSettings {
    /// Clamp to the accepted ranges: `total_value` in 1..=60,
    /// `alarm_count` in 0..=10.
    pub fn clamped(mut self) -> Self {
        self.total_value = self.total_value.clamp(1, 60);
        self.alarm_count = self.alarm_count.min(MAX_ALARMS as u8);
        self
    }

    /// Whole interval in seconds.
    pub fn total_seconds(&self) -> u64 {
        u64::from(self.total_value) * self.unit.step_seconds()
    }
}

fn groups_sent_from_vec<'de, D>(deserializer: D) -> Result<[bool; MAX_GROUPS], D::Error>
where
    D: serde::Deserializer<'de>,
{
    // Tolerate shorter arrays from older firmware; missing slots read false.
    let raw: Vec<bool> = Vec::deserialize(deserializer)?;
    let mut out = [false; MAX_GROUPS];
    for (slot, value) in out.iter_mut().zip(raw) {
        *slot = value;
    }
    Ok(out)
}

/// Persisted transient state of the countdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TimerRuntime {
    pub timer_active: bool,
    pub paused: bool,
    /// Deadline on the monotonic clock, in milliseconds.
    pub deadline_millis: u64,
    pub remaining_seconds: u64,
    pub next_alarm_index: usize,
    pub final_triggered: bool,
    #[serde(deserialize_with = "groups_sent_from_vec")]
    pub final_groups_sent: [bool; MAX_GROUPS],
}

/// A named set of recipients sharing a subject/body template and an
/// optional callback URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct MailGroup {
    pub name: String,
    pub enabled: bool,
    pub subject: String,
    pub body: String,
    pub get_url: String,
    pub recipients: Vec<String>,
    pub attachments: Vec<String>,
}

impl MailGroup {
    fn clamp(&mut self) {
        self.recipients.truncate(MAX_RECIPIENTS_PER_GROUP);
        self.attachments.truncate(MAX_ATTACHMENTS_PER_GROUP);
    }
}

/// SMTP account plus recipient groups.
///
/// Deserialization accepts both the current group layout and the legacy
/// flat layout (`recipients[]`, `warning{}`, `final{}`, `attachments[]`);
/// the legacy fields are folded into group 0 and superseded on the next
/// save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "MailConfigFile")]
pub struct MailConfig {
    pub smtp_server: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    pub sender_name: String,
    pub daily_status_enabled: bool,
    #[serde(rename = "mailGroups")]
    pub groups: Vec<MailGroup>,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            smtp_server: String::new(),
            smtp_port: 465,
            username: String::new(),
            password: String::new(),
            sender_name: String::new(),
            daily_status_enabled: false,
            groups: Vec::new(),
        }
    }
}

impl MailConfig {
    pub fn enabled_groups(&self) -> impl Iterator<Item = (usize, &MailGroup)> {
        self.groups.iter().enumerate().filter(|(_, g)| g.enabled)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct LegacyContent {
    subject: String,
    body: String,
    get_url: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct LegacyAttachment {
    stored_path: String,
}

/// On-disk shape, including legacy fields read only for migration.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct MailConfigFile {
    smtp_server: String,
    smtp_port: u16,
    username: String,
    password: String,
    sender_name: String,
    daily_status_enabled: bool,
    mail_groups: Option<Vec<MailGroup>>,
    recipients: Vec<String>,
    #[serde(rename = "final")]
    final_content: Option<LegacyContent>,
    attachments: Vec<LegacyAttachment>,
}

impl Default for MailConfigFile {
    fn default() -> Self {
        Self {
            smtp_server: String::new(),
            smtp_port: 465,
            username: String::new(),
            password: String::new(),
            sender_name: String::new(),
            daily_status_enabled: false,
            mail_groups: None,
            recipients: Vec::new(),
            final_content: None,
            attachments: Vec::new(),
        }
    }
}

impl From<MailConfigFile> for MailConfig {
    fn from(file: MailConfigFile) -> Self {
        let mut groups = match file.mail_groups {
            Some(groups) => groups,
            None => match file.final_content {
                // Legacy layout: the flat "final" content becomes group 0
                // with the flat recipient and attachment lists.
                Some(final_content) => vec![MailGroup {
                    name: "Default".to_string(),
                    enabled: true,
                    subject: final_content.subject,
                    body: final_content.body,
                    get_url: final_content.get_url,
                    recipients: file.recipients,
                    attachments: file
                        .attachments
                        .into_iter()
                        .map(|a| a.stored_path)
                        .filter(|p| !p.is_empty())
                        .collect(),
                }],
                None => Vec::new(),
            },
        };
        groups.truncate(MAX_GROUPS);
        for group in &mut groups {
            group.clamp();
        }
        Self {
            smtp_server: file.smtp_server,
            smtp_port: file.smtp_port,
            username: file.username,
            password: file.password,
            sender_name: file.sender_name,
            daily_status_enabled: file.daily_status_enabled,
            groups,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_ap_password() -> String {
    "lifesign-setup".to_string()
}

fn default_api_endpoint() -> String {
    "trigger".to_string()
}

/// Known-network and fallback access-point configuration.
///
/// The flat camelCase key layout (`primarySSID`, `primaryStaticEnabled`, …)
/// is the historical wire format; [`WifiSettings::profile`] exposes a typed
/// per-network view for the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WifiSettings {
    #[serde(rename = "primarySSID")]
    pub primary_ssid: String,
    pub primary_password: String,
    #[serde(rename = "secondarySSID")]
    pub secondary_ssid: String,
    pub secondary_password: String,
    pub allow_open_networks: bool,
    #[serde(default = "default_true")]
    pub ap_mode_enabled: bool,
    #[serde(default = "default_ap_password")]
    pub ap_password: String,

    pub primary_static_enabled: bool,
    #[serde(rename = "primaryIP")]
    pub primary_ip: String,
    pub primary_gateway: String,
    pub primary_subnet: String,
    #[serde(rename = "primaryDNS")]
    pub primary_dns: String,
    #[serde(rename = "primaryMDNS")]
    pub primary_mdns: String,

    pub secondary_static_enabled: bool,
    #[serde(rename = "secondaryIP")]
    pub secondary_ip: String,
    pub secondary_gateway: String,
    pub secondary_subnet: String,
    #[serde(rename = "secondaryDNS")]
    pub secondary_dns: String,
    #[serde(rename = "secondaryMDNS")]
    pub secondary_mdns: String,

    /// Field-service network tried ahead of generic open networks.
    /// Opt-in: empty means never.
    #[serde(rename = "manufacturerSSID")]
    pub manufacturer_ssid: String,
    pub manufacturer_password: String,
}

impl Default for WifiSettings {
    fn default() -> Self {
        Self {
            primary_ssid: String::new(),
            primary_password: String::new(),
            secondary_ssid: String::new(),
            secondary_password: String::new(),
            allow_open_networks: false,
            ap_mode_enabled: true,
            ap_password: default_ap_password(),
            primary_static_enabled: false,
            primary_ip: String::new(),
            primary_gateway: String::new(),
            primary_subnet: String::new(),
            primary_dns: String::new(),
            primary_mdns: String::new(),
            secondary_static_enabled: false,
            secondary_ip: String::new(),
            secondary_gateway: String::new(),
            secondary_subnet: String::new(),
            secondary_dns: String::new(),
            secondary_mdns: String::new(),
            manufacturer_ssid: String::new(),
            manufacturer_password: String::new(),
        }
    }
}

/// Which of the two configured station networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownNetwork {
    Primary,
    Secondary,
}

/// Borrowed per-network view over the flat settings.
#[derive(Debug, Clone, Copy)]
pub struct NetworkProfile<'a> {
    pub ssid: &'a str,
    pub password: &'a str,
    pub static_enabled: bool,
    pub static_ip: &'a str,
    pub static_gateway: &'a str,
    pub static_subnet: &'a str,
    pub static_dns: &'a str,
    pub mdns_hostname: &'a str,
}

impl WifiSettings {
    pub fn profile(&self, which: KnownNetwork) -> NetworkProfile<'_> {
        match which {
            KnownNetwork::Primary => NetworkProfile {
                ssid: &self.primary_ssid,
                password: &self.primary_password,
                static_enabled: self.primary_static_enabled,
                static_ip: &self.primary_ip,
                static_gateway: &self.primary_gateway,
                static_subnet: &self.primary_subnet,
                static_dns: &self.primary_dns,
                mdns_hostname: &self.primary_mdns,
            },
            KnownNetwork::Secondary => NetworkProfile {
                ssid: &self.secondary_ssid,
                password: &self.secondary_password,
                static_enabled: self.secondary_static_enabled,
                static_ip: &self.secondary_ip,
                static_gateway: &self.secondary_gateway,
                static_subnet: &self.secondary_subnet,
                static_dns: &self.secondary_dns,
                mdns_hostname: &self.secondary_mdns,
            },
        }
    }
}

/// Remote "alive" endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_endpoint")]
    pub endpoint: String,
    pub require_token: bool,
    pub token: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_api_endpoint(),
            require_token: false,
            token: String::new(),
        }
    }
}

/// First-boot host identity fallback, stored when no hardware MAC is
/// readable.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct DeviceIdRecord {
    mac: [u8; 6],
}

/// Typed accessor over the per-file JSON store.
///
/// Cheap to clone; every component that persists state holds one.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    data_dir: PathBuf,
}

impl ConfigStore {
    /// Open (creating if needed) the data directory.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn load_timer_settings(&self) -> TimerSettings {
        self.read_or_default::<TimerSettings>(TIMER_FILE).clamped()
    }

    pub fn save_timer_settings(&self, settings: &TimerSettings) -> Result<(), ConfigError> {
        self.write_json(TIMER_FILE, settings)
    }

    pub fn load_runtime(&self) -> TimerRuntime {
        self.read_or_default(RUNTIME_FILE)
    }

    pub fn save_runtime(&self, runtime: &TimerRuntime) -> Result<(), ConfigError> {
        self.write_json(RUNTIME_FILE, runtime)
    }

    pub fn load_mail_config(&self) -> MailConfig {
        self.read_or_default(MAIL_FILE)
    }

    pub fn save_mail_config(&self, config: &MailConfig) -> Result<(), ConfigError> {
        self.write_json(MAIL_FILE, config)
    }

    pub fn load_wifi_settings(&self) -> WifiSettings {
        self.read_or_default(WIFI_FILE)
    }

    pub fn save_wifi_settings(&self, settings: &WifiSettings) -> Result<(), ConfigError> {
        self.write_json(WIFI_FILE, settings)
    }

    pub fn load_api_settings(&self) -> ApiSettings {
        self.read_or_default(API_FILE)
    }

    pub fn save_api_settings(&self, settings: &ApiSettings) -> Result<(), ConfigError> {
        self.write_json(API_FILE, settings)
    }

    pub fn load_relay_config(&self) -> crate::relay::RelayConfig {
        self.read_or_default(RELAY_FILE)
    }

    pub fn save_relay_config(&self, config: &crate::relay::RelayConfig) -> Result<(), ConfigError> {
        self.write_json(RELAY_FILE, config)
    }

    pub fn load_ota_state(&self) -> crate::ota::OtaState {
        self.read_or_default(OTA_STATE_FILE)
    }

    pub fn save_ota_state(&self, state: &crate::ota::OtaState) -> Result<(), ConfigError> {
        self.write_json(OTA_STATE_FILE, state)
    }

    /// Return the persisted host identity, minting and saving a random one
    /// on first use.
    pub fn load_or_create_device_mac(&self) -> Result<[u8; 6], ConfigError> {
        if let Some(record) = self.read_json::<DeviceIdRecord>(DEVICE_ID_FILE) {
            return Ok(record.mac);
        }
        let mut mac = [0u8; 6];
        rand::Rng::fill(&mut rand::thread_rng(), &mut mac[..]);
        self.write_json(DEVICE_ID_FILE, &DeviceIdRecord { mac })?;
        Ok(mac)
    }

    /// Factory reset: remove every regular file in the data directory.
    pub fn erase_all(&self) -> Result<(), ConfigError> {
        for entry in fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    fn read_or_default<T: DeserializeOwned + Default>(&self, name: &str) -> T {
        self.read_json(name).unwrap_or_default()
    }

    fn read_json<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let path = self.data_dir.join(name);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("failed to read {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("failed to parse {}: {}", path.display(), e);
                None
            }
        }
    }

    fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(value)?;
        Self::write_file_locked(&self.data_dir.join(name), &content)
    }

    /// Atomic replace under an exclusive lock: lock the destination, write a
    /// unique temp file in the same directory, rename over the destination,
    /// fsync the directory.
    fn write_file_locked(path: &Path, content: &str) -> Result<(), ConfigError> {
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        lock_file.lock_exclusive()?;

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let base = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("data.json");
        let mut counter = 0u32;
        let tmp_path = loop {
            let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
            match OpenOptions::new().write(true).create_new(true).open(&candidate) {
                Ok(mut tmp) => {
                    tmp.write_all(content.as_bytes())?;
                    tmp.flush()?;
                    let _ = tmp.sync_all();
                    break candidate;
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    counter = counter.saturating_add(1);
                    continue;
                }
                Err(e) => return Err(ConfigError::Io(e)),
            }
        };

        fs::rename(&tmp_path, path)?;

        // Persist the rename itself (best-effort).
        if let Ok(dir_file) = File::open(dir) {
            let _ = dir_file.sync_all();
        }

        drop(lock_file);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ConfigStore) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = ConfigStore::open(tmp.path()).expect("open store");
        (tmp, store)
    }

    #[test]
    fn timer_settings_roundtrip() {
        let (_tmp, store) = store();
        let settings = TimerSettings {
            unit: TimerUnit::Minutes,
            total_value: 5,
            alarm_count: 2,
            enabled: true,
        };
        store.save_timer_settings(&settings).unwrap();
        assert_eq!(store.load_timer_settings(), settings);
    }

    #[test]
    fn timer_settings_clamped_on_load() {
        let (tmp, store) = store();
        std::fs::write(
            tmp.path().join(TIMER_FILE),
            r#"{"unit":1,"totalValue":900,"alarmCount":99,"enabled":true}"#,
        )
        .unwrap();
        let settings = store.load_timer_settings();
        assert_eq!(settings.total_value, 60);
        assert_eq!(settings.alarm_count, MAX_ALARMS as u8);
    }

    #[test]
    fn timer_unit_wire_values() {
        let json = serde_json::to_string(&TimerUnit::Days).unwrap();
        assert_eq!(json, "2");
        let unit: TimerUnit = serde_json::from_str("0").unwrap();
        assert_eq!(unit, TimerUnit::Minutes);
    }

    #[test]
    fn runtime_roundtrip_and_camel_case() {
        let (_tmp, store) = store();
        let runtime = TimerRuntime {
            timer_active: true,
            paused: false,
            deadline_millis: 123_456,
            remaining_seconds: 77,
            next_alarm_index: 1,
            final_triggered: false,
            final_groups_sent: [true, false, false],
        };
        store.save_runtime(&runtime).unwrap();
        assert_eq!(store.load_runtime(), runtime);

        let raw = std::fs::read_to_string(store.data_dir().join(RUNTIME_FILE)).unwrap();
        assert!(raw.contains("deadlineMillis"));
        assert!(raw.contains("finalGroupsSent"));
    }

    #[test]
    fn runtime_tolerates_short_groups_array() {
        let (tmp, store) = store();
        std::fs::write(
            tmp.path().join(RUNTIME_FILE),
            r#"{"timerActive":false,"paused":false,"deadlineMillis":0,
                "remainingSeconds":0,"nextAlarmIndex":0,"finalTriggered":true,
                "finalGroupsSent":[true]}"#,
        )
        .unwrap();
        let runtime = store.load_runtime();
        assert_eq!(runtime.final_groups_sent, [true, false, false]);
        assert!(runtime.final_triggered);
    }

    #[test]
    fn mail_config_roundtrip() {
        let (_tmp, store) = store();
        let config = MailConfig {
            smtp_server: "smtp.example.org".into(),
            smtp_port: 465,
            username: "switch@example.org".into(),
            password: "secret".into(),
            sender_name: "LifeSign".into(),
            daily_status_enabled: false,
            groups: vec![MailGroup {
                name: "Family".into(),
                enabled: true,
                subject: "subject".into(),
                body: "body".into(),
                get_url: String::new(),
                recipients: vec!["a@example.org".into()],
                attachments: vec![],
            }],
        };
        store.save_mail_config(&config).unwrap();
        assert_eq!(store.load_mail_config(), config);
    }

    #[test]
    fn mail_config_migrates_legacy_layout() {
        let (tmp, store) = store();
        std::fs::write(
            tmp.path().join(MAIL_FILE),
            r#"{
                "smtpServer": "smtp.old.org",
                "smtpPort": 587,
                "username": "u",
                "password": "p",
                "recipients": ["one@old.org", "two@old.org"],
                "warning": {"subject": "w", "body": "wb", "getUrl": ""},
                "final": {"subject": "f", "body": "fb", "getUrl": "http://cb"},
                "attachments": [{"displayName": "d", "storedPath": "/data/files/a.pdf",
                                 "size": 10, "forWarning": false, "forFinal": true}]
            }"#,
        )
        .unwrap();
        let config = store.load_mail_config();
        assert_eq!(config.smtp_port, 587);
        assert_eq!(config.groups.len(), 1);
        let group = &config.groups[0];
        assert!(group.enabled);
        assert_eq!(group.subject, "f");
        assert_eq!(group.recipients.len(), 2);
        assert_eq!(group.attachments, vec!["/data/files/a.pdf".to_string()]);
        assert_eq!(group.get_url, "http://cb");

        // A save rewrites only the group layout; reloading still matches.
        store.save_mail_config(&config).unwrap();
        let raw = std::fs::read_to_string(tmp.path().join(MAIL_FILE)).unwrap();
        assert!(raw.contains("mailGroups"));
        assert!(!raw.contains("storedPath"));
        assert_eq!(store.load_mail_config(), config);
    }

    #[test]
    fn wifi_settings_roundtrip_and_defaults() {
        let (tmp, store) = store();
        let settings = WifiSettings {
            primary_ssid: "HomeNet".into(),
            primary_password: "hunter22".into(),
            primary_static_enabled: true,
            primary_ip: "192.168.1.50".into(),
            primary_gateway: "192.168.1.1".into(),
            primary_subnet: "255.255.255.0".into(),
            ..WifiSettings::default()
        };
        store.save_wifi_settings(&settings).unwrap();
        assert_eq!(store.load_wifi_settings(), settings);

        let raw = std::fs::read_to_string(tmp.path().join(WIFI_FILE)).unwrap();
        assert!(raw.contains("primarySSID"));
        assert!(raw.contains("apModeEnabled"));

        // apModeEnabled defaults to true when the key is absent.
        std::fs::write(tmp.path().join(WIFI_FILE), r#"{"primarySSID":"x"}"#).unwrap();
        assert!(store.load_wifi_settings().ap_mode_enabled);
    }

    #[test]
    fn api_settings_defaults() {
        let (_tmp, store) = store();
        let api = store.load_api_settings();
        assert!(api.enabled);
        assert_eq!(api.endpoint, "trigger");
        assert!(!api.require_token);
    }

    #[test]
    fn device_mac_is_stable_across_loads() {
        let (_tmp, store) = store();
        let first = store.load_or_create_device_mac().unwrap();
        let second = store.load_or_create_device_mac().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn erase_all_removes_files() {
        let (tmp, store) = store();
        store.save_timer_settings(&TimerSettings::default()).unwrap();
        store.save_runtime(&TimerRuntime::default()).unwrap();
        store.erase_all().unwrap();
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
        // Loads fall back to defaults afterwards.
        assert_eq!(store.load_runtime(), TimerRuntime::default());
    }
}
