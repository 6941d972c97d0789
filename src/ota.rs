//! Over-the-air update contract.
//!
//! The flashing pipeline (inactive partition write, pending-verify mark,
//! bootloader rollback after three unconfirmed boots) is platform territory
//! and lives behind [`OtaUpdater`]. This module carries what the core
//! needs: persisted scheduling state, semantic version comparison, and a
//! release checker that reads a `tag_name` from an HTTPS manifest.

use std::cmp::Ordering;

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unconfirmed boots before the bootloader rolls back.
pub const MAX_UNCONFIRMED_BOOTS: u32 = 3;

#[derive(Debug, Error)]
pub enum OtaError {
    #[error("release check failed: {0}")]
    Check(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("staging failed: {0}")]
    Staging(String),
}

/// Persisted OTA scheduling state (`ota_state.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct OtaState {
    pub last_check_millis: u64,
    pub check_count: u32,
    pub update_count: u32,
    pub startup_check_done: bool,
}

/// Updater seam.
///
/// `download_and_stage` writes the image to the inactive slot and marks it
/// pending-verify; the implementation reboots into it and rolls back unless
/// `confirm_boot` (the post-boot health ping) arrives within
/// [`MAX_UNCONFIRMED_BOOTS`] boots.
#[async_trait]
pub trait OtaUpdater: Send + Sync {
    /// Returns the newer release tag, if one exists.
    async fn check_latest(&self, current_version: &str) -> Result<Option<String>, OtaError>;

    async fn download_and_stage(&self, version: &str) -> Result<(), OtaError>;

    /// Health ping: the new image works, keep it.
    fn confirm_boot(&self);
}

/// Compare dotted versions, tolerating a leading `v` and missing
/// components (`1.2` == `1.2.0`).
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    fn parts(v: &str) -> [u64; 3] {
        let v = v.trim().trim_start_matches('v').trim_start_matches('V');
        let mut out = [0u64; 3];
        for (slot, part) in out.iter_mut().zip(v.split('.')) {
            *slot = part
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
                .parse()
                .unwrap_or(0);
        }
        out
    }
    parts(a).cmp(&parts(b))
}

/// Release checker over an HTTPS manifest carrying a `tag_name` field
/// (GitHub releases shape).
pub struct HttpReleaseChecker {
    manifest_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ReleaseManifest {
    tag_name: String,
}

impl HttpReleaseChecker {
    pub fn new(manifest_url: impl Into<String>) -> Result<Self, OtaError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .user_agent(concat!("lifesign/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| OtaError::Check(e.to_string()))?;
        Ok(Self {
            manifest_url: manifest_url.into(),
            client,
        })
    }

    /// Fetch the manifest and return the tag when it is newer than
    /// `current_version`.
    pub async fn newer_release(&self, current_version: &str) -> Result<Option<String>, OtaError> {
        let manifest: ReleaseManifest = self
            .client
            .get(&self.manifest_url)
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await
            .map_err(|e| OtaError::Check(e.to_string()))?
            .error_for_status()
            .map_err(|e| OtaError::Check(e.to_string()))?
            .json()
            .await
            .map_err(|e| OtaError::Check(e.to_string()))?;

        let latest = manifest.tag_name.trim().to_string();
        debug!("release check: current={} latest={}", current_version, latest);
        if compare_versions(current_version, &latest) == Ordering::Less {
            Ok(Some(latest))
        } else {
            Ok(None)
        }
    }
}
