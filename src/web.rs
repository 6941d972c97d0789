//! Web surface contract.
//!
//! The HTTP router and static-file server are hosted outside this crate;
//! the supervisor only consumes their effects (alive signals, configuration
//! writes, factory reset). This module pins down the shared contract: the
//! JSON response envelope, session-token authentication (Bearer header
//! first, `session` cookie fallback) and validation of the remote "alive"
//! GET endpoint.
//!
//! Route surface served by the router, all JSON unless noted:
//! `GET /api/device/info`, `GET /api/status`, `POST /api/reboot`,
//! `POST /api/factory-reset`, `POST /api/login`, `POST /api/logout`,
//! `GET|POST /api/timer/*`, `GET|POST /api/mail/*`, `GET|POST /api/wifi/*`,
//! `GET|POST /api/relay/*`, `GET|POST /api/config/*`, `GET /api/ota/*`,
//! `POST /api/ota/url`, plus the configurable alive endpoint
//! (`/api/<endpoint>`). Auth is bypassed only during first-time setup.
//! Static GUI assets are served from a writable A/B slot pair; a slot is
//! kept only after a post-boot health ping, otherwise the router rolls
//! back to the previous slot after three unconfirmed boots.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::ApiSettings;

/// Session token length in hex characters.
const TOKEN_LEN: usize = 32;

/// JSON envelope for every API response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
        }
    }
}

/// Sources an alive signal can arrive from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliveSource {
    Button,
    Web,
    RemoteGet,
}

impl AliveSource {
    pub fn label(self) -> &'static str {
        match self {
            AliveSource::Button => "button",
            AliveSource::Web => "web",
            AliveSource::RemoteGet => "remote-get",
        }
    }
}

/// Extract the session token from request headers: `Authorization: Bearer`
/// wins, `Cookie: session=` is the fallback.
pub fn extract_token(auth_header: Option<&str>, cookie_header: Option<&str>) -> Option<String> {
    if let Some(auth) = auth_header {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    if let Some(cookies) = cookie_header {
        for part in cookies.split(';') {
            let part = part.trim();
            if let Some(token) = part.strip_prefix("session=") {
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }
    None
}

/// Validate a GET to the remote alive endpoint against the API settings.
///
/// The endpoint path suffix must match, and when `require_token` is set the
/// bearer token must equal the configured one.
pub fn authorize_remote_trigger(
    api: &ApiSettings,
    endpoint: &str,
    bearer_token: Option<&str>,
) -> bool {
    if !api.enabled || endpoint != api.endpoint {
        return false;
    }
    if api.require_token {
        match bearer_token {
            Some(token) => !api.token.is_empty() && token == api.token,
            None => false,
        }
    } else {
        true
    }
}

/// In-memory session table with expiry.
///
/// Tokens are random 32-hex-character strings; validation refreshes the
/// sliding timeout.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Instant>>,
    timeout: Duration,
}

impl SessionManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Mint a fresh session token.
    pub fn create(&self) -> String {
        let mut rng = rand::thread_rng();
        let token: String = (0..TOKEN_LEN)
            .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
            .collect();
        self.sessions
            .lock()
            .expect("session table poisoned")
            .insert(token.clone(), Instant::now());
        token
    }

    /// True when the token exists and has not expired; refreshes the
    /// sliding window.
    pub fn validate(&self, token: &str) -> bool {
        let mut sessions = self.sessions.lock().expect("session table poisoned");
        match sessions.get_mut(token) {
            Some(last_seen) => {
                if last_seen.elapsed() > self.timeout {
                    sessions.remove(token);
                    false
                } else {
                    *last_seen = Instant::now();
                    true
                }
            }
            None => false,
        }
    }

    pub fn destroy(&self, token: &str) {
        self.sessions
            .lock()
            .expect("session table poisoned")
            .remove(token);
    }

    /// Drop every expired session; called opportunistically.
    pub fn sweep(&self) {
        let timeout = self.timeout;
        self.sessions
            .lock()
            .expect("session table poisoned")
            .retain(|_, last_seen| last_seen.elapsed() <= timeout);
    }
}
