//! Network availability controller.
//!
//! Owns the radio exclusively and runs as its own task consuming
//! [`NetRequest`] messages; callers await a oneshot reply with a timeout,
//! so a hung association can never block the supervisor loop.
//!
//! Connection preference: the configured primary network, then the
//! secondary (up to 3 attempts each, 2 s pause, 15 s per-attempt timeout),
//! then — if open networks are allowed — the opt-in manufacturer network
//! followed by any open access point that passes an internet probe (DNS
//! resolution of three well-known hosts within 30 s). When everything
//! fails and AP mode is enabled, a WPA2 setup access point named after the
//! device id comes up on 192.168.4.1/24.
//!
//! Aggressive mode (requested when an alarm is imminent) bypasses the scan
//! cache, extends the open-network timeout and re-verifies internet
//! reachability even on an established link.
//!
//! All radio operations go through the [`WifiBackend`] trait; real hardware
//! control lives behind that seam, tests script it, and [`SystemWifi`]
//! adapts the state machine to a plain host.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

use crate::config::{KnownNetwork, NetworkProfile, WifiSettings};
use crate::device::{DeviceId, DEVICE_MODEL};

/// Scan results younger than this are served from cache.
const SCAN_CACHE_TTL: Duration = Duration::from_secs(5);

const KNOWN_ATTEMPTS: u32 = 3;
const ATTEMPT_PAUSE: Duration = Duration::from_secs(2);
const KNOWN_TIMEOUT: Duration = Duration::from_secs(15);
const OPEN_TIMEOUT: Duration = Duration::from_secs(8);
const OPEN_TIMEOUT_AGGRESSIVE: Duration = Duration::from_secs(15);
const PROBE_BUDGET: Duration = Duration::from_secs(30);
const PROBE_HOSTS: [&str; 3] = ["time.cloudflare.com", "dns.google", "one.one.one.one"];

/// Fallback access point address, /24.
const AP_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);

/// mDNS hostname advertised while in setup mode.
const SETUP_HOSTNAME: &str = "lifesign-setup";

#[derive(Debug, Error)]
pub enum NetError {
    #[error("scan failed: {0}")]
    Scan(String),

    #[error("could not associate with {0}")]
    NoLink(String),

    #[error("dns resolution failed: {0}")]
    Dns(String),

    #[error("operation timed out")]
    Timeout,

    #[error("access point failed: {0}")]
    ApFailed(String),

    #[error("{0}")]
    Backend(String),
}

/// One visible network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    pub ssid: String,
    pub rssi: i32,
    pub open: bool,
}

/// Static addressing applied before association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticIpAssignment {
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub subnet: Ipv4Addr,
    pub dns: Ipv4Addr,
}

/// Everything a backend needs to join one network.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub ssid: String,
    pub password: Option<String>,
    pub static_ip: Option<StaticIpAssignment>,
    pub hostname: String,
}

#[derive(Debug, Clone)]
pub struct ApConfig {
    pub ssid: String,
    pub password: String,
    pub address: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MdnsMode {
    Station,
    ApFallback,
    Manufacturer,
}

impl MdnsMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MdnsMode::Station => "station",
            MdnsMode::ApFallback => "ap-fallback",
            MdnsMode::Manufacturer => "manufacturer",
        }
    }
}

/// `_http._tcp` record with the device TXT set.
#[derive(Debug, Clone)]
pub struct MdnsAnnouncement {
    pub hostname: String,
    pub port: u16,
    pub version: String,
    pub model: String,
    pub mode: MdnsMode,
}

/// Radio seam. The single radio is owned by the controller task; scan and
/// connect never overlap.
#[async_trait]
pub trait WifiBackend: Send + Sync {
    async fn scan(&self) -> Result<Vec<ScanEntry>, NetError>;
    async fn connect(&self, request: &ConnectRequest) -> Result<(), NetError>;
    async fn disconnect(&self);
    async fn link_up(&self) -> bool;
    async fn resolve_host(&self, host: &str) -> Result<(), NetError>;
    async fn start_access_point(&self, config: &ApConfig) -> Result<(), NetError>;
    async fn stop_access_point(&self);
    async fn announce_mdns(&self, announcement: &MdnsAnnouncement) -> Result<(), NetError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectedWhich {
    Primary,
    Secondary,
    Open,
    Manufacturer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetState {
    Idle,
    ScanningKnown,
    ConnectingPrimary,
    ConnectingSecondary,
    ConnectingOpen,
    VerifyingInternet,
    Connected(ConnectedWhich),
    ApFallback,
}

#[derive(Debug, Clone)]
pub struct NetStatus {
    pub state: NetState,
    pub ssid: Option<String>,
}

/// Events the supervisor consumes (NTP refresh, OTA startup check).
#[derive(Debug, Clone)]
pub enum NetEvent {
    Connected { which: ConnectedWhich, ssid: String },
    ApStarted { ssid: String },
}

enum NetRequest {
    EnsureConnected {
        aggressive: bool,
        reply: oneshot::Sender<bool>,
    },
    Scan {
        reply: oneshot::Sender<Vec<ScanEntry>>,
    },
    SetConfig(WifiSettings),
    Status {
        reply: oneshot::Sender<NetStatus>,
    },
    Shutdown,
}

/// Cloneable front-end to the controller task.
#[derive(Clone)]
pub struct NetHandle {
    tx: mpsc::Sender<NetRequest>,
}

impl NetHandle {
    /// Drive the state machine until connected or exhausted. Returns false
    /// on total failure (the caller degrades; mail sends will fail with
    /// `NoNetwork` and back off).
    pub async fn ensure_connected(&self, aggressive: bool) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(NetRequest::EnsureConnected { aggressive, reply })
            .await
            .is_err()
        {
            return false;
        }
        // Worst case: two known networks at 3x15s plus pauses, the open
        // sweep and the 30s probe.
        match timeout(Duration::from_secs(240), rx).await {
            Ok(Ok(connected)) => connected,
            _ => false,
        }
    }

    pub async fn scan(&self) -> Vec<ScanEntry> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(NetRequest::Scan { reply }).await.is_err() {
            return Vec::new();
        }
        timeout(Duration::from_secs(30), rx)
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or_default()
    }

    pub async fn set_config(&self, settings: WifiSettings) {
        let _ = self.tx.send(NetRequest::SetConfig(settings)).await;
    }

    pub async fn status(&self) -> Option<NetStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(NetRequest::Status { reply }).await.ok()?;
        timeout(Duration::from_secs(5), rx).await.ok()?.ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(NetRequest::Shutdown).await;
    }
}

/// Spawn the controller task.
pub fn start_net_controller(
    backend: Arc<dyn WifiBackend>,
    settings: WifiSettings,
    device_id: DeviceId,
    events: mpsc::UnboundedSender<NetEvent>,
) -> (NetHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(16);
    let controller = NetController {
        backend,
        settings,
        device_id,
        state: NetState::Idle,
        connected_ssid: None,
        scan_cache: None,
        ap_active: false,
        events,
    };
    let join = tokio::spawn(controller.run(rx));
    (NetHandle { tx }, join)
}

struct NetController {
    backend: Arc<dyn WifiBackend>,
    settings: WifiSettings,
    device_id: DeviceId,
    state: NetState,
    connected_ssid: Option<String>,
    scan_cache: Option<(Instant, Vec<ScanEntry>)>,
    ap_active: bool,
    events: mpsc::UnboundedSender<NetEvent>,
}

impl NetController {
    async fn run(mut self, mut rx: mpsc::Receiver<NetRequest>) {
        info!("net controller started");
        while let Some(request) = rx.recv().await {
            match request {
                NetRequest::EnsureConnected { aggressive, reply } => {
                    let connected = self.ensure_connected(aggressive).await;
                    let _ = reply.send(connected);
                }
                NetRequest::Scan { reply } => {
                    let results = self.scan_cached(false).await;
                    let _ = reply.send(results);
                }
                NetRequest::SetConfig(settings) => {
                    self.settings = settings;
                    self.scan_cache = None;
                }
                NetRequest::Status { reply } => {
                    let _ = reply.send(NetStatus {
                        state: self.state,
                        ssid: self.connected_ssid.clone(),
                    });
                }
                NetRequest::Shutdown => break,
            }
        }
        info!("net controller stopped");
    }

    async fn ensure_connected(&mut self, aggressive: bool) -> bool {
        if matches!(self.state, NetState::Connected(_)) && self.backend.link_up().await {
            if !aggressive {
                return true;
            }
            self.state = NetState::VerifyingInternet;
            if self.probe_internet(Duration::from_secs(10)).await {
                self.state = NetState::Connected(self.connected_which());
                return true;
            }
            warn!("link up but internet unreachable, reconnecting");
        }
        self.connect_known(aggressive).await
    }

    fn connected_which(&self) -> ConnectedWhich {
        match self.state {
            NetState::Connected(which) => which,
            _ => ConnectedWhich::Primary,
        }
    }

    /// Preference order: primary, secondary, manufacturer (opt-in), open
    /// networks with internet, then the fallback AP.
    async fn connect_known(&mut self, aggressive: bool) -> bool {
        for which in [KnownNetwork::Primary, KnownNetwork::Secondary] {
            if self.try_known_network(which, aggressive).await {
                return true;
            }
        }

        if self.settings.allow_open_networks {
            if self.try_manufacturer(aggressive).await {
                return true;
            }
            if self.try_open_networks(aggressive).await {
                return true;
            }
        }

        self.start_ap_fallback().await;
        false
    }

    async fn try_known_network(&mut self, which: KnownNetwork, aggressive: bool) -> bool {
        let (ssid, connecting_state) = {
            let profile = self.settings.profile(which);
            (profile.ssid.to_string(), match which {
                KnownNetwork::Primary => NetState::ConnectingPrimary,
                KnownNetwork::Secondary => NetState::ConnectingSecondary,
            })
        };
        if ssid.is_empty() {
            return false;
        }

        for attempt in 1..=KNOWN_ATTEMPTS {
            self.state = NetState::ScanningKnown;
            let networks = self.scan_cached(aggressive).await;
            // An empty scan means the backend cannot enumerate; attempt
            // the association anyway.
            let visible = networks.is_empty() || networks.iter().any(|n| n.ssid == ssid);
            if visible {
                self.state = connecting_state;
                let request = {
                    let profile = self.settings.profile(which);
                    self.connect_request(&profile)
                };
                if self.try_connect(&request, KNOWN_TIMEOUT).await {
                    let mdns_hostname = {
                        let profile = self.settings.profile(which);
                        self.station_hostname(&profile)
                    };
                    let connected = match which {
                        KnownNetwork::Primary => ConnectedWhich::Primary,
                        KnownNetwork::Secondary => ConnectedWhich::Secondary,
                    };
                    self.finish_connect(connected, &ssid, &mdns_hostname, MdnsMode::Station)
                        .await;
                    return true;
                }
            } else {
                debug!("{} not visible in scan (attempt {})", ssid, attempt);
            }
            if attempt < KNOWN_ATTEMPTS {
                sleep(ATTEMPT_PAUSE).await;
            }
        }
        false
    }

    async fn try_manufacturer(&mut self, aggressive: bool) -> bool {
        let ssid = self.settings.manufacturer_ssid.clone();
        if ssid.is_empty() {
            return false;
        }
        let networks = self.scan_cached(aggressive).await;
        if !networks.is_empty() && !networks.iter().any(|n| n.ssid == ssid) {
            return false;
        }
        self.state = NetState::ConnectingOpen;
        let request = ConnectRequest {
            ssid: ssid.clone(),
            password: (!self.settings.manufacturer_password.is_empty())
                .then(|| self.settings.manufacturer_password.clone()),
            static_ip: None,
            hostname: self.device_id.hostname(),
        };
        if self.try_connect(&request, KNOWN_TIMEOUT).await {
            let hostname = self.device_id.hostname();
            self.finish_connect(
                ConnectedWhich::Manufacturer,
                &ssid,
                &hostname,
                MdnsMode::Manufacturer,
            )
            .await;
            return true;
        }
        false
    }

    async fn try_open_networks(&mut self, aggressive: bool) -> bool {
        let connect_timeout = if aggressive {
            OPEN_TIMEOUT_AGGRESSIVE
        } else {
            OPEN_TIMEOUT
        };
        let networks = self.scan_cached(aggressive).await;
        for network in networks.into_iter().filter(|n| n.open) {
            self.state = NetState::ConnectingOpen;
            let request = ConnectRequest {
                ssid: network.ssid.clone(),
                password: None,
                static_ip: None,
                hostname: self.device_id.hostname(),
            };
            if !self.try_connect(&request, connect_timeout).await {
                continue;
            }
            // Accept an open network only when it actually reaches the
            // internet.
            self.state = NetState::VerifyingInternet;
            if self.probe_internet(PROBE_BUDGET).await {
                let hostname = self.device_id.hostname();
                self.finish_connect(
                    ConnectedWhich::Open,
                    &network.ssid,
                    &hostname,
                    MdnsMode::Station,
                )
                .await;
                return true;
            }
            self.backend.disconnect().await;
            sleep(Duration::from_millis(500)).await;
        }
        false
    }

    async fn try_connect(&mut self, request: &ConnectRequest, limit: Duration) -> bool {
        match timeout(limit, self.backend.connect(request)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("connect to {} failed: {}", request.ssid, e);
                false
            }
            Err(_) => {
                debug!("connect to {} timed out after {:?}", request.ssid, limit);
                false
            }
        }
    }

    async fn finish_connect(
        &mut self,
        which: ConnectedWhich,
        ssid: &str,
        mdns_hostname: &str,
        mode: MdnsMode,
    ) {
        if self.ap_active {
            self.backend.stop_access_point().await;
            self.ap_active = false;
        }
        self.state = NetState::Connected(which);
        self.connected_ssid = Some(ssid.to_string());
        info!("connected to {} ({:?})", ssid, which);

        let announcement = MdnsAnnouncement {
            hostname: mdns_hostname.to_string(),
            port: 80,
            version: env!("CARGO_PKG_VERSION").to_string(),
            model: DEVICE_MODEL.to_string(),
            mode,
        };
        if let Err(e) = self.backend.announce_mdns(&announcement).await {
            warn!("mdns announcement failed: {}", e);
        }
        let _ = self.events.send(NetEvent::Connected {
            which,
            ssid: ssid.to_string(),
        });
    }

    /// DNS resolution of well-known hosts, 500 ms apart, within `budget`.
    async fn probe_internet(&self, budget: Duration) -> bool {
        let started = Instant::now();
        for host in PROBE_HOSTS {
            if started.elapsed() >= budget {
                break;
            }
            let per_host = (budget - started.elapsed()).min(Duration::from_secs(10));
            match timeout(per_host, self.backend.resolve_host(host)).await {
                Ok(Ok(())) => return true,
                Ok(Err(e)) => debug!("probe {} failed: {}", host, e),
                Err(_) => debug!("probe {} timed out", host),
            }
            sleep(Duration::from_millis(500)).await;
        }
        false
    }

    async fn start_ap_fallback(&mut self) {
        self.connected_ssid = None;
        if !self.settings.ap_mode_enabled {
            warn!("all networks failed and AP mode is disabled");
            self.state = NetState::Idle;
            return;
        }
        if self.ap_active {
            self.state = NetState::ApFallback;
            return;
        }
        let config = ApConfig {
            ssid: self.device_id.as_str().to_string(),
            password: self.settings.ap_password.clone(),
            address: AP_ADDRESS,
        };
        match self.backend.start_access_point(&config).await {
            Ok(()) => {
                self.ap_active = true;
                self.state = NetState::ApFallback;
                info!("fallback AP {} up at {}", config.ssid, config.address);
                let announcement = MdnsAnnouncement {
                    hostname: SETUP_HOSTNAME.to_string(),
                    port: 80,
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    model: DEVICE_MODEL.to_string(),
                    mode: MdnsMode::ApFallback,
                };
                if let Err(e) = self.backend.announce_mdns(&announcement).await {
                    warn!("setup mdns announcement failed: {}", e);
                }
                let _ = self.events.send(NetEvent::ApStarted { ssid: config.ssid });
            }
            Err(e) => {
                warn!("fallback AP failed: {}", e);
                self.state = NetState::Idle;
            }
        }
    }

    async fn scan_cached(&mut self, bypass_cache: bool) -> Vec<ScanEntry> {
        if !bypass_cache {
            if let Some((stamp, results)) = &self.scan_cache {
                if stamp.elapsed() < SCAN_CACHE_TTL {
                    return results.clone();
                }
            }
        }
        match self.backend.scan().await {
            Ok(results) => {
                self.scan_cache = Some((Instant::now(), results.clone()));
                results
            }
            Err(e) => {
                warn!("scan failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Hostname for the mDNS record: the per-network override with any
    /// `.local` suffix stripped, otherwise `ls-<device id>`.
    fn station_hostname(&self, profile: &NetworkProfile<'_>) -> String {
        let configured = profile.mdns_hostname.trim().trim_end_matches(".local");
        if configured.is_empty() {
            self.device_id.hostname()
        } else {
            configured.to_string()
        }
    }

    fn connect_request(&self, profile: &NetworkProfile<'_>) -> ConnectRequest {
        ConnectRequest {
            ssid: profile.ssid.to_string(),
            password: (!profile.password.is_empty()).then(|| profile.password.to_string()),
            static_ip: static_assignment(profile),
            hostname: self.station_hostname(profile),
        }
    }
}

/// Parse the static addressing of a profile; DNS defaults to the gateway
/// when unset. Malformed addresses disable static mode for the attempt.
fn static_assignment(profile: &NetworkProfile<'_>) -> Option<StaticIpAssignment> {
    if !profile.static_enabled {
        return None;
    }
    let ip: Ipv4Addr = profile.static_ip.parse().ok()?;
    let gateway: Ipv4Addr = profile.static_gateway.parse().ok()?;
    let subnet: Ipv4Addr = profile.static_subnet.parse().ok()?;
    let dns: Ipv4Addr = if profile.static_dns.is_empty() {
        gateway
    } else {
        profile.static_dns.parse().unwrap_or(gateway)
    };
    Some(StaticIpAssignment {
        ip,
        gateway,
        subnet,
        dns,
    })
}

/// Host adaptation of the radio seam: no radio to drive, so association is
/// modelled as DNS reachability of the existing uplink and AP mode is
/// unavailable.
pub struct SystemWifi;

#[async_trait]
impl WifiBackend for SystemWifi {
    async fn scan(&self) -> Result<Vec<ScanEntry>, NetError> {
        Ok(Vec::new())
    }

    async fn connect(&self, request: &ConnectRequest) -> Result<(), NetError> {
        match timeout(
            Duration::from_secs(5),
            tokio::net::lookup_host(("dns.google", 53)),
        )
        .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(NetError::NoLink(format!("{}: {}", request.ssid, e))),
            Err(_) => Err(NetError::Timeout),
        }
    }

    async fn disconnect(&self) {}

    async fn link_up(&self) -> bool {
        matches!(
            timeout(
                Duration::from_secs(3),
                tokio::net::lookup_host(("dns.google", 53)),
            )
            .await,
            Ok(Ok(_))
        )
    }

    async fn resolve_host(&self, host: &str) -> Result<(), NetError> {
        tokio::net::lookup_host((host, 443))
            .await
            .map(|_| ())
            .map_err(|e| NetError::Dns(format!("{}: {}", host, e)))
    }

    async fn start_access_point(&self, _config: &ApConfig) -> Result<(), NetError> {
        Err(NetError::ApFailed(
            "access point mode is not available on this host".into(),
        ))
    }

    async fn stop_access_point(&self) {}

    async fn announce_mdns(&self, announcement: &MdnsAnnouncement) -> Result<(), NetError> {
        debug!(
            "mdns: {} _http._tcp port {} mode={}",
            announcement.hostname,
            announcement.port,
            announcement.mode.as_str()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile_fixture(settings: &WifiSettings) -> NetworkProfile<'_> {
        settings.profile(KnownNetwork::Primary)
    }

    #[test]
    fn static_assignment_defaults_dns_to_gateway() {
        let settings = WifiSettings {
            primary_ssid: "net".into(),
            primary_static_enabled: true,
            primary_ip: "192.168.1.40".into(),
            primary_gateway: "192.168.1.1".into(),
            primary_subnet: "255.255.255.0".into(),
            ..WifiSettings::default()
        };
        let assignment = static_assignment(&profile_fixture(&settings)).unwrap();
        assert_eq!(assignment.dns, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(assignment.ip, Ipv4Addr::new(192, 168, 1, 40));
    }

    #[test]
    fn static_assignment_rejects_malformed() {
        let settings = WifiSettings {
            primary_ssid: "net".into(),
            primary_static_enabled: true,
            primary_ip: "not-an-ip".into(),
            primary_gateway: "192.168.1.1".into(),
            primary_subnet: "255.255.255.0".into(),
            ..WifiSettings::default()
        };
        assert!(static_assignment(&profile_fixture(&settings)).is_none());
    }

    #[test]
    fn static_assignment_absent_when_disabled() {
        let settings = WifiSettings {
            primary_ssid: "net".into(),
            ..WifiSettings::default()
        };
        assert!(static_assignment(&profile_fixture(&settings)).is_none());
    }

    #[test]
    fn mdns_mode_strings() {
        assert_eq!(MdnsMode::Station.as_str(), "station");
        assert_eq!(MdnsMode::ApFallback.as_str(), "ap-fallback");
        assert_eq!(MdnsMode::Manufacturer.as_str(), "manufacturer");
    }
}
