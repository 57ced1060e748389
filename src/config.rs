use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chrome::Channel;
use crate::error::BridgeError;

/// Default CDP port when nothing else is configured.
pub const DEFAULT_CDP_PORT: u16 = 9222;

/// Default connect timeout (spec: 30 s).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Environment variable overriding the default debugger host.
pub const ENV_HOST: &str = "CEF_BRIDGE_HOST";
/// Environment variable overriding the default debugger port.
pub const ENV_PORT: &str = "CEF_BRIDGE_PORT";
/// Environment variable enabling `DevToolsActivePort` auto-discovery.
pub const ENV_AUTO_CONNECT: &str = "AUTO_CONNECT";

// ---------------------------------------------------------------------------
// Option records
// ---------------------------------------------------------------------------

/// Preferred debugger transport.
///
/// The bridge carries one concrete transport (WebSocket). `Pipe` is accepted
/// as a preference and served over WebSocket; the resolved choice is recorded
/// on the session so callers can observe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// OS pipe (preferred by callers that spawn the browser themselves).
    #[default]
    Pipe,
    /// WebSocket to the remote debugging port.
    WebSocket,
}

impl Transport {
    /// Parse a transport name.
    ///
    /// # Errors
    ///
    /// Returns the unrecognized input.
    pub fn parse(value: &str) -> Result<Self, String> {
        match value {
            "pipe" => Ok(Self::Pipe),
            "websocket" => Ok(Self::WebSocket),
            other => Err(other.to_owned()),
        }
    }
}

/// Options for launching a browser. Defaults are documented per field.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Headless mode (default: true).
    pub headless: bool,
    /// Initial viewport (default: browser default).
    pub viewport: Option<(u32, u32)>,
    /// Release channel used for executable lookup (default: stable).
    pub channel: Channel,
    /// Explicit executable path; overrides channel lookup (default: none).
    pub executable_path: Option<PathBuf>,
    /// Isolated profile: always use a throwaway directory (default: false).
    pub isolated: bool,
    /// Persistent profile directory, created if missing (default: none).
    pub user_data_dir: Option<PathBuf>,
    /// Extra Chromium arguments appended verbatim (default: empty).
    pub extra_args: Vec<String>,
    /// Transport preference (default: pipe; see [`Transport`]).
    pub transport: Transport,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            headless: true,
            viewport: None,
            channel: Channel::Stable,
            executable_path: None,
            isolated: false,
            user_data_dir: None,
            extra_args: Vec::new(),
            transport: Transport::default(),
        }
    }
}

/// How to reach an existing debugger, in resolution priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectSpec {
    /// Direct browser-level WebSocket URL.
    WsUrl(String),
    /// HTTP discovery URL; `/json/version` yields the WebSocket URL.
    HttpUrl(String),
    /// Read the `DevToolsActivePort` sentinel from a user-data directory.
    AutoDiscover,
    /// Plain host and port; `/json/version` yields the WebSocket URL.
    HostPort {
        /// Debugger host.
        host: String,
        /// Debugger port.
        port: u16,
    },
}

impl ConnectSpec {
    /// Classify a legacy "endpoint URL" into a concrete spec.
    ///
    /// `ws://`/`wss://` is taken as a direct WebSocket URL, `http://`/
    /// `https://` as a discovery URL, and a bare `host:port` as a host/port
    /// pair.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::InvalidUrl` for anything else, before any I/O.
    pub fn classify(endpoint: &str) -> Result<Self, BridgeError> {
        if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
            url::Url::parse(endpoint).map_err(|_| BridgeError::InvalidUrl(endpoint.into()))?;
            return Ok(Self::WsUrl(endpoint.to_owned()));
        }
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            url::Url::parse(endpoint).map_err(|_| BridgeError::InvalidUrl(endpoint.into()))?;
            return Ok(Self::HttpUrl(endpoint.to_owned()));
        }
        if let Some((host, port)) = endpoint.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                if !host.is_empty() && !host.contains('/') {
                    return Ok(Self::HostPort {
                        host: host.to_owned(),
                        port,
                    });
                }
            }
        }
        Err(BridgeError::InvalidUrl(endpoint.to_owned()))
    }

    /// The default spec: auto-discovery when `AUTO_CONNECT=true`, else the
    /// environment-configured host/port.
    #[must_use]
    pub fn default_from_env() -> Self {
        if auto_connect_enabled() {
            return Self::AutoDiscover;
        }
        Self::HostPort {
            host: bridge_host(),
            port: bridge_port(),
        }
    }
}

/// Host from `CEF_BRIDGE_HOST`, defaulting to 127.0.0.1.
#[must_use]
pub fn bridge_host() -> String {
    std::env::var(ENV_HOST).unwrap_or_else(|_| "127.0.0.1".to_owned())
}

/// Port from `CEF_BRIDGE_PORT`, defaulting to [`DEFAULT_CDP_PORT`].
#[must_use]
pub fn bridge_port() -> u16 {
    std::env::var(ENV_PORT)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_CDP_PORT)
}

/// Whether sentinel-file auto-discovery is enabled (`AUTO_CONNECT=true`).
#[must_use]
pub fn auto_connect_enabled() -> bool {
    std::env::var(ENV_AUTO_CONNECT).is_ok_and(|v| v == "true")
}

// ---------------------------------------------------------------------------
// Config file (parsed from TOML; all fields optional)
// ---------------------------------------------------------------------------

/// Parsed TOML config file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConfigFile {
    pub connection: ConnectionSection,
    pub snapshot: SnapshotSection,
    pub fleet: FleetSection,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SnapshotSection {
    pub max_capture_retries: Option<u32>,
    pub quiet_window_ms: Option<u64>,
    pub post_navigation_quiet_cap_ms: Option<u64>,
    pub eid_stale_turns: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FleetSection {
    pub port_range_min: Option<u16>,
    pub port_range_max: Option<u16>,
    pub max_workers: Option<usize>,
    pub lease_ttl_secs: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
    pub hard_ttl_secs: Option<u64>,
    pub health_probe_interval_secs: Option<u64>,
}

/// Fully resolved configuration with every default filled in.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Where the config file was read from, if anywhere.
    pub config_path: Option<PathBuf>,
    /// Default debugger host.
    pub host: String,
    /// Default debugger port.
    pub port: u16,
    /// Connect timeout (default 30 s).
    pub connect_timeout: Duration,
    /// Snapshot capture retry ceiling (default 3).
    pub max_capture_retries: u32,
    /// Network/DOM quiet window (default 500 ms).
    pub quiet_window: Duration,
    /// Post-navigation network-quiet cap (default 5 s).
    pub post_navigation_quiet_cap: Duration,
    /// Turns an eid may be absent before it goes stale (default 3).
    pub eid_stale_turns: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        ConfigFile::default().resolve(None)
    }
}

impl ConfigFile {
    /// Fill in defaults, with environment variables taking priority over the
    /// file for host and port.
    #[must_use]
    pub fn resolve(&self, config_path: Option<PathBuf>) -> BridgeConfig {
        let host = std::env::var(ENV_HOST)
            .ok()
            .or_else(|| self.connection.host.clone())
            .unwrap_or_else(|| "127.0.0.1".to_owned());
        let port = std::env::var(ENV_PORT)
            .ok()
            .and_then(|v| v.parse().ok())
            .or(self.connection.port)
            .unwrap_or(DEFAULT_CDP_PORT);

        BridgeConfig {
            config_path,
            host,
            port,
            connect_timeout: self
                .connection
                .connect_timeout_ms
                .map_or(DEFAULT_CONNECT_TIMEOUT, Duration::from_millis),
            max_capture_retries: self.snapshot.max_capture_retries.unwrap_or(3),
            quiet_window: Duration::from_millis(self.snapshot.quiet_window_ms.unwrap_or(500)),
            post_navigation_quiet_cap: Duration::from_millis(
                self.snapshot.post_navigation_quiet_cap_ms.unwrap_or(5_000),
            ),
            eid_stale_turns: self.snapshot.eid_stale_turns.unwrap_or(3),
        }
    }
}

/// Candidate config file locations, in priority order.
#[must_use]
pub fn config_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(config_dir) = dirs::config_dir() {
        candidates.push(config_dir.join("cef-bridge").join("config.toml"));
    }
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".cef-bridge.toml"));
    }
    candidates
}

/// Load the first readable config file, or defaults when none exists.
///
/// # Errors
///
/// Returns `BridgeError::InvalidArgument` if a file exists but is not valid
/// TOML; a missing file is not an error.
pub fn load_config() -> Result<BridgeConfig, BridgeError> {
    for candidate in config_file_candidates() {
        match load_config_from(&candidate) {
            Ok(Some(config)) => return Ok(config),
            Ok(None) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(ConfigFile::default().resolve(None))
}

/// Load a config file from a specific path. Returns `Ok(None)` if absent.
///
/// # Errors
///
/// Returns `BridgeError::InvalidArgument` if the file is not valid TOML.
pub fn load_config_from(path: &Path) -> Result<Option<BridgeConfig>, BridgeError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(BridgeError::InvalidArgument {
                field: "config".into(),
                message: format!("cannot read {}: {e}", path.display()),
            });
        }
    };
    let file: ConfigFile = toml::from_str(&contents).map_err(|e| BridgeError::InvalidArgument {
        field: "config".into(),
        message: format!("invalid TOML in {}: {e}", path.display()),
    })?;
    Ok(Some(file.resolve(Some(path.to_path_buf()))))
}
