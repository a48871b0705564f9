//! Gateway configuration: TOML file + CLI overrides.

use crate::tunnel::credential::{Credential, CredentialSecret, CredentialStore};
use rgate_core::{GatewayError, GatewayResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub tunnels: TunnelsSection,
    #[serde(default)]
    pub credentials: Vec<CredentialEntry>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_sessions: default_max_sessions(),
        }
    }
}

/// `[timeouts]` section. Keys are accepted in snake_case or camelCase.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsSection {
    #[serde(default = "default_ping_interval_ms", alias = "pingIntervalMs")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_pong_timeout_ms", alias = "pongTimeoutMs")]
    pub pong_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms", alias = "requestTimeoutMs")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_session_idle_timeout_ms", alias = "sessionIdleTimeoutMs")]
    pub session_idle_timeout_ms: u64,
    #[serde(default = "default_reconnect_grace_ms", alias = "reconnectGraceMs")]
    pub reconnect_grace_ms: u64,
    #[serde(default = "default_tunnel_idle_grace_ms", alias = "tunnelIdleGraceMs")]
    pub tunnel_idle_grace_ms: u64,
    #[serde(default = "default_tunnel_connect_timeout_ms", alias = "tunnelConnectTimeoutMs")]
    pub tunnel_connect_timeout_ms: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval_ms(),
            pong_timeout_ms: default_pong_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            session_idle_timeout_ms: default_session_idle_timeout_ms(),
            reconnect_grace_ms: default_reconnect_grace_ms(),
            tunnel_idle_grace_ms: default_tunnel_idle_grace_ms(),
            tunnel_connect_timeout_ms: default_tunnel_connect_timeout_ms(),
        }
    }
}

/// `[tunnels]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelsSection {
    #[serde(default)]
    pub default_credential: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub default_port: u16,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,
}

impl Default for TunnelsSection {
    fn default() -> Self {
        Self {
            default_credential: None,
            default_port: default_ssh_port(),
            health_check_interval_ms: default_health_check_interval_ms(),
            reaper_interval_ms: default_reaper_interval_ms(),
        }
    }
}

/// One `[[credentials]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialEntry {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    4480
}
fn default_max_sessions() -> usize {
    100
}
fn default_ping_interval_ms() -> u64 {
    15_000
}
fn default_pong_timeout_ms() -> u64 {
    3 * default_ping_interval_ms()
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_session_idle_timeout_ms() -> u64 {
    3_600_000
}
fn default_reconnect_grace_ms() -> u64 {
    1_800_000
}
fn default_tunnel_idle_grace_ms() -> u64 {
    60_000
}
fn default_tunnel_connect_timeout_ms() -> u64 {
    15_000
}
fn default_ssh_port() -> u16 {
    22
}
fn default_health_check_interval_ms() -> u64 {
    30_000
}
fn default_reaper_interval_ms() -> u64 {
    5_000
}

/// Independent timeout knobs, resolved to durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub request_timeout: Duration,
    pub session_idle_timeout: Duration,
    pub reconnect_grace: Duration,
    pub tunnel_idle_grace: Duration,
    pub tunnel_connect_timeout: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::from_section(&TimeoutsSection::default())
    }
}

impl Timeouts {
    fn from_section(s: &TimeoutsSection) -> Self {
        Self {
            ping_interval: Duration::from_millis(s.ping_interval_ms),
            pong_timeout: Duration::from_millis(s.pong_timeout_ms),
            request_timeout: Duration::from_millis(s.request_timeout_ms),
            session_idle_timeout: Duration::from_millis(s.session_idle_timeout_ms),
            reconnect_grace: Duration::from_millis(s.reconnect_grace_ms),
            tunnel_idle_grace: Duration::from_millis(s.tunnel_idle_grace_ms),
            tunnel_connect_timeout: Duration::from_millis(s.tunnel_connect_timeout_ms),
        }
    }

    /// Upper bound on answering one inbound request. Leaves room for a
    /// full tunnel connect, so a stalled handshake is reported as a tunnel
    /// failure rather than a request timeout.
    pub fn dispatch_deadline(&self) -> Duration {
        self.tunnel_connect_timeout + self.request_timeout
    }

    fn validate(&self) -> GatewayResult<()> {
        let named = [
            ("pingIntervalMs", self.ping_interval),
            ("pongTimeoutMs", self.pong_timeout),
            ("requestTimeoutMs", self.request_timeout),
            ("sessionIdleTimeoutMs", self.session_idle_timeout),
            ("reconnectGraceMs", self.reconnect_grace),
            ("tunnelIdleGraceMs", self.tunnel_idle_grace),
            ("tunnelConnectTimeoutMs", self.tunnel_connect_timeout),
        ];
        if let Some((name, _)) = named.iter().find(|(_, d)| d.is_zero()) {
            return Err(GatewayError::Config(format!("{name} must be greater than zero")));
        }
        if self.pong_timeout < self.ping_interval {
            return Err(GatewayError::Config(
                "pongTimeoutMs must not be shorter than pingIntervalMs".into(),
            ));
        }
        Ok(())
    }
}

/// Tunnel pool tuning.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub default_credential: Option<String>,
    pub default_port: u16,
    pub health_check_interval: Duration,
    pub reaper_interval: Duration,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        let s = TunnelsSection::default();
        Self {
            default_credential: s.default_credential,
            default_port: s.default_port,
            health_check_interval: Duration::from_millis(s.health_check_interval_ms),
            reaper_interval: Duration::from_millis(s.reaper_interval_ms),
        }
    }
}

/// CLI values that win over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub max_sessions: Option<usize>,
}

/// Resolved gateway configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: String,
    pub port: u16,
    pub max_sessions: usize,
    pub timeouts: Timeouts,
    pub tunnels: TunnelSettings,
    pub credentials: CredentialStore,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let server = ServerSection::default();
        Self {
            bind: server.bind,
            port: server.port,
            max_sessions: server.max_sessions,
            timeouts: Timeouts::default(),
            tunnels: TunnelSettings::default(),
            credentials: CredentialStore::new(),
        }
    }
}

impl GatewayConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: &ConfigOverrides) -> GatewayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    Self::parse_file(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::from_file(file_config, overrides)
    }

    pub fn parse_file(content: &str) -> GatewayResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| GatewayError::Config(format!("config parse error: {e}")))
    }

    /// Merge a parsed file with CLI overrides and validate the result.
    pub fn from_file(file: ConfigFile, overrides: &ConfigOverrides) -> GatewayResult<Self> {
        let timeouts = Timeouts::from_section(&file.timeouts);
        timeouts.validate()?;

        let mut credentials = CredentialStore::new();
        for entry in file.credentials {
            credentials.insert(resolve_credential(entry)?);
        }

        if let Some(ref id) = file.tunnels.default_credential {
            if credentials.get(id).is_none() {
                return Err(GatewayError::Config(format!(
                    "default_credential `{id}` is not defined"
                )));
            }
        }

        let tunnels = TunnelSettings {
            default_credential: file.tunnels.default_credential,
            default_port: file.tunnels.default_port,
            health_check_interval: Duration::from_millis(file.tunnels.health_check_interval_ms),
            reaper_interval: Duration::from_millis(file.tunnels.reaper_interval_ms),
        };

        Ok(Self {
            bind: overrides.bind.clone().unwrap_or(file.server.bind),
            port: overrides.port.unwrap_or(file.server.port),
            max_sessions: overrides.max_sessions.unwrap_or(file.server.max_sessions),
            timeouts,
            tunnels,
            credentials,
        })
    }

    /// `bind:port` listen address.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn resolve_credential(entry: CredentialEntry) -> GatewayResult<Credential> {
    let secret = match (entry.password, entry.key_path) {
        (Some(password), None) => CredentialSecret::Password(password),
        (None, Some(key_path)) => CredentialSecret::KeyFile {
            path: expand_tilde_str(&key_path),
            passphrase: entry.passphrase,
        },
        (Some(_), Some(_)) => {
            return Err(GatewayError::Config(format!(
                "credential `{}` sets both password and key_path",
                entry.id
            )))
        }
        (None, None) => {
            return Err(GatewayError::Config(format!(
                "credential `{}` needs a password or key_path",
                entry.id
            )))
        }
    };
    Ok(Credential {
        id: entry.id,
        username: entry.username,
        secret,
    })
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
