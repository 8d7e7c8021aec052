//! Configuration Vault – reads/writes `~/.fiscal-bridge/config.toml`.

use fiscal_bridge::{AddressingMode, CorrelatorConfig, RestartPolicy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to write config at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("role '{0}' needs a shared broker; set transport = \"redis\"")]
    InProcessRole(Role),
}

/// Which pub/sub backend carries commands and responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process bus; gateway and worker must share the process.
    #[default]
    Memory,
    Redis,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Memory => write!(f, "memory"),
            TransportKind::Redis => write!(f, "redis"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-process" => Ok(TransportKind::Memory),
            "redis" => Ok(TransportKind::Redis),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

/// What this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Gateway plus, when `embedded_worker` is set, the worker.
    #[default]
    All,
    Gateway,
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::All => write!(f, "all"),
            Role::Gateway => write!(f, "gateway"),
            Role::Worker => write!(f, "worker"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Role::All),
            "gateway" | "api" => Ok(Role::Gateway),
            "worker" => Ok(Role::Worker),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Persisted bridge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub role: Role,

    #[serde(default)]
    pub transport: TransportKind,

    /// Used when `transport = "redis"`.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Port of the HTTP gateway.
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    #[serde(default)]
    pub addressing: AddressingMode,

    /// Devices served by the embedded worker.
    #[serde(default = "default_devices")]
    pub devices: Vec<String>,

    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Upper bound on a per-request timeout.
    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,

    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,

    /// Run simulated registrars in-process for every entry of `devices`.
    #[serde(default = "default_true")]
    pub embedded_worker: bool,

    #[serde(default = "default_true")]
    pub restart_listener: bool,

    #[serde(default = "default_initial_backoff_ms")]
    pub restart_initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub restart_max_backoff_ms: u64,
}

fn default_redis_url() -> String {
    fiscal_bus::DEFAULT_REDIS_URL.to_string()
}
fn default_http_port() -> u16 {
    fiscal_gateway::DEFAULT_PORT
}
fn default_devices() -> Vec<String> {
    vec!["default".to_string()]
}
fn default_timeout_secs() -> u64 {
    fiscal_bridge::DEFAULT_TIMEOUT.as_secs()
}
fn default_max_timeout_secs() -> u64 {
    fiscal_gateway::DEFAULT_MAX_TIMEOUT.as_secs()
}
fn default_bus_capacity() -> usize {
    fiscal_bus::DEFAULT_CAPACITY
}
fn default_true() -> bool {
    true
}
fn default_initial_backoff_ms() -> u64 {
    250
}
fn default_max_backoff_ms() -> u64 {
    10_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::default(),
            transport: TransportKind::default(),
            redis_url: default_redis_url(),
            http_port: default_http_port(),
            addressing: AddressingMode::default(),
            devices: default_devices(),
            default_timeout_secs: default_timeout_secs(),
            max_timeout_secs: default_max_timeout_secs(),
            bus_capacity: default_bus_capacity(),
            embedded_worker: true,
            restart_listener: true,
            restart_initial_backoff_ms: default_initial_backoff_ms(),
            restart_max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Config {
    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            enabled: self.restart_listener,
            initial_backoff: Duration::from_millis(self.restart_initial_backoff_ms),
            max_backoff: Duration::from_millis(
                self.restart_max_backoff_ms.max(self.restart_initial_backoff_ms),
            ),
        }
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_secs(self.max_timeout_secs.max(1))
    }

    pub fn correlator_config(&self) -> CorrelatorConfig {
        CorrelatorConfig {
            addressing: self.addressing,
            default_timeout: Duration::from_secs(self.default_timeout_secs.max(1))
                .min(self.max_timeout()),
            restart: self.restart_policy(),
            ..CorrelatorConfig::default()
        }
    }

    /// A gateway-only or worker-only process is useless on the in-process bus.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (self.role, self.transport) {
            (Role::Gateway | Role::Worker, TransportKind::Memory) => Err(ConfigError::InProcessRole(self.role)),
            _ => Ok(()),
        }
    }

    /// Whether this process hosts the worker.
    pub fn runs_worker(&self) -> bool {
        match self.role {
            Role::All => self.embedded_worker,
            Role::Gateway => false,
            Role::Worker => true,
        }
    }

    /// Drop blank and duplicate device ids, keeping first-seen order, and
    /// fall back to the default device when nothing is left.
    fn normalize(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.devices = std::mem::take(&mut self.devices)
            .into_iter()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty() && seen.insert(d.clone()))
            .collect();
        if self.devices.is_empty() {
            self.devices = default_devices();
        }
        if self.bus_capacity == 0 {
            self.bus_capacity = default_bus_capacity();
        }
    }
}

/// Return the config path: `FISCAL_CONFIG` if set, else
/// `~/.fiscal-bridge/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(p) = std::env::var("FISCAL_CONFIG")
        && !p.is_empty()
    {
        return PathBuf::from(p);
    }
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".fiscal-bridge").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, ConfigError> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cfg: Config = toml::from_str(&raw)?;
    cfg.normalize();
    Ok(Some(cfg))
}

/// Apply `FISCAL_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `FISCAL_ROLE` | `role` |
/// | `FISCAL_TRANSPORT` | `transport` |
/// | `FISCAL_REDIS_URL` | `redis_url` |
/// | `FISCAL_HTTP_PORT` | `http_port` |
/// | `FISCAL_ADDRESSING` | `addressing` |
/// | `FISCAL_DEVICES` | `devices` (comma separated) |
/// | `FISCAL_DEFAULT_TIMEOUT` | `default_timeout_secs` |
/// | `FISCAL_MAX_TIMEOUT` | `max_timeout_secs` |
/// | `FISCAL_EMBEDDED_WORKER` | `embedded_worker` |
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

/// Same as [`apply_env_overrides`] with an injectable lookup.  Values that do
/// not parse are ignored.
pub(crate) fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("FISCAL_ROLE")
        && let Ok(role) = v.parse::<Role>()
    {
        cfg.role = role;
    }
    if let Some(v) = lookup("FISCAL_TRANSPORT")
        && let Ok(kind) = v.parse::<TransportKind>()
    {
        cfg.transport = kind;
    }
    if let Some(v) = lookup("FISCAL_REDIS_URL")
        && !v.trim().is_empty()
    {
        cfg.redis_url = v.trim().to_string();
    }
    if let Some(v) = lookup("FISCAL_HTTP_PORT")
        && let Ok(port) = v.trim().parse::<u16>()
    {
        cfg.http_port = port;
    }
    if let Some(v) = lookup("FISCAL_ADDRESSING")
        && let Ok(mode) = v.parse::<AddressingMode>()
    {
        cfg.addressing = mode;
    }
    if let Some(v) = lookup("FISCAL_DEVICES") {
        cfg.devices = v.split(',').map(str::to_string).collect();
    }
    if let Some(v) = lookup("FISCAL_DEFAULT_TIMEOUT")
        && let Ok(secs) = v.trim().parse::<u64>()
    {
        cfg.default_timeout_secs = secs;
    }
    if let Some(v) = lookup("FISCAL_MAX_TIMEOUT")
        && let Ok(secs) = v.trim().parse::<u64>()
    {
        cfg.max_timeout_secs = secs;
    }
    if let Some(v) = lookup("FISCAL_EMBEDDED_WORKER")
        && let Some(flag) = parse_flag(&v)
    {
        cfg.embedded_worker = flag;
    }
    cfg.normalize();
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Save the config to disk, creating the parent directory if necessary.
pub fn save(cfg: &Config) -> Result<(), ConfigError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    let raw = toml::to_string_pretty(cfg)?;
    fs::write(path, raw).map_err(write_err)?;
    Ok(())
}
