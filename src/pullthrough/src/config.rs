use crate::error::{PullThroughError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// Environment keys
/// Cooldown after a successful pull during which the same image is not pulled again
pub const ENV_REPULL_MIN_INTERVAL: &str = "IMAGE_REPULL_MIN_INTERVAL";
/// How long a request waits for somebody else's in-flight pull
pub const ENV_PULL_TIMEOUT: &str = "IMAGE_PULL_TIMEOUT";
/// `sync` or `async`
pub const ENV_COPY_MODE: &str = "IMAGE_COPY_MODE";
/// Host substituted for the `library` namespace
pub const ENV_MIRROR: &str = "DOCKERHUB_MIRROR";
/// Image list copied once at startup
pub const ENV_PREPULL_LIST: &str = "IMAGE_LIST_FILE";
pub const ENV_PREPULL_MARKER: &str = "PULLTHROUGH_PREPULL_MARKER";
/// Listen address of the backing registry, e.g. `:5000`
pub const ENV_REGISTRY_ADDR: &str = "REGISTRY_HTTP_ADDR";
pub const ENV_LISTEN_ADDR: &str = "PULLTHROUGH_LISTEN_ADDR";
pub const ENV_BACKEND_URL: &str = "PULLTHROUGH_BACKEND_URL";
pub const ENV_SYNC_PROGRAM: &str = "IMAGE_SYNC_PROGRAM";

/// Default re-pull cooldown (10 minutes)
pub const DEFAULT_REPULL_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Default wait for an in-flight pull (5 minutes)
pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Interval at which waiters re-check the pull state
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Absolute lifetime of a pull state entry, regardless of rewrites
pub const ENTRY_MAX_AGE: Duration = Duration::from_secs(60 * 60);

pub const DEFAULT_PREPULL_MARKER: &str = "/var/lib/registry/.done";

/// How a request that is not the pull owner behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CopyMode {
    /// Block the request until the image is pulled or the wait times out
    #[default]
    Sync,
    /// Fire the pull in the background and forward the request at once
    Async,
}

impl<'de> serde::Deserialize<'de> for CopyMode {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl std::str::FromStr for CopyMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sync" => Ok(CopyMode::Sync),
            "async" => Ok(CopyMode::Async),
            _ => Err(format!(
                "unknown copy mode `{}`, expected one of `sync`, `async`",
                s
            )),
        }
    }
}

impl std::fmt::Display for CopyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CopyMode::Sync => f.write_str("sync"),
            CopyMode::Async => f.write_str("async"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pull: PullConfig,
    #[serde(default)]
    pub pre_pull: PrePullConfig,
    #[serde(default)]
    pub copier: CopierConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the front server binds to
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Listen address of the backing registry, in `REGISTRY_HTTP_ADDR` form
    #[serde(default = "default_registry_address")]
    pub registry_address: String,
    /// Where requests are forwarded; derived from `registry_address` when unset
    #[serde(default)]
    pub backend_url: Option<String>,
}

fn default_listen_address() -> String {
    "0.0.0.0:5001".to_string()
}

fn default_registry_address() -> String {
    ":5000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            registry_address: default_registry_address(),
            backend_url: None,
        }
    }
}

impl ServerConfig {
    /// Backend URL, falling back to the loopback form of `registry_address`
    pub fn backend_url(&self) -> String {
        match &self.backend_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://127.0.0.1:{}", port_of(&self.registry_address)),
        }
    }
}

/// Port part of a `host:port` or `:port` listen address
pub(crate) fn port_of(address: &str) -> &str {
    address.rsplit_once(':').map(|(_, port)| port).unwrap_or(address)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullConfig {
    #[serde(default = "default_repull_interval", with = "humantime_serde")]
    pub repull_interval: Duration,
    #[serde(default = "default_pull_timeout", with = "humantime_serde")]
    pub pull_timeout: Duration,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default)]
    pub copy_mode: CopyMode,
    #[serde(default)]
    pub mirror: Option<String>,
}

fn default_repull_interval() -> Duration {
    DEFAULT_REPULL_INTERVAL
}

fn default_pull_timeout() -> Duration {
    DEFAULT_PULL_TIMEOUT
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            repull_interval: DEFAULT_REPULL_INTERVAL,
            pull_timeout: DEFAULT_PULL_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            copy_mode: CopyMode::default(),
            mirror: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrePullConfig {
    #[serde(default)]
    pub image_list_file: Option<PathBuf>,
    #[serde(default = "default_marker_file")]
    pub marker_file: PathBuf,
    #[serde(default = "default_prepull_concurrency")]
    pub concurrency: usize,
}

fn default_marker_file() -> PathBuf {
    PathBuf::from(DEFAULT_PREPULL_MARKER)
}

fn default_prepull_concurrency() -> usize {
    4
}

impl Default for PrePullConfig {
    fn default() -> Self {
        Self {
            image_list_file: None,
            marker_file: default_marker_file(),
            concurrency: default_prepull_concurrency(),
        }
    }
}

/// External command used as the copy primitive
///
/// Arguments may contain `{source}`, `{registry}`, `{image}` and `{repository}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopierConfig {
    #[serde(default = "default_copier_program")]
    pub program: String,
    #[serde(default = "default_copier_args")]
    pub args: Vec<String>,
}

fn default_copier_program() -> String {
    "skopeo".to_string()
}

fn default_copier_args() -> Vec<String> {
    [
        "copy",
        "--all",
        "--dest-tls-verify=false",
        "docker://{image}",
        "docker://{registry}/{repository}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for CopierConfig {
    fn default() -> Self {
        Self {
            program: default_copier_program(),
            args: default_copier_args(),
        }
    }
}

/// Settings the gate re-reads on every request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuntimeSettings {
    pub copy_mode: CopyMode,
    pub mirror: Option<String>,
}

impl From<&PullConfig> for RuntimeSettings {
    fn from(pull: &PullConfig) -> Self {
        Self {
            copy_mode: pull.copy_mode,
            mirror: pull.mirror.clone().filter(|m| !m.is_empty()),
        }
    }
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Load a TOML file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PullThroughError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Defaults overlaid with the process environment
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay values found through `lookup`; empty values count as unset
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = non_empty(lookup);

        if let Some(raw) = lookup(ENV_REPULL_MIN_INTERVAL) {
            self.pull.repull_interval = parse_duration(ENV_REPULL_MIN_INTERVAL, &raw)?;
        }
        if let Some(raw) = lookup(ENV_PULL_TIMEOUT) {
            self.pull.pull_timeout = parse_duration(ENV_PULL_TIMEOUT, &raw)?;
        }
        if let Some(raw) = lookup(ENV_COPY_MODE) {
            self.pull.copy_mode = raw.parse().map_err(PullThroughError::Config)?;
        }
        if let Some(mirror) = lookup(ENV_MIRROR) {
            self.pull.mirror = Some(mirror);
        }
        if let Some(list) = lookup(ENV_PREPULL_LIST) {
            self.pre_pull.image_list_file = Some(PathBuf::from(list));
        }
        if let Some(marker) = lookup(ENV_PREPULL_MARKER) {
            self.pre_pull.marker_file = PathBuf::from(marker);
        }
        if let Some(addr) = lookup(ENV_REGISTRY_ADDR) {
            self.server.registry_address = addr;
        }
        if let Some(addr) = lookup(ENV_LISTEN_ADDR) {
            self.server.listen_address = addr;
        }
        if let Some(url) = lookup(ENV_BACKEND_URL) {
            self.server.backend_url = Some(url);
        }
        if let Some(program) = lookup(ENV_SYNC_PROGRAM) {
            self.copier.program = program;
        }

        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.pull.repull_interval.is_zero() {
            return Err(PullThroughError::Config(
                "repull_interval must be greater than zero".to_string(),
            ));
        }
        if self.pull.poll_interval.is_zero() {
            return Err(PullThroughError::Config(
                "poll_interval must be greater than zero".to_string(),
            ));
        }
        if self.pre_pull.concurrency == 0 {
            return Err(PullThroughError::Config(
                "pre_pull.concurrency must be at least 1".to_string(),
            ));
        }
        if self.copier.program.is_empty() {
            return Err(PullThroughError::Config(
                "copier.program must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn non_empty<F>(lookup: F) -> impl Fn(&str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    move |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Parse a duration such as `10m`, `90s` or `1h 30m`
pub fn parse_duration(key: &str, raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw.trim()).map_err(|source| PullThroughError::Duration {
        key: key.to_string(),
        value: raw.to_string(),
        source,
    })
}
