//! Configuration for the action proxy.
//!
//! Settings come from three layers, applied in order: built-in defaults, an
//! optional TOML/JSON file, and `PROXY_*` environment variables. The
//! [`ProxyConfig`] section is additionally overridable per `run` call (see
//! [`ProxyConfig::apply_overrides`]).

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, ProxyResult};

/// Default invocation payload limit (48 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 48 * 1024 * 1024;

/// Sidecar configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    /// Invocation server settings.
    pub server: ServerSettings,
    /// Target application settings.
    pub proxy: ProxyConfig,
    /// Bundled application settings.
    pub app: AppSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

impl SidecarConfig {
    /// Create a new configuration builder.
    pub fn builder() -> SidecarConfigBuilder {
        SidecarConfigBuilder::default()
    }

    /// Load configuration from a file.
    pub fn from_file(path: impl Into<PathBuf>) -> ProxyResult<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ProxyError::config(format!("failed to read config file: {e}")))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        match extension {
            "toml" => toml::from_str(&content)
                .map_err(|e| ProxyError::config(format!("invalid TOML: {e}"))),
            "json" => serde_json::from_str(&content)
                .map_err(|e| ProxyError::config(format!("invalid JSON: {e}"))),
            _ => Err(ProxyError::config(format!(
                "unsupported config format: {extension}"
            ))),
        }
    }

    /// Apply `PROXY_*` environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_env_lookup(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// Values that fail to parse are ignored and the previous setting kept.
    #[must_use]
    pub fn with_env_lookup(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(host) = lookup("PROXY_HOST") {
            self.proxy.host = host;
        }

        if let Some(port) = lookup("PROXY_PORT").and_then(|p| p.trim().parse().ok()) {
            self.proxy.port = port;
        }

        if let Some(path) = lookup("PROXY_ALIVE_PATH") {
            self.proxy.alive_path = path;
        }

        if let Some(ms) = lookup("PROXY_ALIVE_DELAY").and_then(|d| d.trim().parse::<u64>().ok()) {
            self.proxy.alive_delay = Duration::from_millis(ms);
        }

        if let Some(protocol) = lookup("PROXY_PROTOCOL").and_then(|p| p.parse().ok()) {
            self.proxy.protocol = protocol;
        }

        if let Some(ms) = lookup("PROXY_ALIVE_TIMEOUT").and_then(|d| d.trim().parse::<u64>().ok())
        {
            self.proxy.alive_timeout = Some(Duration::from_millis(ms));
        }

        if let Some(dir) = lookup("PROXY_APP_DIR") {
            self.app.dir = PathBuf::from(dir);
        }

        if let Some(port) = lookup("PROXY_LISTEN_PORT").and_then(|p| p.trim().parse().ok()) {
            self.server.listen_port = port;
        }

        if let Some(size) = lookup("PROXY_MAX_BODY_SIZE").and_then(|s| s.trim().parse().ok()) {
            self.server.max_request_body_size = size;
        }

        if let Some(format) = lookup("PROXY_LOG_FORMAT").and_then(|f| f.parse().ok()) {
            self.logging.format = format;
        }

        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ProxyResult<()> {
        if self.proxy.host.is_empty() {
            return Err(ProxyError::config("proxy host is required"));
        }

        if !self.proxy.alive_path.starts_with('/') {
            return Err(ProxyError::config("alive_path must start with '/'"));
        }

        if self.proxy.alive_delay.is_zero() {
            return Err(ProxyError::config("alive_delay must be greater than zero"));
        }

        if self.server.max_request_body_size == 0 {
            return Err(ProxyError::config(
                "max_request_body_size must be greater than zero",
            ));
        }

        Ok(())
    }
}

/// Invocation server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address to bind to.
    pub listen_addr: String,
    /// Port the invocation server listens on.
    pub listen_port: u16,
    /// Maximum `init`/`run` payload size in bytes.
    pub max_request_body_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: 8080,
            max_request_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

/// Scheme used to reach the target application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain HTTP.
    #[default]
    Http,
    /// HTTP over TLS.
    Https,
}

impl Protocol {
    /// URL scheme for this protocol.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            other => Err(ProxyError::config(format!("unsupported protocol: {other}"))),
        }
    }
}

/// Where and how to reach the target application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Application host.
    pub host: String,
    /// Application port.
    pub port: u16,
    /// Path probed for liveness.
    pub alive_path: String,
    /// Delay between liveness probes.
    #[serde(with = "humantime_serde")]
    pub alive_delay: Duration,
    /// Application scheme.
    pub protocol: Protocol,
    /// Upper bound on the readiness wait. `None` waits forever.
    #[serde(with = "humantime_serde::option")]
    pub alive_timeout: Option<Duration>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 80,
            alive_path: "/".to_string(),
            alive_delay: Duration::from_millis(100),
            protocol: Protocol::Http,
            alive_timeout: None,
        }
    }
}

impl ProxyConfig {
    /// `protocol://host:port` of the application.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    /// Full URL of the liveness probe.
    pub fn alive_url(&self) -> String {
        format!("{}{}", self.base_url(), self.alive_path)
    }

    /// Apply per-invocation overrides in place.
    ///
    /// Returns `true` when any field changed.
    pub fn apply_overrides(&mut self, overrides: &ProxyOverrides) -> bool {
        let before = self.clone();

        if let Some(ref host) = overrides.host {
            self.host.clone_from(host);
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(ref path) = overrides.alive_path {
            self.alive_path.clone_from(path);
        }
        if let Some(delay) = overrides.alive_delay {
            self.alive_delay = delay;
        }
        if let Some(protocol) = overrides.protocol {
            self.protocol = protocol;
        }

        *self != before
    }
}

/// `__ow_proxy_*` values carried by a single `run` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyOverrides {
    /// `__ow_proxy_host`.
    pub host: Option<String>,
    /// `__ow_proxy_port`.
    pub port: Option<u16>,
    /// `__ow_proxy_alive_path`.
    pub alive_path: Option<String>,
    /// `__ow_proxy_alive_delay`, in milliseconds on the wire.
    pub alive_delay: Option<Duration>,
    /// `__ow_proxy_protocol`.
    pub protocol: Option<Protocol>,
}

impl ProxyOverrides {
    /// Whether no override was supplied.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Bundled application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Directory bundled archives are extracted into.
    pub dir: PathBuf,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("action"),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human-readable output.
    Pretty,
}

impl FromStr for LogFormat {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(ProxyError::config(format!("unsupported log format: {other}"))),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive, used when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "action_proxy=info,warn".to_string(),
            format: LogFormat::Json,
        }
    }
}

/// Builder for `SidecarConfig`.
#[derive(Debug, Default)]
pub struct SidecarConfigBuilder {
    config: SidecarConfig,
}

impl SidecarConfigBuilder {
    /// Set the listen port.
    #[must_use]
    pub fn listen_port(mut self, port: u16) -> Self {
        self.config.server.listen_port = port;
        self
    }

    /// Set the listen address.
    #[must_use]
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.server.listen_addr = addr.into();
        self
    }

    /// Set the payload limit.
    #[must_use]
    pub fn max_request_body_size(mut self, size: usize) -> Self {
        self.config.server.max_request_body_size = size;
        self
    }

    /// Set the application host.
    #[must_use]
    pub fn proxy_host(mut self, host: impl Into<String>) -> Self {
        self.config.proxy.host = host.into();
        self
    }

    /// Set the application port.
    #[must_use]
    pub fn proxy_port(mut self, port: u16) -> Self {
        self.config.proxy.port = port;
        self
    }

    /// Set the liveness probe path.
    #[must_use]
    pub fn alive_path(mut self, path: impl Into<String>) -> Self {
        self.config.proxy.alive_path = path.into();
        self
    }

    /// Set the delay between liveness probes.
    #[must_use]
    pub fn alive_delay(mut self, delay: Duration) -> Self {
        self.config.proxy.alive_delay = delay;
        self
    }

    /// Bound the readiness wait.
    #[must_use]
    pub fn alive_timeout(mut self, timeout: Duration) -> Self {
        self.config.proxy.alive_timeout = Some(timeout);
        self
    }

    /// Set the application scheme.
    #[must_use]
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.config.proxy.protocol = protocol;
        self
    }

    /// Set the bundle extraction directory.
    #[must_use]
    pub fn app_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.app.dir = dir.into();
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ProxyResult<SidecarConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Serde helper for durations written as `"100ms"`, `"5s"`, `"2m"` or `"1h"`.
mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn format_duration(duration: Duration) -> String {
        if duration.subsec_millis() == 0 {
            format!("{}s", duration.as_secs())
        } else {
            format!("{}ms", duration.as_millis())
        }
    }

    pub(super) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let invalid = || format!("invalid duration: {s}");

        if let Some(n) = s.strip_suffix("ms") {
            let n: u64 = n.trim().parse().map_err(|_| invalid())?;
            Ok(Duration::from_millis(n))
        } else if let Some(n) = s.strip_suffix('s') {
            let n: u64 = n.trim().parse().map_err(|_| invalid())?;
            Ok(Duration::from_secs(n))
        } else if let Some(n) = s.strip_suffix('m') {
            let n: u64 = n.trim().parse().map_err(|_| invalid())?;
            Ok(Duration::from_secs(n * 60))
        } else if let Some(n) = s.strip_suffix('h') {
            let n: u64 = n.trim().parse().map_err(|_| invalid())?;
            Ok(Duration::from_secs(n * 3600))
        } else {
            // Bare numbers are milliseconds, like PROXY_ALIVE_DELAY
            let n: u64 = s.parse().map_err(|_| invalid())?;
            Ok(Duration::from_millis(n))
        }
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&super::format_duration(*d)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| super::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
