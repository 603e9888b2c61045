//! Agent configuration
//!
//! Loaded from a JSON file, optionally overridden from the command line,
//! then validated once before the agent starts. Invalid configuration is
//! fatal.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tether_proto::Token;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("io: {0}")]
    Io(String),
    /// Config file is not valid JSON or has the wrong shape
    #[error("parse: {0}")]
    Parse(String),
    /// Values are present but unusable
    #[error("validation: {0}")]
    Validation(String),
}

/// Top-level agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Control server connection settings
    pub server: ServerConfig,
    /// Agent credentials and identity
    pub agent: IdentityConfig,
    /// Liveness settings
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Command execution settings
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Control server connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// WebSocket URL (`ws://` or `wss://`)
    pub url: String,
    /// Consecutive failed cycles tolerated before giving up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Budget for opening the channel
    #[serde(default = "default_handshake_secs")]
    pub connect_timeout_secs: u64,
    /// Budget for the auth reply
    #[serde(default = "default_handshake_secs")]
    pub auth_timeout_secs: u64,
    /// First reconnect delay
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Reconnect delay cap
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

/// Agent credentials and identity as configured
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityConfig {
    /// Agent token
    pub token: Token,
    /// Device name; defaults to the host name
    #[serde(default, alias = "device_name")]
    pub device_name: Option<String>,
    /// Platform description; defaults to the OS name and version
    #[serde(default)]
    pub platform: Option<String>,
    /// Reported version; defaults to the crate version
    #[serde(default)]
    pub version: Option<String>,
}

/// Immutable identity announced to the server on every connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    /// Agent token
    pub token: Token,
    /// Device name
    pub device_name: String,
    /// Platform description
    pub platform: String,
    /// Agent version
    pub version: String,
}

/// Liveness settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatConfig {
    /// Seconds between heartbeats
    pub interval_secs: u64,
    /// Consecutive unacknowledged heartbeats that mark the channel stale
    pub missed_threshold: u32,
    /// Budget for telemetry sampling before a heartbeat goes out without it
    pub telemetry_timeout_ms: u64,
}

/// Command execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionConfig {
    /// Per-command timeout when the command does not specify one
    pub default_timeout_secs: u64,
    /// Upper bound for command-specified timeouts
    pub max_timeout_secs: u64,
    /// Commands executing at the same time
    pub max_concurrent: usize,
    /// Per-stream cap on captured shell output
    pub max_output_bytes: usize,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

/// Values supplied on the command line or via environment
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Replaces `server.url`
    pub server_url: Option<String>,
    /// Replaces `agent.token`
    pub token: Option<String>,
    /// Replaces `logging.level`
    pub log_level: Option<String>,
    /// Replaces `logging.format`
    pub log_format: Option<LogFormat>,
}

/// Legacy flat layout: `{token, server, deviceName?, platform?, version?}`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlatConfig {
    token: Token,
    #[serde(default)]
    server: Option<String>,
    #[serde(default, alias = "device_name")]
    device_name: Option<String>,
    #[serde(default)]
    platform: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_handshake_secs() -> u64 {
    10
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            missed_threshold: 2,
            telemetry_timeout_ms: 2_000,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 30,
            max_timeout_secs: 3_600,
            max_concurrent: 16,
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl ServerConfig {
    /// Server settings with defaults for everything but the URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            connect_timeout_secs: default_handshake_secs(),
            auth_timeout_secs: default_handshake_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }

    /// Connect budget
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Auth reply budget
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }
}

impl HeartbeatConfig {
    /// Heartbeat period
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Telemetry sampling budget
    pub fn telemetry_timeout(&self) -> Duration {
        Duration::from_millis(self.telemetry_timeout_ms)
    }
}

impl IdentityConfig {
    /// Resolve the identity, filling host defaults
    pub fn resolve(&self) -> AgentIdentity {
        AgentIdentity {
            token: self.token.clone(),
            device_name: self
                .device_name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .or_else(sysinfo::System::host_name)
                .unwrap_or_else(|| "unknown-device".to_string()),
            platform: self.platform.clone().unwrap_or_else(default_platform),
            version: self
                .version
                .clone()
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
        }
    }
}

fn default_platform() -> String {
    let name = sysinfo::System::name().unwrap_or_else(|| std::env::consts::OS.to_string());
    match sysinfo::System::os_version() {
        Some(version) => format!("{} {}", name, version),
        None => name,
    }
}

impl AgentConfig {
    /// Minimal configuration for a server URL and token
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            server: ServerConfig::new(url),
            agent: IdentityConfig {
                token: Token::new(token),
                device_name: None,
                platform: None,
                version: None,
            },
            heartbeat: HeartbeatConfig::default(),
            execution: ExecutionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load from a JSON file without validating
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    /// Parse either the structured layout or the legacy flat layout
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let is_flat = value.get("token").is_some() && value.get("agent").is_none();
        if is_flat {
            let flat: FlatConfig =
                serde_json::from_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
            let mut config = Self::new(flat.server.unwrap_or_default(), flat.token.expose());
            config.agent.device_name = flat.device_name;
            config.agent.platform = flat.platform;
            config.agent.version = flat.version;
            return Ok(config);
        }

        serde_json::from_value(value).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply command-line overrides
    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(url) = overrides.server_url {
            self.server.url = url;
        }
        if let Some(token) = overrides.token {
            self.agent.token = Token::new(token);
        }
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
        if let Some(format) = overrides.log_format {
            self.logging.format = format;
        }
    }

    /// Semantic validation for settings that are not expressible via types
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.token.is_blank() {
            return Err(ConfigError::Validation("agent token is empty".to_string()));
        }

        let url = url::Url::parse(&self.server.url).map_err(|e| {
            ConfigError::Validation(format!("invalid server url '{}': {}", self.server.url, e))
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::Validation(format!(
                "server url must use ws:// or wss://, got {}://",
                url.scheme()
            )));
        }

        if self.server.max_reconnect_attempts == 0 {
            return Err(ConfigError::Validation(
                "server.maxReconnectAttempts must be at least 1".to_string(),
            ));
        }
        if self.server.connect_timeout_secs == 0 || self.server.auth_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "connect and auth timeouts must be positive".to_string(),
            ));
        }
        if self.server.backoff_base_ms == 0 || self.server.backoff_base_ms > self.server.backoff_max_ms {
            return Err(ConfigError::Validation(format!(
                "backoff base ({}ms) must be positive and not exceed max ({}ms)",
                self.server.backoff_base_ms, self.server.backoff_max_ms
            )));
        }

        if self.heartbeat.interval_secs == 0 {
            return Err(ConfigError::Validation(
                "heartbeat.intervalSecs must be positive".to_string(),
            ));
        }
        if self.heartbeat.missed_threshold == 0 {
            return Err(ConfigError::Validation(
                "heartbeat.missedThreshold must be at least 1".to_string(),
            ));
        }

        let exec = &self.execution;
        if exec.default_timeout_secs == 0 || exec.default_timeout_secs > exec.max_timeout_secs {
            return Err(ConfigError::Validation(format!(
                "execution.defaultTimeoutSecs ({}) must be positive and not exceed maxTimeoutSecs ({})",
                exec.default_timeout_secs, exec.max_timeout_secs
            )));
        }
        if exec.max_concurrent == 0 {
            return Err(ConfigError::Validation(
                "execution.maxConcurrent must be at least 1".to_string(),
            ));
        }
        if exec.max_output_bytes == 0 {
            return Err(ConfigError::Validation(
                "execution.maxOutputBytes must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
