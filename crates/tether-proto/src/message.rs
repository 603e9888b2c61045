//! Message types and enums
//!
//! The canonical schema uses snake_case `type` tags and camelCase field
//! names. Inbound messages also accept the snake_case field spellings that
//! older servers emit; outbound messages are always camelCase.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Version of the wire schema announced in the auth message
pub const PROTOCOL_VERSION: u32 = 1;

/// Opaque identifier assigned by the server
///
/// Servers use either JSON numbers or strings. The original JSON type is
/// preserved so the identifier is echoed back exactly as received.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Identifier {
    /// Numeric identifier
    Number(i64),
    /// String identifier
    Text(String),
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Identifier {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for Identifier {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Identifier {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// Correlation ID linking an inbound command to its status and result
pub type CommandId = Identifier;

/// Server-assigned agent identifier
pub type AgentId = Identifier;

/// Agent credential
///
/// Serialized as a plain string; never printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    /// Wrap a raw token
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Raw token value
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Whether the token is empty or whitespace
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(***)")
    }
}

/// Messages received from the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Inbound {
    /// Greeting sent by some servers before authentication
    Welcome {
        /// Free-form greeting
        #[serde(default)]
        message: Option<String>,
    },

    /// Authentication accepted
    AuthSuccess {
        /// Server-assigned agent identifier
        #[serde(alias = "agent_id")]
        agent_id: AgentId,
        /// Device name as registered on the server
        #[serde(default, alias = "device_name")]
        device_name: Option<String>,
    },

    /// Authentication rejected
    AuthError {
        /// Reason given by the server
        #[serde(default, alias = "error")]
        message: String,
    },

    /// Command to execute
    Command {
        /// Correlation ID
        #[serde(alias = "command_id")]
        command_id: CommandId,
        /// Executor type tag
        #[serde(alias = "command_type")]
        command_type: String,
        /// Executor-specific parameters
        #[serde(
            default = "empty_object",
            alias = "command_data",
            deserialize_with = "null_as_empty_object"
        )]
        command_data: Value,
    },

    /// Liveness probe from the server
    Ping,

    /// Reply to an agent ping
    Pong,

    /// Acknowledgment of an agent heartbeat
    HeartbeatAck,

    /// Server-side error report
    Error {
        /// Error description
        #[serde(default, alias = "error")]
        message: String,
    },

    /// Any message type this agent does not understand
    #[serde(other)]
    Unknown,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn null_as_empty_object<'de, D>(deserializer: D) -> Result<Value, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(empty_object()),
        value => Ok(value),
    }
}

impl Inbound {
    /// Wire type tag, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::AuthSuccess { .. } => "auth_success",
            Self::AuthError { .. } => "auth_error",
            Self::Command { .. } => "command",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::HeartbeatAck => "heartbeat_ack",
            Self::Error { .. } => "error",
            Self::Unknown => "unknown",
        }
    }

    /// Whether this message proves the server is still answering heartbeats
    pub fn is_liveness_ack(&self) -> bool {
        matches!(self, Self::Ping | Self::Pong | Self::HeartbeatAck)
    }
}

/// Messages sent to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Outbound {
    /// Authentication and registration, first message on every connection
    #[serde(rename = "auth", alias = "register")]
    Register {
        /// Agent credential
        token: Token,
        /// Human-readable device name
        device_name: String,
        /// Host platform description
        platform: String,
        /// Agent version
        version: String,
        /// Wire schema version
        protocol_version: u32,
        /// Command types this agent can execute
        #[serde(default)]
        capabilities: Vec<String>,
    },

    /// Periodic liveness signal
    Heartbeat {
        /// Milliseconds since the Unix epoch
        timestamp: u64,
        /// Piggybacked telemetry
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metrics: Option<Telemetry>,
    },

    /// Command accepted and about to execute
    CommandStatus {
        /// Correlation ID
        command_id: CommandId,
        /// Always `executing`
        status: CommandStatus,
    },

    /// Terminal result of a command
    CommandResult {
        /// Correlation ID
        command_id: CommandId,
        /// `completed` or `failed`
        status: CommandStatus,
        /// Convenience flag mirroring `status`
        success: bool,
        /// Executor payload on success
        result: Option<Value>,
        /// Error message on failure
        error: Option<String>,
        /// Machine-readable error class on failure
        error_code: Option<ErrorCode>,
        /// Wall-clock execution time
        execution_time_ms: u64,
    },

    /// Log line forwarded to the server
    Log {
        /// Severity
        level: LogLevel,
        /// Log text
        message: String,
        /// Structured context
        #[serde(default = "empty_object")]
        metadata: Value,
    },

    /// Reply to a server ping
    Pong,
}

impl Outbound {
    /// Create a heartbeat stamped with the current time
    pub fn heartbeat(metrics: Option<Telemetry>) -> Self {
        Self::Heartbeat {
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            metrics,
        }
    }

    /// Create the `executing` status for a command
    pub fn executing(command_id: CommandId) -> Self {
        Self::CommandStatus {
            command_id,
            status: CommandStatus::Executing,
        }
    }

    /// Create a successful terminal result
    pub fn completed(command_id: CommandId, result: Value, execution_time_ms: u64) -> Self {
        Self::CommandResult {
            command_id,
            status: CommandStatus::Completed,
            success: true,
            result: Some(result),
            error: None,
            error_code: None,
            execution_time_ms,
        }
    }

    /// Create a failed terminal result
    pub fn failed(command_id: CommandId, error: ErrorDetails, execution_time_ms: u64) -> Self {
        Self::CommandResult {
            command_id,
            status: CommandStatus::Failed,
            success: false,
            result: None,
            error: Some(error.message),
            error_code: Some(error.code),
            execution_time_ms,
        }
    }

    /// Create a log message
    pub fn log(level: LogLevel, message: impl Into<String>, metadata: Value) -> Self {
        Self::Log {
            level,
            message: message.into(),
            metadata,
        }
    }

    /// Wire type tag, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "auth",
            Self::Heartbeat { .. } => "heartbeat",
            Self::CommandStatus { .. } => "command_status",
            Self::CommandResult { .. } => "command_result",
            Self::Log { .. } => "log",
            Self::Pong => "pong",
        }
    }

    /// Correlation ID if this message belongs to a command
    pub fn command_id(&self) -> Option<&CommandId> {
        match self {
            Self::CommandStatus { command_id, .. } | Self::CommandResult { command_id, .. } => {
                Some(command_id)
            }
            _ => None,
        }
    }
}

/// Lifecycle status of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// Accepted, execution starting
    Executing,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
}

impl CommandStatus {
    /// Whether this status ends the command lifecycle
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Executing)
    }
}

/// Log severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Debug
    Debug,
    /// Informational
    Info,
    /// Warning
    Warn,
    /// Error
    Error,
}

/// Host telemetry piggybacked on heartbeats
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    /// Seconds since the agent process started
    pub uptime_seconds: u64,
    /// Commands that reached a terminal result
    pub command_count: u64,
    /// Commands that ended in `failed`
    pub error_count: u64,
    /// Global CPU usage percentage, if sampled in time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f32>,
    /// Memory usage percentage, if sampled in time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<f32>,
}

/// Error details for failed results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
}

impl ErrorDetails {
    /// Create new error details
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Error codes for failed commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Execution exceeded its time budget and was killed
    Timeout,
    /// Executor-specific failure
    ExecutionFailed,
    /// No executor registered for the command type
    UnsupportedCommand,
    /// Host lacks the capability the executor needs
    CapabilityUnavailable,
    /// Parameters missing or malformed
    InvalidParams,
    /// Execution cancelled by agent shutdown or disconnect
    Cancelled,
}
