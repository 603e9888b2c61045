//! Error types for the Tether agent

use std::time::Duration;
use tether_proto::{ErrorCode, ErrorDetails, ProtocolError};
use thiserror::Error;

/// Connection-level errors, owned by the connection manager
#[derive(Debug, Error)]
pub enum AgentError {
    /// Transient network or handshake failure; triggers a reconnect
    #[error("Connection error: {0}")]
    Connection(String),

    /// Server rejected the credentials; never retried with the same token
    #[error("Authentication rejected: {0}")]
    Authentication(String),

    /// No heartbeat acknowledgment for too many intervals
    #[error("Heartbeat timeout: {missed} consecutive intervals without acknowledgment")]
    HeartbeatTimeout {
        /// Consecutive unacknowledged heartbeats
        missed: u32,
    },

    /// Reconnect attempts used up
    #[error("Giving up after {attempts} failed reconnect attempts")]
    ReconnectExhausted {
        /// Attempts made
        attempts: u32,
    },

    /// Invalid startup configuration
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Malformed traffic
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Writing to the channel failed; the message is dropped
    #[error("Send failed: {0}")]
    Send(String),
}

impl AgentError {
    /// Whether this error must terminate the process instead of reconnecting
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Authentication(_) | Self::Config(_) | Self::ReconnectExhausted { .. }
        )
    }
}

/// Command-level errors, converted into terminal `failed` results
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    /// Execution exceeded its budget; the underlying resource was reclaimed
    #[error("Command timed out after {}s", .after.as_secs_f64())]
    Timeout {
        /// Budget that was exceeded
        after: Duration,
    },

    /// Executor-specific failure
    #[error("{0}")]
    Execution(String),

    /// No executor registered for this type
    #[error("Unsupported command type: {0}")]
    UnsupportedCommand(String),

    /// Host lacks the required capability
    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// Parameters missing or malformed
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Cancelled by shutdown or disconnect
    #[error("Command cancelled")]
    Cancelled,
}

impl CommandError {
    /// Wire error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Execution(_) => ErrorCode::ExecutionFailed,
            Self::UnsupportedCommand(_) => ErrorCode::UnsupportedCommand,
            Self::CapabilityUnavailable(_) => ErrorCode::CapabilityUnavailable,
            Self::InvalidParams(_) => ErrorCode::InvalidParams,
            Self::Cancelled => ErrorCode::Cancelled,
        }
    }
}

impl From<CommandError> for ErrorDetails {
    fn from(error: CommandError) -> Self {
        ErrorDetails::new(error.code(), error.to_string())
    }
}

impl From<serde_json::Error> for CommandError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidParams(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(AgentError::Authentication("bad token".into()).is_fatal());
        assert!(AgentError::ReconnectExhausted { attempts: 3 }.is_fatal());
        assert!(!AgentError::Connection("reset".into()).is_fatal());
        assert!(!AgentError::HeartbeatTimeout { missed: 2 }.is_fatal());
        assert!(!AgentError::Send("closed".into()).is_fatal());
    }

    #[test]
    fn test_command_error_details() {
        let details: ErrorDetails = CommandError::Timeout {
            after: Duration::from_secs(2),
        }
        .into();
        assert_eq!(details.code, ErrorCode::Timeout);
        assert_eq!(details.message, "Command timed out after 2s");

        let details: ErrorDetails = CommandError::UnsupportedCommand("reboot".into()).into();
        assert_eq!(details.code, ErrorCode::UnsupportedCommand);
        assert!(details.message.contains("reboot"));
    }
}
