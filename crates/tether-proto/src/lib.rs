//! # Tether Protocol
//!
//! Wire message types, error codes and the JSON codec spoken between the
//! Tether agent and its control server.

#![warn(missing_docs)]

/// Message types and enums
pub mod message;

/// JSON codec for text frames
pub mod codec;

/// Error types for protocol operations
pub mod error;

pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use message::{
    AgentId, CommandId, CommandStatus, ErrorCode, ErrorDetails, Identifier, Inbound, LogLevel, Outbound,
    Telemetry, Token, PROTOCOL_VERSION,
};
