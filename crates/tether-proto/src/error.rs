//! Error types for protocol operations

use thiserror::Error;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload could not be serialized or is not well-formed JSON
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Well-formed JSON that does not match any known envelope
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Message too large
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Actual message size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() {
            Self::InvalidMessage(err.to_string())
        } else {
            Self::Serialization(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_errors_are_serialization_errors() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert!(matches!(ProtocolError::from(err), ProtocolError::Serialization(_)));
    }

    #[test]
    fn test_shape_errors_are_invalid_messages() {
        let err = serde_json::from_str::<u32>("\"text\"").unwrap_err();
        assert!(matches!(ProtocolError::from(err), ProtocolError::InvalidMessage(_)));
    }
}
