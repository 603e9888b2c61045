//! JSON codec for text frames

use crate::ProtocolError;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Maximum message size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Codec turning envelopes into text frames and back
///
/// Stateless apart from its size limit; safe to share between tasks.
#[derive(Debug, Clone, Copy)]
pub struct JsonCodec {
    /// Maximum message size allowed, in bytes
    max_message_size: usize,
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonCodec {
    /// Create a new codec with default settings
    pub fn new() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Create a new codec with custom max message size
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    /// Encode a message to a text frame
    pub fn encode<T: Serialize>(&self, message: &T) -> Result<String, ProtocolError> {
        let text = serde_json::to_string(message)?;
        self.check_size(text.len())?;
        Ok(text)
    }

    /// Decode a text frame
    pub fn decode<T: DeserializeOwned>(&self, text: &str) -> Result<T, ProtocolError> {
        self.check_size(text.len())?;
        Ok(serde_json::from_str(text)?)
    }

    fn check_size(&self, size: usize) -> Result<(), ProtocolError> {
        if size > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        Ok(())
    }
}
