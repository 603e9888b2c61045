//! Control channel abstraction
//!
//! The connection manager only sees text frames. [`ws::WsConnector`] maps
//! them onto a WebSocket; [`memory`] provides an in-process pair for tests
//! and embedding.

use crate::error::AgentError;
use async_trait::async_trait;

/// WebSocket transport
pub mod ws;

/// In-memory transport
pub mod memory;

/// Read half of a control channel
#[async_trait]
pub trait ChannelReader: Send {
    /// Next text frame; `None` on orderly close
    async fn next_text(&mut self) -> Option<Result<String, AgentError>>;
}

/// Write half of a control channel
#[async_trait]
pub trait ChannelWriter: Send {
    /// Send one text frame
    async fn send_text(&mut self, text: String) -> Result<(), AgentError>;

    /// Close the channel; further sends fail
    async fn close(&mut self) -> Result<(), AgentError>;
}

/// An open control channel
pub struct Channel {
    /// Inbound frames
    pub reader: Box<dyn ChannelReader>,
    /// Outbound frames
    pub writer: Box<dyn ChannelWriter>,
}

impl Channel {
    /// Assemble a channel from its halves
    pub fn new(reader: Box<dyn ChannelReader>, writer: Box<dyn ChannelWriter>) -> Self {
        Self { reader, writer }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

/// Opens control channels
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a channel to `url`
    async fn connect(&self, url: &str) -> Result<Channel, AgentError>;
}

#[async_trait]
impl<C> Connector for std::sync::Arc<C>
where
    C: Connector + ?Sized,
{
    async fn connect(&self, url: &str) -> Result<Channel, AgentError> {
        (**self).connect(url).await
    }
}
