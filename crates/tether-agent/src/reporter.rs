//! Single writer for outbound messages
//!
//! Every task that talks to the server holds a cheap [`ResultReporter`]
//! clone. Messages are queued onto one channel and written by
//! [`run_writer`], so frames never interleave on the wire. Once the writer
//! is gone, sends are dropped with a warning instead of buffered.

use crate::transport::ChannelWriter;
use serde_json::Value;
use tether_proto::{CommandId, ErrorDetails, JsonCodec, LogLevel, Outbound, Telemetry};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Work item for the writer task
#[derive(Debug)]
pub enum Outgoing {
    /// Encode and send
    Message(Outbound),
    /// Close the channel and stop
    Close,
}

/// Handle for queueing outbound messages
#[derive(Debug, Clone)]
pub struct ResultReporter {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl ResultReporter {
    /// Create a reporter and the receiver its writer task consumes
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a message; returns `false` if it was dropped
    pub fn send(&self, message: Outbound) -> bool {
        match self.tx.send(Outgoing::Message(message)) {
            Ok(()) => true,
            Err(mpsc::error::SendError(item)) => {
                if let Outgoing::Message(message) = item {
                    dropped(&message);
                }
                false
            }
        }
    }

    /// Report that a command started executing
    pub fn command_status(&self, command_id: CommandId) -> bool {
        self.send(Outbound::executing(command_id))
    }

    /// Report a command's successful terminal result
    pub fn command_completed(&self, command_id: CommandId, result: Value, elapsed_ms: u64) -> bool {
        self.send(Outbound::completed(command_id, result, elapsed_ms))
    }

    /// Report a command's failed terminal result
    pub fn command_failed(
        &self,
        command_id: CommandId,
        error: impl Into<ErrorDetails>,
        elapsed_ms: u64,
    ) -> bool {
        self.send(Outbound::failed(command_id, error.into(), elapsed_ms))
    }

    /// Send a heartbeat
    pub fn heartbeat(&self, metrics: Option<Telemetry>) -> bool {
        self.send(Outbound::heartbeat(metrics))
    }

    /// Forward a log line to the server
    pub fn log(&self, level: LogLevel, message: impl Into<String>, metadata: Value) -> bool {
        self.send(Outbound::log(level, message, metadata))
    }

    /// Answer a server ping
    pub fn pong(&self) -> bool {
        self.send(Outbound::Pong)
    }

    /// Ask the writer to close the channel after draining queued messages
    pub fn close(&self) {
        let _ = self.tx.send(Outgoing::Close);
    }

    /// Whether the writer is still accepting messages
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

fn dropped(message: &Outbound) {
    match message {
        Outbound::CommandResult {
            command_id, status, ..
        } if status.is_terminal() => {
            warn!("Channel not connected, result for command {} is lost", command_id);
        }
        _ => match message.command_id() {
            Some(id) => warn!("Channel not connected, dropping {} for command {}", message.kind(), id),
            None => warn!("Channel not connected, dropping {} message", message.kind()),
        },
    }
}

/// Drain `rx` onto `writer` until closed
///
/// Send failures are logged and the message is dropped; the loop keeps
/// going so a single bad write does not stall later results.
pub async fn run_writer(
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    mut writer: Box<dyn ChannelWriter>,
    codec: JsonCodec,
) {
    while let Some(item) = rx.recv().await {
        match item {
            Outgoing::Message(message) => {
                let kind = message.kind();
                let text = match codec.encode(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode {} message: {}", kind, e);
                        continue;
                    }
                };
                match writer.send_text(text).await {
                    Ok(()) => debug!("Sent {} message", kind),
                    Err(e) => warn!("Dropping {} message: {}", kind, e),
                }
            }
            Outgoing::Close => break,
        }
    }

    rx.close();
    if let Err(e) = writer.close().await {
        debug!("Channel close failed: {}", e);
    }
    debug!("Writer task stopped");
}
