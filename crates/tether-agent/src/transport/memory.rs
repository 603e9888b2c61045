use super::{Channel, ChannelReader, ChannelWriter, Connector};
use crate::error::AgentError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tether_proto::{Inbound, JsonCodec, Outbound};
use tokio::sync::{mpsc, Mutex};

/// Create a connected pair: the agent side and the server side
pub fn channel() -> (Channel, ServerEnd) {
    let (to_agent, agent_rx) = mpsc::unbounded_channel();
    let (agent_tx, from_agent) = mpsc::unbounded_channel();

    let channel = Channel::new(
        Box::new(MemoryReader { rx: agent_rx }),
        Box::new(MemoryWriter { tx: Some(agent_tx) }),
    );
    let server = ServerEnd {
        to_agent: Some(to_agent),
        from_agent,
        codec: JsonCodec::new(),
    };
    (channel, server)
}

struct MemoryReader {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl ChannelReader for MemoryReader {
    async fn next_text(&mut self) -> Option<Result<String, AgentError>> {
        self.rx.recv().await.map(Ok)
    }
}

struct MemoryWriter {
    tx: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl ChannelWriter for MemoryWriter {
    async fn send_text(&mut self, text: String) -> Result<(), AgentError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| AgentError::Send("channel closed by agent".to_string()))?;
        tx.send(text)
            .map_err(|_| AgentError::Send("channel closed by server".to_string()))
    }

    async fn close(&mut self) -> Result<(), AgentError> {
        self.tx = None;
        Ok(())
    }
}

/// Server side of an in-memory channel
pub struct ServerEnd {
    to_agent: Option<mpsc::UnboundedSender<String>>,
    from_agent: mpsc::UnboundedReceiver<String>,
    codec: JsonCodec,
}

impl ServerEnd {
    /// Send a typed message to the agent
    pub fn send(&self, message: &Inbound) -> Result<(), AgentError> {
        let text = self.codec.encode(message)?;
        self.send_raw(text)
    }

    /// Send arbitrary JSON to the agent
    pub fn send_json(&self, value: serde_json::Value) -> Result<(), AgentError> {
        self.send_raw(value.to_string())
    }

    /// Send a raw text frame to the agent
    pub fn send_raw(&self, text: impl Into<String>) -> Result<(), AgentError> {
        let tx = self
            .to_agent
            .as_ref()
            .ok_or_else(|| AgentError::Send("server end closed".to_string()))?;
        tx.send(text.into())
            .map_err(|_| AgentError::Send("agent end dropped".to_string()))
    }

    /// Next message from the agent; `None` once the agent closed its side
    pub async fn recv(&mut self) -> Option<Outbound> {
        loop {
            let text = self.from_agent.recv().await?;
            match self.codec.decode(&text) {
                Ok(message) => return Some(message),
                Err(e) => tracing::warn!("Server end dropping undecodable frame: {}", e),
            }
        }
    }

    /// Like [`ServerEnd::recv`], giving up after `timeout`
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Outbound> {
        tokio::time::timeout(timeout, self.recv()).await.ok().flatten()
    }

    /// Next message that is not a heartbeat
    pub async fn recv_skipping_heartbeats(&mut self, timeout: Duration) -> Option<Outbound> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.recv_timeout(remaining).await? {
                Outbound::Heartbeat { .. } => continue,
                other => return Some(other),
            }
        }
    }

    /// Close the server side, as a server-initiated disconnect
    pub fn close(&mut self) {
        self.to_agent = None;
    }
}

/// Connector handing out scripted channels and failures in order
#[derive(Default)]
pub struct MemoryConnector {
    script: Mutex<VecDeque<Result<Channel, String>>>,
    attempts: AtomicUsize,
}

impl MemoryConnector {
    /// Create an empty connector; every connect fails until scripted
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a channel for the next connect
    pub async fn push_channel(&self, channel: Channel) {
        self.script.lock().await.push_back(Ok(channel));
    }

    /// Queue a connect failure
    pub async fn push_failure(&self, reason: impl Into<String>) {
        self.script.lock().await.push_back(Err(reason.into()));
    }

    /// Connect attempts made so far
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Channel, AgentError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().await.pop_front() {
            Some(Ok(channel)) => Ok(channel),
            Some(Err(reason)) => Err(AgentError::Connection(reason)),
            None => Err(AgentError::Connection(format!("{} unreachable", url))),
        }
    }
}
