//! Shared fixtures for agent integration tests
//!
//! Runs a real `ConnectionManager` against in-memory channels and plays
//! the server side from the test.

#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tether_agent::config::AgentConfig;
use tether_agent::executors::{CapturedImage, ScreenCapture, ScreenshotExecutor};
use tether_agent::telemetry::TelemetryCollector;
use tether_agent::transport::memory::{self, MemoryConnector, ServerEnd};
use tether_agent::{AgentError, CommandError, ConnectionManager, ConnectionState, ExecutorRegistry};
use tether_proto::{CommandStatus, ErrorCode, Outbound};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default wait for a single server-side expectation
pub const STEP_TIMEOUT: Duration = Duration::from_secs(20);

/// Configuration tuned for fast tests
pub fn test_config() -> AgentConfig {
    let mut config = AgentConfig::new("ws://control.test/ws/agent", "T");
    config.agent.device_name = Some("integration-box".to_string());
    config.server.backoff_base_ms = 100;
    config.server.backoff_max_ms = 2_000;
    config.server.max_reconnect_attempts = 5;
    config.heartbeat.telemetry_timeout_ms = 0;
    config
}

/// Capture backend for a host without a display
pub struct Headless;

#[async_trait]
impl ScreenCapture for Headless {
    async fn capture(&self, _cancel: &CancellationToken) -> Result<CapturedImage, CommandError> {
        Err(CommandError::CapabilityUnavailable("no display attached".to_string()))
    }
}

/// Default executors, with screen capture unavailable
pub fn headless_registry(config: &AgentConfig) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::with_defaults(&config.execution, TelemetryCollector::new());
    registry.register("screenshot", ScreenshotExecutor::with_backend(Headless));
    registry
}

/// A running agent plus the handles a test needs to drive it
pub struct AgentHarness {
    pub connector: Arc<MemoryConnector>,
    pub state: watch::Receiver<ConnectionState>,
    pub shutdown: CancellationToken,
    task: JoinHandle<Result<(), AgentError>>,
}

impl AgentHarness {
    /// Start an agent that connects through `connector`
    pub fn start(config: AgentConfig, connector: Arc<MemoryConnector>) -> Self {
        let registry = headless_registry(&config);
        let manager = ConnectionManager::new(config, Arc::clone(&connector)).with_registry(registry);
        Self::spawn(manager, connector)
    }

    fn spawn(mut manager: ConnectionManager, connector: Arc<MemoryConnector>) -> Self {
        let state = manager.state();
        let shutdown = manager.shutdown_token();
        let task = tokio::spawn(async move { manager.run().await });
        Self {
            connector,
            state,
            shutdown,
            task,
        }
    }

    /// Start an agent with `channels` pre-queued connections
    pub async fn with_channels(config: AgentConfig, channels: usize) -> (Self, Vec<ServerEnd>) {
        let connector = Arc::new(MemoryConnector::new());
        let mut servers = Vec::with_capacity(channels);
        for _ in 0..channels {
            let (channel, server) = memory::channel();
            connector.push_channel(channel).await;
            servers.push(server);
        }
        (Self::start(config, connector), servers)
    }

    /// Wait until the agent reports `target`
    pub async fn wait_for_state(&mut self, target: ConnectionState) -> Result<()> {
        tokio::time::timeout(STEP_TIMEOUT, self.state.wait_for(|s| *s == target))
            .await
            .map_err(|_| anyhow!("agent never reached {}", target))??;
        Ok(())
    }

    /// Current state
    pub fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Request shutdown and wait for the agent to stop
    pub async fn stop(self) -> Result<(), AgentError> {
        self.shutdown.cancel();
        self.join().await
    }

    /// Wait for the agent to stop on its own
    pub async fn join(self) -> Result<(), AgentError> {
        match tokio::time::timeout(STEP_TIMEOUT, self.task).await {
            Ok(joined) => joined.expect("agent task panicked"),
            Err(_) => panic!("agent did not stop"),
        }
    }
}

/// Next message that is neither a heartbeat nor a log line
pub async fn next_message(server: &mut ServerEnd) -> Result<Outbound> {
    loop {
        match server.recv_timeout(STEP_TIMEOUT).await {
            Some(Outbound::Heartbeat { .. }) | Some(Outbound::Log { .. }) => continue,
            Some(message) => return Ok(message),
            None => bail!("agent sent nothing"),
        }
    }
}

/// Play the server side of a successful handshake
pub async fn authenticate(server: &mut ServerEnd, agent_id: Value) -> Result<()> {
    match next_message(server).await? {
        Outbound::Register { token, .. } if token.expose() == "T" => {}
        other => bail!("expected auth message with token T, got {:?}", other),
    }
    server.send_json(json!({"type": "auth_success", "agentId": agent_id, "deviceName": "integration-box"}))?;
    Ok(())
}

/// Send a command in wire form
pub fn send_command(server: &ServerEnd, command_id: Value, command_type: &str, data: Value) -> Result<()> {
    server.send_json(json!({
        "type": "command",
        "commandId": command_id,
        "commandType": command_type,
        "commandData": data,
    }))?;
    Ok(())
}

/// Expect the `executing` status for `command_id`, as wire JSON
pub async fn expect_executing(server: &mut ServerEnd, command_id: &Value) -> Result<()> {
    let message = next_message(server).await?;
    let wire = serde_json::to_value(&message)?;
    if !matches!(message, Outbound::CommandStatus { status: CommandStatus::Executing, .. })
        || &wire["commandId"] != command_id
    {
        bail!("expected executing status for {}, got {}", command_id, wire);
    }
    Ok(())
}

/// Expect the terminal result for `command_id`, as wire JSON
pub async fn expect_result(server: &mut ServerEnd, command_id: &Value) -> Result<Value> {
    let message = next_message(server).await?;
    let wire = serde_json::to_value(&message)?;
    if wire["type"] != "command_result" || &wire["commandId"] != command_id {
        bail!("expected result for {}, got {}", command_id, wire);
    }
    Ok(wire)
}

/// Expect a failed result with the given error code
pub async fn expect_failure(server: &mut ServerEnd, command_id: &Value, code: ErrorCode) -> Result<Value> {
    let wire = expect_result(server, command_id).await?;
    let expected = serde_json::to_value(code)?;
    if wire["status"] != "failed" || wire["errorCode"] != expected {
        bail!("expected failure {}, got {}", expected, wire);
    }
    Ok(wire)
}
