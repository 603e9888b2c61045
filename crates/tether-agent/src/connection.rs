//! Connection lifecycle: connect, authenticate, serve, reconnect
//!
//! [`ConnectionManager`] owns the one control channel of the process and
//! all per-connection state. Each connection gets a fresh reporter,
//! dispatcher and heartbeat monitor; all of them are discarded when the
//! channel drops.
//!
//! ```text
//! Disconnected -> Connecting -> Authenticating -> Connected
//!      ^                                              |
//!      +------------- close / error / stale ----------+
//! any state -> Closing   (shutdown or fatal error, terminal)
//! ```

use crate::backoff::Backoff;
use crate::config::{AgentConfig, AgentIdentity};
use crate::dispatcher::{Command, CommandDispatcher};
use crate::error::AgentError;
use crate::executor::ExecutorRegistry;
use crate::heartbeat::HeartbeatMonitor;
use crate::reporter::{run_writer, ResultReporter};
use crate::telemetry::TelemetryCollector;
use crate::transport::{Channel, ChannelReader, Connector};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tether_proto::{AgentId, Inbound, JsonCodec, LogLevel, Outbound, PROTOCOL_VERSION};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[cfg(test)]
mod tests;

/// Time the writer gets to flush queued messages when a connection ends
const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// Lifecycle state of the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No channel; a reconnect may be pending
    Disconnected,
    /// Opening the channel
    Connecting,
    /// Channel open, auth sent, awaiting the reply
    Authenticating,
    /// Authenticated and serving commands
    Connected,
    /// Shutting down; terminal
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Owns the control channel and its retry policy
pub struct ConnectionManager {
    config: AgentConfig,
    identity: AgentIdentity,
    connector: Arc<dyn Connector>,
    registry: Arc<ExecutorRegistry>,
    telemetry: TelemetryCollector,
    codec: JsonCodec,
    backoff: Backoff,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
    agent_id: Option<AgentId>,
}

impl ConnectionManager {
    /// Create a manager with the built-in executors
    pub fn new(config: AgentConfig, connector: impl Connector + 'static) -> Self {
        let telemetry = TelemetryCollector::new();
        let registry = ExecutorRegistry::with_defaults(&config.execution, telemetry.clone());
        let identity = config.agent.resolve();
        let backoff = Backoff::new(
            Duration::from_millis(config.server.backoff_base_ms),
            Duration::from_millis(config.server.backoff_max_ms),
        );
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            config,
            identity,
            connector: Arc::new(connector),
            registry: Arc::new(registry),
            telemetry,
            codec: JsonCodec::new(),
            backoff,
            state,
            shutdown: CancellationToken::new(),
            agent_id: None,
        }
    }

    /// Replace the executor registry
    pub fn with_registry(mut self, registry: ExecutorRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Watch state transitions
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Cancel to shut the agent down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Server-assigned ID from the most recent successful authentication
    pub fn agent_id(&self) -> Option<&AgentId> {
        self.agent_id.as_ref()
    }

    /// Identity announced on every connection
    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    /// Run until shutdown or a fatal error
    ///
    /// Returns `Ok(())` after a requested shutdown. Authentication
    /// rejection and exhausted reconnect attempts are returned as errors
    /// without retrying.
    pub async fn run(&mut self) -> Result<(), AgentError> {
        info!(
            url = %self.config.server.url,
            device_name = %self.identity.device_name,
            "Starting connection manager"
        );

        while !self.shutdown.is_cancelled() {
            let session = Uuid::new_v4();
            let span = info_span!("connection", session = %session, attempt = self.backoff.attempt());
            let result = self.connect_and_serve().instrument(span).await;

            let error = match result {
                Ok(()) => break,
                Err(e) if e.is_fatal() => {
                    error!("Fatal connection error: {}", e);
                    self.set_state(ConnectionState::Closing);
                    return Err(e);
                }
                Err(e) => e,
            };

            self.set_state(ConnectionState::Disconnected);
            if self.shutdown.is_cancelled() {
                break;
            }

            let failures = self.backoff.attempt();
            if failures >= self.config.server.max_reconnect_attempts {
                let e = AgentError::ReconnectExhausted { attempts: failures };
                error!("{} (last error: {})", e, error);
                self.set_state(ConnectionState::Closing);
                return Err(e);
            }

            let delay = self.backoff.next_delay();
            warn!(
                attempt = failures + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Connection lost, reconnecting after backoff"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        info!("Connection manager stopped");
        self.set_state(ConnectionState::Closing);
        Ok(())
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(state = %next, "Connection state {} -> {}", previous, next);
        }
    }

    /// One connection cycle; `Ok` only on shutdown
    async fn connect_and_serve(&mut self) -> Result<(), AgentError> {
        self.set_state(ConnectionState::Connecting);

        let timeout = self.config.server.connect_timeout();
        let connect = tokio::time::timeout(timeout, self.connector.connect(&self.config.server.url));
        let channel = tokio::select! {
            result = connect => result.map_err(|_| {
                AgentError::Connection(format!("connect timed out after {:?}", timeout))
            })??,
            _ = self.shutdown.cancelled() => return Ok(()),
        };
        debug!("Channel open");

        let Channel { mut reader, writer } = channel;
        let (reporter, rx) = ResultReporter::new();
        let writer_task = tokio::spawn(run_writer(rx, writer, self.codec));

        let result = self.serve(reader.as_mut(), &reporter).await;

        reporter.close();
        if tokio::time::timeout(WRITER_DRAIN, writer_task).await.is_err() {
            debug!("Writer did not drain in time");
        }
        result
    }

    async fn serve(
        &mut self,
        reader: &mut dyn ChannelReader,
        reporter: &ResultReporter,
    ) -> Result<(), AgentError> {
        let capabilities = self.registry.types();
        reporter.send(Outbound::Register {
            token: self.identity.token.clone(),
            device_name: self.identity.device_name.clone(),
            platform: self.identity.platform.clone(),
            version: self.identity.version.clone(),
            protocol_version: PROTOCOL_VERSION,
            capabilities: capabilities.clone(),
        });
        self.set_state(ConnectionState::Authenticating);

        let Some(agent_id) = self.await_auth(reader).await? else {
            return Ok(());
        };
        self.backoff.reset();
        self.set_state(ConnectionState::Connected);
        info!(agent_id = %agent_id, "Authenticated");
        self.agent_id = Some(agent_id);

        reporter.log(
            LogLevel::Info,
            format!("Agent {} connected", self.identity.version),
            json!({
                "version": self.identity.version,
                "platform": self.identity.platform,
                "capabilities": capabilities,
            }),
        );

        let cancel = self.shutdown.child_token();
        let dispatcher = CommandDispatcher::new(
            Arc::clone(&self.registry),
            reporter.clone(),
            &self.config.execution,
            self.telemetry.clone(),
            cancel.clone(),
        );
        let heartbeat = HeartbeatMonitor::new(&self.config.heartbeat);
        let mut heartbeat_task =
            tokio::spawn(heartbeat.clone().run(reporter.clone(), self.telemetry.clone()));

        let result = self
            .read_loop(reader, &dispatcher, &heartbeat, reporter, &mut heartbeat_task)
            .await;

        heartbeat_task.abort();
        dispatcher.cancel_all();
        result
    }

    /// Wait for the auth reply; `None` on shutdown
    async fn await_auth(&self, reader: &mut dyn ChannelReader) -> Result<Option<AgentId>, AgentError> {
        let timeout = self.config.server.auth_timeout();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            let frame = tokio::select! {
                _ = &mut deadline => {
                    return Err(AgentError::Connection(format!(
                        "no authentication reply within {:?}",
                        timeout
                    )))
                }
                _ = self.shutdown.cancelled() => return Ok(None),
                frame = reader.next_text() => frame,
            };

            let text = match frame {
                Some(text) => text?,
                None => {
                    return Err(AgentError::Connection(
                        "channel closed during authentication".to_string(),
                    ))
                }
            };

            match self.codec.decode::<Inbound>(&text) {
                Ok(Inbound::AuthSuccess { agent_id, device_name }) => {
                    if let Some(name) = device_name {
                        debug!("Server knows this agent as {}", name);
                    }
                    return Ok(Some(agent_id));
                }
                Ok(Inbound::AuthError { message }) | Ok(Inbound::Error { message }) => {
                    return Err(AgentError::Authentication(message));
                }
                Ok(Inbound::Welcome { message }) => {
                    debug!("Server greeting: {}", message.unwrap_or_default());
                }
                Ok(other) => debug!("Ignoring {} before authentication", other.kind()),
                Err(e) => warn!("Ignoring undecodable message during authentication: {}", e),
            }
        }
    }

    async fn read_loop(
        &self,
        reader: &mut dyn ChannelReader,
        dispatcher: &CommandDispatcher,
        heartbeat: &HeartbeatMonitor,
        reporter: &ResultReporter,
        heartbeat_task: &mut JoinHandle<AgentError>,
    ) -> Result<(), AgentError> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested");
                    return Ok(());
                }
                joined = &mut *heartbeat_task => {
                    return Err(joined.unwrap_or_else(|e| {
                        AgentError::Connection(format!("heartbeat task failed: {}", e))
                    }));
                }
                frame = reader.next_text() => match frame {
                    Some(Ok(text)) => self.handle_frame(&text, dispatcher, heartbeat, reporter)?,
                    Some(Err(e)) => return Err(e),
                    None => return Err(AgentError::Connection("channel closed by server".to_string())),
                },
            }
        }
    }

    fn handle_frame(
        &self,
        text: &str,
        dispatcher: &CommandDispatcher,
        heartbeat: &HeartbeatMonitor,
        reporter: &ResultReporter,
    ) -> Result<(), AgentError> {
        let message: Inbound = match self.codec.decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring undecodable message: {}", e);
                return Ok(());
            }
        };

        if message.is_liveness_ack() {
            heartbeat.record_ack();
        }

        match message {
            Inbound::Command {
                command_id,
                command_type,
                command_data,
            } => {
                let command = Command::new(command_id, command_type, command_data);
                dispatcher.dispatch(command);
            }
            Inbound::Ping => {
                reporter.pong();
            }
            Inbound::Pong | Inbound::HeartbeatAck => {}
            Inbound::AuthError { message } => return Err(AgentError::Authentication(message)),
            Inbound::Error { message } => warn!("Server reported error: {}", message),
            Inbound::Unknown => debug!("Ignoring message of unknown type"),
            other => debug!("Ignoring {} after authentication", other.kind()),
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.config.server.url)
            .field("identity", &self.identity)
            .field("state", &*self.state.borrow())
            .field("agent_id", &self.agent_id)
            .field("registry", &self.registry)
            .finish()
    }
}
