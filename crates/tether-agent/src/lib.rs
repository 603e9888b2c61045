//! # Tether Agent
//!
//! Long-lived agent that keeps an authenticated control channel to a
//! server, executes the commands it receives and reports correlated
//! results. Network failures are survived with heartbeats and
//! reconnect-with-backoff.
//!
//! ```no_run
//! use tether_agent::{AgentConfig, ConnectionManager, WsConnector};
//!
//! # async fn run() -> Result<(), tether_agent::AgentError> {
//! let config = AgentConfig::new("wss://control.example.com/ws/agent", "token");
//! config.validate()?;
//! let mut manager = ConnectionManager::new(config, WsConnector);
//! manager.run().await
//! # }
//! ```

#![warn(missing_docs)]

/// Reconnect backoff policy
pub mod backoff;

/// Agent configuration
pub mod config;

/// Connection lifecycle
pub mod connection;

/// Command correlation and execution
pub mod dispatcher;

/// Error types
pub mod error;

/// Executor trait and registry
pub mod executor;

/// Built-in executors
pub mod executors;

/// Heartbeats and staleness detection
pub mod heartbeat;

/// Tracing setup
pub mod logging;

/// Subprocess helpers
pub mod process;

/// Outbound message writer
pub mod reporter;

/// Host telemetry
pub mod telemetry;

/// Control channel transports
pub mod transport;

pub use config::{AgentConfig, AgentIdentity, ConfigError, ConfigOverrides};
pub use connection::{ConnectionManager, ConnectionState};
pub use dispatcher::{Command, CommandDispatcher, DispatchOutcome};
pub use error::{AgentError, CommandError};
pub use executor::{ExecutionContext, Executor, ExecutorRegistry};
pub use reporter::ResultReporter;
pub use transport::ws::WsConnector;
