//! Command correlation and timeout-bounded execution
//!
//! The dispatcher is the boundary where command-level failures turn into
//! terminal `failed` results. Nothing an executor does (error, panic, hang)
//! escapes to the connection.

use crate::config::ExecutionConfig;
use crate::error::CommandError;
use crate::executor::{ExecutionContext, ExecutorRegistry};
use crate::reporter::ResultReporter;
use crate::telemetry::TelemetryCollector;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tether_proto::CommandId;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};


/// Time an executor gets to reclaim its resources after a timeout
pub const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// An inbound command, alive only while it executes
#[derive(Debug, Clone)]
pub struct Command {
    /// Correlation ID
    pub command_id: CommandId,
    /// Executor type tag
    pub command_type: String,
    /// Executor parameters
    pub params: Value,
    /// When the command arrived
    pub received_at: Instant,
}

impl Command {
    /// Create a command received now
    pub fn new(command_id: CommandId, command_type: impl Into<String>, params: Value) -> Self {
        Self {
            command_id,
            command_type: command_type.into(),
            params,
            received_at: Instant::now(),
        }
    }
}

/// What [`CommandDispatcher::dispatch`] did with a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Tracked and scheduled
    Accepted,
    /// Already in flight; ignored
    Duplicate,
}

type InFlight = Arc<Mutex<HashSet<CommandId>>>;

/// Removes its command ID from the in-flight set when dropped
struct InFlightGuard {
    in_flight: InFlight,
    command_id: CommandId,
}

impl InFlightGuard {
    fn acquire(in_flight: &InFlight, command_id: &CommandId) -> Option<Self> {
        lock(in_flight).insert(command_id.clone()).then(|| Self {
            in_flight: Arc::clone(in_flight),
            command_id: command_id.clone(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.in_flight).remove(&self.command_id);
    }
}

fn lock(in_flight: &InFlight) -> MutexGuard<'_, HashSet<CommandId>> {
    in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Tracks in-flight commands and runs them on independent tasks
///
/// One dispatcher per connection. Cancelling its token (disconnect or
/// shutdown) cancels every running command.
#[derive(Clone)]
pub struct CommandDispatcher {
    registry: Arc<ExecutorRegistry>,
    reporter: ResultReporter,
    telemetry: TelemetryCollector,
    in_flight: InFlight,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    default_timeout: Duration,
    max_timeout: Duration,
}

impl CommandDispatcher {
    /// Create a dispatcher reporting through `reporter`
    pub fn new(
        registry: Arc<ExecutorRegistry>,
        reporter: ResultReporter,
        config: &ExecutionConfig,
        telemetry: TelemetryCollector,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            reporter,
            telemetry,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            cancel,
            default_timeout: Duration::from_secs(config.default_timeout_secs),
            max_timeout: Duration::from_secs(config.max_timeout_secs),
        }
    }

    /// Accept a command unless its ID is already in flight
    ///
    /// Emits the `executing` status before returning. Must be called from
    /// within a Tokio runtime.
    pub fn dispatch(&self, command: Command) -> DispatchOutcome {
        let Some(guard) = InFlightGuard::acquire(&self.in_flight, &command.command_id) else {
            warn!(
                command_id = %command.command_id,
                "Ignoring duplicate delivery of in-flight command"
            );
            return DispatchOutcome::Duplicate;
        };

        info!(
            command_id = %command.command_id,
            command_type = %command.command_type,
            "Command accepted"
        );
        self.reporter.command_status(command.command_id.clone());

        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.run(command, guard).await;
        });
        DispatchOutcome::Accepted
    }

    /// Commands currently tracked
    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Cancel every running command
    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }

    /// Timeout for a command: `timeout` or `timeoutSeconds`, clamped
    pub fn resolve_timeout(&self, params: &Value) -> Duration {
        ["timeout", "timeoutSeconds"]
            .iter()
            .find_map(|key| params.get(*key).and_then(Value::as_u64))
            .filter(|secs| *secs > 0)
            .map_or(self.default_timeout, |secs| {
                Duration::from_secs(secs).min(self.max_timeout)
            })
    }

    async fn run(self, command: Command, guard: InFlightGuard) {
        let started = Instant::now();
        let outcome = self.execute(&command).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                info!(
                    command_id = %command.command_id,
                    command_type = %command.command_type,
                    elapsed_ms,
                    "Command completed"
                );
                self.telemetry.record_result(true);
                self.reporter
                    .command_completed(command.command_id.clone(), result, elapsed_ms);
            }
            Err(e) => {
                warn!(
                    command_id = %command.command_id,
                    command_type = %command.command_type,
                    elapsed_ms,
                    error = %e,
                    "Command failed"
                );
                self.telemetry.record_result(false);
                self.reporter
                    .command_failed(command.command_id.clone(), e, elapsed_ms);
            }
        }

        drop(guard);
    }

    async fn execute(&self, command: &Command) -> Result<Value, CommandError> {
        let executor = self
            .registry
            .get(&command.command_type)
            .ok_or_else(|| CommandError::UnsupportedCommand(command.command_type.clone()))?;
        let timeout = self.resolve_timeout(&command.params);
        let cancel = self.cancel.child_token();

        let _permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| CommandError::Cancelled)?
            }
            _ = cancel.cancelled() => return Err(CommandError::Cancelled),
        };

        let ctx = ExecutionContext {
            command_id: command.command_id.clone(),
            timeout,
            cancel: cancel.clone(),
        };
        let params = command.params.clone();
        let mut task = tokio::spawn(async move { executor.execute(params, ctx).await });

        tokio::select! {
            joined = &mut task => return flatten(joined),
            _ = tokio::time::sleep(timeout) => {}
        }

        warn!(
            command_id = %command.command_id,
            timeout_ms = timeout.as_millis() as u64,
            "Command timed out, reclaiming resources"
        );
        cancel.cancel();
        if tokio::time::timeout(CANCEL_GRACE, &mut task).await.is_err() {
            warn!(
                command_id = %command.command_id,
                "Executor ignored cancellation, aborting task"
            );
            task.abort();
        }
        Err(CommandError::Timeout { after: timeout })
    }
}

fn flatten(
    joined: Result<Result<Value, CommandError>, tokio::task::JoinError>,
) -> Result<Value, CommandError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(CommandError::Execution(format!("Executor panicked: {}", message)))
        }
        Err(_) => Err(CommandError::Cancelled),
    }
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("registry", &self.registry)
            .field("in_flight", &self.in_flight_count())
            .field("default_timeout", &self.default_timeout)
            .field("max_timeout", &self.max_timeout)
            .finish()
    }
}
