//! Executor trait and the command-type registry

use crate::config::ExecutionConfig;
use crate::error::CommandError;
use crate::executors::{MetricsExecutor, ScreenshotExecutor, ShellExecutor};
use crate::telemetry::TelemetryCollector;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tether_proto::CommandId;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Per-invocation context handed to an executor
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Correlation ID of the command being executed
    pub command_id: CommandId,
    /// Budget the dispatcher enforces
    pub timeout: Duration,
    /// Cancelled on timeout, disconnect or shutdown; executors must
    /// reclaim their OS resources when it fires
    pub cancel: CancellationToken,
}

/// Handler for one command type
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run the command and produce its result payload
    async fn execute(&self, params: Value, ctx: ExecutionContext) -> Result<Value, CommandError>;
}

/// Mapping from command-type tag to executor
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in executors: `shell`, `screenshot`, `get_metrics`
    pub fn with_defaults(config: &ExecutionConfig, telemetry: TelemetryCollector) -> Self {
        let mut registry = Self::new();
        registry.register("shell", ShellExecutor::new(config.max_output_bytes));
        registry.register("screenshot", ScreenshotExecutor::default());
        registry.register("get_metrics", MetricsExecutor::new(telemetry));
        registry
    }

    /// Register an executor, replacing any previous one for the same type
    pub fn register<E>(&mut self, command_type: impl Into<String>, executor: E)
    where
        E: Executor + 'static,
    {
        let command_type = command_type.into();
        debug!("Registered executor for command type: {}", command_type);
        self.executors.insert(command_type, Arc::new(executor));
    }

    /// Look up the executor for a command type
    pub fn get(&self, command_type: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(command_type).cloned()
    }

    /// Registered command types, sorted; announced to the server as capabilities
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }

    /// Number of registered executors
    pub fn len(&self) -> usize {
        self.executors.len()
    }

    /// Whether no executors are registered
    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("types", &self.types())
            .finish()
    }
}
