use crate::error::CommandError;
use crate::executor::{ExecutionContext, Executor};
use crate::telemetry::TelemetryCollector;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

const SAMPLE_BUDGET: Duration = Duration::from_secs(2);

/// Returns the same telemetry snapshot heartbeats carry
#[derive(Debug, Clone)]
pub struct MetricsExecutor {
    telemetry: TelemetryCollector,
}

impl MetricsExecutor {
    /// Report from `telemetry`
    pub fn new(telemetry: TelemetryCollector) -> Self {
        Self { telemetry }
    }
}

#[async_trait]
impl Executor for MetricsExecutor {
    async fn execute(&self, _params: Value, ctx: ExecutionContext) -> Result<Value, CommandError> {
        let budget = SAMPLE_BUDGET.min(ctx.timeout);
        let snapshot = tokio::select! {
            snapshot = self.telemetry.collect(budget) => snapshot,
            _ = ctx.cancel.cancelled() => return Err(CommandError::Cancelled),
        };
        Ok(serde_json::to_value(snapshot)?)
    }
}
