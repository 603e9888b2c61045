//! Periodic heartbeats and staleness detection

use crate::config::HeartbeatConfig;
use crate::error::AgentError;
use crate::reporter::ResultReporter;
use crate::telemetry::TelemetryCollector;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Floor for the tick period; `interval_at` panics on zero
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Liveness bookkeeping for one connection
#[derive(Debug, Clone, Copy, Default)]
pub struct HeartbeatState {
    /// When the last heartbeat was queued
    pub last_sent_at: Option<Instant>,
    /// When the server last acknowledged liveness
    pub last_ack_at: Option<Instant>,
    /// Heartbeats in a row that went unacknowledged
    pub missed_count: u32,
}

/// Sends heartbeats and signals when the server stops acknowledging them
///
/// One monitor per connection. Clones share state: the connection read
/// loop calls [`HeartbeatMonitor::record_ack`] while [`HeartbeatMonitor::run`]
/// ticks on its own task.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    missed_threshold: u32,
    telemetry_timeout: Duration,
    state: Arc<Mutex<HeartbeatState>>,
}

impl HeartbeatMonitor {
    /// Create a monitor from configuration
    pub fn new(config: &HeartbeatConfig) -> Self {
        Self {
            interval: config.interval().max(MIN_INTERVAL),
            missed_threshold: config.missed_threshold.max(1),
            telemetry_timeout: config.telemetry_timeout(),
            state: Arc::new(Mutex::new(HeartbeatState::default())),
        }
    }

    /// Record a liveness acknowledgment from the server
    pub fn record_ack(&self) {
        let mut state = lock(&self.state);
        state.last_ack_at = Some(Instant::now());
        state.missed_count = 0;
    }

    /// Current state snapshot
    pub fn state(&self) -> HeartbeatState {
        *lock(&self.state)
    }

    /// Tick until the connection goes stale
    ///
    /// Only returns with [`AgentError::HeartbeatTimeout`]; the caller aborts
    /// the task when the connection ends for another reason.
    pub async fn run(self, reporter: ResultReporter, telemetry: TelemetryCollector) -> AgentError {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if let Some(missed) = self.check_stale() {
                warn!("No heartbeat acknowledgment for {} intervals", missed);
                return AgentError::HeartbeatTimeout { missed };
            }

            let metrics = telemetry.collect(self.telemetry_timeout).await;
            lock(&self.state).last_sent_at = Some(Instant::now());
            if reporter.heartbeat(Some(metrics)) {
                debug!("Heartbeat sent");
            }
        }
    }

    /// Count the previous heartbeat as missed if it was never acknowledged
    fn check_stale(&self) -> Option<u32> {
        let mut state = lock(&self.state);
        let Some(sent) = state.last_sent_at else {
            return None;
        };

        let acked = state.last_ack_at.is_some_and(|ack| ack >= sent);
        if acked {
            state.missed_count = 0;
            return None;
        }

        state.missed_count += 1;
        (state.missed_count >= self.missed_threshold).then_some(state.missed_count)
    }
}

fn lock(state: &Mutex<HeartbeatState>) -> std::sync::MutexGuard<'_, HeartbeatState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
