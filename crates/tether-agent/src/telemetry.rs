//! Lightweight host telemetry

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;
use tether_proto::Telemetry;
use tracing::debug;

/// Process counters plus on-demand CPU and memory sampling
///
/// Clones share the same counters.
#[derive(Debug, Clone)]
pub struct TelemetryCollector {
    started_at: Instant,
    commands: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryCollector {
    /// Start counting from now
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            commands: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Count one terminal result
    pub fn record_result(&self, success: bool) {
        self.commands.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Counters and uptime only, no host sampling
    pub fn counters(&self) -> Telemetry {
        Telemetry {
            uptime_seconds: self.started_at.elapsed().as_secs(),
            command_count: self.commands.load(Ordering::Relaxed),
            error_count: self.errors.load(Ordering::Relaxed),
            cpu_usage: None,
            memory_usage: None,
        }
    }

    /// Full snapshot, falling back to [`TelemetryCollector::counters`] if
    /// sampling does not finish within `timeout`
    pub async fn collect(&self, timeout: Duration) -> Telemetry {
        let mut snapshot = self.counters();

        let sample = tokio::task::spawn_blocking(sample_host);
        match tokio::time::timeout(timeout, sample).await {
            Ok(Ok((cpu, memory))) => {
                snapshot.cpu_usage = Some(cpu);
                snapshot.memory_usage = memory;
            }
            Ok(Err(e)) => debug!("Telemetry sampling task failed: {}", e),
            Err(_) => debug!("Telemetry sampling exceeded {:?}, sending counters only", timeout),
        }

        snapshot
    }
}

/// Blocking: CPU usage needs two refreshes separated by the minimum interval
fn sample_host() -> (f32, Option<f32>) {
    let mut system = System::new();

    system.refresh_memory();
    let total = system.total_memory();
    let memory = (total > 0).then(|| system.used_memory() as f32 / total as f32 * 100.0);

    system.refresh_cpu_usage();
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    system.refresh_cpu_usage();

    (system.global_cpu_usage(), memory)
}
