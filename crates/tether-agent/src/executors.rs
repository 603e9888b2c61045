//! Built-in executors

/// `get_metrics`
pub mod metrics;

/// `screenshot`
pub mod screenshot;

/// `shell`
pub mod shell;

pub use metrics::MetricsExecutor;
pub use screenshot::{CapturedImage, CommandCapture, ScreenCapture, ScreenshotExecutor};
pub use shell::ShellExecutor;
