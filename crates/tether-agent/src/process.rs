//! Subprocess helpers shared by executors

use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Put the child in its own process group so the whole tree can be killed
pub fn isolate(command: &mut Command) {
    command.kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);
}

/// Kill the child and everything it spawned, then reap it
///
/// `pid` must be captured right after spawn: once the shell has been
/// reaped `child.id()` is `None`, but its group may still have members.
pub async fn kill_tree(child: &mut Child, pid: Option<u32>) {
    if let Some(pid) = pid.or_else(|| child.id()) {
        kill_group(pid).await;
    }
    if let Err(e) = child.kill().await {
        debug!("Child already gone: {}", e);
    }
}

#[cfg(unix)]
async fn kill_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => debug!("Killed process group {}", pid),
        Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!("Failed to kill process group {}: {}", pid, e),
    }
}

#[cfg(windows)]
async fn kill_group(pid: u32) {
    let status = Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await;
    match status {
        Ok(status) if status.success() => debug!("Killed process tree {}", pid),
        Ok(status) => warn!("taskkill for {} exited with {}", pid, status),
        Err(e) => warn!("Failed to run taskkill for {}: {}", pid, e),
    }
}

#[cfg(not(any(unix, windows)))]
async fn kill_group(_pid: u32) {}
