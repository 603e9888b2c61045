use crate::error::CommandError;
use crate::executor::{ExecutionContext, Executor};
use crate::process;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::debug;

/// Runs a command line through the host shell
///
/// A non-zero exit code is a `completed` result; only spawn failures,
/// invalid parameters and cancellation fail the command.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    max_output_bytes: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShellParams {
    command: String,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ShellOutput {
    stdout: String,
    stderr: String,
    /// `None` when the process was terminated by a signal
    exit_code: Option<i32>,
    truncated: bool,
}

struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

impl ShellExecutor {
    /// Cap each output stream at `max_output_bytes`
    pub fn new(max_output_bytes: usize) -> Self {
        Self { max_output_bytes }
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn execute(&self, params: Value, ctx: ExecutionContext) -> Result<Value, CommandError> {
        let params: ShellParams = serde_json::from_value(params)?;
        if params.command.trim().is_empty() {
            return Err(CommandError::InvalidParams("command must not be empty".to_string()));
        }

        let mut command = shell_command(&params.command);
        if let Some(cwd) = &params.cwd {
            command.current_dir(cwd);
        }
        command
            .envs(&params.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        process::isolate(&mut command);

        let mut child = command
            .spawn()
            .map_err(|e| CommandError::Execution(format!("Failed to spawn shell: {}", e)))?;
        let pid = child.id();
        debug!("Spawned shell for command {}: pid={:?}", ctx.command_id, pid);

        let outcome = tokio::select! {
            outcome = wait_with_output(&mut child, self.max_output_bytes) => Some(outcome),
            _ = ctx.cancel.cancelled() => None,
        };

        let Some(outcome) = outcome else {
            debug!("Cancelling command {}, killing process tree", ctx.command_id);
            process::kill_tree(&mut child, pid).await;
            return Err(CommandError::Cancelled);
        };

        let (status, stdout, stderr) =
            outcome.map_err(|e| CommandError::Execution(format!("Failed to collect output: {}", e)))?;
        let output = ShellOutput {
            stdout: String::from_utf8_lossy(&stdout.bytes).into_owned(),
            stderr: String::from_utf8_lossy(&stderr.bytes).into_owned(),
            exit_code: status.code(),
            truncated: stdout.truncated || stderr.truncated,
        };
        Ok(serde_json::to_value(output)?)
    }
}

#[cfg(windows)]
fn shell_command(line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(line);
    command
}

#[cfg(not(windows))]
fn shell_command(line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(line);
    command
}

async fn wait_with_output(
    child: &mut Child,
    limit: usize,
) -> std::io::Result<(std::process::ExitStatus, Captured, Captured)> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (stdout, stderr, status) =
        tokio::join!(read_capped(stdout, limit), read_capped(stderr, limit), child.wait());
    Ok((status?, stdout?, stderr?))
}

/// Read to EOF, keeping at most `limit` bytes; the rest is drained so the
/// child never blocks on a full pipe
async fn read_capped<R>(reader: Option<R>, limit: usize) -> std::io::Result<Captured>
where
    R: AsyncRead + Unpin,
{
    let mut captured = Captured {
        bytes: Vec::new(),
        truncated: false,
    };
    let Some(mut reader) = reader else {
        return Ok(captured);
    };

    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(captured.bytes.len());
        if n > room {
            captured.truncated = true;
        }
        captured.bytes.extend_from_slice(&chunk[..n.min(room)]);
    }
    Ok(captured)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tether_proto::CommandId;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            command_id: CommandId::from("t"),
            timeout: Duration::from_secs(10),
            cancel: CancellationToken::new(),
        }
    }

    async fn run(params: Value) -> Result<Value, CommandError> {
        ShellExecutor::new(1024 * 1024).execute(params, ctx()).await
    }

    #[tokio::test]
    async fn test_echo_hello() {
        let result = run(json!({"command": "echo hello"})).await.unwrap();
        assert_eq!(result["exitCode"], 0);
        assert!(result["stdout"].as_str().unwrap().contains("hello"));
        assert_eq!(result["stderr"], "");
        assert_eq!(result["truncated"], false);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_a_result() {
        let result = run(json!({"command": "echo oops >&2; exit 3"})).await.unwrap();
        assert_eq!(result["exitCode"], 3);
        assert_eq!(result["stderr"], "oops\n");
    }

    #[tokio::test]
    async fn test_cwd_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let result = run(json!({
            "command": "pwd; echo $TETHER_TEST_VALUE",
            "cwd": dir.path(),
            "env": {"TETHER_TEST_VALUE": "from-env"}
        }))
        .await
        .unwrap();

        let stdout = result["stdout"].as_str().unwrap();
        let expected = dir.path().canonicalize().unwrap();
        assert!(stdout.contains(expected.to_str().unwrap()) || stdout.contains(dir.path().to_str().unwrap()));
        assert!(stdout.contains("from-env"));
    }

    #[tokio::test]
    async fn test_output_is_truncated() {
        let result = ShellExecutor::new(10)
            .execute(json!({"command": "printf '0123456789abcdef'"}), ctx())
            .await
            .unwrap();
        assert_eq!(result["stdout"], "0123456789");
        assert_eq!(result["truncated"], true);
    }

    #[tokio::test]
    async fn test_invalid_params() {
        assert!(matches!(
            run(json!({"command": "   "})).await,
            Err(CommandError::InvalidParams(_))
        ));
        assert!(matches!(
            run(json!({"cwd": "/tmp"})).await,
            Err(CommandError::InvalidParams(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_cwd_is_spawn_failure() {
        let result = run(json!({"command": "true", "cwd": "/nonexistent/tether/dir"})).await;
        assert!(matches!(result, Err(CommandError::Execution(_))));
    }

    #[tokio::test]
    async fn test_cancel_returns_promptly() {
        let token = CancellationToken::new();
        let mut ctx = ctx();
        ctx.cancel = token.clone();

        let task = tokio::spawn(async move {
            ShellExecutor::new(1024)
                .execute(json!({"command": "sleep 30"}), ctx)
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(CommandError::Cancelled)));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancel_kills_background_child_after_shell_exits() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("bg.pid");
        let token = CancellationToken::new();
        let mut ctx = ctx();
        ctx.cancel = token.clone();

        // The shell exits at once; the background sleep keeps stdout open.
        let command = format!("sleep 30 & echo $! > {}", pid_file.display());
        let task = tokio::spawn(async move {
            ShellExecutor::new(1024)
                .execute(json!({ "command": command }), ctx)
                .await
        });
        tokio::time::sleep(Duration::from_millis(500)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(CommandError::Cancelled)));

        let bg: u32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        let mut alive = process_alive(bg);
        for _ in 0..20 {
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            alive = process_alive(bg);
        }
        assert!(!alive, "background child {} survived cancellation", bg);
    }

    #[cfg(target_os = "linux")]
    fn process_alive(pid: u32) -> bool {
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
            return false;
        };
        let state = stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next());
        !matches!(state, Some('Z') | Some('X') | None)
    }
}
