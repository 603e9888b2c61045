//! End-to-end test over a real WebSocket on localhost

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tether_agent::{AgentConfig, ConnectionManager, WsConnector};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

async fn next_json<S>(ws: &mut S) -> Result<Value>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(20), ws.next())
            .await
            .context("timed out waiting for agent")?
            .context("agent closed the socket")??;
        match frame {
            Message::Text(text) => return Ok(serde_json::from_str(text.as_str())?),
            Message::Close(_) => bail!("agent sent close"),
            _ => continue,
        }
    }
}

/// Accept one agent, authenticate it and run a single shell command
async fn serve_one(listener: TcpListener) -> Result<(Vec<Value>, Value)> {
    let (stream, _) = listener.accept().await?;
    let mut ws = tokio_tungstenite::accept_async(stream).await?;

    let auth = next_json(&mut ws).await?;
    assert_eq!(auth["type"], "auth");
    assert_eq!(auth["token"], "T");
    assert_eq!(auth["protocolVersion"], 1);
    assert!(auth["capabilities"]
        .as_array()
        .unwrap()
        .contains(&json!("shell")));

    ws.send(Message::Text(
        json!({"type": "auth_success", "agentId": "A1"}).to_string().into(),
    ))
    .await?;
    ws.send(Message::Text(
        json!({
            "type": "command",
            "commandId": "c1",
            "commandType": "shell",
            "commandData": {"command": "echo 1"}
        })
        .to_string()
        .into(),
    ))
    .await?;

    let mut seen = Vec::new();
    loop {
        let message = next_json(&mut ws).await?;
        if message["type"] == "command_result" {
            return Ok((seen, message));
        }
        seen.push(message);
    }
}

#[tokio::test]
async fn test_shell_command_over_websocket() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let server = tokio::spawn(serve_one(listener));

    let config = AgentConfig::new(format!("ws://{}/ws/agent", addr), "T");
    config.validate()?;
    let mut manager = ConnectionManager::new(config, WsConnector);
    let shutdown = manager.shutdown_token();
    let agent = tokio::spawn(async move { manager.run().await });

    let (seen, result) = server.await??;
    let status = seen
        .iter()
        .find(|m| m["type"] == "command_status")
        .context("no executing status")?;
    assert_eq!(status["commandId"], "c1");
    assert_eq!(status["status"], "executing");

    assert_eq!(result["commandId"], "c1");
    assert_eq!(result["status"], "completed");
    assert_eq!(result["result"]["stdout"], "1\n");
    assert_eq!(result["result"]["exitCode"], 0);

    shutdown.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(10), agent).await??;
    assert!(outcome.is_ok());
    Ok(())
}
