use super::*;
use crate::transport::memory::{self, MemoryConnector, ServerEnd};
use std::sync::Arc;

fn config() -> AgentConfig {
    let mut config = AgentConfig::new("ws://control.test/agent", "T");
    config.agent.device_name = Some("test-box".to_string());
    config.server.backoff_base_ms = 100;
    config.server.backoff_max_ms = 1_000;
    config.server.max_reconnect_attempts = 3;
    config.server.auth_timeout_secs = 5;
    config.heartbeat.telemetry_timeout_ms = 0;
    config
}

async fn scripted(channels: usize) -> (Arc<MemoryConnector>, Vec<ServerEnd>) {
    let connector = Arc::new(MemoryConnector::new());
    let mut servers = Vec::new();
    for _ in 0..channels {
        let (channel, server) = memory::channel();
        connector.push_channel(channel).await;
        servers.push(server);
    }
    (connector, servers)
}

async fn expect_register(server: &mut ServerEnd) -> Outbound {
    let message = server
        .recv_timeout(Duration::from_secs(10))
        .await
        .expect("agent sent nothing");
    assert!(matches!(message, Outbound::Register { .. }), "got {:?}", message);
    message
}

#[tokio::test]
async fn test_handshake_reaches_connected_and_shuts_down() {
    let (connector, mut servers) = scripted(1).await;
    let mut manager = ConnectionManager::new(config(), Arc::clone(&connector));
    let mut state = manager.state();
    let shutdown = manager.shutdown_token();
    let run = tokio::spawn(async move {
        let result = manager.run().await;
        (manager, result)
    });

    let server = &mut servers[0];
    match expect_register(server).await {
        Outbound::Register {
            token,
            device_name,
            protocol_version,
            capabilities,
            ..
        } => {
            assert_eq!(token.expose(), "T");
            assert_eq!(device_name, "test-box");
            assert_eq!(protocol_version, PROTOCOL_VERSION);
            assert_eq!(capabilities, vec!["get_metrics", "screenshot", "shell"]);
        }
        _ => unreachable!(),
    }

    server
        .send(&Inbound::AuthSuccess {
            agent_id: AgentId::from("A1"),
            device_name: Some("test-box".to_string()),
        })
        .unwrap();
    state
        .wait_for(|s| *s == ConnectionState::Connected)
        .await
        .unwrap();

    match server.recv_timeout(Duration::from_secs(5)).await {
        Some(Outbound::Log { level, metadata, .. }) => {
            assert_eq!(level, LogLevel::Info);
            assert_eq!(metadata["version"], env!("CARGO_PKG_VERSION"));
        }
        other => panic!("expected connected log, got {:?}", other),
    }

    shutdown.cancel();
    let (manager, result) = run.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(*state.borrow(), ConnectionState::Closing);
    assert_eq!(manager.agent_id(), Some(&AgentId::from("A1")));
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test]
async fn test_auth_error_is_fatal_and_not_retried() {
    let (connector, mut servers) = scripted(2).await;
    let mut manager = ConnectionManager::new(config(), Arc::clone(&connector));
    let state = manager.state();
    let run = tokio::spawn(async move { manager.run().await });

    expect_register(&mut servers[0]).await;
    servers[0]
        .send(&Inbound::AuthError {
            message: "revoked".to_string(),
        })
        .unwrap();

    let result = run.await.unwrap();
    match result {
        Err(AgentError::Authentication(message)) => assert_eq!(message, "revoked"),
        other => panic!("expected authentication error, got {:?}", other),
    }
    assert_eq!(connector.attempts(), 1);
    assert_eq!(*state.borrow(), ConnectionState::Closing);
}

#[tokio::test]
async fn test_error_message_before_auth_is_rejection() {
    let (connector, mut servers) = scripted(1).await;
    let mut manager = ConnectionManager::new(config(), Arc::clone(&connector));
    let run = tokio::spawn(async move { manager.run().await });

    expect_register(&mut servers[0]).await;
    servers[0]
        .send_json(json!({"type": "welcome", "message": "hi"}))
        .unwrap();
    servers[0]
        .send_json(json!({"type": "error", "error": "invalid token"}))
        .unwrap();

    let result = run.await.unwrap();
    assert!(matches!(result, Err(AgentError::Authentication(ref m)) if m == "invalid token"));
}

#[tokio::test(start_paused = true)]
async fn test_auth_timeout_reconnects_until_exhausted() {
    let (connector, mut servers) = scripted(1).await;
    let mut config = config();
    config.server.max_reconnect_attempts = 2;
    let mut manager = ConnectionManager::new(config, Arc::clone(&connector));
    let run = tokio::spawn(async move { manager.run().await });

    // Server accepts the channel but never answers the auth message.
    expect_register(&mut servers[0]).await;

    let result = run.await.unwrap();
    assert!(matches!(result, Err(AgentError::ReconnectExhausted { attempts: 2 })));
    assert_eq!(connector.attempts(), 3);
}

#[tokio::test]
async fn test_shutdown_interrupts_backoff_sleep() {
    let connector = Arc::new(MemoryConnector::new());
    let mut config = config();
    config.server.backoff_base_ms = 60_000;
    config.server.backoff_max_ms = 60_000;
    let mut manager = ConnectionManager::new(config, Arc::clone(&connector));
    let mut state = manager.state();
    let shutdown = manager.shutdown_token();
    let run = tokio::spawn(async move { manager.run().await });

    state
        .wait_for(|s| *s == ConnectionState::Disconnected)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("shutdown waited for the backoff")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test]
async fn test_ping_is_answered_and_garbage_ignored() {
    let (connector, mut servers) = scripted(1).await;
    let mut manager = ConnectionManager::new(config(), Arc::clone(&connector));
    let shutdown = manager.shutdown_token();
    let run = tokio::spawn(async move { manager.run().await });

    let server = &mut servers[0];
    expect_register(server).await;
    server.send_json(json!({"type": "auth_success", "agentId": 9})).unwrap();

    server.send_raw("this is not json").unwrap();
    server.send_json(json!({"type": "install_plugin", "code": "..."})).unwrap();
    server.send(&Inbound::Ping).unwrap();

    let mut saw_pong = false;
    while let Some(message) = server.recv_skipping_heartbeats(Duration::from_secs(5)).await {
        if message == Outbound::Pong {
            saw_pong = true;
            break;
        }
    }
    assert!(saw_pong);

    shutdown.cancel();
    assert!(run.await.unwrap().is_ok());
}

#[test]
fn test_state_display() {
    assert_eq!(ConnectionState::Authenticating.to_string(), "authenticating");
    assert_eq!(ConnectionState::Closing.to_string(), "closing");
}
