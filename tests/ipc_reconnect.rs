//! End-to-end IPC scenarios spanning the Agent's accept loop and the
//! Broker's reconnecting client over a real Unix domain socket.

use ops_agent::dispatcher::registry::ToolRegistry;
use ops_agent::ipc::{client::ConnectionState, server, IpcClient};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

fn registry_with_reserved() -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    server::register_reserved_operations(&mut registry);
    Arc::new(registry)
}

async fn spawn_agent(path: std::path::PathBuf) -> (tokio::task::JoinHandle<()>, tokio::sync::oneshot::Sender<()>) {
    let config = server::AgentSocketConfig::new(path);
    let registry = registry_with_reserved();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = rx.await;
        };
        server::run(config, registry, shutdown).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    (handle, tx)
}

#[tokio::test]
async fn ping_survives_an_explicit_disconnect_and_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.sock");
    let (agent, shutdown) = spawn_agent(path.clone()).await;

    let client = IpcClient::new(path, Duration::from_secs(2));
    let result = client.call("ping", Value::Null).await.unwrap();
    assert_eq!(result["pong"], true);

    client.disconnect().await;
    assert_eq!(client.state().await, ConnectionState::Disconnected);

    let result = client.call("ping", Value::Null).await.unwrap();
    assert_eq!(result["pong"], true);
    assert_eq!(client.state().await, ConnectionState::Connected);

    let _ = shutdown.send(());
    let _ = agent.await;
}

#[tokio::test]
async fn reconnects_once_the_agent_comes_back_on_the_same_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.sock");
    let (agent, shutdown) = spawn_agent(path.clone()).await;

    let client = IpcClient::new(path.clone(), Duration::from_secs(2));
    assert_eq!(client.call("ping", Value::Null).await.unwrap()["pong"], true);

    // Simulate the Agent going away: stop the server and remove the socket
    // file, then let the in-flight client observe the drop.
    let _ = shutdown.send(());
    let _ = agent.await;
    let _ = std::fs::remove_file(&path);

    assert!(client.call("ping", Value::Null).await.is_err());

    // Bring the Agent back on the same path; the client's own backoff
    // loop on the next call should re-establish the connection.
    let (agent, shutdown) = spawn_agent(path.clone()).await;
    let result = client.call("ping", Value::Null).await.unwrap();
    assert_eq!(result["pong"], true);

    let _ = shutdown.send(());
    let _ = agent.await;
}

#[tokio::test]
async fn health_check_reports_true_while_the_agent_is_reachable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.sock");
    let (agent, shutdown) = spawn_agent(path.clone()).await;

    let client = IpcClient::new(path, Duration::from_secs(2));
    assert!(client.health_check().await);

    let _ = shutdown.send(());
    let _ = agent.await;
}
