//! Verifies a Broker-side tool that forwards to the Agent over C1 actually
//! round-trips through the real dispatcher, auth, and IPC stack together —
//! the cross-component path unit tests within a single module can't cover.

use ops_agent::audit::AuditLogger;
use ops_agent::auth::rbac::PermissionTable;
use ops_agent::auth::{AuthHeaders, AuthMode, AuthPipeline, LocalAuthenticator};
use ops_agent::dispatcher::context::{RequestContext, Role};
use ops_agent::dispatcher::registry::ToolRegistry;
use ops_agent::dispatcher::{self, Dispatcher};
use ops_agent::ipc::{server, IpcClient};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn forwarded_tool_call_round_trips_through_a_live_agent() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("agent.sock");

    let mut agent_registry = ToolRegistry::new();
    server::register_reserved_operations(&mut agent_registry);
    let agent_registry = Arc::new(agent_registry);
    let agent_config = server::AgentSocketConfig::new(socket_path.clone());
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let agent_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        server::run(agent_config, agent_registry, shutdown).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let ipc_client = Arc::new(IpcClient::new(socket_path, Duration::from_secs(2)));

    let mut broker_registry = ToolRegistry::new();
    dispatcher::register_reserved_tools(&mut broker_registry);
    let forwarded_client = Arc::clone(&ipc_client);
    broker_registry
        .register(
            "agent.echo",
            Arc::new(move |_ctx: &RequestContext, params: Value| {
                let client = Arc::clone(&forwarded_client);
                async move { client.call("echo", params).await }
            }),
        )
        .unwrap();

    let auth = AuthPipeline::new(AuthMode::Local(LocalAuthenticator::new(None, true, Role::Admin, "test-operator")));
    let mut permissions = PermissionTable::new(Role::Admin);
    permissions.insert("agent.*", Role::Operator);
    permissions.insert("system.*", Role::Viewer);

    let dispatcher = Dispatcher::new(Arc::new(broker_registry), auth, Arc::new(permissions), AuditLogger::new(None));

    let response = dispatcher
        .dispatch_line(
            r#"{"jsonrpc":"2.0","id":1,"method":"agent.echo","params":{"message":"through the wire"}}"#,
            &AuthHeaders::new(),
        )
        .await
        .unwrap();

    assert_eq!(response["result"]["echo"], "through the wire");

    let _ = shutdown_tx.send(());
    let _ = agent_handle.await;
}

#[tokio::test]
async fn forwarded_tool_surfaces_unavailable_when_the_agent_is_unreachable() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("never-bound.sock");

    let ipc_client = Arc::new(IpcClient::new(socket_path, Duration::from_millis(500)));

    let mut broker_registry = ToolRegistry::new();
    dispatcher::register_reserved_tools(&mut broker_registry);
    let forwarded_client = Arc::clone(&ipc_client);
    broker_registry
        .register(
            "agent.ping",
            Arc::new(move |_ctx: &RequestContext, _params: Value| {
                let client = Arc::clone(&forwarded_client);
                async move { client.call("ping", Value::Null).await }
            }),
        )
        .unwrap();

    let auth = AuthPipeline::new(AuthMode::Local(LocalAuthenticator::new(None, true, Role::Admin, "test-operator")));
    let mut permissions = PermissionTable::new(Role::Admin);
    permissions.insert("agent.*", Role::Operator);

    let dispatcher = Dispatcher::new(Arc::new(broker_registry), auth, Arc::new(permissions), AuditLogger::new(None));

    let response = dispatcher
        .dispatch_line(json!({"jsonrpc": "2.0", "id": 2, "method": "agent.ping", "params": {}}).to_string().as_str(), &AuthHeaders::new())
        .await
        .unwrap();

    assert_eq!(response["error"]["code"], -32003);
}
