//! Privileged Agent: the server side of the IPC transport. Binds a Unix
//! domain socket, accepts connections, and dispatches frames to a
//! [`ToolRegistry`] keyed by `operation`.

use crate::dispatcher::context::{Caller, RequestContext, Role};
use crate::dispatcher::registry::ToolRegistry;
use crate::error::{ErrorKind, TypedError};
use crate::ipc::codec::{read_frame, write_frame};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct AgentSocketConfig {
    pub path: PathBuf,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub mode: u32,
}

impl AgentSocketConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            owner: None,
            group: None,
            mode: 0o660,
        }
    }
}

/// Identity assumed for every call arriving over the Agent socket: the
/// Broker has already authenticated and authorized the caller before
/// forwarding, so the Agent executes with its own full privilege rather than
/// re-deriving a role from the (already-trusted) connection.
fn agent_caller() -> Caller {
    Caller {
        user_id: Some("broker".to_string()),
        role: Role::Admin,
        source_address: None,
        groups: HashSet::new(),
    }
}

/// Runs the Agent's accept loop until `shutdown` resolves. Binds fresh (any
/// stale socket file at the configured path is removed first), applies
/// owner/group/mode, then spawns one task per accepted connection so a slow
/// or wedged peer never blocks other callers.
pub async fn run(
    config: AgentSocketConfig,
    registry: Arc<ToolRegistry>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), TypedError> {
    if config.path.exists() {
        std::fs::remove_file(&config.path)
            .map_err(|e| TypedError::unavailable(format!("failed to remove stale socket: {e}")))?;
    }
    if let Some(parent) = config.path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| TypedError::unavailable(format!("failed to create socket directory: {e}")))?;
    }
    let listener = UnixListener::bind(&config.path)
        .map_err(|e| TypedError::unavailable(format!("failed to bind agent socket: {e}")))?;

    apply_permissions(&config);

    info!(path = %config.path.display(), "agent listening");

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let registry = Arc::clone(&registry);
                        tokio::spawn(async move {
                            handle_connection(stream, registry).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "agent accept failed");
                    }
                }
            }
            _ = &mut shutdown => {
                info!("agent shutting down");
                break;
            }
        }
    }

    let _ = std::fs::remove_file(&config.path);
    Ok(())
}

#[cfg(unix)]
fn apply_permissions(config: &AgentSocketConfig) {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let path_c = match CString::new(config.path.as_os_str().as_bytes()) {
        Ok(p) => p,
        Err(_) => return,
    };

    let uid = config.owner.as_deref().and_then(resolve_uid).unwrap_or(u32::MAX);
    let gid = config.group.as_deref().and_then(resolve_gid).unwrap_or(u32::MAX);
    if config.owner.is_some() || config.group.is_some() {
        let rc = unsafe { libc::chown(path_c.as_ptr(), uid, gid) };
        if rc != 0 {
            warn!(
                path = %config.path.display(),
                "failed to chown agent socket (expected for a non-root dev run)"
            );
        }
    }

    let rc = unsafe { libc::chmod(path_c.as_ptr(), config.mode as libc::mode_t) };
    if rc != 0 {
        warn!(path = %config.path.display(), mode = format!("{:o}", config.mode), "failed to chmod agent socket");
    }
}

#[cfg(not(unix))]
fn apply_permissions(_config: &AgentSocketConfig) {}

#[cfg(unix)]
fn resolve_uid(name: &str) -> Option<u32> {
    if let Ok(uid) = name.parse::<u32>() {
        return Some(uid);
    }
    let c_name = std::ffi::CString::new(name).ok()?;
    let passwd = unsafe { libc::getpwnam(c_name.as_ptr()) };
    if passwd.is_null() {
        None
    } else {
        Some(unsafe { (*passwd).pw_uid })
    }
}

#[cfg(unix)]
fn resolve_gid(name: &str) -> Option<u32> {
    if let Ok(gid) = name.parse::<u32>() {
        return Some(gid);
    }
    let c_name = std::ffi::CString::new(name).ok()?;
    let group = unsafe { libc::getgrnam(c_name.as_ptr()) };
    if group.is_null() {
        None
    } else {
        Some(unsafe { (*group).gr_gid })
    }
}

async fn handle_connection(mut stream: UnixStream, registry: Arc<ToolRegistry>) {
    let (mut read_half, mut write_half) = stream.split();
    loop {
        let request = match read_frame(&mut read_half).await {
            Ok(Some(value)) => value,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "agent connection closed on framing error");
                break;
            }
        };

        let response = dispatch_one(&registry, &request).await;
        if let Err(e) = write_frame(&mut write_half, &response).await {
            warn!(error = %e, "agent failed to write response, closing connection");
            break;
        }
    }
}

async fn dispatch_one(registry: &ToolRegistry, request: &Value) -> Value {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let operation = match request.get("operation").and_then(Value::as_str) {
        Some(op) => op.to_string(),
        None => {
            return error_response(
                id,
                "protocol_error",
                "request missing 'operation'",
                json!({}),
            );
        }
    };
    let params = request.get("params").cloned().unwrap_or(Value::Null);

    if !registry.has_tool(&operation) {
        return error_response(
            id,
            "unknown_operation",
            format!("no such operation: {operation}"),
            json!({ "operation": operation }),
        );
    }

    let ctx = RequestContext::new(operation.clone(), agent_caller(), None);
    match registry.invoke(&operation, &ctx, params).await {
        Ok(data) => json!({ "id": id, "status": "ok", "data": data }),
        Err(typed) => {
            if typed.kind == ErrorKind::Internal {
                error!(operation, message = %typed.message, "agent handler raised an internal error");
            }
            error_response(id, typed.kind.as_str(), typed.message, json!(typed.details))
        }
    }
}

fn error_response(id: Value, code: &str, message: impl Into<String>, details: Value) -> Value {
    json!({
        "id": id,
        "status": "error",
        "error": {
            "code": code,
            "message": message.into(),
            "details": details,
        }
    })
}

/// Registers the three IPC-level reserved operations every Agent must expose,
/// independent of whatever hardware/system tools are registered alongside
/// them.
pub fn register_reserved_operations(registry: &mut ToolRegistry) {
    registry
        .register(
            "ping",
            Arc::new(|_ctx: &RequestContext, _params: Value| async move { Ok(json!({ "pong": true })) }),
        )
        .expect("ping registered exactly once at startup");

    registry
        .register(
            "echo",
            Arc::new(|_ctx: &RequestContext, params: Value| async move {
                Ok(json!({ "echo": params.get("message").cloned().unwrap_or(Value::Null) }))
            }),
        )
        .expect("echo registered exactly once at startup");

    registry
        .register(
            "get_info",
            Arc::new(|_ctx: &RequestContext, _params: Value| async move {
                Ok(json!({
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                    "status": "running",
                }))
            }),
        )
        .expect("get_info registered exactly once at startup");
}

/// Ensures the socket path's file exists before a liveness probe connects
/// (used by `health.rs`'s socket-exists check).
pub fn socket_exists(path: &Path) -> bool {
    path.exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::client::IpcClient;
    use std::time::Duration;

    fn registry_with_reserved() -> Arc<ToolRegistry> {
        let mut reg = ToolRegistry::new();
        register_reserved_operations(&mut reg);
        Arc::new(reg)
    }

    #[tokio::test]
    async fn ping_echo_get_info_round_trip_over_a_real_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let config = AgentSocketConfig::new(path.clone());
        let registry = registry_with_reserved();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let shutdown = async move {
                let _ = rx.await;
            };
            run(config, registry, shutdown).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = IpcClient::new(path, Duration::from_secs(2));
        let pong = client.call("ping", Value::Null).await.unwrap();
        assert_eq!(pong["pong"], true);

        let echoed = client.call("echo", json!({ "message": "hi" })).await.unwrap();
        assert_eq!(echoed["echo"], "hi");

        let info = client.call("get_info", Value::Null).await.unwrap();
        assert_eq!(info["status"], "running");

        let _ = tx.send(());
        let _ = server.await;
    }

    #[tokio::test]
    async fn unregistered_operation_is_unknown_operation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let config = AgentSocketConfig::new(path.clone());
        let registry = registry_with_reserved();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let shutdown = async move {
                let _ = rx.await;
            };
            run(config, registry, shutdown).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = IpcClient::new(path, Duration::from_secs(2));
        let err = client.call("gpio.read", Value::Null).await.unwrap_err();
        assert_eq!(err.details.get("code").unwrap(), "unknown_operation");

        let _ = tx.send(());
        let _ = server.await;
    }
}
