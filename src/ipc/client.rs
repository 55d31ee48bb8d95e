//! Broker-side IPC client: a reconnecting Unix-domain-socket connection to
//! the Privileged Agent, speaking the length-prefixed JSON envelope in
//! [`crate::ipc::codec`].

use crate::error::TypedError;
use crate::ipc::codec::{read_frame, write_frame};
use chrono::Utc;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Backoff schedule for `ensure_connected`'s reconnect attempts: doubles each
/// try, capped at 30s, matching the source client's retry behavior.
const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

struct Inner {
    stream: Option<UnixStream>,
    state: ConnectionState,
}

/// One client owns one logical connection; callers share it behind an `Arc`.
/// `call` is safe to invoke concurrently — the internal mutex serializes
/// frames onto the single stream, since the wire protocol carries no
/// interleaving/multiplexing of its own.
pub struct IpcClient {
    socket_path: PathBuf,
    default_timeout: Duration,
    inner: Mutex<Inner>,
}

impl IpcClient {
    pub fn new(socket_path: impl Into<PathBuf>, default_timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            default_timeout,
            inner: Mutex::new(Inner {
                stream: None,
                state: ConnectionState::Disconnected,
            }),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Connects if not already connected. Does not retry; callers that need
    /// resilience go through `ensure_connected`.
    async fn connect_once(&self, guard: &mut Inner) -> Result<(), TypedError> {
        guard.state = ConnectionState::Connecting;
        match UnixStream::connect(&self.socket_path).await {
            Ok(stream) => {
                guard.stream = Some(stream);
                guard.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                guard.stream = None;
                guard.state = ConnectionState::Failed;
                Err(TypedError::unavailable(format!(
                    "failed to connect to agent socket {}: {e}",
                    self.socket_path.display()
                )))
            }
        }
    }

    /// Connects with exponential backoff, up to `MAX_RECONNECT_ATTEMPTS`.
    async fn ensure_connected(&self, guard: &mut Inner) -> Result<(), TypedError> {
        if guard.stream.is_some() && guard.state == ConnectionState::Connected {
            return Ok(());
        }
        guard.state = ConnectionState::Reconnecting;
        let mut backoff = INITIAL_BACKOFF;
        let mut last_err = None;
        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            match self.connect_once(guard).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, error = %e, "agent connection attempt failed");
                    last_err = Some(e);
                    if attempt < MAX_RECONNECT_ATTEMPTS {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        }
        guard.state = ConnectionState::Failed;
        Err(last_err.unwrap_or_else(|| TypedError::unavailable("agent unreachable")))
    }

    pub async fn disconnect(&self) {
        let mut guard = self.inner.lock().await;
        guard.stream = None;
        guard.state = ConnectionState::Disconnected;
    }

    /// Sends `{id, operation, params}`, awaits the matching `{id, result}` or
    /// `{id, error}` envelope, and resolves to the handler's result or a
    /// `TypedError` built from the wire error.
    ///
    /// On a mid-call I/O error the call is retried exactly once, with a
    /// freshly generated request id — never recursively, so a second
    /// failure surfaces directly to the caller.
    pub async fn call(&self, operation: &str, params: Value) -> Result<Value, TypedError> {
        self.call_with_timeout(operation, params, self.default_timeout).await
    }

    pub async fn call_with_timeout(
        &self,
        operation: &str,
        params: Value,
        call_timeout: Duration,
    ) -> Result<Value, TypedError> {
        match self.call_once(operation, &params, call_timeout).await {
            Ok(value) => Ok(value),
            Err(e) if e.kind == crate::error::ErrorKind::Unavailable => {
                warn!(operation, error = %e, "retrying agent call once with a fresh request id");
                self.call_once(operation, &params, call_timeout).await
            }
            Err(e) => Err(e),
        }
    }

    async fn call_once(
        &self,
        operation: &str,
        params: &Value,
        call_timeout: Duration,
    ) -> Result<Value, TypedError> {
        let mut guard = self.inner.lock().await;
        self.ensure_connected(&mut guard).await?;

        let request_id = Uuid::new_v4().to_string();
        let envelope = json!({
            "id": request_id,
            "operation": operation,
            "timestamp": Utc::now().to_rfc3339(),
            "params": params,
        });

        let stream = guard.stream.as_mut().expect("connected above");
        let (mut read_half, mut write_half) = stream.split();

        let io_result: Result<Option<Value>, TypedError> = match timeout(call_timeout, async {
            write_frame(&mut write_half, &envelope).await?;
            read_frame(&mut read_half).await
        })
        .await
        {
            Ok(result) => result,
            Err(_) => {
                // A half-read frame is irrecoverable; the connection is dead
                // for ordering purposes even though the socket object is
                // still technically open.
                guard.stream = None;
                guard.state = ConnectionState::Disconnected;
                return Err(TypedError::timeout(format!("agent call '{operation}' timed out")));
            }
        };

        match io_result {
            Ok(Some(response)) => {
                if response.get("id").and_then(Value::as_str) != Some(request_id.as_str()) {
                    guard.stream = None;
                    guard.state = ConnectionState::Disconnected;
                    return Err(TypedError::protocol_error(
                        "agent response id did not match request id",
                    ));
                }
                match response.get("status").and_then(Value::as_str) {
                    Some("ok") => Ok(response.get("data").cloned().unwrap_or(Value::Null)),
                    Some("error") => {
                        let error = response.get("error").cloned().unwrap_or(Value::Null);
                        Err(typed_error_from_wire(&error))
                    }
                    _ => {
                        guard.stream = None;
                        guard.state = ConnectionState::Disconnected;
                        Err(TypedError::protocol_error("agent response missing status"))
                    }
                }
            }
            Ok(None) => {
                guard.stream = None;
                guard.state = ConnectionState::Disconnected;
                Err(TypedError::unavailable("agent closed the connection"))
            }
            Err(e) => {
                guard.stream = None;
                guard.state = ConnectionState::Disconnected;
                Err(TypedError::unavailable(format!("agent call '{operation}' failed: {e}")))
            }
        }
    }

    /// Lightweight liveness probe used by the update state machine's health
    /// checks and by the Broker's own `system.get_info`.
    pub async fn health_check(&self) -> bool {
        match self.call_with_timeout("ping", Value::Null, Duration::from_secs(2)).await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "agent health check failed");
                false
            }
        }
    }
}

/// Builds a [`TypedError`] from an Agent-side `{code, message, details}`
/// error object. `code` is always preserved verbatim in `details.code`; when
/// it also names one of our own error kinds the resulting `TypedError` adopts
/// that kind, otherwise it is wrapped as `internal` (e.g. the Agent's
/// dispatcher-level `unknown_operation`).
fn typed_error_from_wire(error: &Value) -> TypedError {
    let code = error.get("code").and_then(Value::as_str).unwrap_or("internal");
    let kind = match code {
        "invalid_argument" => crate::error::ErrorKind::InvalidArgument,
        "permission_denied" => crate::error::ErrorKind::PermissionDenied,
        "unavailable" => crate::error::ErrorKind::Unavailable,
        "failed_precondition" => crate::error::ErrorKind::FailedPrecondition,
        "not_found" => crate::error::ErrorKind::NotFound,
        "unauthenticated" => crate::error::ErrorKind::Unauthenticated,
        "timeout" => crate::error::ErrorKind::Timeout,
        "protocol_error" => crate::error::ErrorKind::ProtocolError,
        _ => crate::error::ErrorKind::Internal,
    };
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("agent returned an error")
        .to_string();
    let mut details = std::collections::HashMap::new();
    if let Some(Value::Object(map)) = error.get("details") {
        for (k, v) in map {
            details.insert(k.clone(), v.clone());
        }
    }
    details.insert("code".to_string(), json!(code));
    TypedError::new(kind, message).with_details(details)
}
