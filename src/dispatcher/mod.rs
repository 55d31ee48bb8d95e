//! Broker-side tool dispatch (C3): line-delimited JSON-RPC 2.0 parsing,
//! authentication, RBAC enforcement, tool invocation, and response framing.
//!
//! This module owns the seam between the wire (one JSON object per line)
//! and [`registry::ToolRegistry`]. Auth and RBAC always run before a handler
//! is invoked; nothing downstream of [`Dispatcher::dispatch_line`] ever sees
//! an unauthenticated or under-privileged caller.

pub mod context;
pub mod registry;

use crate::audit::AuditLogger;
use crate::auth::rbac::PermissionTable;
use crate::auth::{AuthHeaders, AuthPipeline};
use crate::dispatcher::context::{RequestContext, RequestId};
use crate::dispatcher::registry::ToolRegistry;
use crate::error::{ErrorKind, TypedError};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, warn};

pub const JSONRPC_VERSION: &str = "2.0";

/// A syntactically valid JSON-RPC 2.0 request, not yet authenticated.
struct ParsedRequest {
    id: Option<RequestId>,
    method: String,
    params: Value,
}

/// Checks the envelope (object, `jsonrpc: "2.0"`, string `method`) without
/// touching auth. Distinguishes a malformed JSON document (-32700, caught
/// one level up by the caller) from a well-formed-but-invalid request
/// (-32600, returned here as `Err`).
fn validate_envelope(raw: &Value) -> Result<ParsedRequest, String> {
    let obj = raw.as_object().ok_or_else(|| "request is not a JSON object".to_string())?;

    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err("missing or invalid 'jsonrpc' field".to_string());
    }

    let method = obj
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing or non-string 'method' field".to_string())?
        .to_string();

    let id = obj.get("id").and_then(RequestId::from_json);
    let params = obj.get("params").cloned().unwrap_or(Value::Null);

    Ok(ParsedRequest { id, method, params })
}

fn success_response(id: Value, result: &Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
}

fn typed_error_response(id: Value, error: &TypedError) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": error.kind.rpc_code(),
            "message": error.message,
            "data": error.to_rpc_data(),
        }
    })
}

/// A framing-level error (-32700/-32600) raised before a `TypedError` could
/// even be constructed, since there is no tool name or caller yet.
fn framing_error_response(id: Value, code: i32, message: &str) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": code,
            "message": message,
            "data": {},
        }
    })
}

/// Registers the always-available `system.*` tools, grounded in §6's
/// reserved IPC operations but under the Broker's own namespace so they
/// never collide with Agent-forwarded tool names. `system.get_basic_info`
/// exists specifically so the update state machine's health check (C5) has
/// a tool to call without special-casing.
pub fn register_reserved_tools(registry: &mut ToolRegistry) {
    registry
        .register(
            "system.ping",
            Arc::new(|_ctx: &RequestContext, _params: Value| async move { Ok(json!({ "pong": true })) }),
        )
        .expect("system.ping registered exactly once at startup");

    registry
        .register(
            "system.echo",
            Arc::new(|_ctx: &RequestContext, params: Value| async move {
                Ok(json!({ "echo": params.get("message").cloned().unwrap_or(Value::Null) }))
            }),
        )
        .expect("system.echo registered exactly once at startup");

    registry
        .register(
            "system.get_basic_info",
            Arc::new(|_ctx: &RequestContext, _params: Value| async move {
                Ok(json!({
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                    "status": "running",
                }))
            }),
        )
        .expect("system.get_basic_info registered exactly once at startup");
}

/// The Broker's top-level dispatch seam: one instance per process, shared
/// across every connection/line source.
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    auth: Arc<AuthPipeline>,
    permissions: Arc<PermissionTable>,
    audit: Arc<AuditLogger>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        auth: Arc<AuthPipeline>,
        permissions: Arc<PermissionTable>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            registry,
            auth,
            permissions,
            audit,
        }
    }

    /// Parses, authenticates, authorizes, and invokes one inbound line.
    /// Returns `None` for blank input, notifications, and any failure on a
    /// notification (per §4.3, a notification never produces output even
    /// when it errors — the failure is only logged).
    pub async fn dispatch_line(&self, line: &str, headers: &AuthHeaders) -> Option<Value> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        let raw: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to parse JSON-RPC request line");
                return Some(framing_error_response(Value::Null, -32700, "parse error"));
            }
        };

        let fallback_id = raw.get("id").cloned().unwrap_or(Value::Null);
        let request = match validate_envelope(&raw) {
            Ok(r) => r,
            Err(message) => {
                warn!(message, "invalid JSON-RPC request");
                return Some(framing_error_response(fallback_id, -32600, &message));
            }
        };
        let is_notification = request.id.is_none();

        let caller = match self.auth.authenticate(headers).await {
            Ok(c) => c,
            Err(typed) => {
                self.audit
                    .log_auth_event("tool_call", false, None, None, typed.details.get("reason").and_then(Value::as_str))
                    .await;
                return if is_notification {
                    None
                } else {
                    Some(typed_error_response(fallback_id, &typed))
                };
            }
        };

        let ctx = RequestContext::new(request.method.clone(), caller, request.id.clone());

        if let Err(typed) = self.permissions.enforce(&request.method, ctx.caller.role) {
            self.audit
                .log_security_event("rbac_denied", typed.kind, Some(&ctx), Some(&json!(typed.details)))
                .await;
            self.audit.log_tool_call(&ctx, Err(&typed), Some(&request.params)).await;
            return if is_notification {
                None
            } else {
                Some(typed_error_response(fallback_id, &typed))
            };
        }

        let result = self.registry.invoke(&request.method, &ctx, request.params.clone()).await;
        self.audit.log_tool_call(&ctx, result.as_ref(), Some(&request.params)).await;

        match result {
            Ok(value) => {
                if is_notification {
                    None
                } else {
                    Some(success_response(fallback_id, &value))
                }
            }
            Err(typed) => {
                if typed.kind == ErrorKind::Internal {
                    error!(method = %request.method, message = %typed.message, "internal error in tool handler");
                }
                if is_notification {
                    None
                } else {
                    Some(typed_error_response(fallback_id, &typed))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthMode, LocalAuthenticator};
    use crate::dispatcher::context::Role;

    fn dispatcher_admin() -> Dispatcher {
        let mut registry = ToolRegistry::new();
        register_reserved_tools(&mut registry);
        let auth = AuthPipeline::new(AuthMode::Local(LocalAuthenticator::new(None, true, Role::Admin, "test-admin")));
        let mut permissions = PermissionTable::new(Role::Admin);
        permissions.insert("system.*", Role::Viewer);
        Dispatcher::new(Arc::new(registry), auth, Arc::new(permissions), AuditLogger::new(None))
    }

    #[tokio::test]
    async fn ping_round_trips_as_jsonrpc_success() {
        let dispatcher = dispatcher_admin();
        let response = dispatcher
            .dispatch_line(r#"{"jsonrpc":"2.0","id":1,"method":"system.ping","params":{}}"#, &AuthHeaders::new())
            .await
            .unwrap();
        assert_eq!(response["jsonrpc"], "2.0");
        assert_eq!(response["id"], 1);
        assert_eq!(response["result"]["pong"], true);
    }

    #[tokio::test]
    async fn notification_without_id_produces_no_response() {
        let dispatcher = dispatcher_admin();
        let response = dispatcher
            .dispatch_line(r#"{"jsonrpc":"2.0","method":"system.ping","params":{}}"#, &AuthHeaders::new())
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn malformed_json_is_parse_error_with_null_id() {
        let dispatcher = dispatcher_admin();
        let response = dispatcher.dispatch_line("not json at all", &AuthHeaders::new()).await.unwrap();
        assert_eq!(response["error"]["code"], -32700);
        assert_eq!(response["id"], Value::Null);
    }

    #[tokio::test]
    async fn missing_jsonrpc_field_is_invalid_request() {
        let dispatcher = dispatcher_admin();
        let response = dispatcher
            .dispatch_line(r#"{"id":5,"method":"system.ping"}"#, &AuthHeaders::new())
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], -32600);
        assert_eq!(response["id"], 5);
    }

    #[tokio::test]
    async fn unknown_method_maps_to_method_not_found() {
        let dispatcher = dispatcher_admin();
        let response = dispatcher
            .dispatch_line(r#"{"jsonrpc":"2.0","id":2,"method":"gpio.reboot","params":{}}"#, &AuthHeaders::new())
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn rbac_denial_maps_to_permission_denied_code() {
        let mut registry = ToolRegistry::new();
        register_reserved_tools(&mut registry);
        let auth = AuthPipeline::new(AuthMode::Local(LocalAuthenticator::new(None, true, Role::Viewer, "viewer-user")));
        let mut permissions = PermissionTable::new(Role::Admin);
        permissions.insert("system.*", Role::Admin);
        let dispatcher = Dispatcher::new(Arc::new(registry), auth, Arc::new(permissions), AuditLogger::new(None));

        let response = dispatcher
            .dispatch_line(r#"{"jsonrpc":"2.0","id":3,"method":"system.ping","params":{}}"#, &AuthHeaders::new())
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], -32001);
    }

    #[tokio::test]
    async fn authentication_failure_maps_to_unauthenticated_code() {
        let mut registry = ToolRegistry::new();
        register_reserved_tools(&mut registry);
        let auth = AuthPipeline::new(AuthMode::Local(LocalAuthenticator::new(
            Some("s3cr3t".to_string()),
            false,
            Role::Admin,
            "local-dev-user",
        )));
        let permissions = PermissionTable::new(Role::Viewer);
        let dispatcher = Dispatcher::new(Arc::new(registry), auth, Arc::new(permissions), AuditLogger::new(None));

        let response = dispatcher
            .dispatch_line(r#"{"jsonrpc":"2.0","id":4,"method":"system.ping","params":{}}"#, &AuthHeaders::new())
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], -32002);
    }

    #[tokio::test]
    async fn echo_returns_the_supplied_message() {
        let dispatcher = dispatcher_admin();
        let response = dispatcher
            .dispatch_line(
                r#"{"jsonrpc":"2.0","id":6,"method":"system.echo","params":{"message":"hi"}}"#,
                &AuthHeaders::new(),
            )
            .await
            .unwrap();
        assert_eq!(response["result"]["echo"], "hi");
    }
}
