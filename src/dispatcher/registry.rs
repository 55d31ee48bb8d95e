//! Tool registry — one-shot name→handler registration, namespace listing,
//! unexpected-panic-to-`internal` wrapping on invoke.

use crate::dispatcher::context::RequestContext;
use crate::error::{ErrorKind, TypedError};
use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, ctx: &RequestContext, params: Value) -> Result<Value, TypedError>;
}

/// Blanket impl so a plain async fn pointer can be registered directly.
#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(&RequestContext, Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, TypedError>> + Send,
{
    async fn call(&self, ctx: &RequestContext, params: Value) -> Result<Value, TypedError> {
        (self)(ctx, params).await
    }
}

/// Maps `tool_name` ("namespace.operation") to a handler. Registration is
/// one-shot per name; re-registration is an error, mirroring the source
/// registry's `register()` contract.
#[derive(Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) -> Result<(), String> {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(format!("tool '{name}' is already registered"));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn get_handler(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn list_tools(&self, namespace: Option<&str>) -> Vec<String> {
        match namespace {
            None => self.handlers.keys().cloned().collect(),
            Some(ns) => {
                let prefix = format!("{ns}.");
                self.handlers
                    .keys()
                    .filter(|n| n.starts_with(&prefix))
                    .cloned()
                    .collect()
            }
        }
    }

    pub fn list_namespaces(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = self
            .handlers
            .keys()
            .filter_map(|name| name.split_once('.').map(|(ns, _)| ns.to_string()))
            .collect();
        namespaces.sort();
        namespaces.dedup();
        namespaces
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Look up and call the handler. `not_found` if unregistered; any
    /// `TypedError` raised by the handler is re-raised as-is. Runs the call
    /// on its own spawned task so an unexpected panic inside a handler
    /// unwinds only that task, not the caller's — it is caught here and
    /// turned into `kind=internal`, logged at `error` with the panic
    /// payload and, where derivable, its type name, matching §7/§10.4's
    /// "last-resort wrapper for unexpected exceptions" requirement.
    pub async fn invoke(&self, name: &str, ctx: &RequestContext, params: Value) -> Result<Value, TypedError> {
        let handler = self.get_handler(name).ok_or_else(|| {
            TypedError::new(ErrorKind::NotFound, format!("tool '{name}' is not registered"))
                .with_detail("tool", name)
        })?;

        let ctx = ctx.clone();
        let tool_name = name.to_string();
        match tokio::spawn(async move { handler.call(&ctx, params).await }).await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                let panic = join_err.into_panic();
                let (message, type_name) = describe_panic(&panic);
                error!(tool = %tool_name, message = %message, panic_type = %type_name, "tool handler panicked");
                Err(TypedError::internal(format!("tool handler panicked: {message}"))
                    .with_detail("tool", tool_name)
                    .with_detail("panic_type", type_name))
            }
            Err(join_err) => {
                error!(tool = %tool_name, error = %join_err, "tool handler task failed to complete");
                Err(TypedError::internal(format!("tool handler task failed: {join_err}"))
                    .with_detail("tool", tool_name))
            }
        }
    }
}

/// Best-effort human message + type name for a caught panic payload.
/// `Box<dyn Any + Send>` carries no reflection beyond downcasting the
/// common payload shapes the standard panic macros actually produce.
fn describe_panic(payload: &(dyn Any + Send)) -> (String, &'static str) {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (s.to_string(), "&str")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        (s.clone(), "String")
    } else {
        ("non-string panic payload".to_string(), "unknown")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::context::Caller;

    fn ctx() -> RequestContext {
        RequestContext::new("system.ping", Caller::anonymous(), None)
    }

    #[tokio::test]
    async fn register_then_invoke_roundtrips() {
        let mut reg = ToolRegistry::new();
        reg.register(
            "system.ping",
            Arc::new(|_ctx: &RequestContext, _params: Value| async move {
                Ok(serde_json::json!({ "pong": true }))
            }),
        )
        .unwrap();

        let result = reg.invoke("system.ping", &ctx(), Value::Null).await.unwrap();
        assert_eq!(result["pong"], true);
    }

    #[tokio::test]
    async fn double_registration_is_rejected_and_first_survives() {
        let mut reg = ToolRegistry::new();
        reg.register(
            "system.ping",
            Arc::new(|_ctx: &RequestContext, _params: Value| async move { Ok(Value::Null) }),
        )
        .unwrap();
        let err = reg
            .register(
                "system.ping",
                Arc::new(|_ctx: &RequestContext, _params: Value| async move {
                    Ok(serde_json::json!("second"))
                }),
            )
            .unwrap_err();
        assert!(err.contains("already registered"));
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let reg = ToolRegistry::new();
        let err = reg.invoke("system.unknown", &ctx(), Value::Null).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn handler_panic_is_caught_and_wrapped_as_internal() {
        let mut reg = ToolRegistry::new();
        reg.register(
            "system.boom",
            Arc::new(|_ctx: &RequestContext, _params: Value| async move {
                panic!("handler exploded");
                #[allow(unreachable_code)]
                Ok(Value::Null)
            }),
        )
        .unwrap();

        let err = reg.invoke("system.boom", &ctx(), Value::Null).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
        assert!(err.message.contains("handler exploded"));
        assert_eq!(err.details["tool"], "system.boom");
    }

    #[test]
    fn namespace_listing_filters_and_enumerates() {
        let mut reg = ToolRegistry::new();
        reg.register(
            "system.ping",
            Arc::new(|_: &RequestContext, _: Value| async move { Ok(Value::Null) }),
        )
        .unwrap();
        reg.register(
            "gpio.read",
            Arc::new(|_: &RequestContext, _: Value| async move { Ok(Value::Null) }),
        )
        .unwrap();

        assert_eq!(reg.list_tools(Some("system")), vec!["system.ping".to_string()]);
        let mut namespaces = reg.list_namespaces();
        namespaces.sort();
        assert_eq!(namespaces, vec!["gpio".to_string(), "system".to_string()]);
    }
}
