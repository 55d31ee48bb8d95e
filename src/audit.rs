//! Append-only, line-delimited JSON audit log with recursive sensitive-field masking.
//!
//! Distinct from the operational trace log in [`tracing`]: this log exists for
//! compliance/forensics and is never filtered by log level.

use crate::dispatcher::context::RequestContext;
use crate::error::{ErrorKind, TypedError};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::error;

/// Key substrings (case-insensitive) that mark a field as sensitive.
const SENSITIVE_FIELD_PATTERNS: &[&str] = &[
    "token",
    "password",
    "secret",
    "api_key",
    "apikey",
    "secret_key",
    "private_key",
    "credential",
    "auth",
];

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    SENSITIVE_FIELD_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Mask a single value assumed to sit behind a sensitive key.
fn mask_value(value: &Value) -> Value {
    match value {
        Value::String(s) if s.len() > 8 => {
            let chars: Vec<char> = s.chars().collect();
            if chars.len() > 8 {
                let first: String = chars[..2].iter().collect();
                let last: String = chars[chars.len() - 2..].iter().collect();
                Value::String(format!("{first}...{last}"))
            } else {
                Value::String("<masked>".to_string())
            }
        }
        _ => Value::String("<masked>".to_string()),
    }
}

/// Recursively mask sensitive keys in a JSON value. Non-object/array values
/// pass through unchanged; this is only ever called on mappings and lists.
pub fn mask_sensitive_fields(data: &Value) -> Value {
    match data {
        Value::Object(map) => {
            let mut masked = Map::with_capacity(map.len());
            for (key, value) in map {
                if is_sensitive_key(key) {
                    masked.insert(key.clone(), mask_value(value));
                } else if value.is_object() || value.is_array() {
                    masked.insert(key.clone(), mask_sensitive_fields(value));
                } else {
                    masked.insert(key.clone(), value.clone());
                }
            }
            Value::Object(masked)
        }
        Value::Array(items) => Value::Array(items.iter().map(mask_sensitive_fields).collect()),
        other => other.clone(),
    }
}

/// The `caller` object on an [`AuditEvent`], masked like any other payload
/// reachable from a logged record (§10.3) even though none of its fields
/// are expected to match the sensitive-key patterns today.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct AuditCaller {
    pub user_id: Option<String>,
    pub role: Option<String>,
    pub source_address: Option<String>,
}

impl AuditCaller {
    fn from_ctx(ctx: &RequestContext) -> Self {
        Self {
            user_id: ctx.caller.user_id.clone(),
            role: Some(ctx.caller.role.as_str().to_string()),
            source_address: ctx.caller.source_address.clone(),
        }
    }
}

/// Which kind of record a line is, per the Audit Event data model (§3).
#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ToolCall,
    AuthEvent,
    SecurityEvent,
}

/// One line of the audit log. Carries exactly the fields the Audit Event
/// data model (§3) names: `event_type`, `timestamp`, `tool_name?`, a masked
/// `caller`, `outcome` (`"ok"` or a [`crate::error::ErrorKind`] string),
/// `reason?`, and a masked `details` mapping.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub caller: AuditCaller,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub details: Value,
}

const OUTCOME_OK: &str = "ok";

/// Append-only audit log writer. One writer instance per process; the
/// internal mutex serializes concurrent `log_*` calls onto the same file.
pub struct AuditLogger {
    path: Option<PathBuf>,
    file: Mutex<Option<tokio::fs::File>>,
}

impl AuditLogger {
    /// `path = None` disables file output (the logger still validates calls
    /// but silently discards them — used in tests).
    pub fn new(path: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            path,
            file: Mutex::new(None),
        })
    }

    async fn ensure_open(&self) -> std::io::Result<()> {
        let mut guard = self.file.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        *guard = Some(file);
        Ok(())
    }

    async fn write_line(&self, value: &Value) {
        if self.path.is_none() {
            return;
        }
        if let Err(e) = self.ensure_open().await {
            error!(err = %e, "failed to open audit log file");
            return;
        }
        let mut line = match serde_json::to_string(value) {
            Ok(s) => s,
            Err(e) => {
                error!(err = %e, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');
        let mut guard = self.file.lock().await;
        if let Some(file) = guard.as_mut() {
            if let Err(e) = file.write_all(line.as_bytes()).await {
                error!(err = %e, "failed to append audit log entry");
            }
        }
    }

    pub async fn log_tool_call(
        &self,
        ctx: &RequestContext,
        result: Result<&Value, &TypedError>,
        params: Option<&Value>,
    ) {
        let (outcome, reason) = match result {
            Ok(_) => (OUTCOME_OK.to_string(), None),
            Err(e) => (
                e.kind.as_str().to_string(),
                e.details.get("reason").and_then(Value::as_str).map(str::to_string),
            ),
        };
        let event = AuditEvent {
            event_type: AuditEventType::ToolCall,
            timestamp: Utc::now().to_rfc3339(),
            tool_name: Some(ctx.tool_name.clone()),
            caller: AuditCaller::from_ctx(ctx),
            outcome,
            reason,
            details: params.map(mask_sensitive_fields).unwrap_or_else(|| json!({})),
        };
        self.write_line(&json!(event)).await;
    }

    pub async fn log_auth_event(
        &self,
        event_type: &str,
        success: bool,
        user_id: Option<&str>,
        source_ip: Option<&str>,
        reason: Option<&str>,
    ) {
        let event = AuditEvent {
            event_type: AuditEventType::AuthEvent,
            timestamp: Utc::now().to_rfc3339(),
            tool_name: None,
            caller: AuditCaller {
                user_id: user_id.map(str::to_string),
                role: None,
                source_address: source_ip.map(str::to_string),
            },
            outcome: if success { OUTCOME_OK.to_string() } else { ErrorKind::Unauthenticated.as_str().to_string() },
            reason: reason.map(str::to_string),
            details: json!({ "auth_event_type": event_type }),
        };
        self.write_line(&json!(event)).await;
    }

    /// `reason` is a closed-vocabulary token for the check that fired (e.g.
    /// `"rbac_denied"`); `kind` supplies the `outcome` field's shared
    /// `ErrorKind` vocabulary.
    pub async fn log_security_event(
        &self,
        reason: &str,
        kind: ErrorKind,
        ctx: Option<&RequestContext>,
        details: Option<&Value>,
    ) {
        let event = AuditEvent {
            event_type: AuditEventType::SecurityEvent,
            timestamp: Utc::now().to_rfc3339(),
            tool_name: ctx.map(|c| c.tool_name.clone()),
            caller: ctx.map(AuditCaller::from_ctx).unwrap_or_default(),
            outcome: kind.as_str().to_string(),
            reason: Some(reason.to_string()),
            details: details.map(mask_sensitive_fields).unwrap_or_else(|| json!({})),
        };
        self.write_line(&json!(event)).await;
    }
}
