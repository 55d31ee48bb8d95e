//! The typed error kind shared by every component, and its one JSON-RPC mapping.

use serde_json::{json, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Closed set of error kinds. `kind` alone determines the outward JSON-RPC code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    PermissionDenied,
    Unavailable,
    FailedPrecondition,
    NotFound,
    Unauthenticated,
    Internal,
    Timeout,
    ProtocolError,
}

impl ErrorKind {
    /// Fixed table from spec §4.3 / §7.
    pub fn rpc_code(self) -> i32 {
        match self {
            ErrorKind::InvalidArgument => -32602,
            ErrorKind::PermissionDenied => -32001,
            ErrorKind::Unauthenticated => -32002,
            ErrorKind::Unavailable => -32003,
            ErrorKind::FailedPrecondition => -32004,
            ErrorKind::NotFound => -32601,
            ErrorKind::Timeout => -32005,
            ErrorKind::Internal => -32603,
            ErrorKind::ProtocolError => -32600,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::FailedPrecondition => "failed_precondition",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::Internal => "internal",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ProtocolError => "protocol_error",
        }
    }
}

/// The one error type that crosses every component seam. Carries a `kind`,
/// a human message, and a free-form details map merged into the wire `data`.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct TypedError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: HashMap<String, Value>,
}

impl TypedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: HashMap::new(),
        }
    }

    pub fn with_details(mut self, details: HashMap<String, Value>) -> Self {
        self.details = details;
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FailedPrecondition, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn unauthenticated(reason: &str) -> Self {
        Self::new(ErrorKind::Unauthenticated, format!("authentication failed: {reason}"))
            .with_detail("reason", reason)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolError, message)
    }

    /// Last-resort wrapper for an unexpected failure. Must log with the
    /// originating type name — callers are expected to `tracing::error!`
    /// before or after constructing this.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// `data = details ∪ {error_code: kind}`, per §4.3.
    pub fn to_rpc_data(&self) -> Value {
        let mut data = self.details.clone();
        data.insert("error_code".to_string(), json!(self.kind.as_str()));
        json!(data)
    }
}

impl From<TypedError> for anyhow::Error {
    fn from(e: TypedError) -> Self {
        anyhow::Error::new(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_code_table_matches_spec() {
        assert_eq!(ErrorKind::InvalidArgument.rpc_code(), -32602);
        assert_eq!(ErrorKind::PermissionDenied.rpc_code(), -32001);
        assert_eq!(ErrorKind::Unauthenticated.rpc_code(), -32002);
        assert_eq!(ErrorKind::Unavailable.rpc_code(), -32003);
        assert_eq!(ErrorKind::FailedPrecondition.rpc_code(), -32004);
        assert_eq!(ErrorKind::NotFound.rpc_code(), -32601);
        assert_eq!(ErrorKind::Timeout.rpc_code(), -32005);
        assert_eq!(ErrorKind::Internal.rpc_code(), -32603);
        assert_eq!(ErrorKind::ProtocolError.rpc_code(), -32600);
    }

    #[test]
    fn rpc_data_merges_details_and_error_code() {
        let e = TypedError::permission_denied("nope")
            .with_detail("tool", "system.reboot")
            .with_detail("required_role", "admin")
            .with_detail("user_role", "viewer");
        let data = e.to_rpc_data();
        assert_eq!(data["error_code"], "permission_denied");
        assert_eq!(data["tool"], "system.reboot");
    }
}
