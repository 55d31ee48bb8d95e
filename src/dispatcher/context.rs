//! Request Context and Caller — the per-call value types every handler receives.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Ordered role set `{viewer < operator < admin}`. Derive order matches
/// declaration order, so `Role::Viewer < Role::Admin` holds via `PartialOrd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Operator,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Operator => "operator",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "viewer" => Some(Role::Viewer),
            "operator" => Some(Role::Operator),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    /// `true` iff `self` satisfies a `required` role under the ordered comparison.
    pub fn has_role(self, required: Role) -> bool {
        self >= required
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The caller behind a request. `role` defaults to `Viewer` (the lowest
/// role, not a free pass) when unauthenticated callers are permitted at all
/// by the active auth mode; most deployments reject unauthenticated callers
/// outright before a `Caller` is ever constructed.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: Option<String>,
    pub role: Role,
    pub source_address: Option<String>,
    pub groups: HashSet<String>,
}

impl Caller {
    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            role: Role::Viewer,
            source_address: None,
            groups: HashSet::new(),
        }
    }

    pub fn authenticated(self) -> bool {
        self.user_id.is_some()
    }
}

/// Opaque request identifier — string or integer per JSON-RPC 2.0; absent for
/// notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::String(s) => write!(f, "{s}"),
            RequestId::Number(n) => write!(f, "{n}"),
        }
    }
}

impl RequestId {
    pub fn to_json(&self) -> Value {
        match self {
            RequestId::String(s) => Value::String(s.clone()),
            RequestId::Number(n) => Value::Number((*n).into()),
        }
    }

    pub fn from_json(value: &Value) -> Option<RequestId> {
        match value {
            Value::String(s) => Some(RequestId::String(s.clone())),
            Value::Number(n) => n.as_i64().map(RequestId::Number),
            _ => None,
        }
    }
}

/// Produced per inbound call, consumed by every handler. Immutable after
/// construction.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub tool_name: String,
    pub caller: Caller,
    pub request_id: Option<RequestId>,
    pub received_at: DateTime<Utc>,
    pub metadata: HashMap<String, Value>,
}

impl RequestContext {
    pub fn new(tool_name: impl Into<String>, caller: Caller, request_id: Option<RequestId>) -> Self {
        Self {
            tool_name: tool_name.into(),
            caller,
            request_id,
            received_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.request_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_ordering_matches_spec() {
        assert!(Role::Admin > Role::Operator);
        assert!(Role::Operator > Role::Viewer);
        assert!(Role::Viewer.has_role(Role::Viewer));
        assert!(!Role::Viewer.has_role(Role::Admin));
        assert!(Role::Admin.has_role(Role::Viewer));
    }

    #[test]
    fn anonymous_caller_is_unauthenticated() {
        let c = Caller::anonymous();
        assert!(!c.authenticated());
        assert_eq!(c.role, Role::Viewer);
    }
}
