//! Authentication entry point: header extraction, cloud (JWT/JWKS) mode and
//! local/dev mode, unified behind [`AuthPipeline`].

pub mod jwks;
pub mod jwt;
pub mod rbac;

use crate::dispatcher::context::{Caller, Role};
use crate::error::TypedError;
use jwt::JwtValidator;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// Dedicated access-assertion header name, checked before the generic
/// bearer header.
pub const ACCESS_ASSERTION_HEADER: &str = "cf-access-jwt-assertion";
pub const AUTHORIZATION_HEADER: &str = "authorization";

/// Transport-agnostic, case-insensitive view over a connection's headers.
/// stdio/Unix-socket transports build this once per connection (from an
/// initial handshake line or a fixed out-of-band field); an HTTP-fronted
/// transport builds it directly from request headers. Dispatch code never
/// touches the underlying transport to get at auth material.
#[derive(Debug, Default, Clone)]
pub struct AuthHeaders {
    lower: HashMap<String, String>,
}

impl AuthHeaders {
    pub fn new() -> Self {
        Self { lower: HashMap::new() }
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.lower.insert(name.to_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.lower.get(&name.to_lowercase()).map(String::as_str)
    }

    /// Extracts the bearer token per §4.2: dedicated access-assertion header
    /// first, then `Authorization: Bearer …`, case-insensitive on both the
    /// header name and the `Bearer` scheme.
    pub fn bearer_token(&self) -> Option<String> {
        if let Some(v) = self.get(ACCESS_ASSERTION_HEADER) {
            if !v.is_empty() {
                return Some(v.to_string());
            }
        }
        let auth = self.get(AUTHORIZATION_HEADER)?;
        let mut parts = auth.splitn(2, ' ');
        let scheme = parts.next()?;
        let rest = parts.next()?;
        if scheme.eq_ignore_ascii_case("bearer") {
            Some(rest.to_string())
        } else {
            None
        }
    }
}

fn tokens_equal(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Local/dev authenticator: either permissive (every request synthesized as
/// admin, loudly logged) or a single fixed shared token compared in
/// constant time.
pub struct LocalAuthenticator {
    static_token: Option<String>,
    permissive_mode: bool,
    default_role: Role,
    default_user_id: String,
}

impl LocalAuthenticator {
    pub fn new(static_token: Option<String>, permissive_mode: bool, default_role: Role, default_user_id: impl Into<String>) -> Self {
        Self {
            static_token,
            permissive_mode,
            default_role,
            default_user_id: default_user_id.into(),
        }
    }

    pub fn authenticate(&self, token: Option<&str>) -> Result<Caller, TypedError> {
        if self.permissive_mode {
            warn!("Permissive mode enabled - all requests allowed");
            return Ok(Caller {
                user_id: Some(self.default_user_id.clone()),
                role: self.default_role,
                source_address: None,
                groups: HashSet::new(),
            });
        }

        match (self.static_token.as_deref(), token) {
            (Some(expected), Some(provided)) if tokens_equal(expected, provided) => Ok(Caller {
                user_id: Some(self.default_user_id.clone()),
                role: self.default_role,
                source_address: None,
                groups: HashSet::new(),
            }),
            (Some(_), Some(_)) => Err(TypedError::unauthenticated("invalid_token")),
            (_, None) => Err(TypedError::unauthenticated("missing_token")),
            (None, Some(_)) => Err(TypedError::unauthenticated("invalid_token")),
        }
    }
}

/// Which authentication mode the pipeline enforces.
pub enum AuthMode {
    Cloudflare(JwtValidator),
    Local(LocalAuthenticator),
}

/// Unified authentication entry point composing header extraction with
/// either cloud (JWT/JWKS) or local/dev verification.
pub struct AuthPipeline {
    mode: AuthMode,
}

impl AuthPipeline {
    pub fn new(mode: AuthMode) -> Arc<Self> {
        Arc::new(Self { mode })
    }

    /// Authenticates one inbound call given its headers (or lack thereof,
    /// for transports that never carry any). Returns the resolved `Caller`
    /// or a populated `unauthenticated` error.
    pub async fn authenticate(&self, headers: &AuthHeaders) -> Result<Caller, TypedError> {
        let token = headers.bearer_token();
        match &self.mode {
            AuthMode::Cloudflare(validator) => {
                let token = token.ok_or_else(|| TypedError::unauthenticated("missing_token"))?;
                let ctx = validator.validate_token(&token).await?;
                Ok(Caller {
                    user_id: Some(ctx.user_id),
                    role: ctx.role,
                    source_address: None,
                    groups: ctx.groups.into_iter().collect(),
                })
            }
            AuthMode::Local(local) => local.authenticate(token.as_deref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_assertion_header_wins_over_authorization() {
        let mut headers = AuthHeaders::new();
        headers.insert("Cf-Access-Jwt-Assertion", "cf-token");
        headers.insert("Authorization", "Bearer other-token");
        assert_eq!(headers.bearer_token().as_deref(), Some("cf-token"));
    }

    #[test]
    fn falls_back_to_authorization_bearer_case_insensitively() {
        let mut headers = AuthHeaders::new();
        headers.insert("AUTHORIZATION", "bearer my-token");
        assert_eq!(headers.bearer_token().as_deref(), Some("my-token"));
    }

    #[test]
    fn non_bearer_authorization_scheme_is_ignored() {
        let mut headers = AuthHeaders::new();
        headers.insert("authorization", "Basic dXNlcjpwYXNz");
        assert_eq!(headers.bearer_token(), None);
    }

    #[test]
    fn permissive_local_mode_always_authenticates_as_admin() {
        let local = LocalAuthenticator::new(None, true, Role::Admin, "local-dev-user");
        let caller = local.authenticate(None).unwrap();
        assert_eq!(caller.role, Role::Admin);
        assert_eq!(caller.user_id.as_deref(), Some("local-dev-user"));
    }

    #[test]
    fn fixed_token_mode_rejects_mismatch_and_accepts_match() {
        let local = LocalAuthenticator::new(Some("s3cr3t".to_string()), false, Role::Admin, "local-dev-user");
        assert!(local.authenticate(Some("wrong")).is_err());
        assert!(local.authenticate(Some("s3cr3t")).is_ok());
        let err = local.authenticate(None).unwrap_err();
        assert_eq!(err.details["reason"], "missing_token");
    }
}
