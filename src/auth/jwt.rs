//! JWT validation pipeline: header parse, kid lookup with one refresh retry,
//! signature/audience/issuer/exp verification, and claim→role resolution.

use crate::auth::jwks::JwksCache;
use crate::auth::rbac::map_groups_to_role;
use crate::dispatcher::context::Role;
use crate::error::TypedError;
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Resolved identity carried forward once a token has validated.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub email: Option<String>,
    pub groups: Vec<String>,
    pub role: Role,
    pub authenticated: bool,
    pub auth_method: &'static str,
    pub token_exp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
    email: Option<String>,
    exp: Option<i64>,
    #[serde(default)]
    groups: Option<GroupsClaim>,
    #[serde(default)]
    roles: Option<GroupsClaim>,
    #[serde(default)]
    cf_groups: Option<GroupsClaim>,
    #[serde(rename = "custom:groups", default)]
    custom_groups: Option<GroupsClaim>,
}

/// Claim sources can hold either a single string or an array of strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GroupsClaim {
    One(String),
    Many(Vec<String>),
}

impl GroupsClaim {
    fn into_vec(self) -> Vec<String> {
        match self {
            GroupsClaim::One(s) => vec![s],
            GroupsClaim::Many(v) => v,
        }
    }
}

fn gather_groups(claims: &Claims) -> Vec<String> {
    let mut groups = Vec::new();
    for source in [
        claims.groups.as_ref(),
        claims.roles.as_ref(),
        claims.cf_groups.as_ref(),
    ] {
        if let Some(g) = source {
            groups.extend(clone_claim(g));
        }
    }
    if let Some(g) = claims.custom_groups.as_ref() {
        groups.extend(clone_claim(g));
    }
    groups
}

fn clone_claim(claim: &GroupsClaim) -> Vec<String> {
    match claim {
        GroupsClaim::One(s) => vec![s.clone()],
        GroupsClaim::Many(v) => v.clone(),
    }
}

/// Validates bearer tokens against a JWKS-backed key set. Mirrors the
/// closed vocabulary of `unauthenticated` reasons exactly: `missing_token`,
/// `decode_error`, `missing_kid`, `unknown_kid`, `jwks_fetch_failed`,
/// `token_expired`, `invalid_signature`, `invalid_audience`,
/// `invalid_issuer`, `invalid_token`.
pub struct JwtValidator {
    jwks: Arc<JwksCache>,
    audience: String,
    issuer: String,
    role_mappings: HashMap<String, String>,
    default_role: Role,
}

impl JwtValidator {
    pub fn new(
        jwks: Arc<JwksCache>,
        audience: impl Into<String>,
        issuer: impl Into<String>,
        role_mappings: HashMap<String, String>,
        default_role: Role,
    ) -> Self {
        Self {
            jwks,
            audience: audience.into(),
            issuer: issuer.into(),
            role_mappings,
            default_role,
        }
    }

    pub async fn validate_token(&self, token: &str) -> Result<AuthContext, TypedError> {
        if token.is_empty() {
            return Err(TypedError::unauthenticated("missing_token"));
        }

        let header = decode_header(token).map_err(|_| TypedError::unauthenticated("decode_error"))?;
        let kid = header.kid.ok_or_else(|| TypedError::unauthenticated("missing_kid"))?;

        let keys = self
            .jwks
            .get_all()
            .await
            .map_err(|_| TypedError::unauthenticated("jwks_fetch_failed"))?;

        let entry = match keys.get(&kid) {
            Some(e) => e.clone(),
            None => {
                if let Err(e) = self.jwks.force_refresh().await {
                    warn!(err = %e, "JWKS force_refresh failed while resolving unknown kid");
                }
                match self.jwks.lookup(&kid).await {
                    Some(e) => e,
                    None => {
                        return Err(TypedError::unauthenticated("unknown_kid").with_detail("kid", kid));
                    }
                }
            }
        };

        let algorithm = match entry.algorithm.as_str() {
            "RS256" => Algorithm::RS256,
            "RS384" => Algorithm::RS384,
            "RS512" => Algorithm::RS512,
            _ => return Err(TypedError::unauthenticated("invalid_token")),
        };

        let mut validation = Validation::new(algorithm);
        validation.set_audience(&[&self.audience]);
        validation.set_issuer(&[&self.issuer]);
        validation.validate_nbf = true;

        let token_data = decode::<Claims>(token, &entry.key, &validation).map_err(|err| {
            use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
            match err.kind() {
                JwtErrorKind::ExpiredSignature => TypedError::unauthenticated("token_expired"),
                JwtErrorKind::InvalidSignature => TypedError::unauthenticated("invalid_signature"),
                JwtErrorKind::InvalidAudience => {
                    TypedError::unauthenticated("invalid_audience").with_detail("expected", self.audience.clone())
                }
                JwtErrorKind::InvalidIssuer => {
                    TypedError::unauthenticated("invalid_issuer").with_detail("expected", self.issuer.clone())
                }
                _ => TypedError::unauthenticated("invalid_token").with_detail("error", err.to_string()),
            }
        })?;

        let claims = token_data.claims;
        let user_id = claims
            .sub
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| claims.email.clone())
            .ok_or_else(|| TypedError::unauthenticated("invalid_token"))?;

        let groups = gather_groups(&claims);
        let role = map_groups_to_role(&groups, &self.role_mappings, self.default_role);

        Ok(AuthContext {
            user_id,
            email: claims.email,
            groups,
            role,
            authenticated: true,
            auth_method: "jwt",
            token_exp: claims.exp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_token_is_missing_token() {
        let jwks = Arc::new(JwksCache::new("https://example.invalid/certs", 3600));
        let validator = JwtValidator::new(jwks, "aud", "iss", HashMap::new(), Role::Viewer);
        let err = validator.validate_token("").await.unwrap_err();
        assert_eq!(err.details["reason"], "missing_token");
    }

    #[tokio::test]
    async fn garbage_token_is_decode_error() {
        let jwks = Arc::new(JwksCache::new("https://example.invalid/certs", 3600));
        let validator = JwtValidator::new(jwks, "aud", "iss", HashMap::new(), Role::Viewer);
        let err = validator.validate_token("not-a-jwt").await.unwrap_err();
        assert_eq!(err.details["reason"], "decode_error");
    }
}
