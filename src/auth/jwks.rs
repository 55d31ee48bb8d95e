//! JWKS fetch + cache: TLS fetch of a JWK document, TTL-cached, single-flight refresh.

use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct JwkDocument {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: Option<String>,
    #[serde(default = "default_alg")]
    alg: String,
    #[serde(rename = "n")]
    modulus: Option<String>,
    #[serde(rename = "e")]
    exponent: Option<String>,
}

fn default_alg() -> String {
    "RS256".to_string()
}

/// A cached, verification-ready key.
#[derive(Clone)]
pub struct KeySetEntry {
    pub kid: String,
    pub algorithm: String,
    pub key: Arc<DecodingKey>,
}

struct Inner {
    keys: HashMap<String, KeySetEntry>,
    expiry: Option<Instant>,
}

/// Fetches and caches the verifying keys used for JWT signature validation.
/// A single refresh is in flight at a time; concurrent lookups await it via
/// the shared mutex.
pub struct JwksCache {
    jwks_url: String,
    cache_ttl: Duration,
    client: reqwest::Client,
    inner: Mutex<Inner>,
}

impl JwksCache {
    pub fn new(jwks_url: impl Into<String>, cache_ttl_seconds: u64) -> Self {
        Self {
            jwks_url: jwks_url.into(),
            cache_ttl: Duration::from_secs(cache_ttl_seconds),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build JWKS HTTP client"),
            inner: Mutex::new(Inner {
                keys: HashMap::new(),
                expiry: None,
            }),
        }
    }

    fn is_cache_valid(inner: &Inner) -> bool {
        matches!(inner.expiry, Some(exp) if Instant::now() < exp)
    }

    /// Returns the cached key set, refreshing first if the cache is stale.
    pub async fn get_all(&self) -> anyhow::Result<HashMap<String, KeySetEntry>> {
        let mut guard = self.inner.lock().await;
        if Self::is_cache_valid(&guard) {
            return Ok(guard.keys.clone());
        }
        self.refresh_locked(&mut guard).await?;
        Ok(guard.keys.clone())
    }

    /// Pure cache read — never triggers a fetch.
    pub async fn lookup(&self, kid: &str) -> Option<KeySetEntry> {
        let guard = self.inner.lock().await;
        guard.keys.get(kid).cloned()
    }

    /// Bypasses the TTL and fetches immediately.
    pub async fn force_refresh(&self) -> anyhow::Result<HashMap<String, KeySetEntry>> {
        let mut guard = self.inner.lock().await;
        self.refresh_locked(&mut guard).await?;
        Ok(guard.keys.clone())
    }

    pub async fn clear(&self) {
        let mut guard = self.inner.lock().await;
        guard.keys.clear();
        guard.expiry = None;
    }

    async fn refresh_locked(&self, inner: &mut Inner) -> anyhow::Result<()> {
        debug!(url = %self.jwks_url, "refreshing JWKS");
        let doc: JwkDocument = self
            .client
            .get(&self.jwks_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut keys = HashMap::new();
        for jwk in doc.keys {
            let Some(kid) = jwk.kid else {
                warn!("skipping JWKS entry without a kid");
                continue;
            };
            if !jwk.alg.starts_with("RS") {
                warn!(alg = %jwk.alg, kid = %kid, "unsupported JWKS algorithm, skipping");
                continue;
            }
            let (Some(n), Some(e)) = (jwk.modulus.as_deref(), jwk.exponent.as_deref()) else {
                warn!(kid = %kid, "RSA JWK missing n/e, skipping");
                continue;
            };
            let key = match DecodingKey::from_rsa_components(n, e) {
                Ok(k) => k,
                Err(err) => {
                    warn!(kid = %kid, err = %err, "failed to parse RSA JWK");
                    continue;
                }
            };
            keys.insert(
                kid.clone(),
                KeySetEntry {
                    kid,
                    algorithm: jwk.alg,
                    key: Arc::new(key),
                },
            );
        }

        info!(count = keys.len(), "JWKS refreshed");
        inner.keys = keys;
        inner.expiry = Some(Instant::now() + self.cache_ttl);
        Ok(())
    }
}
