//! Layered configuration (§10.1): compiled defaults → TOML file → environment
//! overlay (`MCP_` prefix, `__` nesting) → CLI flags, in that priority order.
//! The result is a single immutable [`AppConfig`] covering every tunable the
//! Agent socket, auth pipeline, metrics sampler, and update state machine
//! need. Parse failure (missing required field, malformed TOML, an
//! out-of-range invariant) is a startup-time fatal error.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{info, warn};

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/ops-agent/ops-agent.sock")
}

fn default_releases_dir(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("releases")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSocketSettings {
    pub path: PathBuf,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub mode: u32,
}

impl Default for AgentSocketSettings {
    fn default() -> Self {
        Self {
            path: default_socket_path(),
            owner: None,
            group: None,
            mode: 0o660,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// `"cloud"` (JWT/JWKS) or `"local"` (dev-mode, permissive or shared token).
    pub mode: String,
    pub jwks_url: Option<String>,
    pub audience: Option<String>,
    pub issuer: Option<String>,
    pub jwks_cache_ttl_seconds: u64,
    /// Claim group → role, e.g. `{"sre": "admin", "eng": "operator"}`.
    pub role_mappings: HashMap<String, String>,
    /// Tool name/namespace → minimum role, e.g. `{"gpio.*": "operator"}`.
    pub permissions: HashMap<String, String>,
    pub default_role: String,
    pub local_permissive: bool,
    pub local_static_token: Option<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            mode: "local".to_string(),
            jwks_url: None,
            audience: None,
            issuer: None,
            jwks_cache_ttl_seconds: 3600,
            role_mappings: HashMap::new(),
            permissions: HashMap::new(),
            default_role: "admin".to_string(),
            local_permissive: true,
            local_static_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub sampler_interval_seconds: u64,
    pub retention_seconds: i64,
    pub db_path: PathBuf,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            sampler_interval_seconds: 60,
            retention_seconds: 7 * 24 * 3600,
            db_path: PathBuf::from("metrics.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateSettings {
    pub repo: String,
    pub binary_name: String,
    pub channel: Option<String>,
    pub releases_dir: PathBuf,
    pub staging_root: PathBuf,
    pub health_check_retries: u32,
    pub health_check_delay_seconds: u64,
    pub auto_rollback: bool,
    /// Optional base URL for the HTTP leg of the health-check list.
    pub health_url: Option<String>,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            repo: String::new(),
            binary_name: "ops-agent".to_string(),
            channel: None,
            releases_dir: PathBuf::from("releases"),
            staging_root: PathBuf::from("staging"),
            health_check_retries: 3,
            health_check_delay_seconds: 5,
            auto_rollback: true,
            health_url: None,
        }
    }
}

/// The fully-resolved, immutable configuration handed to both the Broker and
/// the Agent at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub log: String,
    pub log_file: Option<PathBuf>,
    pub audit_log_path: Option<PathBuf>,
    pub agent_socket: AgentSocketSettings,
    pub auth: AuthSettings,
    pub metrics: MetricsSettings,
    pub update: UpdateSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            agent_socket: AgentSocketSettings::default(),
            log: "info".to_string(),
            log_file: None,
            audit_log_path: Some(data_dir.join("audit.log")),
            auth: AuthSettings::default(),
            metrics: MetricsSettings::default(),
            update: UpdateSettings {
                releases_dir: default_releases_dir(&data_dir),
                ..UpdateSettings::default()
            },
            data_dir,
        }
    }
}

/// CLI-supplied overrides, parsed with `clap` by each binary's `main` and
/// passed through unchanged — this module never parses argv itself, matching
/// the separation the host binary already draws between arg parsing and
/// config resolution.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub data_dir: Option<PathBuf>,
    pub log: Option<String>,
    pub socket_path: Option<PathBuf>,
}

impl CliOverrides {
    fn to_overlay(&self) -> Value {
        let mut top = serde_json::Map::new();
        if let Some(dir) = &self.data_dir {
            top.insert("data_dir".to_string(), serde_json::json!(dir));
        }
        if let Some(log) = &self.log {
            top.insert("log".to_string(), serde_json::json!(log));
        }
        if let Some(path) = &self.socket_path {
            top.insert(
                "agent_socket".to_string(),
                serde_json::json!({ "path": path }),
            );
        }
        Value::Object(top)
    }
}

impl AppConfig {
    /// Resolves the layered configuration and validates its invariants.
    /// Fatal on any parse or range failure — this is meant to be called once
    /// at process startup, before any subsystem is constructed.
    pub fn load(cli: &CliOverrides) -> Result<Self> {
        let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);

        let mut merged = serde_json::to_value(AppConfig::default()).context("failed to serialize built-in defaults")?;

        if let Some(toml_value) = load_toml_overlay(&data_dir) {
            merge_json(&mut merged, toml_value);
        }

        let env_overlay = build_env_overlay("MCP_");
        if !env_overlay.is_null() {
            merge_json(&mut merged, env_overlay);
        }

        merge_json(&mut merged, cli.to_overlay());

        let config: AppConfig = serde_json::from_value(merged).context("failed to resolve configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(1..=3600).contains(&self.metrics.sampler_interval_seconds) {
            bail!(
                "metrics.sampler_interval_seconds must be in 1..=3600, got {}",
                self.metrics.sampler_interval_seconds
            );
        }
        if self.metrics.retention_seconds < 0 {
            bail!("metrics.retention_seconds must be non-negative");
        }
        if self.auth.mode != "cloud" && self.auth.mode != "local" {
            bail!("auth.mode must be 'cloud' or 'local', got '{}'", self.auth.mode);
        }
        if self.auth.mode == "cloud" && self.auth.jwks_url.is_none() {
            bail!("auth.mode = 'cloud' requires auth.jwks_url to be set");
        }
        Ok(())
    }
}

/// Reads `{data_dir}/config.toml`, if present, as a generic JSON value
/// suitable for layered merging. A missing file is not an error (the lowest
/// layer is the compiled defaults); a malformed file is logged and skipped,
/// not fatal on its own — the fatal path is reserved for the final
/// deserialize-and-validate step, which will reject an incomplete result.
fn load_toml_overlay(data_dir: &std::path::Path) -> Option<Value> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<toml::Value>(&contents) {
        Ok(value) => match serde_json::to_value(value) {
            Ok(json) => Some(json),
            Err(e) => {
                warn!(path = %path.display(), err = %e, "config.toml did not convert to JSON — ignoring");
                None
            }
        },
        Err(e) => {
            warn!(path = %path.display(), err = %e, "failed to parse config.toml — ignoring");
            None
        }
    }
}

/// Builds a nested JSON overlay from environment variables under `prefix`,
/// using `__` as the nesting separator (e.g. `MCP_AUTH__JWKS_URL` becomes
/// `{"auth": {"jwks_url": "..."}}`). Scalar values are parsed as bool, then
/// integer, then float, falling back to string.
fn build_env_overlay(prefix: &str) -> Value {
    let mut root = Value::Object(serde_json::Map::new());
    let mut found = false;
    for (key, raw_value) in std::env::vars() {
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        if rest.is_empty() {
            continue;
        }
        found = true;
        let segments: Vec<String> = rest.split("__").map(|s| s.to_lowercase()).collect();
        insert_nested(&mut root, &segments, parse_scalar(&raw_value));
    }
    if found {
        info!(prefix, "applied environment variable configuration overlay");
        root
    } else {
        Value::Null
    }
}

fn parse_scalar(raw: &str) -> Value {
    if let Ok(b) = raw.parse::<bool>() {
        return Value::Bool(b);
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(raw.to_string())
}

fn insert_nested(root: &mut Value, segments: &[String], value: Value) {
    let Value::Object(map) = root else { return };
    match segments {
        [] => {}
        [last] => {
            map.insert(last.clone(), value);
        }
        [head, tail @ ..] => {
            let entry = map
                .entry(head.clone())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            insert_nested(entry, tail, value);
        }
    }
}

/// Recursive object merge: `overlay` wins on every key present in both;
/// non-object values are replaced wholesale, not merged field-by-field.
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, overlay_value),
                    None => {
                        base_map.insert(key, overlay_value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value;
        }
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("ops-agent");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("ops-agent");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("ops-agent");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("ops-agent");
        }
    }
    PathBuf::from(".ops-agent")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn out_of_range_sampler_interval_is_rejected() {
        let mut config = AppConfig::default();
        config.metrics.sampler_interval_seconds = 0;
        assert!(config.validate().is_err());

        config.metrics.sampler_interval_seconds = 4000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn cloud_mode_requires_jwks_url() {
        let mut config = AppConfig::default();
        config.auth.mode = "cloud".to_string();
        assert!(config.validate().is_err());
        config.auth.jwks_url = Some("https://example.com/.well-known/jwks.json".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overlay_builds_nested_structure() {
        std::env::set_var("MCP_AUTH__JWKS_URL", "https://example.com/jwks.json");
        std::env::set_var("MCP_METRICS__SAMPLER_INTERVAL_SECONDS", "30");
        let overlay = build_env_overlay("MCP_");
        assert_eq!(overlay["auth"]["jwks_url"], "https://example.com/jwks.json");
        assert_eq!(overlay["metrics"]["sampler_interval_seconds"], 30);
        std::env::remove_var("MCP_AUTH__JWKS_URL");
        std::env::remove_var("MCP_METRICS__SAMPLER_INTERVAL_SECONDS");
    }

    #[test]
    fn cli_overlay_wins_over_everything_else() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "log = \"debug\"\n[agent_socket]\nmode = 416\n",
        )
        .unwrap();

        let cli = CliOverrides {
            data_dir: Some(dir.path().to_path_buf()),
            log: Some("trace".to_string()),
            socket_path: None,
        };
        let config = AppConfig::load(&cli).unwrap();
        assert_eq!(config.log, "trace");
        assert_eq!(config.agent_socket.mode, 416);
    }

    #[test]
    fn merge_json_overlay_replaces_scalars_and_merges_objects() {
        let mut base = serde_json::json!({ "a": 1, "nested": { "x": 1, "y": 2 } });
        merge_json(&mut base, serde_json::json!({ "a": 2, "nested": { "y": 3 } }));
        assert_eq!(base["a"], 2);
        assert_eq!(base["nested"]["x"], 1);
        assert_eq!(base["nested"]["y"], 3);
    }
}
