//! `ops-broker` — the unprivileged Broker binary: reads line-delimited
//! JSON-RPC requests from stdin, authenticates and authorizes each one,
//! invokes the matching tool (locally or by forwarding to the Agent over
//! the IPC socket), and writes the JSON-RPC response to stdout.

use anyhow::{Context, Result};
use clap::Parser;
use ops_agent::audit::AuditLogger;
use ops_agent::auth::jwks::JwksCache;
use ops_agent::auth::jwt::JwtValidator;
use ops_agent::auth::rbac::PermissionTable;
use ops_agent::auth::{AuthHeaders, AuthMode, AuthPipeline, LocalAuthenticator};
use ops_agent::config::{AppConfig, CliOverrides};
use ops_agent::dispatcher::context::{Role, RequestContext};
use ops_agent::dispatcher::registry::ToolRegistry;
use ops_agent::dispatcher::{self, Dispatcher};
use ops_agent::error::TypedError;
use ops_agent::ipc::IpcClient;
use ops_agent::metrics::store::{Aggregation, MetricsStore};
use ops_agent::metrics::{self, MetricsSampler};
use ops_agent::update::{GitHubReleasesBackend, HealthChecker, UpdateStateMachine};
use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "ops-broker", about = "Unprivileged Broker — authenticated tool dispatch over stdio", version)]
struct Args {
    /// Data directory for configuration, audit log, and the metrics database.
    #[arg(long, env = "MCP_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "MCP_LOG")]
    log: Option<String>,

    /// Path to the Agent's Unix domain socket.
    #[arg(long, env = "MCP_AGENT_SOCKET")]
    socket_path: Option<PathBuf>,
}

fn build_auth_pipeline(config: &AppConfig) -> Result<Arc<AuthPipeline>> {
    let default_role = Role::parse(&config.auth.default_role).unwrap_or(Role::Admin);

    let mode = if config.auth.mode == "cloud" {
        let jwks_url = config.auth.jwks_url.clone().context("auth.mode = 'cloud' requires auth.jwks_url")?;
        let jwks = Arc::new(JwksCache::new(jwks_url, config.auth.jwks_cache_ttl_seconds));
        let validator = JwtValidator::new(
            jwks,
            config.auth.audience.clone().unwrap_or_default(),
            config.auth.issuer.clone().unwrap_or_default(),
            config.auth.role_mappings.clone(),
            default_role,
        );
        AuthMode::Cloudflare(validator)
    } else {
        let local = LocalAuthenticator::new(
            config.auth.local_static_token.clone(),
            config.auth.local_permissive,
            default_role,
            "local-dev-user",
        );
        AuthMode::Local(local)
    };

    Ok(AuthPipeline::new(mode))
}

fn build_permission_table(config: &AppConfig) -> Arc<PermissionTable> {
    let default_role = Role::parse(&config.auth.default_role).unwrap_or(Role::Admin);
    let mut table = PermissionTable::new(default_role);
    for (pattern, role_name) in &config.auth.permissions {
        match Role::parse(role_name) {
            Some(role) => table.insert(pattern.clone(), role),
            None => warn!(pattern, role_name, "ignoring permission entry with unrecognized role"),
        }
    }
    // system.* is always operable by anyone who can authenticate at all.
    table.insert("system.*", Role::Viewer);
    Arc::new(table)
}

async fn build_metrics_store(config: &AppConfig) -> Result<Arc<MetricsStore>> {
    let db_path = if config.metrics.db_path.is_absolute() {
        config.metrics.db_path.clone()
    } else {
        config.data_dir.join(&config.metrics.db_path)
    };
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent).await.context("failed to create metrics database directory")?;
    }
    let options = SqliteConnectOptions::new().filename(&db_path).create_if_missing(true);
    let pool = SqlitePoolOptions::new().max_connections(4).connect_with(options).await.context("failed to open metrics database")?;
    let store = Arc::new(MetricsStore::new(pool));
    store.migrate().await.context("failed to migrate metrics schema")?;
    Ok(store)
}

fn register_metrics_tools(registry: &mut ToolRegistry, store: Arc<MetricsStore>) {
    let query_store = Arc::clone(&store);
    registry
        .register(
            "metrics.query",
            Arc::new(move |_ctx: &RequestContext, params: Value| {
                let store = Arc::clone(&query_store);
                async move {
                    let start = params.get("start").and_then(Value::as_f64).ok_or_else(|| TypedError::invalid_argument("missing 'start'"))?;
                    let end = params.get("end").and_then(Value::as_f64).ok_or_else(|| TypedError::invalid_argument("missing 'end'"))?;
                    let metric_type = params.get("metric_type").and_then(Value::as_str);
                    let limit = params.get("limit").and_then(Value::as_i64).unwrap_or(1000);
                    let offset = params.get("offset").and_then(Value::as_i64).unwrap_or(0);
                    metrics::validate_limit(limit)?;
                    let samples = store
                        .query_range(start, end, metric_type, offset, limit)
                        .await
                        .map_err(|e| TypedError::internal(format!("metrics query failed: {e}")))?;
                    Ok(json!({ "samples": samples }))
                }
            }),
        )
        .expect("metrics.query registered exactly once at startup");

    registry
        .register(
            "metrics.aggregate",
            Arc::new(move |_ctx: &RequestContext, params: Value| {
                let store = Arc::clone(&store);
                async move {
                    let start = params.get("start").and_then(Value::as_f64).ok_or_else(|| TypedError::invalid_argument("missing 'start'"))?;
                    let end = params.get("end").and_then(Value::as_f64).ok_or_else(|| TypedError::invalid_argument("missing 'end'"))?;
                    let metric_type = params.get("metric_type").and_then(Value::as_str);
                    let agg_name = params.get("aggregation").and_then(Value::as_str).unwrap_or("avg");
                    let aggregation: Aggregation = metrics::parse_aggregation(agg_name)?;
                    let rows = store
                        .aggregate(start, end, metric_type, aggregation)
                        .await
                        .map_err(|e| TypedError::internal(format!("metrics aggregate failed: {e}")))?;
                    // One row per metric_type per §4.4; with a filter there is at
                    // most one, surfaced as a scalar for caller convenience.
                    match metric_type {
                        Some(mt) => Ok(json!({
                            "metric_type": mt,
                            "aggregation": agg_name,
                            "value": rows.first().map(|r| r.value),
                        })),
                        None => Ok(json!({ "aggregation": agg_name, "results": rows })),
                    }
                }
            }),
        )
        .expect("metrics.aggregate registered exactly once at startup");
}

fn register_update_tools(registry: &mut ToolRegistry, machine: Arc<UpdateStateMachine>) {
    let status_machine = Arc::clone(&machine);
    registry
        .register(
            "update.status",
            Arc::new(move |_ctx: &RequestContext, _params: Value| {
                let machine = Arc::clone(&status_machine);
                async move { Ok(machine.get_status().await) }
            }),
        )
        .expect("update.status registered exactly once at startup");

    let check_machine = Arc::clone(&machine);
    registry
        .register(
            "update.check",
            Arc::new(move |_ctx: &RequestContext, params: Value| {
                let machine = Arc::clone(&check_machine);
                async move {
                    let channel = params.get("channel").and_then(Value::as_str);
                    let available = machine.check_for_updates(channel).await?;
                    Ok(json!({ "available_version": available }))
                }
            }),
        )
        .expect("update.check registered exactly once at startup");

    let run_machine = Arc::clone(&machine);
    registry
        .register(
            "update.run",
            Arc::new(move |_ctx: &RequestContext, params: Value| {
                let machine = Arc::clone(&run_machine);
                async move {
                    let channel = params.get("channel").and_then(Value::as_str);
                    let target_version = params.get("target_version").and_then(Value::as_str);
                    let auto_rollback = params.get("auto_rollback").and_then(Value::as_bool).unwrap_or(true);
                    let result = machine.run_full_update(channel, target_version, auto_rollback).await;
                    Ok(json!(result))
                }
            }),
        )
        .expect("update.run registered exactly once at startup");

    registry
        .register(
            "update.rollback",
            Arc::new(move |_ctx: &RequestContext, _params: Value| {
                let machine = Arc::clone(&machine);
                async move {
                    machine.trigger_rollback().await?;
                    Ok(json!({ "status": "rolled_back" }))
                }
            }),
        )
        .expect("update.rollback registered exactly once at startup");
}

/// Forwards a named Agent operation through the IPC client, exposed under
/// the Broker's `agent.*` namespace so callers never talk to the Agent
/// socket directly.
fn register_agent_forwarding_tools(registry: &mut ToolRegistry, client: Arc<IpcClient>) {
    for operation in ["ping", "echo", "get_info"] {
        let client = Arc::clone(&client);
        registry
            .register(
                format!("agent.{operation}"),
                Arc::new(move |_ctx: &RequestContext, params: Value| {
                    let client = Arc::clone(&client);
                    async move { client.call(operation, params).await }
                }),
            )
            .unwrap_or_else(|e| panic!("failed to register agent.{operation}: {e}"));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let cli = CliOverrides {
        data_dir: args.data_dir,
        log: args.log,
        socket_path: args.socket_path,
    };
    let config = AppConfig::load(&cli).context("failed to resolve configuration")?;

    let _log_guard = ops_agent::init_logging(&config.log, config.log_file.as_deref());

    let machine_id = ops_agent::identity::machine_id().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to derive machine identity, continuing without it");
        "unknown".to_string()
    });
    info!(machine_id, "starting broker");

    let audit = AuditLogger::new(config.audit_log_path.clone());
    let auth = build_auth_pipeline(&config)?;
    let permissions = build_permission_table(&config);

    let ipc_client = Arc::new(IpcClient::new(config.agent_socket.path.clone(), Duration::from_secs(10)));

    let metrics_store = build_metrics_store(&config).await?;
    let sampler = MetricsSampler::new(Arc::clone(&metrics_store), config.metrics.sampler_interval_seconds, config.metrics.retention_seconds.max(0) as u64);
    sampler.start().await;

    let mut health_checker = HealthChecker::new(config.update.binary_name.clone(), "ops-broker", config.agent_socket.path.clone()).with_ipc_client(Arc::clone(&ipc_client));
    if let Some(url) = config.update.health_url.clone() {
        health_checker = health_checker.with_http_base_url(url);
    }

    let update_machine = Arc::new({
        let releases_dir = config.update.releases_dir.clone();
        let current_symlink = releases_dir.join("current");
        let state_file = config.data_dir.join("update-state.json");
        let history_path = config.data_dir.join("update-history.json");
        let mut machine = UpdateStateMachine::new(releases_dir, current_symlink, state_file, history_path).with_health_checker(health_checker);
        if !config.update.repo.is_empty() {
            if let Ok(backend) = GitHubReleasesBackend::new(config.update.repo.clone(), config.update.binary_name.clone(), config.update.staging_root.clone()) {
                machine = machine.with_backend(Arc::new(backend));
            } else {
                warn!("failed to construct update backend; update.* tools will report failed_precondition until configured");
            }
        }
        machine
    });

    let mut registry = ToolRegistry::new();
    dispatcher::register_reserved_tools(&mut registry);
    register_metrics_tools(&mut registry, Arc::clone(&metrics_store));
    register_update_tools(&mut registry, Arc::clone(&update_machine));
    register_agent_forwarding_tools(&mut registry, Arc::clone(&ipc_client));

    let dispatcher = Dispatcher::new(Arc::new(registry), auth, permissions, Arc::clone(&audit));

    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();
    let headers = AuthHeaders::new();

    info!("broker ready, reading JSON-RPC requests from stdin");
    while let Some(line) = lines.next_line().await.context("failed to read from stdin")? {
        if let Some(response) = dispatcher.dispatch_line(&line, &headers).await {
            let mut serialized = serde_json::to_string(&response).context("failed to serialize response")?;
            serialized.push('\n');
            stdout.write_all(serialized.as_bytes()).await.context("failed to write response to stdout")?;
            stdout.flush().await.context("failed to flush stdout")?;
        }
    }

    sampler.stop().await;
    info!("broker shutting down, stdin closed");
    Ok(())
}
