//! `ops-agent` — the Privileged Agent binary: binds the local IPC socket and
//! executes hardware/system operations on behalf of the Broker.

use anyhow::{Context, Result};
use clap::Parser;
use ops_agent::config::{AppConfig, CliOverrides};
use ops_agent::dispatcher::registry::ToolRegistry;
use ops_agent::ipc::server::{self, AgentSocketConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "ops-agent", about = "Privileged Agent — hardware/system operations over a local IPC socket", version)]
struct Args {
    /// Data directory for configuration and state.
    #[arg(long, env = "MCP_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "MCP_LOG")]
    log: Option<String>,

    /// Path to the Unix domain socket the Broker connects to.
    #[arg(long, env = "MCP_AGENT_SOCKET")]
    socket_path: Option<PathBuf>,
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
    info!(machine_id, socket = %config.agent_socket.path.display(), "starting agent");

    let mut registry = ToolRegistry::new();
    server::register_reserved_operations(&mut registry);
    let registry = Arc::new(registry);

    let socket_config = AgentSocketConfig {
        path: config.agent_socket.path.clone(),
        owner: config.agent_socket.owner.clone(),
        group: config.agent_socket.group.clone(),
        mode: config.agent_socket.mode,
    };

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    };

    server::run(socket_config, registry, shutdown).await.map_err(|e| anyhow::anyhow!("agent server failed: {}", e.message))
}
