//! Post-update health verification: a composable check list feeding the
//! state machine's `verify` step.

use crate::error::TypedError;
use crate::ipc::IpcClient;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub details: Value,
}

impl HealthCheckResult {
    fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            message: message.into(),
            details: json!({}),
        }
    }

    fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            message: message.into(),
            details: json!({}),
        }
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

pub struct HealthChecker {
    pub service_name: String,
    pub agent_service_name: String,
    pub socket_path: PathBuf,
    pub http_base_url: Option<String>,
    pub ipc_client: Option<Arc<IpcClient>>,
}

impl HealthChecker {
    pub fn new(service_name: impl Into<String>, agent_service_name: impl Into<String>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            service_name: service_name.into(),
            agent_service_name: agent_service_name.into(),
            socket_path: socket_path.into(),
            http_base_url: None,
            ipc_client: None,
        }
    }

    pub fn with_http_base_url(mut self, url: impl Into<String>) -> Self {
        self.http_base_url = Some(url.into());
        self
    }

    pub fn with_ipc_client(mut self, client: Arc<IpcClient>) -> Self {
        self.ipc_client = Some(client);
        self
    }

    /// Queries `systemctl is-active <service>`. Absence of `systemctl`
    /// itself (common off-target, e.g. a dev container) is deliberately a
    /// pass-with-note, not a silent skip: the note surfaces in `message` so
    /// the result is distinguishable from a real health signal.
    pub async fn check_service_running(&self, service: &str) -> HealthCheckResult {
        let name = format!("service_{service}");
        let spawn = Command::new("systemctl")
            .args(["is-active", service])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let child = match spawn {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(service, "systemctl not available, skipping service check");
                return HealthCheckResult::pass(&name, "systemctl not available (test environment)");
            }
            Err(e) => return HealthCheckResult::fail(&name, format!("error checking service: {e}")),
        };

        match timeout(Duration::from_secs(10), child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let status = String::from_utf8_lossy(&output.stdout).trim().to_string();
                let is_active = output.status.success() && status == "active";
                let result = HealthCheckResult {
                    name: name.clone(),
                    passed: is_active,
                    message: format!("service {service} is {status}"),
                    details: json!({ "status": status, "returncode": output.status.code() }),
                };
                if !is_active {
                    warn!(service, status, "service is not running");
                }
                result
            }
            Ok(Err(e)) => HealthCheckResult::fail(&name, format!("error checking service: {e}")),
            Err(_) => HealthCheckResult::fail(&name, format!("timeout checking service {service}")),
        }
    }

    pub async fn check_socket_exists(&self) -> HealthCheckResult {
        let path = &self.socket_path;
        if !path.exists() {
            return HealthCheckResult::fail(
                "ipc_socket",
                format!("IPC socket not found at {}", path.display()),
            );
        }
        if is_socket(path) {
            HealthCheckResult::pass("ipc_socket", format!("IPC socket exists at {}", path.display()))
        } else {
            HealthCheckResult::fail(
                "ipc_socket",
                format!("path exists but is not a socket: {}", path.display()),
            )
        }
    }

    pub async fn check_http_health(&self) -> HealthCheckResult {
        let Some(base_url) = &self.http_base_url else {
            return HealthCheckResult::pass("http_health", "no HTTP health endpoint configured (skipping)");
        };
        let url = format!("{base_url}/health");
        let client = match reqwest::Client::builder().timeout(Duration::from_secs(5)).build() {
            Ok(c) => c,
            Err(e) => return HealthCheckResult::fail("http_health", format!("failed to build HTTP client: {e}")),
        };
        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                HealthCheckResult::pass("http_health", format!("HTTP health check passed at {url}"))
                    .with_details(json!({ "status_code": response.status().as_u16() }))
            }
            Ok(response) => {
                HealthCheckResult::fail("http_health", format!("HTTP health check returned {}", response.status()))
                    .with_details(json!({ "status_code": response.status().as_u16() }))
            }
            Err(e) => HealthCheckResult::fail("http_health", format!("HTTP health check failed: {e}")),
        }
    }

    pub async fn check_basic_tool_call(&self) -> HealthCheckResult {
        let Some(client) = &self.ipc_client else {
            return HealthCheckResult::pass("tool_call", "no IPC client configured (skipping)");
        };
        match timeout(Duration::from_secs(10), client.call("get_info", Value::Null)).await {
            Ok(Ok(result)) if result.is_object() => {
                HealthCheckResult::pass("tool_call", "basic tool call succeeded")
                    .with_details(json!({ "name": result.get("name").cloned().unwrap_or(Value::Null) }))
            }
            Ok(Ok(_)) => HealthCheckResult::fail("tool_call", "unexpected tool call response"),
            Ok(Err(e)) => HealthCheckResult::fail("tool_call", format!("tool call failed: {e}")),
            Err(_) => HealthCheckResult::fail("tool_call", "tool call timed out"),
        }
    }

    pub async fn run_all_checks(&self, skip_http: bool, skip_tool_call: bool) -> Vec<HealthCheckResult> {
        let mut results = vec![
            self.check_service_running(&self.service_name).await,
            self.check_service_running(&self.agent_service_name).await,
            self.check_socket_exists().await,
        ];
        if !skip_http {
            results.push(self.check_http_health().await);
        }
        if !skip_tool_call {
            results.push(self.check_basic_tool_call().await);
        }
        results
    }

    /// Runs the default health gate: service check only. Returns `Ok(true)`
    /// when it passes, `failed_precondition` with the failing checks'
    /// details otherwise.
    pub async fn run_health_check(&self) -> Result<bool, TypedError> {
        let results = self.run_all_checks(true, true).await;
        let required = format!("service_{}", self.service_name);
        let failed: Vec<&HealthCheckResult> = results.iter().filter(|r| r.name == required && !r.passed).collect();
        if failed.is_empty() {
            return Ok(true);
        }
        let messages: Vec<String> = failed.iter().map(|r| format!("{}: {}", r.name, r.message)).collect();
        Err(TypedError::failed_precondition(format!("health checks failed: {}", messages.join("; ")))
            .with_detail(
                "failed_checks",
                json!(failed.iter().map(|r| json!({"name": r.name, "passed": r.passed, "message": r.message})).collect::<Vec<_>>()),
            ))
    }
}

#[cfg(unix)]
fn is_socket(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(path).map(|m| m.file_type().is_socket()).unwrap_or(false)
}

#[cfg(not(unix))]
fn is_socket(_path: &Path) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn socket_check_fails_when_path_missing() {
        let checker = HealthChecker::new("svc", "agent-svc", "/nonexistent/agent.sock");
        let result = checker.check_socket_exists().await;
        assert!(!result.passed);
    }

    #[tokio::test]
    async fn missing_systemctl_is_explicit_pass_with_note() {
        // In any sandboxed test environment without systemd, `systemctl`
        // is absent, so this exercises the explicit pass-with-note branch
        // rather than silently treating the service as healthy.
        let checker = HealthChecker::new("nonexistent-service", "nonexistent-agent", "/tmp/x.sock");
        let result = checker.check_service_running("nonexistent-service").await;
        if !result.passed {
            // systemctl present but service genuinely inactive is also valid
            // in environments where systemd exists; both outcomes are
            // acceptable here, the point is the call never panics.
            assert!(result.message.contains("is") || result.message.contains("systemctl"));
        }
    }

    #[tokio::test]
    async fn http_check_skips_cleanly_without_a_configured_endpoint() {
        let checker = HealthChecker::new("svc", "agent-svc", "/tmp/x.sock");
        let result = checker.check_http_health().await;
        assert!(result.passed);
    }

    #[tokio::test]
    async fn tool_call_check_skips_cleanly_without_a_configured_client() {
        let checker = HealthChecker::new("svc", "agent-svc", "/tmp/x.sock");
        let result = checker.check_basic_tool_call().await;
        assert!(result.passed);
    }
}
