//! Orchestrates the full self-update lifecycle: check, prepare, switch,
//! verify, and roll back on failure, with state persisted across restarts.

use crate::error::{ErrorKind, TypedError};
use crate::update::backend::{PreparedUpdate, UpdateBackend};
use crate::update::health::HealthChecker;
use crate::update::operations::{atomic_symlink_switch, get_version_directory};
use crate::update::rollback::{perform_rollback, VersionHistory};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Idle,
    Checking,
    Preparing,
    Switching,
    Verifying,
    Success,
    Failed,
    RollingBack,
}

impl UpdateState {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateState::Idle => "idle",
            UpdateState::Checking => "checking",
            UpdateState::Preparing => "preparing",
            UpdateState::Switching => "switching",
            UpdateState::Verifying => "verifying",
            UpdateState::Success => "success",
            UpdateState::Failed => "failed",
            UpdateState::RollingBack => "rolling_back",
        }
    }

    fn valid_targets(self) -> &'static [UpdateState] {
        match self {
            UpdateState::Idle => &[UpdateState::Checking],
            UpdateState::Checking => &[UpdateState::Preparing, UpdateState::Idle, UpdateState::Failed],
            UpdateState::Preparing => &[UpdateState::Switching, UpdateState::Failed],
            UpdateState::Switching => &[UpdateState::Verifying, UpdateState::Failed],
            UpdateState::Verifying => &[UpdateState::Success, UpdateState::Failed],
            UpdateState::Failed => &[UpdateState::RollingBack, UpdateState::Idle],
            UpdateState::RollingBack => &[UpdateState::Idle],
            UpdateState::Success => &[UpdateState::Idle],
        }
    }
}

/// Persistent record of the in-flight (or last-finished) update, written to
/// disk after every transition so a crash mid-update can be diagnosed on
/// restart rather than silently forgotten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStateData {
    pub state: UpdateState,
    pub target_version: Option<String>,
    pub old_version: Option<String>,
    pub channel: Option<String>,
    pub started_at: Option<String>,
    pub last_transition_at: Option<String>,
    pub failure_count: u32,
    pub error_message: Option<String>,
    pub progress_percent: Option<f64>,
}

impl Default for UpdateStateData {
    fn default() -> Self {
        Self {
            state: UpdateState::Idle,
            target_version: None,
            old_version: None,
            channel: None,
            started_at: None,
            last_transition_at: None,
            failure_count: 0,
            error_message: None,
            progress_percent: None,
        }
    }
}

impl UpdateStateData {
    pub fn to_status(&self) -> Value {
        json!({
            "state": self.state.as_str(),
            "target_version": self.target_version,
            "old_version": self.old_version,
            "channel": self.channel,
            "started_at": self.started_at,
            "last_transition_at": self.last_transition_at,
            "progress_percent": self.progress_percent,
            "failure_count": self.failure_count,
            "error_message": self.error_message,
        })
    }
}

/// Outcome of [`UpdateStateMachine::run_full_update`].
#[derive(Debug, Clone, Serialize)]
pub struct UpdateResult {
    pub status: String,
    pub old_version: Option<String>,
    pub new_version: Option<String>,
    pub message: String,
}

const HEALTH_CHECK_RETRIES: u32 = 3;
const HEALTH_CHECK_DELAY_SECONDS: u64 = 5;
const SERVICE_START_WAIT_SECONDS: u64 = 10;

/// Runs the update lifecycle for one service. State is serialized behind a
/// mutex: only one update may be in flight at a time, which is also the
/// invariant the state machine itself enforces through its transition table.
pub struct UpdateStateMachine {
    backend: Option<Arc<dyn UpdateBackend>>,
    health_checker: Option<HealthChecker>,
    releases_dir: PathBuf,
    current_symlink: PathBuf,
    state_file: PathBuf,
    history_path: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    data: UpdateStateData,
    prepared: Option<PreparedUpdate>,
}

impl UpdateStateMachine {
    pub fn new(releases_dir: impl Into<PathBuf>, current_symlink: impl Into<PathBuf>, state_file: impl Into<PathBuf>, history_path: impl Into<PathBuf>) -> Self {
        let state_file = state_file.into();
        let data = Self::load_state(&state_file);
        Self {
            backend: None,
            health_checker: None,
            releases_dir: releases_dir.into(),
            current_symlink: current_symlink.into(),
            state_file,
            history_path: history_path.into(),
            inner: Mutex::new(Inner { data, prepared: None }),
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn UpdateBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_health_checker(mut self, checker: HealthChecker) -> Self {
        self.health_checker = Some(checker);
        self
    }

    fn load_state(path: &Path) -> UpdateStateData {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "corrupt update state, starting from idle");
                UpdateStateData::default()
            }),
            Err(_) => UpdateStateData::default(),
        }
    }

    fn save_state(data: &UpdateStateData, path: &Path) {
        let Ok(body) = serde_json::to_string_pretty(data) else {
            warn!("failed to serialize update state");
            return;
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(error = %e, "failed to create update state directory");
                return;
            }
        }
        let temp_path = path.with_extension("json.tmp");
        if let Err(e) = std::fs::write(&temp_path, body) {
            warn!(error = %e, "failed to write update state");
            return;
        }
        if let Err(e) = std::fs::rename(&temp_path, path) {
            warn!(error = %e, "failed to persist update state");
        }
    }

    fn clear_state(&self, inner: &mut Inner) {
        inner.data = UpdateStateData::default();
        inner.prepared = None;
        let _ = std::fs::remove_file(&self.state_file);
    }

    /// Validates and performs a transition, persisting the result. Holds the
    /// lock across the check-then-write so no concurrent caller can observe
    /// (or create) an invalid intermediate state.
    fn transition(&self, inner: &mut Inner, new_state: UpdateState, error_message: Option<&str>, progress_percent: Option<f64>) -> Result<(), TypedError> {
        let current = inner.data.state;
        if !current.valid_targets().contains(&new_state) {
            return Err(TypedError::invalid_argument(format!(
                "invalid state transition from {} to {}",
                current.as_str(),
                new_state.as_str()
            ))
            .with_detail("current_state", current.as_str())
            .with_detail("target_state", new_state.as_str())
            .with_detail(
                "valid_transitions",
                json!(current.valid_targets().iter().map(|s| s.as_str()).collect::<Vec<_>>()),
            ));
        }

        info!(from = current.as_str(), to = new_state.as_str(), "update state transition");
        inner.data.state = new_state;
        inner.data.last_transition_at = Some(Utc::now().to_rfc3339());
        if let Some(msg) = error_message {
            inner.data.error_message = Some(msg.to_string());
        }
        if let Some(pct) = progress_percent {
            inner.data.progress_percent = Some(pct);
        }
        Self::save_state(&inner.data, &self.state_file);
        Ok(())
    }

    pub async fn state(&self) -> UpdateState {
        self.inner.lock().await.data.state
    }

    pub async fn get_status(&self) -> Value {
        self.inner.lock().await.data.to_status()
    }

    /// Resets to idle unconditionally. Intended for manual recovery when the
    /// machine is stuck, not part of the ordinary transition graph.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        info!("resetting update state machine to idle");
        self.clear_state(&mut inner);
        Self::save_state(&inner.data, &self.state_file);
    }

    pub async fn check_for_updates(&self, channel: Option<&str>) -> Result<Option<String>, TypedError> {
        let mut inner = self.inner.lock().await;
        if inner.data.state != UpdateState::Idle {
            return Err(TypedError::failed_precondition(format!(
                "cannot check for updates while in {} state",
                inner.data.state.as_str()
            ))
            .with_detail("current_state", inner.data.state.as_str()));
        }
        let backend = self
            .backend
            .clone()
            .ok_or_else(|| TypedError::failed_precondition("update backend not configured"))?;

        inner.data.channel = channel.map(str::to_string);
        inner.data.started_at = Some(Utc::now().to_rfc3339());
        self.transition(&mut inner, UpdateState::Checking, None, Some(0.0))?;
        drop(inner);

        match backend.check_for_updates(channel).await {
            Ok(None) => {
                info!("no updates available");
                let mut inner = self.inner.lock().await;
                self.transition(&mut inner, UpdateState::Idle, None, None)?;
                self.clear_state(&mut inner);
                Ok(None)
            }
            Ok(Some(latest)) => {
                let mut inner = self.inner.lock().await;
                inner.data.target_version = Some(latest.clone());
                info!(old = ?inner.data.old_version, new = %latest, "update available");
                Ok(Some(latest))
            }
            Err(e) => {
                let mut inner = self.inner.lock().await;
                let message = format!("failed to check for updates: {}", e.message);
                self.transition(&mut inner, UpdateState::Failed, Some(&message), None)?;
                Err(e)
            }
        }
    }

    pub async fn prepare_update(&self, target_version: Option<&str>) -> Result<PreparedUpdate, TypedError> {
        let mut inner = self.inner.lock().await;
        if inner.data.state != UpdateState::Checking {
            return Err(TypedError::failed_precondition(format!(
                "cannot prepare update while in {} state",
                inner.data.state.as_str()
            ))
            .with_detail("current_state", inner.data.state.as_str())
            .with_detail("expected_state", UpdateState::Checking.as_str()));
        }
        let backend = self
            .backend
            .clone()
            .ok_or_else(|| TypedError::failed_precondition("update backend not configured"))?;

        let target = target_version
            .map(str::to_string)
            .or_else(|| inner.data.target_version.clone())
            .ok_or_else(|| {
                TypedError::invalid_argument("no target version specified")
                    .with_detail("hint", "run check_for_updates first or specify target_version")
            })?;

        let channel = inner.data.channel.clone();
        self.transition(&mut inner, UpdateState::Preparing, None, Some(10.0))?;
        drop(inner);

        match backend.prepare(channel.as_deref(), Some(&target)).await {
            Ok(prepared) => {
                let mut inner = self.inner.lock().await;
                inner.data.target_version = Some(prepared.target_version.clone());
                inner.data.progress_percent = Some(50.0);
                Self::save_state(&inner.data, &self.state_file);
                info!(version = %prepared.target_version, "update prepared");
                inner.prepared = Some(prepared.clone());
                Ok(prepared)
            }
            Err(e) => {
                let mut inner = self.inner.lock().await;
                let message = format!("failed to prepare update: {}", e.message);
                self.transition(&mut inner, UpdateState::Failed, Some(&message), None)?;
                Err(e)
            }
        }
    }

    pub async fn apply_update(&self) -> Result<(), TypedError> {
        let mut inner = self.inner.lock().await;
        if inner.data.state != UpdateState::Preparing {
            return Err(TypedError::failed_precondition(format!(
                "cannot apply update while in {} state",
                inner.data.state.as_str()
            ))
            .with_detail("current_state", inner.data.state.as_str()));
        }
        let prepared = inner
            .prepared
            .clone()
            .ok_or_else(|| TypedError::failed_precondition("no update has been prepared").with_detail("hint", "run prepare_update first"))?;
        let backend = self
            .backend
            .clone()
            .ok_or_else(|| TypedError::failed_precondition("update backend not configured"))?;

        self.transition(&mut inner, UpdateState::Switching, None, Some(60.0))?;
        drop(inner);

        let result: Result<(), TypedError> = async {
            backend.apply(&prepared, &self.releases_dir).await?;

            let version_dir = get_version_directory(&self.releases_dir, &prepared.target_version)
                .unwrap_or_else(|| self.releases_dir.join(format!("v{}", prepared.target_version)));
            if !version_dir.is_dir() {
                return Err(TypedError::failed_precondition(format!("version directory does not exist: {}", version_dir.display()))
                    .with_detail("version", prepared.target_version.clone())
                    .with_detail("path", version_dir.display().to_string()));
            }

            atomic_symlink_switch(&version_dir, &self.current_symlink)?;
            info!(version = %prepared.target_version, path = %version_dir.display(), "update applied");
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                let mut inner = self.inner.lock().await;
                inner.data.progress_percent = Some(70.0);
                Self::save_state(&inner.data, &self.state_file);
                Ok(())
            }
            Err(e) => {
                let mut inner = self.inner.lock().await;
                let message = format!("failed to apply update: {}", e.message);
                self.transition(&mut inner, UpdateState::Failed, Some(&message), None)?;
                Err(e)
            }
        }
    }

    pub async fn verify_update(&self) -> Result<bool, TypedError> {
        let mut inner = self.inner.lock().await;
        if inner.data.state != UpdateState::Switching {
            return Err(TypedError::failed_precondition(format!(
                "cannot verify update while in {} state",
                inner.data.state.as_str()
            ))
            .with_detail("current_state", inner.data.state.as_str()));
        }
        self.transition(&mut inner, UpdateState::Verifying, None, Some(80.0))?;
        drop(inner);

        info!(seconds = SERVICE_START_WAIT_SECONDS, "waiting for service to start");
        sleep(Duration::from_secs(SERVICE_START_WAIT_SECONDS)).await;

        let mut success = false;
        for attempt in 1..=HEALTH_CHECK_RETRIES {
            let outcome = match &self.health_checker {
                Some(checker) => checker.run_health_check().await,
                None => Ok(true),
            };
            match outcome {
                Ok(_) => {
                    success = true;
                    let mut inner = self.inner.lock().await;
                    inner.data.failure_count = 0;
                    break;
                }
                Err(e) => {
                    let mut inner = self.inner.lock().await;
                    inner.data.failure_count += 1;
                    warn!(attempt, of = HEALTH_CHECK_RETRIES, error = %e, "health check attempt failed");
                    drop(inner);
                    if attempt < HEALTH_CHECK_RETRIES {
                        sleep(Duration::from_secs(HEALTH_CHECK_DELAY_SECONDS)).await;
                    }
                }
            }
        }

        let mut inner = self.inner.lock().await;
        if success {
            self.transition(&mut inner, UpdateState::Success, None, Some(100.0))?;

            if let Some(target) = inner.data.target_version.clone() {
                let mut history = VersionHistory::load(&self.history_path);
                history.record_update(&target);
                if let Err(e) = history.save(&self.history_path) {
                    warn!(error = %e, "failed to update version history");
                }
            }
            Ok(true)
        } else {
            let message = format!("health checks failed after {HEALTH_CHECK_RETRIES} attempts");
            self.transition(&mut inner, UpdateState::Failed, Some(&message), None)?;
            Ok(false)
        }
    }

    /// Rolls back to `old_version`, reachable from `failed` (the normal
    /// path) or directly from `verifying` (an operator aborting a
    /// still-running verification).
    pub async fn trigger_rollback(&self) -> Result<(), TypedError> {
        let mut inner = self.inner.lock().await;
        if inner.data.state != UpdateState::Failed && inner.data.state != UpdateState::Verifying {
            return Err(TypedError::failed_precondition(format!("cannot rollback while in {} state", inner.data.state.as_str()))
                .with_detail("current_state", inner.data.state.as_str())
                .with_detail("valid_states", json!([UpdateState::Failed.as_str(), UpdateState::Verifying.as_str()])));
        }

        let mut previous_version = inner.data.old_version.clone();
        if previous_version.is_none() {
            previous_version = VersionHistory::load(&self.history_path).previous;
        }
        let previous_version = previous_version.ok_or_else(|| {
            TypedError::failed_precondition("no previous version available for rollback")
                .with_detail("hint", "cannot rollback without a previous version")
        })?;

        if inner.data.state == UpdateState::Verifying {
            self.transition(&mut inner, UpdateState::Failed, Some("rollback requested during verification"), None)?;
        }
        self.transition(&mut inner, UpdateState::RollingBack, None, Some(85.0))?;
        drop(inner);

        match perform_rollback(&previous_version, &self.releases_dir, &self.current_symlink) {
            Ok(()) => {
                let mut history = VersionHistory::load(&self.history_path);
                history.record_rollback(&previous_version);
                if let Err(e) = history.save(&self.history_path) {
                    warn!(error = %e, "failed to persist rollback history");
                }
                info!(version = %previous_version, "rollback completed");
                let mut inner = self.inner.lock().await;
                self.transition(&mut inner, UpdateState::Idle, None, None)?;
                self.clear_state(&mut inner);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "rollback failed");
                let mut inner = self.inner.lock().await;
                inner.data.error_message = Some(format!("rollback failed: {}", e.message));
                // Return to idle even on failure: a stuck rolling_back state
                // would otherwise block every future update attempt.
                self.transition(&mut inner, UpdateState::Idle, None, None)?;
                Err(TypedError::internal(format!("rollback failed: {}", e.message)))
            }
        }
    }

    pub async fn complete_update(&self) -> Result<(), TypedError> {
        let mut inner = self.inner.lock().await;
        if inner.data.state != UpdateState::Success {
            return Err(TypedError::failed_precondition(format!("cannot complete update while in {} state", inner.data.state.as_str()))
                .with_detail("current_state", inner.data.state.as_str())
                .with_detail("expected_state", UpdateState::Success.as_str()));
        }

        if let (Some(backend), Some(prepared)) = (&self.backend, &inner.prepared) {
            backend.cleanup_staging(prepared).await;
        }

        self.transition(&mut inner, UpdateState::Idle, None, None)?;
        self.clear_state(&mut inner);
        info!("update completed successfully");
        Ok(())
    }

    /// Runs check → prepare → apply → verify → complete (or rollback) in one
    /// call. The only entry point the update admin tools need for an
    /// unattended update.
    pub async fn run_full_update(&self, channel: Option<&str>, target_version: Option<&str>, auto_rollback: bool) -> UpdateResult {
        let mut result = UpdateResult {
            status: "pending".to_string(),
            old_version: None,
            new_version: None,
            message: String::new(),
        };

        let outcome: Result<(), TypedError> = async {
            let latest = self.check_for_updates(channel).await?;
            result.old_version = self.inner.lock().await.data.old_version.clone();

            if latest.is_none() && target_version.is_none() {
                result.status = "no_update".to_string();
                result.message = "already at latest version".to_string();
                return Ok(());
            }

            if let Some(target) = target_version {
                self.inner.lock().await.data.target_version = Some(target.to_string());
            }
            result.new_version = self.inner.lock().await.data.target_version.clone();

            self.prepare_update(target_version).await?;
            self.apply_update().await?;

            let verified = self.verify_update().await?;
            if verified {
                self.complete_update().await?;
                result.status = "succeeded".to_string();
                result.message = format!("updated to version {}", result.new_version.clone().unwrap_or_default());
            } else if auto_rollback {
                self.trigger_rollback().await?;
                result.status = "failed".to_string();
                result.message = "update failed health checks, rolled back".to_string();
            } else {
                result.status = "failed".to_string();
                result.message = "update failed health checks".to_string();
            }
            Ok(())
        }
        .await;

        if let Err(e) = outcome {
            if result.status == "pending" {
                tracing::error!(error = %e, "update failed");
                result.status = "failed".to_string();
                result.message = e.message.clone();

                let recoverable = matches!(
                    self.state().await,
                    UpdateState::Failed | UpdateState::Switching | UpdateState::Verifying
                );
                if auto_rollback && recoverable {
                    match self.trigger_rollback().await {
                        Ok(()) => result.message.push_str(" (rolled back)"),
                        Err(rollback_error) => result.message.push_str(&format!(" (rollback failed: {rollback_error})")),
                    }
                }
            }
        }

        result
    }
}

pub fn is_recoverable_error(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::Unavailable | ErrorKind::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::backend::PreparedUpdate;
    use async_trait::async_trait;
    use serde_json::Map;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    struct StubBackend {
        next_version: Option<String>,
        fail_prepare: AtomicBool,
    }

    #[async_trait]
    impl UpdateBackend for StubBackend {
        async fn check_for_updates(&self, _channel: Option<&str>) -> Result<Option<String>, TypedError> {
            Ok(self.next_version.clone())
        }

        async fn prepare(&self, _channel: Option<&str>, target_version: Option<&str>) -> Result<PreparedUpdate, TypedError> {
            if self.fail_prepare.load(Ordering::SeqCst) {
                return Err(TypedError::unavailable("stub prepare failure"));
            }
            Ok(PreparedUpdate {
                target_version: target_version.unwrap_or("0.0.0").to_string(),
                channel: None,
                staging_path: None,
                metadata: Map::new(),
            })
        }

        async fn apply(&self, update: &PreparedUpdate, releases_dir: &Path) -> Result<(), TypedError> {
            std::fs::create_dir_all(releases_dir.join(format!("v{}", update.target_version))).unwrap();
            Ok(())
        }

        async fn get_available_versions(&self, _channel: Option<&str>, _limit: usize) -> Result<Vec<String>, TypedError> {
            Ok(vec![])
        }
    }

    fn machine(dir: &Path, backend: StubBackend) -> UpdateStateMachine {
        UpdateStateMachine::new(
            dir.join("releases"),
            dir.join("current"),
            dir.join("update_state.json"),
            dir.join("history.json"),
        )
        .with_backend(Arc::new(backend))
    }

    #[tokio::test]
    async fn full_update_with_no_health_checker_succeeds() {
        let dir = tempdir().unwrap();
        let m = machine(
            dir.path(),
            StubBackend {
                next_version: Some("2.0.0".to_string()),
                fail_prepare: AtomicBool::new(false),
            },
        );

        let result = m.run_full_update(None, None, true).await;
        assert_eq!(result.status, "succeeded");
        assert_eq!(m.state().await, UpdateState::Idle);
    }

    #[tokio::test]
    async fn no_update_available_short_circuits_to_idle() {
        let dir = tempdir().unwrap();
        let m = machine(
            dir.path(),
            StubBackend {
                next_version: None,
                fail_prepare: AtomicBool::new(false),
            },
        );

        let result = m.run_full_update(None, None, true).await;
        assert_eq!(result.status, "no_update");
        assert_eq!(m.state().await, UpdateState::Idle);
    }

    #[tokio::test]
    async fn prepare_failure_rolls_back_when_previous_version_known() {
        let dir = tempdir().unwrap();
        let releases = dir.path().join("releases");
        std::fs::create_dir_all(releases.join("v1.0.0")).unwrap();
        atomic_symlink_switch(&releases.join("v1.0.0"), &dir.path().join("current")).unwrap();
        let mut history = VersionHistory::default();
        history.record_update("1.0.0");
        history.save(&dir.path().join("history.json")).unwrap();

        let m = machine(
            dir.path(),
            StubBackend {
                next_version: Some("2.0.0".to_string()),
                fail_prepare: AtomicBool::new(true),
            },
        );

        let result = m.run_full_update(None, None, true).await;
        assert_eq!(result.status, "failed");
        assert_eq!(m.state().await, UpdateState::Idle);
    }

    #[tokio::test]
    async fn check_for_updates_rejects_non_idle_state() {
        let dir = tempdir().unwrap();
        let m = machine(
            dir.path(),
            StubBackend {
                next_version: Some("2.0.0".to_string()),
                fail_prepare: AtomicBool::new(false),
            },
        );
        m.check_for_updates(None).await.unwrap();
        let err = m.check_for_updates(None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::FailedPrecondition);
    }

    #[test]
    fn invalid_transition_is_rejected() {
        assert!(!UpdateState::Idle.valid_targets().contains(&UpdateState::Success));
        assert!(UpdateState::Idle.valid_targets().contains(&UpdateState::Checking));
    }
}
