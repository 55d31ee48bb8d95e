//! Rollback primitives and the higher-level `RollbackManager` convenience
//! surface, both built over [`super::operations::atomic_symlink_switch`].

use crate::error::TypedError;
use crate::update::operations::{
    atomic_symlink_switch, get_current_version_from_symlink, get_version_directory, list_installed_versions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// On-disk version record: tracks at minimum the active and the
/// immediately-previous version, so a rollback is symmetric with a forward
/// update from the history's point of view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionHistory {
    pub current: Option<String>,
    pub previous: Option<String>,
}

impl VersionHistory {
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "corrupt version history, starting empty");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Write-temp-then-rename, matching the update state file's persistence
    /// invariant: the file is always either absent or a complete valid record.
    pub fn save(&self, path: &Path) -> Result<(), TypedError> {
        let body = serde_json::to_string_pretty(self)
            .map_err(|e| TypedError::internal(format!("failed to serialize version history: {e}")))?;
        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, body)
            .map_err(|e| TypedError::internal(format!("failed to write version history: {e}")))?;
        std::fs::rename(&temp_path, path)
            .map_err(|e| TypedError::internal(format!("failed to persist version history: {e}")))?;
        Ok(())
    }

    /// Records a forward update: `new_version` becomes `current`, whatever
    /// was `current` becomes `previous`.
    pub fn record_update(&mut self, new_version: &str) {
        self.previous = self.current.take();
        self.current = Some(new_version.to_string());
    }

    /// A rollback is symmetric with a forward update: the rollback target
    /// becomes `current`, the version rolled back *from* becomes `previous`.
    pub fn record_rollback(&mut self, target_version: &str) {
        self.previous = self.current.take();
        self.current = Some(target_version.to_string());
    }
}

/// Switches `current` onto `previous_version` and returns without touching
/// any version history — callers that track history call
/// [`VersionHistory::record_rollback`] themselves afterward.
pub fn perform_rollback(
    previous_version: &str,
    releases_dir: &Path,
    current_symlink: &Path,
) -> Result<(), TypedError> {
    info!(version = previous_version, "starting rollback");

    let version_dir = get_version_directory(releases_dir, previous_version)
        .or_else(|| {
            let candidate = releases_dir.join(format!("v{previous_version}"));
            candidate.exists().then_some(candidate)
        })
        .ok_or_else(|| {
            TypedError::failed_precondition(format!(
                "previous version directory not found: {}",
                releases_dir.join(format!("v{previous_version}")).display()
            ))
            .with_detail("previous_version", previous_version)
            .with_detail("releases_dir", releases_dir.display().to_string())
        })?;

    atomic_symlink_switch(&version_dir, current_symlink).map_err(|e| {
        error!(version = previous_version, error = %e, "rollback failed");
        TypedError::internal(format!("rollback to {previous_version} failed: {}", e.message))
            .with_detail("previous_version", previous_version)
    })?;

    info!(version = previous_version, "rollback completed");
    Ok(())
}

/// Priority: the recorded `previous` version, then the most recently
/// installed version on disk that isn't the current one.
pub fn get_rollback_target(history: &VersionHistory, releases_dir: &Path, current_symlink: &Path) -> Option<String> {
    if let Some(previous) = &history.previous {
        return Some(previous.clone());
    }
    let current = get_current_version_from_symlink(current_symlink);
    list_installed_versions(releases_dir)
        .into_iter()
        .find(|v| Some(v) != current.as_ref())
}

pub fn can_rollback(history: &VersionHistory, releases_dir: &Path, current_symlink: &Path) -> bool {
    get_rollback_target(history, releases_dir, current_symlink).is_some()
}

/// Higher-level surface over the bare `perform_rollback` primitive: resolves
/// targets, persists version history, and exposes the convenience
/// compositions the state machine and admin tools call directly.
pub struct RollbackManager {
    releases_dir: PathBuf,
    current_symlink: PathBuf,
    history_path: PathBuf,
}

impl RollbackManager {
    pub fn new(releases_dir: impl Into<PathBuf>, current_symlink: impl Into<PathBuf>, history_path: impl Into<PathBuf>) -> Self {
        Self {
            releases_dir: releases_dir.into(),
            current_symlink: current_symlink.into(),
            history_path: history_path.into(),
        }
    }

    fn load_history(&self) -> VersionHistory {
        VersionHistory::load(&self.history_path)
    }

    pub fn get_current_version(&self) -> Option<String> {
        get_current_version_from_symlink(&self.current_symlink)
    }

    pub fn get_available_versions(&self) -> Vec<String> {
        list_installed_versions(&self.releases_dir)
    }

    pub fn get_rollback_target(&self) -> Option<String> {
        let history = self.load_history();
        get_rollback_target(&history, &self.releases_dir, &self.current_symlink)
    }

    pub fn can_rollback(&self) -> bool {
        self.get_rollback_target().is_some()
    }

    pub fn rollback_to_previous(&self) -> Result<String, TypedError> {
        let target = self.get_rollback_target().ok_or_else(|| {
            TypedError::failed_precondition("no previous version available for rollback")
                .with_detail("hint", "no rollback target found in version history or releases")
        })?;
        self.rollback_to_version(&target)
    }

    pub fn rollback_to_version(&self, target_version: &str) -> Result<String, TypedError> {
        let available = self.get_available_versions();
        if !available.iter().any(|v| v == target_version) {
            return Err(TypedError::failed_precondition(format!("version {target_version} is not installed"))
                .with_detail("target_version", target_version)
                .with_detail("available_versions", serde_json::json!(available)));
        }

        perform_rollback(target_version, &self.releases_dir, &self.current_symlink)?;

        let mut history = self.load_history();
        history.record_rollback(target_version);
        history.save(&self.history_path)?;

        Ok(target_version.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn install(releases_dir: &Path, version: &str) {
        std::fs::create_dir_all(releases_dir.join(format!("v{version}"))).unwrap();
    }

    #[test]
    fn rollback_manager_prefers_recorded_previous_version() {
        let dir = tempdir().unwrap();
        let releases = dir.path().join("releases");
        install(&releases, "1.0.0");
        install(&releases, "2.0.0");
        let current_symlink = dir.path().join("current");
        atomic_symlink_switch(&releases.join("v2.0.0"), &current_symlink).unwrap();
        let history_path = dir.path().join("update_state.json");

        let mut history = VersionHistory::default();
        history.record_update("2.0.0");
        history.save(&history_path).unwrap();

        let manager = RollbackManager::new(&releases, &current_symlink, &history_path);
        assert_eq!(manager.get_rollback_target(), Some("1.0.0".to_string()));
    }

    #[test]
    fn rollback_to_version_rejects_uninstalled_target() {
        let dir = tempdir().unwrap();
        let releases = dir.path().join("releases");
        install(&releases, "1.0.0");
        let current_symlink = dir.path().join("current");
        atomic_symlink_switch(&releases.join("v1.0.0"), &current_symlink).unwrap();
        let history_path = dir.path().join("update_state.json");

        let manager = RollbackManager::new(&releases, &current_symlink, &history_path);
        let err = manager.rollback_to_version("9.9.9").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::FailedPrecondition);
    }

    #[test]
    fn rollback_to_previous_switches_symlink_and_records_history() {
        let dir = tempdir().unwrap();
        let releases = dir.path().join("releases");
        install(&releases, "1.0.0");
        install(&releases, "2.0.0");
        let current_symlink = dir.path().join("current");
        atomic_symlink_switch(&releases.join("v2.0.0"), &current_symlink).unwrap();
        let history_path = dir.path().join("update_state.json");
        let mut history = VersionHistory::default();
        history.record_update("2.0.0");
        history.save(&history_path).unwrap();

        let manager = RollbackManager::new(&releases, &current_symlink, &history_path);
        let rolled_to = manager.rollback_to_previous().unwrap();
        assert_eq!(rolled_to, "1.0.0");
        assert_eq!(get_current_version_from_symlink(&current_symlink).unwrap(), "1.0.0");

        let reloaded = VersionHistory::load(&history_path);
        assert_eq!(reloaded.current.as_deref(), Some("1.0.0"));
        assert_eq!(reloaded.previous.as_deref(), Some("2.0.0"));
    }

    #[test]
    fn no_rollback_target_is_failed_precondition() {
        let dir = tempdir().unwrap();
        let releases = dir.path().join("releases");
        install(&releases, "1.0.0");
        let current_symlink = dir.path().join("current");
        atomic_symlink_switch(&releases.join("v1.0.0"), &current_symlink).unwrap();
        let history_path = dir.path().join("update_state.json");

        let manager = RollbackManager::new(&releases, &current_symlink, &history_path);
        assert!(!manager.can_rollback());
        let err = manager.rollback_to_previous().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::FailedPrecondition);
    }
}
