//! Atomic directory and symlink primitives for version management. The
//! critical invariant: `current` is switched with temp-symlink-then-rename,
//! so a reader never observes a broken or half-updated link.

use crate::error::TypedError;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

pub fn ensure_directory(path: &Path) -> Result<(), TypedError> {
    std::fs::create_dir_all(path).map_err(|e| {
        TypedError::failed_precondition(format!("failed to create directory: {e}"))
            .with_detail("path", path.display().to_string())
    })
}

/// Best-effort recursive removal. Missing paths are a no-op, not an error.
pub fn safe_remove_directory(path: &Path) -> bool {
    if !path.exists() {
        return false;
    }
    match std::fs::remove_dir_all(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed directory");
            true
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "failed to remove directory, ignoring");
            false
        }
    }
}

/// Atomically points `symlink_path` at `target` using the
/// temp-symlink-then-rename pattern: up to 10 attempts to carve out a
/// unique temp name in the same directory (so the rename stays on one
/// filesystem), then a single atomic rename over the final path. On any
/// rename failure the temp symlink is cleaned up and `current` is left
/// untouched.
#[cfg(unix)]
pub fn atomic_symlink_switch(target: &Path, symlink_path: &Path) -> Result<(), TypedError> {
    if !target.exists() {
        return Err(TypedError::failed_precondition(format!(
            "symlink target does not exist: {}",
            target.display()
        ))
        .with_detail("target", target.display().to_string()));
    }

    let parent = symlink_path.parent().ok_or_else(|| {
        TypedError::internal("symlink path has no parent directory")
    })?;
    ensure_directory(parent)?;

    let temp_path = create_unique_temp_symlink(parent, target)?;

    match std::fs::rename(&temp_path, symlink_path) {
        Ok(()) => {
            info!(
                symlink = %symlink_path.display(),
                target = %target.display(),
                "atomic symlink switch completed"
            );
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::remove_file(&temp_path);
            Err(TypedError::internal(format!("failed to switch symlink atomically: {e}"))
                .with_detail("symlink", symlink_path.display().to_string())
                .with_detail("target", target.display().to_string()))
        }
    }
}

#[cfg(unix)]
fn create_unique_temp_symlink(parent: &Path, target: &Path) -> Result<PathBuf, TypedError> {
    for _ in 0..10 {
        let temp_name = format!(".symlink_tmp_{}", Uuid::new_v4());
        let temp_path = parent.join(temp_name);
        if temp_path.exists() || temp_path.symlink_metadata().is_ok() {
            continue;
        }
        match std::os::unix::fs::symlink(target, &temp_path) {
            Ok(()) => return Ok(temp_path),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(TypedError::internal(format!(
                    "failed to create temporary symlink: {e}"
                )))
            }
        }
    }
    Err(TypedError::internal(
        "failed to create a unique temporary symlink path after 10 attempts",
    )
    .with_detail("symlink", parent.display().to_string()))
}

/// Reads the fully resolved target of `symlink_path`, or `None` if it isn't
/// a symlink or can't be resolved.
pub fn get_symlink_target(symlink_path: &Path) -> Option<PathBuf> {
    let metadata = symlink_path.symlink_metadata().ok()?;
    if !metadata.file_type().is_symlink() {
        return None;
    }
    std::fs::canonicalize(symlink_path).ok()
}

pub fn create_version_directory(releases_dir: &Path, version: &str) -> Result<PathBuf, TypedError> {
    let version_dir = releases_dir.join(format!("v{version}"));
    ensure_directory(&version_dir)?;
    Ok(version_dir)
}

pub fn get_version_directory(releases_dir: &Path, version: &str) -> Option<PathBuf> {
    let version_dir = releases_dir.join(format!("v{version}"));
    if version_dir.is_dir() {
        Some(version_dir)
    } else {
        None
    }
}

/// Installed versions (without the `v` prefix), newest first by mtime.
pub fn list_installed_versions(releases_dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(releases_dir) else {
        return Vec::new();
    };

    let mut version_paths: Vec<(String, PathBuf, std::time::SystemTime)> = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(version) = name.strip_prefix('v') else {
            continue;
        };
        let mtime = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(std::time::UNIX_EPOCH);
        version_paths.push((version.to_string(), path, mtime));
    }

    version_paths.sort_by(|a, b| b.2.cmp(&a.2));
    version_paths.into_iter().map(|(v, _, _)| v).collect()
}

/// Version currently selected by `current`, read directly off the symlink
/// target's directory name (`v1.2.3` → `1.2.3`).
pub fn get_current_version_from_symlink(symlink_path: &Path) -> Option<String> {
    let target = get_symlink_target(symlink_path)?;
    let name = target.file_name()?.to_str()?;
    Some(name.strip_prefix('v').unwrap_or(name).to_string())
}

/// Lays out `releases/`, `releases/v<initial_version>/`, and (optionally)
/// the `current` symlink pointing at it. Used the first time the update
/// subsystem runs against a fresh install.
pub fn initialize_version_structure(
    base_dir: &Path,
    initial_version: &str,
    create_symlink: bool,
) -> Result<(PathBuf, PathBuf), TypedError> {
    let releases_dir = base_dir.join("releases");
    ensure_directory(&releases_dir)?;
    let version_dir = create_version_directory(&releases_dir, initial_version)?;

    if create_symlink {
        let symlink_path = base_dir.join("current");
        atomic_symlink_switch(&version_dir, &symlink_path)?;
    }

    Ok((releases_dir, version_dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn atomic_switch_points_symlink_at_target() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("releases/v1.0.0");
        std::fs::create_dir_all(&target).unwrap();
        let link = dir.path().join("current");

        atomic_symlink_switch(&target, &link).unwrap();

        let resolved = get_symlink_target(&link).unwrap();
        assert_eq!(resolved.file_name().unwrap(), "v1.0.0");
    }

    #[test]
    fn atomic_switch_rejects_missing_target() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("releases/v9.9.9");
        let link = dir.path().join("current");
        let err = atomic_symlink_switch(&target, &link).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::FailedPrecondition);
    }

    #[test]
    fn switch_is_repeatable_and_never_leaves_link_broken() {
        let dir = tempdir().unwrap();
        let v1 = dir.path().join("releases/v1.0.0");
        let v2 = dir.path().join("releases/v2.0.0");
        std::fs::create_dir_all(&v1).unwrap();
        std::fs::create_dir_all(&v2).unwrap();
        let link = dir.path().join("current");

        atomic_symlink_switch(&v1, &link).unwrap();
        assert_eq!(get_symlink_target(&link).unwrap().file_name().unwrap(), "v1.0.0");

        atomic_symlink_switch(&v2, &link).unwrap();
        assert_eq!(get_symlink_target(&link).unwrap().file_name().unwrap(), "v2.0.0");
    }

    #[test]
    fn list_installed_versions_sorts_newest_first() {
        let dir = tempdir().unwrap();
        let releases = dir.path().join("releases");
        std::fs::create_dir_all(releases.join("v1.0.0")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        std::fs::create_dir_all(releases.join("v2.0.0")).unwrap();

        let versions = list_installed_versions(&releases);
        assert_eq!(versions, vec!["2.0.0".to_string(), "1.0.0".to_string()]);
    }

    #[test]
    fn initialize_version_structure_creates_releases_and_symlink() {
        let dir = tempdir().unwrap();
        let (releases_dir, version_dir) =
            initialize_version_structure(dir.path(), "1.0.0", true).unwrap();
        assert!(releases_dir.is_dir());
        assert!(version_dir.is_dir());
        assert_eq!(
            get_current_version_from_symlink(&dir.path().join("current")).unwrap(),
            "1.0.0"
        );
    }
}
