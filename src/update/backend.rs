//! The `UpdateBackend` trait separates "how to obtain an update" from state
//! machine orchestration, plus a GitHub-Releases implementation adapted from
//! the host binary's prior flat self-updater.

use crate::error::TypedError;
use async_trait::async_trait;
use semver::Version;
use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// A staged update ready to be installed by `apply`.
#[derive(Debug, Clone)]
pub struct PreparedUpdate {
    pub target_version: String,
    pub channel: Option<String>,
    pub staging_path: Option<PathBuf>,
    pub metadata: Map<String, Value>,
}

#[async_trait]
pub trait UpdateBackend: Send + Sync {
    /// Latest version in `channel`, or `None` if nothing is published there.
    async fn check_for_updates(&self, channel: Option<&str>) -> Result<Option<String>, TypedError>;

    /// Resolves a target (explicit version wins over channel lookup),
    /// downloads and verifies it into a staging area, and returns the
    /// descriptor `apply` needs.
    async fn prepare(&self, channel: Option<&str>, target_version: Option<&str>) -> Result<PreparedUpdate, TypedError>;

    /// Installs the staged artifact into `releases_dir/v<version>/`. Does
    /// NOT switch `current` or restart anything — that is the state
    /// machine's job.
    async fn apply(&self, update: &PreparedUpdate, releases_dir: &Path) -> Result<(), TypedError>;

    /// Newest-first list of published versions, capped at `limit`.
    async fn get_available_versions(&self, channel: Option<&str>, limit: usize) -> Result<Vec<String>, TypedError>;

    /// Removes the staging directory. Safe to call after both success and
    /// failure; never itself a hard error.
    async fn cleanup_staging(&self, update: &PreparedUpdate) {
        if let Some(path) = &update.staging_path {
            if path.exists() {
                let _ = tokio::fs::remove_dir_all(path).await;
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct GhRelease {
    tag_name: String,
    #[allow(dead_code)]
    html_url: String,
    assets: Vec<GhAsset>,
}

#[derive(Debug, Deserialize)]
struct GhAsset {
    name: String,
    browser_download_url: String,
}

/// Fetches releases from a GitHub `owner/repo`, matches platform-named
/// binary + `.sha256` assets, and stages the verified binary under a
/// per-version staging directory.
pub struct GitHubReleasesBackend {
    repo: String,
    binary_name: String,
    staging_root: PathBuf,
    client: reqwest::Client,
}

impl GitHubReleasesBackend {
    pub fn new(repo: impl Into<String>, binary_name: impl Into<String>, staging_root: impl Into<PathBuf>) -> Result<Self, TypedError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| TypedError::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            repo: repo.into(),
            binary_name: binary_name.into(),
            staging_root: staging_root.into(),
            client,
        })
    }

    async fn fetch_latest_release(&self) -> Result<GhRelease, TypedError> {
        let url = format!("https://api.github.com/repos/{}/releases/latest", self.repo);
        let response = self
            .client
            .get(&url)
            .header("User-Agent", format!("{}/{}", self.binary_name, env!("CARGO_PKG_VERSION")))
            .send()
            .await
            .map_err(|e| TypedError::unavailable(format!("failed to fetch GitHub releases: {e}")))?;
        let response = response
            .error_for_status()
            .map_err(|e| TypedError::unavailable(format!("GitHub API error: {e}")))?;
        response
            .json::<GhRelease>()
            .await
            .map_err(|e| TypedError::unavailable(format!("failed to parse GitHub release JSON: {e}")))
    }
}

#[async_trait]
impl UpdateBackend for GitHubReleasesBackend {
    async fn check_for_updates(&self, _channel: Option<&str>) -> Result<Option<String>, TypedError> {
        let release = self.fetch_latest_release().await?;
        let tag = release.tag_name.trim_start_matches('v').to_string();
        let latest = Version::parse(&tag)
            .map_err(|e| TypedError::internal(format!("invalid release tag semver '{tag}': {e}")))?;
        let current = Version::parse(env!("CARGO_PKG_VERSION"))
            .map_err(|e| TypedError::internal(format!("invalid CARGO_PKG_VERSION: {e}")))?;
        if latest > current {
            Ok(Some(latest.to_string()))
        } else {
            Ok(None)
        }
    }

    async fn prepare(&self, _channel: Option<&str>, target_version: Option<&str>) -> Result<PreparedUpdate, TypedError> {
        let release = self.fetch_latest_release().await?;
        let tag = release.tag_name.trim_start_matches('v').to_string();
        let version = target_version.map(str::to_string).unwrap_or(tag);

        let platform = current_platform();
        debug!(platform, "looking for release asset");

        let binary_asset = release
            .assets
            .iter()
            .find(|a| a.name == format!("{}-{platform}", self.binary_name))
            .ok_or_else(|| {
                TypedError::failed_precondition(format!("no release asset for platform {platform}"))
                    .with_detail("platform", platform)
            })?;
        let checksum_asset = release
            .assets
            .iter()
            .find(|a| a.name == format!("{}-{platform}.sha256", self.binary_name))
            .ok_or_else(|| {
                TypedError::failed_precondition(format!("no checksum asset for platform {platform}"))
                    .with_detail("platform", platform)
            })?;

        let checksum_text = self
            .client
            .get(&checksum_asset.browser_download_url)
            .send()
            .await
            .map_err(|e| TypedError::unavailable(format!("failed to fetch checksum: {e}")))?
            .text()
            .await
            .map_err(|e| TypedError::unavailable(format!("failed to read checksum: {e}")))?;
        let expected_hash = checksum_text.split_whitespace().next().unwrap_or("").to_string();

        let staging_dir = self.staging_root.join(format!("staging-{version}"));
        tokio::fs::create_dir_all(&staging_dir)
            .await
            .map_err(|e| TypedError::failed_precondition(format!("failed to create staging directory: {e}")))?;
        let dest = staging_dir.join(&self.binary_name);

        let mut file = tokio::fs::File::create(&dest)
            .await
            .map_err(|e| TypedError::failed_precondition(format!("failed to create staged binary: {e}")))?;
        let mut response = self
            .client
            .get(&binary_asset.browser_download_url)
            .send()
            .await
            .map_err(|e| TypedError::unavailable(format!("failed to download update: {e}")))?;

        let mut hasher = Sha256::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| TypedError::unavailable(format!("error streaming update download: {e}")))?
        {
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| TypedError::internal(format!("failed to write staged update chunk: {e}")))?;
        }
        file.flush()
            .await
            .map_err(|e| TypedError::internal(format!("failed to flush staged update: {e}")))?;

        let actual_hash = format!("{:x}", hasher.finalize());
        if actual_hash != expected_hash {
            let _ = tokio::fs::remove_dir_all(&staging_dir).await;
            return Err(TypedError::failed_precondition(format!(
                "checksum mismatch: expected {expected_hash}, got {actual_hash}"
            ))
            .with_detail("expected", expected_hash)
            .with_detail("actual", actual_hash));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&dest)
                .map_err(|e| TypedError::internal(format!("failed to stat staged binary: {e}")))?
                .permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&dest, perms)
                .map_err(|e| TypedError::internal(format!("failed to mark staged binary executable: {e}")))?;
        }

        info!(version, path = %dest.display(), "update downloaded and verified");

        Ok(PreparedUpdate {
            target_version: version,
            channel: None,
            staging_path: Some(staging_dir),
            metadata: Map::new(),
        })
    }

    async fn apply(&self, update: &PreparedUpdate, releases_dir: &Path) -> Result<(), TypedError> {
        let staging_path = update
            .staging_path
            .as_ref()
            .ok_or_else(|| TypedError::failed_precondition("prepared update has no staging path"))?;
        let version_dir = releases_dir.join(format!("v{}", update.target_version));
        tokio::fs::create_dir_all(&version_dir)
            .await
            .map_err(|e| TypedError::failed_precondition(format!("failed to create release directory: {e}")))?;

        let staged_binary = staging_path.join(&self.binary_name);
        let installed_binary = version_dir.join(&self.binary_name);
        tokio::fs::copy(&staged_binary, &installed_binary)
            .await
            .map_err(|e| TypedError::internal(format!("failed to install staged update: {e}")))?;

        Ok(())
    }

    async fn get_available_versions(&self, _channel: Option<&str>, limit: usize) -> Result<Vec<String>, TypedError> {
        let url = format!("https://api.github.com/repos/{}/releases?per_page={limit}", self.repo);
        let releases: Vec<GhRelease> = self
            .client
            .get(&url)
            .header("User-Agent", format!("{}/{}", self.binary_name, env!("CARGO_PKG_VERSION")))
            .send()
            .await
            .map_err(|e| TypedError::unavailable(format!("failed to list GitHub releases: {e}")))?
            .json()
            .await
            .map_err(|e| TypedError::unavailable(format!("failed to parse GitHub releases JSON: {e}")))?;
        Ok(releases
            .into_iter()
            .map(|r| r.tag_name.trim_start_matches('v').to_string())
            .take(limit)
            .collect())
    }
}

/// Platform string matching release-asset naming convention, e.g.
/// `aarch64-unknown-linux-gnu`.
pub fn current_platform() -> &'static str {
    #[cfg(all(target_arch = "aarch64", target_os = "macos"))]
    return "aarch64-apple-darwin";

    #[cfg(all(target_arch = "x86_64", target_os = "macos"))]
    return "x86_64-apple-darwin";

    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    return "x86_64-unknown-linux-gnu";

    #[cfg(all(target_arch = "aarch64", target_os = "linux"))]
    return "aarch64-unknown-linux-gnu";

    #[cfg(all(target_arch = "x86_64", target_os = "windows"))]
    return "x86_64-pc-windows-msvc";

    #[cfg(not(any(
        all(target_arch = "aarch64", target_os = "macos"),
        all(target_arch = "x86_64", target_os = "macos"),
        all(target_arch = "x86_64", target_os = "linux"),
        all(target_arch = "aarch64", target_os = "linux"),
        all(target_arch = "x86_64", target_os = "windows"),
    )))]
    return "unknown-platform";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_platform_is_non_empty() {
        assert!(!current_platform().is_empty());
    }
}
