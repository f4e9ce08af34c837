use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::{CoreError, Result};

/// How a missing server binary gets installed into the data dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallStrategy {
    None,
    /// `npm install --prefix <dir> <packages>`.
    Npm { packages: Vec<String> },
    /// A language toolchain installer, e.g. `go install`, run with `GOBIN`
    /// and `CARGO_INSTALL_ROOT` pointed at the data dir.
    PackageInstall { program: String, args: Vec<String> },
    /// Latest release asset from GitHub. `{arch}` and `{os}` in the asset
    /// name are filled from the host; `.gz` assets are decompressed.
    GithubRelease { repo: String, asset: String },
}

/// Find `command` on PATH or in the install dir.
pub(crate) fn resolve_binary(command: &str, install_dir: &Path) -> Option<PathBuf> {
    let direct = Path::new(command);
    if direct.is_absolute() {
        return direct.is_file().then(|| direct.to_path_buf());
    }
    let path_dirs = std::env::var_os("PATH")
        .map(|p| std::env::split_paths(&p).collect::<Vec<_>>())
        .unwrap_or_default();
    path_dirs
        .into_iter()
        .chain([
            install_dir.join("bin"),
            install_dir.join("node_modules").join(".bin"),
        ])
        .map(|dir| dir.join(command))
        .find(|candidate| candidate.is_file())
}

impl InstallStrategy {
    pub(crate) async fn install(&self, command: &str, install_dir: &Path) -> Result<PathBuf> {
        let bin_dir = install_dir.join("bin");
        tokio::fs::create_dir_all(&bin_dir).await?;
        match self {
            Self::None => {
                return Err(CoreError::Lsp(format!(
                    "{command} not found and no install strategy is known"
                )));
            }
            Self::Npm { packages } => {
                info!(target: "opencode::lsp", command, ?packages, "Installing language server with npm");
                run_installer(
                    Command::new("npm")
                        .arg("install")
                        .arg("--prefix")
                        .arg(install_dir)
                        .args(packages),
                )
                .await?;
            }
            Self::PackageInstall { program, args } => {
                info!(target: "opencode::lsp", command, program, "Installing language server");
                run_installer(
                    Command::new(program)
                        .args(args)
                        .env("GOBIN", &bin_dir)
                        .env("CARGO_INSTALL_ROOT", install_dir),
                )
                .await?;
            }
            Self::GithubRelease { repo, asset } => {
                download_release(repo, asset, command, &bin_dir).await?;
            }
        }
        resolve_binary(command, install_dir)
            .ok_or_else(|| CoreError::Lsp(format!("{command} still missing after install")))
    }
}

async fn run_installer(cmd: &mut Command) -> Result<()> {
    let output = cmd
        .output()
        .await
        .map_err(|e| CoreError::Lsp(format!("installer failed to start: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CoreError::Lsp(format!("installer failed: {}", stderr.trim())));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct Release {
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
}

fn host_asset_name(template: &str) -> String {
    let os = match std::env::consts::OS {
        "macos" => "apple-darwin",
        "linux" => "unknown-linux-gnu",
        "windows" => "pc-windows-msvc",
        other => other,
    };
    template
        .replace("{arch}", std::env::consts::ARCH)
        .replace("{os}", os)
}

async fn download_release(repo: &str, asset: &str, command: &str, bin_dir: &Path) -> Result<()> {
    let asset_name = host_asset_name(asset);
    info!(target: "opencode::lsp", repo, asset = %asset_name, "Downloading language server release");
    let http = reqwest::Client::builder()
        .user_agent("opencode")
        .build()
        .map_err(|e| CoreError::Lsp(e.to_string()))?;
    let release: Release = http
        .get(format!("https://api.github.com/repos/{repo}/releases/latest"))
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| CoreError::Lsp(format!("release lookup failed: {e}")))?
        .json()
        .await
        .map_err(|e| CoreError::Lsp(format!("release lookup failed: {e}")))?;
    let found = release
        .assets
        .iter()
        .find(|a| a.name == asset_name)
        .ok_or_else(|| CoreError::Lsp(format!("{repo} has no asset {asset_name}")))?;
    let bytes = http
        .get(&found.browser_download_url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| CoreError::Lsp(format!("download failed: {e}")))?
        .bytes()
        .await
        .map_err(|e| CoreError::Lsp(format!("download failed: {e}")))?;

    let target = bin_dir.join(command);
    if asset_name.ends_with(".gz") {
        let archive = bin_dir.join(format!("{command}.gz"));
        tokio::fs::write(&archive, &bytes).await?;
        run_installer(Command::new("gzip").arg("-df").arg(&archive)).await?;
    } else {
        tokio::fs::write(&target, &bytes).await?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755)).await?;
    }
    debug!(target: "opencode::lsp", path = %target.display(), "Release installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_binary_in_install_dir() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("fake-lsp-server-xyz"), "").unwrap();
        assert_eq!(
            resolve_binary("fake-lsp-server-xyz", dir.path()),
            Some(bin.join("fake-lsp-server-xyz"))
        );
        assert!(resolve_binary("missing-lsp-server-xyz", dir.path()).is_none());
    }

    #[test]
    fn test_host_asset_name() {
        let name = host_asset_name("rust-analyzer-{arch}-{os}.gz");
        assert!(name.starts_with("rust-analyzer-"));
        assert!(!name.contains('{'));
    }

    #[tokio::test]
    async fn test_none_strategy_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(InstallStrategy::None.install("nope", dir.path()).await.is_err());
    }
}
