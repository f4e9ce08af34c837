//! Stable project identifier.

use std::path::Path;
use std::process::Command;

use once_cell::sync::OnceCell;
use tracing::debug;

static PROJECT_ID: OnceCell<String> = OnceCell::new();

/// Project id for the process, computed once from the working directory.
pub fn project_id(working_dir: &Path) -> &'static str {
    PROJECT_ID.get_or_init(|| compute_project_id(working_dir))
}

/// Project id from the git origin URL, falling back to the directory name.
pub fn compute_project_id(working_dir: &Path) -> String {
    let remote = Command::new("git")
        .args(["config", "--get", "remote.origin.url"])
        .current_dir(working_dir)
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let id = match remote {
        Some(url) => normalize_git_url(&url),
        None => working_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "default".to_string()),
    };
    debug!(target: "opencode::startup", project_id = %id, "Resolved project id");
    id
}

/// `git@github.com:Org/Repo.git` and `https://github.com/org/repo` both
/// become `github.com/org/repo`.
pub fn normalize_git_url(url: &str) -> String {
    let mut s = url.trim();
    for scheme in ["https://", "http://", "ssh://", "git://"] {
        if let Some(rest) = s.strip_prefix(scheme) {
            s = rest;
            break;
        }
    }
    let mut s = match s.split_once('@') {
        Some((_, rest)) => rest.to_string(),
        None => s.to_string(),
    };
    // scp-like syntax uses ':' between host and path
    if let Some(idx) = s.find(':') {
        let (host, path) = s.split_at(idx);
        let path = path.trim_start_matches(':');
        if !path.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            s = format!("{host}/{path}");
        }
    }
    let s = s.trim_end_matches('/').trim_end_matches(".git");
    s.to_lowercase()
}
