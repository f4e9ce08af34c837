use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::Value;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use super::install::resolve_binary;
use super::{FileChangeType, InstallStrategy, LspClient, format_diagnostic, is_error};
use crate::config::Config;
use crate::sync::lock_unpoisoned;
use crate::{CoreError, Result};

/// Upper bound on waiting for a diagnostics publication.
pub const DIAGNOSTICS_WAIT: Duration = Duration::from_secs(5);
const INIT_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);
const FORCE_SHUTDOWN_BUDGET: Duration = Duration::from_millis(500);

const SCAN_MAX_DEPTH: usize = 4;
const SCAN_MAX_ENTRIES: usize = 10_000;
const IGNORED_DIRS: &[&str] = &[
    ".git",
    ".opencode",
    "node_modules",
    "target",
    "vendor",
    "dist",
    "build",
    ".venv",
    "__pycache__",
];
const MAX_PROJECT_DIAGNOSTICS: usize = 10;

/// A language server the service knows how to start.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub extensions: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub initialization: Option<Value>,
    pub install: InstallStrategy,
    pub disabled: bool,
}

impl ServerSpec {
    fn new(name: &str, command: &str, args: &[&str], extensions: &[&str], install: InstallStrategy) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            extensions: extensions.iter().map(|s| s.to_string()).collect(),
            env: BTreeMap::new(),
            initialization: None,
            install,
            disabled: false,
        }
    }
}

pub fn builtin_servers() -> Vec<ServerSpec> {
    vec![
        ServerSpec::new(
            "go",
            "gopls",
            &[],
            &[".go"],
            InstallStrategy::PackageInstall {
                program: "go".into(),
                args: vec!["install".into(), "golang.org/x/tools/gopls@latest".into()],
            },
        ),
        ServerSpec::new(
            "typescript",
            "typescript-language-server",
            &["--stdio"],
            &[".ts", ".tsx", ".js", ".jsx", ".mjs", ".cjs"],
            InstallStrategy::Npm {
                packages: vec!["typescript-language-server".into(), "typescript".into()],
            },
        ),
        ServerSpec::new(
            "rust",
            "rust-analyzer",
            &[],
            &[".rs"],
            InstallStrategy::GithubRelease {
                repo: "rust-lang/rust-analyzer".into(),
                asset: "rust-analyzer-{arch}-{os}.gz".into(),
            },
        ),
        ServerSpec::new(
            "python",
            "pyright-langserver",
            &["--stdio"],
            &[".py", ".pyi"],
            InstallStrategy::Npm {
                packages: vec!["pyright".into()],
            },
        ),
    ]
}

/// Overlay `lsp.<name>` config entries on the built-in seeds.
fn resolve_servers(config: &Config) -> Vec<ServerSpec> {
    let mut servers: BTreeMap<String, ServerSpec> = builtin_servers()
        .into_iter()
        .map(|s| (s.name.clone(), s))
        .collect();
    for (name, entry) in &config.lsp {
        let spec = servers.entry(name.clone()).or_insert_with(|| ServerSpec {
            name: name.clone(),
            command: entry.command.clone(),
            args: Vec::new(),
            extensions: Vec::new(),
            env: BTreeMap::new(),
            initialization: None,
            install: InstallStrategy::None,
            disabled: false,
        });
        if !entry.command.is_empty() && entry.command != spec.command {
            spec.command = entry.command.clone();
            spec.install = InstallStrategy::None;
        }
        if !entry.args.is_empty() {
            spec.args = entry.args.clone();
        }
        if !entry.extensions.is_empty() {
            spec.extensions = entry.extensions.clone();
        }
        spec.env.extend(entry.env.clone());
        if entry.initialization.is_some() {
            spec.initialization = entry.initialization.clone();
        }
        spec.disabled = entry.disabled;
    }
    servers
        .into_values()
        .filter(|s| !s.disabled && !s.command.is_empty())
        .collect()
}

/// Lowercased extensions (without the dot) found in a bounded walk of `root`.
fn workspace_extensions(root: &Path) -> HashSet<String> {
    WalkDir::new(root)
        .max_depth(SCAN_MAX_DEPTH)
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && e.depth() > 0
                && e.file_name().to_str().is_some_and(|n| IGNORED_DIRS.contains(&n)))
        })
        .filter_map(|e| e.ok())
        .take(SCAN_MAX_ENTRIES)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            e.path()
                .extension()
                .and_then(|x| x.to_str())
                .map(str::to_lowercase)
        })
        .collect()
}

fn is_ignored(path: &Path) -> bool {
    path.components().any(|c| {
        c.as_os_str()
            .to_str()
            .is_some_and(|s| IGNORED_DIRS.contains(&s))
    })
}

/// Supervises the language servers for one working tree.
pub struct LspService {
    config: Arc<Config>,
    root: PathBuf,
    enabled: bool,
    clients: RwLock<BTreeMap<String, Arc<LspClient>>>,
    specs: Mutex<HashMap<String, ServerSpec>>,
    watchers: Mutex<HashMap<String, JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl LspService {
    pub fn new(config: Arc<Config>, cancel: CancellationToken) -> Self {
        Self {
            root: config.working_dir.clone(),
            config,
            enabled: true,
            clients: RwLock::new(BTreeMap::new()),
            specs: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// A service that never starts servers.
    pub fn disabled(config: Arc<Config>) -> Self {
        Self {
            enabled: false,
            ..Self::new(config, CancellationToken::new())
        }
    }

    /// Launch every relevant server in parallel. Failures are logged and
    /// that server is skipped.
    pub async fn start(self: &Arc<Self>) {
        if !self.enabled {
            return;
        }
        let present = workspace_extensions(&self.root);
        let servers: Vec<ServerSpec> = resolve_servers(&self.config)
            .into_iter()
            .filter(|s| {
                s.extensions
                    .iter()
                    .any(|e| present.contains(&e.trim_start_matches('.').to_lowercase()))
            })
            .collect();
        if servers.is_empty() {
            debug!(target: "opencode::lsp", "No language servers match the workspace");
            return;
        }

        let launches = servers.into_iter().map(|spec| {
            let service = self.clone();
            async move {
                let name = spec.name.clone();
                match service.launch(&spec).await {
                    Ok(client) => {
                        lock_unpoisoned(&service.specs).insert(name.clone(), spec);
                        service.clients.write().await.insert(name.clone(), client.clone());
                        service.spawn_watcher(name, client);
                    }
                    Err(e) => {
                        warn!(target: "opencode::lsp", server = %name, "Language server skipped: {}", e);
                    }
                }
            }
        });
        futures::future::join_all(launches).await;
        let count = self.clients.read().await.len();
        info!(target: "opencode::lsp", clients = count, "Language servers ready");
    }

    async fn launch(&self, spec: &ServerSpec) -> Result<Arc<LspClient>> {
        let install_dir = self.config.data_dir().join("lsp");
        let binary = match resolve_binary(&spec.command, &install_dir) {
            Some(path) => path,
            None if self.config.disable_lsp_download => {
                return Err(CoreError::Lsp(format!(
                    "{} not found and downloads are disabled",
                    spec.command
                )));
            }
            None => spec.install.install(&spec.command, &install_dir).await?,
        };
        let client = LspClient::start(
            &spec.name,
            &binary,
            &spec.args,
            &spec.env,
            spec.extensions.clone(),
            &self.root,
        )
        .await?;
        if let Err(e) = client
            .initialize(spec.initialization.clone(), INIT_TIMEOUT)
            .await
        {
            client.kill().await;
            return Err(e);
        }
        Ok(client)
    }

    /// Run the workspace watcher for one client; a panic restarts the client.
    fn spawn_watcher(self: &Arc<Self>, name: String, client: Arc<LspClient>) {
        let service = self.clone();
        let cancel = self.cancel.child_token();
        let root = self.root.clone();
        let key = name.clone();
        let supervisor = tokio::spawn(async move {
            let watcher = tokio::spawn(watch_workspace(client, root, cancel));
            if let Err(e) = watcher.await {
                if e.is_panic() {
                    error!(target: "opencode::lsp", server = %name, "Workspace watcher panicked, restarting client");
                    service.restart_client(&name).await;
                }
            }
        });
        // A replaced handle belongs to the supervisor that is restarting
        // this client; it finishes on its own.
        lock_unpoisoned(&self.watchers).insert(key, supervisor);
    }

    async fn restart_client(self: &Arc<Self>, name: &str) {
        if self.cancel.is_cancelled() {
            return;
        }
        let Some(spec) = lock_unpoisoned(&self.specs).get(name).cloned() else {
            return;
        };
        let old = self.clients.write().await.remove(name);
        if let Some(old) = old {
            old.kill().await;
        }
        match self.launch(&spec).await {
            Ok(client) => {
                self.clients.write().await.insert(name.to_string(), client.clone());
                self.spawn_watcher(name.to_string(), client);
                info!(target: "opencode::lsp", server = %name, "Language server restarted");
            }
            Err(e) => warn!(target: "opencode::lsp", server = %name, "Restart failed: {}", e),
        }
    }

    pub async fn has_clients(&self) -> bool {
        !self.clients.read().await.is_empty()
    }

    pub async fn client_names(&self) -> Vec<String> {
        self.clients.read().await.keys().cloned().collect()
    }

    pub async fn clients_for_file(&self, path: &Path) -> Vec<Arc<LspClient>> {
        self.clients
            .read()
            .await
            .values()
            .filter(|c| c.handles(path))
            .cloned()
            .collect()
    }

    pub async fn notify_open_file(&self, path: &Path) {
        for client in self.clients_for_file(path).await {
            if let Err(e) = client.open_file(path).await {
                debug!(target: "opencode::lsp", server = %client.name(), path = %path.display(), "didOpen failed: {}", e);
            }
        }
    }

    /// Push new content; files not yet open are opened from disk instead.
    pub async fn notify_change(&self, path: &Path, content: &str) {
        for client in self.clients_for_file(path).await {
            let result = if client.is_open(path) {
                client.change_file(path, content).await
            } else {
                client.open_file(path).await
            };
            if let Err(e) = result {
                debug!(target: "opencode::lsp", server = %client.name(), path = %path.display(), "didChange failed: {}", e);
            }
        }
    }

    /// Block until any client publishes diagnostics for `path`, or
    /// [`DIAGNOSTICS_WAIT`] passes.
    pub async fn wait_for_diagnostics(&self, cancel: &CancellationToken, path: &Path) -> bool {
        let clients = self.clients_for_file(path).await;
        if clients.is_empty() {
            return false;
        }
        let waits = clients
            .iter()
            .map(|c| Box::pin(c.wait_for_diagnostics(cancel, path, DIAGNOSTICS_WAIT)));
        let (published, _, _) = futures::future::select_all(waits).await;
        published
    }

    /// Human readable diagnostics for `path` plus a capped project summary.
    /// Empty when there is nothing to report.
    pub async fn format_diagnostics(&self, path: Option<&Path>) -> String {
        let clients: Vec<Arc<LspClient>> = self.clients.read().await.values().cloned().collect();
        let mut file_lines = Vec::new();
        let mut project_lines = Vec::new();
        for client in &clients {
            for (file, diagnostics) in client.all_diagnostics().await {
                let display = file.to_string_lossy();
                for diag in &diagnostics {
                    if Some(file.as_path()) == path {
                        file_lines.push(format_diagnostic(diag, &display));
                    } else if is_error(diag) {
                        project_lines.push(format_diagnostic(diag, &display));
                    }
                }
            }
        }
        project_lines.sort();
        project_lines.dedup();

        let mut out = String::new();
        if !file_lines.is_empty() {
            out.push_str("\n<file_diagnostics>\n");
            out.push_str(&file_lines.join("\n"));
            out.push_str("\n</file_diagnostics>\n");
        }
        if !project_lines.is_empty() {
            let total = project_lines.len();
            out.push_str("\n<project_diagnostics>\n");
            out.push_str(&project_lines[..total.min(MAX_PROJECT_DIAGNOSTICS)].join("\n"));
            if total > MAX_PROJECT_DIAGNOSTICS {
                out.push_str(&format!("\n... and {} more", total - MAX_PROJECT_DIAGNOSTICS));
            }
            out.push_str("\n</project_diagnostics>\n");
        }
        out
    }

    fn stop_watchers(&self) {
        self.cancel.cancel();
        for (_, handle) in lock_unpoisoned(&self.watchers).drain() {
            handle.abort();
        }
    }

    /// Stop watchers, then give each client a graceful budget before killing it.
    pub async fn shutdown(&self) {
        self.stop_watchers();
        let clients: Vec<Arc<LspClient>> = std::mem::take(&mut *self.clients.write().await)
            .into_values()
            .collect();
        if clients.is_empty() {
            return;
        }
        futures::future::join_all(clients.iter().map(|c| c.shutdown(SHUTDOWN_BUDGET))).await;
        info!(target: "opencode::lsp", count = clients.len(), "Language servers stopped");
    }

    /// Short graceful attempt, then SIGKILL every server process and its
    /// descendants.
    pub async fn force_shutdown(&self) {
        self.stop_watchers();
        let clients: Vec<Arc<LspClient>> = std::mem::take(&mut *self.clients.write().await)
            .into_values()
            .collect();
        let pids: Vec<u32> = clients.iter().filter_map(|c| c.pid()).collect();
        let graceful = futures::future::join_all(clients.iter().map(|c| c.shutdown(FORCE_SHUTDOWN_BUDGET)));
        if tokio::time::timeout(FORCE_SHUTDOWN_BUDGET, graceful).await.is_err() {
            warn!(target: "opencode::lsp", "Forced shutdown budget exceeded");
        }
        for pid in pids {
            kill_process_tree(pid);
        }
    }
}

fn change_type(kind: &EventKind) -> Option<FileChangeType> {
    match kind {
        EventKind::Create(_) => Some(FileChangeType::CREATED),
        EventKind::Modify(_) => Some(FileChangeType::CHANGED),
        EventKind::Remove(_) => Some(FileChangeType::DELETED),
        _ => None,
    }
}

async fn watch_workspace(client: Arc<LspClient>, root: PathBuf, cancel: CancellationToken) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let watcher = notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| {
        if let Ok(event) = res {
            let _ = tx.send(event);
        }
    });
    let mut watcher: RecommendedWatcher = match watcher {
        Ok(w) => w,
        Err(e) => {
            warn!(target: "opencode::lsp", server = %client.name(), "Failed to create watcher: {}", e);
            return;
        }
    };
    if let Err(e) = watcher.watch(&root, RecursiveMode::Recursive) {
        warn!(target: "opencode::lsp", server = %client.name(), "Failed to watch workspace: {}", e);
        return;
    }
    debug!(target: "opencode::lsp", server = %client.name(), root = %root.display(), "Workspace watcher started");

    loop {
        let first = tokio::select! {
            e = rx.recv() => e,
            _ = cancel.cancelled() => break,
        };
        let Some(first) = first else { break };
        let mut batch = vec![first];
        while let Ok(more) = rx.try_recv() {
            batch.push(more);
        }

        let mut changes: Vec<(PathBuf, FileChangeType)> = Vec::new();
        for event in batch {
            let Some(kind) = change_type(&event.kind) else { continue };
            for path in event.paths {
                if is_ignored(&path) || !client.handles(&path) {
                    continue;
                }
                if kind == FileChangeType::CHANGED && client.is_open(&path) {
                    if let Ok(content) = tokio::fs::read_to_string(&path).await {
                        let _ = client.change_file(&path, &content).await;
                    }
                }
                if !changes.iter().any(|(p, k)| p == &path && *k == kind) {
                    changes.push((path, kind));
                }
            }
        }
        if !changes.is_empty() {
            if let Err(e) = client.did_change_watched_files(&changes).await {
                debug!(target: "opencode::lsp", server = %client.name(), "didChangeWatchedFiles failed: {}", e);
            }
        }
    }
    debug!(target: "opencode::lsp", server = %client.name(), "Workspace watcher stopped");
}

/// Direct children of `parent`, found by scanning process parent ids.
fn child_pids(parent: u32) -> Vec<u32> {
    #[cfg(target_os = "linux")]
    {
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str()?.parse::<u32>().ok())
            .filter(|pid| {
                std::fs::read_to_string(format!("/proc/{pid}/stat"))
                    .ok()
                    .and_then(|stat| parse_ppid(&stat))
                    == Some(parent)
            })
            .collect()
    }
    #[cfg(not(target_os = "linux"))]
    {
        std::process::Command::new("pgrep")
            .arg("-P")
            .arg(parent.to_string())
            .output()
            .map(|out| {
                String::from_utf8_lossy(&out.stdout)
                    .lines()
                    .filter_map(|l| l.trim().parse().ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The ppid field of `/proc/<pid>/stat`. The command name may contain
/// spaces and parentheses, so fields are counted after the last `)`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_ppid(stat: &str) -> Option<u32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(1)?.parse().ok()
}

fn kill_process_tree(pid: u32) {
    let mut stack = vec![pid];
    let mut seen = HashSet::new();
    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        stack.extend(child_pids(current));
        #[cfg(unix)]
        // SAFETY: kill(2) with a concrete pid has no memory safety requirements.
        unsafe {
            libc::kill(current as libc::pid_t, libc::SIGKILL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LspServerConfig;

    #[test]
    fn test_builtin_seeds() {
        let names: Vec<String> = builtin_servers().into_iter().map(|s| s.command).collect();
        for expected in ["gopls", "typescript-language-server", "rust-analyzer", "pyright-langserver"] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[test]
    fn test_config_overlays_seeds() {
        let mut config = Config::default();
        config.lsp.insert(
            "go".into(),
            LspServerConfig {
                disabled: true,
                ..Default::default()
            },
        );
        config.lsp.insert(
            "zig".into(),
            LspServerConfig {
                command: "zls".into(),
                extensions: vec![".zig".into()],
                ..Default::default()
            },
        );
        config.lsp.insert(
            "rust".into(),
            LspServerConfig {
                args: vec!["--log-file".into(), "/tmp/ra.log".into()],
                ..Default::default()
            },
        );
        let servers = resolve_servers(&config);
        assert!(!servers.iter().any(|s| s.name == "go"));
        let zig = servers.iter().find(|s| s.name == "zig").unwrap();
        assert_eq!(zig.install, InstallStrategy::None);
        let rust = servers.iter().find(|s| s.name == "rust").unwrap();
        assert_eq!(rust.command, "rust-analyzer");
        assert_eq!(rust.args.len(), 2);
        assert!(matches!(rust.install, InstallStrategy::GithubRelease { .. }));
    }

    #[test]
    fn test_workspace_extensions_skip_ignored_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.go"), "package main").unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/x")).unwrap();
        std::fs::write(dir.path().join("node_modules/x/index.ts"), "").unwrap();
        let found = workspace_extensions(dir.path());
        assert!(found.contains("go"));
        assert!(!found.contains("ts"));
    }

    #[test]
    fn test_parse_ppid() {
        assert_eq!(parse_ppid("1234 (my (odd) proc) S 42 1234 1234 0"), Some(42));
        assert_eq!(parse_ppid("garbage"), None);
    }

    #[tokio::test]
    async fn test_disabled_service_is_inert() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.working_dir = dir.path().to_path_buf();
        let service = Arc::new(LspService::disabled(Arc::new(config)));
        service.start().await;
        assert!(!service.has_clients().await);
        let path = dir.path().join("main.go");
        assert!(!service.wait_for_diagnostics(&CancellationToken::new(), &path).await);
        assert_eq!(service.format_diagnostics(Some(&path)).await, "");
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_runs_on_spawned_task() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.working_dir = dir.path().to_path_buf();
        config.disable_lsp_download = true;
        let service = Arc::new(LspService::new(Arc::new(config), CancellationToken::new()));
        let task = {
            let service = service.clone();
            tokio::spawn(async move { service.start().await })
        };
        task.await.unwrap();
        assert!(!service.has_clients().await);
        service.shutdown().await;
    }
}
