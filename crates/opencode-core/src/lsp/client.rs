use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use lsp_types::{
    ClientCapabilities, DidChangeTextDocumentParams, DidChangeWatchedFilesClientCapabilities,
    DidChangeWatchedFilesParams, DidOpenTextDocumentParams, FileEvent, InitializeParams,
    PublishDiagnosticsClientCapabilities, PublishDiagnosticsParams, TextDocumentClientCapabilities,
    TextDocumentContentChangeEvent, TextDocumentItem, TextDocumentSyncClientCapabilities,
    VersionedTextDocumentIdentifier, WorkspaceClientCapabilities, WorkspaceFolder,
};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{RwLock, broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{Diagnostic, FileChangeType, path_to_uri, uri_to_path};
use crate::sync::lock_unpoisoned;
use crate::{CoreError, Result};

type PendingReply = oneshot::Sender<std::result::Result<Value, String>>;

/// One language server process spoken to over stdio.
pub struct LspClient {
    name: String,
    root: PathBuf,
    extensions: Vec<String>,
    pid: Option<u32>,
    child: tokio::sync::Mutex<Child>,
    stdin: tokio::sync::Mutex<ChildStdin>,
    next_id: AtomicI64,
    pending: Mutex<HashMap<i64, PendingReply>>,
    diagnostics: RwLock<HashMap<PathBuf, Vec<Diagnostic>>>,
    published: broadcast::Sender<PathBuf>,
    open_files: Mutex<HashMap<PathBuf, i32>>,
    cancel: CancellationToken,
}

impl LspClient {
    /// Spawn the server and start reading its output.
    pub async fn start(
        name: &str,
        command: &Path,
        args: &[String],
        env: &std::collections::BTreeMap<String, String>,
        extensions: Vec<String>,
        root: &Path,
    ) -> Result<Arc<Self>> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .current_dir(root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CoreError::Lsp(format!("failed to start {name}: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CoreError::Lsp(format!("{name}: no stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::Lsp(format!("{name}: no stdout")))?;

        let (published, _) = broadcast::channel(64);
        let client = Arc::new(Self {
            name: name.to_string(),
            root: root.to_path_buf(),
            extensions,
            pid: child.id(),
            child: tokio::sync::Mutex::new(child),
            stdin: tokio::sync::Mutex::new(stdin),
            next_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
            diagnostics: RwLock::new(HashMap::new()),
            published,
            open_files: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        });

        let reader = client.clone();
        tokio::spawn(async move { reader.read_loop(stdout).await });
        debug!(target: "opencode::lsp", server = %name, pid = ?client.pid, "Language server started");
        Ok(client)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// True when the server is configured for the file's extension.
    pub fn handles(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        self.extensions
            .iter()
            .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }

    async fn read_loop(self: Arc<Self>, stdout: ChildStdout) {
        let mut reader = BufReader::new(stdout);
        loop {
            let message = tokio::select! {
                m = read_message(&mut reader) => m,
                _ = self.cancel.cancelled() => break,
            };
            match message {
                Ok(Some(message)) => self.dispatch(message).await,
                Ok(None) => break,
                Err(e) => {
                    warn!(target: "opencode::lsp", server = %self.name, "Failed to read message: {}", e);
                    break;
                }
            }
        }
        debug!(target: "opencode::lsp", server = %self.name, "Reader stopped");
        // Fail every outstanding request.
        lock_unpoisoned(&self.pending).clear();
    }

    async fn dispatch(&self, message: Value) {
        let method = message.get("method").and_then(Value::as_str);
        let id = message.get("id").cloned();
        match (method, id) {
            (None, Some(id)) => {
                let Some(id) = id.as_i64() else { return };
                let Some(reply) = lock_unpoisoned(&self.pending).remove(&id) else {
                    return;
                };
                let result = match message.get("error") {
                    Some(err) => Err(err
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string()),
                    None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
                };
                let _ = reply.send(result);
            }
            (Some("textDocument/publishDiagnostics"), _) => {
                let params = message.get("params").cloned().unwrap_or(Value::Null);
                let Some((path, diagnostics)) = parse_published(params) else {
                    debug!(target: "opencode::lsp", server = %self.name, "Malformed publishDiagnostics");
                    return;
                };
                trace!(target: "opencode::lsp", server = %self.name, path = %path.display(), count = diagnostics.len(), "Diagnostics published");
                self.diagnostics.write().await.insert(path.clone(), diagnostics);
                let _ = self.published.send(path);
            }
            (Some(method), Some(id)) => {
                // Server-to-client requests get minimal answers.
                let result = match method {
                    "workspace/configuration" => {
                        let items = message
                            .pointer("/params/items")
                            .and_then(Value::as_array)
                            .map(|a| a.len())
                            .unwrap_or(0);
                        Value::Array(vec![Value::Null; items])
                    }
                    _ => Value::Null,
                };
                let reply = json!({"jsonrpc": "2.0", "id": id, "result": result});
                if let Err(e) = self.write(&reply).await {
                    debug!(target: "opencode::lsp", server = %self.name, "Failed to answer {}: {}", method, e);
                }
            }
            (Some(method), None) => {
                trace!(target: "opencode::lsp", server = %self.name, method, "Notification ignored");
            }
            (None, None) => {}
        }
    }

    async fn write(&self, message: &Value) -> Result<()> {
        let body = serde_json::to_vec(message)?;
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes())
            .await?;
        stdin.write_all(&body).await?;
        stdin.flush().await?;
        Ok(())
    }

    pub async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock_unpoisoned(&self.pending).insert(id, tx);
        self.write(&json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(CoreError::Lsp(format!("{}: {method} failed: {e}", self.name))),
            Ok(Err(_)) => Err(CoreError::Lsp(format!("{}: connection closed", self.name))),
            Err(_) => {
                lock_unpoisoned(&self.pending).remove(&id);
                Err(CoreError::Lsp(format!("{}: {method} timed out", self.name)))
            }
        }
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.write(&json!({"jsonrpc": "2.0", "method": method, "params": params}))
            .await
    }

    /// `initialize` then `initialized`.
    pub async fn initialize(&self, options: Option<Value>, timeout: Duration) -> Result<()> {
        let params = serde_json::to_value(initialize_params(&self.root, options)?)?;
        self.request("initialize", params, timeout).await?;
        self.notify("initialized", json!({})).await
    }

    pub fn is_open(&self, path: &Path) -> bool {
        lock_unpoisoned(&self.open_files).contains_key(path)
    }

    pub async fn open_file(&self, path: &Path) -> Result<()> {
        if self.is_open(path) {
            return Ok(());
        }
        let uri = path_to_uri(path)?;
        let text = tokio::fs::read_to_string(path).await?;
        lock_unpoisoned(&self.open_files).insert(path.to_path_buf(), 1);
        let language = path.extension().and_then(|e| e.to_str()).unwrap_or("plaintext");
        let params = DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri,
                language_id: language_id(language).to_string(),
                version: 1,
                text,
            },
        };
        self.notify("textDocument/didOpen", serde_json::to_value(params)?)
            .await
    }

    /// Send the full new content of an open file.
    pub async fn change_file(&self, path: &Path, content: &str) -> Result<()> {
        let version = {
            let mut open = lock_unpoisoned(&self.open_files);
            match open.get_mut(path) {
                Some(v) => {
                    *v += 1;
                    *v
                }
                None => return Ok(()),
            }
        };
        let params = DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier::new(path_to_uri(path)?, version),
            content_changes: vec![TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text: content.to_string(),
            }],
        };
        self.notify("textDocument/didChange", serde_json::to_value(params)?)
            .await
    }

    pub async fn did_change_watched_files(&self, changes: &[(PathBuf, FileChangeType)]) -> Result<()> {
        let changes = changes
            .iter()
            .map(|(p, t)| Ok(FileEvent::new(path_to_uri(p)?, *t)))
            .collect::<Result<Vec<_>>>()?;
        let params = DidChangeWatchedFilesParams { changes };
        self.notify("workspace/didChangeWatchedFiles", serde_json::to_value(params)?)
            .await
    }

    pub async fn diagnostics_for(&self, path: &Path) -> Vec<Diagnostic> {
        self.diagnostics.read().await.get(path).cloned().unwrap_or_default()
    }

    pub async fn all_diagnostics(&self) -> Vec<(PathBuf, Vec<Diagnostic>)> {
        let mut all: Vec<_> = self
            .diagnostics
            .read()
            .await
            .iter()
            .filter(|(_, d)| !d.is_empty())
            .map(|(p, d)| (p.clone(), d.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Wait for the next diagnostics publication for `path`. Returns false on
    /// timeout or cancellation.
    pub async fn wait_for_diagnostics(&self, cancel: &CancellationToken, path: &Path, timeout: Duration) -> bool {
        let mut rx = self.published.subscribe();
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(published) if published == path => return true,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        };
        tokio::select! {
            r = tokio::time::timeout(timeout, wait) => r.unwrap_or(false),
            _ = cancel.cancelled() => false,
        }
    }

    /// `shutdown` and `exit`, then wait for the process; kill it if the
    /// budget runs out.
    pub async fn shutdown(&self, budget: Duration) {
        let graceful = async {
            let _ = self.request("shutdown", Value::Null, budget).await;
            let _ = self.notify("exit", Value::Null).await;
            let _ = self.child.lock().await.wait().await;
        };
        if tokio::time::timeout(budget, graceful).await.is_err() {
            warn!(target: "opencode::lsp", server = %self.name, "Graceful shutdown timed out, killing");
            self.kill().await;
        }
        self.cancel.cancel();
    }

    pub async fn kill(&self) {
        if let Err(e) = self.child.lock().await.kill().await {
            debug!(target: "opencode::lsp", server = %self.name, "Kill failed: {}", e);
        }
        self.cancel.cancel();
    }
}

fn initialize_params(root: &Path, options: Option<Value>) -> Result<InitializeParams> {
    let root_uri = path_to_uri(root)?;
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    Ok(InitializeParams {
        process_id: Some(std::process::id()),
        root_uri: Some(root_uri.clone()),
        workspace_folders: Some(vec![WorkspaceFolder { uri: root_uri, name }]),
        initialization_options: options,
        capabilities: ClientCapabilities {
            workspace: Some(WorkspaceClientCapabilities {
                configuration: Some(true),
                did_change_watched_files: Some(DidChangeWatchedFilesClientCapabilities {
                    dynamic_registration: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            text_document: Some(TextDocumentClientCapabilities {
                synchronization: Some(TextDocumentSyncClientCapabilities {
                    dynamic_registration: Some(true),
                    did_save: Some(true),
                    ..Default::default()
                }),
                publish_diagnostics: Some(PublishDiagnosticsClientCapabilities {
                    version_support: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    })
}

/// Path and diagnostics of a `textDocument/publishDiagnostics` notification.
fn parse_published(params: Value) -> Option<(PathBuf, Vec<Diagnostic>)> {
    let params: PublishDiagnosticsParams = serde_json::from_value(params).ok()?;
    Some((uri_to_path(&params.uri), params.diagnostics))
}

fn language_id(ext: &str) -> &str {
    match ext {
        "go" => "go",
        "rs" => "rust",
        "py" => "python",
        "ts" => "typescript",
        "tsx" => "typescriptreact",
        "js" | "mjs" | "cjs" => "javascript",
        "jsx" => "javascriptreact",
        other => other,
    }
}

/// Read one `Content-Length` framed message. `None` on clean EOF.
async fn read_message<R>(reader: &mut BufReader<R>) -> std::io::Result<Option<Value>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut length: Option<usize> = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let line = line.trim_end();
        if line.is_empty() {
            if length.is_some() {
                break;
            }
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            if key.eq_ignore_ascii_case("content-length") {
                length = value.trim().parse().ok();
            }
        }
    }
    let len = length.unwrap_or(0);
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_framed_messages() {
        let a = r#"{"jsonrpc":"2.0","id":1,"result":null}"#;
        let b = r#"{"jsonrpc":"2.0","method":"x"}"#;
        let raw = format!(
            "Content-Length: {}\r\n\r\n{}Content-Length: {}\r\nContent-Type: application/vscode-jsonrpc\r\n\r\n{}",
            a.len(),
            a,
            b.len(),
            b
        );
        let mut reader = BufReader::new(raw.as_bytes());
        let first = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(first["id"], 1);
        let second = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(second["method"], "x");
        assert!(read_message(&mut reader).await.unwrap().is_none());
    }

    #[test]
    fn test_initialize_params_wire_shape() {
        let root = Path::new("/work/my app");
        let params = serde_json::to_value(initialize_params(root, Some(json!({"x": 1}))).unwrap()).unwrap();
        assert_eq!(params["processId"], std::process::id());
        assert_eq!(params["rootUri"], "file:///work/my%20app");
        assert_eq!(params["workspaceFolders"][0]["name"], "my app");
        assert_eq!(params["initializationOptions"], json!({"x": 1}));
        assert_eq!(params["capabilities"]["workspace"]["configuration"], true);
        assert_eq!(
            params["capabilities"]["textDocument"]["publishDiagnostics"]["versionSupport"],
            true
        );
        assert!(initialize_params(Path::new("relative"), None).is_err());
    }

    #[test]
    fn test_parse_published_diagnostics() {
        let (path, diagnostics) = parse_published(json!({
            "uri": "file:///work/main.go",
            "version": 3,
            "diagnostics": [{
                "range": {"start": {"line": 4, "character": 1}, "end": {"line": 4, "character": 7}},
                "severity": 1,
                "code": "UndeclaredName",
                "source": "compiler",
                "message": "undefined: foo",
                "tags": [1]
            }]
        }))
        .unwrap();
        assert_eq!(path, Path::new("/work/main.go"));
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].severity, Some(crate::lsp::DiagnosticSeverity::ERROR));
        assert_eq!(diagnostics[0].message, "undefined: foo");

        assert!(parse_published(json!({"diagnostics": []})).is_none());
    }
}
