use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{
    FileTracker, PermissionSpec, Tool, ToolContext, ToolDeps, ToolInfo, ToolInvocation, ToolResponse, parse_input,
    record_file_change,
};
use crate::Result;
use crate::diff::diff_stats;
use crate::history::FileHistoryService;
use crate::lsp::LspService;
use crate::patch::{
    FileChange, MAX_FUZZ, PatchError, apply_commit, identify_files_added, identify_files_needed, patch_to_commit,
    text_to_patch,
};

#[derive(Debug, Deserialize)]
struct PatchParams {
    patch_text: String,
}

pub struct PatchTool {
    history: Arc<FileHistoryService>,
    tracker: Arc<FileTracker>,
    lsp: Arc<LspService>,
}

impl PatchTool {
    pub fn new(deps: &ToolDeps) -> Self {
        Self {
            history: deps.history.clone(),
            tracker: deps.tracker.clone(),
            lsp: deps.lsp.clone(),
        }
    }
}

#[async_trait]
impl Tool for PatchTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "patch".into(),
            description: "Apply a multi-file patch between '*** Begin Patch' and '*** End Patch'. Sections are '*** Add File: <path>', '*** Delete File: <path>' and '*** Update File: <path>' (optionally followed by '*** Move to: <path>'); update hunks start with '@@' and use ' ', '-' and '+' lines. Files being updated or deleted must be read first.".into(),
            parameters: json!({
                "patch_text": {"type": "string", "description": "The full patch text"},
            }),
            required: vec!["patch_text".into()],
        }
    }

    fn permission(&self, ctx: &ToolContext, input: &Value) -> Option<PermissionSpec> {
        let text = input.get("patch_text").and_then(Value::as_str).unwrap_or_default();
        let mut paths = identify_files_needed(text);
        paths.extend(identify_files_added(text));
        let path = ctx.working_dir.to_string_lossy().to_string();
        Some(PermissionSpec {
            action: "write".into(),
            description: format!("Apply patch to {} files", paths.len()),
            pattern: paths
                .first()
                .map(|p| ctx.resolve(p).to_string_lossy().to_string())
                .unwrap_or_else(|| path.clone()),
            params: json!({"files": paths}),
            path,
            read_only: false,
        })
    }

    async fn run(&self, ctx: &ToolContext, call: &ToolInvocation) -> Result<ToolResponse> {
        let params: PatchParams = match parse_input(call) {
            Ok(p) => p,
            Err(resp) => return Ok(resp),
        };

        let mut orig: HashMap<String, String> = HashMap::new();
        for raw in identify_files_needed(&params.patch_text) {
            let path = ctx.resolve(&raw);
            if !path.exists() {
                return Ok(ToolResponse::error(PatchError::MissingFile(raw).to_string()));
            }
            if let Err(e) = self.tracker.ensure_writable(&path) {
                return Ok(ToolResponse::error(e));
            }
            orig.insert(raw, tokio::fs::read_to_string(&path).await?);
        }
        for raw in identify_files_added(&params.patch_text) {
            if ctx.resolve(&raw).exists() {
                return Ok(ToolResponse::error(PatchError::FileExists(raw).to_string()));
            }
        }

        let commit = match text_to_patch(&params.patch_text, &orig) {
            Ok((_, fuzz)) if fuzz > MAX_FUZZ => {
                return Ok(ToolResponse::error(PatchError::Fuzzy(fuzz).to_string()));
            }
            Ok((patch, _)) => match patch_to_commit(&patch, &orig) {
                Ok(commit) => commit,
                Err(e) => return Ok(ToolResponse::error(e.to_string())),
            },
            Err(e) => return Ok(ToolResponse::error(e.to_string())),
        };

        let resolve = |p: &str| -> PathBuf { ctx.resolve(p) };
        apply_commit(
            &commit,
            |path, content| {
                let path = resolve(path);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, content)
            },
            |path| std::fs::remove_file(resolve(path)),
        )?;

        let (mut additions, mut removals) = (0, 0);
        let mut changed = Vec::new();
        for (raw, change) in &commit.changes {
            let (target, old, new) = match change {
                FileChange::Add { content } => (raw.as_str(), "", content.as_str()),
                FileChange::Delete { old_content } => (raw.as_str(), old_content.as_str(), ""),
                FileChange::Update {
                    old_content,
                    new_content,
                    move_path,
                } => (
                    move_path.as_deref().unwrap_or(raw),
                    old_content.as_str(),
                    new_content.as_str(),
                ),
            };
            let path = ctx.resolve(target);
            let path_str = path.to_string_lossy().to_string();
            let stats = diff_stats(old, new);
            additions += stats.additions;
            removals += stats.removals;
            record_file_change(&self.history, &ctx.session_id, &path_str, old, new).await?;
            if matches!(change, FileChange::Delete { .. }) {
                continue;
            }
            self.tracker.record_write(&path);
            self.lsp.notify_change(&path, new).await;
            changed.push(path);
        }

        let mut out = format!(
            "Patch applied successfully. {} files changed, {additions} additions, {removals} removals",
            commit.changes.len()
        );
        for path in &changed {
            self.lsp.wait_for_diagnostics(&ctx.cancel, path).await;
            let diagnostics = self.lsp.format_diagnostics(Some(path)).await;
            if !diagnostics.is_empty() {
                out.push_str("\n\n");
                out.push_str(&diagnostics);
            }
        }
        Ok(ToolResponse::text(out).with_metadata(json!({
            "files_changed": commit.changes.keys().collect::<Vec<_>>(),
            "additions": additions,
            "removals": removals,
        })))
    }
}
