use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{
    FileTracker, PermissionSpec, Tool, ToolContext, ToolDeps, ToolInfo, ToolInvocation, ToolResponse, parse_input,
    record_file_change,
};
use crate::Result;
use crate::diff::unified_diff;
use crate::history::FileHistoryService;
use crate::lsp::LspService;

#[derive(Debug, Deserialize)]
struct EditParams {
    file_path: String,
    #[serde(default)]
    old_string: String,
    #[serde(default)]
    new_string: String,
    #[serde(default)]
    replace_all: bool,
}

pub struct EditTool {
    history: Arc<FileHistoryService>,
    tracker: Arc<FileTracker>,
    lsp: Arc<LspService>,
}

impl EditTool {
    pub fn new(deps: &ToolDeps) -> Self {
        Self {
            history: deps.history.clone(),
            tracker: deps.tracker.clone(),
            lsp: deps.lsp.clone(),
        }
    }
}

/// New content for an edit, or the reason it cannot apply.
fn apply_edit(current: &str, params: &EditParams) -> std::result::Result<String, String> {
    let matches = current.matches(params.old_string.as_str()).count();
    match matches {
        0 => Err("old_string not found in file; it must match exactly, including whitespace".into()),
        1 => Ok(current.replacen(&params.old_string, &params.new_string, 1)),
        _ if params.replace_all => Ok(current.replace(&params.old_string, &params.new_string)),
        n => Err(format!(
            "old_string appears {n} times in the file; add context to make it unique or set replace_all"
        )),
    }
}

#[async_trait]
impl Tool for EditTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "edit".into(),
            description: "Replace text in a file. An empty old_string creates a new file. The file must be read with the view tool first.".into(),
            parameters: json!({
                "file_path": {"type": "string", "description": "The path to the file to modify"},
                "old_string": {"type": "string", "description": "The text to replace"},
                "new_string": {"type": "string", "description": "The text to replace it with"},
                "replace_all": {"type": "boolean", "description": "Replace every occurrence"},
            }),
            required: vec!["file_path".into(), "old_string".into(), "new_string".into()],
        }
    }

    fn permission(&self, ctx: &ToolContext, input: &Value) -> Option<PermissionSpec> {
        let raw = input.get("file_path").and_then(Value::as_str).unwrap_or_default();
        let path = ctx.resolve(raw).to_string_lossy().to_string();
        Some(PermissionSpec {
            action: "write".into(),
            description: format!("Edit file {path}"),
            pattern: path.clone(),
            params: input.clone(),
            path,
            read_only: false,
        })
    }

    async fn run(&self, ctx: &ToolContext, call: &ToolInvocation) -> Result<ToolResponse> {
        let params: EditParams = match parse_input(call) {
            Ok(p) => p,
            Err(resp) => return Ok(resp),
        };
        let path = ctx.resolve(&params.file_path);
        let exists = path.exists();

        let (old, new) = if params.old_string.is_empty() {
            if exists {
                return Ok(ToolResponse::error(format!(
                    "file already exists: {}; provide old_string to edit it",
                    path.display()
                )));
            }
            (String::new(), params.new_string.clone())
        } else {
            if !exists {
                return Ok(ToolResponse::error(format!("file not found: {}", path.display())));
            }
            if let Err(e) = self.tracker.ensure_writable(&path) {
                return Ok(ToolResponse::error(e));
            }
            let current = tokio::fs::read_to_string(&path).await?;
            match apply_edit(&current, &params) {
                Ok(new) => (current, new),
                Err(e) => return Ok(ToolResponse::error(e)),
            }
        };
        if exists && old == new {
            return Ok(ToolResponse::error("new content is the same as old content, no changes made"));
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &new).await?;
        self.tracker.record_write(&path);

        let path_str = path.to_string_lossy().to_string();
        record_file_change(&self.history, &ctx.session_id, &path_str, &old, &new).await?;
        let diff = unified_diff(&path_str, &old, &new, 3);

        self.lsp.notify_change(&path, &new).await;
        self.lsp.wait_for_diagnostics(&ctx.cancel, &path).await;
        let mut out = format!("File edited: {path_str}");
        let diagnostics = self.lsp.format_diagnostics(Some(&path)).await;
        if !diagnostics.is_empty() {
            out.push_str("\n\n");
            out.push_str(&diagnostics);
        }
        Ok(ToolResponse::text(out).with_metadata(json!({
            "diff": diff.diff,
            "additions": diff.additions,
            "removals": diff.removals,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::{Fixture, call};

    fn params(old: &str, new: &str, all: bool) -> EditParams {
        EditParams {
            file_path: String::new(),
            old_string: old.into(),
            new_string: new.into(),
            replace_all: all,
        }
    }

    #[test]
    fn test_apply_edit_uniqueness() {
        assert_eq!(apply_edit("a b a", &params("b", "c", false)).unwrap(), "a c a");
        assert!(apply_edit("a b a", &params("a", "c", false)).is_err());
        assert_eq!(apply_edit("a b a", &params("a", "c", true)).unwrap(), "c b c");
        assert!(apply_edit("a b a", &params("z", "c", false)).is_err());
    }

    #[tokio::test]
    async fn test_edit_after_view() {
        let fx = Fixture::new().await;
        let path = fx.path("a.txt");
        std::fs::write(&path, "hello world\n").unwrap();
        fx.deps.tracker.record_read(std::path::Path::new(&path));

        let tool = EditTool::new(&fx.deps);
        let resp = tool
            .run(
                &fx.ctx(),
                &call("edit", json!({"file_path": path, "old_string": "world", "new_string": "rust"})),
            )
            .await
            .unwrap();
        assert!(!resp.is_error, "{}", resp.content);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello rust\n");

        let modified = fx.deps.history.modified_files(&fx.session_id).await.unwrap();
        assert_eq!(modified.len(), 1);
        assert_eq!(modified[0].additions, 1);
        assert_eq!(modified[0].removals, 1);
    }
}
