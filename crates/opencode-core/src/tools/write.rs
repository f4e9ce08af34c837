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
struct WriteParams {
    file_path: String,
    content: String,
}

pub struct WriteTool {
    history: Arc<FileHistoryService>,
    tracker: Arc<FileTracker>,
    lsp: Arc<LspService>,
}

impl WriteTool {
    pub fn new(deps: &ToolDeps) -> Self {
        Self {
            history: deps.history.clone(),
            tracker: deps.tracker.clone(),
            lsp: deps.lsp.clone(),
        }
    }
}

#[async_trait]
impl Tool for WriteTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "write".into(),
            description: "Create or overwrite a file. Existing files must be read with the view tool first.".into(),
            parameters: json!({
                "file_path": {"type": "string", "description": "The path to the file to write"},
                "content": {"type": "string", "description": "The full content to write"},
            }),
            required: vec!["file_path".into(), "content".into()],
        }
    }

    fn permission(&self, ctx: &ToolContext, input: &Value) -> Option<PermissionSpec> {
        let raw = input.get("file_path").and_then(Value::as_str).unwrap_or_default();
        let path = ctx.resolve(raw).to_string_lossy().to_string();
        let content = input.get("content").and_then(Value::as_str).unwrap_or_default();
        let old = std::fs::read_to_string(&path).unwrap_or_default();
        Some(PermissionSpec {
            action: "write".into(),
            description: format!("Create file {path}"),
            pattern: path.clone(),
            params: json!({"file_path": path, "diff": unified_diff(&path, &old, content, 3).diff}),
            path,
            read_only: false,
        })
    }

    async fn run(&self, ctx: &ToolContext, call: &ToolInvocation) -> Result<ToolResponse> {
        let params: WriteParams = match parse_input(call) {
            Ok(p) => p,
            Err(resp) => return Ok(resp),
        };
        let path = ctx.resolve(&params.file_path);
        if let Err(e) = self.tracker.ensure_writable(&path) {
            return Ok(ToolResponse::error(e));
        }
        let old = tokio::fs::read_to_string(&path).await.unwrap_or_default();
        if path.exists() && old == params.content {
            return Ok(ToolResponse::error(format!(
                "file {} already contains the exact content, no changes made",
                path.display()
            )));
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &params.content).await?;
        self.tracker.record_write(&path);

        let path_str = path.to_string_lossy().to_string();
        record_file_change(&self.history, &ctx.session_id, &path_str, &old, &params.content).await?;
        let diff = unified_diff(&path_str, &old, &params.content, 3);

        self.lsp.notify_change(&path, &params.content).await;
        self.lsp.wait_for_diagnostics(&ctx.cancel, &path).await;
        let mut out = format!("File successfully written: {path_str}");
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

    #[tokio::test]
    async fn test_write_new_file_records_history() {
        let fx = Fixture::new().await;
        let tool = WriteTool::new(&fx.deps);
        let resp = tool
            .run(&fx.ctx(), &call("write", json!({"file_path": "src/new.rs", "content": "fn main() {}\n"})))
            .await
            .unwrap();
        assert!(!resp.is_error, "{}", resp.content);

        let path = fx.path("src/new.rs");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "fn main() {}\n");
        let versions = fx.deps.history.list_by_session(&fx.session_id).await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].content, "");
        assert_eq!(versions[1].content, "fn main() {}\n");
    }

    #[tokio::test]
    async fn test_write_existing_requires_read() {
        let fx = Fixture::new().await;
        let path = fx.path("a.txt");
        std::fs::write(&path, "old").unwrap();
        let tool = WriteTool::new(&fx.deps);
        let resp = tool
            .run(&fx.ctx(), &call("write", json!({"file_path": path, "content": "new"})))
            .await
            .unwrap();
        assert!(resp.is_error);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "old");
    }
}
