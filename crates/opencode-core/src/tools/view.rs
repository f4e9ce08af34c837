use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde::Deserialize;
use serde_json::json;

use super::{FileTracker, Tool, ToolContext, ToolDeps, ToolInfo, ToolInvocation, ToolResponse, parse_input};
use crate::Result;
use crate::lsp::LspService;

const MAX_READ_BYTES: u64 = 250 * 1024;
const DEFAULT_LIMIT: usize = 2000;
const MAX_LINE_CHARS: usize = 2000;

#[derive(Debug, Deserialize)]
struct ViewParams {
    file_path: String,
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    limit: Option<usize>,
}

pub struct ViewTool {
    tracker: Arc<FileTracker>,
    lsp: Arc<LspService>,
}

impl ViewTool {
    pub fn new(deps: &ToolDeps) -> Self {
        Self {
            tracker: deps.tracker.clone(),
            lsp: deps.lsp.clone(),
        }
    }
}

fn image_mime(path: &std::path::Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

#[async_trait]
impl Tool for ViewTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "view".into(),
            description: "Read a file with line numbers. Use offset and limit to page through large files. Images are returned as attachments.".into(),
            parameters: json!({
                "file_path": {"type": "string", "description": "The path to the file to read"},
                "offset": {"type": "integer", "description": "The line number to start reading from (0-based)"},
                "limit": {"type": "integer", "description": "The number of lines to read (defaults to 2000)"},
            }),
            required: vec!["file_path".into()],
        }
    }

    async fn run(&self, ctx: &ToolContext, call: &ToolInvocation) -> Result<ToolResponse> {
        let params: ViewParams = match parse_input(call) {
            Ok(p) => p,
            Err(resp) => return Ok(resp),
        };
        let path = ctx.resolve(&params.file_path);
        let meta = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(_) => return Ok(ToolResponse::error(format!("file not found: {}", path.display()))),
        };
        if meta.is_dir() {
            return Ok(ToolResponse::error(format!(
                "path is a directory, not a file: {}",
                path.display()
            )));
        }

        if let Some(mime) = image_mime(&path) {
            let bytes = tokio::fs::read(&path).await?;
            self.tracker.record_read(&path);
            return Ok(ToolResponse::image(BASE64_STANDARD.encode(bytes))
                .with_metadata(json!({"file_path": path, "mime_type": mime})));
        }
        if meta.len() > MAX_READ_BYTES && params.offset == 0 && params.limit.is_none() {
            return Ok(ToolResponse::error(format!(
                "file is too large ({} bytes, max {MAX_READ_BYTES}); read it in parts with offset and limit",
                meta.len()
            )));
        }

        let bytes = tokio::fs::read(&path).await?;
        let content = String::from_utf8_lossy(&bytes);
        let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
        let total = content.lines().count();
        let mut out = String::from("<file>\n");
        for (i, line) in content.lines().enumerate().skip(params.offset).take(limit) {
            let line = if line.chars().count() > MAX_LINE_CHARS {
                format!("{}...", line.chars().take(MAX_LINE_CHARS).collect::<String>())
            } else {
                line.to_string()
            };
            out.push_str(&format!("{:6}|{}\n", i + 1, line));
        }
        let shown_end = (params.offset + limit).min(total);
        if shown_end < total {
            out.push_str(&format!(
                "\n(File has more lines. Use 'offset' to read beyond line {shown_end})\n"
            ));
        }
        out.push_str("</file>\n");

        self.tracker.record_read(&path);
        self.lsp.notify_open_file(&path).await;
        let diagnostics = self.lsp.format_diagnostics(Some(&path)).await;
        if !diagnostics.is_empty() {
            out.push('\n');
            out.push_str(&diagnostics);
        }

        Ok(ToolResponse::text(out).with_metadata(json!({
            "file_path": path,
            "total_lines": total,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::{Fixture, call};

    #[tokio::test]
    async fn test_view_numbers_lines_and_records_read() {
        let fx = Fixture::new().await;
        let path = fx.path("a.txt");
        std::fs::write(&path, "alpha\nbeta\ngamma\n").unwrap();
        let tool = ViewTool::new(&fx.deps);

        let resp = tool
            .run(&fx.ctx(), &call("view", json!({"file_path": "a.txt", "offset": 1, "limit": 1})))
            .await
            .unwrap();
        assert!(resp.content.contains("     2|beta"));
        assert!(!resp.content.contains("alpha"));
        assert!(resp.content.contains("beyond line 2"));
        assert!(fx.deps.tracker.last_read(std::path::Path::new(&path)).is_some());
    }

    #[tokio::test]
    async fn test_view_missing_file() {
        let fx = Fixture::new().await;
        let tool = ViewTool::new(&fx.deps);
        let resp = tool
            .run(&fx.ctx(), &call("view", json!({"file_path": "nope.txt"})))
            .await
            .unwrap();
        assert!(resp.is_error);
    }
}
