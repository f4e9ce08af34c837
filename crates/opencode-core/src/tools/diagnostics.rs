use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{Tool, ToolContext, ToolDeps, ToolInfo, ToolInvocation, ToolResponse, parse_input};
use crate::Result;
use crate::lsp::LspService;

#[derive(Debug, Deserialize)]
struct DiagnosticsParams {
    #[serde(default)]
    file_path: Option<String>,
}

pub struct DiagnosticsTool {
    lsp: Arc<LspService>,
}

impl DiagnosticsTool {
    pub fn new(deps: &ToolDeps) -> Self {
        Self { lsp: deps.lsp.clone() }
    }
}

#[async_trait]
impl Tool for DiagnosticsTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "diagnostics".into(),
            description: "Report language server diagnostics for a file, or for the whole project when no file is given.".into(),
            parameters: json!({
                "file_path": {"type": "string", "description": "The path to the file to check"},
            }),
            required: Vec::new(),
        }
    }

    async fn run(&self, ctx: &ToolContext, call: &ToolInvocation) -> Result<ToolResponse> {
        let params: DiagnosticsParams = match parse_input(call) {
            Ok(p) => p,
            Err(resp) => return Ok(resp),
        };
        if !self.lsp.has_clients().await {
            return Ok(ToolResponse::text("No language servers are running"));
        }
        let path = params.file_path.as_deref().map(|p| ctx.resolve(p));
        if let Some(path) = &path {
            self.lsp.notify_open_file(path).await;
            self.lsp.wait_for_diagnostics(&ctx.cancel, path).await;
        }
        let out = self.lsp.format_diagnostics(path.as_deref()).await;
        if out.is_empty() {
            return Ok(ToolResponse::text("No diagnostics"));
        }
        Ok(ToolResponse::text(out))
    }
}
