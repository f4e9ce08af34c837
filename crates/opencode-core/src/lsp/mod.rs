//! Language server supervision.

mod client;
mod install;
mod service;

pub use client::LspClient;
pub use install::InstallStrategy;
pub use service::{DIAGNOSTICS_WAIT, LspService, ServerSpec, builtin_servers};

use std::path::{Path, PathBuf};

pub use lsp_types::{Diagnostic, DiagnosticSeverity, FileChangeType, Url};

use crate::{CoreError, Result};

pub fn severity_label(severity: Option<DiagnosticSeverity>) -> &'static str {
    match severity {
        Some(DiagnosticSeverity::WARNING) => "Warn",
        Some(DiagnosticSeverity::INFORMATION) => "Info",
        Some(DiagnosticSeverity::HINT) => "Hint",
        _ => "Error",
    }
}

/// Missing severity counts as an error.
pub fn is_error(diag: &Diagnostic) -> bool {
    diag.severity.unwrap_or(DiagnosticSeverity::ERROR) == DiagnosticSeverity::ERROR
}

/// `Error: /path:12:4 [source] message`, with 1-based positions.
pub fn format_diagnostic(diag: &Diagnostic, path: &str) -> String {
    let source = diag
        .source
        .as_deref()
        .map(|s| format!(" [{s}]"))
        .unwrap_or_default();
    format!(
        "{}: {}:{}:{}{} {}",
        severity_label(diag.severity),
        path,
        diag.range.start.line + 1,
        diag.range.start.character + 1,
        source,
        diag.message
    )
}

pub fn path_to_uri(path: &Path) -> Result<Url> {
    Url::from_file_path(path).map_err(|_| CoreError::Lsp(format!("not an absolute path: {}", path.display())))
}

pub fn uri_to_path(uri: &Url) -> PathBuf {
    uri.to_file_path().unwrap_or_else(|_| PathBuf::from(uri.path()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_round_trip_with_spaces() {
        let path = Path::new("/tmp/my project/main.go");
        let uri = path_to_uri(path).unwrap();
        assert_eq!(uri.as_str(), "file:///tmp/my%20project/main.go");
        assert_eq!(uri_to_path(&uri), path);
    }

    #[test]
    fn test_diagnostic_format() {
        let diag: Diagnostic = serde_json::from_value(serde_json::json!({
            "range": {"start": {"line": 2, "character": 4}, "end": {"line": 2, "character": 9}},
            "severity": 2,
            "source": "gopls",
            "message": "unused variable"
        }))
        .unwrap();
        assert_eq!(format_diagnostic(&diag, "/a.go"), "Warn: /a.go:3:5 [gopls] unused variable");
        assert!(!is_error(&diag));
    }

    #[test]
    fn test_relative_path_has_no_uri() {
        assert!(path_to_uri(Path::new("src/main.go")).is_err());
    }
}
