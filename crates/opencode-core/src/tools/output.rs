//! Spooling of oversized tool output.

use std::path::PathBuf;
use std::sync::Mutex;

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::sync::lock_unpoisoned;

pub const MAX_OUTPUT_BYTES: usize = 50 * 1024;
pub const MAX_OUTPUT_LINES: usize = 2000;
/// Lines kept from each end of spooled output.
pub const PREVIEW_LINES: usize = 500;
/// Hard ceiling on any single tool response.
pub const MAX_RESPONSE_BYTES: usize = 1_200_000;
pub const TRUNCATION_MARKER: &str = "\n\n[response truncated]";

/// Saves large output to a per-process temp dir and hands back a preview.
///
/// The directory is created on first use and removed by [`OutputSpool::cleanup`].
#[derive(Debug, Default)]
pub struct OutputSpool {
    dir: Mutex<Option<TempDir>>,
}

impl OutputSpool {
    pub fn new() -> Self {
        Self::default()
    }

    fn dir(&self) -> std::io::Result<PathBuf> {
        let mut guard = lock_unpoisoned(&self.dir);
        if let Some(dir) = guard.as_ref() {
            return Ok(dir.path().to_path_buf());
        }
        let dir = tempfile::Builder::new().prefix("opencode-output-").tempdir()?;
        let path = dir.path().to_path_buf();
        debug!(target: "opencode::tools", dir = %path.display(), "Created output spool dir");
        *guard = Some(dir);
        Ok(path)
    }

    /// Path of the spool dir, if it has been created.
    pub fn current_dir(&self) -> Option<PathBuf> {
        lock_unpoisoned(&self.dir).as_ref().map(|d| d.path().to_path_buf())
    }

    /// Return `output` unchanged when small, otherwise save it and return a
    /// head/tail preview headed `<label truncated: N lines total>`.
    pub fn spool(&self, label: &str, output: &str) -> String {
        let total_lines = output.lines().count();
        if output.len() <= MAX_OUTPUT_BYTES && total_lines <= MAX_OUTPUT_LINES {
            return output.to_string();
        }

        let saved = self.dir().and_then(|dir| {
            let path = dir.join(format!("{label}-{}.txt", uuid::Uuid::new_v4()));
            std::fs::write(&path, output)?;
            Ok(path)
        });
        let location = match saved {
            Ok(path) => format!("Full output saved to: {}", path.display()),
            Err(e) => {
                warn!(target: "opencode::tools", "Failed to spool output: {}", e);
                "Full output could not be saved".to_string()
            }
        };

        let lines: Vec<&str> = output.lines().collect();
        let mut preview = format!("<{label} truncated: {total_lines} lines total>\n{location}\n\n");
        if lines.len() <= PREVIEW_LINES * 2 {
            // Few but very long lines: fall back to a byte preview.
            let head = floor_char_boundary(output, MAX_OUTPUT_BYTES / 2);
            let tail = ceil_char_boundary(output, output.len() - (MAX_OUTPUT_BYTES / 2).min(output.len() - head));
            preview.push_str(&output[..head]);
            preview.push_str("\n\n... [output omitted] ...\n\n");
            preview.push_str(&output[tail..]);
        } else {
            preview.push_str(&lines[..PREVIEW_LINES].join("\n"));
            preview.push_str(&format!(
                "\n\n... [{} lines omitted] ...\n\n",
                lines.len() - PREVIEW_LINES * 2
            ));
            preview.push_str(&lines[lines.len() - PREVIEW_LINES..].join("\n"));
        }
        preview
    }

    pub fn cleanup(&self) {
        if let Some(dir) = lock_unpoisoned(&self.dir).take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(target: "opencode::tools", dir = %path.display(), "Failed to remove spool dir: {}", e);
            }
        }
    }
}

/// Cut `content` at the last line break within `max` bytes and append
/// [`TRUNCATION_MARKER`].
pub fn truncate_response(content: &str, max: usize) -> String {
    if content.len() <= max {
        return content.to_string();
    }
    let limit = floor_char_boundary(content, max);
    let cut = content[..limit].rfind('\n').unwrap_or(limit);
    let mut out = String::with_capacity(cut + TRUNCATION_MARKER.len());
    out.push_str(&content[..cut]);
    out.push_str(TRUNCATION_MARKER);
    out
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(s: &str, mut index: usize) -> usize {
    while index < s.len() && !s.is_char_boundary(index) {
        index += 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_small_output_passes_through() {
        let spool = OutputSpool::new();
        assert_eq!(spool.spool("stdout", "hello\n"), "hello\n");
        assert!(spool.current_dir().is_none());
    }

    #[test]
    fn test_many_lines_are_spooled() {
        let spool = OutputSpool::new();
        let output: String = (1..=3000).map(|i| format!("line {i}\n")).collect();
        let preview = spool.spool("stdout", &output);

        assert!(preview.starts_with("<stdout truncated: 3000 lines total>"));
        assert!(preview.contains("line 1\n"));
        assert!(preview.contains("line 500\n"));
        assert!(!preview.contains("line 501\n"));
        assert!(preview.contains("line 2501\n"));
        assert!(preview.ends_with("line 3000"));

        let dir = spool.current_dir().unwrap();
        let saved = std::fs::read_dir(&dir).unwrap().next().unwrap().unwrap().path();
        assert_eq!(std::fs::read_to_string(saved).unwrap(), output);

        spool.cleanup();
        assert!(!dir.exists());
    }

    #[test]
    fn test_truncate_is_line_aligned() {
        let content = "aaaa\nbbbb\ncccc\n";
        assert_eq!(truncate_response(content, 12), format!("aaaa\nbbbb{TRUNCATION_MARKER}"));
    }

    proptest! {
        #[test]
        fn prop_truncated_response_is_bounded(content in ".{0,400}", max in 1usize..200) {
            let out = truncate_response(&content, max);
            if content.len() > max {
                prop_assert!(out.ends_with(TRUNCATION_MARKER));
                prop_assert!(out.len() <= max + TRUNCATION_MARKER.len());
            } else {
                prop_assert_eq!(out, content);
            }
        }
    }
}
