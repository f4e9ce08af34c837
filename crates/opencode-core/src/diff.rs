//! Line diffs between file versions.
//!
//! Used by the file-mutating tools to report what changed and by the file
//! history to compute a session tree's modified set.

use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};

/// Line counts of a diff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub additions: u32,
    pub removals: u32,
}

impl DiffStats {
    pub fn is_empty(&self) -> bool {
        self.additions == 0 && self.removals == 0
    }
}

/// A unified diff plus its line counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub diff: String,
    pub additions: u32,
    pub removals: u32,
}

/// Count added and removed lines between two texts.
pub fn diff_stats(old: &str, new: &str) -> DiffStats {
    if old == new {
        return DiffStats::default();
    }
    // null bytes mean binary content; report a whole-file replacement
    if old.contains('\0') || new.contains('\0') {
        return DiffStats {
            additions: u32::from(!new.is_empty()),
            removals: u32::from(!old.is_empty()),
        };
    }

    let diff = TextDiff::from_lines(old, new);
    let mut stats = DiffStats::default();
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => stats.additions += 1,
            ChangeTag::Delete => stats.removals += 1,
            ChangeTag::Equal => {}
        }
    }
    stats
}

/// Unified diff with `context` lines around each hunk, headed by `path`.
pub fn unified_diff(path: &str, old: &str, new: &str, context: usize) -> FileDiff {
    let stats = diff_stats(old, new);
    if stats.is_empty() {
        return FileDiff::default();
    }
    let diff = TextDiff::from_lines(old, new);
    let text = diff
        .unified_diff()
        .context_radius(context)
        .header(&format!("a/{path}"), &format!("b/{path}"))
        .to_string();
    FileDiff {
        diff: text,
        additions: stats.additions,
        removals: stats.removals,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_has_no_changes() {
        let stats = diff_stats("a\nb\n", "a\nb\n");
        assert!(stats.is_empty());
        assert!(unified_diff("x", "a\n", "a\n", 3).diff.is_empty());
    }

    #[test]
    fn test_counts_additions_and_removals() {
        let stats = diff_stats("a\nb\nc\n", "a\nB\nc\nd\n");
        assert_eq!(stats.additions, 2);
        assert_eq!(stats.removals, 1);
    }

    #[test]
    fn test_unified_diff_has_headers() {
        let diff = unified_diff("src/main.rs", "one\n", "two\n", 3);
        assert!(diff.diff.contains("--- a/src/main.rs"));
        assert!(diff.diff.contains("+++ b/src/main.rs"));
        assert!(diff.diff.contains("-one"));
        assert!(diff.diff.contains("+two"));
    }

    #[test]
    fn test_binary_is_whole_file() {
        let stats = diff_stats("a\0b", "c\0d");
        assert_eq!(stats, DiffStats { additions: 1, removals: 1 });
    }
}
