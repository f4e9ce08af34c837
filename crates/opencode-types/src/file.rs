//! File history types.

use serde::{Deserialize, Serialize};

/// Version tag of the baseline snapshot.
pub const INITIAL_VERSION: &str = "initial";

/// An immutable snapshot of a file touched by a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    pub id: String,
    pub session_id: String,
    pub path: String,
    pub content: String,
    pub version: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl FileVersion {
    pub fn is_initial(&self) -> bool {
        self.version == INITIAL_VERSION
    }

    /// Ordinal of the version tag: 0 for `initial`, N for `vN`.
    pub fn rank(&self) -> u64 {
        version_rank(&self.version)
    }
}

/// Parse a version tag into its ordinal. Unknown tags sort first.
pub fn version_rank(version: &str) -> u64 {
    if version == INITIAL_VERSION {
        return 0;
    }
    version
        .strip_prefix('v')
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or(0)
}

/// Tag following `version`.
pub fn next_version(version: &str) -> String {
    format!("v{}", version_rank(version) + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_rank() {
        assert_eq!(version_rank(INITIAL_VERSION), 0);
        assert_eq!(version_rank("v1"), 1);
        assert_eq!(version_rank("v12"), 12);
        assert_eq!(version_rank("garbage"), 0);
    }

    #[test]
    fn test_next_version() {
        assert_eq!(next_version(INITIAL_VERSION), "v1");
        assert_eq!(next_version("v9"), "v10");
    }
}
