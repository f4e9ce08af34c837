use std::path::{Path, PathBuf};
use std::time::SystemTime;

use dashmap::DashMap;

#[derive(Debug, Clone, Copy, Default)]
struct FileRecord {
    read_at: Option<SystemTime>,
    written_at: Option<SystemTime>,
}

/// Remembers when files were last read or written by a tool, so writes never
/// clobber content the model has not seen.
#[derive(Debug, Default)]
pub struct FileTracker {
    records: DashMap<PathBuf, FileRecord>,
}

impl FileTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self, path: &Path) {
        self.records.entry(path.to_path_buf()).or_default().read_at = Some(SystemTime::now());
    }

    /// A tool's own write counts as a read of the new content.
    pub fn record_write(&self, path: &Path) {
        let now = SystemTime::now();
        let mut record = self.records.entry(path.to_path_buf()).or_default();
        record.written_at = Some(now);
        record.read_at = Some(now);
    }

    pub fn last_read(&self, path: &Path) -> Option<SystemTime> {
        self.records.get(path).and_then(|r| r.read_at)
    }

    pub fn last_write(&self, path: &Path) -> Option<SystemTime> {
        self.records.get(path).and_then(|r| r.written_at)
    }

    /// Missing files may always be created. Existing files must have been
    /// read, and not modified since.
    pub fn ensure_writable(&self, path: &Path) -> Result<(), String> {
        let Ok(meta) = std::fs::metadata(path) else {
            return Ok(());
        };
        if meta.is_dir() {
            return Err(format!("path is a directory, not a file: {}", path.display()));
        }
        let Some(read_at) = self.last_read(path) else {
            return Err(format!(
                "you must read the file before editing it, use the view tool first: {}",
                path.display()
            ));
        };
        if let Ok(modified) = meta.modified() {
            if modified > read_at {
                return Err(format!(
                    "file {} has been modified since it was last read, read it again before editing",
                    path.display()
                ));
            }
        }
        Ok(())
    }
}
