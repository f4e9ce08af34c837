//! File history: versioned snapshots of files touched by tools.

use std::collections::BTreeMap;
use std::sync::Arc;

use opencode_types::{
    Event, EventKind, FileVersion, INITIAL_VERSION, new_id, next_version, now_unix,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::db::Storage;
use crate::diff::diff_stats;
use crate::pubsub::Broker;
use crate::{CoreError, Result};

/// A path whose latest version differs from its baseline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifiedFile {
    pub path: String,
    pub additions: u32,
    pub removals: u32,
}

pub struct FileHistoryService {
    storage: Arc<dyn Storage>,
    broker: Broker<FileVersion>,
}

impl FileHistoryService {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            broker: Broker::new(),
        }
    }

    /// Register the baseline content of `path` for a session.
    pub async fn create(&self, session_id: &str, path: &str, content: &str) -> Result<FileVersion> {
        self.insert(session_id, path, content, INITIAL_VERSION.to_string())
            .await
    }

    /// Record a new version; the first version recorded becomes the baseline.
    pub async fn create_version(
        &self,
        session_id: &str,
        path: &str,
        content: &str,
    ) -> Result<FileVersion> {
        let version = match self.latest_by_path(session_id, path).await? {
            Some(latest) => next_version(&latest.version),
            None => INITIAL_VERSION.to_string(),
        };
        self.insert(session_id, path, content, version).await
    }

    async fn insert(
        &self,
        session_id: &str,
        path: &str,
        content: &str,
        version: String,
    ) -> Result<FileVersion> {
        let now = now_unix();
        let file = FileVersion {
            id: new_id(),
            session_id: session_id.to_string(),
            path: path.to_string(),
            content: content.to_string(),
            version,
            created_at: now,
            updated_at: now,
        };
        self.storage.insert_file(&file).await?;
        debug!(
            target: "opencode::session",
            session_id = %session_id,
            path = %path,
            version = %file.version,
            "File version recorded"
        );
        self.broker.publish(EventKind::Created, file.clone()).await;
        Ok(file)
    }

    pub async fn get(&self, id: &str) -> Result<FileVersion> {
        self.storage
            .get_file(id)
            .await?
            .ok_or_else(|| CoreError::FileNotFound(id.to_string()))
    }

    /// Latest version of `path` in a session.
    pub async fn get_by_path(&self, session_id: &str, path: &str) -> Result<FileVersion> {
        self.latest_by_path(session_id, path)
            .await?
            .ok_or_else(|| CoreError::FileNotFound(path.to_string()))
    }

    async fn latest_by_path(&self, session_id: &str, path: &str) -> Result<Option<FileVersion>> {
        let versions = self.storage.list_files_by_path(session_id, path).await?;
        Ok(versions.into_iter().max_by_key(|f| f.rank()))
    }

    pub async fn list_by_session(&self, session_id: &str) -> Result<Vec<FileVersion>> {
        self.storage.list_files_by_session(session_id).await
    }

    pub async fn list_by_session_tree(&self, root_id: &str) -> Result<Vec<FileVersion>> {
        self.storage.list_files_by_session_tree(root_id).await
    }

    /// Latest version of every path in a session, ordered by path.
    pub async fn list_latest_session_files(&self, session_id: &str) -> Result<Vec<FileVersion>> {
        let files = self.storage.list_files_by_session(session_id).await?;
        let mut latest: BTreeMap<String, FileVersion> = BTreeMap::new();
        for file in files {
            match latest.get(&file.path) {
                Some(current) if current.rank() > file.rank() => {}
                _ => {
                    latest.insert(file.path.clone(), file);
                }
            }
        }
        Ok(latest.into_values().collect())
    }

    /// Latest version of every path across a session tree, ordered by path.
    ///
    /// Version tags are per session, so recency across sessions follows
    /// storage order.
    pub async fn list_latest_session_tree_files(&self, root_id: &str) -> Result<Vec<FileVersion>> {
        let files = self.storage.list_files_by_session_tree(root_id).await?;
        let mut latest: BTreeMap<String, FileVersion> = BTreeMap::new();
        for file in files {
            latest.insert(file.path.clone(), file);
        }
        Ok(latest.into_values().collect())
    }

    /// Paths in a session tree whose latest content differs from the first baseline.
    pub async fn modified_files(&self, root_id: &str) -> Result<Vec<ModifiedFile>> {
        let files = self.storage.list_files_by_session_tree(root_id).await?;
        let mut initial: BTreeMap<String, String> = BTreeMap::new();
        let mut latest: BTreeMap<String, String> = BTreeMap::new();
        for file in files {
            if file.is_initial() && !initial.contains_key(&file.path) {
                initial.insert(file.path.clone(), file.content.clone());
            }
            latest.insert(file.path, file.content);
        }

        let mut modified = Vec::new();
        for (path, content) in latest {
            let base = initial.get(&path).map(String::as_str).unwrap_or("");
            let stats = diff_stats(base, &content);
            if !stats.is_empty() {
                modified.push(ModifiedFile {
                    path,
                    additions: stats.additions,
                    removals: stats.removals,
                });
            }
        }
        Ok(modified)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let file = self.get(id).await?;
        self.storage.delete_file(id).await?;
        self.broker.publish(EventKind::Deleted, file).await;
        Ok(())
    }

    pub fn subscribe(&self, cancel: &CancellationToken) -> mpsc::Receiver<Event<FileVersion>> {
        self.broker.subscribe(cancel)
    }

    pub fn shutdown(&self) {
        self.broker.shutdown();
    }
}
