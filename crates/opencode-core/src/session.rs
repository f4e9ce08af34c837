//! Session store.

use std::sync::Arc;

use opencode_types::{DEFAULT_SESSION_TITLE, Event, EventKind, Session, new_id, now_unix};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::db::Storage;
use crate::pubsub::Broker;
use crate::{CoreError, Result};

/// Creates, updates and deletes sessions, publishing every change.
pub struct SessionService {
    storage: Arc<dyn Storage>,
    broker: Broker<Session>,
    project_id: String,
}

impl SessionService {
    pub fn new(storage: Arc<dyn Storage>, project_id: impl Into<String>) -> Self {
        Self {
            storage,
            broker: Broker::new(),
            project_id: project_id.into(),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Create a top-level session with a generated id.
    pub async fn create(&self, title: &str) -> Result<Session> {
        self.insert(new_id(), None, None, title).await
    }

    /// Create a top-level session with a caller supplied id.
    pub async fn create_with_id(&self, id: &str, title: &str) -> Result<Session> {
        self.insert(id.to_string(), None, None, title).await
    }

    /// Create a session under `parent_id`, rooted at the parent's tree root.
    pub async fn create_child(
        &self,
        id: Option<&str>,
        parent_id: &str,
        title: &str,
    ) -> Result<Session> {
        let parent = self.get(parent_id).await?;
        let root = parent.tree_root_id().to_string();
        let id = id.map(str::to_string).unwrap_or_else(new_id);
        self.insert(id, Some(parent.id), Some(root), title).await
    }

    /// Session for a subagent invoked by tool call `tool_call_id`.
    pub async fn create_task_session(
        &self,
        tool_call_id: &str,
        parent_id: &str,
        title: &str,
    ) -> Result<Session> {
        self.create_child(Some(tool_call_id), parent_id, title).await
    }

    async fn insert(
        &self,
        id: String,
        parent_session_id: Option<String>,
        root_session_id: Option<String>,
        title: &str,
    ) -> Result<Session> {
        let now = now_unix();
        let title = if title.trim().is_empty() {
            DEFAULT_SESSION_TITLE.to_string()
        } else {
            title.to_string()
        };
        let session = Session {
            id,
            parent_session_id,
            root_session_id,
            title,
            message_count: 0,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost: 0.0,
            summary_message_id: None,
            project_id: self.project_id.clone(),
            created_at: now,
            updated_at: now,
        };
        self.storage.insert_session(&session).await?;
        info!(
            target: "opencode::session",
            session_id = %session.id,
            parent = ?session.parent_session_id,
            "Session created"
        );
        self.broker.publish(EventKind::Created, session.clone()).await;
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Result<Session> {
        self.find(id)
            .await?
            .ok_or_else(|| CoreError::SessionNotFound(id.to_string()))
    }

    pub async fn find(&self, id: &str) -> Result<Option<Session>> {
        self.storage.get_session(id).await
    }

    /// Top-level sessions of the current project, newest first.
    pub async fn list(&self) -> Result<Vec<Session>> {
        self.storage.list_sessions(&self.project_id).await
    }

    pub async fn list_children(&self, root_id: &str) -> Result<Vec<Session>> {
        self.storage.list_child_sessions(root_id).await
    }

    /// Persist title, usage and summary pointer. Returns the stored row.
    ///
    /// This overwrites the whole row; concurrent writers use the
    /// column-scoped updates below instead.
    pub async fn update(&self, mut session: Session) -> Result<Session> {
        session.updated_at = now_unix();
        self.storage.update_session(&session).await?;
        self.publish_updated(&session.id).await
    }

    /// Add token usage and cost to the running totals.
    pub async fn add_usage(
        &self,
        id: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
        cost: f64,
    ) -> Result<Session> {
        self.storage
            .add_session_usage(id, prompt_tokens.max(0), completion_tokens.max(0), cost.max(0.0), now_unix())
            .await?;
        self.publish_updated(id).await
    }

    pub async fn set_title(&self, id: &str, title: &str) -> Result<Session> {
        self.storage.set_session_title(id, title, now_unix()).await?;
        self.publish_updated(id).await
    }

    /// Record the summary message and reset the token counters.
    pub async fn set_summary(&self, id: &str, summary_message_id: &str) -> Result<Session> {
        self.storage
            .set_session_summary(id, summary_message_id, now_unix())
            .await?;
        self.publish_updated(id).await
    }

    async fn publish_updated(&self, id: &str) -> Result<Session> {
        let stored = self.get(id).await?;
        debug!(target: "opencode::session", session_id = %stored.id, "Session updated");
        self.broker.publish(EventKind::Updated, stored.clone()).await;
        Ok(stored)
    }

    /// Delete a session with its messages, files, flow states and descendants.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let session = self.get(id).await?;
        let descendants = self.storage.list_child_sessions(id).await?;
        self.storage.delete_session(id).await?;
        info!(
            target: "opencode::session",
            session_id = %id,
            descendants = descendants.len(),
            "Session deleted"
        );
        for child in descendants {
            self.broker.publish(EventKind::Deleted, child).await;
        }
        self.broker.publish(EventKind::Deleted, session).await;
        Ok(())
    }

    pub fn subscribe(&self, cancel: &CancellationToken) -> mpsc::Receiver<Event<Session>> {
        self.broker.subscribe(cancel)
    }

    pub fn shutdown(&self) {
        self.broker.shutdown();
    }
}
