//! Durable storage for sessions, messages, file versions and flow states.

mod mysql;
mod sqlite;

pub use mysql::MysqlStorage;
pub use sqlite::SqliteStorage;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use opencode_types::{FileVersion, FlowState, Message, Session};
use tracing::info;

use crate::Result;
use crate::config::{Config, SessionProviderType};

/// File name of the embedded database inside the data directory.
pub const SQLITE_FILE_NAME: &str = "opencode.db";

/// Storage backend contract shared by the SQLite and MySQL implementations.
///
/// Deleting a session removes its messages, files and flow states and every
/// session whose root it is. `message_count` is maintained by the message
/// insert/delete operations in the same transaction.
#[async_trait]
pub trait Storage: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn insert_session(&self, session: &Session) -> Result<()>;
    async fn get_session(&self, id: &str) -> Result<Option<Session>>;
    /// Top-level sessions of a project, newest first.
    async fn list_sessions(&self, project_id: &str) -> Result<Vec<Session>>;
    /// Every session whose root is `root_id`, oldest first.
    async fn list_child_sessions(&self, root_id: &str) -> Result<Vec<Session>>;
    /// Persist title, usage, cost and summary pointer. Leaves `message_count` alone.
    async fn update_session(&self, session: &Session) -> Result<()>;
    /// Increment the usage counters and cost in place.
    async fn add_session_usage(
        &self,
        id: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
        cost: f64,
        updated_at: i64,
    ) -> Result<()>;
    async fn set_session_title(&self, id: &str, title: &str, updated_at: i64) -> Result<()>;
    /// Point at the summary message and zero the token counters. Cost is kept.
    async fn set_session_summary(&self, id: &str, summary_message_id: &str, updated_at: i64) -> Result<()>;
    /// Returns false when nothing was deleted.
    async fn delete_session(&self, id: &str) -> Result<bool>;

    async fn insert_message(&self, message: &Message) -> Result<()>;
    async fn get_message(&self, id: &str) -> Result<Option<Message>>;
    /// Messages of a session, oldest first.
    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>>;
    async fn update_message(&self, message: &Message) -> Result<()>;
    /// Returns the deleted message.
    async fn delete_message(&self, id: &str) -> Result<Option<Message>>;
    async fn delete_session_messages(&self, session_id: &str) -> Result<u64>;

    async fn insert_file(&self, file: &FileVersion) -> Result<()>;
    async fn get_file(&self, id: &str) -> Result<Option<FileVersion>>;
    async fn list_files_by_session(&self, session_id: &str) -> Result<Vec<FileVersion>>;
    /// Files of the root session and every session in its tree.
    async fn list_files_by_session_tree(&self, root_id: &str) -> Result<Vec<FileVersion>>;
    async fn list_files_by_path(&self, session_id: &str, path: &str) -> Result<Vec<FileVersion>>;
    async fn delete_file(&self, id: &str) -> Result<()>;

    async fn upsert_flow_state(&self, state: &FlowState) -> Result<()>;
    async fn get_flow_state(&self, session_id: &str) -> Result<Option<FlowState>>;
    async fn list_flow_states(&self, root_session_id: &str) -> Result<Vec<FlowState>>;
    async fn delete_flow_states(&self, root_session_id: &str) -> Result<u64>;
}

/// Open the configured backend, running migrations.
pub async fn open(config: &Config) -> Result<Arc<dyn Storage>> {
    match config.session_provider.kind {
        SessionProviderType::Sqlite => {
            let path = config.data_dir().join(SQLITE_FILE_NAME);
            let storage = SqliteStorage::open(&path)?;
            info!(target: "opencode::db", path = %path.display(), "Opened SQLite storage");
            Ok(Arc::new(storage))
        }
        SessionProviderType::Mysql => {
            let storage = MysqlStorage::connect(&config.session_provider.mysql).await?;
            info!(target: "opencode::db", "Connected to MySQL storage");
            Ok(Arc::new(storage))
        }
    }
}

/// Open an SQLite database at an explicit path.
pub fn open_sqlite(path: &Path) -> Result<Arc<dyn Storage>> {
    Ok(Arc::new(SqliteStorage::open(path)?))
}
