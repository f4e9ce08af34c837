//! MySQL backend over an sqlx connection pool.

use std::time::Duration;

use async_trait::async_trait;
use opencode_types::{ContentPart, FileVersion, FlowState, FlowStatus, Message, Role, Session};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Executor, Row};
use tracing::{debug, info};

use super::Storage;
use crate::config::MysqlConfig;
use crate::{CoreError, Result};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        seq BIGINT NOT NULL AUTO_INCREMENT UNIQUE,
        id VARCHAR(191) NOT NULL PRIMARY KEY,
        parent_session_id VARCHAR(191) NULL,
        root_session_id VARCHAR(191) NULL,
        title TEXT NOT NULL,
        message_count BIGINT NOT NULL DEFAULT 0,
        prompt_tokens BIGINT NOT NULL DEFAULT 0,
        completion_tokens BIGINT NOT NULL DEFAULT 0,
        cost DOUBLE NOT NULL DEFAULT 0,
        summary_message_id VARCHAR(191) NULL,
        project_id VARCHAR(191) NOT NULL DEFAULT '',
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL,
        INDEX idx_sessions_project_created (project_id, created_at DESC),
        INDEX idx_sessions_root (root_session_id)
    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        seq BIGINT NOT NULL AUTO_INCREMENT UNIQUE,
        id VARCHAR(191) NOT NULL PRIMARY KEY,
        session_id VARCHAR(191) NOT NULL,
        role VARCHAR(32) NOT NULL,
        parts LONGTEXT NOT NULL,
        model VARCHAR(191) NULL,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL,
        finished_at BIGINT NULL,
        INDEX idx_messages_session (session_id),
        FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS files (
        seq BIGINT NOT NULL AUTO_INCREMENT UNIQUE,
        id VARCHAR(191) NOT NULL PRIMARY KEY,
        session_id VARCHAR(191) NOT NULL,
        path VARCHAR(512) NOT NULL,
        content LONGTEXT NOT NULL,
        version VARCHAR(64) NOT NULL,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL,
        UNIQUE KEY idx_files_path_session_version (path, session_id, version),
        INDEX idx_files_session (session_id),
        FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS flow_states (
        seq BIGINT NOT NULL AUTO_INCREMENT UNIQUE,
        session_id VARCHAR(191) NOT NULL PRIMARY KEY,
        root_session_id VARCHAR(191) NOT NULL,
        flow_id VARCHAR(191) NOT NULL,
        step_id VARCHAR(191) NOT NULL,
        status VARCHAR(32) NOT NULL,
        args LONGTEXT NOT NULL,
        output LONGTEXT NOT NULL,
        is_struct_output BOOLEAN NOT NULL DEFAULT FALSE,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL,
        INDEX idx_flow_states_root (root_session_id),
        FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
    ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4
    "#,
];

const SESSION_COLUMNS: &str = "id, parent_session_id, root_session_id, title, message_count, \
     prompt_tokens, completion_tokens, cost, summary_message_id, project_id, created_at, updated_at";

const MESSAGE_COLUMNS: &str =
    "id, session_id, role, parts, model, created_at, updated_at, finished_at";

const FILE_COLUMNS: &str = "id, session_id, path, content, version, created_at, updated_at";

const FLOW_STATE_COLUMNS: &str = "session_id, root_session_id, flow_id, step_id, status, args, \
     output, is_struct_output, created_at, updated_at";

/// MySQL-backed storage.
pub struct MysqlStorage {
    pool: MySqlPool,
}

impl MysqlStorage {
    /// Connect with the configured pool limits and run migrations.
    pub async fn connect(config: &MysqlConfig) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .min_connections(config.max_idle_connections.min(config.max_connections))
            .acquire_timeout(Duration::from_secs(config.connection_timeout.max(1)))
            .connect(&config.url())
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        info!(
            target: "opencode::db",
            max_connections = config.max_connections,
            "MySQL pool ready"
        );
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            self.pool.execute(*statement).await?;
        }

        // Older schemas predate structured step output.
        let has_struct_output: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.columns \
             WHERE table_schema = DATABASE() AND table_name = 'flow_states' \
             AND column_name = 'is_struct_output'",
        )
        .fetch_one(&self.pool)
        .await?;
        if has_struct_output == 0 {
            debug!(target: "opencode::db", "Adding flow_states.is_struct_output");
            self.pool
                .execute(
                    "ALTER TABLE flow_states ADD COLUMN is_struct_output BOOLEAN NOT NULL DEFAULT FALSE",
                )
                .await?;
        }
        Ok(())
    }

    fn row_to_session(row: &MySqlRow) -> Result<Session> {
        Ok(Session {
            id: row.try_get("id")?,
            parent_session_id: row.try_get("parent_session_id")?,
            root_session_id: row.try_get("root_session_id")?,
            title: row.try_get("title")?,
            message_count: row.try_get("message_count")?,
            prompt_tokens: row.try_get("prompt_tokens")?,
            completion_tokens: row.try_get("completion_tokens")?,
            cost: row.try_get("cost")?,
            summary_message_id: row.try_get("summary_message_id")?,
            project_id: row.try_get("project_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_message(row: &MySqlRow) -> Result<Message> {
        let role: String = row.try_get("role")?;
        let parts: String = row.try_get("parts")?;
        Ok(Message {
            id: row.try_get("id")?,
            session_id: row.try_get("session_id")?,
            role: role.parse::<Role>().map_err(CoreError::Config)?,
            parts: serde_json::from_str::<Vec<ContentPart>>(&parts)?,
            model: row.try_get("model")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    fn row_to_file(row: &MySqlRow) -> Result<FileVersion> {
        Ok(FileVersion {
            id: row.try_get("id")?,
            session_id: row.try_get("session_id")?,
            path: row.try_get("path")?,
            content: row.try_get("content")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_flow_state(row: &MySqlRow) -> Result<FlowState> {
        let status: String = row.try_get("status")?;
        let args: String = row.try_get("args")?;
        Ok(FlowState {
            session_id: row.try_get("session_id")?,
            root_session_id: row.try_get("root_session_id")?,
            flow_id: row.try_get("flow_id")?,
            step_id: row.try_get("step_id")?,
            status: FlowStatus::parse(&status)
                .ok_or_else(|| CoreError::Config(format!("unknown flow status: {status}")))?,
            args: serde_json::from_str(&args)?,
            output: row.try_get("output")?,
            is_struct_output: row.try_get("is_struct_output")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn fetch_files(&self, sql: &str, binds: &[&str]) -> Result<Vec<FileVersion>> {
        let mut query = sqlx::query(sql);
        for bind in binds {
            query = query.bind(*bind);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_file).collect()
    }
}

#[async_trait]
impl Storage for MysqlStorage {
    fn backend(&self) -> &'static str {
        "mysql"
    }

    async fn insert_session(&self, session: &Session) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO sessions ({SESSION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&session.id)
        .bind(&session.parent_session_id)
        .bind(&session.root_session_id)
        .bind(&session.title)
        .bind(session.message_count)
        .bind(session.prompt_tokens)
        .bind(session.completion_tokens)
        .bind(session.cost)
        .bind(&session.summary_message_id)
        .bind(&session.project_id)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let row = sqlx::query(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_session).transpose()
    }

    async fn list_sessions(&self, project_id: &str) -> Result<Vec<Session>> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE project_id = ? AND parent_session_id IS NULL \
             ORDER BY created_at DESC, seq DESC"
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_session).collect()
    }

    async fn list_child_sessions(&self, root_id: &str) -> Result<Vec<Session>> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE root_session_id = ? \
             ORDER BY created_at ASC, seq ASC"
        ))
        .bind(root_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_session).collect()
    }

    async fn update_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET title = ?, prompt_tokens = ?, completion_tokens = ?, cost = ?, \
             summary_message_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&session.title)
        .bind(session.prompt_tokens)
        .bind(session.completion_tokens)
        .bind(session.cost)
        .bind(&session.summary_message_id)
        .bind(session.updated_at)
        .bind(&session.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn add_session_usage(
        &self,
        id: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
        cost: f64,
        updated_at: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET prompt_tokens = prompt_tokens + ?, completion_tokens = completion_tokens + ?, \
             cost = cost + ?, updated_at = ? WHERE id = ?",
        )
        .bind(prompt_tokens)
        .bind(completion_tokens)
        .bind(cost)
        .bind(updated_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_session_title(&self, id: &str, title: &str, updated_at: i64) -> Result<()> {
        sqlx::query("UPDATE sessions SET title = ?, updated_at = ? WHERE id = ?")
            .bind(title)
            .bind(updated_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_session_summary(&self, id: &str, summary_message_id: &str, updated_at: i64) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET summary_message_id = ?, prompt_tokens = 0, completion_tokens = 0, \
             updated_at = ? WHERE id = ?",
        )
        .bind(summary_message_id)
        .bind(updated_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM sessions WHERE root_session_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted > 0)
    }

    async fn insert_message(&self, message: &Message) -> Result<()> {
        let parts = serde_json::to_string(&message.parts)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(message.role.as_str())
        .bind(parts)
        .bind(&message.model)
        .bind(message.created_at)
        .bind(message.updated_at)
        .bind(message.finished_at)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE sessions SET message_count = message_count + 1, updated_at = ? WHERE id = ?",
        )
        .bind(message.created_at)
        .bind(&message.session_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let row = sqlx::query(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_message).transpose()
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE session_id = ? \
             ORDER BY created_at ASC, seq ASC"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_message).collect()
    }

    async fn update_message(&self, message: &Message) -> Result<()> {
        let parts = serde_json::to_string(&message.parts)?;
        sqlx::query("UPDATE messages SET parts = ?, finished_at = ?, updated_at = ? WHERE id = ?")
            .bind(parts)
            .bind(message.finished_at)
            .bind(message.updated_at)
            .bind(&message.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_message(&self, id: &str) -> Result<Option<Message>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ? FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let message = row.as_ref().map(Self::row_to_message).transpose()?;
        if let Some(message) = &message {
            sqlx::query("DELETE FROM messages WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "UPDATE sessions SET message_count = GREATEST(message_count - 1, 0) WHERE id = ?",
            )
            .bind(&message.session_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(message)
    }

    async fn delete_session_messages(&self, session_id: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query(
            "UPDATE sessions SET message_count = 0, summary_message_id = NULL WHERE id = ?",
        )
        .bind(session_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(deleted)
    }

    async fn insert_file(&self, file: &FileVersion) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO files ({FILE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&file.id)
        .bind(&file.session_id)
        .bind(&file.path)
        .bind(&file.content)
        .bind(&file.version)
        .bind(file.created_at)
        .bind(file.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_file(&self, id: &str) -> Result<Option<FileVersion>> {
        let row = sqlx::query(&format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_file).transpose()
    }

    async fn list_files_by_session(&self, session_id: &str) -> Result<Vec<FileVersion>> {
        self.fetch_files(
            &format!(
                "SELECT {FILE_COLUMNS} FROM files WHERE session_id = ? \
                 ORDER BY created_at ASC, seq ASC"
            ),
            &[session_id],
        )
        .await
    }

    async fn list_files_by_session_tree(&self, root_id: &str) -> Result<Vec<FileVersion>> {
        self.fetch_files(
            &format!(
                "SELECT {FILE_COLUMNS} FROM files WHERE session_id = ? \
                 OR session_id IN (SELECT id FROM sessions WHERE root_session_id = ?) \
                 ORDER BY created_at ASC, seq ASC"
            ),
            &[root_id, root_id],
        )
        .await
    }

    async fn list_files_by_path(&self, session_id: &str, path: &str) -> Result<Vec<FileVersion>> {
        self.fetch_files(
            &format!(
                "SELECT {FILE_COLUMNS} FROM files WHERE session_id = ? AND path = ? \
                 ORDER BY created_at ASC, seq ASC"
            ),
            &[session_id, path],
        )
        .await
    }

    async fn delete_file(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_flow_state(&self, state: &FlowState) -> Result<()> {
        let args = serde_json::to_string(&state.args)?;
        sqlx::query(&format!(
            "INSERT INTO flow_states ({FLOW_STATE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE root_session_id = VALUES(root_session_id), \
             flow_id = VALUES(flow_id), step_id = VALUES(step_id), status = VALUES(status), \
             args = VALUES(args), output = VALUES(output), \
             is_struct_output = VALUES(is_struct_output), updated_at = VALUES(updated_at)"
        ))
        .bind(&state.session_id)
        .bind(&state.root_session_id)
        .bind(&state.flow_id)
        .bind(&state.step_id)
        .bind(state.status.as_str())
        .bind(args)
        .bind(&state.output)
        .bind(state.is_struct_output)
        .bind(state.created_at)
        .bind(state.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_flow_state(&self, session_id: &str) -> Result<Option<FlowState>> {
        let row = sqlx::query(&format!(
            "SELECT {FLOW_STATE_COLUMNS} FROM flow_states WHERE session_id = ?"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_flow_state).transpose()
    }

    async fn list_flow_states(&self, root_session_id: &str) -> Result<Vec<FlowState>> {
        let rows = sqlx::query(&format!(
            "SELECT {FLOW_STATE_COLUMNS} FROM flow_states WHERE root_session_id = ? \
             ORDER BY created_at ASC, seq ASC"
        ))
        .bind(root_session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_flow_state).collect()
    }

    async fn delete_flow_states(&self, root_session_id: &str) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM flow_states WHERE root_session_id = ?")
            .bind(root_session_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }
}
