//! Embedded SQLite backend.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use opencode_types::{ContentPart, FileVersion, FlowState, FlowStatus, Message, Role, Session};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;

use super::Storage;
use crate::Result;
use crate::sync::lock_unpoisoned;

const SESSION_COLUMNS: &str = "id, parent_session_id, root_session_id, title, message_count, \
     prompt_tokens, completion_tokens, cost, summary_message_id, project_id, created_at, updated_at";

const MESSAGE_COLUMNS: &str =
    "id, session_id, role, parts, model, created_at, updated_at, finished_at";

const FILE_COLUMNS: &str = "id, session_id, path, content, version, created_at, updated_at";

const FLOW_STATE_COLUMNS: &str = "session_id, root_session_id, flow_id, step_id, status, args, \
     output, is_struct_output, created_at, updated_at";

/// SQLite-based storage.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        // journal_mode returns a row, so it cannot go through execute_batch
        let _: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch(
            r#"
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        store.migrate()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = lock_unpoisoned(&self.conn);
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                parent_session_id TEXT,
                root_session_id TEXT,
                title TEXT NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 0 CHECK (message_count >= 0),
                prompt_tokens INTEGER NOT NULL DEFAULT 0 CHECK (prompt_tokens >= 0),
                completion_tokens INTEGER NOT NULL DEFAULT 0 CHECK (completion_tokens >= 0),
                cost REAL NOT NULL DEFAULT 0.0 CHECK (cost >= 0.0),
                summary_message_id TEXT,
                project_id TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_project_created
                ON sessions(project_id, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_sessions_root ON sessions(root_session_id);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                parts TEXT NOT NULL DEFAULT '[]',
                model TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                finished_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);

            CREATE TABLE IF NOT EXISTS files (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                path TEXT NOT NULL,
                content TEXT NOT NULL,
                version TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(path, session_id, version)
            );

            CREATE INDEX IF NOT EXISTS idx_files_session ON files(session_id);
            CREATE INDEX IF NOT EXISTS idx_files_path ON files(path);

            CREATE TABLE IF NOT EXISTS flow_states (
                session_id TEXT PRIMARY KEY REFERENCES sessions(id) ON DELETE CASCADE,
                root_session_id TEXT NOT NULL,
                flow_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                status TEXT NOT NULL,
                args TEXT NOT NULL DEFAULT '{}',
                output TEXT NOT NULL DEFAULT '',
                is_struct_output INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_flow_states_root ON flow_states(root_session_id);
            "#,
        )?;
        Ok(())
    }

    /// Bring databases created by older releases up to the current schema.
    /// Fresh databases already match it.
    fn migrate(&self) -> Result<()> {
        let conn = lock_unpoisoned(&self.conn);
        if !has_column(&conn, "flow_states", "is_struct_output")? {
            debug!(target: "opencode::db", "Adding flow_states.is_struct_output");
            conn.execute_batch(
                "ALTER TABLE flow_states ADD COLUMN is_struct_output INTEGER NOT NULL DEFAULT 0;",
            )?;
        }

        Ok(())
    }

    fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
        Ok(Session {
            id: row.get(0)?,
            parent_session_id: row.get(1)?,
            root_session_id: row.get(2)?,
            title: row.get(3)?,
            message_count: row.get(4)?,
            prompt_tokens: row.get(5)?,
            completion_tokens: row.get(6)?,
            cost: row.get(7)?,
            summary_message_id: row.get(8)?,
            project_id: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
        let role: String = row.get(2)?;
        let parts: String = row.get(3)?;
        Ok(Message {
            id: row.get(0)?,
            session_id: row.get(1)?,
            role: role.parse::<Role>().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into())
            })?,
            parts: serde_json::from_str::<Vec<ContentPart>>(&parts).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e))
            })?,
            model: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            finished_at: row.get(7)?,
        })
    }

    fn row_to_file(row: &Row) -> rusqlite::Result<FileVersion> {
        Ok(FileVersion {
            id: row.get(0)?,
            session_id: row.get(1)?,
            path: row.get(2)?,
            content: row.get(3)?,
            version: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn row_to_flow_state(row: &Row) -> rusqlite::Result<FlowState> {
        let status: String = row.get(4)?;
        let args: String = row.get(5)?;
        Ok(FlowState {
            session_id: row.get(0)?,
            root_session_id: row.get(1)?,
            flow_id: row.get(2)?,
            step_id: row.get(3)?,
            status: FlowStatus::parse(&status).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    4,
                    Type::Text,
                    format!("unknown flow status: {status}").into(),
                )
            })?,
            args: serde_json::from_str(&args).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e))
            })?,
            output: row.get(6)?,
            is_struct_output: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn query_sessions(&self, sql: &str, arg: &str) -> Result<Vec<Session>> {
        let conn = lock_unpoisoned(&self.conn);
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![arg], Self::row_to_session)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn query_files(&self, sql: &str, args: &[&str]) -> Result<Vec<FileVersion>> {
        let conn = lock_unpoisoned(&self.conn);
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), Self::row_to_file)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM pragma_table_info(?1) WHERE name = ?2",
        params![table, column],
        |row| row.get(0),
    )
}

#[async_trait]
impl Storage for SqliteStorage {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn insert_session(&self, session: &Session) -> Result<()> {
        let conn = lock_unpoisoned(&self.conn);
        conn.execute(
            &format!(
                "INSERT INTO sessions ({SESSION_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                session.id,
                session.parent_session_id,
                session.root_session_id,
                session.title,
                session.message_count,
                session.prompt_tokens,
                session.completion_tokens,
                session.cost,
                session.summary_message_id,
                session.project_id,
                session.created_at,
                session.updated_at,
            ],
        )?;
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let conn = lock_unpoisoned(&self.conn);
        let session = conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![id],
                Self::row_to_session,
            )
            .optional()?;
        Ok(session)
    }

    async fn list_sessions(&self, project_id: &str) -> Result<Vec<Session>> {
        self.query_sessions(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM sessions \
                 WHERE project_id = ?1 AND parent_session_id IS NULL \
                 ORDER BY created_at DESC, rowid DESC"
            ),
            project_id,
        )
    }

    async fn list_child_sessions(&self, root_id: &str) -> Result<Vec<Session>> {
        self.query_sessions(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM sessions \
                 WHERE root_session_id = ?1 ORDER BY created_at ASC, rowid ASC"
            ),
            root_id,
        )
    }

    async fn update_session(&self, session: &Session) -> Result<()> {
        let conn = lock_unpoisoned(&self.conn);
        conn.execute(
            r#"
            UPDATE sessions SET
                title = ?2, prompt_tokens = ?3, completion_tokens = ?4, cost = ?5,
                summary_message_id = ?6, updated_at = ?7
            WHERE id = ?1
            "#,
            params![
                session.id,
                session.title,
                session.prompt_tokens,
                session.completion_tokens,
                session.cost,
                session.summary_message_id,
                session.updated_at,
            ],
        )?;
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
        let conn = lock_unpoisoned(&self.conn);
        conn.execute(
            r#"
            UPDATE sessions SET
                prompt_tokens = prompt_tokens + ?2,
                completion_tokens = completion_tokens + ?3,
                cost = cost + ?4,
                updated_at = ?5
            WHERE id = ?1
            "#,
            params![id, prompt_tokens, completion_tokens, cost, updated_at],
        )?;
        Ok(())
    }

    async fn set_session_title(&self, id: &str, title: &str, updated_at: i64) -> Result<()> {
        let conn = lock_unpoisoned(&self.conn);
        conn.execute(
            "UPDATE sessions SET title = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, title, updated_at],
        )?;
        Ok(())
    }

    async fn set_session_summary(&self, id: &str, summary_message_id: &str, updated_at: i64) -> Result<()> {
        let conn = lock_unpoisoned(&self.conn);
        conn.execute(
            r#"
            UPDATE sessions SET
                summary_message_id = ?2, prompt_tokens = 0, completion_tokens = 0, updated_at = ?3
            WHERE id = ?1
            "#,
            params![id, summary_message_id, updated_at],
        )?;
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> Result<bool> {
        let mut conn = lock_unpoisoned(&self.conn);
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM sessions WHERE root_session_id = ?1", params![id])?;
        let deleted = tx.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    async fn insert_message(&self, message: &Message) -> Result<()> {
        let parts = serde_json::to_string(&message.parts)?;
        let mut conn = lock_unpoisoned(&self.conn);
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            params![
                message.id,
                message.session_id,
                message.role.as_str(),
                parts,
                message.model,
                message.created_at,
                message.updated_at,
                message.finished_at,
            ],
        )?;
        tx.execute(
            "UPDATE sessions SET message_count = message_count + 1, updated_at = ?2 WHERE id = ?1",
            params![message.session_id, message.created_at],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let conn = lock_unpoisoned(&self.conn);
        let message = conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
                Self::row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let conn = lock_unpoisoned(&self.conn);
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE session_id = ?1 \
             ORDER BY created_at ASC, rowid ASC"
        ))?;
        let rows = stmt
            .query_map(params![session_id], Self::row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn update_message(&self, message: &Message) -> Result<()> {
        let parts = serde_json::to_string(&message.parts)?;
        let conn = lock_unpoisoned(&self.conn);
        conn.execute(
            "UPDATE messages SET parts = ?2, finished_at = ?3, updated_at = ?4 WHERE id = ?1",
            params![message.id, parts, message.finished_at, message.updated_at],
        )?;
        Ok(())
    }

    async fn delete_message(&self, id: &str) -> Result<Option<Message>> {
        let mut conn = lock_unpoisoned(&self.conn);
        let tx = conn.transaction()?;
        let message = tx
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
                Self::row_to_message,
            )
            .optional()?;
        if let Some(message) = &message {
            tx.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
            tx.execute(
                "UPDATE sessions SET message_count = MAX(message_count - 1, 0) WHERE id = ?1",
                params![message.session_id],
            )?;
        }
        tx.commit()?;
        Ok(message)
    }

    async fn delete_session_messages(&self, session_id: &str) -> Result<u64> {
        let mut conn = lock_unpoisoned(&self.conn);
        let tx = conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM messages WHERE session_id = ?1",
            params![session_id],
        )?;
        tx.execute(
            "UPDATE sessions SET message_count = 0, summary_message_id = NULL WHERE id = ?1",
            params![session_id],
        )?;
        tx.commit()?;
        Ok(deleted as u64)
    }

    async fn insert_file(&self, file: &FileVersion) -> Result<()> {
        let conn = lock_unpoisoned(&self.conn);
        conn.execute(
            &format!("INSERT INTO files ({FILE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                file.id,
                file.session_id,
                file.path,
                file.content,
                file.version,
                file.created_at,
                file.updated_at,
            ],
        )?;
        Ok(())
    }

    async fn get_file(&self, id: &str) -> Result<Option<FileVersion>> {
        let conn = lock_unpoisoned(&self.conn);
        let file = conn
            .query_row(
                &format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1"),
                params![id],
                Self::row_to_file,
            )
            .optional()?;
        Ok(file)
    }

    async fn list_files_by_session(&self, session_id: &str) -> Result<Vec<FileVersion>> {
        self.query_files(
            &format!(
                "SELECT {FILE_COLUMNS} FROM files WHERE session_id = ?1 \
                 ORDER BY created_at ASC, rowid ASC"
            ),
            &[session_id],
        )
    }

    async fn list_files_by_session_tree(&self, root_id: &str) -> Result<Vec<FileVersion>> {
        self.query_files(
            &format!(
                "SELECT {FILE_COLUMNS} FROM files WHERE session_id = ?1 \
                 OR session_id IN (SELECT id FROM sessions WHERE root_session_id = ?1) \
                 ORDER BY created_at ASC, rowid ASC"
            ),
            &[root_id],
        )
    }

    async fn list_files_by_path(&self, session_id: &str, path: &str) -> Result<Vec<FileVersion>> {
        self.query_files(
            &format!(
                "SELECT {FILE_COLUMNS} FROM files WHERE session_id = ?1 AND path = ?2 \
                 ORDER BY created_at ASC, rowid ASC"
            ),
            &[session_id, path],
        )
    }

    async fn delete_file(&self, id: &str) -> Result<()> {
        let conn = lock_unpoisoned(&self.conn);
        conn.execute("DELETE FROM files WHERE id = ?1", params![id])?;
        Ok(())
    }

    async fn upsert_flow_state(&self, state: &FlowState) -> Result<()> {
        let args = serde_json::to_string(&state.args)?;
        let conn = lock_unpoisoned(&self.conn);
        conn.execute(
            &format!(
                "INSERT INTO flow_states ({FLOW_STATE_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                 ON CONFLICT(session_id) DO UPDATE SET \
                    root_session_id = excluded.root_session_id, \
                    flow_id = excluded.flow_id, \
                    step_id = excluded.step_id, \
                    status = excluded.status, \
                    args = excluded.args, \
                    output = excluded.output, \
                    is_struct_output = excluded.is_struct_output, \
                    updated_at = excluded.updated_at"
            ),
            params![
                state.session_id,
                state.root_session_id,
                state.flow_id,
                state.step_id,
                state.status.as_str(),
                args,
                state.output,
                state.is_struct_output,
                state.created_at,
                state.updated_at,
            ],
        )?;
        Ok(())
    }

    async fn get_flow_state(&self, session_id: &str) -> Result<Option<FlowState>> {
        let conn = lock_unpoisoned(&self.conn);
        let state = conn
            .query_row(
                &format!("SELECT {FLOW_STATE_COLUMNS} FROM flow_states WHERE session_id = ?1"),
                params![session_id],
                Self::row_to_flow_state,
            )
            .optional()?;
        Ok(state)
    }

    async fn list_flow_states(&self, root_session_id: &str) -> Result<Vec<FlowState>> {
        let conn = lock_unpoisoned(&self.conn);
        let mut stmt = conn.prepare(&format!(
            "SELECT {FLOW_STATE_COLUMNS} FROM flow_states WHERE root_session_id = ?1 \
             ORDER BY created_at ASC, rowid ASC"
        ))?;
        let rows = stmt
            .query_map(params![root_session_id], Self::row_to_flow_state)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn delete_flow_states(&self, root_session_id: &str) -> Result<u64> {
        let conn = lock_unpoisoned(&self.conn);
        let deleted = conn.execute(
            "DELETE FROM flow_states WHERE root_session_id = ?1",
            params![root_session_id],
        )?;
        Ok(deleted as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencode_types::FinishReason;

    fn session(id: &str, parent: Option<&str>, root: Option<&str>, created_at: i64) -> Session {
        Session {
            id: id.to_string(),
            parent_session_id: parent.map(str::to_string),
            root_session_id: root.map(str::to_string),
            title: format!("session {id}"),
            message_count: 0,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost: 0.0,
            summary_message_id: None,
            project_id: "proj".to_string(),
            created_at,
            updated_at: created_at,
        }
    }

    fn message(id: &str, session_id: &str) -> Message {
        Message {
            id: id.to_string(),
            session_id: session_id.to_string(),
            role: Role::User,
            parts: vec![ContentPart::text("hi")],
            model: None,
            created_at: 1,
            updated_at: 1,
            finished_at: None,
        }
    }

    #[tokio::test]
    async fn test_session_roundtrip_and_listing() {
        let store = SqliteStorage::open_in_memory().unwrap();
        store.insert_session(&session("a", None, None, 1)).await.unwrap();
        store.insert_session(&session("b", None, None, 2)).await.unwrap();
        store
            .insert_session(&session("c", Some("a"), Some("a"), 3))
            .await
            .unwrap();

        let listed = store.list_sessions("proj").await.unwrap();
        let ids: Vec<_> = listed.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);

        let children = store.list_child_sessions("a").await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, "c");
    }

    #[tokio::test]
    async fn test_message_count_tracks_inserts_and_deletes() {
        let store = SqliteStorage::open_in_memory().unwrap();
        store.insert_session(&session("s", None, None, 1)).await.unwrap();
        store.insert_message(&message("m1", "s")).await.unwrap();
        store.insert_message(&message("m2", "s")).await.unwrap();
        assert_eq!(store.get_session("s").await.unwrap().unwrap().message_count, 2);

        let deleted = store.delete_message("m1").await.unwrap();
        assert_eq!(deleted.unwrap().id, "m1");
        assert_eq!(store.get_session("s").await.unwrap().unwrap().message_count, 1);
        assert!(store.delete_message("m1").await.unwrap().is_none());
        assert_eq!(store.get_session("s").await.unwrap().unwrap().message_count, 1);
    }

    #[tokio::test]
    async fn test_update_message_persists_parts() {
        let store = SqliteStorage::open_in_memory().unwrap();
        store.insert_session(&session("s", None, None, 1)).await.unwrap();
        let mut msg = message("m1", "s");
        store.insert_message(&msg).await.unwrap();

        msg.append_content(" there");
        msg.add_finish(FinishReason::EndTurn, 5);
        store.update_message(&msg).await.unwrap();

        let loaded = store.get_message("m1").await.unwrap().unwrap();
        assert_eq!(loaded.content(), "hi there");
        assert_eq!(loaded.finished_at, Some(5));
    }

    #[tokio::test]
    async fn test_delete_session_cascades() {
        let store = SqliteStorage::open_in_memory().unwrap();
        store.insert_session(&session("root", None, None, 1)).await.unwrap();
        store
            .insert_session(&session("child", Some("root"), Some("root"), 2))
            .await
            .unwrap();
        store.insert_message(&message("m1", "child")).await.unwrap();
        store
            .insert_file(&FileVersion {
                id: "f1".into(),
                session_id: "child".into(),
                path: "/tmp/a".into(),
                content: "x".into(),
                version: "initial".into(),
                created_at: 1,
                updated_at: 1,
            })
            .await
            .unwrap();

        assert!(store.delete_session("root").await.unwrap());
        assert!(store.get_session("child").await.unwrap().is_none());
        assert!(store.get_message("m1").await.unwrap().is_none());
        assert!(store.get_file("f1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_versions_unique_per_session_path() {
        let store = SqliteStorage::open_in_memory().unwrap();
        store.insert_session(&session("s", None, None, 1)).await.unwrap();
        let file = FileVersion {
            id: "f1".into(),
            session_id: "s".into(),
            path: "/a".into(),
            content: "x".into(),
            version: "initial".into(),
            created_at: 1,
            updated_at: 1,
        };
        store.insert_file(&file).await.unwrap();
        let dup = FileVersion {
            id: "f2".into(),
            ..file
        };
        assert!(store.insert_file(&dup).await.is_err());
    }

    #[tokio::test]
    async fn test_flow_state_upsert() {
        let store = SqliteStorage::open_in_memory().unwrap();
        store.insert_session(&session("p-f-a", None, None, 1)).await.unwrap();
        let mut state = FlowState {
            session_id: "p-f-a".into(),
            root_session_id: "p-f-a".into(),
            flow_id: "f".into(),
            step_id: "a".into(),
            status: FlowStatus::Running,
            args: serde_json::Map::new(),
            output: String::new(),
            is_struct_output: false,
            created_at: 1,
            updated_at: 1,
        };
        store.upsert_flow_state(&state).await.unwrap();
        state.status = FlowStatus::Completed;
        state.output = r#"{"ok":true}"#.into();
        state.is_struct_output = true;
        store.upsert_flow_state(&state).await.unwrap();

        let states = store.list_flow_states("p-f-a").await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].status, FlowStatus::Completed);
        assert_eq!(
            states[0].structured_output(),
            Some(serde_json::json!({"ok": true}))
        );
        assert_eq!(store.delete_flow_states("p-f-a").await.unwrap(), 1);
    }

    #[test]
    fn test_reopen_runs_migrations_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("opencode.db");
        drop(SqliteStorage::open(&path).unwrap());
        drop(SqliteStorage::open(&path).unwrap());
    }

    #[test]
    fn test_fresh_schema_includes_struct_output() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let conn = lock_unpoisoned(&store.conn);
        assert!(has_column(&conn, "flow_states", "is_struct_output").unwrap());
        assert!(!has_column(&conn, "flow_states", "no_such_column").unwrap());
    }

    #[tokio::test]
    async fn test_legacy_flow_states_table_is_upgraded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opencode.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                r#"
                CREATE TABLE flow_states (
                    session_id TEXT PRIMARY KEY,
                    root_session_id TEXT NOT NULL,
                    flow_id TEXT NOT NULL,
                    step_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    args TEXT NOT NULL DEFAULT '{}',
                    output TEXT NOT NULL DEFAULT '',
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                INSERT INTO flow_states VALUES ('p-f-a', 'p-f-a', 'f', 'a', 'completed', '{}', 'done', 1, 1);
                "#,
            )
            .unwrap();
        }

        let store = SqliteStorage::open(&path).unwrap();
        let state = store.get_flow_state("p-f-a").await.unwrap().unwrap();
        assert!(!state.is_struct_output);
        assert_eq!(state.output, "done");
    }
}
