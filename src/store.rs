//! SQLite-backed append-only interaction store.
//!
//! Conversations and interactions live in a single database file. All access
//! goes through a `Mutex<Connection>`; callers on the async side wrap calls
//! in `spawn_blocking`.

use crate::error::{Result, UmebotError};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

/// Interaction role within a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Column value for this role.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    /// Parse a column value back into a role.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// One interaction row as returned to prompt assembly.
#[derive(Debug, Clone)]
pub struct StoredInteraction {
    pub role: Role,
    /// Application-opaque JSON string.
    pub content: String,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS conversations (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    summary     TEXT
);
CREATE TABLE IF NOT EXISTS interactions (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    timestamp       TEXT NOT NULL,
    role            TEXT NOT NULL,
    content         TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_interactions_conversation
    ON interactions(conversation_id, id);
";

/// Append-only interaction store.
pub struct InteractionStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for InteractionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractionStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl InteractionStore {
    /// Open (or create) the database at `path`, applying the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or the
    /// database cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| UmebotError::Store(format!("cannot open {}: {e}", path.display())))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| UmebotError::Store(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| UmebotError::Store(format!("schema apply failed: {e}")))?;

        info!("interaction store open at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| UmebotError::Store("store mutex poisoned".to_owned()))
    }

    /// Create a new conversation and return its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn start_conversation(&self, summary: Option<&str>, user_id: &str) -> Result<i64> {
        let conn = self.lock()?;
        let now = now_iso();
        conn.execute(
            "INSERT INTO conversations (user_id, started_at, updated_at, summary)
             VALUES (?1, ?2, ?2, ?3)",
            params![user_id, now, summary],
        )
        .map_err(|e| UmebotError::Store(format!("start_conversation failed: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    /// Whether a conversation with this id exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn conversation_exists(&self, id: i64) -> Result<bool> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM conversations WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map_err(|e| UmebotError::Store(e.to_string()))?;
        Ok(count > 0)
    }

    /// Append one interaction and bump the conversation's `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the conversation does not exist or the insert fails.
    pub fn add_interaction(&self, conversation_id: i64, role: Role, content: &str) -> Result<()> {
        let conn = self.lock()?;
        let now = now_iso();
        let inserted = conn
            .execute(
                "INSERT INTO interactions (conversation_id, timestamp, role, content)
                 SELECT ?1, ?2, ?3, ?4
                 WHERE EXISTS (SELECT 1 FROM conversations WHERE id = ?1)",
                params![conversation_id, now, role.as_str(), content],
            )
            .map_err(|e| UmebotError::Store(format!("add_interaction failed: {e}")))?;
        if inserted == 0 {
            return Err(UmebotError::Store(format!(
                "conversation {conversation_id} does not exist"
            )));
        }
        // updated_at only moves forward; timestamps are UTC wall-clock.
        conn.execute(
            "UPDATE conversations SET updated_at = ?2
             WHERE id = ?1 AND updated_at < ?2",
            params![conversation_id, now],
        )
        .map_err(|e| UmebotError::Store(e.to_string()))?;
        Ok(())
    }

    /// Most recent `limit` interactions for a conversation, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_interactions(
        &self,
        conversation_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredInteraction>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT role, content FROM interactions
                 WHERE conversation_id = ?1
                 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(|e| UmebotError::Store(e.to_string()))?;

        let rows = stmt
            .query_map(params![conversation_id, limit as i64], |row| {
                let role: String = row.get(0)?;
                let content: String = row.get(1)?;
                Ok((role, content))
            })
            .map_err(|e| UmebotError::Store(e.to_string()))?;

        let mut interactions = Vec::new();
        for row in rows {
            let (role_raw, content) = row.map_err(|e| UmebotError::Store(e.to_string()))?;
            let role = Role::parse(&role_raw)
                .ok_or_else(|| UmebotError::Store(format!("unknown role '{role_raw}'")))?;
            interactions.push(StoredInteraction { role, content });
        }
        interactions.reverse();
        Ok(interactions)
    }

    /// Delete a conversation and, by cascade, its interactions.
    ///
    /// This is the only deletion path; interactions are otherwise append-only.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn delete_conversation(&self, conversation_id: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM conversations WHERE id = ?1",
            params![conversation_id],
        )
        .map_err(|e| UmebotError::Store(e.to_string()))?;
        Ok(())
    }
}
