//! SQLite-backed conversation store.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use super::StoreError;
use super::schema::{migrate, read_schema_version};
use crate::message::{Message, Role};
use crate::profile::UserProfile;

/// Persistent message log and profile.
///
/// Thread-safe via an internal `Mutex<Connection>`. Only finalized messages
/// are written; the in-memory log owns drafts.
pub struct ConversationStore {
    conn: Mutex<Connection>,
}

impl ConversationStore {
    /// Open (or create) the database at `path` and run pending migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        let mut conn = Connection::open(path)?;
        let version = migrate(&mut conn)?;
        info!(path = %path.display(), version, "conversation store opened");
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn schema_version(&self) -> Result<u32, StoreError> {
        let conn = self.lock()?;
        Ok(read_schema_version(&conn)?)
    }

    /// Append a finalized message; returns its row id.
    pub fn add_message(&self, message: &Message) -> Result<i64, StoreError> {
        if message.is_draft {
            return Err(StoreError::Draft);
        }
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO messages (role, content, isDraft, toRemember, timestamp) \
             VALUES (?1, ?2, 0, ?3, ?4)",
            params![
                message.role.as_str(),
                message.content,
                message.to_remember,
                message.timestamp
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, role = %message.role, "message persisted");
        Ok(id)
    }

    /// User and assistant messages in insertion order, for display.
    pub fn list_messages(&self) -> Result<Vec<Message>, StoreError> {
        self.query_messages(
            "SELECT id, role, content, toRemember, timestamp FROM messages \
             WHERE role IN ('user', 'assistant') ORDER BY id ASC",
        )
    }

    /// Every message including system notes, in insertion order.
    pub fn all_messages(&self) -> Result<Vec<Message>, StoreError> {
        self.query_messages(
            "SELECT id, role, content, toRemember, timestamp FROM messages ORDER BY id ASC",
        )
    }

    /// Messages flagged to survive pruning of the recent-context window.
    pub fn remembered_messages(&self) -> Result<Vec<Message>, StoreError> {
        self.query_messages(
            "SELECT id, role, content, toRemember, timestamp FROM messages \
             WHERE toRemember = 1 ORDER BY id ASC",
        )
    }

    /// Clear every `toRemember` flag. Returns the number of rows changed.
    pub fn clear_remember_flags(&self) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute("UPDATE messages SET toRemember = 0 WHERE toRemember = 1", [])?;
        info!(changed, "remembered messages cleared");
        Ok(changed)
    }

    /// The stored profile, if onboarding has completed.
    pub fn profile(&self) -> Result<Option<UserProfile>, StoreError> {
        let conn = self.lock()?;
        let profile = conn
            .query_row(
                "SELECT name, trait1, trait2, char, charAccent FROM user LIMIT 1",
                [],
                |row| {
                    Ok(UserProfile {
                        name: row.get(0)?,
                        trait1: row.get(1)?,
                        trait2: row.get(2)?,
                        character: row.get(3)?,
                        accent: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(profile)
    }

    /// Replace the profile row (delete then insert, in one transaction).
    pub fn replace_profile(&self, profile: &UserProfile) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM user", [])?;
        tx.execute(
            "INSERT INTO user (name, trait1, trait2, char, charAccent) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                profile.name,
                profile.trait1,
                profile.trait2,
                profile.character,
                profile.accent
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn query_messages(&self, sql: &str) -> Result<Vec<Message>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], row_to_message)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role: String = row.get(1)?;
    let role = role.parse::<Role>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(Message {
        id: Some(row.get(0)?),
        role,
        content: row.get(2)?,
        is_draft: false,
        to_remember: row.get(3)?,
        timestamp: row.get(4)?,
    })
}
