//! Durable conversation log and user profile.

mod schema;
pub mod sqlite;

pub use sqlite::ConversationStore;

/// Errors raised by the conversation store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("lock poisoned: {0}")]
    Lock(String),

    /// Drafts live only in memory.
    #[error("draft messages cannot be persisted")]
    Draft,
}
