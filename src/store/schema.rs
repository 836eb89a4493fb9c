//! Versioned DDL for the conversation database.
//!
//! The schema version lives in `PRAGMA user_version`. Each migration runs in
//! its own transaction together with the version bump, so a crash leaves the
//! database at the previous version rather than half-migrated.

use rusqlite::Connection;
use tracing::info;

/// Latest schema version.
pub(crate) const SCHEMA_VERSION: u32 = 2;

/// `(target_version, ddl)` pairs applied in order.
const MIGRATIONS: &[(u32, &str)] = &[
    (
        1,
        r#"
CREATE TABLE IF NOT EXISTS messages (
    id      INTEGER PRIMARY KEY NOT NULL,
    role    TEXT NOT NULL,
    content TEXT NOT NULL,
    isDraft INTEGER NOT NULL DEFAULT 0
);
"#,
    ),
    (
        2,
        r#"
ALTER TABLE messages ADD COLUMN toRemember INTEGER NOT NULL DEFAULT 0;
ALTER TABLE messages ADD COLUMN timestamp INTEGER;

-- Single-row onboarding profile.
CREATE TABLE IF NOT EXISTS user (
    name       TEXT NOT NULL DEFAULT '',
    trait1     TEXT NOT NULL DEFAULT '',
    trait2     TEXT NOT NULL DEFAULT '',
    char       TEXT NOT NULL DEFAULT '',
    charAccent TEXT NOT NULL DEFAULT ''
);
"#,
    ),
];

/// Read `PRAGMA user_version`.
pub(crate) fn read_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}

/// Bring `conn` up to [`SCHEMA_VERSION`]. Returns the resulting version.
pub(crate) fn migrate(conn: &mut Connection) -> rusqlite::Result<u32> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;

    let mut current = read_schema_version(conn)?;
    for &(version, ddl) in MIGRATIONS {
        if version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(ddl)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        info!(from = current, to = version, "conversation schema migrated");
        current = version;
    }
    Ok(current)
}
