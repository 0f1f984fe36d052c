//! v001 -- Initial schema creation.
//!
//! Creates the two relay tables: `accounts` and `offline_queue`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Accounts
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS accounts (
    user_id       TEXT PRIMARY KEY NOT NULL,
    password_hash TEXT NOT NULL,              -- hex-encoded BLAKE3, unsalted
    created_at    TEXT NOT NULL               -- ISO-8601 / RFC-3339
);

-- ----------------------------------------------------------------
-- Offline delivery queue
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS offline_queue (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    target_user_id TEXT NOT NULL,             -- recipient awaiting delivery
    message_type   TEXT NOT NULL,             -- envelope wire tag
    payload        TEXT NOT NULL,             -- full serialized envelope
    queued_at      INTEGER NOT NULL           -- epoch milliseconds
);

CREATE INDEX IF NOT EXISTS idx_offline_queue_target
    ON offline_queue(target_user_id, id);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
