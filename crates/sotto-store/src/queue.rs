//! Offline delivery queue operations.
//!
//! Envelopes relayed to a user with no live session are appended here and
//! replayed, oldest first, the next time that user authenticates. The flush
//! deletes the whole per-user queue after handing rows to the transport, so
//! delivery after reconnect is at-most-once.

use rusqlite::params;

use crate::database::Database;
use crate::error::Result;
use crate::models::QueuedEnvelope;

impl Database {
    /// Append one envelope to a user's queue. The row is durable once this
    /// returns.
    pub fn enqueue_envelope(
        &self,
        target_user_id: &str,
        message_type: &str,
        payload: &str,
        queued_at_ms: i64,
    ) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO offline_queue (target_user_id, message_type, payload, queued_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![target_user_id, message_type, payload, queued_at_ms],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    /// All queued envelopes for a user, oldest first.
    pub fn pending_envelopes(&self, target_user_id: &str) -> Result<Vec<QueuedEnvelope>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, target_user_id, message_type, payload, queued_at
             FROM offline_queue
             WHERE target_user_id = ?1
             ORDER BY id ASC",
        )?;

        let rows = stmt.query_map(params![target_user_id], row_to_queued_envelope)?;

        let mut envelopes = Vec::new();
        for row in rows {
            envelopes.push(row?);
        }
        Ok(envelopes)
    }

    /// Delete a user's entire queue; returns the number of rows removed.
    pub fn clear_pending(&self, target_user_id: &str) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM offline_queue WHERE target_user_id = ?1",
            params![target_user_id],
        )?;
        Ok(affected)
    }

    pub fn pending_count(&self, target_user_id: &str) -> Result<u64> {
        let count: u64 = self.conn().query_row(
            "SELECT COUNT(*) FROM offline_queue WHERE target_user_id = ?1",
            params![target_user_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn row_to_queued_envelope(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueuedEnvelope> {
    Ok(QueuedEnvelope {
        id: row.get(0)?,
        target_user_id: row.get(1)?,
        message_type: row.get(2)?,
        payload: row.get(3)?,
        queued_at_ms: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn test_fifo_order() {
        let (_dir, db) = open_test_db();

        db.enqueue_envelope("bob", "CHAT", r#"{"n":1}"#, 100).unwrap();
        db.enqueue_envelope("bob", "CHAT", r#"{"n":2}"#, 100).unwrap();
        db.enqueue_envelope("bob", "FRIEND_REQUEST", r#"{"n":3}"#, 101).unwrap();

        let pending = db.pending_envelopes("bob").unwrap();
        let payloads: Vec<&str> = pending.iter().map(|e| e.payload.as_str()).collect();

        assert_eq!(payloads, vec![r#"{"n":1}"#, r#"{"n":2}"#, r#"{"n":3}"#]);
    }

    #[test]
    fn test_clear_removes_whole_queue() {
        let (_dir, db) = open_test_db();

        db.enqueue_envelope("bob", "CHAT", "{}", 1).unwrap();
        db.enqueue_envelope("bob", "CHAT", "{}", 2).unwrap();

        assert_eq!(db.clear_pending("bob").unwrap(), 2);
        assert_eq!(db.pending_count("bob").unwrap(), 0);
        assert!(db.pending_envelopes("bob").unwrap().is_empty());
    }

    #[test]
    fn test_queues_are_per_user() {
        let (_dir, db) = open_test_db();

        db.enqueue_envelope("bob", "CHAT", r#"{"to":"bob"}"#, 1).unwrap();
        db.enqueue_envelope("carol", "CHAT", r#"{"to":"carol"}"#, 1).unwrap();

        db.clear_pending("bob").unwrap();

        assert_eq!(db.pending_count("bob").unwrap(), 0);
        assert_eq!(db.pending_count("carol").unwrap(), 1);
    }

    #[test]
    fn test_envelope_fields_round_trip() {
        let (_dir, db) = open_test_db();

        let id = db
            .enqueue_envelope("bob", "FRIEND_ACCEPT", r#"{"x":true}"#, 42)
            .unwrap();
        let pending = db.pending_envelopes("bob").unwrap();

        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].target_user_id, "bob");
        assert_eq!(pending[0].message_type, "FRIEND_ACCEPT");
        assert_eq!(pending[0].queued_at_ms, 42);
    }
}
