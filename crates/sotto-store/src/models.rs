//! Rows persisted in the relay database.

use chrono::{DateTime, Utc};

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// One registered account. Created on registration, immutable except for
/// password changes; `user_id` is the unique key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub user_id: String,
    /// Hex-encoded BLAKE3 hash of the password. Unsalted: identical
    /// passwords hash identically.
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// QueuedEnvelope
// ---------------------------------------------------------------------------

/// One store-and-forward envelope awaiting a recipient who was offline when
/// it was relayed. Rows are kept in arrival order per recipient and removed
/// as a whole queue when that recipient next authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedEnvelope {
    /// SQLite rowid; ascending ids give the per-user FIFO order.
    pub id: i64,
    pub target_user_id: String,
    /// Wire tag of the stored envelope (CHAT, FRIEND_REQUEST, FRIEND_ACCEPT).
    pub message_type: String,
    /// The complete serialized envelope, replayed verbatim on flush.
    pub payload: String,
    /// Enqueue time, epoch milliseconds.
    pub queued_at_ms: i64,
}
