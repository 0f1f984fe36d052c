//! Envelope relaying between live sessions, with durable offline queueing.
//!
//! The relay never looks inside payloads. A frame addressed to a live
//! session is written to that session's socket byte-for-byte as the sender
//! produced it; a frame for an offline user is either queued durably (chat
//! and friend-graph changes) or dropped (advisory signals).

use tokio::sync::Mutex;
use tracing::{debug, error};

use sotto_shared::Envelope;
use sotto_store::Database;

use crate::registry::{Outbound, SessionRegistry};

/// Relay one addressed envelope from an authenticated sender.
///
/// `raw` is the sender's original frame text; it is what the target (or the
/// offline queue) receives.
pub async fn relay_envelope(
    registry: &SessionRegistry,
    db: &Mutex<Database>,
    sender_user_id: &str,
    envelope: &Envelope,
    raw: &str,
) {
    let message_type = envelope.type_name();

    let target = match envelope.relay_target() {
        Some(target) => target.to_string(),
        None => {
            debug!(
                sender = sender_user_id,
                message_type, "Relay frame without target, ignoring"
            );
            return;
        }
    };

    if registry.send_to(&target, Outbound::Raw(raw.to_string())).await {
        debug!(sender = sender_user_id, target = %target, message_type, "Relayed");
        return;
    }

    if !envelope.queue_when_offline() {
        debug!(target = %target, message_type, "Target offline, dropping advisory envelope");
        return;
    }

    let queued_at = chrono::Utc::now().timestamp_millis();
    let db = db.lock().await;
    match db.enqueue_envelope(&target, message_type, raw, queued_at) {
        Ok(_) => {
            debug!(sender = sender_user_id, target = %target, message_type, "Queued for offline delivery");
        }
        Err(err) => {
            error!(target = %target, message_type, error = %err, "Failed to queue envelope");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::registry::Session;

    fn open_db(dir: &tempfile::TempDir) -> Mutex<Database> {
        Mutex::new(Database::open_at(&dir.path().join("relay-test.db")).unwrap())
    }

    fn chat_frame(target: &str, body: &str) -> (Envelope, String) {
        let envelope = Envelope::Chat {
            target_user_id: Some(target.to_string()),
            payload: json!({ "content": body }),
        };
        let raw = envelope.encode().unwrap();
        (envelope, raw)
    }

    #[tokio::test]
    async fn test_live_target_gets_original_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let registry = SessionRegistry::new();

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry
            .complete_login(
                &db,
                Session {
                    user_id: "bob".to_string(),
                    username: "bob".to_string(),
                    public_key: None,
                    outbound: tx,
                    connection_id: 1,
                },
            )
            .await;
        // Drain bob's login replies.
        for _ in 0..3 {
            let _ = rx.recv().await;
        }

        let (envelope, raw) = chat_frame("bob", "zzz not json-reordered zzz");
        relay_envelope(&registry, &db, "alice", &envelope, &raw).await;

        match rx.recv().await {
            Some(Outbound::Raw(text)) => assert_eq!(text, raw),
            other => panic!("expected raw forward, got {:?}", other),
        }
        assert_eq!(db.lock().await.pending_count("bob").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_offline_chat_is_queued() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let registry = SessionRegistry::new();

        let (envelope, raw) = chat_frame("bob", "hello");
        relay_envelope(&registry, &db, "alice", &envelope, &raw).await;

        let db = db.lock().await;
        let pending = db.pending_envelopes("bob").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message_type, "CHAT");
        assert_eq!(pending[0].payload, raw);
    }

    #[tokio::test]
    async fn test_offline_advisory_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let registry = SessionRegistry::new();

        let envelope = Envelope::MessageDelivered {
            target_user_id: Some("bob".to_string()),
            payload: json!({ "messageId": "m-1" }),
        };
        let raw = envelope.encode().unwrap();
        relay_envelope(&registry, &db, "alice", &envelope, &raw).await;

        let envelope = Envelope::FriendRemove {
            target_user_id: Some("bob".to_string()),
            payload: json!({ "from": "alice" }),
        };
        let raw = envelope.encode().unwrap();
        relay_envelope(&registry, &db, "alice", &envelope, &raw).await;

        assert_eq!(db.lock().await.pending_count("bob").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_target_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let registry = SessionRegistry::new();

        let envelope = Envelope::Chat {
            target_user_id: None,
            payload: json!({ "content": "nowhere" }),
        };
        let raw = envelope.encode().unwrap();
        relay_envelope(&registry, &db, "alice", &envelope, &raw).await;

        assert_eq!(db.lock().await.pending_count("bob").unwrap(), 0);
    }
}
