//! Live session registry.
//!
//! One [`Session`] per authenticated user id, owned by a single map behind a
//! tokio mutex. All sends into sessions go through unbounded channels, so a
//! whole login or disconnect sequence completes under one lock without ever
//! awaiting a socket. Lock order everywhere: registry before database.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tracing::{debug, error};

use sotto_shared::envelope::{reason, PresenceStatus};
use sotto_shared::Envelope;
use sotto_store::Database;

/// What a connection task pulls off its outbound channel.
#[derive(Debug)]
pub enum Outbound {
    /// A typed envelope, encoded right before the socket write.
    Envelope(Envelope),
    /// Pre-encoded JSON written to the socket as-is. Relayed and replayed
    /// frames travel this way so the sender's bytes survive untouched.
    Raw(String),
    /// Close the socket and end the connection task.
    Close,
}

/// One authenticated connection.
pub struct Session {
    pub user_id: String,
    pub username: String,
    pub public_key: Option<String>,
    pub outbound: UnboundedSender<Outbound>,
    /// Globally unique per accepted socket; disconnect uses it to tell a
    /// stale close from the current connection.
    pub connection_id: u64,
}

/// All live sessions, keyed by user id. Exactly one per user at any instant.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Install a freshly authenticated session and run the full login
    /// sequence, atomically for this user id:
    ///
    /// 1. evict any prior session (FORCE_LOGOUT, then close)
    /// 2. install the new session
    /// 3. send it the online user list (everyone else)
    /// 4. send it the declared public keys of everyone else
    /// 5. replay and clear the user's offline queue
    /// 6. broadcast the user's online status to everyone else
    /// 7. confirm with AUTH_RESULT
    pub async fn complete_login(&self, db: &Mutex<Database>, session: Session) {
        let mut sessions = self.sessions.lock().await;

        if let Some(previous) = sessions.remove(&session.user_id) {
            debug!(
                user_id = %session.user_id,
                old_connection = previous.connection_id,
                new_connection = session.connection_id,
                "Evicting previous session"
            );
            let _ = previous.outbound.send(Outbound::Envelope(Envelope::ForceLogout {
                reason: Some(reason::LOGGED_IN_ELSEWHERE.to_string()),
            }));
            let _ = previous.outbound.send(Outbound::Close);
        }

        let user_id = session.user_id.clone();
        let outbound = session.outbound.clone();

        // Snapshot the rest of the room before inserting the newcomer.
        let users: Vec<String> = sessions.keys().cloned().collect();
        let keys: BTreeMap<String, String> = sessions
            .values()
            .filter_map(|peer| {
                peer.public_key
                    .clone()
                    .map(|key| (peer.user_id.clone(), key))
            })
            .collect();
        let status = Envelope::StatusUpdate {
            user_id: user_id.clone(),
            status: PresenceStatus::Online,
            public_key: session.public_key.clone(),
        };

        sessions.insert(user_id.clone(), session);

        let _ = outbound.send(Outbound::Envelope(Envelope::OnlineUsersList { users }));
        let _ = outbound.send(Outbound::Envelope(Envelope::UserKeysList { keys }));

        self.flush_queue(db, &user_id, &outbound).await;

        for (peer_id, peer) in sessions.iter() {
            if peer_id != &user_id {
                let _ = peer.outbound.send(Outbound::Envelope(status.clone()));
            }
        }

        let _ = outbound.send(Outbound::Envelope(Envelope::AuthResult {
            success: true,
            reason: None,
        }));
    }

    /// Replay every queued envelope for `user_id` in stored order, then drop
    /// the whole queue. Rows are cleared even if a send fails: delivery
    /// after reconnect is at-most-once.
    async fn flush_queue(
        &self,
        db: &Mutex<Database>,
        user_id: &str,
        outbound: &UnboundedSender<Outbound>,
    ) {
        let db = db.lock().await;
        let pending = match db.pending_envelopes(user_id) {
            Ok(pending) => pending,
            Err(err) => {
                error!(user_id, error = %err, "Failed to read offline queue");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }

        let count = pending.len();
        for queued in pending {
            let _ = outbound.send(Outbound::Raw(queued.payload));
        }
        if let Err(err) = db.clear_pending(user_id) {
            error!(user_id, error = %err, "Failed to clear offline queue");
        }
        debug!(user_id, count, "Flushed offline queue");
    }

    /// Remove the session for `user_id`, but only if it still belongs to
    /// `connection_id`. An evicted socket's late close must not remove the
    /// session that replaced it. When a session is removed, everyone else
    /// learns the user went offline.
    pub async fn drop_connection(&self, user_id: &str, connection_id: u64) {
        let mut sessions = self.sessions.lock().await;

        match sessions.get(user_id) {
            Some(current) if current.connection_id == connection_id => {}
            _ => {
                debug!(user_id, connection_id, "Stale close, session already replaced");
                return;
            }
        }
        sessions.remove(user_id);

        let offline = Envelope::StatusUpdate {
            user_id: user_id.to_string(),
            status: PresenceStatus::Offline,
            public_key: None,
        };
        for peer in sessions.values() {
            let _ = peer.outbound.send(Outbound::Envelope(offline.clone()));
        }
    }

    /// Hand a message to a live session. Returns false when the user has no
    /// session (or its channel is gone), so the caller can decide to queue.
    pub async fn send_to(&self, user_id: &str, message: Outbound) -> bool {
        let sessions = self.sessions.lock().await;
        match sessions.get(user_id) {
            Some(session) => session.outbound.send(message).is_ok(),
            None => false,
        }
    }

    /// Record a username change for `user_id` and re-broadcast it to every
    /// other session.
    pub async fn broadcast_user_update(&self, user_id: &str, username: &str) {
        let mut sessions = self.sessions.lock().await;

        if let Some(session) = sessions.get_mut(user_id) {
            session.username = username.to_string();
        }

        let update = Envelope::UserUpdate {
            user_id: Some(user_id.to_string()),
            username: username.to_string(),
        };
        for (peer_id, peer) in sessions.iter() {
            if peer_id != user_id {
                let _ = peer.outbound.send(Outbound::Envelope(update.clone()));
            }
        }
    }

    /// Number of live sessions.
    pub async fn online_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn test_session(user_id: &str, connection_id: u64) -> (Session, UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session {
            user_id: user_id.to_string(),
            username: user_id.to_string(),
            public_key: Some(format!("{:0>64}", user_id)),
            outbound: tx,
            connection_id,
        };
        (session, rx)
    }

    fn open_db(dir: &tempfile::TempDir) -> Mutex<Database> {
        Mutex::new(Database::open_at(&dir.path().join("registry-test.db")).unwrap())
    }

    async fn next_envelope(rx: &mut UnboundedReceiver<Outbound>) -> Envelope {
        match rx.recv().await {
            Some(Outbound::Envelope(envelope)) => envelope,
            other => panic!("expected envelope, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_login_sequence_order() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let registry = SessionRegistry::new();

        let (alice, mut alice_rx) = test_session("alice", 1);
        registry.complete_login(&db, alice).await;

        let (bob, mut bob_rx) = test_session("bob", 2);
        registry.complete_login(&db, bob).await;

        // Bob gets the room snapshot, then the auth confirmation.
        match next_envelope(&mut bob_rx).await {
            Envelope::OnlineUsersList { users } => assert_eq!(users, vec!["alice".to_string()]),
            other => panic!("expected ONLINE_USERS_LIST, got {:?}", other),
        }
        match next_envelope(&mut bob_rx).await {
            Envelope::UserKeysList { keys } => {
                assert_eq!(keys.len(), 1);
                assert!(keys.contains_key("alice"));
            }
            other => panic!("expected USER_KEYS_LIST, got {:?}", other),
        }
        match next_envelope(&mut bob_rx).await {
            Envelope::AuthResult { success: true, .. } => {}
            other => panic!("expected AUTH_RESULT, got {:?}", other),
        }

        // Alice just learns bob came online. Skip her own login replies.
        let _ = next_envelope(&mut alice_rx).await; // ONLINE_USERS_LIST
        let _ = next_envelope(&mut alice_rx).await; // USER_KEYS_LIST
        let _ = next_envelope(&mut alice_rx).await; // AUTH_RESULT
        match next_envelope(&mut alice_rx).await {
            Envelope::StatusUpdate {
                user_id,
                status: PresenceStatus::Online,
                public_key,
            } => {
                assert_eq!(user_id, "bob");
                assert!(public_key.is_some());
            }
            other => panic!("expected STATUS_UPDATE, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_second_login_evicts_first() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let registry = SessionRegistry::new();

        let (first, mut first_rx) = test_session("alice", 1);
        registry.complete_login(&db, first).await;
        let _ = next_envelope(&mut first_rx).await;
        let _ = next_envelope(&mut first_rx).await;
        let _ = next_envelope(&mut first_rx).await;

        let (second, _second_rx) = test_session("alice", 2);
        registry.complete_login(&db, second).await;

        match next_envelope(&mut first_rx).await {
            Envelope::ForceLogout { reason: Some(code) } => {
                assert_eq!(code, reason::LOGGED_IN_ELSEWHERE);
            }
            other => panic!("expected FORCE_LOGOUT, got {:?}", other),
        }
        match first_rx.recv().await {
            Some(Outbound::Close) => {}
            other => panic!("expected Close, got {:?}", other),
        }
        assert_eq!(registry.online_count().await, 1);
    }

    #[tokio::test]
    async fn test_stale_close_keeps_new_session() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let registry = SessionRegistry::new();

        let (first, _first_rx) = test_session("alice", 1);
        registry.complete_login(&db, first).await;
        let (second, _second_rx) = test_session("alice", 2);
        registry.complete_login(&db, second).await;

        // Watcher to observe (the absence of) offline broadcasts.
        let (bob, mut bob_rx) = test_session("bob", 3);
        registry.complete_login(&db, bob).await;
        let _ = next_envelope(&mut bob_rx).await;
        let _ = next_envelope(&mut bob_rx).await;
        let _ = next_envelope(&mut bob_rx).await;

        // The evicted socket closes late. The new session must survive and
        // nobody hears an offline status.
        registry.drop_connection("alice", 1).await;
        assert_eq!(registry.online_count().await, 2);
        assert!(bob_rx.try_recv().is_err());

        // The real close of the current connection does remove it.
        registry.drop_connection("alice", 2).await;
        assert_eq!(registry.online_count().await, 1);
        match next_envelope(&mut bob_rx).await {
            Envelope::StatusUpdate {
                user_id,
                status: PresenceStatus::Offline,
                public_key: None,
            } => assert_eq!(user_id, "alice"),
            other => panic!("expected offline STATUS_UPDATE, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_login_flushes_queue_in_order_and_clears_it() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let registry = SessionRegistry::new();

        {
            let db = db.lock().await;
            db.enqueue_envelope("alice", "CHAT", r#"{"type":"CHAT","payload":1}"#, 1)
                .unwrap();
            db.enqueue_envelope("alice", "CHAT", r#"{"type":"CHAT","payload":2}"#, 2)
                .unwrap();
        }

        let (alice, mut alice_rx) = test_session("alice", 1);
        registry.complete_login(&db, alice).await;

        let _ = next_envelope(&mut alice_rx).await; // ONLINE_USERS_LIST
        let _ = next_envelope(&mut alice_rx).await; // USER_KEYS_LIST
        match alice_rx.recv().await {
            Some(Outbound::Raw(text)) => assert_eq!(text, r#"{"type":"CHAT","payload":1}"#),
            other => panic!("expected raw replay, got {:?}", other),
        }
        match alice_rx.recv().await {
            Some(Outbound::Raw(text)) => assert_eq!(text, r#"{"type":"CHAT","payload":2}"#),
            other => panic!("expected raw replay, got {:?}", other),
        }
        match next_envelope(&mut alice_rx).await {
            Envelope::AuthResult { success: true, .. } => {}
            other => panic!("expected AUTH_RESULT, got {:?}", other),
        }

        let db = db.lock().await;
        assert_eq!(db.pending_count("alice").unwrap(), 0);
    }
}
