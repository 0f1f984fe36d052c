//! The client handle and the state it shares with the session driver.
//!
//! [`ChatClient`] is a cheap-to-clone facade over [`ClientShared`]. All
//! socket work happens in a spawned driver task (see [`crate::session`]);
//! the handle's methods either mutate local storage, hand envelopes to the
//! driver through the installed writer, or manage the driver's lifecycle.
//!
//! Sessions are identified by a generation counter. [`ChatClient::connect`]
//! bumps it and spawns a driver carrying the new value; anything that ends
//! a session (`disconnect`, a fresh `connect`) bumps it again, and a driver
//! that observes a different generation stops touching shared state. That
//! keeps exactly one driver authoritative without joining tasks.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use sotto_shared::envelope::reason;
use sotto_shared::validate;
use sotto_shared::{ChatPayload, Envelope, FriendPayload, KeyPair};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::{AccountEvent, ClientEvents, ConnectionState};
use crate::keys::KeyAgreement;
use crate::session::{self, Credentials, OutboundFrame};
use crate::storage::{AttachmentStore, ChatStorage, Contact, LocalUser, StoredMessage};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// State shared between the [`ChatClient`] handle and the driver task.
pub(crate) struct ClientShared {
    pub(crate) config: ClientConfig,
    pub(crate) storage: Arc<dyn ChatStorage>,
    pub(crate) attachments: Arc<dyn AttachmentStore>,
    pub(crate) events: ClientEvents,
    /// Key facade for the current identity, set by `connect`.
    keys: Mutex<Option<Arc<KeyAgreement>>>,
    state: Mutex<ConnectionState>,
    /// Session generation; drivers carrying a stale value stand down.
    generation: AtomicU64,
    /// Sender half of the live session's outbound channel, if any.
    writer: Mutex<Option<UnboundedSender<OutboundFrame>>>,
    online_users: Mutex<BTreeSet<String>>,
}

impl ClientShared {
    pub(crate) fn new(
        config: ClientConfig,
        storage: Arc<dyn ChatStorage>,
        attachments: Arc<dyn AttachmentStore>,
    ) -> Self {
        Self {
            config,
            storage,
            attachments,
            events: ClientEvents::new(),
            keys: Mutex::new(None),
            state: Mutex::new(ConnectionState::Disconnected),
            generation: AtomicU64::new(0),
            writer: Mutex::new(None),
            online_users: Mutex::new(BTreeSet::new()),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the state unconditionally, emitting only on an actual change.
    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let changed = *state != next;
        *state = next;
        drop(state);
        if changed {
            self.events.connection_state.emit(&next);
        }
    }

    /// Set the state on behalf of a driver, but only while that driver's
    /// generation is still current. Returns false when the driver is stale,
    /// in which case nothing was touched and the driver must stop.
    pub(crate) fn set_state_if_current(&self, generation: u64, next: ConnectionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        let changed = *state != next;
        *state = next;
        drop(state);
        if changed {
            self.events.connection_state.emit(&next);
        }
        true
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Claim the Disconnected -> Connecting transition. Exactly one caller
    /// wins when several race; the losers see false and leave the running
    /// session alone.
    fn begin_connecting(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != ConnectionState::Disconnected {
            return false;
        }
        *state = ConnectionState::Connecting;
        drop(state);
        self.events.connection_state.emit(&ConnectionState::Connecting);
        true
    }

    pub(crate) fn install_writer(&self, writer: UnboundedSender<OutboundFrame>) {
        *self.writer.lock().unwrap_or_else(PoisonError::into_inner) = Some(writer);
    }

    /// Remove the installed writer, but only if it is still `writer`. A
    /// newer session may have installed its own channel in the meantime.
    pub(crate) fn detach_writer(&self, writer: &UnboundedSender<OutboundFrame>) {
        let mut slot = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|current| current.same_channel(writer)) {
            *slot = None;
        }
    }

    fn take_writer(&self) -> Option<UnboundedSender<OutboundFrame>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Queue an envelope on the live session's socket.
    pub(crate) fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        let slot = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let writer = slot.as_ref().ok_or(ClientError::NotConnected)?;
        writer
            .send(OutboundFrame::Envelope(envelope))
            .map_err(|_| ClientError::NotConnected)
    }

    pub(crate) fn replace_online(&self, users: Vec<String>) {
        *self.online_users.lock().unwrap_or_else(PoisonError::into_inner) = users.into_iter().collect();
    }

    pub(crate) fn set_user_online(&self, user_id: &str, online: bool) {
        let mut set = self.online_users.lock().unwrap_or_else(PoisonError::into_inner);
        if online {
            set.insert(user_id.to_string());
        } else {
            set.remove(user_id);
        }
    }

    pub(crate) fn clear_online(&self) {
        self.online_users.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn online_snapshot(&self) -> Vec<String> {
        self.online_users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn current_keys(&self) -> Option<Arc<KeyAgreement>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Terminal outcome of a [`ChatClient::register`] cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterOutcome {
    pub success: bool,
    pub reason: Option<String>,
}

/// A connected (or connecting, or idle) chat client.
///
/// Clones share one underlying session; dropping the last handle does not
/// close it. Call [`ChatClient::disconnect`] for that.
#[derive(Clone)]
pub struct ChatClient {
    shared: Arc<ClientShared>,
}

impl ChatClient {
    pub fn new(
        config: ClientConfig,
        storage: Arc<dyn ChatStorage>,
        attachments: Arc<dyn AttachmentStore>,
    ) -> Self {
        Self {
            shared: Arc::new(ClientShared::new(config, storage, attachments)),
        }
    }

    /// Event streams. Subscriptions outlive connections.
    pub fn events(&self) -> &ClientEvents {
        &self.shared.events
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// User ids the relay last reported online, sorted.
    pub fn online_users(&self) -> Vec<String> {
        self.shared.online_snapshot()
    }

    /// Hex public key of the current identity, once `connect` has loaded or
    /// generated the key pair.
    pub fn public_key_hex(&self) -> Option<String> {
        self.shared.current_keys().map(|keys| keys.public_key_hex())
    }

    pub fn storage(&self) -> Arc<dyn ChatStorage> {
        Arc::clone(&self.shared.storage)
    }

    pub fn attachments(&self) -> Arc<dyn AttachmentStore> {
        Arc::clone(&self.shared.attachments)
    }

    // -- session lifecycle --------------------------------------------------

    /// Start a session as `user_id`. Returns once the driver task is
    /// spawned; progress is reported through the `connection_state` and
    /// `account_results` event streams.
    ///
    /// Calling this while a session is already running (any state other
    /// than Disconnected) is a no-op.
    pub async fn connect(&self, user_id: &str, username: &str, password: &str) -> Result<()> {
        if !validate::valid_user_id(user_id) {
            return Err(ClientError::InvalidInput("user id"));
        }
        if !validate::valid_username(username) {
            return Err(ClientError::InvalidInput("username"));
        }
        if !validate::valid_password(password) {
            return Err(ClientError::InvalidInput("password"));
        }

        if !self.shared.begin_connecting() {
            debug!(state = ?self.shared.state(), "connect() while a session exists, ignoring");
            return Ok(());
        }

        let key_pair = match self.load_or_generate_key_pair().await {
            Ok(key_pair) => key_pair,
            Err(err) => {
                self.shared.set_state(ConnectionState::Disconnected);
                return Err(err);
            }
        };
        let keys = Arc::new(KeyAgreement::new(key_pair));
        *self.shared.keys.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&keys));

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let credentials = Credentials {
            user_id: user_id.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        };
        tokio::spawn(session::run_driver(
            Arc::clone(&self.shared),
            keys,
            credentials,
            generation,
        ));
        Ok(())
    }

    /// End the current session, if any. Synchronous: the driver notices the
    /// generation bump and the shutdown frame and winds itself down.
    pub fn disconnect(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(writer) = self.shared.take_writer() {
            let _ = writer.send(OutboundFrame::Shutdown);
        }
        self.shared.clear_online();
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Clear the locally stored identity and end the session.
    pub async fn logout(&self) -> Result<()> {
        self.shared.storage.logout().await?;
        self.disconnect();
        Ok(())
    }

    /// Create an account. Uses a short-lived dedicated connection, one
    /// attempt per configured endpoint, independent of any live session.
    ///
    /// A reachable relay's verdict (accepted or refused) ends the cycle;
    /// only transport failures move on to the next endpoint.
    pub async fn register(&self, user_id: &str, password: &str) -> Result<RegisterOutcome> {
        if !validate::valid_user_id(user_id) {
            return Err(ClientError::InvalidInput("user id"));
        }
        if !validate::valid_password(password) {
            return Err(ClientError::InvalidInput("password"));
        }

        for endpoint in &self.shared.config.endpoints {
            match session::register_once(&self.shared.config, endpoint, user_id, password).await {
                Ok(outcome) => {
                    self.shared.events.account_results.emit(&AccountEvent::Registration {
                        success: outcome.success,
                        reason: outcome.reason.clone(),
                    });
                    return Ok(outcome);
                }
                Err(err) => {
                    debug!(endpoint = %endpoint.ws_url(), error = %err, "Registration endpoint unreachable");
                }
            }
        }

        warn!("Registration failed, no endpoint reachable");
        self.shared.events.account_results.emit(&AccountEvent::Registration {
            success: false,
            reason: Some(reason::CONNECTION_FAILED.to_string()),
        });
        Err(ClientError::ConnectionFailed)
    }

    // -- messaging ----------------------------------------------------------

    /// Encrypt `text` for `target_user_id` and send it, storing a plaintext
    /// copy locally. Returns the generated message id.
    ///
    /// An attachment's raw bytes are kept in the local blob store; the wire
    /// carries them base64-encoded inside the encrypted payload.
    pub async fn send_chat(
        &self,
        target_user_id: &str,
        text: &str,
        attachment: Option<&[u8]>,
    ) -> Result<String> {
        if !validate::valid_user_id(target_user_id) {
            return Err(ClientError::InvalidInput("target user id"));
        }
        let (me, keys) = self.require_session().await?;

        let content = keys.encrypt_for(target_user_id, text)?;
        let message_id = uuid::Uuid::new_v4().to_string();
        let timestamp_ms = chrono::Utc::now().timestamp_millis();

        let mut local_attachment = None;
        let mut wire_attachment = None;
        if let Some(bytes) = attachment {
            let encoded = BASE64.encode(bytes);
            wire_attachment = Some(keys.encrypt_for(target_user_id, &encoded)?);
            let file_name = format!("{message_id}.bin");
            self.shared.attachments.save_blob(&file_name, bytes).await?;
            local_attachment = Some(file_name);
        }

        // Local copy first; a send failure must not lose the message.
        self.shared.storage.create_conversation(target_user_id).await?;
        let stored = StoredMessage {
            id: message_id.clone(),
            conversation_id: target_user_id.to_string(),
            from: me.user_id.clone(),
            from_username: Some(me.username.clone()),
            content: text.to_string(),
            timestamp_ms,
            attachment: local_attachment,
        };
        self.shared.storage.save_message(&stored).await?;

        let payload = ChatPayload {
            id: message_id.clone(),
            from: me.user_id,
            from_username: Some(me.username),
            content,
            timestamp: timestamp_ms,
            attachment: wire_attachment,
        };
        self.shared.send_envelope(Envelope::Chat {
            target_user_id: Some(target_user_id.to_string()),
            payload: payload.to_value()?,
        })?;
        Ok(message_id)
    }

    // -- friend graph -------------------------------------------------------

    pub async fn send_friend_request(&self, target_user_id: &str) -> Result<()> {
        if !validate::valid_user_id(target_user_id) {
            return Err(ClientError::InvalidInput("target user id"));
        }
        let (me, _keys) = self.require_session().await?;
        let payload = FriendPayload {
            from: me.user_id,
            from_username: Some(me.username),
        };
        self.shared.send_envelope(Envelope::FriendRequest {
            target_user_id: Some(target_user_id.to_string()),
            payload: payload.to_value()?,
        })
    }

    /// Accept a pending request from `from_user_id`: move it into the
    /// contact list and notify the requester.
    pub async fn accept_friend_request(&self, from_user_id: &str) -> Result<()> {
        if !validate::valid_user_id(from_user_id) {
            return Err(ClientError::InvalidInput("user id"));
        }
        let (me, _keys) = self.require_session().await?;

        let username = self
            .shared
            .storage
            .get_friend_requests()
            .await?
            .into_iter()
            .find(|request| request.from == from_user_id)
            .and_then(|request| request.from_username);
        self.shared.storage.remove_friend_request(from_user_id).await?;
        self.shared
            .storage
            .add_contact(&Contact {
                user_id: from_user_id.to_string(),
                username,
            })
            .await?;

        let payload = FriendPayload {
            from: me.user_id,
            from_username: Some(me.username),
        };
        self.shared.send_envelope(Envelope::FriendAccept {
            target_user_id: Some(from_user_id.to_string()),
            payload: payload.to_value()?,
        })
    }

    /// Drop `user_id` from the contact list and tell them. The notification
    /// is advisory; it is not queued if they are offline.
    pub async fn remove_friend(&self, user_id: &str) -> Result<()> {
        if !validate::valid_user_id(user_id) {
            return Err(ClientError::InvalidInput("user id"));
        }
        let (me, _keys) = self.require_session().await?;
        self.shared.storage.remove_contact(user_id).await?;
        let payload = FriendPayload {
            from: me.user_id,
            from_username: Some(me.username),
        };
        self.shared.send_envelope(Envelope::FriendRemove {
            target_user_id: Some(user_id.to_string()),
            payload: payload.to_value()?,
        })
    }

    // -- account ------------------------------------------------------------

    /// Ask the relay to change this account's password. The verdict arrives
    /// as an `AccountEvent::PasswordChange`.
    pub async fn change_password(&self, new_password: &str) -> Result<()> {
        if !validate::valid_password(new_password) {
            return Err(ClientError::InvalidInput("password"));
        }
        let (me, _keys) = self.require_session().await?;
        self.shared.send_envelope(Envelope::ChangePassword {
            user_id: me.user_id,
            new_password: new_password.to_string(),
        })
    }

    /// Change the display name, locally and for everyone else via the relay.
    pub async fn set_username(&self, username: &str) -> Result<()> {
        if !validate::valid_username(username) {
            return Err(ClientError::InvalidInput("username"));
        }
        let (me, _keys) = self.require_session().await?;
        self.shared
            .storage
            .set_current_user(&LocalUser {
                user_id: me.user_id.clone(),
                username: username.to_string(),
            })
            .await?;
        self.shared.send_envelope(Envelope::UserUpdate {
            user_id: Some(me.user_id),
            username: username.to_string(),
        })
    }

    // -- internals ----------------------------------------------------------

    /// The current identity and key facade, or NotConnected while the
    /// session is not fully up.
    async fn require_session(&self) -> Result<(LocalUser, Arc<KeyAgreement>)> {
        if self.shared.state() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let keys = self.shared.current_keys().ok_or(ClientError::NotConnected)?;
        let me = self
            .shared
            .storage
            .get_current_user()
            .await?
            .ok_or(ClientError::NotConnected)?;
        Ok((me, keys))
    }

    async fn load_or_generate_key_pair(&self) -> Result<KeyPair> {
        match self.shared.storage.load_key_pair().await? {
            Some(export) => Ok(KeyPair::from_export(&export)),
            None => {
                let fresh = KeyPair::generate();
                self.shared.storage.save_key_pair(&fresh.to_export()).await?;
                debug!("Generated a new local key pair");
                Ok(fresh)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryAttachments, MemoryStorage};

    fn idle_client() -> ChatClient {
        ChatClient::new(
            ClientConfig::default(),
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryAttachments::new()),
        )
    }

    #[tokio::test]
    async fn test_send_chat_requires_a_session() {
        let client = idle_client();
        let err = client.send_chat("bob", "hi", None).await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_credentials() {
        let client = idle_client();
        let err = client.connect("bad user", "Alice", "pw").await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidInput("user id")));
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let err = client.connect("alice", "Alice", "").await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidInput("password")));
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_input_before_connecting() {
        let client = idle_client();
        let err = client.register("bad user", "pw").await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidInput("user id")));
    }

    #[tokio::test]
    async fn test_disconnect_while_idle_is_harmless() {
        let client = idle_client();
        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.online_users().is_empty());
    }

    #[test]
    fn test_shared_writer_detach_ignores_replaced_channel() {
        let shared = ClientShared::new(
            ClientConfig::default(),
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryAttachments::new()),
        );
        let (old_tx, _old_rx) = tokio::sync::mpsc::unbounded_channel();
        let (new_tx, _new_rx) = tokio::sync::mpsc::unbounded_channel();

        shared.install_writer(old_tx.clone());
        shared.install_writer(new_tx.clone());
        // The old session detaching must not tear down the new writer.
        shared.detach_writer(&old_tx);
        assert!(shared.send_envelope(Envelope::Ping).is_ok());

        shared.detach_writer(&new_tx);
        assert!(matches!(
            shared.send_envelope(Envelope::Ping),
            Err(ClientError::NotConnected)
        ));
    }

    #[test]
    fn test_begin_connecting_claims_once() {
        let shared = ClientShared::new(
            ClientConfig::default(),
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryAttachments::new()),
        );
        assert!(shared.begin_connecting());
        assert!(!shared.begin_connecting());
        assert_eq!(shared.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_stale_generation_cannot_set_state() {
        let shared = ClientShared::new(
            ClientConfig::default(),
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryAttachments::new()),
        );
        let current = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        assert!(shared.set_state_if_current(current, ConnectionState::Connected));

        shared.generation.fetch_add(1, Ordering::SeqCst);
        assert!(!shared.set_state_if_current(current, ConnectionState::Disconnected));
        assert_eq!(shared.state(), ConnectionState::Connected);
    }
}
