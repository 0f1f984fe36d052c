//! Client persistence behind trait objects.
//!
//! The core is storage-agnostic: everything it persists goes through
//! [`ChatStorage`] and [`AttachmentStore`], held as `Arc<dyn ...>`.
//! [`MemoryStorage`] and [`MemoryAttachments`] are complete in-memory
//! implementations used by the test suite and by embedders that want no
//! persistence at all.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use sotto_shared::crypto::KeyPairExport;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A chat message at rest on this device. Content is plaintext here;
/// encryption happens on the way to the wire, not at rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: String,
    /// For 1:1 chats the conversation id is the peer's user id.
    pub conversation_id: String,
    pub from: String,
    pub from_username: Option<String>,
    pub content: String,
    pub timestamp_ms: i64,
    /// File name in the attachment store, when the message carries one.
    pub attachment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub user_id: String,
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendRequest {
    pub from: String,
    pub from_username: Option<String>,
    pub received_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: String,
    pub participant_id: String,
    pub unread_count: u32,
}

/// User-tunable settings kept across sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
}

/// The identity this device is logged in as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    pub user_id: String,
    pub username: String,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Durable chat state. Implementations must be safe to share across tasks.
#[async_trait]
pub trait ChatStorage: Send + Sync {
    /// Messages of one conversation, oldest first.
    async fn get_messages(&self, conversation_id: &str) -> Result<Vec<StoredMessage>>;

    /// Upsert by message id. Re-saving an id already present replaces the
    /// record and must not bump the unread count; a newly inserted message
    /// from someone other than the current user increments it.
    async fn save_message(&self, message: &StoredMessage) -> Result<()>;

    async fn get_contacts(&self) -> Result<Vec<Contact>>;
    async fn add_contact(&self, contact: &Contact) -> Result<()>;
    async fn remove_contact(&self, user_id: &str) -> Result<()>;

    async fn get_friend_requests(&self) -> Result<Vec<FriendRequest>>;
    async fn add_friend_request(&self, request: &FriendRequest) -> Result<()>;
    async fn remove_friend_request(&self, from: &str) -> Result<()>;

    /// Idempotent. For 1:1 chats the conversation id is `participant_id`.
    async fn create_conversation(&self, participant_id: &str) -> Result<()>;
    async fn get_conversations(&self) -> Result<Vec<Conversation>>;
    async fn mark_conversation_read(&self, conversation_id: &str) -> Result<()>;

    async fn get_settings(&self) -> Result<Settings>;
    async fn save_settings(&self, settings: &Settings) -> Result<()>;

    async fn get_current_user(&self) -> Result<Option<LocalUser>>;
    async fn set_current_user(&self, user: &LocalUser) -> Result<()>;
    /// Clear the current user. Messages, contacts and keys stay.
    async fn logout(&self) -> Result<()>;

    async fn load_key_pair(&self) -> Result<Option<KeyPairExport>>;
    async fn save_key_pair(&self, key_pair: &KeyPairExport) -> Result<()>;
}

/// Opaque blob storage for message attachments.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn save_blob(&self, file_name: &str, bytes: &[u8]) -> Result<()>;
    async fn read_blob(&self, file_name: &str) -> Result<Vec<u8>>;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    messages: HashMap<String, Vec<StoredMessage>>,
    contacts: BTreeMap<String, Contact>,
    friend_requests: BTreeMap<String, FriendRequest>,
    conversations: BTreeMap<String, Conversation>,
    settings: Settings,
    current_user: Option<LocalUser>,
    key_pair: Option<KeyPairExport>,
}

/// Reference [`ChatStorage`] backed by mutex-guarded maps.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStorage for MemoryStorage {
    async fn get_messages(&self, conversation_id: &str) -> Result<Vec<StoredMessage>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_message(&self, message: &StoredMessage) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let is_own = inner
            .current_user
            .as_ref()
            .is_some_and(|user| user.user_id == message.from);

        let messages = inner
            .messages
            .entry(message.conversation_id.clone())
            .or_default();
        match messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => {
                *existing = message.clone();
                return Ok(());
            }
            None => messages.push(message.clone()),
        }

        if !is_own {
            let conversation = inner
                .conversations
                .entry(message.conversation_id.clone())
                .or_insert_with(|| Conversation {
                    id: message.conversation_id.clone(),
                    participant_id: message.conversation_id.clone(),
                    unread_count: 0,
                });
            conversation.unread_count += 1;
        }
        Ok(())
    }

    async fn get_contacts(&self) -> Result<Vec<Contact>> {
        let inner = self.inner.lock().await;
        Ok(inner.contacts.values().cloned().collect())
    }

    async fn add_contact(&self, contact: &Contact) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .contacts
            .insert(contact.user_id.clone(), contact.clone());
        Ok(())
    }

    async fn remove_contact(&self, user_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.contacts.remove(user_id);
        Ok(())
    }

    async fn get_friend_requests(&self) -> Result<Vec<FriendRequest>> {
        let inner = self.inner.lock().await;
        Ok(inner.friend_requests.values().cloned().collect())
    }

    async fn add_friend_request(&self, request: &FriendRequest) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .friend_requests
            .insert(request.from.clone(), request.clone());
        Ok(())
    }

    async fn remove_friend_request(&self, from: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.friend_requests.remove(from);
        Ok(())
    }

    async fn create_conversation(&self, participant_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .conversations
            .entry(participant_id.to_string())
            .or_insert_with(|| Conversation {
                id: participant_id.to_string(),
                participant_id: participant_id.to_string(),
                unread_count: 0,
            });
        Ok(())
    }

    async fn get_conversations(&self) -> Result<Vec<Conversation>> {
        let inner = self.inner.lock().await;
        Ok(inner.conversations.values().cloned().collect())
    }

    async fn mark_conversation_read(&self, conversation_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(conversation) = inner.conversations.get_mut(conversation_id) {
            conversation.unread_count = 0;
        }
        Ok(())
    }

    async fn get_settings(&self) -> Result<Settings> {
        let inner = self.inner.lock().await;
        Ok(inner.settings.clone())
    }

    async fn save_settings(&self, settings: &Settings) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.settings = settings.clone();
        Ok(())
    }

    async fn get_current_user(&self) -> Result<Option<LocalUser>> {
        let inner = self.inner.lock().await;
        Ok(inner.current_user.clone())
    }

    async fn set_current_user(&self, user: &LocalUser) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.current_user = Some(user.clone());
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.current_user = None;
        Ok(())
    }

    async fn load_key_pair(&self) -> Result<Option<KeyPairExport>> {
        let inner = self.inner.lock().await;
        Ok(inner.key_pair.clone())
    }

    async fn save_key_pair(&self, key_pair: &KeyPairExport) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.key_pair = Some(key_pair.clone());
        Ok(())
    }
}

/// Reference [`AttachmentStore`] keeping blobs in a map.
#[derive(Default)]
pub struct MemoryAttachments {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryAttachments {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttachmentStore for MemoryAttachments {
    async fn save_blob(&self, file_name: &str, bytes: &[u8]) -> Result<()> {
        let mut blobs = self.blobs.lock().await;
        blobs.insert(file_name.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn read_blob(&self, file_name: &str) -> Result<Vec<u8>> {
        let blobs = self.blobs.lock().await;
        blobs
            .get(file_name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(file_name.to_string()))
    }
}
