//! Chat client runtime: the connection state machine, end-to-end message
//! encryption, local persistence traits, and the event streams a frontend
//! subscribes to. Entry point is [`ChatClient`].

pub mod config;
pub mod error;
pub mod events;
pub mod keys;
pub mod storage;

mod client;
mod session;

pub use client::{ChatClient, RegisterOutcome};
pub use config::{ClientConfig, Endpoint};
pub use error::ClientError;
pub use events::{
    AccountEvent, ClientEvents, ConnectionState, DeliveryReceipt, ForcedLogout, FriendSignal,
    ObserverRegistry, PresenceEvent, Subscription, UserUpdateEvent,
};
pub use keys::KeyAgreement;
pub use storage::{
    AttachmentStore, ChatStorage, Contact, Conversation, FriendRequest, LocalUser,
    MemoryAttachments, MemoryStorage, Settings, StorageError, StoredMessage,
};
