//! Observer registries, the client's only outward surface.
//!
//! The core never talks to a UI directly. Embedding layers subscribe
//! callbacks here and get a [`Subscription`] back; calling
//! [`Subscription::cancel`] removes the callback again. Dropping the handle
//! without cancelling leaves the observer registered: the handle is a
//! disposer, not a guard.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::storage::StoredMessage;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Handle returned by [`ObserverRegistry::subscribe`].
pub struct Subscription {
    remove: Box<dyn FnOnce() + Send>,
}

impl Subscription {
    /// Remove the observer this handle was created for.
    pub fn cancel(self) {
        (self.remove)();
    }
}

/// One event stream. Observers run synchronously on the emitting task, in
/// subscription order.
pub struct ObserverRegistry<T> {
    observers: Arc<Mutex<Vec<(u64, Callback<T>)>>>,
    next_id: AtomicU64,
}

impl<T> ObserverRegistry<T> {
    pub fn new() -> Self {
        Self {
            observers: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription
    where
        T: 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));

        let observers = Arc::clone(&self.observers);
        Subscription {
            remove: Box::new(move || {
                observers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|(entry_id, _)| *entry_id != id);
            }),
        }
    }

    /// Run every registered observer with `event`. The observer list is
    /// snapshotted first, so callbacks may subscribe or cancel freely.
    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Callback<T>> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in snapshot {
            callback(event);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<T> Default for ObserverRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Event payloads
// ---------------------------------------------------------------------------

/// Connection lifecycle as seen by the embedding layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Re-trying the same endpoint after a failed attempt.
    Reconnecting,
    Connected,
}

/// Friend-graph signals received from peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FriendSignal {
    Request {
        from: String,
        from_username: Option<String>,
    },
    Accepted {
        from: String,
        from_username: Option<String>,
    },
    Removed {
        from: String,
    },
}

/// Presence changes pushed by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    StatusChanged { user_id: String, online: bool },
    OnlineList(Vec<String>),
}

/// A peer confirmed receipt of a message this client sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub message_id: String,
}

/// The relay closed this session in favor of a newer login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForcedLogout {
    pub reason: Option<String>,
}

/// Another user changed their display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserUpdateEvent {
    pub user_id: String,
    pub username: String,
}

/// Terminal results of credential operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountEvent {
    Auth {
        success: bool,
        reason: Option<String>,
    },
    Registration {
        success: bool,
        reason: Option<String>,
    },
    PasswordChange {
        success: bool,
        reason: Option<String>,
    },
}

/// All event streams of a client, one registry per concern.
pub struct ClientEvents {
    pub connection_state: ObserverRegistry<ConnectionState>,
    pub messages: ObserverRegistry<StoredMessage>,
    pub friend_signals: ObserverRegistry<FriendSignal>,
    pub presence: ObserverRegistry<PresenceEvent>,
    pub receipts: ObserverRegistry<DeliveryReceipt>,
    pub forced_logout: ObserverRegistry<ForcedLogout>,
    pub user_updates: ObserverRegistry<UserUpdateEvent>,
    pub account_results: ObserverRegistry<AccountEvent>,
}

impl ClientEvents {
    pub fn new() -> Self {
        Self {
            connection_state: ObserverRegistry::new(),
            messages: ObserverRegistry::new(),
            friend_signals: ObserverRegistry::new(),
            presence: ObserverRegistry::new(),
            receipts: ObserverRegistry::new(),
            forced_logout: ObserverRegistry::new(),
            user_updates: ObserverRegistry::new(),
            account_results: ObserverRegistry::new(),
        }
    }
}

impl Default for ClientEvents {
    fn default() -> Self {
        Self::new()
    }
}
