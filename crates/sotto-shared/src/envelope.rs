use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result reason codes carried in `*_RESULT` and `FORCE_LOGOUT` envelopes.
pub mod reason {
    pub const USER_EXISTS: &str = "USER_EXISTS";
    pub const NOT_REGISTERED: &str = "NOT_REGISTERED";
    pub const BAD_PASSWORD: &str = "BAD_PASSWORD";
    pub const INVALID_INPUT: &str = "INVALID_INPUT";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const CONNECTION_FAILED: &str = "CONNECTION_FAILED";
    pub const LOGGED_IN_ELSEWHERE: &str = "LOGGED_IN_ELSEWHERE";
}

/// All wire envelopes exchanged between client and relay.
///
/// Envelopes are newline-free JSON objects tagged by `type`, one per text
/// frame. The enum is closed: a frame with an unknown `type` fails to decode
/// and the receiving side rejects it explicitly.
///
/// The five relayable variants (`Chat`, `FriendRequest`, `FriendAccept`,
/// `FriendRemove`, `MessageDelivered`) address a recipient by
/// `targetUserId` and carry an opaque `payload` the relay forwards without
/// interpreting. Once a chat payload leaves the sender's encryption facade
/// its `content` is ciphertext, never plaintext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum Envelope {
    /// Credential + declared public key handshake, sent once per connection
    Auth {
        user_id: String,
        username: String,
        password: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
    },
    AuthResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Account creation, sent on a short-lived dedicated connection
    Register {
        user_id: String,
        password: String,
    },
    RegisterResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    ChangePassword {
        user_id: String,
        new_password: String,
    },
    ChangePasswordResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Client heartbeat; the relay answers with `Pong`
    Ping,
    Pong,

    /// End-to-end encrypted chat message (see [`ChatPayload`])
    Chat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_user_id: Option<String>,
        payload: Value,
    },
    FriendRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_user_id: Option<String>,
        payload: Value,
    },
    FriendAccept {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_user_id: Option<String>,
        payload: Value,
    },
    FriendRemove {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_user_id: Option<String>,
        payload: Value,
    },
    /// Application-level delivery receipt (see [`DeliveredPayload`])
    MessageDelivered {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_user_id: Option<String>,
        payload: Value,
    },

    /// Presence change broadcast by the relay; carries the user's declared
    /// public key when they come online
    StatusUpdate {
        user_id: String,
        status: PresenceStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
    },
    /// All other online user ids, sent to a freshly authenticated connection
    OnlineUsersList {
        users: Vec<String>,
    },
    /// Declared public keys of all other online users (entries without a
    /// declared key are omitted)
    UserKeysList {
        keys: BTreeMap<String, String>,
    },

    /// The account logged in elsewhere; this connection is about to close
    ForceLogout {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Username change, client to relay and re-broadcast relay to clients
    UserUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        username: String,
    },
}

impl Envelope {
    /// Serialize to a compact JSON string (no raw newlines)
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize one envelope from a text frame
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// The wire tag, as it appears in the JSON `type` field
    pub fn type_name(&self) -> &'static str {
        match self {
            Envelope::Auth { .. } => "AUTH",
            Envelope::AuthResult { .. } => "AUTH_RESULT",
            Envelope::Register { .. } => "REGISTER",
            Envelope::RegisterResult { .. } => "REGISTER_RESULT",
            Envelope::ChangePassword { .. } => "CHANGE_PASSWORD",
            Envelope::ChangePasswordResult { .. } => "CHANGE_PASSWORD_RESULT",
            Envelope::Ping => "PING",
            Envelope::Pong => "PONG",
            Envelope::Chat { .. } => "CHAT",
            Envelope::FriendRequest { .. } => "FRIEND_REQUEST",
            Envelope::FriendAccept { .. } => "FRIEND_ACCEPT",
            Envelope::FriendRemove { .. } => "FRIEND_REMOVE",
            Envelope::MessageDelivered { .. } => "MESSAGE_DELIVERED",
            Envelope::StatusUpdate { .. } => "STATUS_UPDATE",
            Envelope::OnlineUsersList { .. } => "ONLINE_USERS_LIST",
            Envelope::UserKeysList { .. } => "USER_KEYS_LIST",
            Envelope::ForceLogout { .. } => "FORCE_LOGOUT",
            Envelope::UserUpdate { .. } => "USER_UPDATE",
        }
    }

    /// Target user id for the relayable envelope kinds
    pub fn relay_target(&self) -> Option<&str> {
        match self {
            Envelope::Chat { target_user_id, .. }
            | Envelope::FriendRequest { target_user_id, .. }
            | Envelope::FriendAccept { target_user_id, .. }
            | Envelope::FriendRemove { target_user_id, .. }
            | Envelope::MessageDelivered { target_user_id, .. } => target_user_id.as_deref(),
            _ => None,
        }
    }

    /// Whether this envelope kind is relayed between users at all
    pub fn is_relayable(&self) -> bool {
        matches!(
            self,
            Envelope::Chat { .. }
                | Envelope::FriendRequest { .. }
                | Envelope::FriendAccept { .. }
                | Envelope::FriendRemove { .. }
                | Envelope::MessageDelivered { .. }
        )
    }

    /// Whether this envelope kind is stored for an offline target.
    /// FRIEND_REMOVE and MESSAGE_DELIVERED are advisory and never queued.
    pub fn queue_when_offline(&self) -> bool {
        matches!(
            self,
            Envelope::Chat { .. } | Envelope::FriendRequest { .. } | Envelope::FriendAccept { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Typed view of a `CHAT` payload.
///
/// `content` (and `attachment`, when present) hold transport-encoded
/// ciphertext on the wire; the relay treats the whole payload as opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub id: String,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_username: Option<String>,
    pub content: String,
    /// Sender clock, epoch milliseconds
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
}

/// Typed view of a friend-signal payload (request/accept/remove)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendPayload {
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_username: Option<String>,
}

/// Typed view of a `MESSAGE_DELIVERED` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveredPayload {
    pub message_id: String,
}

impl ChatPayload {
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

impl FriendPayload {
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

impl DeliveredPayload {
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}
