//! Session driver: endpoint cycling, the live socket loop, and the inbound
//! frame pipeline.
//!
//! [`run_driver`] owns one session attempt sequence. Per endpoint it makes
//! an initial attempt plus a bounded number of delayed retries, and moves to
//! the next endpoint when those are spent. A transport that actually opened
//! never retries: whatever ends it (auth verdict, forced logout, socket
//! drop, local disconnect) ends the driver, and reconnecting is the
//! application's call.

use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{interval_at, sleep, timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use sotto_shared::{ChatPayload, DeliveredPayload, Envelope, FriendPayload, PresenceStatus};

use crate::client::{ClientShared, RegisterOutcome};
use crate::config::{ClientConfig, Endpoint};
use crate::error::ClientError;
use crate::events::{
    AccountEvent, ConnectionState, DeliveryReceipt, ForcedLogout, FriendSignal, PresenceEvent,
    UserUpdateEvent,
};
use crate::keys::KeyAgreement;
use crate::storage::{FriendRequest, LocalUser, StoredMessage};

type Transport = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<Transport, Message>;
type WsStream = SplitStream<Transport>;

/// What the handle queues for the session loop to write.
pub(crate) enum OutboundFrame {
    Envelope(Envelope),
    /// Close the socket and end the session without reporting a drop.
    Shutdown,
}

pub(crate) struct Credentials {
    pub user_id: String,
    pub username: String,
    pub password: String,
}

/// Why a live session ended. All of these are terminal for the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// The relay refused the credentials.
    AuthRejected,
    /// FORCE_LOGOUT: the account logged in elsewhere.
    ForcedOut,
    /// The transport closed or failed after it was open.
    Dropped,
    /// A local disconnect or a newer session superseded this one.
    Detached,
}

/// A connection attempt that never got a transport open.
#[derive(Debug, Error)]
enum AttemptError {
    #[error("connect timed out")]
    Timeout,
    #[error(transparent)]
    Transport(#[from] tungstenite::Error),
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Run the session state machine until it reaches a terminal state or a
/// newer generation takes over.
pub(crate) async fn run_driver(
    shared: Arc<ClientShared>,
    keys: Arc<KeyAgreement>,
    credentials: Credentials,
    generation: u64,
) {
    let endpoint_count = shared.config.endpoints.len();

    'endpoints: for (index, endpoint) in shared.config.endpoints.iter().enumerate() {
        let mut retries = 0u32;
        loop {
            if !shared.is_current(generation) {
                return;
            }
            match attempt_session(&shared, &keys, &credentials, endpoint, generation).await {
                Ok(SessionEnd::Detached) => return,
                Ok(end) => {
                    debug!(?end, "Session ended");
                    if shared.set_state_if_current(generation, ConnectionState::Disconnected) {
                        shared.clear_online();
                    }
                    return;
                }
                Err(err) => {
                    debug!(endpoint = %endpoint.ws_url(), error = %err, "Connect attempt failed");
                    if retries < shared.config.max_attempts_per_endpoint {
                        retries += 1;
                        if !shared.set_state_if_current(generation, ConnectionState::Reconnecting) {
                            return;
                        }
                        sleep(shared.config.retry_delay).await;
                        continue;
                    }
                    if index + 1 < endpoint_count {
                        // Next endpoint starts fresh, without a delay.
                        if !shared.set_state_if_current(generation, ConnectionState::Connecting) {
                            return;
                        }
                        continue 'endpoints;
                    }
                    warn!("All endpoints exhausted, giving up");
                    shared.set_state_if_current(generation, ConnectionState::Disconnected);
                    return;
                }
            }
        }
    }

    // Only reachable with an empty endpoint list.
    shared.set_state_if_current(generation, ConnectionState::Disconnected);
}

/// One attempt against one endpoint: open the transport, authenticate, and
/// run the session loop until it ends.
async fn attempt_session(
    shared: &Arc<ClientShared>,
    keys: &Arc<KeyAgreement>,
    credentials: &Credentials,
    endpoint: &Endpoint,
    generation: u64,
) -> Result<SessionEnd, AttemptError> {
    let url = endpoint.ws_url();
    let socket = match timeout(shared.config.connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((socket, _response))) => socket,
        Ok(Err(err)) => return Err(AttemptError::Transport(err)),
        Err(_elapsed) => return Err(AttemptError::Timeout),
    };

    // Transport open. From here on any close is terminal, never a retry.
    if !shared.set_state_if_current(generation, ConnectionState::Connected) {
        return Ok(SessionEnd::Detached);
    }
    info!(endpoint = %url, "Transport open");

    let (mut write, mut read) = socket.split();
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel();
    shared.install_writer(writer_tx.clone());

    let auth = Envelope::Auth {
        user_id: credentials.user_id.clone(),
        username: credentials.username.clone(),
        password: credentials.password.clone(),
        public_key: Some(keys.public_key_hex()),
    };
    let end = match encode_and_send(&mut write, &auth).await {
        Ok(()) => {
            run_session(
                shared,
                keys,
                credentials,
                generation,
                &mut write,
                &mut read,
                &mut writer_rx,
                &writer_tx,
            )
            .await
        }
        Err(_) => SessionEnd::Dropped,
    };

    shared.detach_writer(&writer_tx);
    Ok(end)
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    shared: &Arc<ClientShared>,
    keys: &Arc<KeyAgreement>,
    credentials: &Credentials,
    generation: u64,
    write: &mut WsSink,
    read: &mut WsStream,
    writer_rx: &mut UnboundedReceiver<OutboundFrame>,
    writer_tx: &UnboundedSender<OutboundFrame>,
) -> SessionEnd {
    let mut heartbeat = interval_at(
        Instant::now() + shared.config.heartbeat_interval,
        shared.config.heartbeat_interval,
    );

    loop {
        tokio::select! {
            frame = writer_rx.recv() => match frame {
                Some(OutboundFrame::Envelope(envelope)) => {
                    if encode_and_send(write, &envelope).await.is_err() {
                        return SessionEnd::Dropped;
                    }
                }
                Some(OutboundFrame::Shutdown) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Detached;
                }
            },

            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    // A frame may already be in flight when a local
                    // disconnect bumps the generation; drop it unprocessed.
                    if !shared.is_current(generation) {
                        return SessionEnd::Detached;
                    }
                    match Envelope::decode(&text) {
                        Ok(envelope) => {
                            if let Some(end) =
                                handle_envelope(shared, keys, credentials, writer_tx, envelope).await
                            {
                                return end;
                            }
                        }
                        Err(err) => warn!(error = %err, "Rejected undecodable frame"),
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if write.send(Message::Pong(data)).await.is_err() {
                        return SessionEnd::Dropped;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Relay closed the connection");
                    return SessionEnd::Dropped;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(error = %err, "Socket error");
                    return SessionEnd::Dropped;
                }
            },

            _ = heartbeat.tick() => {
                if encode_and_send(write, &Envelope::Ping).await.is_err() {
                    return SessionEnd::Dropped;
                }
            }
        }
    }
}

/// Encode and write one envelope. An encode failure is logged and the frame
/// skipped; only transport failures surface to the caller.
async fn encode_and_send(write: &mut WsSink, envelope: &Envelope) -> Result<(), tungstenite::Error> {
    let text = match envelope.encode() {
        Ok(text) => text,
        Err(err) => {
            error!(message_type = envelope.type_name(), error = %err, "Failed to encode envelope");
            return Ok(());
        }
    };
    write.send(Message::Text(text)).await
}

// ---------------------------------------------------------------------------
// Inbound pipeline
// ---------------------------------------------------------------------------

/// Process one decoded envelope. `Some(end)` ends the session.
async fn handle_envelope(
    shared: &ClientShared,
    keys: &Arc<KeyAgreement>,
    credentials: &Credentials,
    writer: &UnboundedSender<OutboundFrame>,
    envelope: Envelope,
) -> Option<SessionEnd> {
    match envelope {
        Envelope::AuthResult { success: true, .. } => {
            let user = LocalUser {
                user_id: credentials.user_id.clone(),
                username: credentials.username.clone(),
            };
            if let Err(err) = shared.storage.set_current_user(&user).await {
                error!(error = %err, "Failed to persist the current user");
            }
            info!(user_id = %credentials.user_id, "Authenticated");
            shared.events.account_results.emit(&AccountEvent::Auth {
                success: true,
                reason: None,
            });
            None
        }
        Envelope::AuthResult { success: false, reason } => {
            warn!(?reason, "Authentication rejected");
            shared.events.account_results.emit(&AccountEvent::Auth {
                success: false,
                reason,
            });
            Some(SessionEnd::AuthRejected)
        }
        Envelope::ForceLogout { reason } => {
            info!(?reason, "Logged out by the relay");
            shared.events.forced_logout.emit(&ForcedLogout { reason });
            Some(SessionEnd::ForcedOut)
        }

        Envelope::Chat { payload, .. } => {
            handle_chat(shared, keys, writer, &payload).await;
            None
        }
        Envelope::FriendRequest { payload, .. } => {
            match FriendPayload::from_value(&payload) {
                Ok(friend) => {
                    let request = FriendRequest {
                        from: friend.from.clone(),
                        from_username: friend.from_username.clone(),
                        received_at_ms: chrono::Utc::now().timestamp_millis(),
                    };
                    match shared.storage.add_friend_request(&request).await {
                        Ok(()) => shared.events.friend_signals.emit(&FriendSignal::Request {
                            from: friend.from,
                            from_username: friend.from_username,
                        }),
                        Err(err) => {
                            error!(from = %friend.from, error = %err, "Failed to store friend request")
                        }
                    }
                }
                Err(err) => warn!(error = %err, "Malformed friend request payload"),
            }
            None
        }
        Envelope::FriendAccept { payload, .. } => {
            match FriendPayload::from_value(&payload) {
                Ok(friend) => {
                    let contact = crate::storage::Contact {
                        user_id: friend.from.clone(),
                        username: friend.from_username.clone(),
                    };
                    let stored = async {
                        shared.storage.remove_friend_request(&friend.from).await?;
                        shared.storage.add_contact(&contact).await
                    }
                    .await;
                    match stored {
                        Ok(()) => shared.events.friend_signals.emit(&FriendSignal::Accepted {
                            from: friend.from,
                            from_username: friend.from_username,
                        }),
                        Err(err) => {
                            error!(from = %friend.from, error = %err, "Failed to store accepted friend")
                        }
                    }
                }
                Err(err) => warn!(error = %err, "Malformed friend accept payload"),
            }
            None
        }
        Envelope::FriendRemove { payload, .. } => {
            match FriendPayload::from_value(&payload) {
                Ok(friend) => match shared.storage.remove_contact(&friend.from).await {
                    Ok(()) => shared
                        .events
                        .friend_signals
                        .emit(&FriendSignal::Removed { from: friend.from }),
                    Err(err) => {
                        error!(from = %friend.from, error = %err, "Failed to remove contact")
                    }
                },
                Err(err) => warn!(error = %err, "Malformed friend remove payload"),
            }
            None
        }
        Envelope::MessageDelivered { payload, .. } => {
            match DeliveredPayload::from_value(&payload) {
                Ok(receipt) => shared.events.receipts.emit(&DeliveryReceipt {
                    message_id: receipt.message_id,
                }),
                Err(err) => warn!(error = %err, "Malformed delivery receipt"),
            }
            None
        }

        Envelope::StatusUpdate {
            user_id,
            status,
            public_key,
        } => {
            if let Some(key) = &public_key {
                keys.learn_peer_key(&user_id, key);
            }
            let online = status == PresenceStatus::Online;
            shared.set_user_online(&user_id, online);
            shared
                .events
                .presence
                .emit(&PresenceEvent::StatusChanged { user_id, online });
            None
        }
        Envelope::OnlineUsersList { users } => {
            shared.replace_online(users.clone());
            shared.events.presence.emit(&PresenceEvent::OnlineList(users));
            None
        }
        Envelope::UserKeysList { keys: peer_keys } => {
            for (user_id, key) in &peer_keys {
                keys.learn_peer_key(user_id, key);
            }
            None
        }
        Envelope::UserUpdate { user_id, username } => {
            match user_id {
                Some(user_id) => shared
                    .events
                    .user_updates
                    .emit(&UserUpdateEvent { user_id, username }),
                None => debug!("USER_UPDATE without a user id, ignoring"),
            }
            None
        }
        Envelope::ChangePasswordResult { success, reason } => {
            shared
                .events
                .account_results
                .emit(&AccountEvent::PasswordChange { success, reason });
            None
        }

        Envelope::Ping => {
            let _ = writer.send(OutboundFrame::Envelope(Envelope::Pong));
            None
        }
        Envelope::Pong => None,

        other => {
            debug!(message_type = other.type_name(), "Ignoring unexpected envelope");
            None
        }
    }
}

/// Decrypt, persist, surface, and acknowledge one inbound chat message.
/// The receipt goes out only after the message is safely stored.
async fn handle_chat(
    shared: &ClientShared,
    keys: &Arc<KeyAgreement>,
    writer: &UnboundedSender<OutboundFrame>,
    payload: &serde_json::Value,
) {
    let chat = match ChatPayload::from_value(payload) {
        Ok(chat) => chat,
        Err(err) => {
            warn!(error = %err, "Malformed chat payload");
            return;
        }
    };

    let content = keys.decrypt_from(&chat.from, &chat.content);
    let attachment = match &chat.attachment {
        Some(wire) => store_attachment(shared, keys, &chat, wire).await,
        None => None,
    };

    if let Err(err) = shared.storage.create_conversation(&chat.from).await {
        error!(peer = %chat.from, error = %err, "Failed to create conversation");
        return;
    }
    let message = StoredMessage {
        id: chat.id.clone(),
        conversation_id: chat.from.clone(),
        from: chat.from.clone(),
        from_username: chat.from_username.clone(),
        content,
        timestamp_ms: chat.timestamp,
        attachment,
    };
    if let Err(err) = shared.storage.save_message(&message).await {
        error!(message_id = %message.id, error = %err, "Failed to persist inbound message");
        return;
    }
    shared.events.messages.emit(&message);

    match (DeliveredPayload {
        message_id: chat.id,
    })
    .to_value()
    {
        Ok(payload) => {
            let _ = writer.send(OutboundFrame::Envelope(Envelope::MessageDelivered {
                target_user_id: Some(chat.from),
                payload,
            }));
        }
        Err(err) => error!(error = %err, "Failed to encode delivery receipt"),
    }
}

/// Decode and store an inbound attachment, returning the local blob name.
/// Failures drop the attachment but keep the message.
async fn store_attachment(
    shared: &ClientShared,
    keys: &Arc<KeyAgreement>,
    chat: &ChatPayload,
    wire: &str,
) -> Option<String> {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

    let encoded = keys.decrypt_from(&chat.from, wire);
    let bytes = match BASE64.decode(encoded.as_bytes()) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(message_id = %chat.id, error = %err, "Attachment is not valid base64, dropping");
            return None;
        }
    };
    let file_name = format!("{}.bin", chat.id);
    match shared.attachments.save_blob(&file_name, &bytes).await {
        Ok(()) => Some(file_name),
        Err(err) => {
            error!(message_id = %chat.id, error = %err, "Failed to store attachment");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// One registration cycle against one endpoint: open a dedicated
/// connection, send REGISTER, and wait (bounded) for the verdict.
///
/// Any transport failure maps to [`ClientError::ConnectionFailed`] so the
/// caller can move on to the next endpoint.
pub(crate) async fn register_once(
    config: &ClientConfig,
    endpoint: &Endpoint,
    user_id: &str,
    password: &str,
) -> Result<RegisterOutcome, ClientError> {
    let url = endpoint.ws_url();
    let socket = match timeout(config.connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((socket, _response))) => socket,
        Ok(Err(err)) => {
            debug!(endpoint = %url, error = %err, "Register connect failed");
            return Err(ClientError::ConnectionFailed);
        }
        Err(_elapsed) => return Err(ClientError::ConnectionFailed),
    };
    let (mut write, mut read) = socket.split();

    let register = Envelope::Register {
        user_id: user_id.to_string(),
        password: password.to_string(),
    };
    let text = register.encode()?;
    if write.send(Message::Text(text)).await.is_err() {
        return Err(ClientError::ConnectionFailed);
    }

    let deadline = Instant::now() + config.register_timeout;
    loop {
        match timeout_at(deadline, read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => match Envelope::decode(&text) {
                Ok(Envelope::RegisterResult { success, reason }) => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(RegisterOutcome { success, reason });
                }
                Ok(other) => {
                    debug!(message_type = other.type_name(), "Ignoring envelope while registering");
                }
                Err(err) => warn!(error = %err, "Rejected undecodable frame"),
            },
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(_))) | Ok(None) | Err(_) => return Err(ClientError::ConnectionFailed),
        }
    }
}
