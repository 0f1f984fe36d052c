//! Per-socket connection lifecycle.
//!
//! Each accepted TCP stream gets one task that owns both halves of the
//! WebSocket. Everything the rest of the server wants to say to this client
//! arrives over the connection's unbounded outbound channel; the task itself
//! is the only writer to the socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::time::{sleep, Instant};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use sotto_shared::envelope::reason;
use sotto_shared::Envelope;

use crate::auth::{self, AuthOutcome};
use crate::registry::{Outbound, Session};
use crate::relay;
use crate::ServerState;

/// Drive one accepted connection from WebSocket handshake to close.
pub async fn handle_connection(state: Arc<ServerState>, stream: TcpStream, peer_addr: SocketAddr) {
    let connection_id = state.next_connection_id();

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(state.config.max_frame_bytes);
    ws_config.max_frame_size = Some(state.config.max_frame_bytes);

    let socket = match tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await {
        Ok(socket) => socket,
        Err(err) => {
            debug!(peer = %peer_addr, error = %err, "WebSocket handshake failed");
            return;
        }
    };
    debug!(peer = %peer_addr, connection_id, "Connection open");

    let (mut write, mut read) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();

    // Set once AUTH succeeds; the registry owns the session from then on.
    let mut authed_user: Option<String> = None;

    let idle_timeout = Duration::from_secs(state.config.idle_timeout_secs);
    let idle_deadline = sleep(idle_timeout);
    tokio::pin!(idle_deadline);

    loop {
        tokio::select! {
            // Traffic queued for this client by the registry or by the
            // dispatch below.
            queued = outbound_rx.recv() => {
                match queued {
                    Some(Outbound::Envelope(envelope)) => {
                        let text = match envelope.encode() {
                            Ok(text) => text,
                            Err(err) => {
                                error!(connection_id, error = %err, "Failed to encode outbound envelope");
                                continue;
                            }
                        };
                        if write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Raw(text)) => {
                        if write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            // Inbound socket frames. Only these reset the idle deadline.
            frame = read.next() => {
                let message = match frame {
                    Some(Ok(message)) => message,
                    Some(Err(err)) => {
                        debug!(connection_id, error = %err, "Socket error");
                        break;
                    }
                    None => break,
                };
                idle_deadline.as_mut().reset(Instant::now() + idle_timeout);

                match message {
                    Message::Text(text) => {
                        handle_frame(
                            &state,
                            &outbound_tx,
                            &mut authed_user,
                            peer_addr,
                            connection_id,
                            &text,
                        )
                        .await;
                    }
                    Message::Ping(data) => {
                        if write.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    // Binary and stray Pong frames are not part of the protocol.
                    _ => {}
                }
            }

            () = &mut idle_deadline => {
                warn!(connection_id, peer = %peer_addr, "Idle timeout, closing");
                break;
            }
        }
    }

    match authed_user {
        Some(user_id) => {
            state.registry.drop_connection(&user_id, connection_id).await;
            info!(user_id = %user_id, connection_id, "Disconnected");
        }
        None => debug!(connection_id, "Closed before authentication"),
    }
}

/// Decode and dispatch one inbound text frame.
async fn handle_frame(
    state: &Arc<ServerState>,
    outbound: &UnboundedSender<Outbound>,
    authed_user: &mut Option<String>,
    peer_addr: SocketAddr,
    connection_id: u64,
    text: &str,
) {
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(connection_id, error = %err, "Rejected undecodable frame");
            return;
        }
    };

    match envelope {
        // Heartbeat, answered whether or not the connection is authenticated.
        Envelope::Ping => {
            let _ = outbound.send(Outbound::Envelope(Envelope::Pong));
        }

        Envelope::Register { user_id, password } => {
            let result = register_reply(state, peer_addr, &user_id, &password).await;
            let _ = outbound.send(Outbound::Envelope(result));
        }

        Envelope::Auth {
            user_id,
            username,
            password,
            public_key,
        } => {
            if authed_user.is_some() {
                debug!(connection_id, "Duplicate AUTH on live session, ignoring");
                return;
            }

            if !state.auth_limiter.allow(peer_addr.ip()).await {
                warn!(peer = %peer_addr, user_id = %user_id, "AUTH rate limited");
                let _ = outbound.send(Outbound::Envelope(Envelope::AuthResult {
                    success: false,
                    reason: Some(reason::RATE_LIMITED.to_string()),
                }));
                return;
            }

            let verdict = {
                let db = state.db.lock().await;
                auth::authenticate(&db, &user_id, &password)
            };
            match verdict {
                Ok(AuthOutcome::Accepted) => {}
                Ok(AuthOutcome::Refused(code)) => {
                    debug!(user_id = %user_id, reason = code, "AUTH refused");
                    let _ = outbound.send(Outbound::Envelope(Envelope::AuthResult {
                        success: false,
                        reason: Some(code.to_string()),
                    }));
                    return;
                }
                Err(err) => {
                    error!(user_id = %user_id, error = %err, "AUTH store failure");
                    let _ = outbound.send(Outbound::Envelope(Envelope::AuthResult {
                        success: false,
                        reason: None,
                    }));
                    return;
                }
            }

            // A malformed declared key is dropped rather than shared with
            // peers; the session still comes up.
            let public_key = match public_key {
                Some(key) if sotto_shared::crypto::parse_public_key_hex(&key).is_err() => {
                    warn!(user_id = %user_id, "Discarding malformed declared public key");
                    None
                }
                other => other,
            };

            let session = Session {
                user_id: user_id.clone(),
                username,
                public_key,
                outbound: outbound.clone(),
                connection_id,
            };
            state.registry.complete_login(&state.db, session).await;
            *authed_user = Some(user_id.clone());
            info!(user_id = %user_id, connection_id, "Authenticated");
        }

        Envelope::ChangePassword {
            user_id,
            new_password,
        } => {
            let result = match authed_user.as_deref() {
                Some(session_user) if session_user == user_id => {
                    change_password_reply(state, &user_id, &new_password).await
                }
                _ => {
                    debug!(connection_id, "CHANGE_PASSWORD outside own session");
                    Envelope::ChangePasswordResult {
                        success: false,
                        reason: Some(reason::INVALID_INPUT.to_string()),
                    }
                }
            };
            let _ = outbound.send(Outbound::Envelope(result));
        }

        // The sender's own id wins over whatever the frame claims.
        Envelope::UserUpdate { username, .. } => match authed_user.as_deref() {
            Some(session_user) => {
                state
                    .registry
                    .broadcast_user_update(session_user, &username)
                    .await;
            }
            None => debug!(connection_id, "USER_UPDATE before authentication, ignoring"),
        },

        relayable @ (Envelope::Chat { .. }
        | Envelope::FriendRequest { .. }
        | Envelope::FriendAccept { .. }
        | Envelope::FriendRemove { .. }
        | Envelope::MessageDelivered { .. }) => match authed_user.as_deref() {
            Some(sender) => {
                relay::relay_envelope(&state.registry, &state.db, sender, &relayable, text).await;
            }
            None => {
                debug!(
                    connection_id,
                    message_type = relayable.type_name(),
                    "Relay frame before authentication, ignoring"
                );
            }
        },

        other => {
            debug!(
                connection_id,
                message_type = other.type_name(),
                "Ignoring client-sent server envelope"
            );
        }
    }
}

async fn register_reply(
    state: &Arc<ServerState>,
    peer_addr: SocketAddr,
    user_id: &str,
    password: &str,
) -> Envelope {
    if !state.auth_limiter.allow(peer_addr.ip()).await {
        warn!(peer = %peer_addr, user_id, "REGISTER rate limited");
        return Envelope::RegisterResult {
            success: false,
            reason: Some(reason::RATE_LIMITED.to_string()),
        };
    }

    let verdict = {
        let db = state.db.lock().await;
        auth::register_account(&db, user_id, password)
    };
    match verdict {
        Ok(AuthOutcome::Accepted) => {
            info!(user_id, "Account registered");
            Envelope::RegisterResult {
                success: true,
                reason: None,
            }
        }
        Ok(AuthOutcome::Refused(code)) => {
            debug!(user_id, reason = code, "REGISTER refused");
            Envelope::RegisterResult {
                success: false,
                reason: Some(code.to_string()),
            }
        }
        Err(err) => {
            error!(user_id, error = %err, "REGISTER store failure");
            Envelope::RegisterResult {
                success: false,
                reason: None,
            }
        }
    }
}

async fn change_password_reply(
    state: &Arc<ServerState>,
    user_id: &str,
    new_password: &str,
) -> Envelope {
    let verdict = {
        let db = state.db.lock().await;
        auth::change_password(&db, user_id, new_password)
    };
    match verdict {
        Ok(AuthOutcome::Accepted) => {
            info!(user_id, "Password changed");
            Envelope::ChangePasswordResult {
                success: true,
                reason: None,
            }
        }
        Ok(AuthOutcome::Refused(code)) => Envelope::ChangePasswordResult {
            success: false,
            reason: Some(code.to_string()),
        },
        Err(err) => {
            error!(user_id, error = %err, "CHANGE_PASSWORD store failure");
            Envelope::ChangePasswordResult {
                success: false,
                reason: None,
            }
        }
    }
}
