//! Actor-per-connection session lifecycle.
//!
//! Each connection walks one state machine:
//! `Unauthenticated → Authenticated → (conversation joined/left) → Closed`.
//! The socket is split into a reader loop (this task) and a writer task fed
//! by an mpsc channel, so any part of the system can push events to the
//! session by cloning the sender. Authentication happens in-band: the first
//! accepted frame must be `authenticate`, everything else is rejected
//! without a state change, and a connection that never authenticates inside
//! the configured window is closed.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, timeout_at, Instant};
use uuid::Uuid;

use crate::auth::jwt;
use crate::directory::{self, Identity};
use crate::error::Error;
use crate::presence::Transition;
use crate::state::AppState;
use crate::ws::broadcast::{self, send_event};
use crate::ws::protocol::{self, ClientFrame, ServerEvent, SessionContext};
use crate::ws::ConnectionSender;

/// Ping interval: server sends a WebSocket ping every 30 seconds.
/// Prevents presence leaks from abrupt disconnects.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Pong timeout: if no pong arrives within 10 seconds after a ping, close.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Close code for a connection that never authenticated in time.
const CLOSE_AUTH_TIMEOUT: u16 = 4001;

/// Run the session actor for one connection.
pub async fn run_connection(socket: WebSocket, state: AppState) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    // Spawn writer task: forwards mpsc messages to the WebSocket sink
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    // Unauthenticated phase: nothing is registered yet, so a forced close
    // here has no side effects to undo.
    let identity = match authenticate(&mut ws_receiver, &tx, &state).await {
        Some(identity) => identity,
        None => {
            writer_handle.abort();
            return;
        }
    };

    let session_id = Uuid::now_v7();
    let transition = state.presence.register(session_id, &identity.id, tx.clone());

    // Edge-triggered: only the identity's first session announces it.
    if transition == Transition::CameOnline {
        broadcast::broadcast_to_all(
            &state.presence,
            &ServerEvent::Presence {
                identity_id: identity.id.clone(),
                online: true,
            },
        );
    }

    // Push the directory listing (with live online flags) to the new session only.
    {
        let db = state.db.clone();
        let presence = state.presence.clone();
        let exclude = identity.id.clone();
        match tokio::task::spawn_blocking(move || directory::list_others(&db, &presence, &exclude))
            .await
        {
            Ok(Ok(listing)) => send_event(
                &tx,
                &ServerEvent::Welcome {
                    identity: identity.clone(),
                    directory: listing,
                },
            ),
            Ok(Err(err)) => send_event(&tx, &ServerEvent::error(&err)),
            Err(e) => {
                let err = Error::Persistence(format!("blocking task failed: {e}"));
                send_event(&tx, &ServerEvent::error(&err));
            }
        }
    }

    tracing::info!(
        identity = %identity.id,
        session = %session_id,
        "session authenticated"
    );

    // Track pong reception
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();

    // Spawn ping task: sends periodic pings and monitors pong responses
    let ping_tx = tx.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(PING_INTERVAL);
        // Skip the first immediate tick
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            if ping_tx.send(Message::Ping(vec![1, 2, 3, 4].into())).is_err() {
                // Writer task has died — connection is gone
                break;
            }

            match timeout(PONG_TIMEOUT, pong_rx.recv()).await {
                Ok(Some(())) => {
                    // Pong received, continue
                }
                _ => {
                    tracing::warn!("pong timeout, closing connection");
                    let _ = ping_tx.send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "pong timeout".into(),
                    })));
                    break;
                }
            }
        }
    });

    let ctx = SessionContext {
        state: state.clone(),
        session_id,
        identity: identity.clone(),
    };

    // Reader loop: dispatch frames until the connection goes away
    loop {
        match ws_receiver.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
                    Ok(frame) => protocol::dispatch(frame, &ctx, &tx).await,
                    Err(e) => send_event(
                        &tx,
                        &ServerEvent::error(&Error::MalformedFrame(e.to_string())),
                    ),
                },
                Message::Binary(_) => {
                    tracing::debug!(
                        identity = %identity.id,
                        "received binary frame (expected JSON text)"
                    );
                }
                Message::Pong(_) => {
                    // Pong received — notify the ping task
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    // Respond to client pings with pong
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::info!(
                        identity = %identity.id,
                        session = %session_id,
                        reason = ?frame,
                        "client initiated close"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    identity = %identity.id,
                    session = %session_id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            None => {
                // Stream ended — client disconnected
                break;
            }
        }
    }

    // Teardown: abort companion tasks, reclaim ephemeral state, then the
    // presence edge.
    writer_handle.abort();
    ping_handle.abort();

    state.typing.clear_session(session_id);

    match state.presence.unregister(session_id) {
        Ok(departure) => {
            if departure.went_offline {
                broadcast::broadcast_to_all(
                    &state.presence,
                    &ServerEvent::Presence {
                        identity_id: departure.identity_id,
                        online: false,
                    },
                );
            }
        }
        // Internal consistency error: log it, never crash the router.
        Err(err) => tracing::warn!(
            session = %session_id,
            error = %err,
            "presence unregister failed"
        ),
    }

    tracing::info!(
        identity = %identity.id,
        session = %session_id,
        "session closed"
    );
}

/// Drive the unauthenticated phase. Returns the authenticated identity, or
/// None if the connection closed or the auth window elapsed. Invalid tokens
/// and out-of-order frames are reported to the caller without a transition,
/// so the client may retry until the deadline.
async fn authenticate(
    receiver: &mut SplitStream<WebSocket>,
    tx: &ConnectionSender,
    state: &AppState,
) -> Option<Identity> {
    let deadline = Instant::now() + state.auth_timeout;

    loop {
        let msg = match timeout_at(deadline, receiver.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(_))) | Ok(None) => return None,
            Err(_) => {
                tracing::debug!("connection failed to authenticate in time");
                let _ = tx.send(Message::Close(Some(CloseFrame {
                    code: CLOSE_AUTH_TIMEOUT,
                    reason: "authentication timeout".into(),
                })));
                return None;
            }
        };

        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
                Ok(ClientFrame::Authenticate { token }) => {
                    let Ok(claims) = jwt::validate_access_token(&state.jwt_secret, &token) else {
                        send_event(tx, &ServerEvent::error(&Error::InvalidToken));
                        continue;
                    };

                    // The token subject must still resolve in the directory.
                    let db = state.db.clone();
                    let subject = claims.sub.clone();
                    let resolved =
                        tokio::task::spawn_blocking(move || directory::resolve(&db, &subject))
                            .await;

                    match resolved {
                        Ok(Ok(Some(identity))) => return Some(identity),
                        Ok(Ok(None)) => {
                            tracing::warn!(subject = %claims.sub, "token subject not registered");
                            send_event(tx, &ServerEvent::error(&Error::InvalidToken));
                        }
                        Ok(Err(err)) => send_event(tx, &ServerEvent::error(&err)),
                        Err(e) => {
                            let err = Error::Persistence(format!("blocking task failed: {e}"));
                            send_event(tx, &ServerEvent::error(&err));
                        }
                    }
                }
                Ok(_) => send_event(tx, &ServerEvent::error(&Error::NotAuthenticated)),
                Err(e) => send_event(
                    tx,
                    &ServerEvent::error(&Error::MalformedFrame(e.to_string())),
                ),
            },
            Message::Ping(data) => {
                let _ = tx.send(Message::Pong(data));
            }
            Message::Close(_) => return None,
            _ => {}
        }
    }
}

/// Writer task: receives messages from the mpsc channel and forwards them to
/// the WebSocket sink.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if ws_sender.send(msg).await.is_err() {
            // WebSocket send failed — connection is broken
            break;
        }
    }
}
