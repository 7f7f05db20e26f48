//! Wire protocol frames and the authenticated dispatch path.
//!
//! Frames are JSON, tagged by `type`. Everything a client may send after
//! authenticating lands in [`dispatch`]; each handler reports failures only
//! to the originating session as an `error` event and never tears the
//! connection down — a connection's errors are isolated to that connection.

use serde::{Deserialize, Serialize};

use crate::conversation::addressing;
use crate::conversation::log::{self, Attachment, Message, NewMessage};
use crate::directory::{self, DirectoryEntry, Identity};
use crate::error::Error;
use crate::presence::typing::TypingMark;
use crate::presence::SessionId;
use crate::state::AppState;
use crate::ws::broadcast;
use crate::ws::ConnectionSender;

/// Notification previews are truncated to this many characters.
const PREVIEW_LEN: usize = 120;

/// Frames a client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Authenticate {
        token: String,
    },
    Join {
        peer_id: String,
    },
    Leave,
    Send {
        recipient_id: String,
        body: String,
        #[serde(default)]
        attachment: Option<Attachment>,
    },
    Typing {
        recipient_id: String,
        is_typing: bool,
    },
}

/// Events the server pushes to sessions.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Sent to a session right after it authenticates: who it is, plus the
    /// directory listing with live online flags.
    Welcome {
        identity: Identity,
        directory: Vec<DirectoryEntry>,
    },
    /// Conversation history, delivered only to the session that joined.
    History {
        conversation_id: String,
        peer_id: String,
        messages: Vec<Message>,
    },
    /// A committed message, delivered to every session of both participants.
    Message { message: Message },
    /// Out-of-band alert for recipient sessions not viewing the conversation.
    Notification {
        sender_id: String,
        sender_name: String,
        preview: String,
        timestamp: i64,
    },
    /// An identity's online edge changed.
    Presence { identity_id: String, online: bool },
    Typing {
        conversation_id: String,
        identity_id: String,
        is_typing: bool,
    },
    Error { code: String, message: String },
}

impl ServerEvent {
    pub fn error(err: &Error) -> Self {
        ServerEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Everything a frame handler needs about the session it serves.
pub struct SessionContext {
    pub state: AppState,
    pub session_id: SessionId,
    pub identity: Identity,
}

/// Dispatch one frame from an authenticated session.
pub async fn dispatch(frame: ClientFrame, ctx: &SessionContext, tx: &ConnectionSender) {
    let result = match frame {
        ClientFrame::Authenticate { .. } => Err(Error::MalformedFrame(
            "session is already authenticated".to_string(),
        )),
        ClientFrame::Join { peer_id } => handle_join(ctx, tx, peer_id).await,
        ClientFrame::Leave => handle_leave(ctx),
        ClientFrame::Send {
            recipient_id,
            body,
            attachment,
        } => handle_send(ctx, recipient_id, body, attachment).await,
        ClientFrame::Typing {
            recipient_id,
            is_typing,
        } => handle_typing(ctx, recipient_id, is_typing),
    };

    if let Err(err) = result {
        match err {
            Error::Persistence(_) => tracing::error!(
                identity = %ctx.identity.id,
                session = %ctx.session_id,
                error = %err,
                "frame handling failed"
            ),
            _ => tracing::debug!(
                identity = %ctx.identity.id,
                session = %ctx.session_id,
                error = %err,
                "frame rejected"
            ),
        }
        broadcast::send_event(tx, &ServerEvent::error(&err));
    }
}

/// Join a conversation: validate the peer, replay history to this session
/// only, and mark the conversation active for notification targeting.
async fn handle_join(
    ctx: &SessionContext,
    tx: &ConnectionSender,
    peer_id: String,
) -> Result<(), Error> {
    let peer = resolve_identity(ctx, &peer_id).await?;
    let conversation_id = addressing::conversation_id(&ctx.identity.id, &peer.id)?;

    let messages = {
        let db = ctx.state.db.clone();
        let conv = conversation_id.clone();
        tokio::task::spawn_blocking(move || log::read(&db, &conv))
            .await
            .map_err(blocking_failed)??
    };

    ctx.state
        .presence
        .set_active_conversation(ctx.session_id, Some(conversation_id.clone()));

    tracing::debug!(
        identity = %ctx.identity.id,
        session = %ctx.session_id,
        conversation = %conversation_id,
        replayed = messages.len(),
        "conversation joined"
    );

    broadcast::send_event(
        tx,
        &ServerEvent::History {
            conversation_id,
            peer_id: peer.id,
            messages,
        },
    );
    Ok(())
}

/// Leave the active conversation. Idempotent.
fn handle_leave(ctx: &SessionContext) -> Result<(), Error> {
    ctx.state
        .presence
        .set_active_conversation(ctx.session_id, None);
    Ok(())
}

/// Persist a message, then fan it out. The append commit is the gate: a
/// message that failed to persist is never observed by any session.
async fn handle_send(
    ctx: &SessionContext,
    recipient_id: String,
    body: String,
    attachment: Option<Attachment>,
) -> Result<(), Error> {
    let body = body.trim().to_string();
    if body.is_empty() {
        return Err(Error::EmptyMessage);
    }

    let recipient = resolve_identity(ctx, &recipient_id).await?;
    let conversation_id = addressing::conversation_id(&ctx.identity.id, &recipient.id)?;

    let committed = {
        let db = ctx.state.db.clone();
        let conv = conversation_id.clone();
        let cap = ctx.state.history_cap;
        let new = NewMessage {
            sender_id: ctx.identity.id.clone(),
            recipient_id: recipient.id.clone(),
            body,
            attachment,
        };
        tokio::task::spawn_blocking(move || log::append(&db, &conv, cap, new))
            .await
            .map_err(blocking_failed)??
    };

    tracing::debug!(
        conversation = %conversation_id,
        seq = committed.seq,
        sender = %committed.sender_id,
        recipient = %committed.recipient_id,
        "message committed"
    );

    let presence = &ctx.state.presence;
    let message_event = ServerEvent::Message {
        message: committed.clone(),
    };

    // Every session of both participants sees the committed message — the
    // sender's other tabs stay consistent and the recipient does not need to
    // have joined the conversation.
    broadcast::send_to_identity(presence, &committed.sender_id, &message_event);
    if committed.recipient_id != committed.sender_id {
        broadcast::send_to_identity(presence, &committed.recipient_id, &message_event);

        let notification = ServerEvent::Notification {
            sender_id: committed.sender_id.clone(),
            sender_name: ctx.identity.display_name.clone(),
            preview: committed.body.chars().take(PREVIEW_LEN).collect(),
            timestamp: committed.timestamp,
        };
        for (session_id, sender) in presence.handles_for(&committed.recipient_id) {
            if presence.active_conversation(session_id).as_deref()
                != Some(conversation_id.as_str())
            {
                broadcast::send_event(&sender, &notification);
            }
        }
    }

    Ok(())
}

/// Relay a typing flag to the other participant's sessions. Never persisted;
/// the mark is tracked per session so teardown can reclaim it.
fn handle_typing(
    ctx: &SessionContext,
    recipient_id: String,
    is_typing: bool,
) -> Result<(), Error> {
    let conversation_id = addressing::conversation_id(&ctx.identity.id, &recipient_id)?;

    ctx.state.typing.set(
        ctx.session_id,
        TypingMark {
            conversation_id: conversation_id.clone(),
            identity_id: ctx.identity.id.clone(),
        },
        is_typing,
    );

    if recipient_id != ctx.identity.id {
        broadcast::send_to_identity(
            &ctx.state.presence,
            &recipient_id,
            &ServerEvent::Typing {
                conversation_id,
                identity_id: ctx.identity.id.clone(),
                is_typing,
            },
        );
    }

    Ok(())
}

async fn resolve_identity(ctx: &SessionContext, id: &str) -> Result<Identity, Error> {
    let db = ctx.state.db.clone();
    let lookup = id.to_string();
    tokio::task::spawn_blocking(move || directory::resolve(&db, &lookup))
        .await
        .map_err(blocking_failed)??
        .ok_or_else(|| Error::UnknownRecipient(id.to_string()))
}

fn blocking_failed(e: tokio::task::JoinError) -> Error {
    Error::Persistence(format!("blocking task failed: {e}"))
}
