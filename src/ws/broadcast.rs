//! Event fan-out helpers over the presence table.
//!
//! Events are serialized once per call and pushed onto each target session's
//! channel; a send to a closing session fails silently and the actor's
//! teardown unregisters it.

use axum::extract::ws::Message;

use crate::presence::PresenceTable;
use crate::ws::protocol::ServerEvent;
use crate::ws::ConnectionSender;

fn encode(event: &ServerEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode server event");
            None
        }
    }
}

/// Push an event to a single session.
pub fn send_event(tx: &ConnectionSender, event: &ServerEvent) {
    if let Some(msg) = encode(event) {
        let _ = tx.send(msg);
    }
}

/// Push an event to every session of one identity.
pub fn send_to_identity(presence: &PresenceTable, identity_id: &str, event: &ServerEvent) {
    let Some(msg) = encode(event) else { return };
    for (_, sender) in presence.handles_for(identity_id) {
        let _ = sender.send(msg.clone());
    }
}

/// Push an event to every registered session.
pub fn broadcast_to_all(presence: &PresenceTable, event: &ServerEvent) {
    let Some(msg) = encode(event) else { return };
    for sender in presence.all_senders() {
        let _ = sender.send(msg.clone());
    }
}
