//! Presence table: which identity owns which live session, and who is online.
//!
//! A session belongs to exactly one identity; an identity may hold any number
//! of concurrent sessions (multiple tabs/devices). Online/offline is
//! edge-triggered: only the 0→1 and 1→0 transitions are reported, extra
//! sessions come and go silently. Both maps are DashMaps — register and
//! unregister mutate the per-identity session set under its entry lock, so a
//! concurrent broadcast never observes a half-applied transition and the
//! came-online/went-offline edge is decided exactly once.

pub mod typing;

use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::Error;
use crate::ws::ConnectionSender;

/// Opaque handle for one live connection.
pub type SessionId = Uuid;

/// Per-session bookkeeping held by the table. The sender half of the
/// connection's channel lets any part of the system push events to the
/// session; the active conversation drives notification targeting.
pub struct SessionHandle {
    pub identity_id: String,
    pub sender: ConnectionSender,
    pub joined_at: DateTime<Utc>,
    active_conversation: Mutex<Option<String>>,
}

/// Result of registering a session for an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// First session for the identity — it just came online.
    CameOnline,
    /// The identity already had at least one session.
    AlreadyOnline,
}

/// Result of unregistering a session.
#[derive(Debug)]
pub struct Departure {
    pub identity_id: String,
    /// True iff the removed session was the identity's last one.
    pub went_offline: bool,
}

#[derive(Default)]
pub struct PresenceTable {
    sessions: DashMap<SessionId, SessionHandle>,
    identities: DashMap<String, HashSet<SessionId>>,
}

impl PresenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authenticated session. Returns whether this was the
    /// identity's online edge.
    pub fn register(
        &self,
        session_id: SessionId,
        identity_id: &str,
        sender: ConnectionSender,
    ) -> Transition {
        self.sessions.insert(
            session_id,
            SessionHandle {
                identity_id: identity_id.to_string(),
                sender,
                joined_at: Utc::now(),
                active_conversation: Mutex::new(None),
            },
        );

        // The entry lock serializes concurrent registrations for one identity,
        // so exactly one of them observes the empty set.
        let mut entry = self.identities.entry(identity_id.to_string()).or_default();
        let came_online = entry.is_empty();
        entry.insert(session_id);

        if came_online {
            Transition::CameOnline
        } else {
            Transition::AlreadyOnline
        }
    }

    /// Remove a session. Fails with `UnknownSession` if it was never
    /// registered (or already removed).
    pub fn unregister(&self, session_id: SessionId) -> Result<Departure, Error> {
        let (_, handle) = self
            .sessions
            .remove(&session_id)
            .ok_or(Error::UnknownSession)?;

        let mut went_offline = false;
        if let Entry::Occupied(mut occupied) = self.identities.entry(handle.identity_id.clone()) {
            occupied.get_mut().remove(&session_id);
            if occupied.get().is_empty() {
                occupied.remove();
                went_offline = true;
            }
        }

        Ok(Departure {
            identity_id: handle.identity_id,
            went_offline,
        })
    }

    pub fn is_online(&self, identity_id: &str) -> bool {
        self.identities
            .get(identity_id)
            .map(|sessions| !sessions.is_empty())
            .unwrap_or(false)
    }

    pub fn sessions_for(&self, identity_id: &str) -> HashSet<SessionId> {
        self.identities
            .get(identity_id)
            .map(|sessions| sessions.clone())
            .unwrap_or_default()
    }

    pub fn online_identities(&self) -> HashSet<String> {
        self.identities
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Session ids and channel senders for every session of an identity.
    /// Senders are cloned out so no map guard is held while sending.
    pub fn handles_for(&self, identity_id: &str) -> Vec<(SessionId, ConnectionSender)> {
        let session_ids = self.sessions_for(identity_id);
        session_ids
            .into_iter()
            .filter_map(|sid| {
                self.sessions
                    .get(&sid)
                    .map(|handle| (sid, handle.sender.clone()))
            })
            .collect()
    }

    /// Channel senders for every registered session.
    pub fn all_senders(&self) -> Vec<ConnectionSender> {
        self.sessions
            .iter()
            .map(|entry| entry.value().sender.clone())
            .collect()
    }

    /// Replace the session's active conversation (None = left).
    pub fn set_active_conversation(&self, session_id: SessionId, conversation: Option<String>) {
        if let Some(handle) = self.sessions.get(&session_id) {
            if let Ok(mut active) = handle.active_conversation.lock() {
                *active = conversation;
            }
        }
    }

    pub fn active_conversation(&self, session_id: SessionId) -> Option<String> {
        self.sessions.get(&session_id).and_then(|handle| {
            handle
                .active_conversation
                .lock()
                .ok()
                .and_then(|active| active.clone())
        })
    }
}
