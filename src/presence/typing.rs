//! Ephemeral typing marks, keyed by session.
//!
//! Nothing here is persisted; expiry is the originating client's job
//! (re-sending `is_typing=false`). The registry exists so a mark held by a
//! session that disconnects mid-typing is reclaimed instead of accumulating.

use dashmap::DashMap;

use super::SessionId;

#[derive(Debug, Clone)]
pub struct TypingMark {
    pub conversation_id: String,
    pub identity_id: String,
}

#[derive(Default)]
pub struct TypingRegistry {
    marks: DashMap<SessionId, TypingMark>,
}

impl TypingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or clear the typing mark for a session.
    pub fn set(&self, session_id: SessionId, mark: TypingMark, is_typing: bool) {
        if is_typing {
            self.marks.insert(session_id, mark);
        } else {
            self.marks.remove(&session_id);
        }
    }

    /// Drop whatever mark a closing session still holds.
    pub fn clear_session(&self, session_id: SessionId) -> Option<TypingMark> {
        self.marks.remove(&session_id).map(|(_, mark)| mark)
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn mark(conversation: &str, identity: &str) -> TypingMark {
        TypingMark {
            conversation_id: conversation.to_string(),
            identity_id: identity.to_string(),
        }
    }

    #[test]
    fn stop_typing_clears_the_mark() {
        let registry = TypingRegistry::new();
        let sid = Uuid::now_v7();

        registry.set(sid, mark("dm:alice:bob", "alice"), true);
        assert_eq!(registry.len(), 1);

        registry.set(sid, mark("dm:alice:bob", "alice"), false);
        assert!(registry.is_empty());
    }

    #[test]
    fn disconnect_reclaims_a_stale_mark() {
        let registry = TypingRegistry::new();
        let sid = Uuid::now_v7();
        registry.set(sid, mark("dm:alice:bob", "alice"), true);

        let stale = registry.clear_session(sid).expect("mark present");
        assert_eq!(stale.identity_id, "alice");
        assert!(registry.is_empty());
        assert!(registry.clear_session(sid).is_none());
    }
}
