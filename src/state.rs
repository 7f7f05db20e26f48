use std::sync::Arc;
use std::time::Duration;

use crate::db::DbPool;
use crate::presence::typing::TypingRegistry;
use crate::presence::PresenceTable;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// SQLite connection wrapped in Arc<Mutex>
    pub db: DbPool,
    /// JWT signing secret (256-bit random key)
    pub jwt_secret: Vec<u8>,
    /// Live sessions and identity online state
    pub presence: Arc<PresenceTable>,
    /// Ephemeral typing marks, reclaimed on disconnect
    pub typing: Arc<TypingRegistry>,
    /// Retention cap per conversation log
    pub history_cap: usize,
    /// How long an unauthenticated connection may linger
    pub auth_timeout: Duration,
}
