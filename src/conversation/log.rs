//! Durable, append-only, capped conversation logs.
//!
//! One SQLite record set per conversation id. `append` assigns the next
//! per-conversation sequence number, inserts, and evicts anything older than
//! the retention cap in a single transaction — the commit is the durability
//! boundary, so a message reported as appended survives a restart. `read`
//! returns the full log oldest first and an empty vec for a log that does
//! not exist yet.
//!
//! The functions here are synchronous; callers run them inside
//! `tokio::task::spawn_blocking` with the connection mutex held only for the
//! duration of the closure.

use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::Error;

/// Default retention cap for direct-message logs.
pub const DEFAULT_HISTORY_CAP: usize = 1000;

/// Descriptor for a file shared in a message. The bytes themselves live in
/// the external blob store under `blob_key`; the log only keeps the pointer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    pub blob_key: String,
}

/// A committed message as read back from a conversation log. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    /// Per-conversation sequence assigned at append time; monotone, never reused.
    pub seq: u64,
    pub sender_id: String,
    pub recipient_id: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    /// Epoch millis at commit time.
    pub timestamp: i64,
}

/// A message about to be appended; id, seq, and timestamp are assigned here.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: String,
    pub recipient_id: String,
    pub body: String,
    pub attachment: Option<Attachment>,
}

/// Append `new` to the log for `conversation_id`, evicting entries beyond
/// `cap` (oldest first). Returns the committed message only after the
/// transaction has committed.
pub fn append(
    db: &DbPool,
    conversation_id: &str,
    cap: usize,
    new: NewMessage,
) -> Result<Message, Error> {
    let attachment_json = new
        .attachment
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| Error::Persistence(format!("attachment encode: {e}")))?;

    let mut conn = db
        .lock()
        .map_err(|_| Error::Persistence("connection lock poisoned".to_string()))?;
    let tx = conn.transaction()?;

    let seq: i64 = tx.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?1",
        params![conversation_id],
        |row| row.get(0),
    )?;

    let id = Uuid::now_v7().to_string();
    let timestamp = chrono::Utc::now().timestamp_millis();

    tx.execute(
        "INSERT INTO messages (id, conversation_id, seq, sender_id, recipient_id, body, attachment, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            id,
            conversation_id,
            seq,
            new.sender_id,
            new.recipient_id,
            new.body,
            attachment_json,
            timestamp,
        ],
    )?;

    // FIFO eviction: sequences are never reused, so everything at or below
    // seq - cap is exactly the overflow.
    if seq > cap as i64 {
        tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1 AND seq <= ?2",
            params![conversation_id, seq - cap as i64],
        )?;
    }

    tx.commit()?;

    Ok(Message {
        id,
        conversation_id: conversation_id.to_string(),
        seq: seq as u64,
        sender_id: new.sender_id,
        recipient_id: new.recipient_id,
        body: new.body,
        attachment: new.attachment,
        timestamp,
    })
}

/// Read the full log for `conversation_id`, oldest first. An unknown
/// conversation yields an empty vec, not an error.
pub fn read(db: &DbPool, conversation_id: &str) -> Result<Vec<Message>, Error> {
    let conn = db
        .lock()
        .map_err(|_| Error::Persistence("connection lock poisoned".to_string()))?;

    let mut stmt = conn.prepare(
        "SELECT id, seq, sender_id, recipient_id, body, attachment, timestamp
         FROM messages
         WHERE conversation_id = ?1
         ORDER BY seq ASC",
    )?;

    let messages = stmt
        .query_map(params![conversation_id], |row| {
            let attachment_json: Option<String> = row.get(5)?;
            Ok(Message {
                id: row.get(0)?,
                conversation_id: conversation_id.to_string(),
                seq: row.get::<_, i64>(1)? as u64,
                sender_id: row.get(2)?,
                recipient_id: row.get(3)?,
                body: row.get(4)?,
                attachment: attachment_json.and_then(|s| serde_json::from_str(&s).ok()),
                timestamp: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(messages)
}
