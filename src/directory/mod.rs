//! Identity directory: registration and peer listing.
//!
//! Identities are append-only — registered once, immutable thereafter, never
//! deleted here. Registration also hands out the access token the session
//! router will later verify, which keeps the token boundary in one place.

use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::auth::jwt;
use crate::auth::middleware::Claims;
use crate::conversation::addressing;
use crate::db::DbPool;
use crate::error::Error;
use crate::presence::PresenceTable;
use crate::state::AppState;

/// A registered identity. Immutable after registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
}

/// One row of the directory listing: an identity plus its live online flag.
/// The flag is computed from the presence table at call time, never stored.
#[derive(Debug, Clone, Serialize)]
pub struct DirectoryEntry {
    #[serde(flatten)]
    pub identity: Identity,
    pub online: bool,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub identity: Identity,
    pub access_token: String,
}

/// POST /api/register
/// Register a new identity and issue its access token.
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), Error> {
    if !addressing::valid_identity_id(&req.id) {
        return Err(Error::InvalidIdentity(req.id));
    }
    let display_name = req.display_name.trim().to_string();
    if display_name.is_empty() {
        return Err(Error::EmptyDisplayName);
    }

    let db = state.db.clone();
    let id = req.id.clone();
    let name = display_name.clone();

    tokio::task::spawn_blocking(move || insert_identity(&db, &id, &name))
        .await
        .map_err(|e| Error::Persistence(format!("blocking task failed: {e}")))??;

    let access_token = jwt::issue_access_token(&state.jwt_secret, &req.id)
        .map_err(|e| Error::Persistence(format!("token issue: {e}")))?;

    tracing::info!(identity = %req.id, "identity registered");

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            identity: Identity {
                id: req.id,
                display_name,
            },
            access_token,
        }),
    ))
}

/// GET /api/identities
/// Everyone except the caller, each with a live online flag.
pub async fn list_identities(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<Vec<DirectoryEntry>>, Error> {
    let db = state.db.clone();
    let presence = state.presence.clone();

    let entries =
        tokio::task::spawn_blocking(move || list_others(&db, &presence, &claims.sub))
            .await
            .map_err(|e| Error::Persistence(format!("blocking task failed: {e}")))??;

    Ok(Json(entries))
}

fn insert_identity(db: &DbPool, id: &str, display_name: &str) -> Result<(), Error> {
    let conn = db
        .lock()
        .map_err(|_| Error::Persistence("connection lock poisoned".to_string()))?;

    let result = conn.execute(
        "INSERT INTO users (id, display_name, created_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![id, display_name, Utc::now().to_rfc3339()],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(Error::DuplicateIdentity(id.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Resolve an identity id, or None if it was never registered.
pub fn resolve(db: &DbPool, id: &str) -> Result<Option<Identity>, Error> {
    let conn = db
        .lock()
        .map_err(|_| Error::Persistence("connection lock poisoned".to_string()))?;

    let identity = conn
        .query_row(
            "SELECT id, display_name FROM users WHERE id = ?1",
            rusqlite::params![id],
            |row| {
                Ok(Identity {
                    id: row.get(0)?,
                    display_name: row.get(1)?,
                })
            },
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    Ok(identity)
}

/// All identities except `exclude`, alphabetical by display name, with
/// online flags read from the presence table.
pub fn list_others(
    db: &DbPool,
    presence: &PresenceTable,
    exclude: &str,
) -> Result<Vec<DirectoryEntry>, Error> {
    let conn = db
        .lock()
        .map_err(|_| Error::Persistence("connection lock poisoned".to_string()))?;

    let mut stmt = conn.prepare(
        "SELECT id, display_name FROM users WHERE id != ?1 ORDER BY display_name, id",
    )?;

    let identities = stmt
        .query_map(rusqlite::params![exclude], |row| {
            Ok(Identity {
                id: row.get(0)?,
                display_name: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(identities
        .into_iter()
        .map(|identity| {
            let online = presence.is_online(&identity.id);
            DirectoryEntry { identity, online }
        })
        .collect())
}
