//! Domain error taxonomy shared by the REST surface and the session router.
//!
//! Input-validation errors are reported only to the caller that produced them;
//! persistence failures are surfaced to the sender without terminating the
//! connection. Nothing here is allowed to take the whole process down.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid token")]
    InvalidToken,

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("unknown recipient {0}")]
    UnknownRecipient(String),

    #[error("identity {0} is already registered")]
    DuplicateIdentity(String),

    #[error("invalid identity id {0:?}")]
    InvalidIdentity(String),

    #[error("display name must not be empty")]
    EmptyDisplayName,

    #[error("message body is empty")]
    EmptyMessage,

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("unknown session")]
    UnknownSession,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

impl Error {
    /// Stable machine-readable code, carried on WebSocket error events.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidToken => "invalid_token",
            Error::NotAuthenticated => "not_authenticated",
            Error::UnknownRecipient(_) => "unknown_recipient",
            Error::DuplicateIdentity(_) => "duplicate_identity",
            Error::InvalidIdentity(_) => "invalid_identity",
            Error::EmptyDisplayName => "empty_display_name",
            Error::EmptyMessage => "empty_message",
            Error::Persistence(_) => "persistence_failure",
            Error::UnknownSession => "unknown_session",
            Error::MalformedFrame(_) => "malformed_frame",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::InvalidToken | Error::NotAuthenticated => StatusCode::UNAUTHORIZED,
            Error::UnknownRecipient(_) => StatusCode::NOT_FOUND,
            Error::DuplicateIdentity(_) => StatusCode::CONFLICT,
            Error::InvalidIdentity(_)
            | Error::EmptyDisplayName
            | Error::EmptyMessage
            | Error::MalformedFrame(_) => StatusCode::BAD_REQUEST,
            Error::Persistence(_) | Error::UnknownSession => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Persistence(err.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        }));
        (self.status(), body).into_response()
    }
}
