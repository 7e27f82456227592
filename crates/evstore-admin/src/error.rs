//! Error types for administrative HTTP calls.

use evstore_core::HttpError;
use http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdminError {
    /// The server answered with a status other than the expected one.
    #[error("{message}")]
    CommandFailed { status: StatusCode, message: String },

    /// A create or command POST collided with existing server state.
    #[error("conflict: {status} ({reason})")]
    Conflict { status: StatusCode, reason: String },

    #[error("empty response body from {url}")]
    EmptyBody { url: String },

    #[error("malformed response body: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] HttpError),
}

impl AdminError {
    /// HTTP status when the server produced one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            AdminError::CommandFailed { status, .. } | AdminError::Conflict { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type AdminResult<T> = Result<T, AdminError>;
