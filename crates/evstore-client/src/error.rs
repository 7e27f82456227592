//! Client error type.

use std::time::Duration;

use evstore_core::{ConfigError, SubscriptionDropReason};
use evstore_proto::{Command, ProtoError};
use thiserror::Error;

/// Errors surfaced to callers of the connection.
///
/// Cloneable so a single terminal error can be handed to every pending
/// operation and subscription when the connection closes.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("expected {expected} but the server sent {actual}")]
    UnexpectedCommand { expected: Command, actual: Command },

    #[error("{operation} timed out after {elapsed:?}")]
    OperationTimedOut {
        operation: &'static str,
        elapsed: Duration,
    },

    #[error("{operation} reached its retry limit of {limit}")]
    RetriesLimitReached { operation: &'static str, limit: i32 },

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("not authenticated: {0}")]
    NotAuthenticated(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("server error: {0}")]
    ServerError(String),

    #[error("no endpoints available after {attempts} discovery attempts")]
    NoEndpointsAvailable { attempts: u32 },

    #[error("i/o error: {0}")]
    Io(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("operation queue is full ({0} waiting)")]
    QueueFull(usize),

    #[error("subscription dropped: {0}")]
    SubscriptionDropped(SubscriptionDropReason),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<ProtoError> for ClientError {
    fn from(e: ProtoError) -> Self {
        ClientError::Protocol(e.to_string())
    }
}

impl From<ConfigError> for ClientError {
    fn from(e: ConfigError) -> Self {
        ClientError::Config(e.to_string())
    }
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Protocol(format!("json: {e}"))
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
