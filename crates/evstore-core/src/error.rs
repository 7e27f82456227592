//! Configuration and HTTP error types.

use std::time::Duration;

use thiserror::Error;

/// Errors loading or validating settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid endpoint '{0}', expected host:port")]
    InvalidEndpoint(String),

    #[error("invalid setting: {0}")]
    Invalid(String),

    #[error("tls configuration error: {0}")]
    Tls(String),
}

/// Errors from the small HTTP/1 client used for gossip and admin calls.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tls handshake with {endpoint} failed: {message}")]
    Tls { endpoint: String, message: String },

    #[error("http exchange failed: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] http::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

pub type HttpResult<T> = Result<T, HttpError>;
