//! Wire-level error types.

use thiserror::Error;

/// Errors produced while framing or parsing packages.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("malformed package: {0}")]
    MalformedPackage(String),

    #[error("package of {size} bytes exceeds the {max} byte limit")]
    PackageTooLarge { size: usize, max: usize },

    #[error("unknown command code 0x{0:02X}")]
    UnknownCommand(u8),

    #[error("{field} is {len} bytes, at most 255 allowed")]
    CredentialsTooLong { field: &'static str, len: usize },

    #[error("payload decode failed: {0}")]
    Decode(#[from] prost::DecodeError),
}

pub type ProtoResult<T> = Result<T, ProtoError>;
