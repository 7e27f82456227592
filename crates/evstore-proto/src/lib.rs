//! Wire layer of the evstore TCP protocol.
//!
//! Everything the client puts on or takes off the socket passes through
//! this crate:
//!
//! ```text
//! ┌──────────┬─────────┬───────┬────────────────┬─────────────┬─────────┐
//! │ len (LE) │ command │ flags │ correlation id │ credentials │ payload │
//! │ 4 bytes  │ 1 byte  │ 1 byte│ 16 bytes       │ optional    │ N bytes │
//! └──────────┴─────────┴───────┴────────────────┴─────────────┴─────────┘
//! ```
//!
//! - [`command`]: the closed set of command codes.
//! - [`package`]: frame encode/decode, including streaming decode.
//! - [`messages`]: protobuf payload types carried inside packages.
//! - [`credentials`]: login/password attached to authenticated frames.

pub mod command;
pub mod credentials;
pub mod error;
pub mod messages;
pub mod package;

pub use command::Command;
pub use credentials::UserCredentials;
pub use error::{ProtoError, ProtoResult};
pub use package::{MAX_PACKAGE_SIZE, Package};
