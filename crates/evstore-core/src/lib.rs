//! Shared building blocks for the evstore client crates.
//!
//! - [`event`], [`position`], [`results`], [`metadata`]: value types
//!   handed to and returned from application calls.
//! - [`settings`]: connection and subscription settings, loadable from TOML.
//! - [`tls`] and [`http`]: transport plumbing reused by gossip discovery
//!   and the administrative clients.

pub mod duration;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod http;
pub mod metadata;
pub mod position;
pub mod results;
pub mod settings;
pub mod subscription;
pub mod tls;

pub use endpoint::EndPoint;
pub use error::{ConfigError, HttpError, HttpResult};
pub use event::{EventData, RecordedEvent, ResolvedEvent};
pub use evstore_proto::UserCredentials;
pub use metadata::{StreamAcl, StreamMetadata, StreamMetadataResult};
pub use position::{ExpectedVersion, Position, StreamPosition};
pub use results::{
    AllEventsSlice, DeleteResult, EventReadResult, EventReadStatus, ReadDirection,
    SliceReadStatus, StreamEventsSlice, WriteResult,
};
pub use settings::{
    CatchUpSubscriptionSettings, ConnectionSettings, GossipSettings, NodePreference,
    PersistentSubscriptionSettings, ConsumerStrategy,
};
pub use subscription::SubscriptionDropReason;
pub use tls::TlsConfig;
