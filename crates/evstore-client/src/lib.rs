//! evstore-client — TCP client for the evstore event database.
//!
//! Multiplexes request/response operations and push subscriptions over a
//! single connection, with heartbeats, retries and transparent
//! reconnection.
//!
//! # Architecture
//!
//! ```text
//! Connection (cloneable facade)
//!   └── Engine task (single owner of connection state)
//!       ├── EndpointDiscoverer (static / cluster gossip)
//!       ├── Transport (framed socket, optional TLS)
//!       ├── HeartbeatMonitor, ReconnectionController
//!       ├── OperationsManager (correlation, timeouts, retries)
//!       └── SubscriptionsManager ──► per-subscription tasks
//!             (volatile, catch-up, persistent) ──► user handlers
//! ```
//!
//! # Example
//!
//! ```no_run
//! # async fn demo() -> evstore_client::ClientResult<()> {
//! use evstore_client::{Connection, EventData, ExpectedVersion};
//! use evstore_core::{ConnectionSettings, EndPoint};
//!
//! let settings = ConnectionSettings::single_node(EndPoint::new("127.0.0.1", 1113));
//! let conn = Connection::from_settings(settings)?;
//! conn.connect().await?;
//! let event = EventData::new("OrderPlaced", true, &b"{\"id\":1}"[..]);
//! conn.append_to_stream("orders-1", ExpectedVersion::Any, vec![event], None).await?;
//! conn.close().await;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod discovery;
pub mod error;
pub mod events;
pub mod subscriptions;

mod engine;
mod heartbeat;
mod operations;
mod reconnect;
mod transport;

pub use connection::Connection;
pub use discovery::{
    ClusterEndpointDiscoverer, EndpointDiscoverer, NodeEndpoints, StaticEndpointDiscoverer,
};
pub use error::{ClientError, ClientResult};
pub use events::ConnectionEvent;
pub use subscriptions::{
    CatchUpSubscription, CatchUpTarget, EventHandler, PersistentEventHandler, PersistentSubscription,
    PersistentSubscriptionContext, SubscriptionContext, VolatileSubscription,
};

pub use evstore_core::{
    EventData, ExpectedVersion, Position, ResolvedEvent, SubscriptionDropReason, UserCredentials,
};
pub use evstore_proto::messages::NakAction;
