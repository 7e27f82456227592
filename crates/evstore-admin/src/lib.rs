//! evstore-admin — HTTP administration for an evstore node.
//!
//! [`ProjectionsManager`] drives the projection engine;
//! [`PersistentSubscriptionsManager`] inspects subscription groups and
//! replays parked messages. Both build on the shared
//! [`HttpClient`](evstore_core::http::HttpClient), so TLS and timeouts
//! follow whatever client they are handed.

pub mod error;
pub mod models;
pub mod projections;
pub mod subscriptions;

mod request;

pub use error::{AdminError, AdminResult};
pub use models::{
    PersistentSubscriptionConfigDetails, PersistentSubscriptionConnectionDetails,
    PersistentSubscriptionDetails, ProjectionDetails, ProjectionStatistics,
};
pub use projections::ProjectionsManager;
pub use subscriptions::PersistentSubscriptionsManager;
