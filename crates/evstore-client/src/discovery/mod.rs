//! Endpoint discovery.
//!
//! A discoverer produces an ordered list of candidate nodes; the engine
//! connects to the first one and asks again on every reconnection cycle.

mod gossip;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use evstore_core::EndPoint;

pub use gossip::{ClusterEndpointDiscoverer, GossipMember, MemberState};

use crate::error::ClientResult;

/// TCP endpoints of one node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeEndpoints {
    pub tcp: Option<EndPoint>,
    pub secure_tcp: Option<EndPoint>,
}

impl NodeEndpoints {
    /// The endpoint to dial, preferring the secure one when TLS is on.
    pub fn select(&self, use_tls: bool) -> Option<&EndPoint> {
        if use_tls {
            self.secure_tcp.as_ref().or(self.tcp.as_ref())
        } else {
            self.tcp.as_ref().or(self.secure_tcp.as_ref())
        }
    }
}

impl fmt::Display for NodeEndpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.tcp, &self.secure_tcp) {
            (Some(tcp), Some(secure)) => write!(f, "tcp://{tcp}, tls://{secure}"),
            (Some(tcp), None) => write!(f, "tcp://{tcp}"),
            (None, Some(secure)) => write!(f, "tls://{secure}"),
            (None, None) => f.write_str("<none>"),
        }
    }
}

/// Boxed future returned by [`EndpointDiscoverer::discover`].
pub type DiscoveryFuture<'a> = Pin<Box<dyn Future<Output = ClientResult<Vec<NodeEndpoints>>> + Send + 'a>>;

/// Resolves the nodes the engine may connect to, best candidate first.
pub trait EndpointDiscoverer: Send + Sync {
    /// `failed` is the endpoint the previous transport was connected to, if
    /// that transport was lost.
    fn discover(&self, failed: Option<EndPoint>) -> DiscoveryFuture<'_>;
}

/// Always yields the one configured endpoint.
#[derive(Debug, Clone)]
pub struct StaticEndpointDiscoverer {
    node: NodeEndpoints,
}

impl StaticEndpointDiscoverer {
    pub fn new(endpoint: EndPoint, use_tls: bool) -> Self {
        let node = if use_tls {
            NodeEndpoints {
                tcp: None,
                secure_tcp: Some(endpoint),
            }
        } else {
            NodeEndpoints {
                tcp: Some(endpoint),
                secure_tcp: None,
            }
        };
        Self { node }
    }
}

impl EndpointDiscoverer for StaticEndpointDiscoverer {
    fn discover(&self, _failed: Option<EndPoint>) -> DiscoveryFuture<'_> {
        let node = self.node.clone();
        Box::pin(async move { Ok(vec![node]) })
    }
}
