//! Connection and subscription settings.
//!
//! `ConnectionSettings` can be built in code with the `with_*` setters or
//! loaded from a TOML file:
//!
//! ```toml
//! endpoint = "127.0.0.1:1113"
//! operation_timeout = "7s"
//! heartbeat_interval = "750ms"
//!
//! [default_credentials]
//! username = "admin"
//! password = "changeit"
//!
//! [gossip]
//! seeds = ["10.0.0.1:2113", "10.0.0.2:2113"]
//! node_preference = "leader"
//! ```

use std::path::Path;
use std::time::Duration;

use evstore_proto::UserCredentials;
use serde::{Deserialize, Serialize};

use crate::duration;
use crate::endpoint::EndPoint;
use crate::error::ConfigError;

/// Settings for one client connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Single-node endpoint. Ignored when `gossip` is set.
    pub endpoint: Option<EndPoint>,

    pub use_tls: bool,
    /// Server name presented for TLS; defaults to the endpoint host.
    pub target_host: Option<String>,
    pub validate_server: bool,

    pub connection_name: Option<String>,
    pub require_master: bool,

    /// Operations waiting for a slot beyond this count are rejected.
    pub max_queue_size: usize,
    /// Operations allowed on the wire at once.
    pub max_concurrent_items: usize,
    /// Per-operation retry budget; negative means unlimited.
    pub max_retries: i32,
    /// Reconnection budget; negative means unlimited.
    pub max_reconnections: i32,

    #[serde(with = "duration")]
    pub reconnection_delay: Duration,
    #[serde(with = "duration")]
    pub max_reconnection_delay: Duration,
    #[serde(with = "duration")]
    pub operation_timeout: Duration,
    #[serde(with = "duration")]
    pub operation_timeout_check_period: Duration,
    /// When false, timed-out operations are retried instead of failed.
    pub fail_on_no_server_response: bool,
    #[serde(with = "duration")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration")]
    pub heartbeat_timeout: Duration,
    /// Bounds TCP connect, TLS and the identify handshake.
    #[serde(with = "duration")]
    pub client_connection_timeout: Duration,

    pub default_credentials: Option<UserCredentials>,
    pub gossip: Option<GossipSettings>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            use_tls: false,
            target_host: None,
            validate_server: true,
            connection_name: None,
            require_master: true,
            max_queue_size: 5000,
            max_concurrent_items: 5000,
            max_retries: 10,
            max_reconnections: 10,
            reconnection_delay: Duration::from_millis(100),
            max_reconnection_delay: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(7),
            operation_timeout_check_period: Duration::from_secs(1),
            fail_on_no_server_response: true,
            heartbeat_interval: Duration::from_millis(750),
            heartbeat_timeout: Duration::from_millis(1500),
            client_connection_timeout: Duration::from_secs(1),
            default_credentials: None,
            gossip: None,
        }
    }
}

impl ConnectionSettings {
    /// Settings for a single node.
    pub fn single_node(endpoint: EndPoint) -> Self {
        Self {
            endpoint: Some(endpoint),
            ..Default::default()
        }
    }

    /// Settings for a gossip-discovered cluster.
    pub fn cluster(gossip: GossipSettings) -> Self {
        Self {
            gossip: Some(gossip),
            ..Default::default()
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let settings: ConnectionSettings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.is_none() && self.gossip.is_none() {
            return Err(ConfigError::Invalid(
                "either endpoint or gossip must be set".into(),
            ));
        }
        if let Some(gossip) = &self.gossip {
            if gossip.seeds.is_empty() && gossip.cluster_dns.is_none() {
                return Err(ConfigError::Invalid(
                    "gossip needs seeds or cluster_dns".into(),
                ));
            }
        }
        if self.max_concurrent_items == 0 {
            return Err(ConfigError::Invalid("max_concurrent_items must be positive".into()));
        }
        if self.heartbeat_timeout.is_zero()
            || self.operation_timeout.is_zero()
            || self.client_connection_timeout.is_zero()
        {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        if let Some(credentials) = &self.default_credentials {
            credentials
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("default_credentials: {e}")))?;
        }
        Ok(())
    }

    pub fn with_default_credentials(mut self, credentials: UserCredentials) -> Self {
        self.default_credentials = Some(credentials);
        self
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    pub fn with_tls(mut self, target_host: Option<String>, validate_server: bool) -> Self {
        self.use_tls = true;
        self.target_host = target_host;
        self.validate_server = validate_server;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Bounds socket establishment and each handshake step.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.client_connection_timeout = timeout;
        self
    }

    pub fn with_timeout_check_period(mut self, period: Duration) -> Self {
        self.operation_timeout_check_period = period;
        self
    }

    pub fn with_max_retries(mut self, retries: i32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_max_reconnections(mut self, reconnections: i32) -> Self {
        self.max_reconnections = reconnections;
        self
    }

    pub fn with_reconnection_delay(mut self, delay: Duration, max: Duration) -> Self {
        self.reconnection_delay = delay;
        self.max_reconnection_delay = max;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_items(mut self, items: usize) -> Self {
        self.max_concurrent_items = items;
        self
    }

    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }
}

/// Which node role discovery should prefer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodePreference {
    #[default]
    Leader,
    Follower,
}

/// Cluster discovery through the gossip HTTP endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipSettings {
    /// HTTP endpoints of known cluster nodes.
    pub seeds: Vec<EndPoint>,
    /// DNS name resolving to cluster nodes, used when `seeds` is empty.
    pub cluster_dns: Option<String>,
    pub gossip_port: u16,
    pub max_discover_attempts: u32,
    #[serde(with = "duration")]
    pub discover_delay: Duration,
    #[serde(with = "duration")]
    pub gossip_timeout: Duration,
    pub node_preference: NodePreference,
}

impl Default for GossipSettings {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            cluster_dns: None,
            gossip_port: 2113,
            max_discover_attempts: 10,
            discover_delay: Duration::from_millis(500),
            gossip_timeout: Duration::from_secs(1),
            node_preference: NodePreference::Leader,
        }
    }
}

impl GossipSettings {
    pub fn with_seeds(seeds: Vec<EndPoint>) -> Self {
        Self {
            seeds,
            ..Default::default()
        }
    }
}

/// Settings for a catch-up subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUpSubscriptionSettings {
    /// Live events buffered while the handler is busy before the
    /// subscription is dropped with `ProcessingQueueOverflow`.
    pub max_live_queue_size: usize,
    /// Events requested per historical read.
    pub read_batch_size: i32,
    pub resolve_link_tos: bool,
    /// Reopen the subscription after the connection drops unless the
    /// subscription was stopped.
    pub resubscribe_on_reconnect: bool,
    pub subscription_name: String,
}

impl Default for CatchUpSubscriptionSettings {
    fn default() -> Self {
        Self {
            max_live_queue_size: 10_000,
            read_batch_size: 500,
            resolve_link_tos: false,
            resubscribe_on_reconnect: true,
            subscription_name: String::new(),
        }
    }
}

/// Load-balancing strategy for a persistent subscription group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsumerStrategy {
    DispatchToSingle,
    #[default]
    RoundRobin,
    Pinned,
}

impl ConsumerStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ConsumerStrategy::DispatchToSingle => "DispatchToSingle",
            ConsumerStrategy::RoundRobin => "RoundRobin",
            ConsumerStrategy::Pinned => "Pinned",
        }
    }
}

/// Server-side settings of a persistent subscription group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentSubscriptionSettings {
    pub resolve_link_tos: bool,
    /// Event number to start from; -1 means the end of the stream.
    pub start_from: i64,
    pub extra_statistics: bool,
    pub message_timeout: Duration,
    pub max_retry_count: i32,
    pub live_buffer_size: i32,
    pub read_batch_size: i32,
    pub history_buffer_size: i32,
    pub checkpoint_after: Duration,
    pub min_checkpoint_count: i32,
    pub max_checkpoint_count: i32,
    pub max_subscriber_count: i32,
    pub consumer_strategy: ConsumerStrategy,
}

impl Default for PersistentSubscriptionSettings {
    fn default() -> Self {
        Self {
            resolve_link_tos: false,
            start_from: -1,
            extra_statistics: false,
            message_timeout: Duration::from_secs(30),
            max_retry_count: 10,
            live_buffer_size: 500,
            read_batch_size: 20,
            history_buffer_size: 500,
            checkpoint_after: Duration::from_secs(2),
            min_checkpoint_count: 10,
            max_checkpoint_count: 1000,
            max_subscriber_count: 0,
            consumer_strategy: ConsumerStrategy::RoundRobin,
        }
    }
}

impl PersistentSubscriptionSettings {
    pub fn start_from_beginning(mut self) -> Self {
        self.start_from = 0;
        self
    }

    pub fn start_from_current(mut self) -> Self {
        self.start_from = -1;
        self
    }
}
