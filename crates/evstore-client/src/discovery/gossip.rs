//! Cluster discovery by polling the gossip HTTP endpoint.

use std::sync::Mutex;

use evstore_core::http::HttpClient;
use evstore_core::{EndPoint, GossipSettings, NodePreference};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{DiscoveryFuture, EndpointDiscoverer, NodeEndpoints};
use crate::error::{ClientError, ClientResult};

/// Cluster role reported for a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum MemberState {
    Initializing,
    DiscoverLeader,
    Unknown,
    PreReplica,
    CatchingUp,
    Clone,
    #[serde(alias = "Slave")]
    Follower,
    #[serde(alias = "PreMaster")]
    PreLeader,
    #[serde(alias = "Master")]
    Leader,
    Manager,
    ShuttingDown,
    Shutdown,
    ReadOnlyLeaderless,
    PreReadOnlyReplica,
    ReadOnlyReplica,
    ResigningLeader,
    #[serde(other)]
    Other,
}

impl MemberState {
    /// Lower ranks are better candidates. `None` excludes the member.
    fn rank(self, preference: NodePreference) -> Option<u8> {
        let rank = match (self, preference) {
            (MemberState::Leader, NodePreference::Leader) => 0,
            (MemberState::Follower, NodePreference::Leader) => 1,
            (MemberState::Follower, NodePreference::Follower) => 0,
            (MemberState::Leader, NodePreference::Follower) => 1,
            (MemberState::Clone, _) => 2,
            (MemberState::CatchingUp, _) => 3,
            (MemberState::PreReplica, _) => 4,
            (MemberState::PreLeader, _) => 5,
            (MemberState::ReadOnlyReplica, _) => 6,
            (MemberState::PreReadOnlyReplica, _) => 7,
            (MemberState::ReadOnlyLeaderless, _) => 8,
            (MemberState::Initializing, _) => 9,
            (MemberState::DiscoverLeader, _) => 10,
            (MemberState::Unknown, _) => 11,
            (MemberState::ResigningLeader, _) => 12,
            (MemberState::Manager, _)
            | (MemberState::ShuttingDown, _)
            | (MemberState::Shutdown, _)
            | (MemberState::Other, _) => return None,
        };
        Some(rank)
    }
}

/// One entry of the gossip `members` array.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GossipMember {
    pub state: MemberState,
    pub is_alive: bool,
    pub external_tcp_ip: String,
    pub external_tcp_port: u16,
    #[serde(default)]
    pub external_secure_tcp_port: u16,
    pub external_http_ip: String,
    pub external_http_port: u16,
    #[serde(default)]
    pub last_commit_position: i64,
    #[serde(default)]
    pub writer_checkpoint: i64,
}

impl GossipMember {
    pub fn tcp_endpoints(&self) -> NodeEndpoints {
        let secure_tcp = (self.external_secure_tcp_port > 0)
            .then(|| EndPoint::new(self.external_tcp_ip.clone(), self.external_secure_tcp_port));
        NodeEndpoints {
            tcp: Some(EndPoint::new(self.external_tcp_ip.clone(), self.external_tcp_port)),
            secure_tcp,
        }
    }

    pub fn http_endpoint(&self) -> EndPoint {
        EndPoint::new(self.external_http_ip.clone(), self.external_http_port)
    }
}

#[derive(Debug, Deserialize)]
struct ClusterInfo {
    #[serde(default)]
    members: Vec<GossipMember>,
}

/// Order alive members by role preference, then by the most advanced
/// commit position.
pub(crate) fn rank_members(members: &[GossipMember], preference: NodePreference) -> Vec<NodeEndpoints> {
    let mut ranked: Vec<(u8, i64, &GossipMember)> = members
        .iter()
        .filter(|m| m.is_alive)
        .filter_map(|m| m.state.rank(preference).map(|r| (r, m.last_commit_position, m)))
        .collect();
    ranked.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
    ranked.into_iter().map(|(_, _, m)| m.tcp_endpoints()).collect()
}

/// Discovers cluster nodes from gossip seeds or a cluster DNS name.
pub struct ClusterEndpointDiscoverer {
    settings: GossipSettings,
    http: HttpClient,
    /// Members seen in the last successful round.
    last_members: Mutex<Option<Vec<GossipMember>>>,
}

impl ClusterEndpointDiscoverer {
    pub fn new(settings: GossipSettings) -> Self {
        let http = HttpClient::plain(settings.gossip_timeout);
        Self {
            settings,
            http,
            last_members: Mutex::new(None),
        }
    }

    async fn discover_with_retries(&self, failed: Option<EndPoint>) -> ClientResult<Vec<NodeEndpoints>> {
        let attempts = self.settings.max_discover_attempts.max(1);
        for attempt in 1..=attempts {
            match self.discover_once(failed.as_ref()).await {
                Some(nodes) => {
                    info!(attempt, best = %nodes[0], "cluster discovery succeeded");
                    return Ok(nodes);
                }
                None => {
                    debug!(attempt, max = attempts, "cluster discovery found no usable node");
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.discover_delay).await;
                    }
                }
            }
        }
        warn!(attempts, "cluster discovery exhausted");
        Err(ClientError::NoEndpointsAvailable { attempts })
    }

    async fn discover_once(&self, failed: Option<&EndPoint>) -> Option<Vec<NodeEndpoints>> {
        for candidate in self.gossip_candidates(failed).await {
            let Some(members) = self.fetch_members(&candidate).await else {
                continue;
            };
            let ranked = rank_members(&members, self.settings.node_preference);
            if ranked.is_empty() {
                debug!(%candidate, "gossip reported no alive members");
                continue;
            }
            if let Ok(mut last) = self.last_members.lock() {
                *last = Some(members);
            }
            return Some(ranked);
        }
        None
    }

    /// Gossip endpoints to query: members from the previous round, minus
    /// the node that just failed, otherwise the configured seeds.
    ///
    /// Remembered members are used for one round only, so a cluster that
    /// moved entirely falls back to the seeds.
    async fn gossip_candidates(&self, failed: Option<&EndPoint>) -> Vec<EndPoint> {
        let previous = self.last_members.lock().ok().and_then(|mut last| last.take());
        if let Some(members) = previous {
            let candidates: Vec<EndPoint> = members
                .iter()
                .filter(|m| m.is_alive)
                .filter(|m| {
                    let node = m.tcp_endpoints();
                    failed.is_none_or(|f| node.tcp.as_ref() != Some(f) && node.secure_tcp.as_ref() != Some(f))
                })
                .map(GossipMember::http_endpoint)
                .collect();
            if !candidates.is_empty() {
                return candidates;
            }
        }

        if !self.settings.seeds.is_empty() {
            return self.settings.seeds.clone();
        }

        match &self.settings.cluster_dns {
            Some(dns) => match tokio::net::lookup_host((dns.as_str(), self.settings.gossip_port)).await {
                Ok(addrs) => addrs.map(EndPoint::from).collect(),
                Err(e) => {
                    warn!(%dns, error = %e, "cluster dns lookup failed");
                    Vec::new()
                }
            },
            None => Vec::new(),
        }
    }

    async fn fetch_members(&self, endpoint: &EndPoint) -> Option<Vec<GossipMember>> {
        let resp = match self.http.get(endpoint, "/gossip?format=json", None).await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(%endpoint, error = %e, "gossip request failed");
                return None;
            }
        };
        if !resp.status.is_success() {
            debug!(%endpoint, status = %resp.status, "gossip returned non-2xx");
            return None;
        }
        match serde_json::from_slice::<ClusterInfo>(&resp.body) {
            Ok(info) => Some(info.members),
            Err(e) => {
                warn!(%endpoint, error = %e, "gossip response is not valid cluster info");
                None
            }
        }
    }
}

impl EndpointDiscoverer for ClusterEndpointDiscoverer {
    fn discover(&self, failed: Option<EndPoint>) -> DiscoveryFuture<'_> {
        Box::pin(self.discover_with_retries(failed))
    }
}
