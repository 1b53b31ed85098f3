//! Inter-master RPC transport
//!
//! [`Transport`] is the client side the consensus engine uses to reach its
//! peers. [`install`] is the server side: it mounts the engine's RPC
//! handlers on an axum router under the `/cluster` prefix.
//!
//! Two implementations:
//! - [`HttpTransport`]: JSON over HTTP with a pooled reqwest client
//! - [`MemoryNetwork`]: in-process delivery with link partitioning

use crate::common::raft::{
    AppendRequest, AppendResponse, JoinRequest, JoinResponse, SnapshotRequest, SnapshotResponse,
    VoteRequest, VoteResponse,
};
use crate::common::{normalize_address, Error, Result};
use crate::coordinator::raft_node::RaftNode;
use async_trait::async_trait;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

/// Path prefix for all inter-node routes
pub const CLUSTER_PREFIX: &str = "/cluster";

pub const VOTE_PATH: &str = "/vote";
pub const APPEND_PATH: &str = "/append";
pub const SNAPSHOT_PATH: &str = "/snapshot";
pub const JOIN_PATH: &str = "/join";

/// Client side of the consensus RPCs; `peer` is a connection string
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn request_vote(&self, peer: &str, req: VoteRequest) -> Result<VoteResponse>;

    async fn append_entries(&self, peer: &str, req: AppendRequest) -> Result<AppendResponse>;

    async fn install_snapshot(&self, peer: &str, req: SnapshotRequest)
        -> Result<SnapshotResponse>;

    async fn join(&self, peer: &str, req: JoinRequest) -> Result<JoinResponse>;
}

// ============================================================================
// HTTP
// ============================================================================

/// JSON-over-HTTP transport with per-peer connection pooling
pub struct HttpTransport {
    client: reqwest::Client,
    prefix: String,
}

impl HttpTransport {
    /// Build a transport whose pool keeps up to `max_idle_per_host` idle
    /// connections to each peer. Size it to at least the peer count.
    pub fn new(prefix: &str, rpc_timeout: Duration, max_idle_per_host: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(max_idle_per_host)
            .connect_timeout(rpc_timeout)
            .timeout(rpc_timeout)
            .build()?;
        Ok(Self {
            client,
            prefix: prefix.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, peer: &str, path: &str) -> String {
        format!(
            "http://{}{}{}",
            normalize_address(peer),
            self.prefix,
            path
        )
    }

    async fn post<Req, Resp>(&self, peer: &str, path: &str, req: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = self.url(peer, path);
        let resp = self.client.post(&url).json(req).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Transport(format!("{} returned {}", url, resp.status())));
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request_vote(&self, peer: &str, req: VoteRequest) -> Result<VoteResponse> {
        self.post(peer, VOTE_PATH, &req).await
    }

    async fn append_entries(&self, peer: &str, req: AppendRequest) -> Result<AppendResponse> {
        self.post(peer, APPEND_PATH, &req).await
    }

    async fn install_snapshot(
        &self,
        peer: &str,
        req: SnapshotRequest,
    ) -> Result<SnapshotResponse> {
        self.post(peer, SNAPSHOT_PATH, &req).await
    }

    async fn join(&self, peer: &str, req: JoinRequest) -> Result<JoinResponse> {
        self.post(peer, JOIN_PATH, &req).await
    }
}

/// Mount the engine's RPC handlers under `prefix` on `router`
pub fn install(router: Router, prefix: &str, node: Arc<RaftNode>) -> Router {
    let prefix = prefix.trim_end_matches('/');
    let routes = Router::new()
        .route(&format!("{}{}", prefix, VOTE_PATH), post(vote_handler))
        .route(&format!("{}{}", prefix, APPEND_PATH), post(append_handler))
        .route(&format!("{}{}", prefix, SNAPSHOT_PATH), post(snapshot_handler))
        .route(&format!("{}{}", prefix, JOIN_PATH), post(join_handler))
        .with_state(node);
    router.merge(routes)
}

async fn vote_handler(
    State(node): State<Arc<RaftNode>>,
    Json(req): Json<VoteRequest>,
) -> Json<VoteResponse> {
    Json(node.handle_request_vote(req))
}

async fn append_handler(
    State(node): State<Arc<RaftNode>>,
    Json(req): Json<AppendRequest>,
) -> Json<AppendResponse> {
    Json(node.handle_append_entries(req))
}

async fn snapshot_handler(
    State(node): State<Arc<RaftNode>>,
    Json(req): Json<SnapshotRequest>,
) -> Json<SnapshotResponse> {
    Json(node.handle_install_snapshot(req))
}

async fn join_handler(
    State(node): State<Arc<RaftNode>>,
    Json(req): Json<JoinRequest>,
) -> Json<JoinResponse> {
    Json(node.handle_join(req).await)
}

// ============================================================================
// In-memory
// ============================================================================

/// In-process network connecting [`RaftNode`]s by address
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: RwLock<HashMap<String, Weak<RaftNode>>>,
    isolated: RwLock<HashSet<String>>,
    cut_links: RwLock<HashSet<(String, String)>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport for the node at `local`
    pub fn transport(self: &Arc<Self>, local: &str) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            network: self.clone(),
            local: normalize_address(local),
        })
    }

    /// Make `node` reachable under its own name
    pub fn install(&self, node: &Arc<RaftNode>) {
        self.nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node.name().to_string(), Arc::downgrade(node));
    }

    pub fn remove(&self, addr: &str) {
        self.nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&normalize_address(addr));
    }

    /// Drop all traffic to and from `addr`
    pub fn isolate(&self, addr: &str) {
        self.isolated
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(normalize_address(addr));
    }

    /// Drop traffic between `a` and `b` in both directions
    pub fn cut(&self, a: &str, b: &str) {
        let (a, b) = (normalize_address(a), normalize_address(b));
        let mut links = self.cut_links.write().unwrap_or_else(|e| e.into_inner());
        links.insert((a.clone(), b.clone()));
        links.insert((b, a));
    }

    /// Restore every link
    pub fn heal(&self) {
        self.isolated
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.cut_links
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn route(&self, from: &str, to: &str) -> Result<Arc<RaftNode>> {
        let to = normalize_address(to);
        let unreachable = || Error::ConnectionFailed(format!("{} -> {} unreachable", from, to));

        {
            let isolated = self.isolated.read().unwrap_or_else(|e| e.into_inner());
            if isolated.contains(from) || isolated.contains(&to) {
                return Err(unreachable());
            }
        }
        if self
            .cut_links
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&(from.to_string(), to.clone()))
        {
            return Err(unreachable());
        }

        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&to)
            .and_then(Weak::upgrade)
            .ok_or_else(unreachable)
    }
}

/// One node's view of a [`MemoryNetwork`]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    local: String,
}

impl MemoryTransport {
    async fn deliver(&self, peer: &str) -> Result<Arc<RaftNode>> {
        // let other tasks run, as a real network hop would
        tokio::task::yield_now().await;
        self.network.route(&self.local, peer)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn request_vote(&self, peer: &str, req: VoteRequest) -> Result<VoteResponse> {
        let node = self.deliver(peer).await?;
        Ok(node.handle_request_vote(req))
    }

    async fn append_entries(&self, peer: &str, req: AppendRequest) -> Result<AppendResponse> {
        let node = self.deliver(peer).await?;
        Ok(node.handle_append_entries(req))
    }

    async fn install_snapshot(
        &self,
        peer: &str,
        req: SnapshotRequest,
    ) -> Result<SnapshotResponse> {
        let node = self.deliver(peer).await?;
        Ok(node.handle_install_snapshot(req))
    }

    async fn join(&self, peer: &str, req: JoinRequest) -> Result<JoinResponse> {
        let node = self.deliver(peer).await?;
        Ok(node.handle_join(req).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_url() {
        let transport = HttpTransport::new(CLUSTER_PREFIX, Duration::from_millis(100), 8).unwrap();
        assert_eq!(
            transport.url("http://m1:9333", VOTE_PATH),
            "http://m1:9333/cluster/vote"
        );
        assert_eq!(
            transport.url("m2:9333", APPEND_PATH),
            "http://m2:9333/cluster/append"
        );
    }

    #[tokio::test]
    async fn test_memory_unknown_peer_is_unreachable() {
        let network = MemoryNetwork::new();
        let transport = network.transport("a:1");
        let err = transport
            .request_vote(
                "http://b:1",
                VoteRequest {
                    term: 1,
                    candidate_id: "a:1".into(),
                    last_log_index: 0,
                    last_log_term: 0,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed(_)));
    }
}
