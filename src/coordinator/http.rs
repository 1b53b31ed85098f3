//! HTTP API for master nodes
//!
//! - `GET /cluster/status`: leader, peers and role as seen by this node
//! - `GET /cluster/health`: 200 while a leader is known, 503 otherwise
//! - `POST /vol/assign_id`: allocate a volume id (leader only)
//! - `GET /metrics`: Prometheus text
//!
//! The inter-master RPC routes are mounted by [`transport::install`].

use crate::common::Result;
use crate::coordinator::raft_node::{ClusterStatus, RaftNode};
use crate::coordinator::sequencer::VolumeIdSequencer;
use crate::coordinator::transport::{self, CLUSTER_PREFIX};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Snapshots can be large
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Shared master state for HTTP handlers.
#[derive(Clone)]
pub struct MasterState {
    pub raft: Arc<RaftNode>,
    pub sequencer: Arc<VolumeIdSequencer>,
}

impl MasterState {
    pub fn new(raft: Arc<RaftNode>) -> Self {
        Self {
            raft,
            sequencer: Arc::new(VolumeIdSequencer::new()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AssignVolumeIdResponse {
    pub volume_id: u32,
}

pub fn create_router(state: MasterState) -> Router {
    let raft = state.raft.clone();
    let public = Router::new()
        .route("/cluster/status", get(cluster_status))
        .route("/cluster/health", get(cluster_health))
        .route("/vol/assign_id", post(assign_volume_id))
        .route("/metrics", get(metrics))
        .with_state(state);

    transport::install(public, CLUSTER_PREFIX, raft)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
}

/// Current leader and membership; never requires leadership
async fn cluster_status(State(state): State<MasterState>) -> Json<ClusterStatus> {
    Json(state.raft.status())
}

async fn cluster_health(State(state): State<MasterState>) -> impl IntoResponse {
    let status = state.raft.status();
    let code = if status.leader.is_some() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({
            "healthy": status.leader.is_some(),
            "leader": status.leader,
            "role": status.role,
            "version": crate::VERSION,
        })),
    )
}

async fn assign_volume_id(
    State(state): State<MasterState>,
) -> Result<Json<AssignVolumeIdResponse>> {
    let volume_id = state.sequencer.next_volume_id(&state.raft).await?;
    Ok(Json(AssignVolumeIdResponse { volume_id }))
}

pub async fn metrics(State(state): State<MasterState>) -> impl IntoResponse {
    let mut out = crate::common::METRICS.to_prometheus();
    let status = state.raft.status();
    out += "# HELP tidemaster_is_leader Whether this node leads the cluster\n";
    out += "# TYPE tidemaster_is_leader gauge\n";
    out += &format!("tidemaster_is_leader {}\n", u8::from(status.is_leader));
    out += "# HELP tidemaster_peers Known peers excluding this node\n";
    out += "# TYPE tidemaster_peers gauge\n";
    out += &format!("tidemaster_peers {}\n", status.peers.len());
    out += "# HELP tidemaster_max_volume_id Highest applied volume id\n";
    out += "# TYPE tidemaster_max_volume_id gauge\n";
    out += &format!("tidemaster_max_volume_id {}\n", state.raft.topology().max_volume_id);

    (StatusCode::OK, out)
}
