//! Raft consensus node for the master cluster
//!
//! All election, term and log state sits in one `Mutex<RaftCore>` which is
//! never held across an `.await`. Two background tasks drive the node:
//! - the timer loop sends heartbeats as leader and starts elections
//!   when a promotable follower stops hearing from one
//! - the apply loop feeds committed entries, in order, to the topology
//!   state machine and publishes each applied state on a `watch` channel
//!
//! Outbound RPCs run as short-lived tasks, at most one in flight per peer.

use crate::common::raft::{
    AppendRequest, AppendResponse, JoinRequest, JoinResponse, LogEntry, PeerRecord, Snapshot,
    SnapshotRequest, SnapshotResponse, VoteRequest, VoteResponse,
};
use crate::common::{connection_string, normalize_address, Error, RaftOptions, Result, METRICS};
use crate::coordinator::peers::PersistedConfig;
use crate::coordinator::storage::RaftStorage;
use crate::coordinator::transport::Transport;
use crate::topology::{Command, MembershipChange, TopologyState};
use futures_util::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;

/// Upper bound on entries carried by one append request
const MAX_ENTRIES_PER_APPEND: usize = 256;

/// Upper bound on entries applied between two lock acquisitions
const MAX_APPLY_BATCH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Snapshot of the node's view, served on `/cluster/status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub is_leader: bool,
    pub leader: Option<String>,
    pub peers: Vec<String>,
    pub role: String,
    pub term: u64,
    pub commit_index: u64,
}

/// Leader-side replication progress for one peer
#[derive(Debug)]
struct PeerProgress {
    connection_string: String,
    next_index: u64,
    match_index: u64,
    in_flight: bool,
}

impl PeerProgress {
    fn new(connection_string: String, next_index: u64) -> Self {
        Self {
            connection_string,
            next_index,
            match_index: 0,
            in_flight: false,
        }
    }
}

struct Pending {
    term: u64,
    tx: oneshot::Sender<Result<u64>>,
}

enum OutboundRpc {
    Append(AppendRequest),
    Snapshot(SnapshotRequest),
}

struct RaftCore {
    role: RaftRole,
    current_term: u64,
    voted_for: Option<String>,
    leader: Option<String>,

    /// Entries after the snapshot, contiguous
    log: Vec<LogEntry>,
    snapshot: Option<Snapshot>,
    commit_index: u64,
    last_applied: u64,

    /// Every member except this node, keyed by normalized address
    peers: BTreeMap<String, PeerProgress>,
    votes: BTreeSet<String>,

    last_contact: Instant,
    election_timeout: Duration,
    last_heartbeat: Option<Instant>,

    pending: BTreeMap<u64, Pending>,
    pending_restore: Option<Snapshot>,
    storage: RaftStorage,
    removed: bool,
    stopped: bool,
}

impl RaftCore {
    fn new(storage: RaftStorage, election_timeout: Duration) -> Self {
        Self {
            role: RaftRole::Follower,
            current_term: 0,
            voted_for: None,
            leader: None,
            log: Vec::new(),
            snapshot: None,
            commit_index: 0,
            last_applied: 0,
            peers: BTreeMap::new(),
            votes: BTreeSet::new(),
            last_contact: Instant::now(),
            election_timeout: randomized(election_timeout),
            last_heartbeat: None,
            pending: BTreeMap::new(),
            pending_restore: None,
            storage,
            removed: false,
            stopped: false,
        }
    }

    fn snapshot_index(&self) -> u64 {
        self.snapshot.as_ref().map_or(0, |s| s.last_index)
    }

    fn snapshot_term(&self) -> u64 {
        self.snapshot.as_ref().map_or(0, |s| s.last_term)
    }

    fn last_log_index(&self) -> u64 {
        self.log.last().map_or(self.snapshot_index(), |e| e.index)
    }

    fn last_log_term(&self) -> u64 {
        self.log.last().map_or(self.snapshot_term(), |e| e.term)
    }

    fn is_log_empty(&self) -> bool {
        self.last_log_index() == 0
    }

    /// A node that has never seen an entry waits for a leader or a self-join
    fn is_promotable(&self) -> bool {
        !self.removed && !self.is_log_empty()
    }

    fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    fn entry_at(&self, index: u64) -> Option<&LogEntry> {
        let base = self.snapshot_index();
        if index <= base {
            return None;
        }
        self.log.get((index - base - 1) as usize)
    }

    /// Term of the entry at `index`; `None` when compacted away or absent
    fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index() {
            return Some(self.snapshot_term());
        }
        self.entry_at(index).map(|e| e.term)
    }

    fn entries_from(&self, start: u64, max: usize) -> Vec<LogEntry> {
        let base = self.snapshot_index();
        if start <= base {
            return Vec::new();
        }
        let offset = (start - base - 1) as usize;
        if offset >= self.log.len() {
            return Vec::new();
        }
        self.log[offset..].iter().take(max).cloned().collect()
    }

    /// First index of the run of `term` entries that ends at `index`
    fn first_index_of_term(&self, term: u64, index: u64) -> u64 {
        let mut first = index;
        while first - 1 > self.snapshot_index() && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        first
    }

    fn append_local(&mut self, command: &Command) -> Result<u64> {
        let index = self.last_log_index() + 1;
        let entry = LogEntry::new(self.current_term, index, command)?;
        self.storage.append(std::slice::from_ref(&entry))?;
        self.log.push(entry);
        Ok(index)
    }

    fn track_peer(&mut self, me: &str, record: &PeerRecord) {
        let name = normalize_address(&record.name);
        if name == me || self.peers.contains_key(&name) {
            return;
        }
        let conn = if record.connection_string.is_empty() {
            connection_string(&name)
        } else {
            record.connection_string.clone()
        };
        let next_index = self.last_log_index() + 1;
        self.peers.insert(name, PeerProgress::new(conn, next_index));
    }

    fn peer_records(&self) -> Vec<PeerRecord> {
        self.peers
            .iter()
            .map(|(name, p)| PeerRecord {
                name: name.clone(),
                connection_string: p.connection_string.clone(),
            })
            .collect()
    }

    fn persist(&self) -> Result<()> {
        self.storage.save_config(&PersistedConfig {
            commit_index: self.commit_index,
            term: self.current_term,
            voted_for: self.voted_for.clone(),
            peers: self.peer_records(),
        })
    }

    fn persist_or_warn(&self) {
        if let Err(e) = self.persist() {
            tracing::warn!("Failed to persist raft configuration: {}", e);
        }
    }

    fn reset_election_timer(&mut self, base: Duration) {
        self.last_contact = Instant::now();
        self.election_timeout = randomized(base);
    }

    fn fail_pending(&mut self, err: impl Fn() -> Error) {
        for (_, pending) in std::mem::take(&mut self.pending) {
            let _ = pending.tx.send(Err(err()));
        }
    }

    fn build_rpc(&self, leader_id: &str, next_index: u64) -> OutboundRpc {
        if next_index <= self.snapshot_index() {
            if let Some(snapshot) = &self.snapshot {
                return OutboundRpc::Snapshot(SnapshotRequest {
                    term: self.current_term,
                    leader_id: leader_id.to_string(),
                    snapshot: snapshot.clone(),
                });
            }
        }
        let prev_log_index = next_index.saturating_sub(1);
        OutboundRpc::Append(AppendRequest {
            term: self.current_term,
            leader_id: leader_id.to_string(),
            prev_log_index,
            prev_log_term: self.term_at(prev_log_index).unwrap_or(0),
            entries: self.entries_from(next_index, MAX_ENTRIES_PER_APPEND),
            leader_commit: self.commit_index,
        })
    }
}

/// Uniform in `[base, 2 * base)`
fn randomized(base: Duration) -> Duration {
    let ms = base.as_millis().max(1) as u64;
    Duration::from_millis(ms + rand::thread_rng().gen_range(0..ms))
}

async fn with_timeout<T>(limit: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or_else(|_| Err(Error::Transport(format!("no response within {:?}", limit))))
}

/// One master's consensus participant
pub struct RaftNode {
    name: String,
    connection_string: String,
    options: RaftOptions,
    transport: Arc<dyn Transport>,
    core: Mutex<RaftCore>,
    topology_tx: watch::Sender<TopologyState>,
    shutdown_tx: watch::Sender<bool>,
    commit_notify: Notify,
    replicate_notify: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RaftNode {
    /// Open (or create) the node's persisted state under `data_dir`.
    ///
    /// Nothing runs until [`RaftNode::start`]; RPC handlers already answer.
    pub fn open(
        name: &str,
        data_dir: impl AsRef<Path>,
        transport: Arc<dyn Transport>,
        options: RaftOptions,
    ) -> Result<Arc<Self>> {
        let name = normalize_address(name);
        let (storage, persisted) = RaftStorage::open(data_dir)?;
        let mut core = RaftCore::new(storage, options.election_timeout);
        let mut state = TopologyState::default();

        if let Some(snapshot) = persisted.snapshot {
            state = snapshot.state;
            core.commit_index = snapshot.last_index;
            core.last_applied = snapshot.last_index;
            for member in &snapshot.members {
                core.track_peer(&name, member);
            }
            core.snapshot = Some(snapshot);
        }
        core.log = persisted.entries;

        if let Some(conf) = persisted.config {
            core.current_term = conf.term;
            core.voted_for = conf.voted_for;
            core.commit_index = core.commit_index.max(conf.commit_index);
            core.peers.clear();
            for peer in &conf.peers {
                core.track_peer(&name, peer);
            }
        }
        core.current_term = core.current_term.max(core.last_log_term());
        core.commit_index = core.commit_index.min(core.last_log_index());

        tracing::info!(
            "Opened raft state for {}: term {}, last index {}, commit {}, {} peers",
            name,
            core.current_term,
            core.last_log_index(),
            core.commit_index,
            core.peers.len()
        );

        let (topology_tx, _) = watch::channel(state);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            connection_string: connection_string(&name),
            name,
            options,
            transport,
            core: Mutex::new(core),
            topology_tx,
            shutdown_tx,
            commit_notify: Notify::new(),
            replicate_notify: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    fn core(&self) -> MutexGuard<'_, RaftCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the timer and apply loops
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if !tasks.is_empty() {
            return;
        }
        let state = *self.topology_tx.borrow();
        tasks.push(tokio::spawn(self.clone().run_timer()));
        tasks.push(tokio::spawn(self.clone().run_apply_loop(state)));
        tracing::info!("Raft node {} started", self.name);
    }

    /// Fail pending proposals with `Cancelled` and join both loops
    pub async fn stop(&self) {
        {
            let mut core = self.core();
            if core.stopped {
                return;
            }
            core.stopped = true;
            core.fail_pending(|| Error::Cancelled);
            core.persist_or_warn();
        }
        self.shutdown_tx.send_replace(true);
        let handles = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("Raft node {} stopped", self.name);
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Normalized address of this node
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn role(&self) -> RaftRole {
        self.core().role
    }

    pub fn is_leader(&self) -> bool {
        self.role() == RaftRole::Leader
    }

    pub fn term(&self) -> u64 {
        self.core().current_term
    }

    pub fn current_leader(&self) -> Option<String> {
        self.core().leader.clone()
    }

    pub fn commit_index(&self) -> u64 {
        self.core().commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.core().last_applied
    }

    pub fn last_log_index(&self) -> u64 {
        self.core().last_log_index()
    }

    pub fn snapshot_index(&self) -> u64 {
        self.core().snapshot_index()
    }

    pub fn is_log_empty(&self) -> bool {
        self.core().is_log_empty()
    }

    /// Other members, normalized and sorted
    pub fn peers(&self) -> Vec<String> {
        self.core().peers.keys().cloned().collect()
    }

    /// All members including this node
    pub fn members(&self) -> Vec<String> {
        let mut members = self.peers();
        members.push(self.name.clone());
        members.sort();
        members
    }

    /// Last applied topology
    pub fn topology(&self) -> TopologyState {
        *self.topology_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TopologyState> {
        self.topology_tx.subscribe()
    }

    pub fn status(&self) -> ClusterStatus {
        let core = self.core();
        ClusterStatus {
            is_leader: core.role == RaftRole::Leader,
            leader: core.leader.clone(),
            peers: core.peers.keys().cloned().collect(),
            role: core.role.to_string(),
            term: core.current_term,
            commit_index: core.commit_index,
        }
    }

    // ------------------------------------------------------------------
    // Membership and proposals
    // ------------------------------------------------------------------

    /// Register a peer locally and persist the roster
    pub fn add_peer(&self, addr: &str) -> Result<()> {
        let mut core = self.core();
        let name = normalize_address(addr);
        if name == self.name || core.peers.contains_key(&name) {
            return Ok(());
        }
        core.track_peer(
            &self.name,
            &PeerRecord {
                name: name.clone(),
                connection_string: connection_string(&name),
            },
        );
        core.persist()?;
        tracing::debug!("Registered peer {}", name);
        Ok(())
    }

    /// Replicate `command`; resolves with its log index once applied
    pub async fn propose(&self, command: Command) -> Result<u64> {
        self.propose_with_timeout(command, self.options.propose_timeout)
            .await
    }

    pub async fn propose_with_timeout(&self, command: Command, limit: Duration) -> Result<u64> {
        let started = Instant::now();
        let (index, rx) = {
            let mut core = self.core();
            if core.stopped {
                return Err(Error::Cancelled);
            }
            if core.role != RaftRole::Leader {
                return Err(Error::NotLeader(core.leader.clone().unwrap_or_default()));
            }
            let index = core.append_local(&command)?;
            let (tx, rx) = oneshot::channel();
            let term = core.current_term;
            core.pending.insert(index, Pending { term, tx });
            self.advance_commit(&mut core);
            (index, rx)
        };
        self.replicate_notify.notify_one();

        let result = match tokio::time::timeout(limit, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                self.core().pending.remove(&index);
                Err(Error::ConsensusTimeout)
            }
        };
        METRICS.record_proposal(started.elapsed(), result.is_ok());
        if let Err(e) = &result {
            tracing::debug!("Proposal {} at index {} failed: {}", command.name(), index, e);
        }
        result
    }

    /// Found a new cluster with this node as its only member.
    ///
    /// Only acts on an empty log: the node promotes itself to leader of
    /// the next term and proposes a `Join` naming itself. Returns `None`
    /// when the log already has entries.
    pub async fn self_join(&self, limit: Duration) -> Result<Option<u64>> {
        {
            let mut core = self.core();
            if core.stopped {
                return Err(Error::Cancelled);
            }
            if !core.is_log_empty() {
                return Ok(None);
            }
            if core.role != RaftRole::Leader {
                core.current_term += 1;
                core.voted_for = Some(self.name.clone());
                core.persist()?;
                METRICS.current_term.set(core.current_term);
                tracing::info!(
                    "{} starting a new cluster in term {}",
                    self.name,
                    core.current_term
                );
                self.promote(&mut core);
            }
        }
        let command = Command::join(self.name.clone(), self.connection_string.clone());
        self.propose_with_timeout(command, limit).await.map(Some)
    }

    /// Ask the cluster reachable through `seed` to add this node.
    ///
    /// Follows one leader hint. Returns the index of the committed `Join`,
    /// or `NotLeader` carrying whatever leader the last answer named.
    pub async fn request_join(&self, seed: &str) -> Result<u64> {
        let req = JoinRequest {
            name: self.name.clone(),
            connection_string: self.connection_string.clone(),
        };
        let mut target = normalize_address(seed);
        for _ in 0..2 {
            let resp = with_timeout(
                self.options.propose_timeout,
                self.transport.join(&connection_string(&target), req.clone()),
            )
            .await?;
            if resp.ok {
                for member in &resp.members {
                    self.add_peer(&member.name)?;
                }
                return Ok(resp.index);
            }
            match resp.leader.map(|l| normalize_address(&l)) {
                Some(leader) if leader != target && leader != self.name => target = leader,
                hint => return Err(Error::NotLeader(hint.unwrap_or_default())),
            }
        }
        Err(Error::NotLeader(target))
    }

    /// Replicate the removal of `addr` from the cluster (leader only)
    pub async fn remove_peer(&self, addr: &str) -> Result<u64> {
        let name = normalize_address(addr);
        {
            let core = self.core();
            if core.role != RaftRole::Leader {
                return Err(Error::NotLeader(core.leader.clone().unwrap_or_default()));
            }
            if name == self.name {
                return Err(Error::InvalidConfig(format!(
                    "{} leads the cluster and cannot remove itself",
                    name
                )));
            }
            if !core.peers.contains_key(&name) {
                return Err(Error::InvalidConfig(format!("{} is not a member", name)));
            }
        }
        self.propose(Command::leave(name)).await
    }

    // ------------------------------------------------------------------
    // Inbound RPCs
    // ------------------------------------------------------------------

    pub fn handle_request_vote(&self, req: VoteRequest) -> VoteResponse {
        let mut core = self.core();
        if core.stopped || req.term < core.current_term {
            return VoteResponse {
                term: core.current_term,
                vote_granted: false,
            };
        }
        if req.term > core.current_term {
            self.step_down(&mut core, req.term, None);
        }

        let candidate = normalize_address(&req.candidate_id);
        let up_to_date =
            (req.last_log_term, req.last_log_index) >= (core.last_log_term(), core.last_log_index());
        let free = core.voted_for.as_deref().map_or(true, |v| v == candidate);

        let mut vote_granted = false;
        if up_to_date && free {
            let previous = core.voted_for.replace(candidate.clone());
            match core.persist() {
                Ok(()) => {
                    vote_granted = true;
                    core.reset_election_timer(self.options.election_timeout);
                    tracing::debug!("Voted for {} in term {}", candidate, req.term);
                }
                Err(e) => {
                    core.voted_for = previous;
                    tracing::error!("Could not persist vote for {}: {}", candidate, e);
                }
            }
        }
        VoteResponse {
            term: core.current_term,
            vote_granted,
        }
    }

    pub fn handle_append_entries(&self, req: AppendRequest) -> AppendResponse {
        let mut core = self.core();
        let reject = |term: u64, conflict_index: u64| AppendResponse {
            term,
            success: false,
            match_index: 0,
            conflict_index,
        };
        if core.stopped || req.term < core.current_term {
            return reject(core.current_term, 0);
        }

        let leader = normalize_address(&req.leader_id);
        if req.term == core.current_term {
            let competing = match core.role {
                RaftRole::Leader => true,
                _ => core.leader.as_deref().is_some_and(|known| known != leader),
            };
            if competing {
                tracing::warn!(
                    "Rejecting append from {}: term {} already has a leader",
                    leader,
                    req.term
                );
                return reject(core.current_term, 0);
            }
        }
        if req.term > core.current_term || core.role != RaftRole::Follower {
            self.step_down(&mut core, req.term, Some(leader.clone()));
        }
        if core.leader.as_deref() != Some(leader.as_str()) {
            tracing::info!("Following {} in term {}", leader, core.current_term);
            core.leader = Some(leader);
        }
        core.reset_election_timer(self.options.election_timeout);

        match self.append_from_leader(&mut core, req) {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!("Failed to append replicated entries: {}", e);
                reject(core.current_term, 0)
            }
        }
    }

    fn append_from_leader(&self, core: &mut RaftCore, req: AppendRequest) -> Result<AppendResponse> {
        let term = core.current_term;
        let last_index = core.last_log_index();
        let snapshot_index = core.snapshot_index();
        let reject = |conflict_index: u64| AppendResponse {
            term,
            success: false,
            match_index: 0,
            conflict_index,
        };

        if req.prev_log_index > last_index {
            return Ok(reject(last_index + 1));
        }
        if req.prev_log_index > snapshot_index {
            let local = core.term_at(req.prev_log_index).unwrap_or(0);
            if local != req.prev_log_term {
                return Ok(reject(core.first_index_of_term(local, req.prev_log_index)));
            }
        }

        let last_new = req.prev_log_index + req.entries.len() as u64;
        let fresh: Vec<LogEntry> = req
            .entries
            .into_iter()
            .filter(|e| e.index > snapshot_index)
            .skip_while(|e| core.term_at(e.index) == Some(e.term))
            .collect();

        if let Some(start) = fresh.first().map(|e| e.index) {
            if start <= core.last_log_index() {
                if start <= core.commit_index {
                    return Err(Error::Raft(format!(
                        "leader conflicts with committed entry {}",
                        start
                    )));
                }
                tracing::info!(
                    "Truncating log from index {} to follow term {}",
                    start,
                    term
                );
                core.log.truncate((start - snapshot_index - 1) as usize);
                core.storage.rewrite_log(&core.log)?;
            }
            core.storage.append(&fresh)?;
            core.log.extend(fresh);
        }

        if req.leader_commit > core.commit_index {
            let commit = req.leader_commit.min(last_new);
            if commit > core.commit_index {
                core.commit_index = commit;
                METRICS.commit_index.set(commit);
                core.persist()?;
                self.commit_notify.notify_one();
            }
        }

        Ok(AppendResponse {
            term,
            success: true,
            match_index: last_new,
            conflict_index: 0,
        })
    }

    pub fn handle_install_snapshot(&self, req: SnapshotRequest) -> SnapshotResponse {
        let mut core = self.core();
        if core.stopped || req.term < core.current_term {
            return SnapshotResponse {
                term: core.current_term,
                last_index: 0,
            };
        }
        let leader = normalize_address(&req.leader_id);
        if req.term > core.current_term || core.role != RaftRole::Follower {
            self.step_down(&mut core, req.term, Some(leader.clone()));
        }
        core.leader = Some(leader);
        core.reset_election_timer(self.options.election_timeout);

        let term = core.current_term;
        match self.restore_snapshot(&mut core, req.snapshot) {
            Ok(last_index) => SnapshotResponse { term, last_index },
            Err(e) => {
                tracing::error!("Failed to install snapshot: {}", e);
                SnapshotResponse {
                    term,
                    last_index: 0,
                }
            }
        }
    }

    fn restore_snapshot(&self, core: &mut RaftCore, snapshot: Snapshot) -> Result<u64> {
        if snapshot.last_index <= core.commit_index {
            return Ok(core.commit_index);
        }
        let last_index = snapshot.last_index;
        if core.term_at(last_index) == Some(snapshot.last_term) {
            core.log.retain(|e| e.index > last_index);
        } else {
            core.log.clear();
        }
        core.storage.save_snapshot(&snapshot)?;
        core.storage.rewrite_log(&core.log)?;

        core.peers.clear();
        for member in &snapshot.members {
            core.track_peer(&self.name, member);
        }
        core.commit_index = last_index;
        core.snapshot = Some(snapshot.clone());
        core.pending_restore = Some(snapshot);
        core.persist()?;

        METRICS.snapshots_installed.inc();
        METRICS.commit_index.set(last_index);
        tracing::info!("Installed snapshot through index {}", last_index);
        self.commit_notify.notify_one();
        Ok(last_index)
    }

    /// Leader: replicate a `Join` for the requester. Others: leader hint.
    pub async fn handle_join(&self, req: JoinRequest) -> JoinResponse {
        let name = normalize_address(&req.name);
        {
            let core = self.core();
            if core.role != RaftRole::Leader {
                return JoinResponse {
                    ok: false,
                    index: 0,
                    leader: core.leader.clone(),
                    members: Vec::new(),
                };
            }
            if name == self.name || core.peers.contains_key(&name) {
                return JoinResponse {
                    ok: true,
                    index: core.commit_index,
                    leader: Some(self.name.clone()),
                    members: self.member_records(&core),
                };
            }
        }

        let conn = if req.connection_string.is_empty() {
            connection_string(&name)
        } else {
            req.connection_string
        };
        match self.propose(Command::join(name.clone(), conn)).await {
            Ok(index) => JoinResponse {
                ok: true,
                index,
                leader: Some(self.name.clone()),
                members: self.member_records(&self.core()),
            },
            Err(e) => {
                tracing::warn!("Join of {} failed: {}", name, e);
                JoinResponse {
                    ok: false,
                    index: 0,
                    leader: self.current_leader(),
                    members: Vec::new(),
                }
            }
        }
    }

    /// Every member including this node, sorted
    fn member_records(&self, core: &RaftCore) -> Vec<PeerRecord> {
        let mut members = core.peer_records();
        members.push(PeerRecord {
            name: self.name.clone(),
            connection_string: self.connection_string.clone(),
        });
        members.sort();
        members
    }

    // ------------------------------------------------------------------
    // Role transitions
    // ------------------------------------------------------------------

    fn step_down(&self, core: &mut RaftCore, term: u64, leader: Option<String>) {
        let was = core.role;
        if term > core.current_term {
            core.current_term = term;
            core.voted_for = None;
            METRICS.current_term.set(term);
            core.persist_or_warn();
        }
        core.role = RaftRole::Follower;
        core.leader = leader;
        core.votes.clear();
        core.reset_election_timer(self.options.election_timeout);
        if was != RaftRole::Follower {
            METRICS.step_downs.inc();
            tracing::info!("{} stepping down from {} in term {}", self.name, was, term);
        }
        let hint = core.leader.clone().unwrap_or_default();
        core.fail_pending(|| Error::NotLeader(hint.clone()));
    }

    fn promote(&self, core: &mut RaftCore) {
        core.role = RaftRole::Leader;
        core.leader = Some(self.name.clone());
        core.votes.clear();
        core.last_heartbeat = None;
        let next_index = core.last_log_index() + 1;
        for peer in core.peers.values_mut() {
            peer.next_index = next_index;
            peer.match_index = 0;
        }
        METRICS.leader_elections_won.inc();
        tracing::info!("{} is leader for term {}", self.name, core.current_term);
    }

    fn become_leader(&self, core: &mut RaftCore) {
        self.promote(core);
        if let Err(e) = core.append_local(&Command::NoOp) {
            tracing::error!("Failed to append leader no-op: {}", e);
        }
        self.advance_commit(core);
        self.replicate_notify.notify_one();
    }

    fn start_election(self: &Arc<Self>, core: &mut RaftCore) {
        core.role = RaftRole::Candidate;
        core.current_term += 1;
        core.voted_for = Some(self.name.clone());
        core.leader = None;
        core.votes = BTreeSet::from([self.name.clone()]);
        core.reset_election_timer(self.options.election_timeout);
        if let Err(e) = core.persist() {
            tracing::error!("Could not persist candidacy: {}", e);
            return;
        }

        let term = core.current_term;
        METRICS.elections_started.inc();
        METRICS.current_term.set(term);
        tracing::info!("{} starting election for term {}", self.name, term);

        if core.votes.len() >= core.quorum() {
            self.become_leader(core);
            return;
        }

        let req = VoteRequest {
            term,
            candidate_id: self.name.clone(),
            last_log_index: core.last_log_index(),
            last_log_term: core.last_log_term(),
        };
        let targets: Vec<(String, String)> = core
            .peers
            .iter()
            .map(|(name, p)| (name.clone(), p.connection_string.clone()))
            .collect();
        tokio::spawn(self.clone().collect_votes(term, req, targets));
    }

    async fn collect_votes(self: Arc<Self>, term: u64, req: VoteRequest, targets: Vec<(String, String)>) {
        let rpc_timeout = self.options.rpc_timeout;
        let mut ballots: FuturesUnordered<_> = targets
            .into_iter()
            .map(|(peer, conn)| {
                let transport = self.transport.clone();
                let req = req.clone();
                async move {
                    let result = with_timeout(rpc_timeout, transport.request_vote(&conn, req)).await;
                    (peer, result)
                }
            })
            .collect();

        while let Some((peer, result)) = ballots.next().await {
            match result {
                Ok(resp) => {
                    if !self.count_vote(&peer, term, resp) {
                        break;
                    }
                }
                Err(e) => {
                    METRICS.rpc_failures.inc();
                    tracing::debug!("Vote request to {} failed: {}", peer, e);
                }
            }
        }
    }

    /// Returns false once the election for `term` is decided or abandoned
    fn count_vote(&self, peer: &str, term: u64, resp: VoteResponse) -> bool {
        let mut core = self.core();
        if core.stopped {
            return false;
        }
        if resp.term > core.current_term {
            self.step_down(&mut core, resp.term, None);
            return false;
        }
        if core.role != RaftRole::Candidate || core.current_term != term {
            return false;
        }
        if resp.vote_granted {
            core.votes.insert(peer.to_string());
            if core.votes.len() >= core.quorum() {
                self.become_leader(&mut core);
                return false;
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------

    async fn run_timer(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let tick = (self.options.heartbeat_interval / 5)
            .clamp(Duration::from_millis(5), Duration::from_millis(50));
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = self.replicate_notify.notified() => {}
                _ = shutdown.changed() => continue,
            }
            self.tick();
        }
    }

    fn tick(self: &Arc<Self>) {
        let mut core = self.core();
        if core.stopped {
            return;
        }
        match core.role {
            RaftRole::Leader => {
                let heartbeat = core
                    .last_heartbeat
                    .map_or(true, |t| t.elapsed() >= self.options.heartbeat_interval);
                self.replicate(&mut core, heartbeat);
            }
            RaftRole::Follower | RaftRole::Candidate => {
                if core.is_promotable() && core.last_contact.elapsed() >= core.election_timeout {
                    self.start_election(&mut core);
                }
            }
        }
    }

    /// Send to every peer that is behind, or to all of them on a heartbeat
    fn replicate(self: &Arc<Self>, core: &mut RaftCore, heartbeat: bool) {
        if heartbeat {
            core.last_heartbeat = Some(Instant::now());
        }
        let last_index = core.last_log_index();
        let names: Vec<String> = core.peers.keys().cloned().collect();
        for name in names {
            let Some(peer) = core.peers.get(&name) else {
                continue;
            };
            if peer.in_flight || (!heartbeat && peer.next_index > last_index) {
                continue;
            }
            let conn = peer.connection_string.clone();
            let rpc = core.build_rpc(&self.name, peer.next_index);
            if let Some(peer) = core.peers.get_mut(&name) {
                peer.in_flight = true;
            }
            tokio::spawn(self.clone().send_rpc(name, conn, rpc));
        }
    }

    async fn send_rpc(self: Arc<Self>, peer: String, conn: String, rpc: OutboundRpc) {
        let rpc_timeout = self.options.rpc_timeout;
        match rpc {
            OutboundRpc::Append(req) => {
                let term = req.term;
                let result = with_timeout(rpc_timeout, self.transport.append_entries(&conn, req)).await;
                self.on_append_result(&peer, term, result);
            }
            OutboundRpc::Snapshot(req) => {
                let term = req.term;
                tracing::info!(
                    "Sending snapshot through index {} to {}",
                    req.snapshot.last_index,
                    peer
                );
                let result =
                    with_timeout(rpc_timeout, self.transport.install_snapshot(&conn, req)).await;
                self.on_snapshot_result(&peer, term, result);
            }
        }
    }

    fn on_append_result(&self, peer: &str, term: u64, result: Result<AppendResponse>) {
        let mut core = self.core();
        if let Some(progress) = core.peers.get_mut(peer) {
            progress.in_flight = false;
        }
        if core.stopped {
            return;
        }
        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                METRICS.rpc_failures.inc();
                tracing::debug!("Append to {} failed: {}", peer, e);
                return;
            }
        };
        if resp.term > core.current_term {
            self.step_down(&mut core, resp.term, None);
            return;
        }
        if core.role != RaftRole::Leader || core.current_term != term {
            return;
        }

        let last_index = core.last_log_index();
        let Some(progress) = core.peers.get_mut(peer) else {
            return;
        };
        if resp.success {
            progress.match_index = progress.match_index.max(resp.match_index);
            progress.next_index = progress.match_index + 1;
            let behind = progress.next_index <= last_index;
            self.advance_commit(&mut core);
            if behind {
                self.replicate_notify.notify_one();
            }
        } else {
            let floor = progress.match_index + 1;
            let ceiling = progress.next_index.saturating_sub(1).max(floor);
            progress.next_index = resp.conflict_index.max(floor).min(ceiling);
            self.replicate_notify.notify_one();
        }
    }

    fn on_snapshot_result(&self, peer: &str, term: u64, result: Result<SnapshotResponse>) {
        let mut core = self.core();
        if let Some(progress) = core.peers.get_mut(peer) {
            progress.in_flight = false;
        }
        if core.stopped {
            return;
        }
        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                METRICS.rpc_failures.inc();
                tracing::warn!("Snapshot install on {} failed: {}", peer, e);
                return;
            }
        };
        if resp.term > core.current_term {
            self.step_down(&mut core, resp.term, None);
            return;
        }
        if core.role != RaftRole::Leader || core.current_term != term || resp.last_index == 0 {
            return;
        }
        if let Some(progress) = core.peers.get_mut(peer) {
            progress.match_index = progress.match_index.max(resp.last_index);
            progress.next_index = progress.match_index + 1;
        }
        self.advance_commit(&mut core);
        self.replicate_notify.notify_one();
    }

    /// Commit the highest index stored on a majority, if it is from this term
    fn advance_commit(&self, core: &mut RaftCore) {
        if core.role != RaftRole::Leader {
            return;
        }
        let mut matched: Vec<u64> = core.peers.values().map(|p| p.match_index).collect();
        matched.push(core.last_log_index());
        matched.sort_unstable_by(|a, b| b.cmp(a));

        let Some(&candidate) = matched.get(core.quorum() - 1) else {
            return;
        };
        if candidate > core.commit_index && core.term_at(candidate) == Some(core.current_term) {
            core.commit_index = candidate;
            METRICS.commit_index.set(candidate);
            core.persist_or_warn();
            self.commit_notify.notify_one();
        }
    }

    // ------------------------------------------------------------------
    // Apply
    // ------------------------------------------------------------------

    async fn run_apply_loop(self: Arc<Self>, mut state: TopologyState) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            loop {
                let batch = self.next_batch(&mut state);
                if batch.is_empty() {
                    break;
                }
                for entry in &batch {
                    self.apply_entry(&mut state, entry);
                }
                self.maybe_snapshot(state);
            }
            tokio::select! {
                _ = self.commit_notify.notified() => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    fn next_batch(&self, state: &mut TopologyState) -> Vec<LogEntry> {
        let mut core = self.core();
        if let Some(snapshot) = core.pending_restore.take() {
            *state = snapshot.state;
            core.last_applied = snapshot.last_index;
            self.topology_tx.send_replace(*state);
        }
        let from = core.last_applied + 1;
        if core.stopped || from > core.commit_index {
            return Vec::new();
        }
        let count = ((core.commit_index - from + 1) as usize).min(MAX_APPLY_BATCH);
        core.entries_from(from, count)
    }

    fn apply_entry(&self, state: &mut TopologyState, entry: &LogEntry) {
        match entry.decode_command() {
            Ok(command) => {
                *state = command.apply(*state);
                if let Some(change) = command.membership() {
                    self.apply_membership(change);
                }
            }
            Err(e) => {
                tracing::error!(
                    "Skipping entry {} ({}): {}",
                    entry.index,
                    entry.command_name,
                    e
                );
            }
        }

        self.topology_tx.send_replace(*state);

        let mut core = self.core();
        if entry.index > core.last_applied {
            core.last_applied = entry.index;
        }
        if let Some(pending) = core.pending.remove(&entry.index) {
            let result = if pending.term == entry.term {
                Ok(entry.index)
            } else {
                Err(Error::NotLeader(core.leader.clone().unwrap_or_default()))
            };
            let _ = pending.tx.send(result);
        }
        METRICS.entries_applied.inc();
    }

    fn apply_membership(&self, change: MembershipChange) {
        let mut core = self.core();
        match change {
            MembershipChange::Add(record) => {
                let name = normalize_address(&record.name);
                if name == self.name || core.peers.contains_key(&name) {
                    return;
                }
                core.track_peer(&self.name, &record);
                tracing::info!("{} joined the cluster", name);
            }
            MembershipChange::Remove(name) => {
                let name = normalize_address(&name);
                if name == self.name {
                    tracing::warn!("{} was removed from the cluster", name);
                    core.removed = true;
                    if core.role != RaftRole::Follower {
                        let term = core.current_term;
                        self.step_down(&mut core, term, None);
                    }
                } else if let Some(progress) = core.peers.remove(&name) {
                    tracing::info!("{} left the cluster", name);
                    if core.role == RaftRole::Leader {
                        self.notify_removed(&core, &name, progress);
                    }
                    self.advance_commit(&mut core);
                } else {
                    return;
                }
            }
        }
        core.persist_or_warn();
    }

    /// Ship the committed `Leave` to a peer the leader no longer tracks,
    /// so it learns of its removal and stops campaigning. Best effort.
    fn notify_removed(&self, core: &RaftCore, name: &str, progress: PeerProgress) {
        let OutboundRpc::Append(req) = core.build_rpc(&self.name, progress.next_index) else {
            return;
        };
        let transport = self.transport.clone();
        let limit = self.options.rpc_timeout;
        let name = name.to_string();
        tokio::spawn(async move {
            let sent = transport.append_entries(&progress.connection_string, req);
            if let Err(e) = with_timeout(limit, sent).await {
                tracing::debug!("Could not tell {} about its removal: {}", name, e);
            }
        });
    }

    fn maybe_snapshot(&self, state: TopologyState) {
        let mut guard = self.core();
        let core = &mut *guard;
        if core.stopped || core.pending_restore.is_some() {
            return;
        }
        let last_applied = core.last_applied;
        if last_applied < core.snapshot_index() + self.options.snapshot_threshold.max(1) {
            return;
        }
        let Some(last_term) = core.term_at(last_applied) else {
            return;
        };

        let members = self.member_records(core);
        let snapshot = Snapshot {
            last_index: last_applied,
            last_term,
            members,
            state,
        };
        if let Err(e) = core.storage.save_snapshot(&snapshot) {
            tracing::error!("Failed to save snapshot at {}: {}", last_applied, e);
            return;
        }
        core.log.retain(|e| e.index > last_applied);
        core.snapshot = Some(snapshot);
        if let Err(e) = core.storage.rewrite_log(&core.log) {
            tracing::error!("Failed to compact log after snapshot: {}", e);
            return;
        }
        METRICS.snapshots_taken.inc();
        tracing::info!("Snapshot taken through index {}", last_applied);
    }
}
