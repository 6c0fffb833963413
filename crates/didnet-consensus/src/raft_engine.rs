// RAFT PROTOCOL NODE
// Leader election and log replication over the transport contract
//
// INVARIANTS:
// 1. current_term never decreases
// 2. At most one vote is granted per term
// 3. commit_index never decreases and never exceeds the log length
// 4. Entries are applied strictly in index order, each exactly once
// 5. A leader only counts replicas toward commit for entries of its own term

use crate::config::RaftConfig;
use crate::engine::{
    status_map, Command, CommitSink, CommittedEntry, ConsensusAlgorithm, ConsensusError,
    ConsensusType, NodeId, Peer, ProtocolHealth, StateSnapshot,
};
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, ConsensusMessage, RequestVoteRequest,
    RequestVoteResponse, RAFT_TOPIC,
};
use crate::transport::Transport;
use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for RaftRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RaftRole::Follower => "Follower",
            RaftRole::Candidate => "Candidate",
            RaftRole::Leader => "Leader",
        };
        f.write_str(name)
    }
}

/// One replicated log slot. `index` is 1-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Command,
}

/// Status fields reported by `RaftNode::status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaftStatus {
    pub id: NodeId,
    pub state: RaftRole,
    pub term: u64,
    pub voted_for: Option<NodeId>,
    pub log_length: usize,
    pub commit_index: u64,
    pub last_applied: u64,
    pub peer_count: usize,
    pub leader_id: Option<NodeId>,
    pub running: bool,
}

type Outbox = Vec<(NodeId, ConsensusMessage)>;

struct RaftState {
    current_term: u64,
    voted_for: Option<NodeId>,
    log: Vec<LogEntry>,
    commit_index: u64,
    last_applied: u64,
    role: RaftRole,
    leader_id: Option<NodeId>,
    peers: HashMap<NodeId, Peer>,
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
    votes: HashSet<NodeId>,
    election_deadline: Instant,
    /// Submission time of entries proposed by this node, for commit latency.
    proposed_at: HashMap<u64, Instant>,
}

impl RaftState {
    fn new(election_timeout: Duration) -> Self {
        RaftState {
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            role: RaftRole::Follower,
            leader_id: None,
            peers: HashMap::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes: HashSet::new(),
            election_deadline: Instant::now() + election_timeout,
            proposed_at: HashMap::new(),
        }
    }

    fn last_log_index(&self) -> u64 {
        self.log.len() as u64
    }

    fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    /// Term of the entry at `index`; index 0 is the empty prefix with term 0.
    fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.log.get(index as usize - 1).map(|e| e.term)
    }

    /// Strict majority of the cluster, this node included.
    fn is_majority(&self, count: usize) -> bool {
        count * 2 > self.peers.len() + 1
    }

    fn truncate_from(&mut self, index: u64) {
        self.log.truncate(index.saturating_sub(1) as usize);
        let len = self.last_log_index();
        self.proposed_at.retain(|i, _| *i <= len);
    }

    fn integrity_ok(&self) -> bool {
        let contiguous = self
            .log
            .iter()
            .enumerate()
            .all(|(i, e)| e.index == i as u64 + 1);
        let terms_ordered = self.log.windows(2).all(|w| w[0].term <= w[1].term);
        contiguous
            && terms_ordered
            && self.last_log_term() <= self.current_term
            && self.commit_index <= self.last_log_index()
            && self.last_applied <= self.commit_index
    }
}

/// Raft leader/log replication node.
pub struct RaftNode {
    id: NodeId,
    config: RaftConfig,
    transport: Arc<dyn Transport>,
    commits: CommitSink,
    state: RwLock<RaftState>,
    scope: Mutex<Option<CancellationToken>>,
    running: AtomicBool,
    me: Weak<RaftNode>,
}

impl RaftNode {
    /// Create a node bound to `transport` and register its message handler.
    pub fn new(
        config: RaftConfig,
        transport: Arc<dyn Transport>,
        commits: CommitSink,
    ) -> Arc<Self> {
        let id = transport.local_id().to_string();
        let initial_timeout = config.random_election_timeout();
        let node = Arc::new_cyclic(|me: &Weak<RaftNode>| RaftNode {
            id,
            config,
            transport,
            commits,
            state: RwLock::new(RaftState::new(initial_timeout)),
            scope: Mutex::new(None),
            running: AtomicBool::new(false),
            me: me.clone(),
        });

        let handler_ref = Arc::downgrade(&node);
        node.transport.register_message_handler(
            RAFT_TOPIC,
            Arc::new(move |from, payload| {
                if let Some(node) = handler_ref.upgrade() {
                    node.handle_payload(from, payload);
                }
            }),
        );
        node
    }

    pub fn role(&self) -> RaftRole {
        self.state.read().role
    }

    pub fn term(&self) -> u64 {
        self.state.read().current_term
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.state.read().leader_id.clone()
    }

    pub fn commit_index(&self) -> u64 {
        self.state.read().commit_index
    }

    /// Copy of the full log, committed or not.
    pub fn log(&self) -> Vec<LogEntry> {
        self.state.read().log.clone()
    }

    pub fn raft_status(&self) -> RaftStatus {
        let state = self.state.read();
        RaftStatus {
            id: self.id.clone(),
            state: state.role,
            term: state.current_term,
            voted_for: state.voted_for.clone(),
            log_length: state.log.len(),
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            peer_count: state.peers.len(),
            leader_id: state.leader_id.clone(),
            running: self.is_running(),
        }
    }

    fn reset_election_deadline(&self, state: &mut RaftState) {
        state.election_deadline = Instant::now() + self.config.random_election_timeout();
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        loop {
            let wait = self.next_wakeup();
            tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep(wait) => self.tick(),
            }
        }
        debug!("{}: raft loop exited", self.id);
    }

    fn next_wakeup(&self) -> Duration {
        let state = self.state.read();
        match state.role {
            RaftRole::Leader => self.config.heartbeat_interval,
            _ => state
                .election_deadline
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(1)),
        }
    }

    fn tick(&self) {
        let outbox = {
            let mut state = self.state.write();
            let role = state.role;
            match role {
                RaftRole::Leader => self.replicate_all(&state),
                _ if Instant::now() >= state.election_deadline => self.begin_election(&mut state),
                _ => Vec::new(),
            }
        };
        self.dispatch(outbox);
    }

    fn begin_election(&self, state: &mut RaftState) -> Outbox {
        state.current_term += 1;
        state.role = RaftRole::Candidate;
        state.voted_for = Some(self.id.clone());
        state.leader_id = None;
        state.votes.clear();
        state.votes.insert(self.id.clone());
        self.reset_election_deadline(state);
        info!(
            "{}: starting election for term {} ({} peers)",
            self.id,
            state.current_term,
            state.peers.len()
        );

        if state.is_majority(state.votes.len()) {
            return self.become_leader(state);
        }

        let request = RequestVoteRequest {
            term: state.current_term,
            candidate_id: self.id.clone(),
            last_log_index: state.last_log_index(),
            last_log_term: state.last_log_term(),
        };
        state
            .peers
            .keys()
            .map(|peer| (peer.clone(), ConsensusMessage::RequestVote(request.clone())))
            .collect()
    }

    fn become_leader(&self, state: &mut RaftState) -> Outbox {
        state.role = RaftRole::Leader;
        state.leader_id = Some(self.id.clone());
        let next = state.last_log_index() + 1;
        let peers: Vec<NodeId> = state.peers.keys().cloned().collect();
        state.next_index = peers.iter().map(|p| (p.clone(), next)).collect();
        state.match_index = peers.into_iter().map(|p| (p, 0)).collect();
        info!("{}: became Leader for term {}", self.id, state.current_term);
        self.replicate_all(state)
    }

    /// Adopt a newer term and revert to Follower.
    fn observe_term(&self, state: &mut RaftState, term: u64) {
        if term > state.current_term {
            if state.role != RaftRole::Follower {
                info!(
                    "{}: saw term {} (was {} in term {}), reverting to Follower",
                    self.id, term, state.role, state.current_term
                );
            }
            state.current_term = term;
            state.voted_for = None;
            state.role = RaftRole::Follower;
            state.leader_id = None;
            state.votes.clear();
        }
    }

    fn build_append(&self, state: &RaftState, peer: &str) -> ConsensusMessage {
        let next = state
            .next_index
            .get(peer)
            .copied()
            .unwrap_or(state.last_log_index() + 1)
            .clamp(1, state.last_log_index() + 1);
        let prev_log_index = next - 1;
        let entries = state
            .log
            .iter()
            .skip(prev_log_index as usize)
            .take(self.config.max_entries_per_rpc)
            .cloned()
            .collect();
        ConsensusMessage::AppendEntries(AppendEntriesRequest {
            term: state.current_term,
            leader_id: self.id.clone(),
            prev_log_index,
            prev_log_term: state.term_at(prev_log_index).unwrap_or(0),
            entries,
            leader_commit: state.commit_index,
        })
    }

    fn replicate_all(&self, state: &RaftState) -> Outbox {
        state
            .peers
            .keys()
            .map(|peer| (peer.clone(), self.build_append(state, peer)))
            .collect()
    }

    /// Commit the highest current-term index replicated on a majority.
    fn advance_commit(&self, state: &mut RaftState) {
        let mut candidate = state.last_log_index();
        while candidate > state.commit_index {
            if state.term_at(candidate) != Some(state.current_term) {
                break;
            }
            let replicas = 1 + state
                .match_index
                .iter()
                .filter(|(peer, matched)| state.peers.contains_key(*peer) && **matched >= candidate)
                .count();
            if state.is_majority(replicas) {
                debug!("{}: commit index {} -> {}", self.id, state.commit_index, candidate);
                state.commit_index = candidate;
                break;
            }
            candidate -= 1;
        }
    }

    fn apply_committed(&self, state: &mut RaftState) -> Vec<CommittedEntry> {
        let mut applied = Vec::new();
        while state.last_applied < state.commit_index {
            let index = state.last_applied + 1;
            let latency = state.proposed_at.remove(&index).map(|at| at.elapsed());
            match state.log.get(index as usize - 1) {
                Some(entry) => applied.push(CommittedEntry {
                    consensus: ConsensusType::Raft,
                    index,
                    term: entry.term,
                    command: entry.command.clone(),
                    latency,
                }),
                None => {
                    error!("{}: commit index {} beyond log end", self.id, state.commit_index);
                    break;
                }
            }
            state.last_applied = index;
        }
        applied
    }

    fn publish(&self, committed: Vec<CommittedEntry>) {
        for entry in committed {
            debug!("{}: applied entry {} (term {})", self.id, entry.index, entry.term);
            // no subscribers is fine
            let _ = self.commits.send(entry);
        }
    }

    fn handle_payload(&self, from: NodeId, payload: Vec<u8>) {
        if !self.is_running() {
            debug!("{}: stopped, ignoring raft message from {}", self.id, from);
            return;
        }
        let message = match ConsensusMessage::decode(&payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("{}: dropping malformed raft message from {}: {}", self.id, from, e);
                return;
            }
        };

        let (outbox, committed) = {
            let mut state = self.state.write();
            let outbox = match message {
                ConsensusMessage::AppendEntries(req) => {
                    self.on_append_entries(&mut state, &from, req)
                }
                ConsensusMessage::AppendEntriesResponse(resp) => {
                    self.on_append_response(&mut state, &from, resp)
                }
                ConsensusMessage::RequestVote(req) => self.on_request_vote(&mut state, &from, req),
                ConsensusMessage::RequestVoteResponse(resp) => {
                    self.on_vote_response(&mut state, &from, resp)
                }
                other => {
                    warn!("{}: unexpected {} on raft topic from {}", self.id, other.kind(), from);
                    Vec::new()
                }
            };
            (outbox, self.apply_committed(&mut state))
        };
        self.publish(committed);
        self.dispatch(outbox);
    }

    fn on_append_entries(
        &self,
        state: &mut RaftState,
        from: &str,
        req: AppendEntriesRequest,
    ) -> Outbox {
        let reject = |state: &RaftState| {
            vec![(
                from.to_string(),
                ConsensusMessage::AppendEntriesResponse(AppendEntriesResponse {
                    term: state.current_term,
                    success: false,
                    match_index: 0,
                    last_log_index: state.last_log_index(),
                }),
            )]
        };

        if req.term < state.current_term {
            debug!(
                "{}: rejecting append from {} with stale term {} < {}",
                self.id, from, req.term, state.current_term
            );
            return reject(&*state);
        }
        self.observe_term(state, req.term);
        if state.role != RaftRole::Follower {
            info!(
                "{}: stepping down from {}, {} is Leader for term {}",
                self.id, state.role, req.leader_id, req.term
            );
            state.role = RaftRole::Follower;
            state.votes.clear();
        }
        if state.leader_id.as_deref() != Some(req.leader_id.as_str()) {
            info!("{}: following Leader {} in term {}", self.id, req.leader_id, req.term);
            state.leader_id = Some(req.leader_id.clone());
        }
        self.reset_election_deadline(state);

        if state.term_at(req.prev_log_index) != Some(req.prev_log_term) {
            debug!(
                "{}: log mismatch at prev index {} (term {}), have {} entries",
                self.id,
                req.prev_log_index,
                req.prev_log_term,
                state.log.len()
            );
            return reject(&*state);
        }

        let contiguous = req
            .entries
            .iter()
            .enumerate()
            .all(|(i, e)| e.index == req.prev_log_index + i as u64 + 1);
        if !contiguous {
            warn!("{}: append from {} carries non-contiguous entries", self.id, from);
            return reject(&*state);
        }

        let last_new = req.prev_log_index + req.entries.len() as u64;
        for entry in req.entries {
            match state.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if entry.index <= state.commit_index {
                        error!(
                            "{}: leader {} conflicts with committed entry {}",
                            self.id, from, entry.index
                        );
                        return reject(&*state);
                    }
                    debug!("{}: truncating conflicting suffix from index {}", self.id, entry.index);
                    state.truncate_from(entry.index);
                    state.log.push(entry);
                }
                None => state.log.push(entry),
            }
        }

        if req.leader_commit > state.commit_index {
            let commit = req.leader_commit.min(last_new);
            if commit > state.commit_index {
                state.commit_index = commit;
            }
        }

        vec![(
            from.to_string(),
            ConsensusMessage::AppendEntriesResponse(AppendEntriesResponse {
                term: state.current_term,
                success: true,
                match_index: last_new,
                last_log_index: state.last_log_index(),
            }),
        )]
    }

    fn on_append_response(
        &self,
        state: &mut RaftState,
        from: &str,
        resp: AppendEntriesResponse,
    ) -> Outbox {
        if resp.term > state.current_term {
            self.observe_term(state, resp.term);
            self.reset_election_deadline(state);
            return Vec::new();
        }
        if state.role != RaftRole::Leader
            || resp.term < state.current_term
            || !state.peers.contains_key(from)
        {
            return Vec::new();
        }

        if resp.success {
            let last = state.last_log_index();
            let matched = state.match_index.entry(from.to_string()).or_insert(0);
            *matched = (*matched).max(resp.match_index);
            let next = state.next_index.entry(from.to_string()).or_insert(1);
            *next = (*next).max(resp.match_index + 1);
            let behind = *next <= last;
            self.advance_commit(state);
            if behind {
                return vec![(from.to_string(), self.build_append(state, from))];
            }
            Vec::new()
        } else {
            let next = state.next_index.get(from).copied().unwrap_or(1);
            let retry = next
                .saturating_sub(1)
                .min(resp.last_log_index + 1)
                .max(1);
            state.next_index.insert(from.to_string(), retry);
            debug!("{}: {} rejected append, retrying from index {}", self.id, from, retry);
            vec![(from.to_string(), self.build_append(state, from))]
        }
    }

    fn on_request_vote(
        &self,
        state: &mut RaftState,
        from: &str,
        req: RequestVoteRequest,
    ) -> Outbox {
        if req.term >= state.current_term {
            self.observe_term(state, req.term);
        }
        let up_to_date =
            (req.last_log_term, req.last_log_index)
                >= (state.last_log_term(), state.last_log_index());
        let free = state
            .voted_for
            .as_deref()
            .map_or(true, |voted| voted == req.candidate_id);
        let granted = req.term == state.current_term && up_to_date && free;

        if granted {
            state.voted_for = Some(req.candidate_id.clone());
            self.reset_election_deadline(state);
            info!("{}: voted for {} in term {}", self.id, req.candidate_id, req.term);
        } else {
            debug!(
                "{}: refused vote to {} for term {} (up_to_date={}, voted_for={:?})",
                self.id, req.candidate_id, req.term, up_to_date, state.voted_for
            );
        }

        vec![(
            from.to_string(),
            ConsensusMessage::RequestVoteResponse(RequestVoteResponse {
                term: state.current_term,
                vote_granted: granted,
            }),
        )]
    }

    fn on_vote_response(
        &self,
        state: &mut RaftState,
        from: &str,
        resp: RequestVoteResponse,
    ) -> Outbox {
        if resp.term > state.current_term {
            self.observe_term(state, resp.term);
            self.reset_election_deadline(state);
            return Vec::new();
        }
        if state.role != RaftRole::Candidate
            || resp.term != state.current_term
            || !resp.vote_granted
        {
            return Vec::new();
        }
        if !state.peers.contains_key(from) {
            debug!("{}: ignoring vote from unknown node {}", self.id, from);
            return Vec::new();
        }
        state.votes.insert(from.to_string());
        if state.is_majority(state.votes.len()) {
            return self.become_leader(state);
        }
        Vec::new()
    }

    /// Fan out queued messages on a background task.
    fn dispatch(&self, outbox: Outbox) {
        if outbox.is_empty() {
            return;
        }
        if let Some(node) = self.me.upgrade() {
            tokio::spawn(async move { node.send_all(outbox).await });
        }
    }

    async fn send_all(&self, outbox: Outbox) {
        let sends = outbox.into_iter().map(|(peer, message)| async move {
            let result = self.send_one(&peer, &message).await;
            (peer, message, result)
        });
        for (peer, message, result) in join_all(sends).await {
            match result {
                Ok(()) => self.mark_peer(&peer, true),
                Err(e) => {
                    debug!("{}: {} to {} failed: {}", self.id, message.kind(), peer, e);
                    self.on_send_failure(&peer, &message);
                }
            }
        }
    }

    async fn send_one(&self, peer: &str, message: &ConsensusMessage) -> Result<(), ConsensusError> {
        let payload = message.encode()?;
        match timeout(
            self.config.rpc_timeout,
            self.transport.send_message(peer, RAFT_TOPIC, payload),
        )
        .await
        {
            Ok(result) => result.map_err(ConsensusError::from),
            Err(_) => Err(ConsensusError::Timeout(self.config.rpc_timeout)),
        }
    }

    fn mark_peer(&self, peer_id: &str, active: bool) {
        let mut state = self.state.write();
        if let Some(peer) = state.peers.get_mut(peer_id) {
            if peer.active != active {
                if active {
                    info!("{}: peer {} reachable again", self.id, peer_id);
                } else {
                    warn!("{}: peer {} unreachable", self.id, peer_id);
                }
                peer.active = active;
            }
        }
    }

    fn on_send_failure(&self, peer_id: &str, message: &ConsensusMessage) {
        self.mark_peer(peer_id, false);
        if let ConsensusMessage::AppendEntries(req) = message {
            let mut state = self.state.write();
            if state.role == RaftRole::Leader && req.term == state.current_term {
                if let Some(next) = state.next_index.get_mut(peer_id) {
                    *next = next.saturating_sub(1).max(1);
                }
            }
        }
    }
}

#[async_trait]
impl ConsensusAlgorithm for RaftNode {
    fn consensus_type(&self) -> ConsensusType {
        ConsensusType::Raft
    }

    fn node_id(&self) -> &str {
        &self.id
    }

    async fn start(&self, scope: CancellationToken) -> Result<(), ConsensusError> {
        let token = {
            let mut slot = self.scope.lock();
            if self.running.load(Ordering::SeqCst) {
                debug!("{}: raft already running", self.id);
                return Ok(());
            }
            let token = scope.child_token();
            *slot = Some(token.clone());
            self.running.store(true, Ordering::SeqCst);
            token
        };

        self.refresh_peers();
        {
            let mut state = self.state.write();
            state.role = RaftRole::Follower;
            state.votes.clear();
            self.reset_election_deadline(&mut state);
        }

        let node = self.me.upgrade().ok_or(ConsensusError::NotRunning(ConsensusType::Raft))?;
        tokio::spawn(node.run(token));
        info!("{}: Raft node started in term {}", self.id, self.term());
        Ok(())
    }

    async fn stop(&self) -> Result<(), ConsensusError> {
        let token = self.scope.lock().take();
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(token) = token {
            token.cancel();
        }
        let mut state = self.state.write();
        if state.role == RaftRole::Leader {
            info!("{}: stepping down as Leader of term {}", self.id, state.current_term);
        }
        state.role = RaftRole::Follower;
        state.leader_id = None;
        state.votes.clear();
        info!("{}: Raft node stopped", self.id);
        Ok(())
    }

    async fn submit(&self, proposal: Command) -> Result<(), ConsensusError> {
        if !self.is_running() {
            return Err(ConsensusError::NotRunning(ConsensusType::Raft));
        }
        let (outbox, committed) = {
            let mut state = self.state.write();
            if state.role != RaftRole::Leader {
                return Err(ConsensusError::NotLeader {
                    node: self.id.clone(),
                    leader: state.leader_id.clone(),
                });
            }
            let index = state.last_log_index() + 1;
            let term = state.current_term;
            state.log.push(LogEntry {
                term,
                index,
                command: proposal,
            });
            state.proposed_at.insert(index, Instant::now());
            debug!("{}: appended entry {} in term {}", self.id, index, term);

            self.advance_commit(&mut state);
            let committed = self.apply_committed(&mut state);
            (self.replicate_all(&state), committed)
        };
        self.publish(committed);
        self.dispatch(outbox);
        Ok(())
    }

    fn status(&self) -> serde_json::Map<String, serde_json::Value> {
        status_map(&self.raft_status())
    }

    fn nodes(&self) -> Vec<NodeId> {
        let state = self.state.read();
        let mut nodes: Vec<NodeId> = state.peers.keys().cloned().collect();
        nodes.push(self.id.clone());
        nodes.sort();
        nodes
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_leader(&self) -> bool {
        self.is_running() && self.state.read().role == RaftRole::Leader
    }

    fn add_peer(&self, peer: Peer) -> Result<(), ConsensusError> {
        let mut state = self.state.write();
        if peer.id == self.id || state.peers.contains_key(&peer.id) {
            return Err(ConsensusError::DuplicatePeer(peer.id));
        }
        if state.role == RaftRole::Leader {
            let next = state.last_log_index() + 1;
            state.next_index.insert(peer.id.clone(), next);
            state.match_index.insert(peer.id.clone(), 0);
        }
        info!("{}: added raft peer {} at {}", self.id, peer.id, peer.address);
        state.peers.insert(peer.id.clone(), peer);
        Ok(())
    }

    fn remove_peer(&self, peer_id: &str) -> Result<(), ConsensusError> {
        let committed = {
            let mut state = self.state.write();
            if state.peers.remove(peer_id).is_none() {
                return Err(ConsensusError::UnknownPeer(peer_id.to_string()));
            }
            state.next_index.remove(peer_id);
            state.match_index.remove(peer_id);
            state.votes.remove(peer_id);
            info!("{}: removed raft peer {}", self.id, peer_id);
            if state.role == RaftRole::Leader {
                self.advance_commit(&mut state);
            }
            self.apply_committed(&mut state)
        };
        self.publish(committed);
        Ok(())
    }

    fn health(&self) -> ProtocolHealth {
        let state = self.state.read();
        ProtocolHealth {
            running: self.is_running(),
            has_leader: state.leader_id.is_some(),
            active_peers: state.peers.values().filter(|p| p.active).count(),
            total_peers: state.peers.len(),
            integrity_ok: state.integrity_ok(),
            pending: (state.last_log_index() - state.commit_index.min(state.last_log_index()))
                as usize,
        }
    }

    fn snapshot(&self) -> StateSnapshot {
        let state = self.state.read();
        let committed = state
            .log
            .iter()
            .take(state.commit_index as usize)
            .map(|e| e.command.clone())
            .collect();
        StateSnapshot::new(ConsensusType::Raft, committed)
    }

    fn restore(&self, snapshot: &StateSnapshot) -> Result<usize, ConsensusError> {
        snapshot.verify()?;
        let mut state = self.state.write();
        let committed = state.commit_index as usize;

        let overlap = committed.min(snapshot.len());
        if let Some(i) = (0..overlap).find(|&i| state.log[i].command != snapshot.committed[i]) {
            return Err(ConsensusError::InvalidSnapshot(format!(
                "snapshot from {} diverges from committed log at index {}",
                snapshot.source,
                i + 1
            )));
        }
        if snapshot.len() <= committed {
            return Ok(0);
        }

        state.truncate_from(committed as u64 + 1);
        let term = state.term_at(committed as u64).unwrap_or(0);
        for (offset, command) in snapshot.committed[committed..].iter().enumerate() {
            state.log.push(LogEntry {
                term,
                index: (committed + offset + 1) as u64,
                command: command.clone(),
            });
        }
        let imported = snapshot.len() - committed;
        state.commit_index = snapshot.len() as u64;
        state.last_applied = state.commit_index;
        info!(
            "{}: imported {} committed entries from {} snapshot",
            self.id, imported, snapshot.source
        );
        Ok(imported)
    }

    fn refresh_peers(&self) -> usize {
        let known = self.transport.peers();
        let mut state = self.state.write();
        let mut added = 0;
        for info in known.into_values() {
            match state.peers.get_mut(&info.id) {
                Some(peer) => peer.active = info.connected,
                None => {
                    if state.role == RaftRole::Leader {
                        let next = state.last_log_index() + 1;
                        state.next_index.insert(info.id.clone(), next);
                        state.match_index.insert(info.id.clone(), 0);
                    }
                    state.peers.insert(
                        info.id.clone(),
                        Peer {
                            id: info.id,
                            address: info.address,
                            active: info.connected,
                        },
                    );
                    added += 1;
                }
            }
        }
        if added > 0 {
            info!("{}: discovered {} raft peers", self.id, added);
        }
        added
    }

    async fn trigger_election(&self) -> Result<(), ConsensusError> {
        if !self.is_running() {
            return Err(ConsensusError::NotRunning(ConsensusType::Raft));
        }
        let outbox = {
            let mut state = self.state.write();
            if state.role == RaftRole::Leader {
                return Ok(());
            }
            self.begin_election(&mut state)
        };
        self.dispatch(outbox);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalNetwork;
    use serde_json::json;
    use tokio::sync::broadcast;

    fn fast_config() -> RaftConfig {
        RaftConfig {
            election_timeout_min: Duration::from_millis(30),
            election_timeout_max: Duration::from_millis(60),
            heartbeat_interval: Duration::from_millis(10),
            ..RaftConfig::default()
        }
    }

    fn lone_node(id: &str) -> (Arc<RaftNode>, broadcast::Receiver<CommittedEntry>) {
        let network = LocalNetwork::new();
        let (commits, rx) = broadcast::channel(64);
        (RaftNode::new(fast_config(), network.join(id), commits), rx)
    }

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry {
            term,
            index,
            command: json!({ "n": index }),
        }
    }

    fn append(
        term: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> AppendEntriesRequest {
        AppendEntriesRequest {
            term,
            leader_id: "leader".to_string(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        }
    }

    fn response_of(outbox: &Outbox) -> &AppendEntriesResponse {
        match &outbox[0].1 {
            ConsensusMessage::AppendEntriesResponse(resp) => resp,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_single_node_elects_itself_and_commits() {
        let (node, mut rx) = lone_node("solo");
        node.start(CancellationToken::new()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while !node.is_leader() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        node.submit(json!({"op": "create"})).await.unwrap();
        let committed = rx.recv().await.unwrap();
        assert_eq!(committed.index, 1);
        assert_eq!(committed.command, json!({"op": "create"}));
        assert!(committed.latency.is_some());
        assert_eq!(node.raft_status().log_length, 1);
        assert_eq!(node.commit_index(), 1);

        node.stop().await.unwrap();
        assert!(!node.is_leader());
        assert_eq!(node.role(), RaftRole::Follower);
    }

    #[tokio::test]
    async fn test_submit_requires_running_leader() {
        let (node, _rx) = lone_node("n1");
        assert_eq!(
            node.submit(json!(1)).await,
            Err(ConsensusError::NotRunning(ConsensusType::Raft))
        );

        node.running.store(true, Ordering::SeqCst);
        let err = node.submit(json!(1)).await.unwrap_err();
        assert!(err.to_string().contains("Leader"));
    }

    #[tokio::test]
    async fn test_append_entries_rejects_stale_term_and_mismatch() {
        let (node, _rx) = lone_node("f1");
        let mut state = node.state.write();
        state.current_term = 3;

        let out = node.on_append_entries(&mut state, "leader", append(2, 0, 0, vec![], 0));
        assert!(!response_of(&out).success);
        assert_eq!(response_of(&out).term, 3);

        let out = node.on_append_entries(&mut state, "leader", append(3, 4, 3, vec![], 0));
        assert!(!response_of(&out).success);
        assert_eq!(state.leader_id.as_deref(), Some("leader"));
    }

    #[tokio::test]
    async fn test_append_entries_truncates_conflicting_suffix() {
        let (node, _rx) = lone_node("f1");
        let mut state = node.state.write();
        state.current_term = 1;
        state.log = vec![entry(1, 1), entry(1, 2), entry(1, 3)];
        state.commit_index = 1;

        let out =
            node.on_append_entries(&mut state, "leader", append(2, 1, 1, vec![entry(2, 2)], 2));
        let resp = response_of(&out);
        assert!(resp.success);
        assert_eq!(resp.match_index, 2);
        assert_eq!(state.log.len(), 2);
        assert_eq!(state.log[1].term, 2);
        assert_eq!(state.commit_index, 2);
        assert_eq!(state.current_term, 2);
    }

    #[tokio::test]
    async fn test_commit_index_never_decreases() {
        let (node, _rx) = lone_node("f1");
        let mut state = node.state.write();
        state.current_term = 1;
        state.log = vec![entry(1, 1), entry(1, 2), entry(1, 3)];
        state.commit_index = 3;

        // heartbeat whose prefix ends before our commit point
        let out = node.on_append_entries(&mut state, "leader", append(1, 1, 1, vec![], 5));
        assert!(response_of(&out).success);
        assert_eq!(state.commit_index, 3);
    }

    #[tokio::test]
    async fn test_one_vote_per_term_for_up_to_date_candidates() {
        let (node, _rx) = lone_node("voter");
        let mut state = node.state.write();
        state.log = vec![entry(1, 1), entry(2, 2)];
        state.current_term = 2;

        let vote = |candidate: &str, term, last_log_index, last_log_term| RequestVoteRequest {
            term,
            candidate_id: candidate.to_string(),
            last_log_index,
            last_log_term,
        };
        let granted = |out: Outbox| match &out[0].1 {
            ConsensusMessage::RequestVoteResponse(resp) => resp.vote_granted,
            other => panic!("unexpected {:?}", other),
        };

        // stale log
        assert!(!granted(node.on_request_vote(&mut state, "a", vote("a", 3, 5, 1))));
        assert!(granted(node.on_request_vote(&mut state, "b", vote("b", 3, 2, 2))));
        // already voted in term 3
        assert!(!granted(node.on_request_vote(&mut state, "c", vote("c", 3, 9, 3))));
        // same candidate may ask again
        assert!(granted(node.on_request_vote(&mut state, "b", vote("b", 3, 2, 2))));
        assert_eq!(state.voted_for.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_leader_commits_only_with_majority_of_current_term() {
        let (node, _rx) = lone_node("leader");
        node.add_peer(Peer::new("p1", "local://p1")).unwrap();
        node.add_peer(Peer::new("p2", "local://p2")).unwrap();
        let mut state = node.state.write();
        state.current_term = 2;
        state.log = vec![entry(1, 1), entry(2, 2)];
        node.become_leader(&mut state);

        let success = |match_index| AppendEntriesResponse {
            term: 2,
            success: true,
            match_index,
            last_log_index: match_index,
        };
        node.on_append_response(&mut state, "p1", success(1));
        // entry 1 is from an older term; nothing commits on its own
        assert_eq!(state.commit_index, 0);
        node.on_append_response(&mut state, "p1", success(2));
        assert_eq!(state.commit_index, 2);
        assert_eq!(node.apply_committed(&mut state).len(), 2);
    }

    #[tokio::test]
    async fn test_restore_imports_tail_and_rejects_divergence() {
        let (node, _rx) = lone_node("n1");
        {
            let mut state = node.state.write();
            state.current_term = 1;
            state.log = vec![entry(1, 1), entry(1, 2)];
            state.commit_index = 1;
            state.last_applied = 1;
        }

        let snapshot = StateSnapshot::new(
            ConsensusType::Poa,
            vec![json!({"n": 1}), json!({"n": 7}), json!({"n": 8})],
        );
        assert_eq!(node.restore(&snapshot).unwrap(), 2);
        assert_eq!(node.commit_index(), 3);
        assert_eq!(node.snapshot().committed, snapshot.committed);
        assert!(node.health().integrity_ok);

        let divergent = StateSnapshot::new(ConsensusType::Poa, vec![json!({"n": 99})]);
        assert!(matches!(node.restore(&divergent), Err(ConsensusError::InvalidSnapshot(_))));
    }

    #[tokio::test]
    async fn test_integrity_detects_gaps() {
        let (node, _rx) = lone_node("n1");
        node.state.write().log = vec![entry(0, 1), entry(0, 3)];
        assert!(!node.health().integrity_ok);
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_peers() {
        let (node, _rx) = lone_node("n1");
        node.add_peer(Peer::new("n2", "local://n2")).unwrap();
        assert_eq!(
            node.add_peer(Peer::new("n2", "local://n2")),
            Err(ConsensusError::DuplicatePeer("n2".to_string()))
        );
        assert!(node.add_peer(Peer::new("n1", "local://n1")).is_err());
        assert_eq!(node.nodes(), vec!["n1".to_string(), "n2".to_string()]);
        assert_eq!(
            node.remove_peer("n9"),
            Err(ConsensusError::UnknownPeer("n9".to_string()))
        );
        node.remove_peer("n2").unwrap();
        assert_eq!(node.raft_status().peer_count, 0);
    }
}
