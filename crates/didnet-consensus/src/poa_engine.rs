// PROOF-OF-AUTHORITY NODE
// Round-robin block production sealed by a fixed authority set
//
// INVARIANTS:
// 1. Authorities are kept sorted so every node derives the same proposer order
// 2. An authority casts at most one vote per proposal and one approval per height
// 3. A block joins the chain only if it links to the current head by hash
// 4. The authority set is never empty

use crate::config::PoaConfig;
use crate::engine::{
    status_map, Command, CommitSink, CommittedEntry, ConsensusAlgorithm, ConsensusError,
    ConsensusType, NodeId, Peer, ProtocolHealth, StateSnapshot,
};
use crate::message::{ConsensusMessage, PoaProposalMessage, PoaVoteMessage, POA_TOPIC};
use crate::transport::Transport;
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const GENESIS_PROPOSER: &str = "genesis";
const MIGRATION_PROPOSER: &str = "migration";

/// A sealed block in the authority chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoaBlock {
    pub height: u64,
    pub hash: String,
    pub prev_hash: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub proposer: NodeId,
    pub data: Option<Command>,
    pub signature: String,
}

impl PoaBlock {
    /// Deterministic height-0 block shared by every node.
    pub fn genesis() -> Self {
        Self::build(0, "0".repeat(64), 0, GENESIS_PROPOSER.to_string(), None)
    }

    /// Build and seal a block on top of `prev_hash`.
    pub fn build(
        height: u64,
        prev_hash: String,
        timestamp: i64,
        proposer: NodeId,
        data: Option<Command>,
    ) -> Self {
        let mut block = PoaBlock {
            height,
            hash: String::new(),
            prev_hash,
            timestamp,
            proposer,
            data,
            signature: String::new(),
        };
        block.hash = block.compute_hash();
        block.signature = Self::seal(&block.proposer, &block.hash);
        block
    }

    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.height.to_le_bytes());
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update(self.proposer.as_bytes());
        if let Some(data) = &self.data {
            hasher.update(data.to_string().as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Seal binding the proposer to the block hash. Real signatures are
    /// produced by the node's crypto layer before blocks leave the process.
    pub fn seal(proposer: &str, hash: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(proposer.as_bytes());
        hasher.update(hash.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// 64 lowercase hex characters, the shape `compute_hash` produces.
    pub fn is_hash_well_formed(hash: &str) -> bool {
        hash.len() == 64 && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }

    /// Hash recomputes and the seal matches the proposer.
    pub fn verify(&self) -> bool {
        self.hash == self.compute_hash() && self.signature == Self::seal(&self.proposer, &self.hash)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalStatus {
    Pending,
    Committed,
    Rejected,
}

/// A proposed block and the authority votes collected for it.
#[derive(Debug, Clone)]
pub struct PoaProposal {
    pub block: PoaBlock,
    pub status: ProposalStatus,
    pub votes: BTreeMap<NodeId, bool>,
    pub created_at: Instant,
    /// Set on the proposing node only.
    submitted_at: Option<Instant>,
}

impl PoaProposal {
    pub fn new(block: PoaBlock) -> Self {
        PoaProposal {
            block,
            status: ProposalStatus::Pending,
            votes: BTreeMap::new(),
            created_at: Instant::now(),
            submitted_at: None,
        }
    }

    /// Record a vote; returns false if `voter` already voted.
    pub fn record_vote(&mut self, voter: &str, approve: bool) -> bool {
        if self.votes.contains_key(voter) {
            return false;
        }
        self.votes.insert(voter.to_string(), approve);
        true
    }

    /// Decide the proposal against the current authority set.
    pub fn tally(&self, authorities: &[NodeId], threshold: f64) -> ProposalStatus {
        let mut approved = 0;
        let mut voted = 0;
        for (voter, approve) in &self.votes {
            if authorities.contains(voter) {
                voted += 1;
                if *approve {
                    approved += 1;
                }
            }
        }
        if meets_threshold(approved, authorities.len(), threshold) {
            ProposalStatus::Committed
        } else if voted >= authorities.len() {
            ProposalStatus::Rejected
        } else {
            ProposalStatus::Pending
        }
    }
}

/// Approval ratio compared at two-decimal precision, so 2 of 3 meets 0.67.
pub fn meets_threshold(approved: usize, total: usize, threshold: f64) -> bool {
    if total == 0 {
        return false;
    }
    let ratio = approved as f64 / total as f64;
    (ratio * 100.0).round() / 100.0 >= threshold
}

/// Status fields reported by `PoaNode::status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoaStatus {
    pub id: NodeId,
    pub running: bool,
    pub is_authority: bool,
    pub authorities: Vec<NodeId>,
    pub height: u64,
    pub head_hash: String,
    pub pending_proposals: usize,
    pub queued: usize,
    pub block_time_ms: u64,
    pub vote_threshold: f64,
    pub peer_count: usize,
    pub next_proposer: Option<NodeId>,
}

type Outbox = Vec<ConsensusMessage>;

struct PoaState {
    /// Sorted, deduplicated, never empty.
    authorities: Vec<NodeId>,
    chain: Vec<PoaBlock>,
    proposals: HashMap<String, PoaProposal>,
    finalized: VecDeque<(String, ProposalStatus)>,
    /// Votes that arrived before their proposal, keyed by hash and tagged
    /// with the voted height so they can be dropped once the chain passes it.
    early_votes: HashMap<String, (u64, Vec<(NodeId, bool)>)>,
    /// Proposals for heights above head + 1, replayed once the chain catches up.
    deferred: Vec<PoaBlock>,
    /// Height -> hash this node approved.
    voted_heights: HashMap<u64, String>,
    queue: VecDeque<(Command, Instant)>,
    own_pending: Option<String>,
    peers: HashMap<NodeId, Peer>,
}

impl PoaState {
    fn head(&self) -> &PoaBlock {
        // chain always starts at genesis
        &self.chain[self.chain.len() - 1]
    }

    fn height(&self) -> u64 {
        self.head().height
    }

    fn is_authority(&self, id: &str) -> bool {
        self.authorities.binary_search_by(|a| a.as_str().cmp(id)).is_ok()
    }

    fn next_proposer(&self, height: u64) -> Option<NodeId> {
        if self.authorities.is_empty() {
            return None;
        }
        let slot = (height % self.authorities.len() as u64) as usize;
        self.authorities.get(slot).cloned()
    }

    fn knows_block(&self, hash: &str) -> bool {
        self.proposals.contains_key(hash)
            || self.finalized.iter().any(|(h, _)| h == hash)
            || self.chain.iter().rev().take(16).any(|b| b.hash == hash)
    }

    fn chain_intact(&self) -> bool {
        self.chain.iter().enumerate().all(|(i, block)| {
            block.height == i as u64
                && block.verify()
                && (i == 0 || block.prev_hash == self.chain[i - 1].hash)
        })
    }

    fn committed_commands(&self) -> Vec<Command> {
        self.chain.iter().filter_map(|b| b.data.clone()).collect()
    }
}

/// Proof-of-Authority round-robin node.
pub struct PoaNode {
    id: NodeId,
    config: PoaConfig,
    transport: Arc<dyn Transport>,
    commits: CommitSink,
    state: RwLock<PoaState>,
    scope: Mutex<Option<CancellationToken>>,
    running: AtomicBool,
    me: Weak<PoaNode>,
}

impl PoaNode {
    /// Create a node bound to `transport`. An empty configured authority
    /// set makes this node the sole authority.
    pub fn new(config: PoaConfig, transport: Arc<dyn Transport>, commits: CommitSink) -> Arc<Self> {
        let id = transport.local_id().to_string();
        let mut authorities = if config.authorities.is_empty() {
            vec![id.clone()]
        } else {
            config.authorities.clone()
        };
        authorities.sort();
        authorities.dedup();

        let state = PoaState {
            authorities,
            chain: vec![PoaBlock::genesis()],
            proposals: HashMap::new(),
            finalized: VecDeque::new(),
            early_votes: HashMap::new(),
            deferred: Vec::new(),
            voted_heights: HashMap::new(),
            queue: VecDeque::new(),
            own_pending: None,
            peers: HashMap::new(),
        };
        let node = Arc::new_cyclic(|me: &Weak<PoaNode>| PoaNode {
            id,
            config,
            transport,
            commits,
            state: RwLock::new(state),
            scope: Mutex::new(None),
            running: AtomicBool::new(false),
            me: me.clone(),
        });

        let handler_ref = Arc::downgrade(&node);
        node.transport.register_message_handler(
            POA_TOPIC,
            Arc::new(move |from, payload| {
                if let Some(node) = handler_ref.upgrade() {
                    node.handle_payload(from, payload);
                }
            }),
        );
        node
    }

    pub fn is_authority(&self, id: &str) -> bool {
        self.state.read().is_authority(id)
    }

    pub fn authorities(&self) -> Vec<NodeId> {
        self.state.read().authorities.clone()
    }

    /// Round-robin proposer for `height`.
    pub fn next_proposer(&self, height: u64) -> Option<NodeId> {
        self.state.read().next_proposer(height)
    }

    pub fn validate_proposer(&self, id: &str, height: u64) -> bool {
        self.next_proposer(height).as_deref() == Some(id)
    }

    pub fn add_authority(&self, id: &str) -> Result<(), ConsensusError> {
        let mut state = self.state.write();
        match state.authorities.binary_search_by(|a| a.as_str().cmp(id)) {
            Ok(_) => Err(ConsensusError::DuplicateAuthority(id.to_string())),
            Err(pos) => {
                state.authorities.insert(pos, id.to_string());
                info!("{}: authority {} added ({} total)", self.id, id, state.authorities.len());
                Ok(())
            }
        }
    }

    pub fn remove_authority(&self, id: &str) -> Result<(), ConsensusError> {
        let (outbox, committed) = {
            let mut state = self.state.write();
            let pos = state
                .authorities
                .binary_search_by(|a| a.as_str().cmp(id))
                .map_err(|_| ConsensusError::UnknownAuthority(id.to_string()))?;
            if state.authorities.len() == 1 {
                return Err(ConsensusError::LastAuthority(id.to_string()));
            }
            state.authorities.remove(pos);
            info!("{}: authority {} removed ({} left)", self.id, id, state.authorities.len());
            // thresholds shift with the set size
            self.settle(&mut state)
        };
        self.publish(committed);
        self.dispatch(outbox);
        Ok(())
    }

    /// Current chain height (genesis is 0).
    pub fn height(&self) -> u64 {
        self.state.read().height()
    }

    pub fn head(&self) -> PoaBlock {
        self.state.read().head().clone()
    }

    pub fn chain(&self) -> Vec<PoaBlock> {
        self.state.read().chain.clone()
    }

    /// Status of a pending or recently finalized proposal.
    pub fn proposal_status(&self, hash: &str) -> Option<ProposalStatus> {
        let state = self.state.read();
        if let Some(proposal) = state.proposals.get(hash) {
            return Some(proposal.status);
        }
        state
            .finalized
            .iter()
            .find(|(h, _)| h == hash)
            .map(|(_, status)| *status)
    }

    pub fn poa_status(&self) -> PoaStatus {
        let state = self.state.read();
        PoaStatus {
            id: self.id.clone(),
            running: self.is_running(),
            is_authority: state.is_authority(&self.id),
            authorities: state.authorities.clone(),
            height: state.height(),
            head_hash: state.head().hash.clone(),
            pending_proposals: state.proposals.len(),
            queued: state.queue.len(),
            block_time_ms: self.config.block_time.as_millis() as u64,
            vote_threshold: self.config.vote_threshold,
            peer_count: state.peers.len(),
            next_proposer: state.next_proposer(state.height() + 1),
        }
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep(self.config.block_time) => self.tick(),
            }
        }
        debug!("{}: poa loop exited", self.id);
    }

    fn tick(&self) {
        let (outbox, committed) = {
            let mut state = self.state.write();
            let mut outbox = Vec::new();
            let mut committed = self.expire_proposals(&mut state);

            if let Some(slot_owner) = self.slot_owner(&state) {
                if slot_owner == self.id && state.own_pending.is_none() {
                    let data = state.queue.pop_front();
                    if data.is_some() || self.config.produce_empty_blocks {
                        let (out, done) = self.propose(&mut state, data);
                        outbox.extend(out);
                        committed.extend(done);
                    }
                }
            }
            (outbox, committed)
        };
        self.publish(committed);
        self.dispatch(outbox);
    }

    /// Authority owning the current wall-clock slot.
    fn slot_owner(&self, state: &PoaState) -> Option<NodeId> {
        let block_ms = (self.config.block_time.as_millis() as i64).max(1);
        let slot = Utc::now().timestamp_millis() / block_ms;
        state.next_proposer(slot.max(0) as u64)
    }

    fn expire_proposals(&self, state: &mut PoaState) -> Vec<CommittedEntry> {
        let expired: Vec<String> = state
            .proposals
            .iter()
            .filter(|(_, p)| p.created_at.elapsed() >= self.config.proposal_timeout)
            .map(|(hash, _)| hash.clone())
            .collect();
        let mut committed = Vec::new();
        for hash in expired {
            warn!("{}: proposal {} timed out", self.id, short(&hash));
            committed.extend(self.finalize(state, &hash, ProposalStatus::Rejected));
        }
        committed
    }

    /// Seal a block on the local head and open a proposal for it.
    fn propose(
        &self,
        state: &mut PoaState,
        data: Option<(Command, Instant)>,
    ) -> (Outbox, Vec<CommittedEntry>) {
        let height = state.height() + 1;
        if state.voted_heights.contains_key(&height) {
            // already approved another block at this height
            if let Some(item) = data {
                state.queue.push_front(item);
            }
            return (Vec::new(), Vec::new());
        }

        let (command, submitted_at) = match data {
            Some((command, at)) => (Some(command), Some(at)),
            None => (None, None),
        };
        let block = PoaBlock::build(
            height,
            state.head().hash.clone(),
            Utc::now().timestamp_millis(),
            self.id.clone(),
            command,
        );
        let hash = block.hash.clone();
        info!(
            "{}: proposing block {} at height {}{}",
            self.id,
            short(&hash),
            height,
            if block.data.is_none() { " (empty)" } else { "" }
        );

        let mut proposal = PoaProposal::new(block.clone());
        proposal.submitted_at = submitted_at;
        proposal.record_vote(&self.id, true);
        state.voted_heights.insert(height, hash.clone());
        state.own_pending = Some(hash.clone());
        state.proposals.insert(hash, proposal);

        let mut outbox = vec![ConsensusMessage::PoaProposal(PoaProposalMessage { block })];
        let (more, committed) = self.settle(state);
        outbox.extend(more);
        (outbox, committed)
    }

    /// Why `block` cannot extend the local head, if it cannot.
    fn validate_block(&self, state: &PoaState, block: &PoaBlock) -> Result<(), String> {
        if !state.is_authority(&block.proposer) {
            return Err(format!("proposer {} is not an authority", block.proposer));
        }
        if !block.verify() {
            return Err("hash or seal does not recompute".to_string());
        }
        let head = state.head();
        if block.height != head.height + 1 || block.prev_hash != head.hash {
            return Err(format!(
                "block {} at height {} does not link to head {} at height {}",
                short(&block.hash),
                block.height,
                short(&head.hash),
                head.height
            ));
        }
        Ok(())
    }

    fn on_proposal(&self, state: &mut PoaState, from: &str, block: PoaBlock) -> Outbox {
        if !PoaBlock::is_hash_well_formed(&block.hash)
            || !PoaBlock::is_hash_well_formed(&block.prev_hash)
        {
            warn!("{}: dropping proposal from {} with a malformed hash", self.id, from);
            return Vec::new();
        }
        if block.proposer != from {
            warn!("{}: proposal relayed by {} claims proposer {}", self.id, from, block.proposer);
            return Vec::new();
        }
        if state.knows_block(&block.hash) {
            return Vec::new();
        }
        if !state.is_authority(&block.proposer) {
            warn!("{}: ignoring block from non-authority {}", self.id, block.proposer);
            return Vec::new();
        }
        if block.height > state.height() + 1 {
            if state.deferred.len() < self.config.max_retained_proposals {
                debug!(
                    "{}: deferring block at height {} (head {})",
                    self.id,
                    block.height,
                    state.height()
                );
                state.deferred.push(block);
            }
            return Vec::new();
        }
        self.accept_proposal(state, block)
    }

    /// Track a proposal and cast this node's vote on it.
    fn accept_proposal(&self, state: &mut PoaState, block: PoaBlock) -> Outbox {
        let verdict = self.validate_block(state, &block);
        let hash = block.hash.clone();
        let height = block.height;

        let proposer = block.proposer.clone();
        let mut proposal = PoaProposal::new(block);
        proposal.record_vote(&proposer, true);
        let early = state.early_votes.remove(&hash).map(|(_, votes)| votes).unwrap_or_default();
        for (voter, approve) in early {
            proposal.record_vote(&voter, approve);
        }

        let mut outbox = Vec::new();
        if state.is_authority(&self.id) && !proposal.votes.contains_key(&self.id) {
            let approve = match (&verdict, state.voted_heights.get(&height)) {
                (Err(reason), _) => {
                    warn!("{}: voting against {}: {}", self.id, short(&hash), reason);
                    false
                }
                (Ok(()), Some(other)) if *other != hash => {
                    debug!("{}: already approved {} at height {}", self.id, short(other), height);
                    false
                }
                (Ok(()), _) => true,
            };
            if approve {
                state.voted_heights.insert(height, hash.clone());
            }
            proposal.record_vote(&self.id, approve);
            outbox.push(ConsensusMessage::PoaVote(PoaVoteMessage {
                block_hash: hash.clone(),
                height,
                voter: self.id.clone(),
                approve,
            }));
        }
        state.proposals.insert(hash, proposal);
        outbox
    }

    fn on_vote(&self, state: &mut PoaState, from: &str, vote: PoaVoteMessage) {
        if vote.voter != from || !state.is_authority(&vote.voter) {
            warn!("{}: dropping vote from {} for voter {}", self.id, from, vote.voter);
            return;
        }
        if !PoaBlock::is_hash_well_formed(&vote.block_hash) {
            warn!("{}: dropping vote from {} with a malformed hash", self.id, from);
            return;
        }
        if let Some(proposal) = state.proposals.get_mut(&vote.block_hash) {
            if !proposal.record_vote(&vote.voter, vote.approve) {
                debug!(
                    "{}: duplicate vote from {} on {}",
                    self.id,
                    vote.voter,
                    short(&vote.block_hash)
                );
            }
            return;
        }
        if vote.height <= state.height() || state.knows_block(&vote.block_hash) {
            return;
        }
        if state.early_votes.len() < self.config.max_retained_proposals
            || state.early_votes.contains_key(&vote.block_hash)
        {
            state
                .early_votes
                .entry(vote.block_hash)
                .or_insert_with(|| (vote.height, Vec::new()))
                .1
                .push((vote.voter, vote.approve));
        }
    }

    /// Finalize every decided proposal and replay deferred blocks that now
    /// link to the head.
    fn settle(&self, state: &mut PoaState) -> (Outbox, Vec<CommittedEntry>) {
        let mut outbox = Vec::new();
        let mut committed = Vec::new();
        loop {
            let height = state.height();
            let mut decided: Vec<(u64, String, ProposalStatus)> = state
                .proposals
                .iter()
                .filter_map(|(hash, p)| {
                    let status = if p.block.height <= height {
                        ProposalStatus::Rejected
                    } else {
                        p.tally(&state.authorities, self.config.vote_threshold)
                    };
                    (status != ProposalStatus::Pending)
                        .then(|| (p.block.height, hash.clone(), status))
                })
                .collect();

            if decided.is_empty() {
                state.early_votes.retain(|_, (voted, _)| *voted > height);
                state.deferred.retain(|b| b.height > height);
                let (ready, later): (Vec<PoaBlock>, Vec<PoaBlock>) =
                    state.deferred.drain(..).partition(|b| b.height == height + 1);
                state.deferred = later;
                if ready.is_empty() {
                    break;
                }
                for block in ready {
                    if !state.knows_block(&block.hash) {
                        outbox.extend(self.accept_proposal(state, block));
                    }
                }
                continue;
            }

            decided.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
            for (_, hash, status) in decided {
                committed.extend(self.finalize(state, &hash, status));
            }
        }
        (outbox, committed)
    }

    fn finalize(
        &self,
        state: &mut PoaState,
        hash: &str,
        status: ProposalStatus,
    ) -> Vec<CommittedEntry> {
        let Some(mut proposal) = state.proposals.remove(hash) else {
            return Vec::new();
        };
        let own = state.own_pending.as_deref() == Some(hash);
        if own {
            state.own_pending = None;
        }

        let head = state.head();
        let links =
            proposal.block.height == head.height + 1 && proposal.block.prev_hash == head.hash;
        let mut entries = Vec::new();
        proposal.status = if status == ProposalStatus::Committed && links {
            ProposalStatus::Committed
        } else {
            ProposalStatus::Rejected
        };

        if proposal.status == ProposalStatus::Committed {
            let block = proposal.block.clone();
            info!(
                "{}: committed block {} at height {} ({} votes)",
                self.id,
                short(&block.hash),
                block.height,
                proposal.votes.len()
            );
            if let Some(command) = block.data.clone() {
                entries.push(CommittedEntry {
                    consensus: ConsensusType::Poa,
                    index: block.height,
                    term: 0,
                    command,
                    latency: proposal.submitted_at.map(|at| at.elapsed()),
                });
            }
            let height = block.height;
            state.chain.push(block);
            state.voted_heights.retain(|h, _| *h > height);
        } else {
            info!(
                "{}: rejected block {} at height {}",
                self.id,
                short(hash),
                proposal.block.height
            );
            // free the height so a replacement block can be approved
            if state.voted_heights.get(&proposal.block.height).map(String::as_str) == Some(hash) {
                state.voted_heights.remove(&proposal.block.height);
            }
            if own {
                if let (Some(command), Some(at)) =
                    (proposal.block.data.clone(), proposal.submitted_at)
                {
                    state.queue.push_front((command, at));
                }
            }
        }

        state.finalized.push_back((hash.to_string(), proposal.status));
        while state.finalized.len() > self.config.max_retained_proposals {
            state.finalized.pop_front();
        }
        entries
    }

    fn handle_payload(&self, from: NodeId, payload: Vec<u8>) {
        if !self.is_running() {
            debug!("{}: stopped, ignoring poa message from {}", self.id, from);
            return;
        }
        let message = match ConsensusMessage::decode(&payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("{}: dropping malformed poa message from {}: {}", self.id, from, e);
                return;
            }
        };

        let (outbox, committed) = {
            let mut state = self.state.write();
            let mut outbox = match message {
                ConsensusMessage::PoaProposal(msg) => {
                    self.on_proposal(&mut state, &from, msg.block)
                }
                ConsensusMessage::PoaVote(vote) => {
                    self.on_vote(&mut state, &from, vote);
                    Vec::new()
                }
                other => {
                    warn!("{}: unexpected {} on poa topic from {}", self.id, other.kind(), from);
                    Vec::new()
                }
            };
            let (more, committed) = self.settle(&mut state);
            outbox.extend(more);
            (outbox, committed)
        };
        self.publish(committed);
        self.dispatch(outbox);
    }

    fn publish(&self, committed: Vec<CommittedEntry>) {
        for entry in committed {
            let _ = self.commits.send(entry);
        }
    }

    fn dispatch(&self, outbox: Outbox) {
        if outbox.is_empty() {
            return;
        }
        let transport = self.transport.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            for message in outbox {
                let payload = match message.encode() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("{}: failed to encode {}: {}", id, message.kind(), e);
                        continue;
                    }
                };
                if let Err(e) = transport.broadcast_message(POA_TOPIC, payload).await {
                    warn!("{}: broadcast of {} failed: {}", id, message.kind(), e);
                }
            }
        });
    }
}

/// First 12 characters, cut on a char boundary.
fn short(hash: &str) -> &str {
    match hash.char_indices().nth(12) {
        Some((end, _)) => &hash[..end],
        None => hash,
    }
}

#[async_trait]
impl ConsensusAlgorithm for PoaNode {
    fn consensus_type(&self) -> ConsensusType {
        ConsensusType::Poa
    }

    fn node_id(&self) -> &str {
        &self.id
    }

    async fn start(&self, scope: CancellationToken) -> Result<(), ConsensusError> {
        let token = {
            let mut slot = self.scope.lock();
            if self.running.load(Ordering::SeqCst) {
                debug!("{}: poa already running", self.id);
                return Ok(());
            }
            let token = scope.child_token();
            *slot = Some(token.clone());
            self.running.store(true, Ordering::SeqCst);
            token
        };
        self.refresh_peers();

        let node = self.me.upgrade().ok_or(ConsensusError::NotRunning(ConsensusType::Poa))?;
        tokio::spawn(node.run(token));
        info!(
            "{}: PoA node started at height {} with {} authorities",
            self.id,
            self.height(),
            self.authorities().len()
        );
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
        info!("{}: PoA node stopped", self.id);
        Ok(())
    }

    async fn submit(&self, proposal: Command) -> Result<(), ConsensusError> {
        if !self.is_running() {
            return Err(ConsensusError::NotRunning(ConsensusType::Poa));
        }
        let (outbox, committed) = {
            let mut state = self.state.write();
            if !state.is_authority(&self.id) {
                return Err(ConsensusError::NotAuthority(self.id.clone()));
            }
            state.queue.push_back((proposal, Instant::now()));
            if state.own_pending.is_some() {
                debug!(
                    "{}: proposal queued behind pending block ({} queued)",
                    self.id,
                    state.queue.len()
                );
                (Vec::new(), Vec::new())
            } else {
                let data = state.queue.pop_front();
                self.propose(&mut state, data)
            }
        };
        self.publish(committed);
        self.dispatch(outbox);
        Ok(())
    }

    fn status(&self) -> serde_json::Map<String, serde_json::Value> {
        status_map(&self.poa_status())
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
        if !self.is_running() {
            return false;
        }
        let state = self.state.read();
        state.next_proposer(state.height() + 1).as_deref() == Some(self.id.as_str())
    }

    fn add_peer(&self, peer: Peer) -> Result<(), ConsensusError> {
        let mut state = self.state.write();
        if peer.id == self.id || state.peers.contains_key(&peer.id) {
            return Err(ConsensusError::DuplicatePeer(peer.id));
        }
        info!("{}: added poa peer {} at {}", self.id, peer.id, peer.address);
        state.peers.insert(peer.id.clone(), peer);
        Ok(())
    }

    fn remove_peer(&self, peer_id: &str) -> Result<(), ConsensusError> {
        let mut state = self.state.write();
        match state.peers.remove(peer_id) {
            Some(_) => {
                info!("{}: removed poa peer {}", self.id, peer_id);
                Ok(())
            }
            None => Err(ConsensusError::UnknownPeer(peer_id.to_string())),
        }
    }

    fn health(&self) -> ProtocolHealth {
        let state = self.state.read();
        ProtocolHealth {
            running: self.is_running(),
            has_leader: !state.authorities.is_empty(),
            active_peers: state.peers.values().filter(|p| p.active).count(),
            total_peers: state.peers.len(),
            integrity_ok: state.chain_intact(),
            pending: state.proposals.len() + state.queue.len(),
        }
    }

    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::new(ConsensusType::Poa, self.state.read().committed_commands())
    }

    fn restore(&self, snapshot: &StateSnapshot) -> Result<usize, ConsensusError> {
        snapshot.verify()?;
        let (outbox, committed, imported) = {
            let mut state = self.state.write();
            let existing = state.committed_commands();
            let overlap = existing.len().min(snapshot.len());
            if let Some(i) = (0..overlap).find(|&i| existing[i] != snapshot.committed[i]) {
                return Err(ConsensusError::InvalidSnapshot(format!(
                    "snapshot from {} diverges from chain at command {}",
                    snapshot.source,
                    i + 1
                )));
            }
            if snapshot.len() <= existing.len() {
                return Ok(0);
            }

            // deterministic blocks so every migrating node builds the same chain
            for command in &snapshot.committed[existing.len()..] {
                let head = state.head();
                let block = PoaBlock::build(
                    head.height + 1,
                    head.hash.clone(),
                    0,
                    MIGRATION_PROPOSER.to_string(),
                    Some(command.clone()),
                );
                state.chain.push(block);
            }
            let imported = snapshot.len() - existing.len();
            info!(
                "{}: imported {} committed commands from {} snapshot (height {})",
                self.id,
                imported,
                snapshot.source,
                state.height()
            );
            let (outbox, committed) = self.settle(&mut state);
            (outbox, committed, imported)
        };
        self.publish(committed);
        self.dispatch(outbox);
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
            info!("{}: discovered {} poa peers", self.id, added);
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalNetwork;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::broadcast;

    fn ids(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn node_with(
        id: &str,
        authorities: &[&str],
    ) -> (Arc<PoaNode>, broadcast::Receiver<CommittedEntry>) {
        let network = LocalNetwork::new();
        let (commits, rx) = broadcast::channel(64);
        let config = PoaConfig {
            authorities: ids(authorities),
            block_time: Duration::from_millis(50),
            produce_empty_blocks: false,
            ..PoaConfig::default()
        };
        (PoaNode::new(config, network.join(id), commits), rx)
    }

    #[tokio::test]
    async fn test_round_robin_proposer_order() {
        let (node, _rx) = node_with("n2", &["n3", "n1", "n2"]);
        assert_eq!(node.authorities(), ids(&["n1", "n2", "n3"]));
        assert_eq!(node.next_proposer(0).as_deref(), Some("n1"));
        assert_eq!(node.next_proposer(1).as_deref(), Some("n2"));
        assert_eq!(node.next_proposer(2).as_deref(), Some("n3"));
        assert_eq!(node.next_proposer(3).as_deref(), Some("n1"));
        assert!(node.validate_proposer("n2", 4));
        assert!(!node.validate_proposer("n2", 3));
    }

    #[test]
    fn test_threshold_with_three_authorities() {
        let authorities = ids(&["n1", "n2", "n3"]);
        let mut proposal = PoaProposal::new(PoaBlock::genesis());
        proposal.record_vote("n1", true);
        assert_eq!(proposal.tally(&authorities, 0.67), ProposalStatus::Pending);
        proposal.record_vote("n2", true);
        assert_eq!(proposal.tally(&authorities, 0.67), ProposalStatus::Committed);

        let mut proposal = PoaProposal::new(PoaBlock::genesis());
        proposal.record_vote("n1", true);
        proposal.record_vote("n2", false);
        assert_eq!(proposal.tally(&authorities, 0.67), ProposalStatus::Pending);
        proposal.record_vote("n3", false);
        assert_eq!(proposal.tally(&authorities, 0.67), ProposalStatus::Rejected);
    }

    #[test]
    fn test_vote_is_recorded_once() {
        let mut proposal = PoaProposal::new(PoaBlock::genesis());
        assert!(proposal.record_vote("n1", false));
        assert!(!proposal.record_vote("n1", true));
        assert!(!proposal.votes["n1"]);
    }

    #[test]
    fn test_votes_from_non_authorities_do_not_count() {
        let authorities = ids(&["n1", "n2", "n3"]);
        let mut proposal = PoaProposal::new(PoaBlock::genesis());
        proposal.record_vote("n1", true);
        proposal.record_vote("mallory", true);
        assert_eq!(proposal.tally(&authorities, 0.67), ProposalStatus::Pending);
    }

    #[test]
    fn test_block_hash_and_seal_verify() {
        let genesis = PoaBlock::genesis();
        assert_eq!(genesis, PoaBlock::genesis());
        let data = Some(json!({"op": "create"}));
        let mut block = PoaBlock::build(1, genesis.hash.clone(), 42, "n1".to_string(), data);
        assert!(block.verify());
        block.data = Some(json!({"op": "revoke"}));
        assert!(!block.verify());
    }

    #[tokio::test]
    async fn test_authority_set_changes() {
        let (node, _rx) = node_with("n1", &["n1", "n2"]);
        assert_eq!(
            node.add_authority("n2"),
            Err(ConsensusError::DuplicateAuthority("n2".to_string()))
        );
        node.add_authority("n0").unwrap();
        assert_eq!(node.authorities(), ids(&["n0", "n1", "n2"]));
        assert_eq!(
            node.remove_authority("n9"),
            Err(ConsensusError::UnknownAuthority("n9".to_string()))
        );
        node.remove_authority("n0").unwrap();
        node.remove_authority("n2").unwrap();
        assert_eq!(
            node.remove_authority("n1"),
            Err(ConsensusError::LastAuthority("n1".to_string()))
        );
        assert!(node.is_authority("n1"));
    }

    #[tokio::test]
    async fn test_sole_authority_commits_on_submit() {
        let (node, mut rx) = node_with("solo", &[]);
        node.start(CancellationToken::new()).await.unwrap();
        node.submit(json!({"op": "create", "did": "did:example:1"})).await.unwrap();

        let entry = rx.recv().await.unwrap();
        assert_eq!(entry.consensus, ConsensusType::Poa);
        assert_eq!(entry.index, 1);
        assert_eq!(node.height(), 1);
        assert!(node.health().integrity_ok);
        assert_eq!(node.snapshot().committed.len(), 1);
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_non_authority_cannot_submit() {
        let (node, _rx) = node_with("observer", &["n1", "n2"]);
        node.start(CancellationToken::new()).await.unwrap();
        assert_eq!(
            node.submit(json!(1)).await,
            Err(ConsensusError::NotAuthority("observer".to_string()))
        );
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_vote_against_block_not_linking_to_head() {
        let (node, _rx) = node_with("n2", &["n1", "n2", "n3"]);
        let stray = PoaBlock::build(1, "f".repeat(64), 1, "n1".to_string(), Some(json!(1)));
        let hash = stray.hash.clone();

        let mut state = node.state.write();
        let outbox = node.on_proposal(&mut state, "n1", stray);
        match &outbox[0] {
            ConsensusMessage::PoaVote(vote) => assert!(!vote.approve),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!state.proposals[&hash].votes["n2"]);
    }

    #[tokio::test]
    async fn test_one_approval_per_height() {
        let (node, _rx) = node_with("n3", &["n1", "n2", "n3"]);
        let genesis = PoaBlock::genesis();
        let first = PoaBlock::build(1, genesis.hash.clone(), 1, "n1".to_string(), Some(json!("a")));
        let second =
            PoaBlock::build(1, genesis.hash.clone(), 2, "n2".to_string(), Some(json!("b")));

        let mut state = node.state.write();
        node.on_proposal(&mut state, "n1", first.clone());
        node.on_proposal(&mut state, "n2", second.clone());
        assert!(state.proposals[&first.hash].votes["n3"]);
        assert!(!state.proposals[&second.hash].votes["n3"]);

        node.settle(&mut state);
        assert_eq!(state.height(), 1);
        assert_eq!(state.head().hash, first.hash);
        assert!(state.proposals.is_empty());
    }

    #[tokio::test]
    async fn test_restore_builds_deterministic_chain() {
        let (a, _ra) = node_with("a", &["a"]);
        let (b, _rb) = node_with("b", &["b"]);
        let snapshot = StateSnapshot::new(ConsensusType::Raft, vec![json!(1), json!(2)]);
        assert_eq!(a.restore(&snapshot).unwrap(), 2);
        assert_eq!(b.restore(&snapshot).unwrap(), 2);
        assert_eq!(a.head().hash, b.head().hash);
        assert_eq!(a.restore(&snapshot).unwrap(), 0);

        let divergent = StateSnapshot::new(ConsensusType::Raft, vec![json!(9)]);
        assert!(a.restore(&divergent).is_err());
    }

    #[test]
    fn test_short_hash_respects_char_boundaries() {
        assert_eq!(short("0123456789abcdef"), "0123456789ab");
        assert_eq!(short("abc"), "abc");
        assert_eq!(short("aéééééééé"), "aéééééééé");
        let long = format!("a{}", "é".repeat(20));
        assert_eq!(short(&long), format!("a{}", "é".repeat(11)));
        assert_eq!(short(&"é".repeat(13)), "é".repeat(12));
    }

    #[test]
    fn test_hash_shape_check() {
        assert!(PoaBlock::is_hash_well_formed(&PoaBlock::genesis().hash));
        assert!(!PoaBlock::is_hash_well_formed("abc"));
        assert!(!PoaBlock::is_hash_well_formed(&"F".repeat(64)));
        assert!(!PoaBlock::is_hash_well_formed(&"é".repeat(32)));
    }

    #[tokio::test]
    async fn test_malformed_proposal_does_not_stall_node() {
        let _ = env_logger::builder()
            .is_test(true)
            .filter_level(log::LevelFilter::Debug)
            .try_init();
        let network = LocalNetwork::new();
        let (commits, _rx) = broadcast::channel(16);
        let config = PoaConfig {
            authorities: ids(&["v", "w"]),
            block_time: Duration::from_millis(50),
            produce_empty_blocks: false,
            ..PoaConfig::default()
        };
        let node = PoaNode::new(config, network.join("v"), commits);
        let rogue = network.join("w");
        node.start(CancellationToken::new()).await.unwrap();

        let genesis = PoaBlock::genesis();
        let mut bad =
            PoaBlock::build(1, genesis.hash.clone(), 1, "w".to_string(), Some(json!("bad")));
        bad.hash = "aéééééééé".to_string();
        let payload = ConsensusMessage::PoaProposal(PoaProposalMessage { block: bad })
            .encode()
            .unwrap();
        rogue.send_message("v", POA_TOPIC, payload).await.unwrap();
        let vote = ConsensusMessage::PoaVote(PoaVoteMessage {
            block_hash: "ééééééééééééé".to_string(),
            height: 1,
            voter: "w".to_string(),
            approve: true,
        });
        rogue.send_message("v", POA_TOPIC, vote.encode().unwrap()).await.unwrap();

        let good =
            PoaBlock::build(1, genesis.hash.clone(), 2, "w".to_string(), Some(json!("good")));
        let payload = ConsensusMessage::PoaProposal(PoaProposalMessage {
            block: good.clone(),
        })
        .encode()
        .unwrap();
        rogue.send_message("v", POA_TOPIC, payload).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while node.height() < 1 && Instant::now() < deadline {
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(node.height(), 1);
        assert_eq!(node.head().hash, good.hash);
        assert!(node.state.read().early_votes.is_empty());
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_early_votes_are_pruned() {
        let network = LocalNetwork::new();
        let (commits, _rx) = broadcast::channel(16);
        let config = PoaConfig {
            authorities: ids(&["n1", "n2"]),
            max_retained_proposals: 4,
            ..PoaConfig::default()
        };
        let node = PoaNode::new(config, network.join("n1"), commits);

        {
            let mut state = node.state.write();
            for i in 0..4u64 {
                let vote = PoaVoteMessage {
                    block_hash: format!("{:064x}", i),
                    height: 1,
                    voter: "n2".to_string(),
                    approve: true,
                };
                node.on_vote(&mut state, "n2", vote);
            }
            assert_eq!(state.early_votes.len(), 4);
        }

        let commands = (0..5).map(|i| json!(i)).collect();
        node.restore(&StateSnapshot::new(ConsensusType::Raft, commands)).unwrap();
        assert_eq!(node.height(), 5);

        let mut state = node.state.write();
        assert!(state.early_votes.is_empty());
        let stale = PoaVoteMessage {
            block_hash: format!("{:064x}", 99),
            height: 3,
            voter: "n2".to_string(),
            approve: true,
        };
        node.on_vote(&mut state, "n2", stale);
        assert!(state.early_votes.is_empty());

        let ahead = PoaVoteMessage {
            block_hash: format!("{:064x}", 100),
            height: 7,
            voter: "n2".to_string(),
            approve: true,
        };
        node.on_vote(&mut state, "n2", ahead);
        assert_eq!(state.early_votes.len(), 1);
    }
}
