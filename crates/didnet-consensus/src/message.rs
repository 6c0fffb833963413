// CONSENSUS WIRE MESSAGES
// JSON payloads demultiplexed by their `type` field

use crate::engine::{ConsensusError, NodeId};
use crate::poa_engine::PoaBlock;
use crate::raft_engine::LogEntry;
use serde::{Deserialize, Serialize};

/// Transport topic carrying Raft RPCs.
pub const RAFT_TOPIC: &str = "consensus/raft";

/// Transport topic carrying PoA proposals and votes.
pub const POA_TOPIC: &str = "consensus/poa";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// Highest index known to match the leader's log when `success`.
    pub match_index: u64,
    /// Follower's last log index, used by the leader to skip back faster.
    pub last_log_index: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoaProposalMessage {
    pub block: PoaBlock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoaVoteMessage {
    pub block_hash: String,
    pub height: u64,
    pub voter: NodeId,
    pub approve: bool,
}

/// Every payload exchanged by the consensus protocols.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsensusMessage {
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    RequestVote(RequestVoteRequest),
    RequestVoteResponse(RequestVoteResponse),
    PoaProposal(PoaProposalMessage),
    PoaVote(PoaVoteMessage),
}

impl ConsensusMessage {
    /// The `type` discriminator, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ConsensusMessage::AppendEntries(_) => "append_entries",
            ConsensusMessage::AppendEntriesResponse(_) => "append_entries_response",
            ConsensusMessage::RequestVote(_) => "request_vote",
            ConsensusMessage::RequestVoteResponse(_) => "request_vote_response",
            ConsensusMessage::PoaProposal(_) => "poa_proposal",
            ConsensusMessage::PoaVote(_) => "poa_vote",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ConsensusError> {
        serde_json::to_vec(self).map_err(|e| ConsensusError::Codec(e.to_string()))
    }

    /// Decode a payload; unknown `type` values and malformed JSON are errors.
    pub fn decode(payload: &[u8]) -> Result<Self, ConsensusError> {
        serde_json::from_slice(payload).map_err(|e| ConsensusError::Codec(e.to_string()))
    }
}
