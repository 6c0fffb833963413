// CONSENSUS ENGINE CONTRACT
// Unified interface implemented by every pluggable consensus protocol
//
// INVARIANTS:
// 1. A protocol instance exclusively owns its term/log/authority state
// 2. Rejections (not leader, not authority, ...) are returned, never panicked
// 3. Snapshots carry only committed commands, in commit order
// 4. Restoring a snapshot never rewrites already-committed history

use crate::transport::TransportError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Identifier of a node on the network (the transport's peer id).
pub type NodeId = String;

/// An opaque client operation submitted for agreement.
///
/// The upstream operation proposer wraps DID create/update/revoke and
/// membership changes into JSON documents; the engine never looks inside.
pub type Command = serde_json::Value;

/// Consensus protocols known to the node.
///
/// Only `Raft` and `Poa` have implementations. `Pbft` and `Pos` are named so
/// that configuration and switch requests can refer to them and be rejected
/// with a precise error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusType {
    Raft,
    Poa,
    Pbft,
    Pos,
}

impl ConsensusType {
    /// Return a human-readable name for logging and diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsensusType::Raft => "raft",
            ConsensusType::Poa => "poa",
            ConsensusType::Pbft => "pbft",
            ConsensusType::Pos => "pos",
        }
    }

    /// Whether this node ships an implementation of the protocol.
    pub fn is_implemented(&self) -> bool {
        matches!(self, ConsensusType::Raft | ConsensusType::Poa)
    }
}

impl fmt::Display for ConsensusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsensusType {
    type Err = ConsensusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raft" => Ok(ConsensusType::Raft),
            "poa" => Ok(ConsensusType::Poa),
            "pbft" => Ok(ConsensusType::Pbft),
            "pos" => Ok(ConsensusType::Pos),
            other => Err(ConsensusError::UnknownConsensus(other.to_string())),
        }
    }
}

/// Consensus engine errors.
///
/// Every variant is a rejection or a recoverable condition; callers decide
/// whether to retry, redirect or surface it.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error(
        "node {node} is not the Leader (known leader: {})",
        leader.as_deref().unwrap_or("none")
    )]
    NotLeader {
        node: NodeId,
        leader: Option<NodeId>,
    },

    #[error("node {0} is not an authority")]
    NotAuthority(NodeId),

    #[error("authority {0} is already registered")]
    DuplicateAuthority(NodeId),

    #[error("authority {0} is not registered")]
    UnknownAuthority(NodeId),

    #[error("cannot remove authority {0}: it is the last remaining authority")]
    LastAuthority(NodeId),

    #[error("peer {0} is already registered")]
    DuplicatePeer(NodeId),

    #[error("peer {0} is not registered")]
    UnknownPeer(NodeId),

    #[error("{0} consensus is not running")]
    NotRunning(ConsensusType),

    #[error("unknown consensus type '{0}'")]
    UnknownConsensus(String),

    #[error("snapshot rejected: {0}")]
    InvalidSnapshot(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("message codec error: {0}")]
    Codec(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl From<TransportError> for ConsensusError {
    fn from(e: TransportError) -> Self {
        ConsensusError::Transport(e.to_string())
    }
}

/// A peer known to a protocol instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: NodeId,
    pub address: String,
    /// Cleared when the last send to this peer failed.
    pub active: bool,
}

impl Peer {
    pub fn new(id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        Peer {
            id: id.into(),
            address: address.into(),
            active: true,
        }
    }
}

/// Point-in-time health of a protocol instance, as seen by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolHealth {
    pub running: bool,
    /// Raft: a leader is known. PoA: the authority set is non-empty.
    pub has_leader: bool,
    pub active_peers: usize,
    pub total_peers: usize,
    /// Structural self-check of the owned state (log indices, hash links).
    pub integrity_ok: bool,
    /// Accepted but not yet committed proposals.
    pub pending: usize,
}

/// Committed state exported by one protocol and imported by another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub source: ConsensusType,
    pub committed: Vec<Command>,
    pub taken_at: DateTime<Utc>,
    /// Hex SHA-256 over the committed commands.
    pub digest: String,
}

impl StateSnapshot {
    pub fn new(source: ConsensusType, committed: Vec<Command>) -> Self {
        let digest = Self::compute_digest(&committed);
        StateSnapshot {
            source,
            committed,
            taken_at: Utc::now(),
            digest,
        }
    }

    /// Deterministic digest of a command sequence.
    pub fn compute_digest(committed: &[Command]) -> String {
        let mut hasher = Sha256::new();
        hasher.update((committed.len() as u64).to_le_bytes());
        for command in committed {
            hasher.update(command.to_string().as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    /// Reject snapshots whose content does not match their digest.
    pub fn verify(&self) -> Result<(), ConsensusError> {
        let expected = Self::compute_digest(&self.committed);
        if expected != self.digest {
            return Err(ConsensusError::InvalidSnapshot(format!(
                "digest mismatch for {} snapshot: expected {}, got {}",
                self.source, expected, self.digest
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.committed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.committed.is_empty()
    }
}

/// Notification that a proposal has been accepted by the cluster.
///
/// This is the only thing the DID registry consumes from the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedEntry {
    pub consensus: ConsensusType,
    /// Raft log index or PoA block height.
    pub index: u64,
    /// Raft term; always 0 for PoA.
    pub term: u64,
    pub command: Command,
    /// Proposal-to-commit latency, known only on the node that proposed it.
    pub latency: Option<Duration>,
}

/// Sending half of the commit notification channel shared by all protocols.
pub type CommitSink = broadcast::Sender<CommittedEntry>;

/// Consensus algorithm trait: the capability set shared by Raft and PoA.
///
/// The switcher holds one concrete instance of each implementor and hands
/// out the active one as `Arc<dyn ConsensusAlgorithm>`.
#[async_trait]
pub trait ConsensusAlgorithm: Send + Sync {
    /// Which protocol this instance implements.
    fn consensus_type(&self) -> ConsensusType;

    /// Local node id.
    fn node_id(&self) -> &str;

    /// Start background tasks under a child of `scope`.
    ///
    /// Starting an already running instance is a no-op.
    async fn start(&self, scope: CancellationToken) -> Result<(), ConsensusError>;

    /// Stop background tasks. In-memory state is kept so a later `start`
    /// resumes from it.
    async fn stop(&self) -> Result<(), ConsensusError>;

    /// Submit a proposal for agreement.
    async fn submit(&self, proposal: Command) -> Result<(), ConsensusError>;

    /// Protocol-specific status fields.
    fn status(&self) -> serde_json::Map<String, serde_json::Value>;

    /// Ids of every node this instance knows about, itself included.
    fn nodes(&self) -> Vec<NodeId>;

    fn is_running(&self) -> bool;

    /// Whether this node currently drives agreement (Raft leader, PoA
    /// in-turn authority).
    fn is_leader(&self) -> bool;

    fn add_peer(&self, peer: Peer) -> Result<(), ConsensusError>;

    fn remove_peer(&self, peer_id: &str) -> Result<(), ConsensusError>;

    fn health(&self) -> ProtocolHealth;

    /// Export committed state.
    fn snapshot(&self) -> StateSnapshot;

    /// Import the committed commands this instance does not have yet.
    /// Returns the number of imported commands.
    fn restore(&self, snapshot: &StateSnapshot) -> Result<usize, ConsensusError>;

    /// Reconcile the peer set with the transport's view; returns the number
    /// of peers added.
    fn refresh_peers(&self) -> usize;

    /// Force a fresh leader election where the protocol has one.
    async fn trigger_election(&self) -> Result<(), ConsensusError> {
        Ok(())
    }
}

/// Flatten a serializable status struct into a JSON object.
pub(crate) fn status_map<T: Serialize>(status: &T) -> serde_json::Map<String, serde_json::Value> {
    match serde_json::to_value(status) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_consensus_type_round_trip_names() {
        assert_eq!("Raft".parse::<ConsensusType>().unwrap(), ConsensusType::Raft);
        assert_eq!("poa".parse::<ConsensusType>().unwrap(), ConsensusType::Poa);
        assert_eq!(ConsensusType::Poa.to_string(), "poa");
        assert!("paxos".parse::<ConsensusType>().is_err());
    }

    #[test]
    fn test_only_raft_and_poa_are_implemented() {
        assert!(ConsensusType::Raft.is_implemented());
        assert!(ConsensusType::Poa.is_implemented());
        assert!(!ConsensusType::Pbft.is_implemented());
        assert!(!ConsensusType::Pos.is_implemented());
    }

    #[test]
    fn test_not_leader_error_mentions_leader() {
        let err = ConsensusError::NotLeader {
            node: "node-2".to_string(),
            leader: Some("node-1".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("Leader"));
        assert!(msg.contains("node-1"));

        let err = ConsensusError::NotLeader {
            node: "node-2".to_string(),
            leader: None,
        };
        assert!(err.to_string().contains("none"));
    }

    #[test]
    fn test_snapshot_digest_detects_tampering() {
        let mut snapshot = StateSnapshot::new(
            ConsensusType::Raft,
            vec![json!({"op": "create", "did": "did:example:1"})],
        );
        assert!(snapshot.verify().is_ok());

        snapshot.committed.push(json!({"op": "revoke"}));
        assert!(matches!(
            snapshot.verify(),
            Err(ConsensusError::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn test_snapshot_digest_depends_on_order() {
        let a = StateSnapshot::compute_digest(&[json!(1), json!(2)]);
        let b = StateSnapshot::compute_digest(&[json!(2), json!(1)]);
        assert_ne!(a, b);
    }
}
