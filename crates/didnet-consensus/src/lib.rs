pub mod config;
pub mod engine;
pub mod manager;
pub mod message;
pub mod metrics;
pub mod monitor;
pub mod poa_engine;
pub mod raft_engine;
pub mod recovery_controller;
pub mod switcher;
pub mod transport;

pub use config::{
    ConfigError, ConsensusConfig, MonitorConfig, PoaConfig, RaftConfig, RecoveryConfig,
    SwitchStrategy, SwitcherConfig,
};
pub use engine::{
    Command, CommitSink, CommittedEntry, ConsensusAlgorithm, ConsensusError, ConsensusType, NodeId,
    Peer, ProtocolHealth, StateSnapshot,
};
pub use manager::{ConsensusManager, ManagerError, ManagerStatus, MetricsReport};
pub use message::ConsensusMessage;
pub use metrics::{MetricsRegistry, RegistrySnapshot};
pub use monitor::{
    ConsensusMetrics, ConsensusMonitor, FailureEvent, FailureSeverity, FailureType, ProtocolSource,
};
pub use poa_engine::{PoaBlock, PoaNode, PoaProposal, PoaStatus, ProposalStatus};
pub use raft_engine::{LogEntry, RaftNode, RaftRole, RaftStatus};
pub use recovery_controller::{
    ProtocolRecoveryExecutor, RecoveryError, RecoveryEvent, RecoveryExecutor, RecoveryManager,
    RecoveryStatus, RecoveryStrategy,
};
pub use switcher::{
    ConsensusSwitcher, SnapshotSync, StateSync, SwitchError, SwitchEvent, SwitchStage, SwitchState,
};
pub use transport::{
    LocalNetwork, LocalTransport, MessageHandler, PeerInfo, Transport, TransportError,
};
