// CONSENSUS MANAGER
// Composition root: builds both protocols, the switcher, the monitor and the
// recovery manager, and exposes one surface to the rest of the node.
//
// INVARIANTS:
// 1. Every submit goes to whichever protocol the switcher has current
// 2. A submit never outlives submit_timeout
// 3. Commit notifications from both protocols arrive on one channel
// 4. Redirect errors (not leader, not an authority) are not counted as failures

use crate::config::{ConfigError, ConsensusConfig};
use crate::engine::{
    Command, CommitSink, CommittedEntry, ConsensusAlgorithm, ConsensusError, ConsensusType, NodeId,
    Peer, ProtocolHealth,
};
use crate::metrics::{MetricsRegistry, RegistrySnapshot};
use crate::monitor::{ConsensusMetrics, ConsensusMonitor, FailureEvent, ProtocolSource};
use crate::poa_engine::PoaNode;
use crate::raft_engine::RaftNode;
use crate::recovery_controller::{ProtocolRecoveryExecutor, RecoveryEvent, RecoveryManager};
use crate::switcher::{ConsensusSwitcher, SwitchError, SwitchEvent, SwitchState};
use crate::transport::Transport;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const COMMIT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Switch(#[from] SwitchError),
}

/// Node-level view returned by [`ConsensusManager::status`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStatus {
    pub node_id: NodeId,
    pub current_consensus: ConsensusType,
    pub running: bool,
    pub is_leader: bool,
    pub nodes: Vec<NodeId>,
    pub health: ProtocolHealth,
    pub switch_state: SwitchState,
    pub protocol: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub counters: RegistrySnapshot,
    pub latest: Option<ConsensusMetrics>,
    pub performance_score: Option<f64>,
    pub switches: usize,
    pub unresolved_failures: usize,
}

pub struct ConsensusManager {
    config: ConsensusConfig,
    node_id: NodeId,
    switcher: Arc<ConsensusSwitcher>,
    monitor: Arc<ConsensusMonitor>,
    commits: CommitSink,
    metrics: MetricsRegistry,
    scope: Mutex<Option<CancellationToken>>,
}

impl ConsensusManager {
    pub fn new(
        config: ConsensusConfig,
        transport: Arc<dyn Transport>,
        metrics: MetricsRegistry,
    ) -> Result<Self, ManagerError> {
        config.validate()?;
        let node_id = transport.local_id().to_string();
        if node_id != config.node_id {
            warn!(
                "configured node_id {} differs from transport id {}, using the transport id",
                config.node_id, node_id
            );
        }

        let (commits, _) = broadcast::channel(COMMIT_CHANNEL_CAPACITY);
        let raft = RaftNode::new(config.raft.clone(), transport.clone(), commits.clone());
        let poa = PoaNode::new(config.poa.clone(), transport, commits.clone());
        let switcher = Arc::new(ConsensusSwitcher::new(
            config.switcher.clone(),
            config.initial_consensus,
            raft,
            poa,
            metrics.clone(),
        )?);
        let recovery = Arc::new(RecoveryManager::new(
            config.recovery.clone(),
            Arc::new(ProtocolRecoveryExecutor::new(switcher.clone())),
            metrics.clone(),
        ));
        let monitor = Arc::new(ConsensusMonitor::new(
            config.monitor.clone(),
            switcher.clone(),
            metrics.clone(),
            recovery,
        ));

        Ok(ConsensusManager {
            config,
            node_id,
            switcher,
            monitor,
            commits,
            metrics,
            scope: Mutex::new(None),
        })
    }

    /// Start the current protocol and the background tasks under a child of `scope`.
    pub async fn start(&self, scope: &CancellationToken) -> Result<(), ManagerError> {
        let token = {
            let mut slot = self.scope.lock();
            if slot.is_some() {
                debug!("manager already running");
                return Ok(());
            }
            let token = scope.child_token();
            *slot = Some(token.clone());
            token
        };

        if let Err(e) = self.switcher.start(token.clone()).await {
            self.scope.lock().take();
            token.cancel();
            return Err(e.into());
        }
        self.monitor.start(&token);
        tokio::spawn(record_commits(
            self.commits.subscribe(),
            self.metrics.clone(),
            token.clone(),
        ));
        if self.config.switcher.enable_auto_switch {
            tokio::spawn(
                self.switcher
                    .clone()
                    .run_auto_switch(self.monitor.clone(), token.clone()),
            );
        }

        info!(
            "Consensus manager {} started with {}",
            self.node_id,
            self.switcher.current_type()
        );
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ManagerError> {
        let Some(token) = self.scope.lock().take() else {
            return Ok(());
        };
        self.monitor.stop();
        let result = self.switcher.stop().await;
        token.cancel();
        info!("Consensus manager {} stopped", self.node_id);
        result.map_err(Into::into)
    }

    pub fn is_running(&self) -> bool {
        self.scope.lock().is_some()
    }

    /// Hand a proposal to the current protocol, bounded by `submit_timeout`.
    pub async fn submit(&self, proposal: Command) -> Result<(), ConsensusError> {
        let protocol = self.switcher.current();
        match timeout(self.config.submit_timeout, protocol.submit(proposal)).await {
            Ok(Ok(())) => {
                self.metrics.record_proposal(true);
                Ok(())
            }
            Ok(Err(e)) => {
                match &e {
                    ConsensusError::NotLeader { .. } | ConsensusError::NotAuthority(_) => {
                        debug!("proposal redirected: {}", e);
                    }
                    _ => {
                        warn!("proposal failed on {}: {}", protocol.consensus_type(), e);
                        self.metrics.record_proposal(false);
                    }
                }
                Err(e)
            }
            Err(_) => {
                warn!(
                    "proposal timed out on {} after {:?}",
                    protocol.consensus_type(),
                    self.config.submit_timeout
                );
                self.metrics.record_timeout();
                Err(ConsensusError::Timeout(self.config.submit_timeout))
            }
        }
    }

    pub async fn switch_consensus(
        &self,
        target: ConsensusType,
    ) -> Result<SwitchEvent, SwitchError> {
        self.switcher.switch_to(target).await
    }

    pub fn current_consensus_type(&self) -> ConsensusType {
        self.switcher.current_type()
    }

    pub fn is_leader(&self) -> bool {
        self.switcher.current().is_leader()
    }

    pub fn status(&self) -> ManagerStatus {
        let protocol = self.switcher.current();
        ManagerStatus {
            node_id: self.node_id.clone(),
            current_consensus: protocol.consensus_type(),
            running: protocol.is_running(),
            is_leader: protocol.is_leader(),
            nodes: protocol.nodes(),
            health: protocol.health(),
            switch_state: self.switcher.state(),
            protocol: protocol.status(),
        }
    }

    pub fn metrics(&self) -> MetricsReport {
        let latest = self.monitor.latest();
        let performance_score = latest
            .as_ref()
            .map(|m| m.performance_score(self.monitor.config()));
        MetricsReport {
            counters: self.metrics.snapshot(),
            latest,
            performance_score,
            switches: self.switcher.history().len(),
            unresolved_failures: self
                .monitor
                .failure_history()
                .iter()
                .filter(|f| !f.resolved)
                .count(),
        }
    }

    pub fn failure_history(&self) -> Vec<FailureEvent> {
        self.monitor.failure_history()
    }

    pub fn recovery_history(&self) -> Vec<RecoveryEvent> {
        self.monitor.recovery_history()
    }

    pub fn switch_history(&self) -> Vec<SwitchEvent> {
        self.switcher.history()
    }

    fn protocols(&self) -> [Arc<dyn ConsensusAlgorithm>; 2] {
        let raft: Arc<dyn ConsensusAlgorithm> = self.switcher.raft().clone();
        let poa: Arc<dyn ConsensusAlgorithm> = self.switcher.poa().clone();
        [raft, poa]
    }

    /// Register a peer with both protocols so a later switch keeps the cluster.
    /// A protocol that already knows the peer is left as is; the call fails
    /// only when neither protocol took the peer.
    pub fn add_peer(&self, peer: Peer) -> Result<(), ConsensusError> {
        let mut added = false;
        for protocol in self.protocols() {
            match protocol.add_peer(peer.clone()) {
                Ok(()) => added = true,
                Err(ConsensusError::DuplicatePeer(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if added {
            Ok(())
        } else {
            Err(ConsensusError::DuplicatePeer(peer.id))
        }
    }

    /// Drop a peer from every protocol that knows it.
    pub fn remove_peer(&self, peer_id: &str) -> Result<(), ConsensusError> {
        let mut removed = false;
        for protocol in self.protocols() {
            match protocol.remove_peer(peer_id) {
                Ok(()) => removed = true,
                Err(ConsensusError::UnknownPeer(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if removed {
            Ok(())
        } else {
            Err(ConsensusError::UnknownPeer(peer_id.to_string()))
        }
    }

    pub fn add_authority(&self, id: &str) -> Result<(), ConsensusError> {
        self.switcher.poa().add_authority(id)
    }

    pub fn remove_authority(&self, id: &str) -> Result<(), ConsensusError> {
        self.switcher.poa().remove_authority(id)
    }

    /// Accepted-proposal notifications from whichever protocol commits them.
    pub fn subscribe_commits(&self) -> broadcast::Receiver<CommittedEntry> {
        self.commits.subscribe()
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn switcher(&self) -> &Arc<ConsensusSwitcher> {
        &self.switcher
    }

    pub fn monitor(&self) -> &Arc<ConsensusMonitor> {
        &self.monitor
    }
}

async fn record_commits(
    mut commits: broadcast::Receiver<CommittedEntry>,
    metrics: MetricsRegistry,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            received = commits.recv() => match received {
                Ok(entry) => metrics.record_commit(entry.latency),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("commit metrics lagged by {} entries", skipped)
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}
