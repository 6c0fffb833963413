// Shared fixtures for the cluster tests
#![allow(dead_code)]

use didnet_consensus::{
    CommitSink, ConsensusConfig, LocalNetwork, NodeId, PoaConfig, PoaNode, RaftConfig, RaftNode,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn fast_raft() -> RaftConfig {
    RaftConfig {
        election_timeout_min: Duration::from_millis(60),
        election_timeout_max: Duration::from_millis(120),
        heartbeat_interval: Duration::from_millis(15),
        rpc_timeout: Duration::from_millis(50),
        ..RaftConfig::default()
    }
}

pub fn fast_poa(authorities: &[&str]) -> PoaConfig {
    PoaConfig {
        block_time: Duration::from_millis(30),
        authorities: authorities.iter().map(|a| a.to_string()).collect(),
        produce_empty_blocks: false,
        proposal_timeout: Duration::from_millis(500),
        ..PoaConfig::default()
    }
}

pub fn fast_config(node_id: &str) -> ConsensusConfig {
    let mut config = ConsensusConfig::default();
    config.node_id = node_id.to_string();
    config.submit_timeout = Duration::from_secs(1);
    config.raft = fast_raft();
    config.poa = fast_poa(&[]);
    config.switcher.switch_timeout = Duration::from_secs(2);
    config.switcher.data_sync_timeout = Duration::from_millis(500);
    config.monitor.monitor_interval = Duration::from_millis(50);
    config.recovery.retry_backoff = Duration::from_millis(10);
    config
}

pub fn commit_sink() -> CommitSink {
    broadcast::channel(256).0
}

/// Every node joins before any starts so each sees the full peer set.
pub fn raft_cluster(network: &LocalNetwork, ids: &[&str]) -> Vec<Arc<RaftNode>> {
    let transports: Vec<_> = ids.iter().map(|id| network.join(*id)).collect();
    transports
        .into_iter()
        .map(|transport| RaftNode::new(fast_raft(), transport, commit_sink()))
        .collect()
}

pub fn poa_cluster(network: &LocalNetwork, ids: &[&str], sink: &CommitSink) -> Vec<Arc<PoaNode>> {
    let transports: Vec<_> = ids.iter().map(|id| network.join(*id)).collect();
    transports
        .into_iter()
        .map(|transport| PoaNode::new(fast_poa(ids), transport, sink.clone()))
        .collect()
}

/// Poll `check` until it holds or `limit` elapses.
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn ids(nodes: &[&str]) -> Vec<NodeId> {
    nodes.iter().map(|n| n.to_string()).collect()
}
