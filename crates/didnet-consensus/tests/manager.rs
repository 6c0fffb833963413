// MANAGER TESTS
// End-to-end behavior through the public facade

mod common;

use common::{fast_config, init_logging, wait_until};
use didnet_consensus::{
    ConsensusAlgorithm, ConsensusError, ConsensusManager, ConsensusType, FailureType, LocalNetwork,
    MetricsRegistry, RecoveryStatus,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn cluster(network: &LocalNetwork, ids: &[&str]) -> Vec<Arc<ConsensusManager>> {
    let transports: Vec<_> = ids.iter().map(|id| network.join(*id)).collect();
    transports
        .into_iter()
        .zip(ids)
        .map(|(transport, id)| {
            let mut config = fast_config(id);
            config.poa.authorities = ids.iter().map(|a| a.to_string()).collect();
            Arc::new(ConsensusManager::new(config, transport, MetricsRegistry::new()).unwrap())
        })
        .collect()
}

#[tokio::test]
async fn test_cluster_commits_reach_every_subscriber() {
    init_logging();
    let network = LocalNetwork::new();
    let managers = cluster(&network, &["m1", "m2", "m3"]);
    let mut receivers: Vec<_> = managers.iter().map(|m| m.subscribe_commits()).collect();
    let scope = CancellationToken::new();
    for manager in &managers {
        manager.start(&scope).await.unwrap();
    }

    let elected = wait_until(Duration::from_secs(3), || {
        managers.iter().filter(|m| m.is_leader()).count() == 1
    })
    .await;
    assert!(elected);
    let leader = managers.iter().find(|m| m.is_leader()).unwrap();
    let follower = managers.iter().find(|m| !m.is_leader()).unwrap();

    let err = follower.submit(json!({"op": "noop"})).await.unwrap_err();
    assert!(matches!(err, ConsensusError::NotLeader { .. }));
    assert_eq!(follower.metrics().counters.proposals_failed, 0);

    leader
        .submit(json!({"op": "register", "did": "did:example:carol"}))
        .await
        .unwrap();
    for receiver in &mut receivers {
        let entry = tokio::time::timeout(Duration::from_secs(2), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.consensus, ConsensusType::Raft);
        assert_eq!(entry.index, 1);
        assert_eq!(entry.command["did"], "did:example:carol");
    }

    let status = leader.status();
    assert!(status.is_leader);
    assert_eq!(status.nodes.len(), 3);
    assert_eq!(status.health.total_peers, 2);
    let encoded = serde_json::to_value(&status).unwrap();
    assert_eq!(encoded["currentConsensus"], "raft");
    assert_eq!(encoded["protocol"]["commitIndex"], 1);
    scope.cancel();
}

#[tokio::test]
async fn test_monitor_samples_after_start() {
    init_logging();
    let network = LocalNetwork::new();
    let manager =
        ConsensusManager::new(fast_config("solo"), network.join("solo"), MetricsRegistry::new())
            .unwrap();
    manager.start(&CancellationToken::new()).await.unwrap();

    assert!(wait_until(Duration::from_secs(2), || manager.is_leader()).await);
    manager.submit(json!({"op": "create"})).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || manager.metrics().latest.is_some()).await);

    let report = manager.metrics();
    assert_eq!(report.counters.proposals_total, 1);
    assert!(report.performance_score.is_some());
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_stopped_protocol_is_detected_and_restarted() {
    init_logging();
    let network = LocalNetwork::new();
    let manager =
        ConsensusManager::new(fast_config("solo"), network.join("solo"), MetricsRegistry::new())
            .unwrap();
    manager.start(&CancellationToken::new()).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || manager.is_leader()).await);

    let raft = manager.switcher().raft().clone();
    raft.stop().await.unwrap();

    let healed = wait_until(Duration::from_secs(3), || {
        raft.is_running()
            && manager
                .recovery_history()
                .iter()
                .any(|r| r.status == RecoveryStatus::Completed)
    })
    .await;
    assert!(healed, "stopped protocol was never restarted");

    let failures = manager.failure_history();
    let failure = failures
        .iter()
        .find(|f| f.failure_type == FailureType::NodeFailure)
        .unwrap();
    assert!(failure.resolved);
    assert!(wait_until(Duration::from_secs(2), || manager.is_leader()).await);
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_switch_then_submit_on_poa() {
    init_logging();
    let network = LocalNetwork::new();
    let manager =
        ConsensusManager::new(fast_config("solo"), network.join("solo"), MetricsRegistry::new())
            .unwrap();
    let mut commits = manager.subscribe_commits();
    manager.start(&CancellationToken::new()).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || manager.is_leader()).await);

    manager.switch_consensus(ConsensusType::Poa).await.unwrap();
    assert_eq!(manager.current_consensus_type(), ConsensusType::Poa);
    manager.submit(json!({"op": "revoke"})).await.unwrap();

    let entry = tokio::time::timeout(Duration::from_secs(2), commits.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.consensus, ConsensusType::Poa);
    assert_eq!(entry.command["op"], "revoke");
    assert!(manager.is_leader());
    manager.stop().await.unwrap();
}
