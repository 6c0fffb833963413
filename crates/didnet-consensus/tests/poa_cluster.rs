// POA CLUSTER TESTS
// Authority rotation, voting and finality across an in-process network

mod common;

use common::{commit_sink, ids, init_logging, poa_cluster, wait_until};
use didnet_consensus::{ConsensusAlgorithm, ConsensusError, ConsensusType, LocalNetwork, PoaNode};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn start_all(nodes: &[Arc<PoaNode>], scope: &CancellationToken) {
    for node in nodes {
        node.start(scope.clone()).await.unwrap();
    }
}

#[tokio::test]
async fn test_authorities_rotate_round_robin() {
    init_logging();
    let network = LocalNetwork::new();
    let nodes = poa_cluster(&network, &["c", "a", "b"], &commit_sink());

    let node = &nodes[0];
    assert_eq!(node.authorities(), ids(&["a", "b", "c"]));
    let proposers: Vec<_> = (0..6).filter_map(|h| node.next_proposer(h)).collect();
    assert_eq!(proposers, ids(&["a", "b", "c", "a", "b", "c"]));
    assert!(node.validate_proposer("b", 4));
    assert!(!node.validate_proposer("a", 4));
}

#[tokio::test]
async fn test_submitted_command_finalizes_on_every_authority() {
    init_logging();
    let network = LocalNetwork::new();
    let sink = commit_sink();
    let mut commits = sink.subscribe();
    let nodes = poa_cluster(&network, &["a", "b", "c"], &sink);
    let scope = CancellationToken::new();
    start_all(&nodes, &scope).await;

    nodes[1]
        .submit(json!({"op": "register", "did": "did:example:bob"}))
        .await
        .unwrap();

    let entry = tokio::time::timeout(Duration::from_secs(2), commits.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.consensus, ConsensusType::Poa);
    assert_eq!(entry.command["did"], "did:example:bob");

    let finalized =
        wait_until(Duration::from_secs(2), || nodes.iter().all(|n| n.height() == 1)).await;
    assert!(finalized, "block never reached height 1 everywhere");
    let head = nodes[0].head();
    for node in &nodes {
        assert_eq!(node.head(), head);
        assert!(node.head().verify());
    }
    assert_eq!(head.proposer, "b");
    scope.cancel();
}

#[tokio::test]
async fn test_two_of_three_authorities_reach_threshold() {
    init_logging();
    let network = LocalNetwork::new();
    let nodes = poa_cluster(&network, &["a", "b", "c"], &commit_sink());
    let scope = CancellationToken::new();
    start_all(&nodes, &scope).await;

    network.disconnect("c");
    nodes[0].submit(json!({"op": "update"})).await.unwrap();

    let finalized = wait_until(Duration::from_secs(2), || {
        nodes[0].height() == 1 && nodes[1].height() == 1
    })
    .await;
    assert!(finalized);
    assert_eq!(nodes[2].height(), 0);
    scope.cancel();
}

#[tokio::test]
async fn test_lone_authority_cannot_finalize() {
    init_logging();
    let network = LocalNetwork::new();
    let nodes = poa_cluster(&network, &["a", "b", "c"], &commit_sink());
    let scope = CancellationToken::new();
    start_all(&nodes, &scope).await;

    network.disconnect("b");
    network.disconnect("c");
    nodes[0].submit(json!({"op": "orphan"})).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(nodes[0].height(), 0);

    // the rejected command is queued again and finalizes once peers return
    network.reconnect("b");
    network.reconnect("c");
    let recovered =
        wait_until(Duration::from_secs(4), || nodes.iter().all(|n| n.height() >= 1)).await;
    assert!(recovered);
    assert_eq!(nodes[0].chain()[1].data, Some(json!({"op": "orphan"})));
    scope.cancel();
}

#[tokio::test]
async fn test_non_authority_cannot_submit() {
    init_logging();
    let network = LocalNetwork::new();
    let sink = commit_sink();
    let mut nodes = poa_cluster(&network, &["a", "b"], &sink);
    let observer = PoaNode::new(common::fast_poa(&["a", "b"]), network.join("observer"), sink);
    nodes.push(observer.clone());
    let scope = CancellationToken::new();
    start_all(&nodes, &scope).await;

    assert!(!observer.is_authority("observer"));
    let err = observer.submit(json!({"op": "noop"})).await.unwrap_err();
    assert_eq!(err, ConsensusError::NotAuthority("observer".to_string()));
    scope.cancel();
}
