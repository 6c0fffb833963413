// CONSENSUS HEALTH MONITOR
// Samples protocol health, classifies failures and drives recovery
//
// INVARIANTS:
// 1. The monitor owns no protocol state; it reads the current protocol through ProtocolSource
// 2. At most one unresolved failure per failure type
// 3. A failure is resolved only by a completed recovery
// 4. Metrics history is bounded by history_size

use crate::config::MonitorConfig;
use crate::engine::{ConsensusAlgorithm, ConsensusType};
use crate::metrics::{MetricsRegistry, RegistrySnapshot};
use crate::recovery_controller::{RecoveryEvent, RecoveryManager, RecoveryStatus};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

const MAX_FAILURE_LOG: usize = 1024;

/// Gives the monitor the protocol that is current right now.
pub trait ProtocolSource: Send + Sync {
    fn current(&self) -> Arc<dyn ConsensusAlgorithm>;
}

/// One health sample of the current protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusMetrics {
    pub timestamp: DateTime<Utc>,
    pub consensus_type: ConsensusType,
    /// Mean commit latency in the sample window; 0 when nothing committed.
    pub latency_ms: f64,
    /// Commits per second in the sample window.
    pub throughput: f64,
    pub success_rate: f64,
    pub active_nodes: usize,
    pub total_nodes: usize,
    pub proposals: u64,
    pub failed_proposals: u64,
    pub has_leader: bool,
    pub running: bool,
    pub integrity_ok: bool,
    pub consecutive_failures: u64,
    /// Consecutive samples without a known leader.
    pub leaderless_streak: u32,
}

impl ConsensusMetrics {
    /// Weighted score in [0, 1]: latency 0.4, throughput 0.3, success rate 0.3.
    pub fn performance_score(&self, config: &MonitorConfig) -> f64 {
        if !self.running {
            return 0.0;
        }
        let max_latency_ms = config.max_latency.as_secs_f64() * 1000.0;
        let latency_score = if self.latency_ms <= 0.0 {
            1.0
        } else {
            (max_latency_ms / self.latency_ms).min(1.0)
        };
        let throughput_score = if self.proposals == 0 || config.min_throughput <= 0.0 {
            1.0
        } else {
            (self.throughput / config.min_throughput).min(1.0)
        };
        0.4 * latency_score + 0.3 * throughput_score + 0.3 * self.success_rate.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureType {
    Latency,
    Throughput,
    NetworkPartition,
    LeaderElection,
    ConsensusTimeout,
    NodeFailure,
    DataCorruption,
}

impl FailureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureType::Latency => "latency",
            FailureType::Throughput => "throughput",
            FailureType::NetworkPartition => "network_partition",
            FailureType::LeaderElection => "leader_election",
            FailureType::ConsensusTimeout => "consensus_timeout",
            FailureType::NodeFailure => "node_failure",
            FailureType::DataCorruption => "data_corruption",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FailureSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEvent {
    pub id: String,
    pub failure_type: FailureType,
    pub severity: FailureSeverity,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    pub consensus_type: ConsensusType,
}

impl FailureEvent {
    pub fn new(
        id: impl Into<String>,
        failure_type: FailureType,
        severity: FailureSeverity,
        description: String,
        consensus_type: ConsensusType,
    ) -> Self {
        FailureEvent {
            id: id.into(),
            failure_type,
            severity,
            description,
            timestamp: Utc::now(),
            resolved: false,
            consensus_type,
        }
    }
}

/// Classify a sample against the thresholds. Pure; no deduplication.
pub fn classify(
    metrics: &ConsensusMetrics,
    config: &MonitorConfig,
) -> Vec<(FailureType, FailureSeverity, String)> {
    let mut found = Vec::new();
    let protocol = metrics.consensus_type;

    if !metrics.integrity_ok {
        found.push((
            FailureType::DataCorruption,
            FailureSeverity::Critical,
            format!("{} state failed its integrity check", protocol),
        ));
    }
    if !metrics.running {
        let severity = if metrics.integrity_ok {
            FailureSeverity::High
        } else {
            FailureSeverity::Critical
        };
        found.push((
            FailureType::NodeFailure,
            severity,
            format!("{} protocol is not running", protocol),
        ));
        return found;
    }

    if metrics.total_nodes > 1 && metrics.active_nodes * 2 <= metrics.total_nodes {
        found.push((
            FailureType::NetworkPartition,
            FailureSeverity::High,
            format!(
                "only {} of {} nodes reachable",
                metrics.active_nodes, metrics.total_nodes
            ),
        ));
    }
    if metrics.leaderless_streak >= config.max_consecutive_failures {
        found.push((
            FailureType::LeaderElection,
            FailureSeverity::High,
            format!("no {} leader for {} samples", protocol, metrics.leaderless_streak),
        ));
    }

    let max_latency_ms = config.max_latency.as_secs_f64() * 1000.0;
    if metrics.latency_ms > max_latency_ms {
        let severity = if metrics.latency_ms > 2.0 * max_latency_ms {
            FailureSeverity::High
        } else {
            FailureSeverity::Medium
        };
        found.push((
            FailureType::Latency,
            severity,
            format!("commit latency {:.1}ms exceeds {:.1}ms", metrics.latency_ms, max_latency_ms),
        ));
    }
    if metrics.proposals > 0 && metrics.throughput < config.min_throughput {
        found.push((
            FailureType::Throughput,
            FailureSeverity::Low,
            format!(
                "throughput {:.2}/s below {:.2}/s",
                metrics.throughput, config.min_throughput
            ),
        ));
    }

    let failure_rate = 1.0 - metrics.success_rate;
    if metrics.consecutive_failures >= u64::from(config.max_consecutive_failures)
        || (metrics.proposals > 0 && failure_rate > config.max_failure_rate)
    {
        found.push((
            FailureType::ConsensusTimeout,
            FailureSeverity::High,
            format!(
                "{} consecutive failed proposals, failure rate {:.0}%",
                metrics.consecutive_failures,
                failure_rate * 100.0
            ),
        ));
    }
    found
}

struct MonitorState {
    history: VecDeque<ConsensusMetrics>,
    failures: Vec<FailureEvent>,
    last_sample: (Instant, RegistrySnapshot),
    last_evaluated: Option<DateTime<Utc>>,
    leaderless_streak: u32,
    /// Failure ids are numbered per monitor, starting at 1.
    next_failure_id: u64,
}

/// Health monitor over whichever protocol is current.
pub struct ConsensusMonitor {
    config: MonitorConfig,
    source: Arc<dyn ProtocolSource>,
    metrics: MetricsRegistry,
    recovery: Arc<RecoveryManager>,
    state: RwLock<MonitorState>,
    scope: Mutex<Option<CancellationToken>>,
}

impl ConsensusMonitor {
    pub fn new(
        config: MonitorConfig,
        source: Arc<dyn ProtocolSource>,
        metrics: MetricsRegistry,
        recovery: Arc<RecoveryManager>,
    ) -> Self {
        let baseline = (Instant::now(), metrics.snapshot());
        ConsensusMonitor {
            config,
            source,
            metrics,
            recovery,
            state: RwLock::new(MonitorState {
                history: VecDeque::new(),
                failures: Vec::new(),
                last_sample: baseline,
                last_evaluated: None,
                leaderless_streak: 0,
                next_failure_id: 1,
            }),
            scope: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Take a sample covering the window since the previous one and append
    /// it to the history.
    pub fn sample_metrics(&self) -> ConsensusMetrics {
        let protocol = self.source.current();
        let health = protocol.health();
        let snapshot = self.metrics.snapshot();
        let now = Instant::now();

        let mut state = self.state.write();
        let (prev_at, prev) = state.last_sample;
        state.last_sample = (now, snapshot);

        let proposals = snapshot.proposals_total.saturating_sub(prev.proposals_total);
        let failed = snapshot.proposals_failed.saturating_sub(prev.proposals_failed);
        let commits = snapshot.commits_total.saturating_sub(prev.commits_total);
        let latency_samples = snapshot
            .commit_latency_samples
            .saturating_sub(prev.commit_latency_samples);
        let latency_us = snapshot
            .commit_latency_us_sum
            .saturating_sub(prev.commit_latency_us_sum);
        let elapsed = now.duration_since(prev_at).max(Duration::from_millis(1));

        state.leaderless_streak = if health.running && !health.has_leader {
            state.leaderless_streak + 1
        } else {
            0
        };

        let metrics = ConsensusMetrics {
            timestamp: Utc::now(),
            consensus_type: protocol.consensus_type(),
            latency_ms: if latency_samples > 0 {
                latency_us as f64 / latency_samples as f64 / 1000.0
            } else {
                0.0
            },
            throughput: commits as f64 / elapsed.as_secs_f64(),
            success_rate: if proposals > 0 {
                (proposals - failed.min(proposals)) as f64 / proposals as f64
            } else {
                1.0
            },
            active_nodes: health.active_peers + 1,
            total_nodes: health.total_peers + 1,
            proposals,
            failed_proposals: failed,
            has_leader: health.has_leader,
            running: health.running,
            integrity_ok: health.integrity_ok,
            consecutive_failures: snapshot.consecutive_failures,
            leaderless_streak: state.leaderless_streak,
        };

        state.history.push_back(metrics.clone());
        while state.history.len() > self.config.history_size {
            state.history.pop_front();
        }
        debug!(
            "sampled {}: latency {:.1}ms, throughput {:.2}/s, success {:.2}, nodes {}/{}",
            metrics.consensus_type,
            metrics.latency_ms,
            metrics.throughput,
            metrics.success_rate,
            metrics.active_nodes,
            metrics.total_nodes
        );
        metrics
    }

    /// Classify a sample and record the failures not already open.
    pub fn detect_failures(&self, metrics: &ConsensusMetrics) -> Vec<FailureEvent> {
        let mut state = self.state.write();
        state.last_evaluated = Some(metrics.timestamp);
        let mut opened = Vec::new();
        for (failure_type, severity, description) in classify(metrics, &self.config) {
            let open = state
                .failures
                .iter()
                .any(|f| !f.resolved && f.failure_type == failure_type);
            if open {
                continue;
            }
            let id = format!("failure-{}", state.next_failure_id);
            state.next_failure_id += 1;
            let failure =
                FailureEvent::new(id, failure_type, severity, description, metrics.consensus_type);
            warn!(
                "Detected {:?} {} failure {}: {}",
                severity,
                failure_type.as_str(),
                failure.id,
                failure.description
            );
            self.metrics.record_failure_detected();
            state.failures.push(failure.clone());
            opened.push(failure);
        }
        if state.failures.len() > MAX_FAILURE_LOG {
            let excess = state.failures.len() - MAX_FAILURE_LOG;
            let mut dropped = 0;
            state.failures.retain(|f| {
                if dropped < excess && f.resolved {
                    dropped += 1;
                    false
                } else {
                    true
                }
            });
        }
        opened
    }

    /// Run recovery for `failure` and resolve it when the recovery completes.
    pub async fn handle_failure(&self, failure: &FailureEvent) -> RecoveryEvent {
        let event = self.recovery.recover(failure).await;
        if event.status == RecoveryStatus::Completed {
            self.resolve(&failure.id);
        }
        event
    }

    fn resolve(&self, failure_id: &str) {
        let mut state = self.state.write();
        if let Some(failure) = state.failures.iter_mut().find(|f| f.id == failure_id) {
            failure.resolved = true;
            info!("Failure {} resolved", failure_id);
        }
        state.leaderless_streak = 0;
        self.metrics.reset_consecutive_failures();
    }

    /// Sample, detect and recover in one pass.
    pub async fn run_cycle(&self) -> Vec<RecoveryEvent> {
        let metrics = self.sample_metrics();
        let mut recoveries = Vec::new();
        for failure in self.detect_failures(&metrics) {
            recoveries.push(self.handle_failure(&failure).await);
        }
        recoveries
    }

    pub fn latest(&self) -> Option<ConsensusMetrics> {
        self.state.read().history.back().cloned()
    }

    pub fn history(&self) -> Vec<ConsensusMetrics> {
        self.state.read().history.iter().cloned().collect()
    }

    pub fn failure_history(&self) -> Vec<FailureEvent> {
        self.state.read().failures.clone()
    }

    pub fn recovery_history(&self) -> Vec<RecoveryEvent> {
        self.recovery.history()
    }

    /// Spawn the metrics, detection and recovery loops under a child of `scope`.
    pub fn start(self: &Arc<Self>, scope: &CancellationToken) {
        let token = {
            let mut slot = self.scope.lock();
            if slot.is_some() {
                debug!("monitor already running");
                return;
            }
            let token = scope.child_token();
            *slot = Some(token.clone());
            token
        };
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(self.clone().metrics_loop(token.clone()));
        tokio::spawn(self.clone().detection_loop(token.clone(), tx));
        tokio::spawn(self.clone().recovery_loop(token, rx));
        info!(
            "Consensus monitor started (interval {:?})",
            self.config.monitor_interval
        );
    }

    pub fn stop(&self) {
        if let Some(token) = self.scope.lock().take() {
            token.cancel();
            info!("Consensus monitor stopped");
        }
    }

    async fn metrics_loop(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = interval(self.config.monitor_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.sample_metrics();
                }
            }
        }
    }

    async fn detection_loop(
        self: Arc<Self>,
        token: CancellationToken,
        tx: mpsc::UnboundedSender<FailureEvent>,
    ) {
        let period = (self.config.monitor_interval / 2).max(Duration::from_millis(1));
        let mut ticker = interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let fresh = {
                        let state = self.state.read();
                        match state.history.back() {
                            Some(latest) if state.last_evaluated != Some(latest.timestamp) => {
                                Some(latest.clone())
                            }
                            _ => None,
                        }
                    };
                    if let Some(latest) = fresh {
                        for failure in self.detect_failures(&latest) {
                            if tx.send(failure).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn recovery_loop(
        self: Arc<Self>,
        token: CancellationToken,
        mut rx: mpsc::UnboundedReceiver<FailureEvent>,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                next = rx.recv() => match next {
                    Some(failure) => {
                        self.handle_failure(&failure).await;
                    }
                    None => break,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecoveryConfig;
    use crate::engine::{Command, ConsensusError, Peer, ProtocolHealth, StateSnapshot};
    use crate::recovery_controller::{RecoveryError, RecoveryExecutor, RecoveryStrategy};
    use async_trait::async_trait;

    struct FakeProtocol {
        health: RwLock<ProtocolHealth>,
    }

    #[async_trait]
    impl ConsensusAlgorithm for FakeProtocol {
        fn consensus_type(&self) -> ConsensusType {
            ConsensusType::Raft
        }
        fn node_id(&self) -> &str {
            "fake"
        }
        async fn start(&self, _: CancellationToken) -> Result<(), ConsensusError> {
            Ok(())
        }
        async fn stop(&self) -> Result<(), ConsensusError> {
            Ok(())
        }
        async fn submit(&self, _: Command) -> Result<(), ConsensusError> {
            Ok(())
        }
        fn status(&self) -> serde_json::Map<String, serde_json::Value> {
            serde_json::Map::new()
        }
        fn nodes(&self) -> Vec<String> {
            vec!["fake".to_string()]
        }
        fn is_running(&self) -> bool {
            self.health.read().running
        }
        fn is_leader(&self) -> bool {
            true
        }
        fn add_peer(&self, _: Peer) -> Result<(), ConsensusError> {
            Ok(())
        }
        fn remove_peer(&self, _: &str) -> Result<(), ConsensusError> {
            Ok(())
        }
        fn health(&self) -> ProtocolHealth {
            *self.health.read()
        }
        fn snapshot(&self) -> StateSnapshot {
            StateSnapshot::new(ConsensusType::Raft, Vec::new())
        }
        fn restore(&self, _: &StateSnapshot) -> Result<usize, ConsensusError> {
            Ok(0)
        }
        fn refresh_peers(&self) -> usize {
            0
        }
    }

    struct FixedSource(Arc<FakeProtocol>);

    impl ProtocolSource for FixedSource {
        fn current(&self) -> Arc<dyn ConsensusAlgorithm> {
            self.0.clone()
        }
    }

    struct AlwaysOk;

    #[async_trait]
    impl RecoveryExecutor for AlwaysOk {
        async fn execute(
            &self,
            _: RecoveryStrategy,
            _: &FailureEvent,
        ) -> Result<(), RecoveryError> {
            Ok(())
        }
    }

    fn healthy() -> ProtocolHealth {
        ProtocolHealth {
            running: true,
            has_leader: true,
            active_peers: 2,
            total_peers: 2,
            integrity_ok: true,
            pending: 0,
        }
    }

    fn monitor(health: ProtocolHealth) -> (ConsensusMonitor, Arc<FakeProtocol>, MetricsRegistry) {
        let protocol = Arc::new(FakeProtocol {
            health: RwLock::new(health),
        });
        let metrics = MetricsRegistry::new();
        let recovery = Arc::new(RecoveryManager::new(
            RecoveryConfig::default(),
            Arc::new(AlwaysOk),
            metrics.clone(),
        ));
        let config = MonitorConfig {
            max_consecutive_failures: 2,
            ..MonitorConfig::default()
        };
        let monitor = ConsensusMonitor::new(
            config,
            Arc::new(FixedSource(protocol.clone())),
            metrics.clone(),
            recovery,
        );
        (monitor, protocol, metrics)
    }

    fn types(failures: &[FailureEvent]) -> Vec<FailureType> {
        failures.iter().map(|f| f.failure_type).collect()
    }

    #[test]
    fn test_healthy_sample_has_no_failures() {
        let (monitor, _, _) = monitor(healthy());
        let sample = monitor.sample_metrics();
        assert_eq!(sample.active_nodes, 3);
        assert_eq!(sample.success_rate, 1.0);
        assert!(monitor.detect_failures(&sample).is_empty());
        assert!((sample.performance_score(monitor.config()) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_partition_and_integrity_failures() {
        let (monitor, _, _) = monitor(ProtocolHealth {
            active_peers: 0,
            integrity_ok: false,
            ..healthy()
        });
        let sample = monitor.sample_metrics();
        let failures = monitor.detect_failures(&sample);
        assert_eq!(
            types(&failures),
            vec![FailureType::DataCorruption, FailureType::NetworkPartition]
        );
        assert_eq!(failures[0].severity, FailureSeverity::Critical);
    }

    #[test]
    fn test_stopped_protocol_is_node_failure() {
        let (monitor, _, _) = monitor(ProtocolHealth {
            running: false,
            ..healthy()
        });
        let sample = monitor.sample_metrics();
        assert_eq!(sample.performance_score(monitor.config()), 0.0);
        let failures = monitor.detect_failures(&sample);
        assert_eq!(types(&failures), vec![FailureType::NodeFailure]);
        assert_eq!(failures[0].severity, FailureSeverity::High);
    }

    #[test]
    fn test_leaderless_streak_and_dedup() {
        let (monitor, _, _) = monitor(ProtocolHealth {
            has_leader: false,
            ..healthy()
        });
        let first = monitor.sample_metrics();
        assert!(monitor.detect_failures(&first).is_empty());
        let second = monitor.sample_metrics();
        assert_eq!(second.leaderless_streak, 2);
        assert_eq!(types(&monitor.detect_failures(&second)), vec![FailureType::LeaderElection]);

        // still open, so not reported twice
        let third = monitor.sample_metrics();
        assert!(monitor.detect_failures(&third).is_empty());
        assert_eq!(monitor.failure_history().len(), 1);
    }

    #[test]
    fn test_failure_ids_are_numbered_per_monitor() {
        let broken = ProtocolHealth {
            active_peers: 0,
            integrity_ok: false,
            ..healthy()
        };
        for _ in 0..2 {
            let (monitor, _, _) = monitor(broken);
            let sample = monitor.sample_metrics();
            let ids: Vec<String> =
                monitor.detect_failures(&sample).into_iter().map(|f| f.id).collect();
            assert_eq!(ids, vec!["failure-1".to_string(), "failure-2".to_string()]);
        }
    }

    #[test]
    fn test_consecutive_failures_trigger_consensus_timeout() {
        let (monitor, _, metrics) = monitor(healthy());
        metrics.record_proposal(false);
        metrics.record_proposal(false);
        let sample = monitor.sample_metrics();
        assert_eq!(sample.success_rate, 0.0);
        let failures = monitor.detect_failures(&sample);
        assert!(types(&failures).contains(&FailureType::ConsensusTimeout));
    }

    #[tokio::test]
    async fn test_completed_recovery_resolves_failure() {
        let (monitor, protocol, metrics) = monitor(ProtocolHealth {
            running: false,
            ..healthy()
        });
        metrics.record_proposal(false);

        let recoveries = monitor.run_cycle().await;
        assert_eq!(recoveries.len(), 1);
        assert_eq!(recoveries[0].status, RecoveryStatus::Completed);
        assert!(monitor.failure_history().iter().all(|f| f.resolved));
        assert_eq!(metrics.snapshot().consecutive_failures, 0);
        assert_eq!(monitor.recovery_history().len(), 1);

        *protocol.health.write() = healthy();
        assert!(monitor.run_cycle().await.is_empty());
    }
}
