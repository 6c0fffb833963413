// RECOVERY CONTROLLER
// Executes recovery actions for detected consensus failures
//
// INVARIANTS:
// 1. Strategy selection is deterministic (same failure type and severity, same strategy)
// 2. Every attempt is bounded by recovery_timeout
// 3. At most max_recovery_attempts attempts per failure
// 4. ManualIntervention is never retried; it is flagged for an operator
// 5. Every recovery ends in the log as Completed or Failed

use crate::config::RecoveryConfig;
use crate::metrics::MetricsRegistry;
use crate::monitor::{FailureEvent, FailureSeverity, FailureType, ProtocolSource};
use crate::switcher::{ConsensusSwitcher, SwitchError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecoveryStrategy {
    Restart,
    LeaderElection,
    NetworkRepair,
    DataSync,
    Rollback,
    ManualIntervention,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::Restart => "restart",
            RecoveryStrategy::LeaderElection => "leader_election",
            RecoveryStrategy::NetworkRepair => "network_repair",
            RecoveryStrategy::DataSync => "data_sync",
            RecoveryStrategy::Rollback => "rollback",
            RecoveryStrategy::ManualIntervention => "manual_intervention",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// One recovery run, created for exactly one failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryEvent {
    pub id: String,
    pub failure_id: String,
    pub strategy: RecoveryStrategy,
    pub status: RecoveryStatus,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("Recovery action failed: {0}")]
    ActionFailed(String),

    #[error("Recovery attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operator intervention required: {0}")]
    ManualInterventionRequired(String),
}

impl From<SwitchError> for RecoveryError {
    fn from(e: SwitchError) -> Self {
        RecoveryError::ActionFailed(e.to_string())
    }
}

/// Map a failure to its recovery strategy.
pub fn select_strategy(failure_type: FailureType, severity: FailureSeverity) -> RecoveryStrategy {
    match failure_type {
        FailureType::Latency | FailureType::Throughput => RecoveryStrategy::Restart,
        FailureType::LeaderElection => RecoveryStrategy::LeaderElection,
        FailureType::NetworkPartition => RecoveryStrategy::NetworkRepair,
        FailureType::DataCorruption => RecoveryStrategy::DataSync,
        FailureType::NodeFailure if severity == FailureSeverity::Critical => {
            RecoveryStrategy::ManualIntervention
        }
        FailureType::NodeFailure => RecoveryStrategy::Restart,
        FailureType::ConsensusTimeout => RecoveryStrategy::Rollback,
    }
}

/// Carries out one attempt of a strategy.
#[async_trait]
pub trait RecoveryExecutor: Send + Sync {
    async fn execute(
        &self,
        strategy: RecoveryStrategy,
        failure: &FailureEvent,
    ) -> Result<(), RecoveryError>;
}

/// Executes strategies against whichever protocol the switcher has current.
pub struct ProtocolRecoveryExecutor {
    switcher: Arc<ConsensusSwitcher>,
}

impl ProtocolRecoveryExecutor {
    pub fn new(switcher: Arc<ConsensusSwitcher>) -> Self {
        ProtocolRecoveryExecutor { switcher }
    }
}

#[async_trait]
impl RecoveryExecutor for ProtocolRecoveryExecutor {
    async fn execute(
        &self,
        strategy: RecoveryStrategy,
        failure: &FailureEvent,
    ) -> Result<(), RecoveryError> {
        match strategy {
            RecoveryStrategy::Restart => {
                self.switcher.restart_current().await?;
            }
            RecoveryStrategy::LeaderElection => {
                self.switcher
                    .current()
                    .trigger_election()
                    .await
                    .map_err(|e| RecoveryError::ActionFailed(e.to_string()))?;
            }
            RecoveryStrategy::NetworkRepair => {
                let protocol = self.switcher.current();
                let added = protocol.refresh_peers();
                let health = protocol.health();
                if health.total_peers > 0
                    && (health.active_peers + 1) * 2 <= health.total_peers + 1
                {
                    return Err(RecoveryError::ActionFailed(format!(
                        "{} of {} peers still unreachable",
                        health.total_peers - health.active_peers,
                        health.total_peers
                    )));
                }
                info!("network repair: {} peers discovered, {} active", added, health.active_peers);
            }
            RecoveryStrategy::DataSync => {
                self.switcher.restore_latest_backup()?;
            }
            RecoveryStrategy::Rollback => match self.switcher.rollback_to_previous().await {
                Err(SwitchError::NoPrevious) => {
                    warn!("no previous protocol to roll back to, restarting current instead");
                    self.switcher.restart_current().await?;
                }
                other => {
                    other?;
                }
            },
            RecoveryStrategy::ManualIntervention => {
                return Err(RecoveryError::ManualInterventionRequired(failure.description.clone()));
            }
        }
        Ok(())
    }
}

/// Runs bounded recovery attempts and keeps the recovery log.
pub struct RecoveryManager {
    config: RecoveryConfig,
    executor: Arc<dyn RecoveryExecutor>,
    metrics: MetricsRegistry,
    history: RwLock<Vec<RecoveryEvent>>,
}

impl RecoveryManager {
    pub fn new(
        config: RecoveryConfig,
        executor: Arc<dyn RecoveryExecutor>,
        metrics: MetricsRegistry,
    ) -> Self {
        RecoveryManager {
            config,
            executor,
            metrics,
            history: RwLock::new(Vec::new()),
        }
    }

    /// Recover from `failure`, returning the terminal recovery event.
    pub async fn recover(&self, failure: &FailureEvent) -> RecoveryEvent {
        let strategy = select_strategy(failure.failure_type, failure.severity);
        let mut event = RecoveryEvent {
            id: format!("recovery-{}", failure.id),
            failure_id: failure.id.clone(),
            strategy,
            status: RecoveryStatus::Pending,
            attempts: 0,
            started_at: Utc::now(),
            finished_at: None,
            last_error: None,
        };

        if strategy == RecoveryStrategy::ManualIntervention {
            error!(
                "Failure {} ({}) requires operator intervention: {}",
                failure.id,
                failure.failure_type.as_str(),
                failure.description
            );
            event.status = RecoveryStatus::Failed;
            event.last_error = Some(
                RecoveryError::ManualInterventionRequired(failure.description.clone()).to_string(),
            );
            return self.finish(event);
        }

        event.status = RecoveryStatus::InProgress;
        info!(
            "Recovering from {} failure {} with {}",
            failure.failure_type.as_str(),
            failure.id,
            strategy.as_str()
        );

        let max_attempts = self.config.max_recovery_attempts;
        for attempt in 1..=max_attempts {
            event.attempts = attempt;
            let attempt_run = self.executor.execute(strategy, failure);
            let outcome = match timeout(self.config.recovery_timeout, attempt_run).await {
                Ok(result) => result,
                Err(_) => Err(RecoveryError::Timeout(self.config.recovery_timeout)),
            };
            match outcome {
                Ok(()) => {
                    event.status = RecoveryStatus::Completed;
                    event.last_error = None;
                    info!(
                        "Recovery {} completed after {} attempt(s)",
                        event.id, attempt
                    );
                    break;
                }
                Err(e) => {
                    warn!(
                        "Recovery {} attempt {}/{} failed: {}",
                        event.id, attempt, max_attempts, e
                    );
                    event.last_error = Some(e.to_string());
                    if let RecoveryError::ManualInterventionRequired(_) = e {
                        break;
                    }
                    if attempt < max_attempts {
                        sleep(self.config.retry_backoff).await;
                    }
                }
            }
        }

        if event.status != RecoveryStatus::Completed {
            event.status = RecoveryStatus::Failed;
            error!(
                "Recovery {} failed after {} attempt(s); failure {} stays unresolved",
                event.id, event.attempts, failure.id
            );
        }
        self.finish(event)
    }

    fn finish(&self, mut event: RecoveryEvent) -> RecoveryEvent {
        event.finished_at = Some(Utc::now());
        self.metrics
            .record_recovery(event.status == RecoveryStatus::Completed);
        self.history.write().push(event.clone());
        event
    }

    pub fn history(&self) -> Vec<RecoveryEvent> {
        self.history.read().clone()
    }
}
