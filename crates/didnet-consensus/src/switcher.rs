// CONSENSUS SWITCHER
// Live migration between consensus protocols without losing committed state
//
// INVARIANTS:
// 1. At most one migration at a time; a concurrent request fails immediately
// 2. Rejected requests never mutate SwitchState
// 3. The current pointer moves only after the target is confirmed running
// 4. A failed migration with rollback enabled leaves the source current and running
// 5. Backups and consecutive rollbacks are bounded by max_rollback_depth

use crate::config::{MonitorConfig, SwitchStrategy, SwitcherConfig};
use crate::engine::{ConsensusAlgorithm, ConsensusError, ConsensusType, StateSnapshot};
use crate::metrics::MetricsRegistry;
use crate::monitor::{ConsensusMetrics, ConsensusMonitor, ProtocolSource};
use crate::poa_engine::PoaNode;
use crate::raft_engine::RaftNode;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchStage {
    Idle,
    Backup,
    StartTarget,
    DataSync,
    StopSource,
    Validate,
    Commit,
    Rollback,
}

/// Live projection of the migration in flight, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchState {
    pub in_progress: bool,
    pub current_type: ConsensusType,
    pub target_type: Option<ConsensusType>,
    pub strategy: Option<SwitchStrategy>,
    /// 0 to 100.
    pub progress: u8,
    pub stage: SwitchStage,
    pub started_at: Option<DateTime<Utc>>,
}

impl SwitchState {
    fn idle(current_type: ConsensusType) -> Self {
        SwitchState {
            in_progress: false,
            current_type,
            target_type: None,
            strategy: None,
            progress: 0,
            stage: SwitchStage::Idle,
            started_at: None,
        }
    }
}

/// Append-only record of one migration attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchEvent {
    pub id: String,
    pub from_type: ConsensusType,
    pub to_type: ConsensusType,
    pub strategy: SwitchStrategy,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub success: bool,
    pub rollback: bool,
    pub error: Option<String>,
    /// Why the switch was requested (manual, auto, rollback, ...).
    pub context: String,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SwitchError {
    #[error("switch in progress")]
    InProgress,

    #[error("{0} consensus is already active")]
    AlreadyActive(ConsensusType),

    #[error("{0} consensus is not supported")]
    Unsupported(ConsensusType),

    #[error("switcher is not running")]
    Stopped,

    #[error("switch timed out after {0:?}")]
    Timeout(Duration),

    #[error("data sync failed: {0}")]
    DataSync(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0:?} stage failed: {1}")]
    Phase(SwitchStage, ConsensusError),

    #[error("switch to {target} rolled back: {reason}")]
    RolledBack { target: ConsensusType, reason: String },

    #[error("auto switch cooling down for another {0:?}")]
    Cooldown(Duration),

    #[error("rollback depth of {0} exhausted")]
    RollbackDepthExceeded(usize),

    #[error("no previous consensus to roll back to")]
    NoPrevious,

    #[error("no backup available")]
    NoBackup,

    #[error("backup restore failed: {0}")]
    Restore(ConsensusError),
}

/// Moves committed state from the source protocol into the target.
#[async_trait]
pub trait StateSync: Send + Sync {
    /// Returns the number of commands the target imported.
    async fn sync(
        &self,
        source: Arc<dyn ConsensusAlgorithm>,
        target: Arc<dyn ConsensusAlgorithm>,
    ) -> Result<usize, SwitchError>;
}

/// Snapshot the source and restore it into the target.
pub struct SnapshotSync;

#[async_trait]
impl StateSync for SnapshotSync {
    async fn sync(
        &self,
        source: Arc<dyn ConsensusAlgorithm>,
        target: Arc<dyn ConsensusAlgorithm>,
    ) -> Result<usize, SwitchError> {
        let snapshot = source.snapshot();
        target
            .restore(&snapshot)
            .map_err(|e| SwitchError::DataSync(e.to_string()))
    }
}

#[derive(Debug, Clone)]
struct Backup {
    consensus: ConsensusType,
    snapshot: StateSnapshot,
}

/// Resets the live switch state however the migration ends.
struct SwitchGuard<'a> {
    switcher: &'a ConsensusSwitcher,
}

impl Drop for SwitchGuard<'_> {
    fn drop(&mut self) {
        let current = *self.switcher.current.read();
        *self.switcher.state.write() = SwitchState::idle(current);
    }
}

/// Owns both protocol instances and the current pointer.
pub struct ConsensusSwitcher {
    config: SwitcherConfig,
    raft: Arc<RaftNode>,
    poa: Arc<PoaNode>,
    current: RwLock<ConsensusType>,
    state: RwLock<SwitchState>,
    events: RwLock<Vec<SwitchEvent>>,
    backups: Mutex<VecDeque<Backup>>,
    /// Protocols switched away from, most recent last.
    previous: Mutex<Vec<ConsensusType>>,
    consecutive_rollbacks: AtomicUsize,
    last_switch: Mutex<Option<Instant>>,
    scope: Mutex<Option<CancellationToken>>,
    state_sync: Arc<dyn StateSync>,
    metrics: MetricsRegistry,
    next_event_id: AtomicU64,
}

impl ConsensusSwitcher {
    pub fn new(
        config: SwitcherConfig,
        initial: ConsensusType,
        raft: Arc<RaftNode>,
        poa: Arc<PoaNode>,
        metrics: MetricsRegistry,
    ) -> Result<Self, SwitchError> {
        if !initial.is_implemented() {
            return Err(SwitchError::Unsupported(initial));
        }
        Ok(ConsensusSwitcher {
            config,
            raft,
            poa,
            current: RwLock::new(initial),
            state: RwLock::new(SwitchState::idle(initial)),
            events: RwLock::new(Vec::new()),
            backups: Mutex::new(VecDeque::new()),
            previous: Mutex::new(Vec::new()),
            consecutive_rollbacks: AtomicUsize::new(0),
            last_switch: Mutex::new(None),
            scope: Mutex::new(None),
            state_sync: Arc::new(SnapshotSync),
            metrics,
            next_event_id: AtomicU64::new(1),
        })
    }

    /// Replace the data-sync step.
    pub fn with_state_sync(mut self, state_sync: Arc<dyn StateSync>) -> Self {
        self.state_sync = state_sync;
        self
    }

    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    pub fn poa(&self) -> &Arc<PoaNode> {
        &self.poa
    }

    pub fn current_type(&self) -> ConsensusType {
        *self.current.read()
    }

    pub fn state(&self) -> SwitchState {
        self.state.read().clone()
    }

    pub fn history(&self) -> Vec<SwitchEvent> {
        self.events.read().clone()
    }

    pub fn backup_count(&self) -> usize {
        self.backups.lock().len()
    }

    fn protocol(
        &self,
        consensus: ConsensusType,
    ) -> Result<Arc<dyn ConsensusAlgorithm>, SwitchError> {
        match consensus {
            ConsensusType::Raft => Ok(self.raft.clone()),
            ConsensusType::Poa => Ok(self.poa.clone()),
            other => Err(SwitchError::Unsupported(other)),
        }
    }

    /// Start the current protocol under `scope`; later migrations start
    /// their targets under the same scope.
    pub async fn start(&self, scope: CancellationToken) -> Result<(), SwitchError> {
        *self.scope.lock() = Some(scope.clone());
        let current = self.current_type();
        self.protocol(current)?
            .start(scope)
            .await
            .map_err(|e| SwitchError::Phase(SwitchStage::StartTarget, e))?;
        info!("Consensus switcher started with {}", current);
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), SwitchError> {
        self.scope.lock().take();
        for protocol in [self.protocol(ConsensusType::Raft)?, self.protocol(ConsensusType::Poa)?] {
            if let Err(e) = protocol.stop().await {
                warn!("failed to stop {}: {}", protocol.consensus_type(), e);
            }
        }
        info!("Consensus switcher stopped");
        Ok(())
    }

    pub async fn switch_to(&self, target: ConsensusType) -> Result<SwitchEvent, SwitchError> {
        self.switch_with(target, self.config.strategy, "manual").await
    }

    pub async fn switch_with(
        &self,
        target: ConsensusType,
        strategy: SwitchStrategy,
        context: &str,
    ) -> Result<SwitchEvent, SwitchError> {
        self.run_switch(target, strategy, context, false).await
    }

    fn acquire(&self) -> Result<SwitchGuard<'_>, SwitchError> {
        let mut state = self.state.write();
        if state.in_progress {
            return Err(SwitchError::InProgress);
        }
        state.in_progress = true;
        Ok(SwitchGuard { switcher: self })
    }

    async fn run_switch(
        &self,
        target: ConsensusType,
        strategy: SwitchStrategy,
        context: &str,
        is_rollback: bool,
    ) -> Result<SwitchEvent, SwitchError> {
        if !target.is_implemented() {
            return Err(SwitchError::Unsupported(target));
        }
        let scope = self.scope.lock().clone().ok_or(SwitchError::Stopped)?;

        let (guard, from) = {
            let mut state = self.state.write();
            if state.in_progress {
                return Err(SwitchError::InProgress);
            }
            let from = *self.current.read();
            if from == target {
                return Err(SwitchError::AlreadyActive(target));
            }
            *state = SwitchState {
                in_progress: true,
                current_type: from,
                target_type: Some(target),
                strategy: Some(strategy),
                progress: 0,
                stage: SwitchStage::Idle,
                started_at: Some(Utc::now()),
            };
            (SwitchGuard { switcher: self }, from)
        };

        let mut event = SwitchEvent {
            id: format!("switch-{}", self.next_event_id.fetch_add(1, Ordering::Relaxed)),
            from_type: from,
            to_type: target,
            strategy,
            start_time: Utc::now(),
            end_time: None,
            success: false,
            rollback: false,
            error: None,
            context: context.to_string(),
        };
        info!(
            "Switching consensus {} -> {} ({}, {})",
            from, target, strategy, context
        );

        let outcome = match timeout(
            self.config.switch_timeout,
            self.migrate(from, target, strategy, &scope),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SwitchError::Timeout(self.config.switch_timeout)),
        };
        *self.last_switch.lock() = Some(Instant::now());

        let result = match outcome {
            Ok(()) => {
                event.success = true;
                if is_rollback {
                    self.previous.lock().pop();
                    self.consecutive_rollbacks.fetch_add(1, Ordering::SeqCst);
                } else {
                    let mut previous = self.previous.lock();
                    previous.push(from);
                    let depth = self.config.max_rollback_depth.max(1);
                    if previous.len() > depth {
                        let excess = previous.len() - depth;
                        previous.drain(..excess);
                    }
                    self.consecutive_rollbacks.store(0, Ordering::SeqCst);
                }
                info!("Consensus switched {} -> {}", from, target);
                Ok(())
            }
            Err(e) => {
                error!("Switch {} -> {} failed: {}", from, target, e);
                event.error = Some(e.to_string());
                if self.config.enable_rollback {
                    self.rollback(from, target, &scope).await;
                    event.rollback = true;
                    Err(SwitchError::RolledBack {
                        target,
                        reason: e.to_string(),
                    })
                } else {
                    Err(e)
                }
            }
        };

        event.end_time = Some(Utc::now());
        self.metrics.record_switch(event.success, event.rollback);
        self.events.write().push(event.clone());
        drop(guard);
        result.map(|()| event)
    }

    fn stage(&self, stage: SwitchStage, progress: u8) {
        let mut state = self.state.write();
        state.stage = stage;
        state.progress = progress;
        debug!("switch stage {:?} ({}%)", stage, progress);
    }

    async fn migrate(
        &self,
        from: ConsensusType,
        target: ConsensusType,
        strategy: SwitchStrategy,
        scope: &CancellationToken,
    ) -> Result<(), SwitchError> {
        let source = self.protocol(from)?;
        let next = self.protocol(target)?;

        match strategy {
            SwitchStrategy::Graceful => {
                self.stage(SwitchStage::Backup, 10);
                self.backup(&source);
                self.stage(SwitchStage::StartTarget, 30);
                self.start_target(&next, scope).await?;
                self.stage(SwitchStage::DataSync, 50);
                self.sync(&source, &next).await?;
                self.stage(SwitchStage::StopSource, 70);
                source
                    .stop()
                    .await
                    .map_err(|e| SwitchError::Phase(SwitchStage::StopSource, e))?;
                self.stage(SwitchStage::Validate, 85);
                self.validate(&next)?;
                self.stage(SwitchStage::Commit, 100);
                self.commit_pointer(target);
            }
            SwitchStrategy::Immediate => {
                self.stage(SwitchStage::StopSource, 30);
                source
                    .stop()
                    .await
                    .map_err(|e| SwitchError::Phase(SwitchStage::StopSource, e))?;
                self.stage(SwitchStage::StartTarget, 60);
                self.start_target(&next, scope).await?;
                self.stage(SwitchStage::Commit, 100);
                self.validate(&next)?;
                self.commit_pointer(target);
            }
            SwitchStrategy::BlueGreen => {
                self.stage(SwitchStage::Backup, 10);
                self.backup(&source);
                self.stage(SwitchStage::StartTarget, 25);
                self.start_target(&next, scope).await?;
                self.stage(SwitchStage::DataSync, 45);
                self.sync(&source, &next).await?;
                self.stage(SwitchStage::Validate, 65);
                self.validate(&next)?;
                self.stage(SwitchStage::Commit, 80);
                self.commit_pointer(target);
                self.stage(SwitchStage::StopSource, 100);
                source
                    .stop()
                    .await
                    .map_err(|e| SwitchError::Phase(SwitchStage::StopSource, e))?;
            }
        }
        Ok(())
    }

    fn backup(&self, source: &Arc<dyn ConsensusAlgorithm>) {
        if !self.config.backup_before_switch {
            return;
        }
        let snapshot = source.snapshot();
        info!(
            "Backed up {} committed commands from {}",
            snapshot.len(),
            source.consensus_type()
        );
        let mut backups = self.backups.lock();
        backups.push_back(Backup {
            consensus: source.consensus_type(),
            snapshot,
        });
        while backups.len() > self.config.max_rollback_depth.max(1) {
            backups.pop_front();
        }
    }

    async fn start_target(
        &self,
        target: &Arc<dyn ConsensusAlgorithm>,
        scope: &CancellationToken,
    ) -> Result<(), SwitchError> {
        target
            .start(scope.clone())
            .await
            .map_err(|e| SwitchError::Phase(SwitchStage::StartTarget, e))
    }

    async fn sync(
        &self,
        source: &Arc<dyn ConsensusAlgorithm>,
        target: &Arc<dyn ConsensusAlgorithm>,
    ) -> Result<(), SwitchError> {
        match timeout(
            self.config.data_sync_timeout,
            self.state_sync.sync(source.clone(), target.clone()),
        )
        .await
        {
            Ok(Ok(imported)) => {
                info!(
                    "Synced {} commands {} -> {}",
                    imported,
                    source.consensus_type(),
                    target.consensus_type()
                );
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SwitchError::DataSync(format!(
                "timed out after {:?}",
                self.config.data_sync_timeout
            ))),
        }
    }

    fn validate(&self, target: &Arc<dyn ConsensusAlgorithm>) -> Result<(), SwitchError> {
        let health = target.health();
        if !health.running {
            return Err(SwitchError::Validation(format!(
                "{} is not running",
                target.consensus_type()
            )));
        }
        if !health.integrity_ok {
            return Err(SwitchError::Validation(format!(
                "{} failed its integrity check",
                target.consensus_type()
            )));
        }
        Ok(())
    }

    fn commit_pointer(&self, target: ConsensusType) {
        *self.current.write() = target;
        self.state.write().current_type = target;
    }

    async fn rollback(
        &self,
        from: ConsensusType,
        target: ConsensusType,
        scope: &CancellationToken,
    ) {
        self.stage(SwitchStage::Rollback, 0);
        warn!("Rolling back switch {} -> {}", from, target);
        if let Ok(next) = self.protocol(target) {
            if let Err(e) = next.stop().await {
                error!("rollback: failed to stop {}: {}", target, e);
            }
        }
        self.commit_pointer(from);
        match self.protocol(from) {
            Ok(source) => {
                if let Err(e) = source.start(scope.clone()).await {
                    error!("rollback: failed to restart {}: {}", from, e);
                }
            }
            Err(e) => error!("rollback: {}", e),
        }
    }

    /// Restart the current protocol in place.
    pub async fn restart_current(&self) -> Result<(), SwitchError> {
        let scope = self.scope.lock().clone().ok_or(SwitchError::Stopped)?;
        let _guard = self.acquire()?;
        let protocol = self.current();
        info!("Restarting {}", protocol.consensus_type());
        protocol
            .stop()
            .await
            .map_err(|e| SwitchError::Phase(SwitchStage::StopSource, e))?;
        protocol
            .start(scope)
            .await
            .map_err(|e| SwitchError::Phase(SwitchStage::StartTarget, e))
    }

    /// Import the most recent backup into the current protocol.
    pub fn restore_latest_backup(&self) -> Result<usize, SwitchError> {
        let backup = self.backups.lock().back().cloned().ok_or(SwitchError::NoBackup)?;
        let protocol = self.current();
        let imported = protocol.restore(&backup.snapshot).map_err(SwitchError::Restore)?;
        info!(
            "Restored {} commands into {} from {} backup",
            imported,
            protocol.consensus_type(),
            backup.consensus
        );
        Ok(imported)
    }

    /// Switch back to the protocol that was current before the last switch.
    pub async fn rollback_to_previous(&self) -> Result<SwitchEvent, SwitchError> {
        let depth = self.consecutive_rollbacks.load(Ordering::SeqCst);
        if depth >= self.config.max_rollback_depth {
            return Err(SwitchError::RollbackDepthExceeded(depth));
        }
        let previous = self.previous.lock().last().copied().ok_or(SwitchError::NoPrevious)?;
        self.run_switch(previous, SwitchStrategy::Graceful, "rollback", true)
            .await
    }

    /// Preferred protocol for a cluster of `nodes` nodes.
    pub fn preferred_for_cluster(nodes: usize) -> ConsensusType {
        if nodes <= 3 {
            ConsensusType::Poa
        } else {
            ConsensusType::Raft
        }
    }

    /// Switch away from the current protocol when its score drops below
    /// the threshold. `Ok(None)` means no switch was needed.
    pub async fn evaluate_auto_switch(
        &self,
        metrics: &ConsensusMetrics,
        monitor_config: &MonitorConfig,
    ) -> Result<Option<SwitchEvent>, SwitchError> {
        if !self.config.enable_auto_switch {
            return Ok(None);
        }
        let score = metrics.performance_score(monitor_config);
        if score >= self.config.auto_switch_threshold {
            return Ok(None);
        }
        if let Some(last) = *self.last_switch.lock() {
            let elapsed = last.elapsed();
            if elapsed < self.config.auto_switch_cooldown {
                return Err(SwitchError::Cooldown(self.config.auto_switch_cooldown - elapsed));
            }
        }

        let current = self.current_type();
        let preferred = Self::preferred_for_cluster(metrics.total_nodes);
        let target = [preferred, ConsensusType::Raft, ConsensusType::Poa]
            .into_iter()
            .find(|t| *t != current && t.is_implemented())
            .ok_or(SwitchError::Unsupported(current))?;

        info!(
            "Auto switch: {} score {:.2} below {:.2}, moving to {}",
            current, score, self.config.auto_switch_threshold, target
        );
        let context = format!("auto: score {:.2}", score);
        self.run_switch(target, self.config.strategy, &context, false)
            .await
            .map(Some)
    }

    /// Periodically evaluate the monitor's latest sample.
    pub async fn run_auto_switch(
        self: Arc<Self>,
        monitor: Arc<ConsensusMonitor>,
        token: CancellationToken,
    ) {
        let mut ticker = interval(self.config.auto_switch_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(latest) = monitor.latest() else { continue };
                    match self.evaluate_auto_switch(&latest, monitor.config()).await {
                        Ok(Some(event)) => info!("Auto switch {} completed", event.id),
                        Ok(None) => {}
                        Err(SwitchError::Cooldown(left)) => {
                            debug!("auto switch cooling down ({:?} left)", left)
                        }
                        Err(e) => warn!("Auto switch failed: {}", e),
                    }
                }
            }
        }
    }
}

impl ProtocolSource for ConsensusSwitcher {
    fn current(&self) -> Arc<dyn ConsensusAlgorithm> {
        match self.current_type() {
            ConsensusType::Poa => self.poa.clone(),
            _ => self.raft.clone(),
        }
    }
}
