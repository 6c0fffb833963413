// CONSENSUS CONFIGURATION
// Every recognized option, its default, and layered loading
//
// Durations are carried as integer milliseconds on the wire so the same
// document works from YAML, TOML or environment variables.

use crate::engine::{ConsensusType, NodeId};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Environment prefix for overrides, e.g. `DIDNET_CONSENSUS__RAFT__HEARTBEAT_INTERVAL=25`.
pub const ENV_PREFIX: &str = "DIDNET_CONSENSUS";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Serde adapter storing a `Duration` as milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Raft timing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Minimum election timeout (randomized between min and max).
    #[serde(with = "duration_ms")]
    pub election_timeout_min: Duration,
    #[serde(with = "duration_ms")]
    pub election_timeout_max: Duration,
    /// Heartbeat interval; must be well below the election timeout.
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Upper bound on a single peer send.
    #[serde(with = "duration_ms")]
    pub rpc_timeout: Duration,
    pub max_entries_per_rpc: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            rpc_timeout: Duration::from_millis(100),
            max_entries_per_rpc: 100,
        }
    }
}

impl RaftConfig {
    /// Returns a randomized election timeout.
    pub fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = (self.election_timeout_max.as_millis() as u64).max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

/// Proof-of-Authority configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoaConfig {
    #[serde(with = "duration_ms")]
    pub block_time: Duration,
    /// Fraction of authorities that must approve a block.
    pub vote_threshold: f64,
    /// Initial authority set. Empty means "this node alone".
    pub authorities: Vec<NodeId>,
    /// Let the in-turn authority seal a block even with nothing queued.
    pub produce_empty_blocks: bool,
    /// Pending proposals older than this are rejected.
    #[serde(with = "duration_ms")]
    pub proposal_timeout: Duration,
    /// Finalized proposals kept for status queries.
    pub max_retained_proposals: usize,
}

impl Default for PoaConfig {
    fn default() -> Self {
        PoaConfig {
            block_time: Duration::from_millis(1000),
            vote_threshold: 0.67,
            authorities: Vec::new(),
            produce_empty_blocks: true,
            proposal_timeout: Duration::from_millis(5000),
            max_retained_proposals: 256,
        }
    }
}

/// How the switcher migrates between protocols.
///
/// `Rolling` is deliberately absent: a per-node process cannot stage a
/// cluster-wide roll, so the option is rejected instead of aliased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchStrategy {
    /// backup → start target → sync → stop source → validate → swap
    Graceful,
    /// stop source → start target → swap
    Immediate,
    /// backup → start target → sync → validate → swap → stop source
    BlueGreen,
}

impl fmt::Display for SwitchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SwitchStrategy::Graceful => "graceful",
            SwitchStrategy::Immediate => "immediate",
            SwitchStrategy::BlueGreen => "blue_green",
        };
        f.write_str(name)
    }
}

impl FromStr for SwitchStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "graceful" => Ok(SwitchStrategy::Graceful),
            "immediate" => Ok(SwitchStrategy::Immediate),
            "blue_green" | "bluegreen" => Ok(SwitchStrategy::BlueGreen),
            other => Err(ConfigError::Invalid(format!(
                "unsupported switch strategy '{}'",
                other
            ))),
        }
    }
}

/// Migration behavior and automatic migration policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitcherConfig {
    pub strategy: SwitchStrategy,
    #[serde(with = "duration_ms")]
    pub switch_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub data_sync_timeout: Duration,
    pub enable_auto_switch: bool,
    /// Performance score (0.0 to 1.0) below which an auto switch fires.
    pub auto_switch_threshold: f64,
    #[serde(with = "duration_ms")]
    pub auto_switch_cooldown: Duration,
    /// How often the auto-switch evaluator runs.
    #[serde(with = "duration_ms")]
    pub auto_switch_interval: Duration,
    pub backup_before_switch: bool,
    pub enable_rollback: bool,
    /// Backups retained, and consecutive rollbacks allowed.
    pub max_rollback_depth: usize,
}

impl Default for SwitcherConfig {
    fn default() -> Self {
        SwitcherConfig {
            strategy: SwitchStrategy::Graceful,
            switch_timeout: Duration::from_secs(30),
            data_sync_timeout: Duration::from_secs(10),
            enable_auto_switch: false,
            auto_switch_threshold: 0.5,
            auto_switch_cooldown: Duration::from_secs(300),
            auto_switch_interval: Duration::from_secs(10),
            backup_before_switch: true,
            enable_rollback: true,
            max_rollback_depth: 3,
        }
    }
}

/// Health thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde(with = "duration_ms")]
    pub monitor_interval: Duration,
    /// Average commit latency above this is a latency failure.
    #[serde(with = "duration_ms")]
    pub max_latency: Duration,
    /// Commits per second; checked only while proposals are flowing.
    pub min_throughput: f64,
    /// Fraction of failed proposals tolerated per sample window.
    pub max_failure_rate: f64,
    pub max_consecutive_failures: u32,
    /// Rolling metrics samples kept.
    pub history_size: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            monitor_interval: Duration::from_secs(5),
            max_latency: Duration::from_millis(1000),
            min_throughput: 1.0,
            max_failure_rate: 0.1,
            max_consecutive_failures: 3,
            history_size: 120,
        }
    }
}

/// Recovery bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    #[serde(with = "duration_ms")]
    pub recovery_timeout: Duration,
    pub max_recovery_attempts: u32,
    /// Pause between failed attempts.
    #[serde(with = "duration_ms")]
    pub retry_backoff: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            recovery_timeout: Duration::from_secs(30),
            max_recovery_attempts: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Root configuration for the consensus engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub node_id: NodeId,
    pub initial_consensus: ConsensusType,
    /// Upper bound on a single `submit` call through the manager.
    #[serde(with = "duration_ms")]
    pub submit_timeout: Duration,
    pub raft: RaftConfig,
    pub poa: PoaConfig,
    pub switcher: SwitcherConfig,
    pub monitor: MonitorConfig,
    pub recovery: RecoveryConfig,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            node_id: "node-1".to_string(),
            initial_consensus: ConsensusType::Raft,
            submit_timeout: Duration::from_secs(5),
            raft: RaftConfig::default(),
            poa: PoaConfig::default(),
            switcher: SwitcherConfig::default(),
            monitor: MonitorConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl ConsensusConfig {
    /// Defaults, then an optional YAML/TOML/JSON file, then
    /// `DIDNET_CONSENSUS__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );
        let loaded: ConsensusConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject settings no protocol can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(msg: impl Into<String>) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid(msg.into()))
        }

        if self.node_id.trim().is_empty() {
            return invalid("node_id must not be empty");
        }
        if !self.initial_consensus.is_implemented() {
            return invalid(format!(
                "initial consensus {} has no implementation",
                self.initial_consensus
            ));
        }
        if self.submit_timeout.is_zero() {
            return invalid("submit_timeout must be > 0");
        }

        let raft = &self.raft;
        if raft.election_timeout_min.is_zero()
            || raft.election_timeout_max < raft.election_timeout_min
        {
            return invalid("raft election timeout range is empty");
        }
        if raft.heartbeat_interval.is_zero()
            || raft.heartbeat_interval >= raft.election_timeout_min
        {
            return invalid("raft heartbeat_interval must be > 0 and below election_timeout_min");
        }
        if raft.max_entries_per_rpc == 0 {
            return invalid("raft max_entries_per_rpc must be > 0");
        }

        let poa = &self.poa;
        if poa.block_time.is_zero() {
            return invalid("poa block_time must be > 0");
        }
        if !(poa.vote_threshold > 0.0 && poa.vote_threshold <= 1.0) {
            return invalid("poa vote_threshold must be in (0, 1]");
        }

        let switcher = &self.switcher;
        if switcher.switch_timeout.is_zero() || switcher.data_sync_timeout.is_zero() {
            return invalid("switch_timeout and data_sync_timeout must be > 0");
        }
        if !(0.0..=1.0).contains(&switcher.auto_switch_threshold) {
            return invalid("auto_switch_threshold must be between 0 and 1");
        }
        if switcher.enable_auto_switch && switcher.auto_switch_interval.is_zero() {
            return invalid("auto_switch_interval must be > 0 when auto switch is enabled");
        }

        let monitor = &self.monitor;
        if monitor.monitor_interval.is_zero() {
            return invalid("monitor_interval must be > 0");
        }
        if !(0.0..=1.0).contains(&monitor.max_failure_rate) {
            return invalid("max_failure_rate must be between 0 and 1");
        }
        if monitor.min_throughput < 0.0 {
            return invalid("min_throughput must not be negative");
        }
        if monitor.max_consecutive_failures == 0 || monitor.history_size == 0 {
            return invalid("max_consecutive_failures and history_size must be > 0");
        }

        if self.recovery.max_recovery_attempts == 0 || self.recovery.recovery_timeout.is_zero() {
            return invalid("max_recovery_attempts and recovery_timeout must be > 0");
        }

        Ok(())
    }
}
