// METRICS REGISTRY
// Counters shared by the manager, the switcher and the monitor
//
// The registry is constructed by the caller and injected; cloning it
// shares the same counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Counters {
    proposals_total: AtomicU64,
    proposals_failed: AtomicU64,
    proposals_timed_out: AtomicU64,
    commits_total: AtomicU64,
    commit_latency_us_sum: AtomicU64,
    commit_latency_samples: AtomicU64,
    consecutive_failures: AtomicU64,
    switches_total: AtomicU64,
    switches_failed: AtomicU64,
    switch_rollbacks: AtomicU64,
    failures_detected: AtomicU64,
    recoveries_completed: AtomicU64,
    recoveries_failed: AtomicU64,
}

#[derive(Clone, Default)]
pub struct MetricsRegistry {
    counters: Arc<Counters>,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub proposals_total: u64,
    pub proposals_failed: u64,
    pub proposals_timed_out: u64,
    pub commits_total: u64,
    pub commit_latency_us_sum: u64,
    pub commit_latency_samples: u64,
    pub consecutive_failures: u64,
    pub switches_total: u64,
    pub switches_failed: u64,
    pub switch_rollbacks: u64,
    pub failures_detected: u64,
    pub recoveries_completed: u64,
    pub recoveries_failed: u64,
}

impl RegistrySnapshot {
    /// Mean commit latency over all samples, if any.
    pub fn average_latency(&self) -> Option<Duration> {
        (self.commit_latency_samples > 0)
            .then(|| {
                Duration::from_micros(self.commit_latency_us_sum / self.commit_latency_samples)
            })
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a submitted proposal; a failure extends the consecutive-failure run.
    pub fn record_proposal(&self, accepted: bool) {
        let c = &self.counters;
        c.proposals_total.fetch_add(1, Ordering::Relaxed);
        if accepted {
            c.consecutive_failures.store(0, Ordering::Relaxed);
        } else {
            c.proposals_failed.fetch_add(1, Ordering::Relaxed);
            c.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count a proposal that did not complete within its deadline.
    pub fn record_timeout(&self) {
        self.counters.proposals_timed_out.fetch_add(1, Ordering::Relaxed);
        self.record_proposal(false);
    }

    pub fn record_commit(&self, latency: Option<Duration>) {
        let c = &self.counters;
        c.commits_total.fetch_add(1, Ordering::Relaxed);
        if let Some(latency) = latency {
            c.commit_latency_us_sum
                .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
            c.commit_latency_samples.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_switch(&self, success: bool, rolled_back: bool) {
        let c = &self.counters;
        c.switches_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            c.switches_failed.fetch_add(1, Ordering::Relaxed);
        }
        if rolled_back {
            c.switch_rollbacks.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_failure_detected(&self) {
        self.counters.failures_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovery(&self, success: bool) {
        let counter = if success {
            &self.counters.recoveries_completed
        } else {
            &self.counters.recoveries_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset_consecutive_failures(&self) {
        self.counters.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let c = &self.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        RegistrySnapshot {
            proposals_total: load(&c.proposals_total),
            proposals_failed: load(&c.proposals_failed),
            proposals_timed_out: load(&c.proposals_timed_out),
            commits_total: load(&c.commits_total),
            commit_latency_us_sum: load(&c.commit_latency_us_sum),
            commit_latency_samples: load(&c.commit_latency_samples),
            consecutive_failures: load(&c.consecutive_failures),
            switches_total: load(&c.switches_total),
            switches_failed: load(&c.switches_failed),
            switch_rollbacks: load(&c.switch_rollbacks),
            failures_detected: load(&c.failures_detected),
            recoveries_completed: load(&c.recoveries_completed),
            recoveries_failed: load(&c.recoveries_failed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consecutive_failures_reset_on_success() {
        let registry = MetricsRegistry::new();
        registry.record_proposal(false);
        registry.record_timeout();
        assert_eq!(registry.snapshot().consecutive_failures, 2);
        assert_eq!(registry.snapshot().proposals_timed_out, 1);

        registry.record_proposal(true);
        let snap = registry.snapshot();
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.proposals_total, 3);
        assert_eq!(snap.proposals_failed, 2);
    }

    #[test]
    fn test_clones_share_counters() {
        let registry = MetricsRegistry::new();
        let shared = registry.clone();
        shared.record_commit(Some(Duration::from_millis(4)));
        shared.record_commit(Some(Duration::from_millis(2)));
        shared.record_commit(None);

        let snap = registry.snapshot();
        assert_eq!(snap.commits_total, 3);
        assert_eq!(snap.average_latency(), Some(Duration::from_millis(3)));
    }
}
