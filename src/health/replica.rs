//! Replica-wide health state.
//!
//! # Responsibilities
//! - Remember which provider currently has the best controller chain
//! - Filter the replica's average latency and error ratio
//! - Turn those averages into a degrade coverage percent
//!
//! # Design Decisions
//! - The best-chain queue holds provider indices, never references
//! - Queue writes are best effort; duplicates are fine because `best`
//!   always rescans every slot with a full comparison

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::{FlowControlPolicy, MiscConfig};
use crate::health::chain::ControllerChain;
use crate::health::controller::HealthController;
use crate::health::linear_coverage;

const EMPTY_SLOT: usize = 0;

#[derive(Debug)]
pub struct ReplicaController {
    /// Provider index + 1; 0 marks an empty slot.
    best_queue: Vec<AtomicUsize>,
    cursor: AtomicUsize,
    latency: HealthController,
    error: HealthController,
    degrade: HealthController,
}

impl ReplicaController {
    pub fn new(queue_size: usize) -> Self {
        Self {
            best_queue: (0..queue_size.max(1)).map(|_| AtomicUsize::new(EMPTY_SLOT)).collect(),
            cursor: AtomicUsize::new(0),
            latency: HealthController::new(),
            error: HealthController::new(),
            degrade: HealthController::new(),
        }
    }

    /// Index of the best chain among the queued providers.
    pub fn best<'a, F>(&self, chain_of: F, policy: &FlowControlPolicy) -> Option<usize>
    where
        F: Fn(usize) -> Option<&'a ControllerChain>,
    {
        let mut best: Option<(usize, &ControllerChain)> = None;
        for slot in &self.best_queue {
            let raw = slot.load(Ordering::Acquire);
            if raw == EMPTY_SLOT {
                continue;
            }
            let index = raw - 1;
            let Some(chain) = chain_of(index) else {
                continue;
            };
            match best {
                Some((_, current)) if !chain.beats(current, policy) => {}
                _ => best = Some((index, chain)),
            }
        }
        best.map(|(index, _)| index)
    }

    /// Queue `index` if its chain beats the best known chain.
    pub fn offer<'a, F>(&self, index: usize, chain: &ControllerChain, chain_of: F, policy: &FlowControlPolicy) -> bool
    where
        F: Fn(usize) -> Option<&'a ControllerChain>,
    {
        if !chain.is_valid() {
            return false;
        }
        let beats = match self.best(&chain_of, policy) {
            Some(best) if best == index => return false,
            Some(best) => chain_of(best).map_or(true, |b| chain.beats(b, policy)),
            None => true,
        };
        if beats {
            let slot = self.cursor.fetch_add(1, Ordering::AcqRel) % self.best_queue.len();
            self.best_queue[slot].store(index + 1, Ordering::Release);
        }
        beats
    }

    /// Fold one call into the replica averages.
    pub fn observe(&self, latency_ms: f64, error_sample: f64, misc: &MiscConfig) {
        self.latency
            .update(latency_ms, latency_ms, misc.filter_alpha, misc.min_valid_samples);
        self.error
            .update(error_sample, error_sample, misc.filter_alpha, misc.min_valid_samples);
    }

    /// Fold one selection decision into the rolling degrade ratio.
    pub fn observe_degrade(&self, shed: bool, misc: &MiscConfig) {
        let sample = if shed { 1.0 } else { 0.0 };
        self.degrade.update(sample, sample, misc.filter_alpha, 0);
    }

    pub fn is_valid(&self) -> bool {
        self.latency.is_valid() && self.error.is_valid()
    }

    pub fn avg_latency_ms(&self) -> f64 {
        self.latency.lb_value()
    }

    pub fn avg_error_ratio(&self) -> f64 {
        self.error.lb_value()
    }

    pub fn degrade_ratio(&self) -> f64 {
        self.degrade.lb_value()
    }

    /// Selection decisions folded into the degrade ratio so far.
    pub fn degrade_samples(&self) -> u64 {
        self.degrade.version()
    }

    /// Fraction of the key space still served, in [0, 1].
    ///
    /// 0 means full degrade. Any other result is raised to the policy's
    /// minimum coverage. Without valid data the replica serves everything.
    pub fn degrade_cover_percent(&self, policy: &FlowControlPolicy) -> f64 {
        if !self.is_valid() {
            return 1.0;
        }
        let latency = linear_coverage(
            self.avg_latency_ms(),
            policy.begin_degrade_latency_ms,
            policy.full_degrade_latency_ms,
        );
        let error = linear_coverage(
            self.avg_error_ratio(),
            policy.begin_degrade_error_ratio,
            policy.full_degrade_error_ratio,
        );
        let percent = latency.min(error);
        if percent <= 0.0 {
            0.0
        } else {
            percent.max(policy.min_degrade_coverage)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlowControlConfig;
    use crate::health::outcome::CallOutcome;
    use std::time::Duration;

    fn policy(begin: f64, full: f64) -> FlowControlPolicy {
        FlowControlPolicy::from_config(&FlowControlConfig {
            begin_degrade_latency_ms: begin,
            full_degrade_latency_ms: full,
            begin_server_degrade_latency_ms: begin,
            full_server_degrade_latency_ms: full,
            min_degrade_coverage: 0.1,
            ..FlowControlConfig::default()
        })
    }

    fn controller_at(latency_ms: f64, error: f64) -> ReplicaController {
        let misc = MiscConfig::default();
        let c = ReplicaController::new(4);
        for _ in 0..misc.min_valid_samples {
            c.observe(latency_ms, error, &misc);
        }
        c
    }

    #[test]
    fn test_no_data_full_coverage() {
        let c = ReplicaController::new(4);
        assert_eq!(c.degrade_cover_percent(&policy(50.0, 150.0)), 1.0);
    }

    #[test]
    fn test_half_coverage_at_midpoint() {
        let c = controller_at(100.0, 0.0);
        assert!((c.degrade_cover_percent(&policy(50.0, 150.0)) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_full_degrade_and_floor() {
        let p = policy(50.0, 150.0);
        assert_eq!(controller_at(200.0, 0.0).degrade_cover_percent(&p), 0.0);
        assert_eq!(controller_at(149.0, 0.0).degrade_cover_percent(&p), 0.1);
    }

    #[test]
    fn test_coverage_monotonic_in_latency_and_error() {
        let p = policy(50.0, 150.0);
        let mut last = f64::INFINITY;
        for latency in (0..300).step_by(5) {
            let cover = controller_at(latency as f64, 0.0).degrade_cover_percent(&p);
            assert!(cover <= last, "latency {latency}: {cover} > {last}");
            last = cover;
        }
        let mut last = f64::INFINITY;
        for step in 0..=20 {
            let cover = controller_at(10.0, step as f64 / 20.0).degrade_cover_percent(&p);
            assert!(cover <= last);
            last = cover;
        }
    }

    #[test]
    fn test_best_queue_tracks_best_chain() {
        let misc = MiscConfig::default();
        let chains: Vec<ControllerChain> = (0..3).map(|_| ControllerChain::new()).collect();
        for (i, latency) in [30u64, 10, 20].iter().enumerate() {
            for _ in 0..5 {
                chains[i].update(&CallOutcome::success(Duration::from_millis(*latency)), &misc);
            }
        }
        let c = ReplicaController::new(2);
        let p = FlowControlPolicy::default();
        let chain_of = |i: usize| chains.get(i);
        assert!(c.offer(0, &chains[0], chain_of, &p));
        assert!(c.offer(1, &chains[1], chain_of, &p));
        assert!(!c.offer(2, &chains[2], chain_of, &p));
        assert!(!c.offer(1, &chains[1], chain_of, &p));
        assert_eq!(c.best(chain_of, &p), Some(1));
    }

    #[test]
    fn test_fast_failing_chain_never_becomes_best() {
        let misc = MiscConfig::default();
        let steady = ControllerChain::new();
        let fast_failing = ControllerChain::new();
        for _ in 0..5 {
            steady.update(&CallOutcome::success(Duration::from_millis(40)), &misc);
            fast_failing.update(&CallOutcome::failure(Duration::from_millis(1)), &misc);
        }
        let chains = [steady, fast_failing];
        let c = ReplicaController::new(4);
        let p = FlowControlPolicy::default();
        let chain_of = |i: usize| chains.get(i);

        assert!(c.offer(0, &chains[0], chain_of, &p));
        assert!(!c.offer(1, &chains[1], chain_of, &p));
        assert_eq!(c.best(chain_of, &p), Some(0));
    }
}
