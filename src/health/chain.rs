//! Per-provider controller chain.
//!
//! Four independent signals: latency, error ratio, degrade ratio and
//! warm-up. Legality against the best chain, error and warm-up produce a
//! weight delta in [-1, 0]; the most punitive wins. The degrade signal does not join that minimum,
//! it drives the load-balance factor instead.

use crate::config::{FlowControlPolicy, MiscConfig};
use crate::health::controller::HealthController;
use crate::health::linear_coverage;
use crate::health::outcome::CallOutcome;

/// Error ratios closer than this rank as equal.
const ERROR_RATIO_EPSILON: f64 = 1e-3;

#[derive(Debug, Default)]
pub struct ControllerChain {
    latency: HealthController,
    error: HealthController,
    degrade: HealthController,
    warmup: HealthController,
}

impl ControllerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one call outcome into every controller.
    pub fn update(&self, outcome: &CallOutcome, misc: &MiscConfig) {
        let alpha = misc.filter_alpha;
        let min = misc.min_valid_samples;
        self.latency
            .update(outcome.server_latency_ms(), outcome.latency_ms(), alpha, min);
        self.error
            .update(outcome.server_error_sample(), outcome.error_sample(), alpha, min);
        let degrade = outcome.degrade_sample();
        self.degrade.update(degrade, degrade, alpha, min);
        self.warmup.update(0.0, 0.0, alpha, 0);
    }

    pub fn is_valid(&self) -> bool {
        self.latency.is_valid() && self.error.is_valid()
    }

    pub fn latency_ms(&self) -> f64 {
        self.latency.lb_value()
    }

    pub fn server_latency_ms(&self) -> f64 {
        self.latency.server_value()
    }

    pub fn error_ratio(&self) -> f64 {
        self.error.lb_value()
    }

    pub fn server_error_ratio(&self) -> f64 {
        self.error.server_value()
    }

    pub fn degrade_ratio(&self) -> f64 {
        self.degrade.server_value()
    }

    /// Samples seen so far.
    pub fn version(&self) -> u64 {
        self.warmup.version()
    }

    /// How far the sample count is toward `min_valid_samples`, in [0, 1].
    pub fn confidence(&self, misc: &MiscConfig) -> f64 {
        if misc.min_valid_samples == 0 {
            return 1.0;
        }
        (self.version() as f64 / misc.min_valid_samples as f64).min(1.0)
    }

    /// Highest latency still within tolerance of `best_latency`.
    pub fn latency_limit(best_latency: f64, policy: &FlowControlPolicy) -> f64 {
        (best_latency * (1.0 + policy.latency_upper_limit_percent))
            .max(best_latency + policy.latency_upper_limit_ms)
    }

    /// True when this chain is within tolerance of `best`.
    ///
    /// Chains without valid data are legal, there is nothing to hold against them.
    pub fn is_legal(&self, best: &ControllerChain, policy: &FlowControlPolicy) -> bool {
        if !self.is_valid() || !best.is_valid() {
            return true;
        }
        self.error_ratio() <= best.error_ratio() + policy.error_ratio_limit
            && self.latency_ms() <= Self::latency_limit(best.latency_ms(), policy)
    }

    /// Ranking between chains: lower error ratio first, then lower latency.
    pub fn is_better_than(&self, other: &ControllerChain) -> bool {
        if !self.is_valid() {
            return false;
        }
        if !other.is_valid() {
            return true;
        }
        let (mine, theirs) = (self.error_ratio(), other.error_ratio());
        if (mine - theirs).abs() > ERROR_RATIO_EPSILON {
            return mine < theirs;
        }
        self.latency_ms() < other.latency_ms()
    }

    /// Whether this chain should replace `current` as the replica's best.
    ///
    /// A candidate outside the tolerance of `current` never replaces it; a
    /// `current` outside the candidate's tolerance always loses. Only
    /// mutually legal chains fall through to the ranking.
    pub fn beats(&self, current: &ControllerChain, policy: &FlowControlPolicy) -> bool {
        if !self.is_valid() {
            return false;
        }
        if !current.is_valid() {
            return true;
        }
        if !self.is_legal(current, policy) {
            return false;
        }
        if !current.is_legal(self, policy) {
            return true;
        }
        self.is_better_than(current)
    }

    /// Penalty for a chain outside the tolerance of `best`; 0 when legal.
    fn legality_delta(&self, best: Option<&ControllerChain>, policy: &FlowControlPolicy) -> f64 {
        let Some(best) = best else { return 0.0 };
        if self.is_legal(best, policy) {
            return 0.0;
        }

        let own = self.latency_ms();
        let limit = Self::latency_limit(best.latency_ms(), policy);
        let latency = if own > limit && own > 0.0 {
            -((own - limit) / own).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let allowed = best.error_ratio() + policy.error_ratio_limit;
        let excess = self.error_ratio() - allowed;
        let error = if excess > 0.0 {
            -(excess / (1.0 - allowed).max(f64::EPSILON)).clamp(0.0, 1.0)
        } else {
            0.0
        };
        latency.min(error)
    }

    fn error_delta(&self, policy: &FlowControlPolicy) -> f64 {
        if !self.error.is_valid() {
            return 0.0;
        }
        let ratio = self.error_ratio();
        let limit = policy.error_ratio_limit;
        if ratio <= limit {
            return 0.0;
        }
        let headroom = (1.0 - limit).max(f64::EPSILON);
        -((ratio - limit) / headroom).clamp(0.0, 1.0)
    }

    fn warmup_delta(&self, misc: &MiscConfig) -> f64 {
        if misc.warmup_samples == 0 {
            return 0.0;
        }
        let progress = (self.version() as f64 / misc.warmup_samples as f64).min(1.0);
        -(1.0 - progress) * misc.warmup_penalty.clamp(0.0, 1.0)
    }

    /// Most punitive of the latency, error and warm-up deltas.
    pub fn target_delta(
        &self,
        best: Option<&ControllerChain>,
        policy: &FlowControlPolicy,
        misc: &MiscConfig,
    ) -> f64 {
        self.legality_delta(best, policy)
            .min(self.error_delta(policy))
            .min(self.warmup_delta(misc))
    }

    /// Load-balance factor in [0, 1] from server-observed signals.
    pub fn update_load_balance(&self, policy: &FlowControlPolicy) -> f64 {
        if !self.is_valid() {
            return 1.0;
        }
        let latency = linear_coverage(
            self.server_latency_ms(),
            policy.begin_server_degrade_latency_ms,
            policy.full_server_degrade_latency_ms,
        );
        let error = linear_coverage(
            self.server_error_ratio(),
            policy.begin_server_degrade_error_ratio,
            policy.full_server_degrade_error_ratio,
        );
        let degrade = 1.0 - self.degrade_ratio().clamp(0.0, 1.0);
        latency.min(error).min(degrade)
    }
}
