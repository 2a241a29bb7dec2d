//! Provider weight state and the approach-the-target step.
//!
//! # Weights
//! - current: the adapted weight, 0..=max_weight, changed only by CAS
//! - target: the discovery-permitted ceiling
//! - cached: what selection reads, `min(target, max(floor, current × lb))`
//!
//! Increases accumulate a bonus so healthy providers ramp up faster than
//! they ramp down; any decrease or active degradation resets it.
//!
//! Every step is scaled by the chain's confidence, the share of
//! `min_valid_samples` it has seen. A provider with a single sample moves
//! by at most one unit per update in either direction.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::config::MiscConfig;
use crate::health::controller::AtomicF64;

/// Inputs of one weight adjustment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightInput {
    /// Target for this update, already reduced for failures.
    pub target: u32,
    /// Controller chain delta in [-1, 0].
    pub chain_delta: f64,
    /// Load-balance factor in [0, 1].
    pub lb_factor: f64,
    /// Policy floor for the cached weight.
    pub min_weight: u32,
    /// Share of a full step this update may take, in [0, 1].
    pub confidence: f64,
}

/// Result of one weight adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightChange {
    pub previous: u32,
    pub current: u32,
    pub cached: u32,
}

#[derive(Debug)]
pub struct ProviderWeight {
    current: AtomicU32,
    target: AtomicU32,
    cached: AtomicU32,
    bonus: AtomicF64,
}

impl ProviderWeight {
    /// New providers start at their target.
    pub fn new(target: u32, max_weight: u32) -> Self {
        let target = target.min(max_weight);
        Self {
            current: AtomicU32::new(target),
            target: AtomicU32::new(target),
            cached: AtomicU32::new(target),
            bonus: AtomicF64::new(0.0),
        }
    }

    pub fn current(&self) -> u32 {
        self.current.load(Ordering::Acquire)
    }

    pub fn target(&self) -> u32 {
        self.target.load(Ordering::Acquire)
    }

    pub fn cached(&self) -> u32 {
        self.cached.load(Ordering::Acquire)
    }

    pub fn bonus(&self) -> f64 {
        self.bonus.load()
    }

    /// New discovery target; the cached weight is capped immediately.
    pub fn set_target(&self, target: u32, max_weight: u32) {
        let target = target.min(max_weight);
        self.target.store(target, Ordering::Release);
        let _ = self
            .cached
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cached| Some(cached.min(target)));
    }

    /// Retire the provider: nothing may select it any more.
    pub fn force_zero(&self) {
        self.current.store(0, Ordering::Release);
        self.cached.store(0, Ordering::Release);
        self.bonus.store(0.0);
    }

    /// Bounded step from `current` toward `target`.
    pub fn approach_step(current: u32, target: u32, bonus: f64, misc: &MiscConfig) -> f64 {
        let max_weight = misc.max_weight.max(1) as f64;
        let step = ((misc.weight_step_base + bonus) * target as f64 / max_weight).max(1.0);
        if current < target {
            step.min((target - current) as f64)
        } else if current > target {
            -step.min((current - target) as f64)
        } else {
            0.0
        }
    }

    /// Apply one adjustment. Lock-free; concurrent callers retry the CAS.
    pub fn adjust(&self, input: WeightInput, misc: &MiscConfig) -> WeightChange {
        let max_weight = misc.max_weight;
        let target = input.target.min(max_weight);
        let bonus = self.bonus.load();
        let chain_step = input.chain_delta.clamp(-1.0, 0.0) * misc.max_decrease_step;

        let mut previous = self.current.load(Ordering::Acquire);
        let (current, delta_applied) = loop {
            let approach = Self::approach_step(previous, target, bonus, misc);
            let raw = if chain_step < 0.0 { approach.min(chain_step) } else { approach };
            let delta = Self::damp(raw, input.confidence);
            let next = (previous as f64 + delta).round().clamp(0.0, max_weight as f64) as u32;
            match self
                .current
                .compare_exchange_weak(previous, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break (next, delta),
                Err(actual) => previous = actual,
            }
        };

        let degrading = input.lb_factor < 1.0;
        if delta_applied < 0.0 || degrading {
            self.bonus.store(0.0);
        } else if delta_applied > 0.0 {
            let max_bonus = misc.max_bonus;
            let increment = misc.bonus_increment;
            self.bonus.update(|b| (b + increment).min(max_bonus));
        }

        let cached = Self::cached_weight(current, self.target().min(target), input);
        self.cached.store(cached, Ordering::Release);

        WeightChange { previous, current, cached }
    }

    /// Scale a step by confidence, never below one unit while it is non-zero.
    fn damp(step: f64, confidence: f64) -> f64 {
        if step == 0.0 {
            return 0.0;
        }
        let scaled = step * confidence.clamp(0.0, 1.0);
        if scaled.abs() < 1.0 {
            step.signum() * step.abs().min(1.0)
        } else {
            scaled
        }
    }

    fn cached_weight(current: u32, target: u32, input: WeightInput) -> u32 {
        let scaled = (current as f64 * input.lb_factor.clamp(0.0, 1.0)).round() as u32;
        scaled.max(input.min_weight).min(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn input(target: u32, chain_delta: f64, lb_factor: f64) -> WeightInput {
        WeightInput { target, chain_delta, lb_factor, min_weight: 0, confidence: 1.0 }
    }

    #[test]
    fn test_ramp_up_accelerates() {
        let misc = MiscConfig::default();
        let w = ProviderWeight::new(100, 100);
        w.force_zero();
        let mut steps = Vec::new();
        for _ in 0..5 {
            let change = w.adjust(input(100, 0.0, 1.0), &misc);
            steps.push(change.current - change.previous);
        }
        assert!(steps.windows(2).all(|s| s[1] >= s[0]), "{steps:?}");
        assert!(steps[4] > steps[0]);
    }

    #[test]
    fn test_decrease_resets_bonus() {
        let misc = MiscConfig::default();
        let w = ProviderWeight::new(100, 100);
        w.force_zero();
        w.adjust(input(100, 0.0, 1.0), &misc);
        w.adjust(input(100, 0.0, 1.0), &misc);
        assert!(w.bonus() > 0.0);
        w.adjust(input(100, -0.5, 1.0), &misc);
        assert_eq!(w.bonus(), 0.0);
    }

    #[test]
    fn test_chain_delta_is_punitive() {
        let misc = MiscConfig::default();
        let w = ProviderWeight::new(100, 100);
        let change = w.adjust(input(100, -1.0, 1.0), &misc);
        assert_eq!(change.current, 80);
    }

    #[test]
    fn test_cached_respects_target_and_floor() {
        let misc = MiscConfig::default();
        let w = ProviderWeight::new(100, 100);
        let change = w.adjust(
            WeightInput { target: 40, chain_delta: 0.0, lb_factor: 0.0, min_weight: 10, confidence: 1.0 },
            &misc,
        );
        assert_eq!(change.cached, 10);
        w.set_target(5, 100);
        assert_eq!(w.cached(), 5);
    }

    #[test]
    fn test_low_confidence_slows_steps() {
        let misc = MiscConfig::default();
        let sure = ProviderWeight::new(100, 100);
        let unsure = ProviderWeight::new(100, 100);
        let full = sure.adjust(input(100, -1.0, 1.0), &misc);
        let damped = unsure.adjust(WeightInput { confidence: 0.25, ..input(100, -1.0, 1.0) }, &misc);
        assert_eq!(full.current, 80);
        assert_eq!(damped.current, 95);

        let fresh = ProviderWeight::new(100, 100);
        let change = fresh.adjust(WeightInput { confidence: 0.0, ..input(100, -1.0, 1.0) }, &misc);
        assert_eq!(change.current, 99);
    }

    proptest! {
        #[test]
        fn prop_weight_bounds(
            ops in proptest::collection::vec(
                (0u32..300, -1.0f64..=0.0, 0.0f64..=1.0, 0u32..50, 0.0f64..=1.0),
                1..200,
            )
        ) {
            let misc = MiscConfig::default();
            let w = ProviderWeight::new(100, misc.max_weight);
            for (target, delta, lb, floor, confidence) in ops {
                let change = w.adjust(
                    WeightInput { target, chain_delta: delta, lb_factor: lb, min_weight: floor, confidence },
                    &misc,
                );
                prop_assert!(change.current <= misc.max_weight);
                prop_assert!(change.cached <= target.min(misc.max_weight));
                prop_assert!(change.cached <= misc.max_weight);
            }
        }
    }
}
