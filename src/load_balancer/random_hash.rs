//! Weighted random hash strategy.

use crate::hashing::WeightedRandom;
use crate::load_balancer::{HashPolicy, PickInput, PolicyPick};

/// Prefix sums over providers above the policy's minimum weight.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomHash;

impl HashPolicy for RandomHash {
    fn name(&self) -> &'static str {
        "random_hash"
    }

    fn pick(&self, input: &PickInput<'_>) -> PolicyPick {
        let eligible = input
            .weights
            .iter()
            .enumerate()
            .filter_map(|(index, weight)| weight.map(|w| (index, w)));
        let table = WeightedRandom::build(eligible, input.policy.min_weight);
        PolicyPick {
            pick: table.pick(input.key),
            skipped: None,
        }
    }
}
