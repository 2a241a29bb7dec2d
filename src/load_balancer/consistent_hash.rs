//! Weighted consistent hash strategy.

use crate::load_balancer::{HashPolicy, PickInput, PolicyPick};

/// Walks the replica's ring; providers shrink their footprint as weight drops.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsistentHash;

impl HashPolicy for ConsistentHash {
    fn name(&self) -> &'static str {
        "consistent_hash"
    }

    fn pick(&self, input: &PickInput<'_>) -> PolicyPick {
        let selection = input.ring.select(
            input.key,
            input.max_weight,
            input.policy.ignore_weight_label,
            |index| input.weights.get(index).copied().flatten(),
        );
        PolicyPick {
            pick: selection.pick,
            skipped: selection.owner.filter(|owner| Some(*owner) != selection.pick),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlowControlPolicy;
    use crate::hashing::WeightedHashRing;

    #[test]
    fn test_declining_owner_reported_as_skipped() {
        let ring = WeightedHashRing::build(&[11, 22], 32);
        let policy = FlowControlPolicy::default();
        let weights = [Some(0), Some(100)];
        let mut skipped = 0;
        for key in 0..500u64 {
            let pick = ConsistentHash.pick(&PickInput {
                key,
                ring: &ring,
                weights: &weights,
                max_weight: 100,
                policy: &policy,
            });
            assert_eq!(pick.pick, Some(1));
            if pick.skipped == Some(0) {
                skipped += 1;
            }
        }
        assert!(skipped > 0);
    }

    #[test]
    fn test_ignore_label_takes_owner() {
        let ring = WeightedHashRing::build(&[11, 22], 32);
        let policy = FlowControlPolicy { ignore_weight_label: true, ..FlowControlPolicy::default() };
        let weights = [Some(1), Some(1)];
        for key in 0..200u64 {
            let pick = ConsistentHash.pick(&PickInput {
                key,
                ring: &ring,
                weights: &weights,
                max_weight: 100,
                policy: &policy,
            });
            assert!(pick.pick.is_some());
            assert_eq!(pick.skipped, None);
        }
    }
}
