//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Call enters with (biz, hash key, match tags)
//!     → selector.rs (resolve versions and partitions in the snapshot)
//!     → replica.rs (degrade check, tag narrowing)
//!     → Apply hash policy:
//!         - consistent_hash.rs (weighted ring walk)
//!         - random_hash.rs (prefix-sum weighted pick)
//!     → provider.rs (weight, health predicates, counters)
//!     → CallPlan of (partition, provider, request type)
//! ```
//!
//! # Design Decisions
//! - Policies are stateless; replicas own the ring and health state
//! - Policy choice is process-wide, read from `MiscConfig::hash_policy`
//! - Misses are recorded per partition and never block the call

pub mod consistent_hash;
pub mod provider;
pub mod random_hash;
pub mod replica;
pub mod selector;

use std::collections::BTreeMap;
use std::fmt::Debug;

use rand::Rng;
use thiserror::Error;

use crate::config::{FlowControlPolicy, HashPolicyKind};
use crate::hashing::WeightedHashRing;

pub use consistent_hash::ConsistentHash;
pub use provider::{CallCounters, Provider, RequestType};
pub use random_hash::RandomHash;
pub use replica::{need_degrade, Replica, ReplicaStats, SelectContext, Selection};
pub use selector::{CallPlan, PlannedCall, ProviderSelector, SelectMiss};

/// Why a partition received no main provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectError {
    #[error("biz {0} is not in the current topology")]
    UnknownBiz(String),
    #[error("biz {0} has no serviceable version")]
    NoVersion(String),
    #[error("partition {0} has no replica")]
    NoReplica(u32),
    #[error("partition {0} has no selectable provider")]
    NoProvider(u32),
    #[error("partition {0} shed by degradation")]
    Degraded(u32),
}

/// How tag matching narrows the candidate providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagMatchMode {
    /// Use matching providers when any exist, otherwise everyone.
    #[default]
    Prefer,
    /// Only matching providers are eligible.
    Require,
}

/// Tag constraint attached to a call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MatchTags {
    pub tags: BTreeMap<String, String>,
    pub mode: TagMatchMode,
}

impl MatchTags {
    pub fn require<I, K, V>(tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            mode: TagMatchMode::Require,
        }
    }

    pub fn prefer<I, K, V>(tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            mode: TagMatchMode::Prefer,
            ..Self::require(tags)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

/// Inputs a hash policy sees for one pick.
#[derive(Debug)]
pub struct PickInput<'a> {
    pub key: u64,
    pub ring: &'a WeightedHashRing,
    /// Selection weight per provider index; `None` marks a filtered placeholder.
    pub weights: &'a [Option<u32>],
    pub max_weight: u32,
    pub policy: &'a FlowControlPolicy,
}

/// Result of a policy pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PolicyPick {
    pub pick: Option<usize>,
    /// Provider the key landed on first but which declined it; a probe candidate.
    pub skipped: Option<usize>,
}

/// Provider selection strategy inside one replica.
pub trait HashPolicy: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Choose a provider index for the key.
    fn pick(&self, input: &PickInput<'_>) -> PolicyPick;
}

/// Shared instance of the configured policy.
pub fn hash_policy_for(kind: HashPolicyKind) -> &'static dyn HashPolicy {
    static CONSISTENT: ConsistentHash = ConsistentHash;
    static RANDOM: RandomHash = RandomHash;
    match kind {
        HashPolicyKind::ConsistentHash => &CONSISTENT,
        HashPolicyKind::RandomHash => &RANDOM,
    }
}

/// True with `probability`; exact at 0 and 1.
pub(crate) fn sample(probability: f64) -> bool {
    if probability <= 0.0 {
        return false;
    }
    if probability >= 1.0 {
        return true;
    }
    rand::thread_rng().gen::<f64>() < probability
}
