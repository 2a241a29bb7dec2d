//! Providers of one (biz, version, partition).
//!
//! # Responsibilities
//! - Own the provider vectors and the weighted ring built over them
//! - Select a main provider plus an optional probe or copy side-pick
//! - Shed a deterministic slice of keys while the replica degrades
//! - Find backup providers for retries
//! - Route call outcomes into provider and replica health state
//!
//! # Design Decisions
//! - Membership is fixed for the replica's lifetime; the ring is built once
//! - Copy providers never join the ring
//! - Tag filtering keeps `None` placeholders so ring indices stay valid

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::config::{FlowControlPolicy, MiscConfig};
use crate::hashing::WeightedHashRing;
use crate::health::{CallOutcome, ReplicaController, WeightChange};
use crate::load_balancer::provider::{Provider, RequestType};
use crate::load_balancer::{sample, HashPolicy, MatchTags, PickInput, SelectError, TagMatchMode};
use crate::topology::node::NodeId;

/// Coverage below which a replica refuses to serve retries.
pub const BACKUP_MIN_COVERAGE: f64 = 0.9;

/// Whether `key` falls in the shed part of this partition's slice.
///
/// The key space is a ring of `partition_count × width` positions; this
/// partition owns `[partition_id × width, partition_id × width + width)`.
/// Keys whose offset inside the slice is at or past `percent × width` are shed.
pub fn need_degrade(key: u64, partition_id: u32, partition_count: u32, width: u64, percent: f64) -> bool {
    if percent >= 1.0 {
        return false;
    }
    if percent <= 0.0 {
        return true;
    }
    let width = width.max(1);
    let ring = partition_count.max(1) as u64 * width;
    let base = (partition_id as u64 % partition_count.max(1) as u64) * width;
    let position = key % ring;
    let offset = ((position + ring - base) % ring) % width;
    offset as f64 >= percent * width as f64
}

/// Outcome of a successful selection.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub main: Option<Arc<Provider>>,
    /// Probe or copy provider to send a side request to.
    pub side: Option<(Arc<Provider>, RequestType)>,
    /// The replica is fully degraded; only a probe is sent.
    pub fully_degraded: bool,
}

/// Everything selection reads besides the key.
#[derive(Debug, Clone, Copy)]
pub struct SelectContext<'a> {
    pub policy: &'a FlowControlPolicy,
    pub misc: &'a MiscConfig,
    pub hash_policy: &'a dyn HashPolicy,
    pub tags: Option<&'a MatchTags>,
}

/// Point-in-time replica statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicaStats {
    pub provider_count: usize,
    pub copy_count: usize,
    pub healthy_count: usize,
    pub stopped_count: usize,
    pub weight_sum: u64,
    pub avg_latency_ms: f64,
    pub degrade_ratio: f64,
    pub probe_calls: u64,
    pub copy_calls: u64,
    pub retry_calls: u64,
    pub stream_calls: u64,
}

#[derive(Debug)]
pub struct Replica {
    biz_name: String,
    version: i64,
    partition_id: u32,
    partition_count: u32,
    providers: Vec<Arc<Provider>>,
    copy_providers: Vec<Arc<Provider>>,
    index_of: HashMap<NodeId, usize>,
    ring: WeightedHashRing,
    controller: ReplicaController,
}

impl Replica {
    /// Build a replica; copy providers are split off from the ring.
    pub fn new(
        biz_name: &str,
        version: i64,
        partition_id: u32,
        partition_count: u32,
        providers: Vec<Arc<Provider>>,
        misc: &MiscConfig,
    ) -> Self {
        let (copy_providers, providers): (Vec<_>, Vec<_>) = providers.into_iter().partition(|p| p.is_copy());
        let ids: Vec<NodeId> = providers.iter().map(|p| p.id()).collect();
        let index_of = ids.iter().enumerate().map(|(index, id)| (*id, index)).collect();
        let ring = WeightedHashRing::build(&ids, misc.virtual_node_count);
        Self {
            biz_name: biz_name.to_string(),
            version,
            partition_id,
            partition_count,
            providers,
            copy_providers,
            index_of,
            ring,
            controller: ReplicaController::new(misc.best_chain_queue_size),
        }
    }

    pub fn biz_name(&self) -> &str {
        &self.biz_name
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    pub fn providers(&self) -> &[Arc<Provider>] {
        &self.providers
    }

    pub fn copy_providers(&self) -> &[Arc<Provider>] {
        &self.copy_providers
    }

    pub fn controller(&self) -> &ReplicaController {
        &self.controller
    }

    /// Every provider, normal first.
    pub fn all_providers(&self) -> impl Iterator<Item = &Arc<Provider>> {
        self.providers.iter().chain(self.copy_providers.iter())
    }

    pub fn degrade_cover_percent(&self, policy: &FlowControlPolicy) -> f64 {
        self.controller.degrade_cover_percent(policy)
    }

    /// Select providers for `key`.
    pub fn select(&self, key: u64, ctx: &SelectContext<'_>) -> Result<Selection, SelectError> {
        if self.providers.is_empty() {
            return self
                .key_copy_provider(key)
                .map(|copy| Selection {
                    side: Some((copy, RequestType::Copy)),
                    ..Selection::default()
                })
                .ok_or(SelectError::NoProvider(self.partition_id));
        }

        let cover = self.degrade_cover_percent(ctx.policy);
        if cover <= 0.0 {
            self.controller.observe_degrade(true, ctx.misc);
            let probe = self.scan_from(key, |p| p.is_started());
            tracing::debug!(
                biz = %self.biz_name,
                partition = self.partition_id,
                probe = ?probe.as_ref().map(|p| p.spec()),
                "Replica fully degraded"
            );
            return Ok(Selection {
                main: None,
                side: probe.map(|p| (p, RequestType::Probe)),
                fully_degraded: true,
            });
        }
        if need_degrade(key, self.partition_id, self.partition_count, ctx.misc.degrade_slice_width, cover) {
            self.controller.observe_degrade(true, ctx.misc);
            return Err(SelectError::Degraded(self.partition_id));
        }
        self.controller.observe_degrade(false, ctx.misc);

        let (main, skipped) = self.pick_main(key, ctx);
        let Some(main) = main else {
            return Err(SelectError::NoProvider(self.partition_id));
        };

        let side = self
            .probe_side_pick(key, skipped, &main, ctx)
            .map(|p| (p, RequestType::Probe))
            .or_else(|| self.copy_side_pick(key, ctx.policy).map(|p| (p, RequestType::Copy)));

        Ok(Selection {
            main: Some(main),
            side,
            fully_degraded: false,
        })
    }

    /// Provider for side traffic of another version: ring pick plus fallback.
    ///
    /// Leaves degrade bookkeeping and side sampling alone.
    pub fn side_provider(&self, key: u64, ctx: &SelectContext<'_>) -> Option<Arc<Provider>> {
        if self.providers.is_empty() {
            return self.key_copy_provider(key);
        }
        self.pick_main(key, ctx).0
    }

    /// Backup provider for retrying a call first sent to `original`.
    pub fn backup_provider(
        &self,
        source: u64,
        original: NodeId,
        tags: Option<&MatchTags>,
        policy: &FlowControlPolicy,
        misc: &MiscConfig,
    ) -> Option<Arc<Provider>> {
        if self.degrade_cover_percent(policy) < BACKUP_MIN_COVERAGE {
            return None;
        }
        let wanted = tags.filter(|t| !t.is_empty());
        self.scan_from(source, |p| {
            p.id() != original
                && wanted.map_or(true, |t| p.has_tags(&t.tags))
                && p.is_healthy(misc)
                && p.weight() > policy.min_retry_weight
        })
    }

    /// Fold a call outcome into provider and replica health.
    ///
    /// Returns `None` when the provider is not part of this replica.
    pub fn update_provider(
        &self,
        id: NodeId,
        outcome: &CallOutcome,
        policy: &FlowControlPolicy,
        misc: &MiscConfig,
    ) -> Option<WeightChange> {
        let chain_of = |i: usize| self.providers.get(i).map(|p| p.chain());

        if let Some(&index) = self.index_of.get(&id) {
            let provider = &self.providers[index];
            let best = self.controller.best(chain_of, policy).and_then(chain_of);
            let change = provider.update_weight(outcome, best, policy, misc);
            self.controller
                .observe(outcome.latency_ms(), outcome.error_sample(), misc);
            self.controller.offer(index, provider.chain(), chain_of, policy);
            return Some(change);
        }

        let copy = self.copy_providers.iter().find(|p| p.id() == id)?;
        Some(copy.update_weight(outcome, None, policy, misc))
    }

    pub fn find_provider(&self, id: NodeId) -> Option<&Arc<Provider>> {
        match self.index_of.get(&id) {
            Some(&index) => self.providers.get(index),
            None => self.copy_providers.iter().find(|p| p.id() == id),
        }
    }

    pub fn stats(&self, misc: &MiscConfig) -> ReplicaStats {
        let mut stats = ReplicaStats {
            provider_count: self.providers.len(),
            copy_count: self.copy_providers.len(),
            avg_latency_ms: self.controller.avg_latency_ms(),
            degrade_ratio: self.controller.degrade_ratio(),
            ..ReplicaStats::default()
        };
        for provider in self.all_providers() {
            if provider.is_healthy(misc) {
                stats.healthy_count += 1;
            }
            if !provider.is_started() {
                stats.stopped_count += 1;
            }
            stats.weight_sum += provider.weight() as u64;
            let counters = provider.counters();
            stats.probe_calls += counters.probe.load(Ordering::Relaxed);
            stats.copy_calls += counters.copy.load(Ordering::Relaxed);
            stats.retry_calls += counters.retry.load(Ordering::Relaxed);
            stats.stream_calls += counters.stream.load(Ordering::Relaxed);
        }
        stats
    }

    fn candidate_weights(&self, ctx: &SelectContext<'_>) -> Vec<Option<u32>> {
        let now = Instant::now();
        let selectable = |p: &Provider| {
            if p.is_started() && !p.is_heartbeat_unhealthy(ctx.misc, now) {
                p.weight()
            } else {
                0
            }
        };

        let tags = match ctx.tags {
            Some(tags) if !tags.is_empty() => tags,
            _ => return self.providers.iter().map(|p| Some(selectable(p))).collect(),
        };

        let matching: Vec<bool> = self.providers.iter().map(|p| p.has_tags(&tags.tags)).collect();
        let restrict = match tags.mode {
            TagMatchMode::Require => true,
            TagMatchMode::Prefer => matching.iter().any(|m| *m),
        };
        self.providers
            .iter()
            .zip(matching)
            .map(|(p, matched)| (!restrict || matched).then(|| selectable(p)))
            .collect()
    }

    /// First started provider from `key mod n`, ignoring labels and weights.
    ///
    /// Tag filtering still applies: a `None` weight is never a candidate.
    fn fallback_index(&self, key: u64, weights: &[Option<u32>]) -> Option<usize> {
        let n = self.providers.len().min(weights.len());
        if n == 0 {
            return None;
        }
        let start = (key % n as u64) as usize;
        (0..n)
            .map(|step| (start + step) % n)
            .find(|&index| weights[index].is_some() && self.providers[index].is_started())
    }

    fn pick_main(&self, key: u64, ctx: &SelectContext<'_>) -> (Option<Arc<Provider>>, Option<usize>) {
        let weights = self.candidate_weights(ctx);
        let picked = ctx.hash_policy.pick(&PickInput {
            key,
            ring: &self.ring,
            weights: &weights,
            max_weight: ctx.misc.max_weight,
            policy: ctx.policy,
        });
        let main = picked
            .pick
            .or_else(|| self.fallback_index(key, &weights))
            .and_then(|index| self.providers.get(index).cloned());
        (main, picked.skipped)
    }

    fn scan_from<F>(&self, key: u64, accept: F) -> Option<Arc<Provider>>
    where
        F: Fn(&Provider) -> bool,
    {
        let n = self.providers.len();
        if n == 0 {
            return None;
        }
        let start = (key % n as u64) as usize;
        (0..n)
            .map(|step| &self.providers[(start + step) % n])
            .find(|p| accept(p))
            .cloned()
    }

    fn probe_side_pick(
        &self,
        key: u64,
        skipped: Option<usize>,
        main: &Arc<Provider>,
        ctx: &SelectContext<'_>,
    ) -> Option<Arc<Provider>> {
        let in_band = |p: &Provider| p.id() != main.id() && p.in_probe_band(ctx.misc);
        let candidate = skipped
            .and_then(|index| self.providers.get(index))
            .filter(|p| in_band(p))
            .cloned()
            .or_else(|| self.scan_from(key, in_band))?;

        let always = !self.controller.is_valid();
        if always || sample(ctx.policy.probe_percent) {
            Some(candidate)
        } else {
            None
        }
    }

    fn copy_side_pick(&self, key: u64, policy: &FlowControlPolicy) -> Option<Arc<Provider>> {
        if self.copy_providers.is_empty() || !sample(policy.copy_percent) {
            return None;
        }
        self.key_copy_provider(key)
    }

    fn key_copy_provider(&self, key: u64) -> Option<Arc<Provider>> {
        let n = self.copy_providers.len();
        if n == 0 {
            return None;
        }
        let start = (key % n as u64) as usize;
        (0..n)
            .map(|step| &self.copy_providers[(start + step) % n])
            .find(|p| p.is_started())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlowControlConfig;
    use crate::load_balancer::{ConsistentHash, RandomHash};
    use crate::topology::node::TopoNode;
    use proptest::prelude::*;
    use std::time::Duration;

    fn replica_with(specs: &[(&str, bool)], misc: &MiscConfig) -> Replica {
        let providers = specs
            .iter()
            .map(|(spec, copy)| {
                let mut node = TopoNode::new("search", 1, 0, spec, 1);
                node.copy = *copy;
                Arc::new(Provider::new(&node, misc))
            })
            .collect();
        Replica::new("search", 1, 0, 1, providers, misc)
    }

    fn ctx<'a>(policy: &'a FlowControlPolicy, misc: &'a MiscConfig) -> SelectContext<'a> {
        SelectContext { policy, misc, hash_policy: &ConsistentHash, tags: None }
    }

    fn no_probe() -> FlowControlPolicy {
        FlowControlPolicy { probe_percent: 0.0, ..FlowControlPolicy::default() }
    }

    #[test]
    fn test_need_degrade_sheds_exact_share() {
        let width = 10_000;
        for partition in 0..3u32 {
            let base = partition as u64 * width;
            let shed = (base..base + width)
                .filter(|k| need_degrade(*k, partition, 3, width, 0.5))
                .count();
            assert_eq!(shed, 5_000);
        }
        assert!(!need_degrade(42, 0, 1, width, 1.0));
        assert!(need_degrade(42, 0, 1, width, 0.0));
    }

    #[test]
    fn test_need_degrade_is_deterministic() {
        for key in 0..1_000u64 {
            let first = need_degrade(key * 7919, 1, 4, 100, 0.3);
            assert_eq!(first, need_degrade(key * 7919, 1, 4, 100, 0.3));
        }
    }

    #[test]
    fn test_copy_providers_stay_off_ring() {
        let misc = MiscConfig::default();
        let replica = replica_with(&[("tcp:a:1", false), ("tcp:b:1", true)], &misc);
        assert_eq!(replica.providers().len(), 1);
        assert_eq!(replica.copy_providers().len(), 1);
        let policy = no_probe();
        for key in 0..200u64 {
            let sel = replica.select(key, &ctx(&policy, &misc)).unwrap();
            assert_eq!(sel.main.unwrap().spec(), "tcp:a:1");
            assert!(sel.side.is_none());
        }
    }

    #[test]
    fn test_copy_only_replica_returns_copy() {
        let misc = MiscConfig::default();
        let replica = replica_with(&[("tcp:b:1", true)], &misc);
        let policy = FlowControlPolicy::default();
        let sel = replica.select(9, &ctx(&policy, &misc)).unwrap();
        assert!(sel.main.is_none());
        let (copy, kind) = sel.side.unwrap();
        assert_eq!(kind, RequestType::Copy);
        assert!(copy.is_copy());
    }

    #[test]
    fn test_copy_side_pick_with_full_percent() {
        let misc = MiscConfig::default();
        let replica = replica_with(&[("tcp:a:1", false), ("tcp:b:1", true)], &misc);
        let policy = FlowControlPolicy { copy_percent: 1.0, ..no_probe() };
        let sel = replica.select(3, &ctx(&policy, &misc)).unwrap();
        assert_eq!(sel.side.map(|(p, kind)| (p.spec().to_string(), kind)), Some(("tcp:b:1".to_string(), RequestType::Copy)));
    }

    #[test]
    fn test_zero_weight_provider_skipped() {
        let misc = MiscConfig::default();
        let replica = replica_with(&[("tcp:a:1", false), ("tcp:b:1", false)], &misc);
        replica.providers()[0].retire();
        replica.providers()[0].set_started(true);
        let policy = FlowControlPolicy { probe_percent: 1.0, ..FlowControlPolicy::default() };
        let sel = replica.select(1, &ctx(&policy, &misc)).unwrap();
        assert_eq!(sel.main.unwrap().spec(), "tcp:b:1");
    }

    #[test]
    fn test_weightless_started_providers_still_serve() {
        let misc = MiscConfig::default();
        let replica = replica_with(&[("tcp:a:1", false), ("tcp:b:1", false)], &misc);
        for provider in replica.providers() {
            provider.retire();
            provider.set_started(true);
        }
        let policy = no_probe();
        for key in 0..50u64 {
            let sel = replica.select(key, &ctx(&policy, &misc)).unwrap();
            assert!(sel.main.is_some(), "key {key} left without a main provider");
        }

        replica.providers()[0].set_started(false);
        replica.providers()[1].set_started(false);
        let err = replica.select(1, &ctx(&policy, &misc)).unwrap_err();
        assert_eq!(err, SelectError::NoProvider(0));
    }

    #[test]
    fn test_required_tags_filter() {
        let misc = MiscConfig::default();
        let mut east = TopoNode::new("search", 1, 0, "tcp:east:1", 1);
        east.tags.insert("zone".into(), "east".into());
        let west = TopoNode::new("search", 1, 0, "tcp:west:1", 1);
        let providers = vec![Arc::new(Provider::new(&east, &misc)), Arc::new(Provider::new(&west, &misc))];
        let replica = Replica::new("search", 1, 0, 1, providers, &misc);
        let policy = no_probe();

        let tags = MatchTags::require([("zone", "east")]);
        for key in 0..200u64 {
            let sel = replica
                .select(key, &SelectContext { tags: Some(&tags), ..ctx(&policy, &misc) })
                .unwrap();
            assert_eq!(sel.main.unwrap().spec(), "tcp:east:1");
        }

        let missing = MatchTags::require([("zone", "north")]);
        let err = replica
            .select(1, &SelectContext { tags: Some(&missing), ..ctx(&policy, &misc) })
            .unwrap_err();
        assert_eq!(err, SelectError::NoProvider(0));

        let preferred = MatchTags::prefer([("zone", "north")]);
        assert!(replica
            .select(1, &SelectContext { tags: Some(&preferred), ..ctx(&policy, &misc) })
            .unwrap()
            .main
            .is_some());
    }

    #[test]
    fn test_random_hash_policy_selects() {
        let misc = MiscConfig::default();
        let replica = replica_with(&[("tcp:a:1", false), ("tcp:b:1", false)], &misc);
        let policy = no_probe();
        let sel = replica
            .select(5, &SelectContext { hash_policy: &RandomHash, ..ctx(&policy, &misc) })
            .unwrap();
        assert!(sel.main.is_some());
    }

    fn degrade_policy() -> FlowControlPolicy {
        FlowControlPolicy::from_config(&FlowControlConfig {
            begin_degrade_latency_ms: 50.0,
            full_degrade_latency_ms: 150.0,
            begin_server_degrade_latency_ms: 50.0,
            full_server_degrade_latency_ms: 150.0,
            probe_percent: 0.0,
            ..FlowControlConfig::default()
        })
    }

    fn feed(replica: &Replica, latency_ms: u64, policy: &FlowControlPolicy, misc: &MiscConfig) {
        for provider in replica.providers() {
            for _ in 0..misc.min_valid_samples {
                let outcome = CallOutcome::success(Duration::from_millis(latency_ms));
                replica.update_provider(provider.id(), &outcome, policy, misc);
            }
        }
    }

    #[test]
    fn test_backup_gated_by_coverage() {
        let misc = MiscConfig::default();
        let policy = degrade_policy();

        let healthy = replica_with(&[("tcp:a:1", false), ("tcp:b:1", false)], &misc);
        feed(&healthy, 10, &policy, &misc);
        assert_eq!(healthy.degrade_cover_percent(&policy), 1.0);
        let original = healthy.providers()[0].id();
        let backup = healthy.backup_provider(0, original, None, &policy, &misc).unwrap();
        assert_ne!(backup.id(), original);

        let slow = replica_with(&[("tcp:a:1", false), ("tcp:b:1", false)], &misc);
        feed(&slow, 100, &policy, &misc);
        assert!(slow.degrade_cover_percent(&policy) < BACKUP_MIN_COVERAGE);
        assert!(slow.backup_provider(0, slow.providers()[0].id(), None, &policy, &misc).is_none());
    }

    #[test]
    fn test_full_degrade_returns_probe_only() {
        let misc = MiscConfig::default();
        let policy = degrade_policy();
        let replica = replica_with(&[("tcp:a:1", false), ("tcp:b:1", false)], &misc);
        feed(&replica, 500, &policy, &misc);
        let sel = replica.select(11, &ctx(&policy, &misc)).unwrap();
        assert!(sel.fully_degraded);
        assert!(sel.main.is_none());
        assert_eq!(sel.side.unwrap().1, RequestType::Probe);
    }

    #[test]
    fn test_update_unknown_provider() {
        let misc = MiscConfig::default();
        let replica = replica_with(&[("tcp:a:1", false)], &misc);
        let outcome = CallOutcome::success(Duration::from_millis(1));
        assert!(replica
            .update_provider(12345, &outcome, &FlowControlPolicy::default(), &misc)
            .is_none());
    }

    proptest! {
        #[test]
        fn prop_shedding_monotonic_in_coverage(
            key in any::<u64>(),
            count in 1u32..64,
            partition in 0u32..64,
            width in 1u64..20_000,
            low in 0.0f64..=1.0,
            high in 0.0f64..=1.0,
        ) {
            let (low, high) = if low <= high { (low, high) } else { (high, low) };
            let partition = partition % count;
            if need_degrade(key, partition, count, width, high) {
                prop_assert!(need_degrade(key, partition, count, width, low));
            }
            prop_assert_eq!(
                need_degrade(key, partition, count, width, low),
                need_degrade(key, partition, count, width, low)
            );
        }
    }
}
