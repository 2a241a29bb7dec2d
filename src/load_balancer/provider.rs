//! Provider abstraction.
//!
//! # Responsibilities
//! - Represent a single backend instance of one (biz, version, partition)
//! - Hold the adaptive weight and the controller chain
//! - Track connection state, heartbeat health and per-kind call counters
//! - Answer the health predicates selection relies on

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::config::{FlowControlPolicy, MiscConfig};
use crate::health::{CallOutcome, ControllerChain, ProviderWeight, WeightChange, WeightInput};
use crate::topology::node::{NodeId, TopoNode};

/// Kind of request a selected provider receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Normal,
    Probe,
    Copy,
}

/// Call counters by request kind.
#[derive(Debug, Default)]
pub struct CallCounters {
    pub normal: AtomicU64,
    pub probe: AtomicU64,
    pub copy: AtomicU64,
    pub retry: AtomicU64,
    pub stream: AtomicU64,
}

impl CallCounters {
    pub fn record(&self, request_type: RequestType) {
        let counter = match request_type {
            RequestType::Normal => &self.normal,
            RequestType::Probe => &self.probe,
            RequestType::Copy => &self.copy,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retry.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream(&self) {
        self.stream.fetch_add(1, Ordering::Relaxed);
    }
}

/// Topology-derived description of a provider; equal metadata lets a
/// provider survive a snapshot rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMeta {
    pub biz_name: String,
    pub cluster_name: String,
    pub spec: String,
    pub partition_id: u32,
    pub partition_count: u32,
    pub version: i64,
    pub protocol_version: i32,
    pub meta_env: String,
    pub copy: bool,
}

impl From<&TopoNode> for ProviderMeta {
    fn from(node: &TopoNode) -> Self {
        Self {
            biz_name: node.biz_name.clone(),
            cluster_name: node.cluster_name.clone(),
            spec: node.spec.clone(),
            partition_id: node.partition_id,
            partition_count: node.partition_count,
            version: node.version,
            protocol_version: node.protocol_version,
            meta_env: node.meta_env.clone(),
            copy: node.copy,
        }
    }
}

/// One backend instance.
#[derive(Debug)]
pub struct Provider {
    id: NodeId,
    meta: ProviderMeta,
    weight: ProviderWeight,
    chain: ControllerChain,
    /// Connection handle is ready for traffic.
    started: AtomicBool,
    retired: AtomicBool,
    heartbeat_at: RwLock<Option<Instant>>,
    tags: RwLock<BTreeMap<String, String>>,
    counters: CallCounters,
}

impl Provider {
    /// Create a provider from a discovery descriptor.
    pub fn new(node: &TopoNode, misc: &MiscConfig) -> Self {
        Self {
            id: node.node_id(),
            meta: ProviderMeta::from(node),
            weight: ProviderWeight::new(node.target_weight, misc.max_weight),
            chain: ControllerChain::new(),
            started: AtomicBool::new(true),
            retired: AtomicBool::new(false),
            heartbeat_at: RwLock::new(None),
            tags: RwLock::new(node.tags.clone()),
            counters: CallCounters::default(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn meta(&self) -> &ProviderMeta {
        &self.meta
    }

    pub fn spec(&self) -> &str {
        &self.meta.spec
    }

    pub fn biz_name(&self) -> &str {
        &self.meta.biz_name
    }

    pub fn partition_id(&self) -> u32 {
        self.meta.partition_id
    }

    pub fn is_copy(&self) -> bool {
        self.meta.copy
    }

    pub fn chain(&self) -> &ControllerChain {
        &self.chain
    }

    pub fn counters(&self) -> &CallCounters {
        &self.counters
    }

    /// Weight selection reads.
    pub fn weight(&self) -> u32 {
        self.weight.cached()
    }

    pub fn current_weight(&self) -> u32 {
        self.weight.current()
    }

    pub fn target_weight(&self) -> u32 {
        self.weight.target()
    }

    /// True when `node` describes this provider with identical topology metadata.
    pub fn same_meta(&self, node: &TopoNode) -> bool {
        self.id == node.node_id() && self.meta == ProviderMeta::from(node)
    }

    /// Carry a discovery refresh into a reused provider.
    pub fn refresh(&self, node: &TopoNode, misc: &MiscConfig) {
        if self.weight.target() != node.target_weight.min(misc.max_weight) {
            tracing::debug!(
                provider = %self.meta.spec,
                from = self.weight.target(),
                to = node.target_weight,
                "Provider target weight changed"
            );
            self.weight.set_target(node.target_weight, misc.max_weight);
        }
        let mut tags = self.tags.write();
        if *tags != node.tags {
            *tags = node.tags.clone();
        }
    }

    /// Drop out of selection for good.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        self.weight.force_zero();
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.is_retired()
    }

    /// Record a heartbeat reply from this provider.
    pub fn mark_heartbeat(&self, at: Instant) {
        *self.heartbeat_at.write() = Some(at);
    }

    /// Providers that never heartbeated are judged by call results only.
    pub fn is_heartbeat_unhealthy(&self, misc: &MiscConfig, now: Instant) -> bool {
        match *self.heartbeat_at.read() {
            Some(at) => now.saturating_duration_since(at) > Duration::from_millis(misc.heartbeat_unhealthy_interval_ms),
            None => false,
        }
    }

    /// Started, weighted and heartbeat-fresh.
    pub fn is_healthy(&self, misc: &MiscConfig) -> bool {
        self.is_started() && self.weight() > 0 && !self.is_heartbeat_unhealthy(misc, Instant::now())
    }

    /// Weight has sunk into the band served only by probe traffic.
    pub fn in_probe_band(&self, misc: &MiscConfig) -> bool {
        self.is_started() && self.weight() <= misc.probe_weight_band
    }

    /// True when every `(key, value)` pair is present in the provider's tags.
    pub fn has_tags(&self, wanted: &BTreeMap<String, String>) -> bool {
        if wanted.is_empty() {
            return true;
        }
        let tags = self.tags.read();
        wanted.iter().all(|(k, v)| tags.get(k) == Some(v))
    }

    /// Fold a call outcome into the chain and adapt the weight.
    ///
    /// `best` is the replica's best chain, used to judge relative latency.
    pub fn update_weight(
        &self,
        outcome: &CallOutcome,
        best: Option<&ControllerChain>,
        policy: &FlowControlPolicy,
        misc: &MiscConfig,
    ) -> WeightChange {
        self.chain.update(outcome, misc);
        if outcome.stream {
            self.counters.record_stream();
        }

        let chain_delta = self.chain.target_delta(best, policy, misc);
        let lb_factor = self.chain.update_load_balance(policy);

        let mut target = self.weight.target().min(misc.max_weight);
        if let Some(hint) = outcome.target_weight_hint {
            target = target.min(hint);
        }
        if !outcome.success {
            target = (target as f64 * misc.failure_target_ratio.clamp(0.0, 1.0)).round() as u32;
        }

        let change = self.weight.adjust(
            WeightInput {
                target,
                chain_delta,
                lb_factor,
                min_weight: policy.min_weight,
                confidence: self.chain.confidence(misc),
            },
            misc,
        );
        if change.current != change.previous {
            tracing::trace!(
                provider = %self.meta.spec,
                previous = change.previous,
                current = change.current,
                cached = change.cached,
                chain_delta,
                lb_factor,
                "Provider weight adjusted"
            );
        }
        change
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(spec: &str) -> TopoNode {
        TopoNode::new("search", 1, 0, spec, 1)
    }

    #[test]
    fn test_new_provider_starts_at_target() {
        let misc = MiscConfig::default();
        let mut n = node("tcp:a:1");
        n.target_weight = 60;
        let p = Provider::new(&n, &misc);
        assert_eq!(p.weight(), 60);
        assert!(p.is_healthy(&misc));
        assert!(!p.in_probe_band(&misc));
    }

    #[test]
    fn test_failures_drive_weight_down() {
        let misc = MiscConfig::default();
        let policy = FlowControlPolicy::default();
        let p = Provider::new(&node("tcp:a:1"), &misc);
        for _ in 0..50 {
            p.update_weight(&CallOutcome::failure(Duration::from_millis(5)), None, &policy, &misc);
        }
        assert_eq!(p.current_weight(), 0);
        assert_eq!(p.weight(), 0);
        assert!(p.in_probe_band(&misc));
    }

    #[test]
    fn test_first_samples_move_weight_gently() {
        let misc = MiscConfig::default();
        let policy = FlowControlPolicy::default();
        let p = Provider::new(&node("tcp:a:1"), &misc);
        let drops: Vec<u32> = (0..misc.min_valid_samples)
            .map(|_| {
                let change = p.update_weight(&CallOutcome::failure(Duration::from_millis(5)), None, &policy, &misc);
                change.previous - change.current
            })
            .collect();
        assert_eq!(drops[0], 1);
        assert!(drops.last().copied().unwrap_or_default() > drops[0], "{drops:?}");
    }

    #[test]
    fn test_streamed_outcome_counts_stream_call() {
        let misc = MiscConfig::default();
        let policy = FlowControlPolicy::default();
        let p = Provider::new(&node("tcp:a:1"), &misc);
        p.update_weight(&CallOutcome::success(Duration::from_millis(5)), None, &policy, &misc);
        p.update_weight(&CallOutcome::success(Duration::from_millis(5)).streamed(), None, &policy, &misc);
        assert_eq!(p.counters().stream.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_hint_caps_weight() {
        let misc = MiscConfig::default();
        let policy = FlowControlPolicy::default();
        let p = Provider::new(&node("tcp:a:1"), &misc);
        let outcome = CallOutcome::success(Duration::from_millis(5)).with_target_weight_hint(30);
        let change = p.update_weight(&outcome, None, &policy, &misc);
        assert!(change.cached <= 30);
    }

    #[test]
    fn test_same_meta_and_refresh() {
        let misc = MiscConfig::default();
        let n = node("tcp:a:1");
        let p = Provider::new(&n, &misc);
        let mut reweighted = n.clone();
        reweighted.target_weight = 20;
        assert!(p.same_meta(&reweighted));
        p.refresh(&reweighted, &misc);
        assert_eq!(p.target_weight(), 20);
        assert_eq!(p.weight(), 20);

        let mut moved = n.clone();
        moved.protocol_version = 2;
        assert!(!p.same_meta(&moved));
    }

    #[test]
    fn test_heartbeat_staleness() {
        let misc = MiscConfig::default();
        let p = Provider::new(&node("tcp:a:1"), &misc);
        let now = Instant::now();
        p.mark_heartbeat(now);
        assert!(!p.is_heartbeat_unhealthy(&misc, now));
        let later = now + Duration::from_millis(misc.heartbeat_unhealthy_interval_ms + 1);
        assert!(p.is_heartbeat_unhealthy(&misc, later));
    }

    #[test]
    fn test_retire_zeroes_weight() {
        let misc = MiscConfig::default();
        let p = Provider::new(&node("tcp:a:1"), &misc);
        p.retire();
        assert_eq!(p.weight(), 0);
        assert!(!p.is_started());
    }

    #[test]
    fn test_tag_matching() {
        let misc = MiscConfig::default();
        let mut n = node("tcp:a:1");
        n.tags.insert("zone".into(), "east".into());
        let p = Provider::new(&n, &misc);
        let mut wanted = BTreeMap::new();
        assert!(p.has_tags(&wanted));
        wanted.insert("zone".to_string(), "east".to_string());
        assert!(p.has_tags(&wanted));
        wanted.insert("zone".to_string(), "west".to_string());
        assert!(!p.has_tags(&wanted));
    }
}
