//! Per-call provider selection across versions and partitions.
//!
//! # Responsibilities
//! - Resolve the biz, its serving version and one replica per partition
//! - Collect main, probe and copy requests into a `CallPlan`
//! - Keep other versions warm with probe traffic
//! - Route call outcomes back to the owning replica

use std::sync::Arc;

use crate::config::FlowControlRegistry;
use crate::health::{CallOutcome, WeightChange};
use crate::load_balancer::provider::{Provider, RequestType};
use crate::load_balancer::replica::{Replica, SelectContext};
use crate::load_balancer::{hash_policy_for, sample, MatchTags, SelectError};
use crate::topology::{NodeId, TopologyManager, TopologySnapshot};

/// One request to dispatch.
#[derive(Debug, Clone)]
pub struct PlannedCall {
    pub partition_id: u32,
    pub version: i64,
    pub provider: Arc<Provider>,
    pub request_type: RequestType,
}

/// A partition (or the whole biz) that received no main provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectMiss {
    pub partition_id: Option<u32>,
    pub error: SelectError,
}

/// Everything selected for one call.
#[derive(Debug, Clone, Default)]
pub struct CallPlan {
    pub biz_name: String,
    pub key: u64,
    pub generation: u64,
    pub version: Option<i64>,
    pub partition_count: u32,
    pub calls: Vec<PlannedCall>,
    pub misses: Vec<SelectMiss>,
}

impl CallPlan {
    /// Main requests, one per served partition.
    pub fn normal_calls(&self) -> impl Iterator<Item = &PlannedCall> {
        self.calls
            .iter()
            .filter(|c| c.request_type == RequestType::Normal)
    }

    pub fn side_calls(&self) -> impl Iterator<Item = &PlannedCall> {
        self.calls
            .iter()
            .filter(|c| c.request_type != RequestType::Normal)
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    fn miss(&mut self, partition_id: Option<u32>, error: SelectError) {
        self.misses.push(SelectMiss { partition_id, error });
    }

    fn push(&mut self, replica: &Replica, provider: Arc<Provider>, request_type: RequestType) {
        provider.counters().record(request_type);
        self.calls.push(PlannedCall {
            partition_id: replica.partition_id(),
            version: replica.version(),
            provider,
            request_type,
        });
    }
}

/// Composes call plans from the current topology and policies.
#[derive(Debug, Clone)]
pub struct ProviderSelector {
    topology: Arc<TopologyManager>,
    policies: Arc<FlowControlRegistry>,
}

impl ProviderSelector {
    pub fn new(topology: Arc<TopologyManager>, policies: Arc<FlowControlRegistry>) -> Self {
        Self { topology, policies }
    }

    pub fn topology(&self) -> &Arc<TopologyManager> {
        &self.topology
    }

    pub fn policies(&self) -> &Arc<FlowControlRegistry> {
        &self.policies
    }

    /// Select providers for every partition of `biz_name`.
    pub fn plan(&self, biz_name: &str, key: u64, tags: Option<&MatchTags>) -> CallPlan {
        let mut plan = CallPlan {
            biz_name: biz_name.to_string(),
            key,
            ..CallPlan::default()
        };

        let Some(snapshot) = self.topology.current() else {
            plan.miss(None, SelectError::UnknownBiz(biz_name.to_string()));
            return plan;
        };
        plan.generation = snapshot.generation;
        let Some(biz) = snapshot.biz(biz_name) else {
            plan.miss(None, SelectError::UnknownBiz(biz_name.to_string()));
            return plan;
        };

        let misc = self.topology.misc();
        let policy = self.policies.get(biz_name);
        let ctx = SelectContext {
            policy: &policy,
            misc: &misc,
            hash_policy: hash_policy_for(misc.hash_policy),
            tags,
        };

        let Some(serving) = biz.serving_version(&misc) else {
            plan.miss(None, SelectError::NoVersion(biz_name.to_string()));
            return plan;
        };
        plan.version = Some(serving.version);
        plan.partition_count = serving.partition_count;

        for partition_id in 0..serving.partition_count {
            let Some(replica) = serving.replica(partition_id) else {
                tracing::warn!(biz = %biz_name, version = serving.version, partition_id, "Partition has no replica");
                plan.miss(Some(partition_id), SelectError::NoReplica(partition_id));
                continue;
            };
            match replica.select(key, &ctx) {
                Ok(selection) => {
                    match selection.main {
                        Some(main) => plan.push(replica, main, RequestType::Normal),
                        None if selection.fully_degraded => {
                            plan.miss(Some(partition_id), SelectError::Degraded(partition_id))
                        }
                        None => plan.miss(Some(partition_id), SelectError::NoProvider(partition_id)),
                    }
                    if let Some((side, request_type)) = selection.side {
                        plan.push(replica, side, request_type);
                    }
                }
                Err(error) => plan.miss(Some(partition_id), error),
            }
        }

        // Other versions only see side traffic and keep their health state untouched.
        for version in biz.versions.values().filter(|v| v.version != serving.version) {
            if version.partition_count == 0 || !sample(policy.probe_percent) {
                continue;
            }
            let partition_id = (key % version.partition_count as u64) as u32;
            if let Some(replica) = version.replica(partition_id) {
                if let Some(provider) = replica.side_provider(key, &ctx) {
                    plan.push(replica, provider, RequestType::Probe);
                }
            }
        }

        for version in biz.copy_versions.values() {
            if version.partition_count == 0 || !sample(policy.copy_percent) {
                continue;
            }
            let partition_id = (key % version.partition_count as u64) as u32;
            if let Some(replica) = version.replica(partition_id) {
                if let Some(copy) = replica.side_provider(key, &ctx) {
                    plan.push(replica, copy, RequestType::Copy);
                }
            }
        }

        if !plan.misses.is_empty() {
            tracing::debug!(
                biz = %biz_name,
                key,
                served = plan.normal_calls().count(),
                misses = plan.misses.len(),
                "Call plan incomplete"
            );
        }
        plan
    }

    /// Feed a completed call back into health state.
    pub fn report(&self, id: NodeId, outcome: &CallOutcome) -> Option<WeightChange> {
        let snapshot = self.topology.current()?;
        self.report_in(&snapshot, id, outcome)
    }

    /// Feed a completed call back into the health state of `snapshot`.
    pub fn report_in(&self, snapshot: &TopologySnapshot, id: NodeId, outcome: &CallOutcome) -> Option<WeightChange> {
        let Some(replica) = snapshot.replica_of(id) else {
            tracing::warn!(provider = id, generation = snapshot.generation, "Outcome for a provider outside the topology");
            return None;
        };
        let policy = self.policies.get(replica.biz_name());
        let misc = self.topology.misc();
        replica.update_provider(id, outcome, &policy, &misc)
    }
}
