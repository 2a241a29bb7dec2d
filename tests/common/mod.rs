//! Shared utilities for integration and load testing.

use std::sync::Arc;
use std::time::Duration;

use biz_router::config::{FlowControlConfig, RouterConfig};
use biz_router::health::CallOutcome;
use biz_router::load_balancer::Provider;
use biz_router::resilience::{CallContext, PendingPartition, ReplySummary};
use biz_router::topology::TopoNode;
use biz_router::Router;
use parking_lot::Mutex;

/// `count` providers per partition, addressed `tcp:p{partition}-{i}:9000`.
pub fn nodes(biz: &str, partitions: u32, per_partition: u32, version: i64) -> Vec<TopoNode> {
    let mut nodes = Vec::new();
    for partition in 0..partitions {
        for i in 0..per_partition {
            let spec = format!("tcp:p{partition}-{i}:9000");
            nodes.push(TopoNode::new(biz, partitions, partition, &spec, version));
        }
    }
    nodes
}

/// Router over `nodes` with `policy` as the default flow control.
pub fn router(nodes: Vec<TopoNode>, policy: FlowControlConfig) -> Router {
    let config = RouterConfig {
        default_policy: policy,
        topology: nodes,
        ..RouterConfig::default()
    };
    Router::from_config(&config).unwrap()
}

pub fn quiet_policy() -> FlowControlConfig {
    FlowControlConfig {
        probe_percent: 0.0,
        ..FlowControlConfig::default()
    }
}

pub fn ok(ms: u64) -> CallOutcome {
    CallOutcome::success(Duration::from_millis(ms))
}

pub fn failed(ms: u64) -> CallOutcome {
    CallOutcome::failure(Duration::from_millis(ms))
}

/// Programmable in-flight call.
#[allow(dead_code)]
#[derive(Default)]
pub struct ScriptedCall {
    pub summary: Mutex<ReplySummary>,
    pub pending: Mutex<Vec<PendingPartition>>,
    pub terminate: Mutex<bool>,
    pub retries: Mutex<Vec<(u32, Arc<Provider>)>>,
}

#[allow(dead_code)]
impl ScriptedCall {
    pub fn set(&self, summary: ReplySummary, pending: Vec<PendingPartition>) {
        *self.summary.lock() = summary;
        *self.pending.lock() = pending;
    }

    pub fn retried_specs(&self) -> Vec<(u32, String)> {
        self.retries
            .lock()
            .iter()
            .map(|(partition, p)| (*partition, p.spec().to_string()))
            .collect()
    }
}

impl CallContext for ScriptedCall {
    fn can_terminate(&self) -> bool {
        *self.terminate.lock()
    }

    fn reply_summary(&self) -> ReplySummary {
        *self.summary.lock()
    }

    fn pending_partitions(&self) -> Vec<PendingPartition> {
        self.pending.lock().clone()
    }

    fn dispatch_retry(&self, partition_id: u32, provider: Arc<Provider>) {
        self.retries.lock().push((partition_id, provider));
    }
}
