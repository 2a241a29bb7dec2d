//! Metrics emission.
//!
//! # Responsibilities
//! - Publish per-biz traffic statistics through the `metrics` facade
//! - Count selection misses, retries and early terminations
//!
//! # Metrics
//! - `router_biz_avg_weight` (gauge): mean selection weight by biz
//! - `router_biz_avg_latency_ms` (gauge): mean replica latency by biz
//! - `router_biz_degrade_ratio` (gauge): rolling shed ratio by biz
//! - `router_biz_probe_calls` / `_copy_calls` / `_retry_calls` / `_stream_calls` (gauge): totals by biz
//! - `router_select_miss_total` (counter): misses by biz and reason
//! - `router_call_finished_total` (counter): finished calls by biz and state
//! - `router_topology_generation` (gauge): current snapshot generation
//!
//! # Design Decisions
//! - The exporter is the embedding process's choice; without a recorder
//!   every call here is a no-op

use crate::config::MiscConfig;
use crate::load_balancer::SelectError;
use crate::resilience::CoordinatorState;
use crate::topology::{BizStats, TopologySnapshot};

pub fn record_biz_stats(biz: &str, stats: &BizStats) {
    let biz = biz.to_string();
    metrics::gauge!("router_biz_avg_weight", "biz" => biz.clone()).set(stats.avg_weight);
    metrics::gauge!("router_biz_avg_latency_ms", "biz" => biz.clone()).set(stats.avg_latency_ms);
    metrics::gauge!("router_biz_degrade_ratio", "biz" => biz.clone()).set(stats.degrade_ratio);
    metrics::gauge!("router_biz_probe_calls", "biz" => biz.clone()).set(stats.probe_count as f64);
    metrics::gauge!("router_biz_copy_calls", "biz" => biz.clone()).set(stats.copy_count as f64);
    metrics::gauge!("router_biz_retry_calls", "biz" => biz.clone()).set(stats.retry_count as f64);
    metrics::gauge!("router_biz_stream_calls", "biz" => biz).set(stats.stream_count as f64);
}

/// Publish the stats of every biz in `snapshot`.
pub fn record_snapshot(snapshot: &TopologySnapshot, misc: &MiscConfig) {
    metrics::gauge!("router_topology_generation").set(snapshot.generation as f64);
    for (name, biz) in &snapshot.bizs {
        record_biz_stats(name, &biz.stats(misc));
    }
}

pub fn record_select_miss(biz: &str, error: &SelectError) {
    let reason = match error {
        SelectError::UnknownBiz(_) => "unknown_biz",
        SelectError::NoVersion(_) => "no_version",
        SelectError::NoReplica(_) => "no_replica",
        SelectError::NoProvider(_) => "no_provider",
        SelectError::Degraded(_) => "degraded",
    };
    metrics::counter!("router_select_miss_total", "biz" => biz.to_string(), "reason" => reason).increment(1);
}

pub fn record_call_finished(biz: &str, state: CoordinatorState) {
    let state = match state {
        CoordinatorState::Waiting => "waiting",
        CoordinatorState::Retrying => "retrying",
        CoordinatorState::EarlyTerminated => "early_terminated",
        CoordinatorState::Done => "done",
    };
    metrics::counter!("router_call_finished_total", "biz" => biz.to_string(), "state" => state).increment(1);
}
