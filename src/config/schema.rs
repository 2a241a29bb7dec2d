//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the router.
//! All types derive Serde traits for deserialization from config files.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::topology::node::TopoNode;

/// Root configuration for the router.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RouterConfig {
    /// Process-wide weight and hashing knobs.
    pub misc: MiscConfig,

    /// Flow control applied to every biz without its own entry.
    pub default_policy: FlowControlConfig,

    /// Per-biz flow control overrides.
    pub policies: HashMap<String, FlowControlConfig>,

    /// Static topology, used when no discovery collaborator is attached.
    pub topology: Vec<TopoNode>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Provider selection algorithm used inside a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HashPolicyKind {
    /// Weighted consistent hash ring.
    #[default]
    ConsistentHash,
    /// Prefix-sum weighted random hash.
    RandomHash,
}

/// Process-wide knobs shared by every biz.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MiscConfig {
    /// Upper bound of a provider weight. Ring labels are one byte, so at most 255.
    pub max_weight: u32,

    /// Ring entries per provider.
    pub virtual_node_count: usize,

    /// Slots in the replica best-chain rotation queue.
    pub best_chain_queue_size: usize,

    /// Base step used when a provider approaches its target weight.
    pub weight_step_base: f64,

    /// Added to the step bonus after each consecutive increase.
    pub bonus_increment: f64,

    /// Ceiling for the accumulated bonus.
    pub max_bonus: f64,

    /// Weight points removed per update at a controller delta of -1.
    pub max_decrease_step: f64,

    /// Multiplier applied to the target weight of a failed call.
    pub failure_target_ratio: f64,

    /// EWMA smoothing factor of the health controllers (weight of the new sample).
    pub filter_alpha: f64,

    /// Samples before a controller is considered valid.
    pub min_valid_samples: u64,

    /// Samples a new provider needs to leave warm-up.
    pub warmup_samples: u64,

    /// Strength of the warm-up penalty, 0 disables warm-up.
    pub warmup_penalty: f64,

    /// Providers at or below this weight belong to the probe band.
    pub probe_weight_band: u32,

    /// Heartbeat age after which a provider counts as unhealthy.
    pub heartbeat_unhealthy_interval_ms: u64,

    /// Provider selection algorithm.
    pub hash_policy: HashPolicyKind,

    /// Width of one partition slice in the degrade key ring.
    pub degrade_slice_width: u64,

    /// Bound on the wait for an old snapshot generation to drain.
    pub drain_timeout_ms: u64,

    /// Interval of the topology refresh loop.
    pub refresh_interval_ms: u64,
}

impl Default for MiscConfig {
    fn default() -> Self {
        Self {
            max_weight: 100,
            virtual_node_count: 64,
            best_chain_queue_size: 4,
            weight_step_base: 4.0,
            bonus_increment: 1.0,
            max_bonus: 16.0,
            max_decrease_step: 20.0,
            failure_target_ratio: 0.5,
            filter_alpha: 0.2,
            min_valid_samples: 3,
            warmup_samples: 0,
            warmup_penalty: 0.5,
            probe_weight_band: 10,
            heartbeat_unhealthy_interval_ms: 10_000,
            hash_policy: HashPolicyKind::ConsistentHash,
            degrade_slice_width: 10_000,
            drain_timeout_ms: 5_000,
            refresh_interval_ms: 1_000,
        }
    }
}

/// Raw flow control settings as written in the config file.
///
/// Values are untrusted; `FlowControlPolicy::from_config` clamps them.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FlowControlConfig {
    pub probe_percent: f64,
    pub copy_percent: f64,
    pub error_ratio_limit: f64,
    pub latency_upper_limit_percent: f64,
    pub latency_upper_limit_ms: f64,

    pub begin_degrade_latency_ms: f64,
    pub full_degrade_latency_ms: f64,
    pub begin_degrade_error_ratio: f64,
    pub full_degrade_error_ratio: f64,

    pub begin_server_degrade_latency_ms: f64,
    pub full_server_degrade_latency_ms: f64,
    pub begin_server_degrade_error_ratio: f64,
    pub full_server_degrade_error_ratio: f64,

    pub min_degrade_coverage: f64,

    pub et_trigger_percent: f64,
    pub et_wait_time_factor: f64,
    pub et_min_wait_ms: i64,
    pub retry_trigger_percent: f64,
    pub retry_wait_time_factor: f64,
    pub retry_min_wait_ms: i64,
    pub retry_rate_limit: i64,
    pub min_retry_weight: i64,

    pub min_weight: i64,
    pub ignore_weight_label: bool,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            probe_percent: 0.01,
            copy_percent: 0.0,
            error_ratio_limit: 0.1,
            latency_upper_limit_percent: 0.4,
            latency_upper_limit_ms: 10.0,
            begin_degrade_latency_ms: 10_000.0,
            full_degrade_latency_ms: 20_000.0,
            begin_degrade_error_ratio: 0.5,
            full_degrade_error_ratio: 1.0,
            begin_server_degrade_latency_ms: 10_000.0,
            full_server_degrade_latency_ms: 20_000.0,
            begin_server_degrade_error_ratio: 0.5,
            full_server_degrade_error_ratio: 1.0,
            min_degrade_coverage: 0.1,
            et_trigger_percent: 1.0,
            et_wait_time_factor: 0.0,
            et_min_wait_ms: 0,
            retry_trigger_percent: 1.0,
            retry_wait_time_factor: 0.0,
            retry_min_wait_ms: 0,
            retry_rate_limit: 100,
            min_retry_weight: 10,
            min_weight: 0,
            ignore_weight_label: false,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit per-biz gauges through the `metrics` facade.
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
        }
    }
}
