//! Validated per-biz flow control policy.
//!
//! # Responsibilities
//! - Turn a raw `FlowControlConfig` into an immutable `FlowControlPolicy`
//! - Clamp out-of-range values with a warning instead of failing
//! - Serve the policy of a biz to selection, degradation and retry
//!
//! # Design Decisions
//! - Percentages are clamped to [0, 1]
//! - Every "begin" threshold is forced at or below its "full" threshold
//! - Server-side degradation begins no later than client-side degradation
//! - The registry swaps the whole policy map atomically on reload

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::schema::FlowControlConfig;

/// Immutable thresholds for one biz.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowControlPolicy {
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
    /// Early termination is disabled when this is 0.
    pub et_wait_time_factor: f64,
    pub et_min_wait_ms: u64,
    pub retry_trigger_percent: f64,
    /// Retry is disabled when this is 0.
    pub retry_wait_time_factor: f64,
    pub retry_min_wait_ms: u64,
    /// Retries per second, per biz.
    pub retry_rate_limit: u64,
    pub min_retry_weight: u32,

    pub min_weight: u32,
    pub ignore_weight_label: bool,
}

impl Default for FlowControlPolicy {
    fn default() -> Self {
        Self::from_config(&FlowControlConfig::default())
    }
}

impl FlowControlPolicy {
    /// Build a policy, clamping every value that is out of range.
    pub fn from_config(config: &FlowControlConfig) -> Self {
        let mut policy = Self {
            probe_percent: clamp_percent("probe_percent", config.probe_percent),
            copy_percent: clamp_percent("copy_percent", config.copy_percent),
            error_ratio_limit: clamp_percent("error_ratio_limit", config.error_ratio_limit),
            latency_upper_limit_percent: non_negative(
                "latency_upper_limit_percent",
                config.latency_upper_limit_percent,
            ),
            latency_upper_limit_ms: non_negative("latency_upper_limit_ms", config.latency_upper_limit_ms),

            begin_degrade_latency_ms: non_negative("begin_degrade_latency_ms", config.begin_degrade_latency_ms),
            full_degrade_latency_ms: non_negative("full_degrade_latency_ms", config.full_degrade_latency_ms),
            begin_degrade_error_ratio: clamp_percent("begin_degrade_error_ratio", config.begin_degrade_error_ratio),
            full_degrade_error_ratio: clamp_percent("full_degrade_error_ratio", config.full_degrade_error_ratio),

            begin_server_degrade_latency_ms: non_negative(
                "begin_server_degrade_latency_ms",
                config.begin_server_degrade_latency_ms,
            ),
            full_server_degrade_latency_ms: non_negative(
                "full_server_degrade_latency_ms",
                config.full_server_degrade_latency_ms,
            ),
            begin_server_degrade_error_ratio: clamp_percent(
                "begin_server_degrade_error_ratio",
                config.begin_server_degrade_error_ratio,
            ),
            full_server_degrade_error_ratio: clamp_percent(
                "full_server_degrade_error_ratio",
                config.full_server_degrade_error_ratio,
            ),

            min_degrade_coverage: clamp_percent("min_degrade_coverage", config.min_degrade_coverage),

            et_trigger_percent: clamp_percent("et_trigger_percent", config.et_trigger_percent),
            et_wait_time_factor: non_negative("et_wait_time_factor", config.et_wait_time_factor),
            et_min_wait_ms: non_negative_int("et_min_wait_ms", config.et_min_wait_ms),
            retry_trigger_percent: clamp_percent("retry_trigger_percent", config.retry_trigger_percent),
            retry_wait_time_factor: non_negative("retry_wait_time_factor", config.retry_wait_time_factor),
            retry_min_wait_ms: non_negative_int("retry_min_wait_ms", config.retry_min_wait_ms),
            retry_rate_limit: non_negative_int("retry_rate_limit", config.retry_rate_limit),
            min_retry_weight: to_weight("min_retry_weight", config.min_retry_weight),

            min_weight: to_weight("min_weight", config.min_weight),
            ignore_weight_label: config.ignore_weight_label,
        };

        order_pair(
            "degrade_latency_ms",
            &mut policy.begin_degrade_latency_ms,
            &mut policy.full_degrade_latency_ms,
        );
        order_pair(
            "degrade_error_ratio",
            &mut policy.begin_degrade_error_ratio,
            &mut policy.full_degrade_error_ratio,
        );
        order_pair(
            "server_degrade_latency_ms",
            &mut policy.begin_server_degrade_latency_ms,
            &mut policy.full_server_degrade_latency_ms,
        );
        order_pair(
            "server_degrade_error_ratio",
            &mut policy.begin_server_degrade_error_ratio,
            &mut policy.full_server_degrade_error_ratio,
        );

        // Server-side shedding has to kick in before the client starts dropping keys.
        if policy.begin_server_degrade_latency_ms > policy.begin_degrade_latency_ms {
            tracing::warn!(
                server = policy.begin_server_degrade_latency_ms,
                client = policy.begin_degrade_latency_ms,
                "begin_server_degrade_latency_ms above client threshold, lowering"
            );
            policy.begin_server_degrade_latency_ms = policy.begin_degrade_latency_ms;
            policy.full_server_degrade_latency_ms = policy
                .full_server_degrade_latency_ms
                .max(policy.begin_server_degrade_latency_ms);
        }
        if policy.begin_server_degrade_error_ratio > policy.begin_degrade_error_ratio {
            tracing::warn!(
                server = policy.begin_server_degrade_error_ratio,
                client = policy.begin_degrade_error_ratio,
                "begin_server_degrade_error_ratio above client threshold, lowering"
            );
            policy.begin_server_degrade_error_ratio = policy.begin_degrade_error_ratio;
            policy.full_server_degrade_error_ratio = policy
                .full_server_degrade_error_ratio
                .max(policy.begin_server_degrade_error_ratio);
        }

        policy
    }

    /// True when early termination may trigger at all.
    pub fn early_termination_enabled(&self) -> bool {
        self.et_wait_time_factor > 0.0
    }

    /// True when retries may be issued at all.
    pub fn retry_enabled(&self) -> bool {
        self.retry_wait_time_factor > 0.0 && self.retry_rate_limit > 0
    }
}

fn clamp_percent(name: &str, value: f64) -> f64 {
    if value.is_nan() {
        tracing::warn!(field = name, "NaN flow control value, using 0");
        return 0.0;
    }
    if !(0.0..=1.0).contains(&value) {
        let clamped = value.clamp(0.0, 1.0);
        tracing::warn!(field = name, value, clamped, "flow control percentage out of range");
        return clamped;
    }
    value
}

fn non_negative(name: &str, value: f64) -> f64 {
    if value.is_nan() || value < 0.0 {
        tracing::warn!(field = name, value, "negative flow control value, using 0");
        return 0.0;
    }
    value
}

fn non_negative_int(name: &str, value: i64) -> u64 {
    if value < 0 {
        tracing::warn!(field = name, value, "negative flow control window, using 0");
        return 0;
    }
    value as u64
}

fn to_weight(name: &str, value: i64) -> u32 {
    let clamped = value.clamp(0, u8::MAX as i64);
    if clamped != value {
        tracing::warn!(field = name, value, clamped, "flow control weight out of range");
    }
    clamped as u32
}

fn order_pair(name: &str, begin: &mut f64, full: &mut f64) {
    if *begin > *full {
        tracing::warn!(field = name, begin = *begin, full = *full, "begin threshold above full threshold, raising full");
        *full = *begin;
    }
}

/// Policies of every biz, swapped atomically when the config reloads.
#[derive(Debug)]
pub struct FlowControlRegistry {
    policies: ArcSwap<HashMap<String, Arc<FlowControlPolicy>>>,
    default_policy: ArcSwap<FlowControlPolicy>,
}

impl FlowControlRegistry {
    /// Create a registry from raw configuration.
    pub fn new(default_config: &FlowControlConfig, configs: &HashMap<String, FlowControlConfig>) -> Self {
        let registry = Self {
            policies: ArcSwap::from_pointee(HashMap::new()),
            default_policy: ArcSwap::from_pointee(FlowControlPolicy::default()),
        };
        registry.reload(default_config, configs);
        registry
    }

    /// Replace every policy at once.
    pub fn reload(&self, default_config: &FlowControlConfig, configs: &HashMap<String, FlowControlConfig>) {
        let policies = configs
            .iter()
            .map(|(biz, config)| (biz.clone(), Arc::new(FlowControlPolicy::from_config(config))))
            .collect::<HashMap<_, _>>();
        tracing::info!(bizs = policies.len(), "Flow control policies loaded");
        self.default_policy
            .store(Arc::new(FlowControlPolicy::from_config(default_config)));
        self.policies.store(Arc::new(policies));
    }

    /// The policy of `biz`, falling back to the default policy.
    pub fn get(&self, biz: &str) -> Arc<FlowControlPolicy> {
        match self.policies.load().get(biz) {
            Some(policy) => policy.clone(),
            None => self.default_policy.load_full(),
        }
    }
}

impl Default for FlowControlRegistry {
    fn default() -> Self {
        Self::new(&FlowControlConfig::default(), &HashMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentages_clamped() {
        let config = FlowControlConfig {
            probe_percent: 1.7,
            error_ratio_limit: -0.2,
            retry_rate_limit: -5,
            min_weight: 900,
            ..FlowControlConfig::default()
        };
        let policy = FlowControlPolicy::from_config(&config);
        assert_eq!(policy.probe_percent, 1.0);
        assert_eq!(policy.error_ratio_limit, 0.0);
        assert_eq!(policy.retry_rate_limit, 0);
        assert_eq!(policy.min_weight, 255);
    }

    #[test]
    fn test_begin_forced_below_full() {
        let config = FlowControlConfig {
            begin_degrade_latency_ms: 300.0,
            full_degrade_latency_ms: 100.0,
            ..FlowControlConfig::default()
        };
        let policy = FlowControlPolicy::from_config(&config);
        assert!(policy.begin_degrade_latency_ms <= policy.full_degrade_latency_ms);
        assert_eq!(policy.full_degrade_latency_ms, 300.0);
    }

    #[test]
    fn test_server_side_begins_earlier() {
        let config = FlowControlConfig {
            begin_degrade_latency_ms: 50.0,
            full_degrade_latency_ms: 150.0,
            begin_server_degrade_latency_ms: 80.0,
            full_server_degrade_latency_ms: 90.0,
            begin_degrade_error_ratio: 0.2,
            begin_server_degrade_error_ratio: 0.4,
            ..FlowControlConfig::default()
        };
        let policy = FlowControlPolicy::from_config(&config);
        assert_eq!(policy.begin_server_degrade_latency_ms, 50.0);
        assert_eq!(policy.full_server_degrade_latency_ms, 90.0);
        assert_eq!(policy.begin_server_degrade_error_ratio, 0.2);
    }

    #[test]
    fn test_registry_fallback_and_reload() {
        let mut configs = HashMap::new();
        configs.insert(
            "search".to_string(),
            FlowControlConfig { probe_percent: 0.5, ..FlowControlConfig::default() },
        );
        let registry = FlowControlRegistry::new(&FlowControlConfig::default(), &configs);
        assert_eq!(registry.get("search").probe_percent, 0.5);
        assert_eq!(registry.get("other").probe_percent, 0.01);

        configs.clear();
        registry.reload(&FlowControlConfig { probe_percent: 0.2, ..FlowControlConfig::default() }, &configs);
        assert_eq!(registry.get("search").probe_percent, 0.2);
    }
}
