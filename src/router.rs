//! Top-level handle wiring configuration, topology, selection and retry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use crate::config::{ConfigReload, FlowControlRegistry, RouterConfig};
use crate::health::{CallOutcome, WeightChange};
use crate::lifecycle::Shutdown;
use crate::load_balancer::{CallPlan, MatchTags, ProviderSelector};
use crate::observability::metrics;
use crate::resilience::{RetryCoordinator, RetryRateLimiter};
use crate::topology::{NodeId, StaticTopology, TopologyError, TopologyManager, TopologySnapshot, TopologySource};

/// Shared state of one routing core.
#[derive(Debug, Clone)]
pub struct Router {
    selector: ProviderSelector,
    limiter: Arc<RetryRateLimiter>,
    static_topology: Arc<StaticTopology>,
    metrics_enabled: bool,
}

impl Router {
    /// Build from a loaded config and publish its static topology, if any.
    pub fn from_config(config: &RouterConfig) -> Result<Self, TopologyError> {
        let topology = Arc::new(TopologyManager::new(config.misc.clone()));
        let policies = Arc::new(FlowControlRegistry::new(&config.default_policy, &config.policies));
        let static_topology = Arc::new(StaticTopology::new(config.topology.clone()));
        if !config.topology.is_empty() {
            topology.update(&static_topology.poll())?;
        }
        Ok(Self {
            selector: ProviderSelector::new(topology, policies),
            limiter: Arc::new(RetryRateLimiter::new()),
            static_topology,
            metrics_enabled: config.observability.metrics_enabled,
        })
    }

    pub fn selector(&self) -> &ProviderSelector {
        &self.selector
    }

    pub fn topology(&self) -> &Arc<TopologyManager> {
        self.selector.topology()
    }

    pub fn policies(&self) -> &Arc<FlowControlRegistry> {
        self.selector.policies()
    }

    pub fn static_topology(&self) -> Arc<StaticTopology> {
        self.static_topology.clone()
    }

    pub fn snapshot(&self) -> Option<Arc<TopologySnapshot>> {
        self.topology().current()
    }

    pub fn plan(&self, biz_name: &str, key: u64, tags: Option<&MatchTags>) -> CallPlan {
        let plan = self.selector.plan(biz_name, key, tags);
        for miss in &plan.misses {
            metrics::record_select_miss(biz_name, &miss.error);
        }
        plan
    }

    pub fn report(&self, id: NodeId, outcome: &CallOutcome) -> Option<WeightChange> {
        self.selector.report(id, outcome)
    }

    /// Retry coordinator for an in-flight `plan`.
    pub fn coordinator(&self, plan: &CallPlan) -> Option<RetryCoordinator> {
        RetryCoordinator::for_plan(&self.selector, plan, self.limiter.clone())
    }

    /// Apply every section of `config`.
    pub fn apply_config(&self, config: &RouterConfig) -> Result<(), TopologyError> {
        self.apply_reload(&ConfigReload::full(config.clone()))
    }

    /// Apply the changed sections of a reload. An unchanged topology keeps
    /// the current snapshot generation.
    pub fn apply_reload(&self, reload: &ConfigReload) -> Result<(), TopologyError> {
        let config = &reload.config;
        if reload.policies_changed() {
            self.policies().reload(&config.default_policy, &config.policies);
        }
        if reload.misc_changed {
            self.topology().set_misc(config.misc.clone());
        }
        if reload.observability_changed {
            tracing::warn!("Observability settings changed, they take effect on restart");
        }
        if !reload.topology_changed {
            return Ok(());
        }
        self.static_topology.replace(config.topology.clone());
        if config.topology.is_empty() {
            return Ok(());
        }
        self.topology().update(&self.static_topology.poll()).map(|_| ())
    }

    /// Start the refresh loop, the metrics loop when enabled and, when given,
    /// the config reload loop.
    pub fn spawn_background(
        &self,
        shutdown: &Shutdown,
        source: Arc<dyn TopologySource>,
        reloads: Option<mpsc::UnboundedReceiver<ConfigReload>>,
    ) {
        shutdown.spawn(
            "topology-refresh",
            self.topology().clone().run_refresh_loop(source, shutdown.subscribe()),
        );
        if self.metrics_enabled {
            shutdown.spawn("metrics", self.clone().run_metrics_loop(shutdown.subscribe()));
        }
        if let Some(rx) = reloads {
            shutdown.spawn("config-reload", self.clone().run_config_reload(rx, shutdown.subscribe()));
        }
    }

    async fn run_metrics_loop(self, mut shutdown: broadcast::Receiver<()>) {
        let interval = Duration::from_millis(self.topology().misc().refresh_interval_ms.max(1));
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(snapshot) = self.snapshot() {
                        metrics::record_snapshot(&snapshot, &self.topology().misc());
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    async fn run_config_reload(
        self,
        mut updates: mpsc::UnboundedReceiver<ConfigReload>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                update = updates.recv() => {
                    let Some(reload) = update else { break };
                    match self.apply_reload(&reload) {
                        Ok(()) => tracing::info!("Configuration reloaded"),
                        Err(e) => tracing::error!(error = %e, "Reloaded topology rejected, keeping current snapshot"),
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Config reload loop received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}
