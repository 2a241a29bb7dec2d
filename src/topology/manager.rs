//! Publishing topology generations.
//!
//! # Responsibilities
//! - Serialise rebuilds and publish each generation with one atomic swap
//! - Wake callers waiting for the first generation
//! - Retire dropped providers and watch old generations drain
//! - Poll a discovery source on an interval until shutdown

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::{Condvar, Mutex};
use tokio::sync::broadcast;
use tokio::time;

use crate::config::MiscConfig;
use crate::topology::builder::{build_snapshot, TopologyError};
use crate::topology::node::{group_by_biz, TopoNode, TopoNodeMap};
use crate::topology::snapshot::TopologySnapshot;

const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Discovery collaborator.
pub trait TopologySource: Send + Sync {
    /// Current descriptor set, grouped by biz.
    fn poll(&self) -> TopoNodeMap;
}

/// Source backed by the static topology section of the config.
#[derive(Debug, Default)]
pub struct StaticTopology {
    nodes: Mutex<TopoNodeMap>,
}

impl StaticTopology {
    pub fn new(nodes: Vec<TopoNode>) -> Self {
        Self {
            nodes: Mutex::new(group_by_biz(nodes)),
        }
    }

    /// Replace the descriptor set, e.g. after a config reload.
    pub fn replace(&self, nodes: Vec<TopoNode>) {
        *self.nodes.lock() = group_by_biz(nodes);
    }
}

impl TopologySource for StaticTopology {
    fn poll(&self) -> TopoNodeMap {
        self.nodes.lock().clone()
    }
}

/// Owner of the current topology generation.
#[derive(Debug)]
pub struct TopologyManager {
    current: ArcSwapOption<TopologySnapshot>,
    /// Serialises writers; holds the last published generation number.
    writer: Mutex<u64>,
    published: Mutex<bool>,
    first_published: Condvar,
    misc: ArcSwap<MiscConfig>,
}

impl TopologyManager {
    pub fn new(misc: MiscConfig) -> Self {
        Self {
            current: ArcSwapOption::empty(),
            writer: Mutex::new(0),
            published: Mutex::new(false),
            first_published: Condvar::new(),
            misc: ArcSwap::from_pointee(misc),
        }
    }

    /// Current generation, if any was published.
    pub fn current(&self) -> Option<Arc<TopologySnapshot>> {
        self.current.load_full()
    }

    pub fn misc(&self) -> Arc<MiscConfig> {
        self.misc.load_full()
    }

    /// Settings used by subsequent rebuilds.
    pub fn set_misc(&self, misc: MiscConfig) {
        self.misc.store(Arc::new(misc));
    }

    /// Block until the first generation is published or `timeout` passes.
    pub fn wait_for_first(&self, timeout: Duration) -> Result<Arc<TopologySnapshot>, TopologyError> {
        let deadline = Instant::now() + timeout;
        let mut published = self.published.lock();
        while !*published {
            if self.first_published.wait_until(&mut published, deadline).timed_out() {
                break;
            }
        }
        drop(published);
        self.current().ok_or(TopologyError::BringUpTimeout(timeout))
    }

    /// Rebuild from `nodes` and publish the result.
    ///
    /// An inconsistent input leaves the current generation in place.
    pub fn update(&self, nodes: &TopoNodeMap) -> Result<Arc<TopologySnapshot>, TopologyError> {
        let mut generation = self.writer.lock();
        let previous = self.current.load_full();

        if let Some(prev) = &previous {
            if unchanged(prev, nodes) {
                return Ok(prev.clone());
            }
        }

        let misc = self.misc.load();
        let output = match build_snapshot(previous.as_deref(), nodes, &misc, *generation + 1) {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(error = %e, generation = *generation, "Topology update rejected, keeping current snapshot");
                return Err(e);
            }
        };

        let snapshot = Arc::new(output.snapshot);
        self.current.store(Some(snapshot.clone()));
        *generation += 1;

        tracing::info!(
            generation = *generation,
            bizs = snapshot.bizs.len(),
            providers = snapshot.providers.len(),
            rebuilt = ?output.rebuilt,
            retired = output.retired.len(),
            "Topology snapshot published"
        );

        for provider in &output.retired {
            provider.retire();
        }

        {
            let mut published = self.published.lock();
            if !*published {
                *published = true;
                self.first_published.notify_all();
            }
        }

        if let Some(old) = previous {
            spawn_drain(old, Duration::from_millis(misc.drain_timeout_ms));
        }
        Ok(snapshot)
    }

    /// Poll `source` every `refresh_interval_ms` until shutdown.
    pub async fn run_refresh_loop(
        self: Arc<Self>,
        source: Arc<dyn TopologySource>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let interval = Duration::from_millis(self.misc().refresh_interval_ms.max(1));
        tracing::info!(interval_ms = interval.as_millis() as u64, "Topology refresh loop starting");
        let mut ticker = time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let nodes = source.poll();
                    let manager = self.clone();
                    let result = tokio::task::spawn_blocking(move || manager.update(&nodes)).await;
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Topology rebuild task failed");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Topology refresh loop received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

fn unchanged(snapshot: &TopologySnapshot, nodes: &TopoNodeMap) -> bool {
    let non_empty = nodes.values().filter(|set| !set.is_empty()).count();
    non_empty == snapshot.bizs.len()
        && nodes
            .iter()
            .filter(|(_, set)| !set.is_empty())
            .all(|(biz, set)| snapshot.bizs.get(biz).is_some_and(|b| b.nodes == *set))
}

/// Wait on a background thread until nobody but us holds `old`.
fn spawn_drain(old: Arc<TopologySnapshot>, timeout: Duration) {
    let generation = old.generation;
    let spawned = thread::Builder::new()
        .name(format!("topology-drain-{generation}"))
        .spawn(move || {
            let started = Instant::now();
            while Arc::strong_count(&old) > 1 {
                if started.elapsed() >= timeout {
                    tracing::warn!(
                        generation,
                        holders = Arc::strong_count(&old) - 1,
                        "Old topology generation still referenced after drain timeout"
                    );
                    return;
                }
                thread::sleep(DRAIN_POLL);
            }
            tracing::debug!(generation, elapsed_ms = started.elapsed().as_millis() as u64, "Old topology generation drained");
        });
    if let Err(e) = spawned {
        tracing::warn!(error = %e, generation, "Failed to spawn drain thread");
    }
}
