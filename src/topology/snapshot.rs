//! Immutable topology generations.
//!
//! # Responsibilities
//! - Hold the replicas of every (biz, version, partition) of one generation
//! - Index providers by node id
//! - Answer introspection queries (versions, protocol versions, counts, dump)
//! - Aggregate per-biz statistics

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::config::MiscConfig;
use crate::load_balancer::{Provider, Replica};
use crate::topology::node::{NodeId, TopoNode};

/// Replicas of one version.
#[derive(Debug)]
pub struct VersionSnapshot {
    pub version: i64,
    pub partition_count: u32,
    /// Every node of the version is backup capacity.
    pub copy: bool,
    pub replicas: BTreeMap<u32, Arc<Replica>>,
}

impl VersionSnapshot {
    pub fn replica(&self, partition_id: u32) -> Option<&Arc<Replica>> {
        self.replicas.get(&partition_id)
    }

    /// Every partition has a replica.
    pub fn is_complete(&self) -> bool {
        self.replicas.len() == self.partition_count as usize
    }

    pub fn providers(&self) -> impl Iterator<Item = &Arc<Provider>> {
        self.replicas.values().flat_map(|r| r.all_providers())
    }

    /// Share of partitions with at least one healthy provider.
    pub fn healthy_partition_ratio(&self, misc: &MiscConfig) -> f64 {
        if self.partition_count == 0 {
            return 0.0;
        }
        let healthy = self
            .replicas
            .values()
            .filter(|r| r.all_providers().any(|p| p.is_healthy(misc)))
            .count();
        healthy as f64 / self.partition_count as f64
    }
}

/// Provider counts of one version, for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionInfo {
    pub part_count: u32,
    pub subscribe_count: usize,
    pub health_count: usize,
    pub stop_count: usize,
}

/// Aggregated per-biz statistics for the metrics collaborator.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BizStats {
    pub avg_weight: f64,
    pub avg_latency_ms: f64,
    pub degrade_ratio: f64,
    pub probe_count: u64,
    pub copy_count: u64,
    pub retry_count: u64,
    pub stream_count: u64,
}

/// One biz: normal and copy versions plus the nodes they were built from.
#[derive(Debug)]
pub struct BizSnapshot {
    pub biz_name: String,
    pub versions: BTreeMap<i64, Arc<VersionSnapshot>>,
    pub copy_versions: BTreeMap<i64, Arc<VersionSnapshot>>,
    pub nodes: BTreeSet<TopoNode>,
}

impl BizSnapshot {
    pub fn version(&self, version: i64) -> Option<&Arc<VersionSnapshot>> {
        self.versions
            .get(&version)
            .or_else(|| self.copy_versions.get(&version))
    }

    pub fn all_versions(&self) -> impl Iterator<Item = &Arc<VersionSnapshot>> {
        self.versions.values().chain(self.copy_versions.values())
    }

    /// Version that receives normal traffic: the newest complete version
    /// whose partitions all have a healthy provider, else the newest
    /// complete one, else the newest at all.
    pub fn serving_version(&self, misc: &MiscConfig) -> Option<&Arc<VersionSnapshot>> {
        let newest = self.versions.values().next_back();
        let complete = || self.versions.values().rev().filter(|v| v.is_complete());
        complete()
            .find(|v| v.healthy_partition_ratio(misc) >= 1.0)
            .or_else(|| complete().next())
            .or(newest)
    }

    pub fn providers(&self) -> impl Iterator<Item = &Arc<Provider>> {
        self.all_versions().flat_map(|v| v.providers())
    }

    pub fn stats(&self, misc: &MiscConfig) -> BizStats {
        let mut stats = BizStats::default();
        let mut providers = 0usize;
        let mut replicas = 0usize;
        for version in self.all_versions() {
            for replica in version.replicas.values() {
                let r = replica.stats(misc);
                replicas += 1;
                providers += r.provider_count + r.copy_count;
                stats.avg_weight += r.weight_sum as f64;
                stats.avg_latency_ms += r.avg_latency_ms;
                stats.degrade_ratio += r.degrade_ratio;
                stats.probe_count += r.probe_calls;
                stats.copy_count += r.copy_calls;
                stats.retry_count += r.retry_calls;
                stats.stream_count += r.stream_calls;
            }
        }
        if providers > 0 {
            stats.avg_weight /= providers as f64;
        }
        if replicas > 0 {
            stats.avg_latency_ms /= replicas as f64;
            stats.degrade_ratio /= replicas as f64;
        }
        stats
    }
}

/// One complete generation.
#[derive(Debug, Default)]
pub struct TopologySnapshot {
    pub generation: u64,
    pub bizs: HashMap<String, Arc<BizSnapshot>>,
    pub providers: HashMap<NodeId, Arc<Provider>>,
}

impl TopologySnapshot {
    pub fn biz(&self, biz_name: &str) -> Option<&Arc<BizSnapshot>> {
        self.bizs.get(biz_name)
    }

    pub fn provider(&self, id: NodeId) -> Option<&Arc<Provider>> {
        self.providers.get(&id)
    }

    /// Replica owning provider `id`.
    pub fn replica_of(&self, id: NodeId) -> Option<&Arc<Replica>> {
        let provider = self.providers.get(&id)?;
        let meta = provider.meta();
        self.bizs
            .get(&meta.biz_name)?
            .version(meta.version)?
            .replica(meta.partition_id)
    }

    pub fn biz_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bizs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Normal then copy versions of `biz_name`, each ascending.
    pub fn versions(&self, biz_name: &str) -> Vec<i64> {
        self.bizs
            .get(biz_name)
            .map(|biz| biz.all_versions().map(|v| v.version).collect())
            .unwrap_or_default()
    }

    pub fn protocol_versions(&self, biz_name: &str) -> BTreeSet<i32> {
        self.bizs
            .get(biz_name)
            .map(|biz| biz.providers().map(|p| p.meta().protocol_version).collect())
            .unwrap_or_default()
    }

    pub fn version_info(&self, biz_name: &str, version: i64, misc: &MiscConfig) -> Option<VersionInfo> {
        let snapshot = self.bizs.get(biz_name)?.version(version)?;
        let mut info = VersionInfo {
            part_count: snapshot.partition_count,
            ..VersionInfo::default()
        };
        for provider in snapshot.providers() {
            info.subscribe_count += 1;
            if provider.is_healthy(misc) {
                info.health_count += 1;
            }
            if !provider.is_started() {
                info.stop_count += 1;
            }
        }
        Some(info)
    }

    pub fn biz_stats(&self, biz_name: &str, misc: &MiscConfig) -> Option<BizStats> {
        self.bizs.get(biz_name).map(|biz| biz.stats(misc))
    }

    /// Human-readable listing of the whole generation.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "generation {}", self.generation);
        for name in self.biz_names() {
            let Some(biz) = self.bizs.get(&name) else { continue };
            let _ = writeln!(out, "biz {name}");
            for version in biz.all_versions() {
                let _ = writeln!(
                    out,
                    "  version {}{} partitions {}",
                    version.version,
                    if version.copy { " (copy)" } else { "" },
                    version.partition_count
                );
                for (partition, replica) in &version.replicas {
                    let _ = writeln!(out, "    partition {partition}");
                    for p in replica.all_providers() {
                        let c = p.counters();
                        let _ = writeln!(
                            out,
                            "      {} weight={}/{} started={} copy={} latency_ms={:.2} error_ratio={:.3} normal={} probe={} copy_calls={} retry={}",
                            p.spec(),
                            p.weight(),
                            p.target_weight(),
                            p.is_started(),
                            p.is_copy(),
                            p.chain().latency_ms(),
                            p.chain().error_ratio(),
                            c.normal.load(Ordering::Relaxed),
                            c.probe.load(Ordering::Relaxed),
                            c.copy.load(Ordering::Relaxed),
                            c.retry.load(Ordering::Relaxed),
                        );
                    }
                }
            }
        }
        out
    }
}
