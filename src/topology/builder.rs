//! Diffing snapshot rebuild.
//!
//! # Responsibilities
//! - Check the discovery input for inconsistencies before touching anything
//! - Carry unchanged bizzes over by `Arc`
//! - Reuse providers whose topology metadata is unchanged
//! - Report the providers the new generation no longer contains

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::MiscConfig;
use crate::load_balancer::{Provider, Replica};
use crate::topology::node::{NodeId, TopoNode, TopoNodeMap};
use crate::topology::snapshot::{BizSnapshot, TopologySnapshot, VersionSnapshot};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("biz {biz}: node {id:#x} reported twice with different metadata")]
    ConflictingNode { biz: String, id: NodeId },

    #[error("biz {biz} version {version}: partition {partition_id} out of range for {partition_count} partitions")]
    PartitionOutOfRange {
        biz: String,
        version: i64,
        partition_id: u32,
        partition_count: u32,
    },

    #[error("biz {biz} version {version}: partition count {found} disagrees with {expected}")]
    PartitionCountMismatch {
        biz: String,
        version: i64,
        expected: u32,
        found: u32,
    },

    #[error("biz {biz} version {version}: partition count is zero")]
    ZeroPartitionCount { biz: String, version: i64 },

    #[error("no topology published within {0:?}")]
    BringUpTimeout(Duration),
}

/// A built generation plus the providers it dropped.
#[derive(Debug)]
pub struct BuildOutput {
    pub snapshot: TopologySnapshot,
    pub retired: Vec<Arc<Provider>>,
    /// Bizzes rebuilt rather than carried over.
    pub rebuilt: Vec<String>,
}

/// Build generation `generation` from `nodes`, reusing state from `previous`.
pub fn build_snapshot(
    previous: Option<&TopologySnapshot>,
    nodes: &TopoNodeMap,
    misc: &MiscConfig,
    generation: u64,
) -> Result<BuildOutput, TopologyError> {
    for (biz, set) in nodes {
        check_biz(biz, set.iter())?;
    }

    let mut snapshot = TopologySnapshot {
        generation,
        ..TopologySnapshot::default()
    };
    let mut rebuilt = Vec::new();

    for (biz_name, set) in nodes {
        if set.is_empty() {
            continue;
        }
        let carried = previous
            .and_then(|prev| prev.bizs.get(biz_name))
            .filter(|old| old.nodes == *set)
            .cloned();
        let biz = match carried {
            Some(old) => old,
            None => {
                rebuilt.push(biz_name.clone());
                Arc::new(build_biz(biz_name, set, previous, misc))
            }
        };
        for provider in biz.providers() {
            snapshot.providers.insert(provider.id(), provider.clone());
        }
        snapshot.bizs.insert(biz_name.clone(), biz);
    }

    let retired = previous
        .map(|prev| {
            prev.providers
                .values()
                .filter(|old| {
                    snapshot
                        .providers
                        .get(&old.id())
                        .map_or(true, |new| !Arc::ptr_eq(old, new))
                })
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    Ok(BuildOutput {
        snapshot,
        retired,
        rebuilt,
    })
}

fn check_biz<'a, I>(biz: &str, nodes: I) -> Result<(), TopologyError>
where
    I: Iterator<Item = &'a TopoNode>,
{
    let mut seen: HashMap<NodeId, &TopoNode> = HashMap::new();
    let mut counts: HashMap<i64, u32> = HashMap::new();
    for node in nodes {
        if node.partition_count == 0 {
            return Err(TopologyError::ZeroPartitionCount {
                biz: biz.to_string(),
                version: node.version,
            });
        }
        if node.partition_id >= node.partition_count {
            return Err(TopologyError::PartitionOutOfRange {
                biz: biz.to_string(),
                version: node.version,
                partition_id: node.partition_id,
                partition_count: node.partition_count,
            });
        }
        let expected = *counts.entry(node.version).or_insert(node.partition_count);
        if expected != node.partition_count {
            return Err(TopologyError::PartitionCountMismatch {
                biz: biz.to_string(),
                version: node.version,
                expected,
                found: node.partition_count,
            });
        }
        let id = node.node_id();
        if let Some(existing) = seen.insert(id, node) {
            if existing != node {
                return Err(TopologyError::ConflictingNode {
                    biz: biz.to_string(),
                    id,
                });
            }
        }
    }
    Ok(())
}

fn build_biz(
    biz_name: &str,
    nodes: &std::collections::BTreeSet<TopoNode>,
    previous: Option<&TopologySnapshot>,
    misc: &MiscConfig,
) -> BizSnapshot {
    let mut by_version: BTreeMap<i64, BTreeMap<u32, Vec<&TopoNode>>> = BTreeMap::new();
    for node in nodes {
        by_version
            .entry(node.version)
            .or_default()
            .entry(node.partition_id)
            .or_default()
            .push(node);
    }

    let mut versions = BTreeMap::new();
    let mut copy_versions = BTreeMap::new();
    let mut reused = 0usize;
    let mut created = 0usize;
    for (version, partitions) in by_version {
        let mut partition_count = 0;
        let mut all_copy = true;
        let mut replicas = BTreeMap::new();
        for (partition_id, members) in partitions {
            let mut providers = Vec::with_capacity(members.len());
            let mut ids = HashSet::new();
            for node in members {
                partition_count = node.partition_count;
                all_copy &= node.copy;
                if !ids.insert(node.node_id()) {
                    continue;
                }
                let provider = match reusable(previous, node) {
                    Some(existing) => {
                        existing.refresh(node, misc);
                        reused += 1;
                        existing
                    }
                    None => {
                        created += 1;
                        Arc::new(Provider::new(node, misc))
                    }
                };
                providers.push(provider);
            }
            replicas.insert(
                partition_id,
                Arc::new(Replica::new(biz_name, version, partition_id, partition_count, providers, misc)),
            );
        }
        let snapshot = Arc::new(VersionSnapshot {
            version,
            partition_count,
            copy: all_copy,
            replicas,
        });
        if all_copy {
            copy_versions.insert(version, snapshot);
        } else {
            versions.insert(version, snapshot);
        }
    }

    tracing::debug!(biz = %biz_name, reused, created, "Biz snapshot rebuilt");
    BizSnapshot {
        biz_name: biz_name.to_string(),
        versions,
        copy_versions,
        nodes: nodes.clone(),
    }
}

fn reusable(previous: Option<&TopologySnapshot>, node: &TopoNode) -> Option<Arc<Provider>> {
    let existing = previous?.provider(node.node_id())?;
    existing.same_meta(node).then(|| existing.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::node::group_by_biz;

    fn nodes(list: Vec<TopoNode>) -> TopoNodeMap {
        group_by_biz(list)
    }

    fn base() -> Vec<TopoNode> {
        vec![
            TopoNode::new("search", 2, 0, "tcp:a:1", 1),
            TopoNode::new("search", 2, 1, "tcp:b:1", 1),
            TopoNode::new("ads", 1, 0, "tcp:c:1", 3),
        ]
    }

    #[test]
    fn test_build_layout() {
        let misc = MiscConfig::default();
        let out = build_snapshot(None, &nodes(base()), &misc, 1).unwrap();
        let snap = out.snapshot;
        assert_eq!(snap.biz_names(), vec!["ads".to_string(), "search".to_string()]);
        assert_eq!(snap.versions("search"), vec![1]);
        assert_eq!(snap.providers.len(), 3);
        let info = snap.version_info("search", 1, &misc).unwrap();
        assert_eq!(info.part_count, 2);
        assert_eq!(info.subscribe_count, 2);
        assert_eq!(info.health_count, 2);
        assert!(out.retired.is_empty());
    }

    #[test]
    fn test_unchanged_biz_carried_by_arc() {
        let misc = MiscConfig::default();
        let first = build_snapshot(None, &nodes(base()), &misc, 1).unwrap().snapshot;

        let mut changed = base();
        changed.push(TopoNode::new("search", 2, 0, "tcp:a:2", 1));
        let out = build_snapshot(Some(&first), &nodes(changed), &misc, 2).unwrap();

        assert!(Arc::ptr_eq(&first.bizs["ads"], &out.snapshot.bizs["ads"]));
        assert!(!Arc::ptr_eq(&first.bizs["search"], &out.snapshot.bizs["search"]));
        assert_eq!(out.rebuilt, vec!["search".to_string()]);

        let kept = TopoNode::new("search", 2, 0, "tcp:a:1", 1).node_id();
        assert!(Arc::ptr_eq(&first.providers[&kept], &out.snapshot.providers[&kept]));
        assert!(out.retired.is_empty());
    }

    #[test]
    fn test_removed_provider_retired() {
        let misc = MiscConfig::default();
        let first = build_snapshot(None, &nodes(base()), &misc, 1).unwrap().snapshot;
        let mut fewer = base();
        fewer.retain(|n| n.spec != "tcp:c:1");
        let out = build_snapshot(Some(&first), &nodes(fewer), &misc, 2).unwrap();
        assert_eq!(out.retired.len(), 1);
        assert_eq!(out.retired[0].spec(), "tcp:c:1");
        assert!(out.snapshot.biz("ads").is_none());
    }

    #[test]
    fn test_metadata_change_replaces_provider() {
        let misc = MiscConfig::default();
        let first = build_snapshot(None, &nodes(base()), &misc, 1).unwrap().snapshot;
        let mut moved = base();
        moved[0].protocol_version = 5;
        let out = build_snapshot(Some(&first), &nodes(moved), &misc, 2).unwrap();
        let id = TopoNode::new("search", 2, 0, "tcp:a:1", 1).node_id();
        assert!(!Arc::ptr_eq(&first.providers[&id], &out.snapshot.providers[&id]));
        assert_eq!(out.retired.len(), 1);
        assert_eq!(out.snapshot.protocol_versions("search").into_iter().collect::<Vec<_>>(), vec![0, 5]);
    }

    #[test]
    fn test_inconsistent_input_rejected() {
        let misc = MiscConfig::default();
        let out_of_range = vec![TopoNode::new("search", 2, 2, "tcp:a:1", 1)];
        assert!(matches!(
            build_snapshot(None, &nodes(out_of_range), &misc, 1),
            Err(TopologyError::PartitionOutOfRange { .. })
        ));

        let mismatch = vec![
            TopoNode::new("search", 2, 0, "tcp:a:1", 1),
            TopoNode::new("search", 3, 1, "tcp:b:1", 1),
        ];
        assert!(matches!(
            build_snapshot(None, &nodes(mismatch), &misc, 1),
            Err(TopologyError::PartitionCountMismatch { .. })
        ));

        let zero = vec![TopoNode::new("search", 0, 0, "tcp:a:1", 1)];
        assert!(matches!(
            build_snapshot(None, &nodes(zero), &misc, 1),
            Err(TopologyError::ZeroPartitionCount { .. })
        ));

        let a = TopoNode::new("search", 1, 0, "tcp:a:1", 1);
        let mut b = a.clone();
        b.meta_env = "staging".into();
        assert!(matches!(
            build_snapshot(None, &nodes(vec![a, b]), &misc, 1),
            Err(TopologyError::ConflictingNode { .. })
        ));
    }

    #[test]
    fn test_copy_version_split() {
        let misc = MiscConfig::default();
        let mut backup = TopoNode::new("search", 1, 0, "tcp:z:1", 9);
        backup.copy = true;
        let list = vec![TopoNode::new("search", 1, 0, "tcp:a:1", 1), backup];
        let snap = build_snapshot(None, &nodes(list), &misc, 1).unwrap().snapshot;
        let biz = snap.biz("search").unwrap();
        assert_eq!(biz.versions.keys().copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(biz.copy_versions.keys().copied().collect::<Vec<_>>(), vec![9]);
        assert_eq!(biz.serving_version(&misc).unwrap().version, 1);
        assert!(snap.dump().contains("version 9 (copy)"));
    }
}
