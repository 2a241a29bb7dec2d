//! Discovery descriptors.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

/// Stable provider identity.
pub type NodeId = u64;

/// Per-biz descriptor sets, as produced by one discovery poll.
pub type TopoNodeMap = HashMap<String, BTreeSet<TopoNode>>;

/// One backend instance as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct TopoNode {
    pub biz_name: String,
    pub partition_count: u32,
    pub partition_id: u32,
    pub version: i64,
    pub target_weight: u32,
    pub cluster_name: String,
    /// Network address, e.g. `tcp:10.0.0.1:9000`.
    pub spec: String,
    pub protocol_version: i32,
    pub meta_env: String,
    /// Discovery marked the node serviceable.
    pub valid: bool,
    /// Label of the discovery source that reported it.
    pub subscribe_type: String,
    /// Dedicated backup capacity, outside normal selection.
    pub copy: bool,
    pub tags: BTreeMap<String, String>,
}

impl Default for TopoNode {
    fn default() -> Self {
        Self {
            biz_name: String::new(),
            partition_count: 1,
            partition_id: 0,
            version: 0,
            target_weight: 100,
            cluster_name: String::new(),
            spec: String::new(),
            protocol_version: 0,
            meta_env: String::new(),
            valid: true,
            subscribe_type: "static".to_string(),
            copy: false,
            tags: BTreeMap::new(),
        }
    }
}

impl TopoNode {
    pub fn new(biz_name: &str, partition_count: u32, partition_id: u32, spec: &str, version: i64) -> Self {
        Self {
            biz_name: biz_name.to_string(),
            partition_count,
            partition_id,
            spec: spec.to_string(),
            version,
            ..Self::default()
        }
    }

    /// xxh3 over biz, cluster, address, partition and version.
    pub fn node_id(&self) -> NodeId {
        let mut buf = Vec::with_capacity(self.biz_name.len() + self.cluster_name.len() + self.spec.len() + 15);
        for part in [&self.biz_name, &self.cluster_name, &self.spec] {
            buf.extend_from_slice(part.as_bytes());
            buf.push(0);
        }
        buf.extend_from_slice(&self.partition_id.to_le_bytes());
        buf.extend_from_slice(&self.version.to_le_bytes());
        xxh3_64(&buf)
    }
}

/// Group descriptors by biz, skipping nodes discovery marked invalid.
pub fn group_by_biz<I>(nodes: I) -> TopoNodeMap
where
    I: IntoIterator<Item = TopoNode>,
{
    let mut map = TopoNodeMap::new();
    for node in nodes {
        if !node.valid {
            tracing::debug!(biz = %node.biz_name, spec = %node.spec, "Skipping invalid topology node");
            continue;
        }
        map.entry(node.biz_name.clone()).or_default().insert(node);
    }
    map
}
