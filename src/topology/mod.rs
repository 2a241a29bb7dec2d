//! Topology subsystem.
//!
//! # Data Flow
//! ```text
//! TopologySource::poll (discovery or static config)
//!     → node.rs (TopoNode, grouped per biz)
//!     → manager.rs (writer lock, no-op if nothing changed)
//!         → builder.rs (consistency checks, diff, provider carry-over)
//!         → snapshot.rs (TopologySnapshot → BizSnapshot → VersionSnapshot → Replica)
//!     → ArcSwap publish, wake first-snapshot waiters
//!     → retire dropped providers, drain thread watches the old generation
//! ```
//!
//! # Design Decisions
//! - Readers only ever see complete generations
//! - Unchanged bizzes are shared between generations by `Arc`
//! - Providers with unchanged metadata keep their health state across rebuilds
//! - A bad discovery update is rejected whole; the old generation stays current

pub mod builder;
pub mod manager;
pub mod node;
pub mod snapshot;

pub use builder::{build_snapshot, BuildOutput, TopologyError};
pub use manager::{StaticTopology, TopologyManager, TopologySource};
pub use node::{group_by_biz, NodeId, TopoNode, TopoNodeMap};
pub use snapshot::{BizSnapshot, BizStats, TopologySnapshot, VersionInfo, VersionSnapshot};
