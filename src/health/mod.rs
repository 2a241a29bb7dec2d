//! Health feedback subsystem.
//!
//! # Data Flow
//! ```text
//! Transport reports a CallOutcome (outcome.rs)
//!     → Provider::update_weight
//!         → chain.rs (latency / error / degrade / warm-up controllers)
//!         → weight.rs (approach target, CAS current, recompute cached)
//!     → Replica folds the sample into replica.rs
//!         (best-chain queue, averages, degrade coverage)
//! ```
//!
//! # Design Decisions
//! - Every filter is a lock-free CAS loop on an f64 bit pattern
//! - Controllers say nothing until they have enough samples
//! - Adaptation is eventually consistent, never per call

pub mod chain;
pub mod controller;
pub mod outcome;
pub mod replica;
pub mod weight;

pub use chain::ControllerChain;
pub use controller::{AtomicF64, HealthController};
pub use outcome::{CallOutcome, PeerStats};
pub use replica::ReplicaController;
pub use weight::{ProviderWeight, WeightChange, WeightInput};

/// Share still served for `value` between a `begin` (1.0) and `full` (0.0) threshold.
pub fn linear_coverage(value: f64, begin: f64, full: f64) -> f64 {
    if value <= begin {
        return 1.0;
    }
    if value >= full {
        return 0.0;
    }
    (1.0 - (value - begin) / (full - begin)).clamp(0.0, 1.0)
}
