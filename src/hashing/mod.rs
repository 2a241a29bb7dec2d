//! Selection primitives.
//!
//! Pure data structures with no knowledge of providers or health:
//! - ring.rs: weighted consistent hash ring with per-entry weight labels
//! - random.rs: prefix-sum weighted random pick

pub mod random;
pub mod ring;

pub use random::WeightedRandom;
pub use ring::{hash_key, RingSelection, WeightedHashRing};
