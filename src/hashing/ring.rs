//! Weighted consistent hash ring.
//!
//! Every provider owns `virtual_node_count` entries. Each entry has a ring
//! position and a one-byte label, both derived from xxh3 of the provider id
//! and the virtual node index, so the ring is identical across rebuilds.
//!
//! An entry only accepts a key while its provider's scaled weight is above
//! the entry label. As a provider loses weight it gives up a growing share
//! of its entries and the keys on them walk forward to the next accepting
//! entry; at full weight every entry accepts.

use xxhash_rust::xxh3::{xxh3_128, xxh3_64};

/// One virtual node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingEntry {
    pub position: u64,
    /// Index of the owning provider in the replica's provider vector.
    pub index: usize,
    pub label: u8,
}

/// Outcome of a weighted walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingSelection {
    /// Provider that accepted the key.
    pub pick: Option<usize>,
    /// Provider owning the key's first entry, whether or not it accepted.
    pub owner: Option<usize>,
}

/// Weighted consistent hash ring over provider indices.
#[derive(Debug, Clone, Default)]
pub struct WeightedHashRing {
    entries: Vec<RingEntry>,
}

/// Spread a caller-supplied hash key over the ring.
#[inline]
pub fn hash_key(key: u64) -> u64 {
    xxh3_64(&key.to_le_bytes())
}

/// Weight mapped onto the label scale, 0..=256.
#[inline]
pub fn scaled_weight(weight: u32, max_weight: u32) -> u32 {
    if max_weight == 0 {
        return 0;
    }
    (weight.min(max_weight) as u64 * 256 / max_weight as u64) as u32
}

/// True when a provider of `weight` accepts an entry labelled `label`.
#[inline]
pub fn accepts(weight: u32, max_weight: u32, label: u8) -> bool {
    scaled_weight(weight, max_weight) > label as u32
}

impl WeightedHashRing {
    /// Build a ring for providers identified by `ids`; entry indices follow `ids` order.
    pub fn build(ids: &[u64], virtual_node_count: usize) -> Self {
        let mut entries = Vec::with_capacity(ids.len() * virtual_node_count);
        for (index, id) in ids.iter().enumerate() {
            for vnode in 0..virtual_node_count {
                let mut seed = [0u8; 16];
                seed[..8].copy_from_slice(&id.to_le_bytes());
                seed[8..].copy_from_slice(&(vnode as u64).to_le_bytes());
                let digest = xxh3_128(&seed);
                entries.push(RingEntry {
                    position: digest as u64,
                    index,
                    label: (digest >> 120) as u8,
                });
            }
        }
        entries.sort_unstable_by_key(|e| (e.position, e.index));
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[RingEntry] {
        &self.entries
    }

    /// Slot of the first entry at or after `hashed`, wrapping around.
    pub fn locate(&self, hashed: u64) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let slot = self.entries.partition_point(|e| e.position < hashed);
        Some(if slot == self.entries.len() { 0 } else { slot })
    }

    /// Weighted lookup of `key`.
    ///
    /// `weight_of` returns `None` for providers removed from consideration
    /// (tag filtering) and their current weight otherwise. The walk visits
    /// at most one full turn of the ring.
    pub fn select<F>(&self, key: u64, max_weight: u32, ignore_label: bool, weight_of: F) -> RingSelection
    where
        F: Fn(usize) -> Option<u32>,
    {
        let Some(start) = self.locate(hash_key(key)) else {
            return RingSelection::default();
        };

        let mut selection = RingSelection::default();
        let len = self.entries.len();
        for step in 0..len {
            let entry = self.entries[(start + step) % len];
            let Some(weight) = weight_of(entry.index) else {
                continue;
            };
            if selection.owner.is_none() {
                selection.owner = Some(entry.index);
                if ignore_label && weight > 0 {
                    selection.pick = Some(entry.index);
                    break;
                }
            }
            if accepts(weight, max_weight, entry.label) {
                selection.pick = Some(entry.index);
                break;
            }
        }
        selection
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owners(ring: &WeightedHashRing, ids: &[u64], keys: u64) -> Vec<Option<u64>> {
        (0..keys)
            .map(|k| ring.select(k, 100, false, |_| Some(100)).pick.map(|i| ids[i]))
            .collect()
    }

    #[test]
    fn test_empty_ring() {
        let ring = WeightedHashRing::build(&[], 8);
        assert!(ring.is_empty());
        assert_eq!(ring.select(42, 100, false, |_| Some(100)), RingSelection::default());
    }

    #[test]
    fn test_ring_size_and_order() {
        let ring = WeightedHashRing::build(&[1, 2, 3], 16);
        assert_eq!(ring.len(), 48);
        assert!(ring.entries().windows(2).all(|w| w[0].position <= w[1].position));
    }

    #[test]
    fn test_full_weight_always_accepts() {
        for label in 0..=u8::MAX {
            assert!(accepts(100, 100, label));
        }
        assert!(!accepts(0, 100, 0));
    }

    #[test]
    fn test_zero_weight_provider_never_picked() {
        let ring = WeightedHashRing::build(&[1, 2], 32);
        for key in 0..2_000u64 {
            let sel = ring.select(key, 100, false, |i| Some(if i == 0 { 0 } else { 100 }));
            assert_eq!(sel.pick, Some(1));
        }
    }

    #[test]
    fn test_placeholder_skipped() {
        let ring = WeightedHashRing::build(&[1, 2, 3], 32);
        for key in 0..1_000u64 {
            let sel = ring.select(key, 100, false, |i| if i == 1 { None } else { Some(100) });
            assert_ne!(sel.pick, Some(1));
            assert_ne!(sel.owner, Some(1));
        }
    }

    #[test]
    fn test_minimal_disruption_on_remove() {
        let ids: Vec<u64> = (1..=10).collect();
        let ring = WeightedHashRing::build(&ids, 64);
        let before = owners(&ring, &ids, 10_000);

        let remaining: Vec<u64> = ids.iter().copied().filter(|id| *id != 4).collect();
        let smaller = WeightedHashRing::build(&remaining, 64);
        let after = owners(&smaller, &remaining, 10_000);

        let mut moved = 0;
        for (b, a) in before.iter().zip(after.iter()) {
            if b != a {
                assert_eq!(*b, Some(4), "only keys of the removed provider may move");
                moved += 1;
            }
        }
        assert!(moved < 2_000, "moved {moved} of 10000 keys");
    }

    #[test]
    fn test_minimal_disruption_on_add() {
        let ids: Vec<u64> = (1..=10).collect();
        let ring = WeightedHashRing::build(&ids, 64);
        let before = owners(&ring, &ids, 10_000);

        let mut grown = ids.clone();
        grown.push(11);
        let bigger = WeightedHashRing::build(&grown, 64);
        let after = owners(&bigger, &grown, 10_000);

        let moved = before
            .iter()
            .zip(after.iter())
            .filter(|(b, a)| b != a)
            .inspect(|(_, a)| assert_eq!(**a, Some(11)))
            .count();
        assert!(moved < 2_000, "moved {moved} of 10000 keys");
    }

    #[test]
    fn test_lower_weight_sheds_share() {
        let ring = WeightedHashRing::build(&[1, 2], 64);
        let count = |w0: u32| {
            (0..10_000u64)
                .filter(|k| ring.select(*k, 100, false, |i| Some(if i == 0 { w0 } else { 100 })).pick == Some(0))
                .count()
        };
        assert!(count(30) < count(100));
    }
}
