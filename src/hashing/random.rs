//! Prefix-sum weighted random hash.
//!
//! O(n) build, O(log n) pick. Built per call because weights move between calls.

/// Cumulative weight table over eligible provider indices.
#[derive(Debug, Clone, Default)]
pub struct WeightedRandom {
    indices: Vec<usize>,
    cumulative: Vec<u64>,
}

impl WeightedRandom {
    /// Build from `(index, weight)` pairs, keeping only weights above `floor`.
    pub fn build<I>(weights: I, floor: u32) -> Self
    where
        I: IntoIterator<Item = (usize, u32)>,
    {
        let mut table = Self::default();
        let mut total = 0u64;
        for (index, weight) in weights {
            if weight > floor {
                total += weight as u64;
                table.indices.push(index);
                table.cumulative.push(total);
            }
        }
        table
    }

    pub fn total_weight(&self) -> u64 {
        self.cumulative.last().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Owner of `key mod total`: first bucket whose cumulative weight is above it.
    pub fn pick(&self, key: u64) -> Option<usize> {
        let total = self.total_weight();
        if total == 0 {
            return None;
        }
        let point = key % total;
        let bucket = self.cumulative.partition_point(|&c| c <= point);
        self.indices.get(bucket).copied()
    }
}
