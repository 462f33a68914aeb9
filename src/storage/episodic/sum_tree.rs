//! Binary sum tree over slot priorities.
//!
//! Leaves hold priorities; each internal node holds the sum of its children.
//! Updates and prefix-sum descents are `O(log n)`.

#[derive(Debug, Clone)]
pub(crate) struct SumTree {
    capacity: usize,
    leaves: usize,
    nodes: Vec<f64>,
}

impl SumTree {
    pub fn new(capacity: usize) -> Self {
        let leaves = capacity.max(1).next_power_of_two();
        Self {
            capacity: capacity.max(1),
            leaves,
            nodes: vec![0.0; 2 * leaves],
        }
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total(&self) -> f64 {
        self.nodes[1]
    }

    pub fn get(&self, slot: usize) -> f64 {
        self.nodes.get(self.leaves + slot).copied().unwrap_or(0.0)
    }

    /// Sets a slot's priority. Out-of-range slots are ignored.
    pub fn set(&mut self, slot: usize, priority: f64) {
        if slot >= self.capacity {
            return;
        }
        let mut node = self.leaves + slot;
        self.nodes[node] = priority.max(0.0);
        while node > 1 {
            node /= 2;
            self.nodes[node] = self.nodes[2 * node] + self.nodes[2 * node + 1];
        }
    }

    /// Returns the slot whose cumulative range contains `prefix`.
    ///
    /// Rounding can leave `prefix` marginally past a subtree's sum; the
    /// descent then stays on the side that still has mass.
    pub fn find(&self, prefix: f64) -> usize {
        let mut prefix = prefix.max(0.0);
        let mut node = 1;
        while node < self.leaves {
            let left = 2 * node;
            let right = left + 1;
            if self.nodes[right] <= 0.0 || (prefix < self.nodes[left] && self.nodes[left] > 0.0) {
                node = left;
            } else {
                prefix -= self.nodes[left];
                node = right;
            }
        }
        (node - self.leaves).min(self.capacity - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_tracks_updates() {
        let mut tree = SumTree::new(5);
        tree.set(0, 1.0);
        tree.set(4, 3.0);
        assert!((tree.total() - 4.0).abs() < 1e-12);
        tree.set(0, 0.5);
        assert!((tree.total() - 3.5).abs() < 1e-12);
        tree.set(9, 100.0);
        assert!((tree.total() - 3.5).abs() < 1e-12);
    }

    #[test]
    fn test_find_maps_prefix_to_slot() {
        let mut tree = SumTree::new(3);
        tree.set(0, 1.0);
        tree.set(1, 2.0);
        tree.set(2, 3.0);
        assert_eq!(tree.find(0.5), 0);
        assert_eq!(tree.find(1.5), 1);
        assert_eq!(tree.find(3.1), 2);
        assert_eq!(tree.find(5.999), 2);
    }

    #[test]
    fn test_find_skips_empty_slots() {
        let mut tree = SumTree::new(4);
        tree.set(2, 1.0);
        assert_eq!(tree.find(0.0), 2);
        assert_eq!(tree.find(0.99), 2);
        assert_eq!(tree.find(1.0), 2);
    }
}
