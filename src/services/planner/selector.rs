//! Chooses between the update strategies from recent commits.
//!
//! Each changed arc is a sample: was it on some cached shortest-path tree,
//! and how likely was that by chance (tree arcs over all arcs)? When tree
//! hits clearly outpace chance, changes are concentrated on shortest paths
//! and the path-centric strategy pays off.

use super::strategy::StrategyKind;
use std::collections::VecDeque;

/// Sliding-window strategy chooser.
#[derive(Debug, Clone)]
pub struct StrategySelector {
    window: VecDeque<(bool, f64)>,
    capacity: usize,
    min_samples: usize,
    margin: f64,
    forced: Option<StrategyKind>,
}

impl StrategySelector {
    /// Creates a selector.
    #[must_use]
    pub fn new(
        capacity: usize,
        min_samples: usize,
        margin: f64,
        forced: Option<StrategyKind>,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            min_samples: min_samples.min(capacity),
            margin,
            forced,
        }
    }

    /// Records whether a changed arc was a tree arc, and the chance of that.
    pub fn record(&mut self, hit: bool, chance: f64) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back((hit, chance.clamp(0.0, 1.0)));
    }

    /// Returns the number of samples in the window.
    #[must_use]
    pub fn samples(&self) -> usize {
        self.window.len()
    }

    /// Returns the observed tree-hit rate, if any samples exist.
    #[must_use]
    pub fn hit_rate(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        let hits = self.window.iter().filter(|(hit, _)| *hit).count();
        Some(crate::gc::usize_to_f64(hits) / crate::gc::usize_to_f64(self.window.len()))
    }

    fn chance_rate(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        let sum: f64 = self.window.iter().map(|(_, chance)| chance).sum();
        Some(sum / crate::gc::usize_to_f64(self.window.len()))
    }

    /// Returns the strategy to use for the next commit.
    #[must_use]
    pub fn choose(&self) -> StrategyKind {
        if let Some(forced) = self.forced {
            return forced;
        }
        if self.window.len() < self.min_samples {
            return StrategyKind::EdgeCentric;
        }
        match (self.hit_rate(), self.chance_rate()) {
            (Some(hit), Some(chance)) if hit > chance + self.margin => StrategyKind::PathCentric,
            _ => StrategyKind::EdgeCentric,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_edge_centric_until_warm() {
        let mut selector = StrategySelector::new(8, 4, 0.1, None);
        for _ in 0..3 {
            selector.record(true, 0.1);
        }
        assert_eq!(selector.choose(), StrategyKind::EdgeCentric);
        selector.record(true, 0.1);
        assert_eq!(selector.choose(), StrategyKind::PathCentric);
    }

    #[test]
    fn test_hits_at_chance_stay_edge_centric() {
        let mut selector = StrategySelector::new(10, 2, 0.1, None);
        for i in 0..10 {
            selector.record(i % 2 == 0, 0.5);
        }
        assert_eq!(selector.hit_rate(), Some(0.5));
        assert_eq!(selector.choose(), StrategyKind::EdgeCentric);
    }

    #[test]
    fn test_window_slides() {
        let mut selector = StrategySelector::new(4, 4, 0.1, None);
        for _ in 0..4 {
            selector.record(true, 0.2);
        }
        for _ in 0..4 {
            selector.record(false, 0.2);
        }
        assert_eq!(selector.samples(), 4);
        assert_eq!(selector.choose(), StrategyKind::EdgeCentric);
    }

    #[test]
    fn test_forced_strategy_wins() {
        let selector = StrategySelector::new(4, 1, 0.1, Some(StrategyKind::PathCentric));
        assert_eq!(selector.choose(), StrategyKind::PathCentric);
    }
}
