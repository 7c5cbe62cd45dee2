//! Shard Allocation Strategies
//!
//! Pure policy for two decisions the coordinator delegates:
//! where a newly touched shard should live, and which shards should be
//! moved to even out load. Strategies see only the current allocation
//! map and the set of in-flight rebalances; they never perform I/O.

use crate::config::LeastShardConfig;
use crate::ids::{RegionKey, ShardId};
use indexmap::IndexMap;
use std::collections::HashSet;

/// Current shard allocations: region key to the shards it hosts, in
/// allocation order. Insertion order of both the map and the lists is
/// meaningful; rebalance policies depend on it.
pub type Allocations = IndexMap<RegionKey, Vec<ShardId>>;

/// Pluggable allocation and rebalance policy.
pub trait AllocationStrategy: Send + Sync + 'static {
    /// Choose the region that should host a shard seen for the first
    /// time. Must return a key present in `current`; `None` only when
    /// `current` is empty. `requester` is the region that asked for the
    /// shard's home, or `None` when the coordinator itself is driving
    /// reallocation.
    fn allocate(
        &self,
        requester: Option<&RegionKey>,
        shard: &ShardId,
        current: &Allocations,
    ) -> Option<RegionKey>;

    /// Pick shards to move off their current region. May return an empty
    /// set. Shards already being rebalanced are listed in `in_progress`
    /// and must not be picked again.
    fn rebalance(&self, current: &Allocations, in_progress: &HashSet<ShardId>) -> Vec<ShardId>;
}

/// Default strategy: allocate to the region with the fewest shards, and
/// rebalance the first shard of the most loaded region whenever the gap
/// to the least loaded one reaches the configured threshold.
#[derive(Debug, Clone, Default)]
pub struct LeastShardAllocation {
    config: LeastShardConfig,
}

impl LeastShardAllocation {
    pub fn new(config: LeastShardConfig) -> Self {
        Self { config }
    }
}

impl AllocationStrategy for LeastShardAllocation {
    fn allocate(
        &self,
        _requester: Option<&RegionKey>,
        _shard: &ShardId,
        current: &Allocations,
    ) -> Option<RegionKey> {
        // Ties break to the earliest registered region.
        current
            .iter()
            .enumerate()
            .min_by_key(|(index, (_, shards))| (shards.len(), *index))
            .map(|(_, (region, _))| region.clone())
    }

    fn rebalance(&self, current: &Allocations, in_progress: &HashSet<ShardId>) -> Vec<ShardId> {
        if in_progress.len() >= self.config.max_simultaneous_rebalance {
            return Vec::new();
        }

        let least = match current.values().map(Vec::len).min() {
            Some(least) => least,
            None => return Vec::new(),
        };

        // The most loaded region is judged by what would remain after the
        // in-flight rebalances complete.
        let most = current
            .values()
            .enumerate()
            .map(|(index, shards)| {
                let remaining: Vec<&ShardId> = shards
                    .iter()
                    .filter(|shard| !in_progress.contains(*shard))
                    .collect();
                (index, remaining)
            })
            .max_by_key(|(index, remaining)| (remaining.len(), usize::MAX - index));

        match most {
            Some((_, remaining))
                if remaining.len().saturating_sub(least) >= self.config.rebalance_threshold =>
            {
                vec![remaining[0].clone()]
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(name: &str) -> RegionKey {
        RegionKey::from(name)
    }

    fn shard(name: &str) -> ShardId {
        ShardId::from(name)
    }

    fn strategy(threshold: usize, max_simultaneous: usize) -> LeastShardAllocation {
        LeastShardAllocation::new(LeastShardConfig {
            rebalance_threshold: threshold,
            max_simultaneous_rebalance: max_simultaneous,
        })
    }

    fn allocations(entries: &[(&str, &[&str])]) -> Allocations {
        entries
            .iter()
            .map(|(key, shards)| {
                (
                    region(key),
                    shards.iter().map(|name| shard(name)).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_allocate_picks_least_loaded() {
        let current = allocations(&[("r1", &["A", "B"]), ("r2", &["C"])]);
        let strategy = strategy(1, 1);
        let chosen = strategy.allocate(Some(&region("r1")), &shard("D"), &current);
        assert_eq!(chosen, Some(region("r2")));
    }

    #[test]
    fn test_allocate_ties_break_to_first_registered() {
        let current = allocations(&[("r1", &["A"]), ("r2", &["B"]), ("r3", &["C"])]);
        let strategy = strategy(1, 1);
        let chosen = strategy.allocate(None, &shard("D"), &current);
        assert_eq!(chosen, Some(region("r1")));
    }

    #[test]
    fn test_allocate_empty_map_returns_none() {
        let strategy = strategy(1, 1);
        assert_eq!(
            strategy.allocate(None, &shard("A"), &Allocations::new()),
            None
        );
    }

    #[test]
    fn test_rebalance_moves_first_shard_of_most_loaded() {
        let current = allocations(&[("r1", &["A", "B"]), ("r2", &[])]);
        let strategy = strategy(1, 1);
        let picked = strategy.rebalance(&current, &HashSet::new());
        assert_eq!(picked, vec![shard("A")]);
    }

    #[test]
    fn test_rebalance_below_threshold_is_empty() {
        let current = allocations(&[("r1", &["A", "B"]), ("r2", &["C"])]);
        let strategy = strategy(2, 1);
        assert!(strategy.rebalance(&current, &HashSet::new()).is_empty());
    }

    #[test]
    fn test_rebalance_respects_max_simultaneous() {
        let current = allocations(&[("r1", &["A", "B", "C"]), ("r2", &[])]);
        let strategy = strategy(1, 1);
        let in_progress: HashSet<ShardId> = [shard("X")].into_iter().collect();
        assert!(strategy.rebalance(&current, &in_progress).is_empty());
    }

    #[test]
    fn test_rebalance_skips_shards_already_in_progress() {
        let current = allocations(&[("r1", &["A", "B", "C"]), ("r2", &[])]);
        let strategy = strategy(1, 2);
        let in_progress: HashSet<ShardId> = [shard("A")].into_iter().collect();
        let picked = strategy.rebalance(&current, &in_progress);
        assert_eq!(picked, vec![shard("B")]);
    }

    #[test]
    fn test_rebalance_empty_allocations() {
        let strategy = strategy(1, 1);
        assert!(strategy
            .rebalance(&Allocations::new(), &HashSet::new())
            .is_empty());
    }
}
