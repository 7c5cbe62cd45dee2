//! Persistent State Folds
//!
//! Coordinator and shard state as immutable values updated by pure event
//! folds. `updated` never mutates in place; replaying a journal and
//! applying a snapshot therefore produce byte-identical states, which is
//! what makes recovery trivially testable.

use crate::error::StateError;
use crate::event::{CoordinatorEvent, EntryEvent};
use crate::ids::{EntryId, RegionKey, ShardId};
use crate::strategy::Allocations;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Authoritative shard-to-region bookkeeping owned by the coordinator.
///
/// Invariants (checked by [`CoordinatorState::is_consistent`]):
/// - every value in `shards` is a key of `regions`
/// - `regions[r]` holds exactly the shards mapping to `r` in `shards`
/// - `unallocated` is disjoint from the keys of `shards`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorState {
    /// Current home of each allocated shard.
    pub shards: HashMap<ShardId, RegionKey>,
    /// Inverse of `shards`, in registration and allocation order.
    pub regions: Allocations,
    /// Registered proxy-only regions.
    pub proxies: HashSet<RegionKey>,
    /// Shards whose region terminated, awaiting reallocation.
    pub unallocated: HashSet<ShardId>,
}

impl CoordinatorState {
    /// Fold one event into a new state value.
    pub fn updated(&self, event: &CoordinatorEvent) -> Result<Self, StateError> {
        let mut next = self.clone();
        match event {
            CoordinatorEvent::RegionRegistered { region } => {
                if next.regions.contains_key(region) {
                    return Err(StateError::RegionAlreadyRegistered(region.clone()));
                }
                next.regions.insert(region.clone(), Vec::new());
            }
            CoordinatorEvent::RegionProxyRegistered { proxy } => {
                if !next.proxies.insert(proxy.clone()) {
                    return Err(StateError::ProxyAlreadyRegistered(proxy.clone()));
                }
            }
            CoordinatorEvent::RegionTerminated { region } => {
                let shards = next
                    .regions
                    .shift_remove(region)
                    .ok_or_else(|| StateError::UnknownRegion(region.clone()))?;
                for shard in shards {
                    next.shards.remove(&shard);
                    next.unallocated.insert(shard);
                }
            }
            CoordinatorEvent::RegionProxyTerminated { proxy } => {
                if !next.proxies.remove(proxy) {
                    return Err(StateError::UnknownProxy(proxy.clone()));
                }
            }
            CoordinatorEvent::ShardHomeAllocated { shard, region } => {
                if next.shards.contains_key(shard) {
                    return Err(StateError::ShardAlreadyAllocated(shard.clone()));
                }
                let allocated = next
                    .regions
                    .get_mut(region)
                    .ok_or_else(|| StateError::UnknownRegion(region.clone()))?;
                allocated.push(shard.clone());
                next.shards.insert(shard.clone(), region.clone());
                next.unallocated.remove(shard);
            }
            CoordinatorEvent::ShardHomeDeallocated { shard } => {
                let region = next
                    .shards
                    .remove(shard)
                    .ok_or_else(|| StateError::ShardNotAllocated(shard.clone()))?;
                let allocated = next
                    .regions
                    .get_mut(&region)
                    .ok_or_else(|| StateError::UnknownRegion(region.clone()))?;
                allocated.retain(|s| s != shard);
                next.unallocated.insert(shard.clone());
            }
        }
        Ok(next)
    }

    /// Home of a shard, if allocated.
    pub fn home_of(&self, shard: &ShardId) -> Option<&RegionKey> {
        self.shards.get(shard)
    }

    /// Shards currently allocated to a region.
    pub fn shards_of(&self, region: &RegionKey) -> &[ShardId] {
        self.regions
            .get(region)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Whether the forward and inverse maps agree. Cheap enough for
    /// debug assertions after every fold.
    pub fn is_consistent(&self) -> bool {
        let forward_count: usize = self.regions.values().map(Vec::len).sum();
        if forward_count != self.shards.len() {
            return false;
        }
        for (region, shards) in &self.regions {
            for shard in shards {
                if self.shards.get(shard) != Some(region) {
                    return false;
                }
            }
        }
        self.unallocated.iter().all(|s| !self.shards.contains_key(s))
    }
}

/// Remembered entry membership of one shard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEntries {
    entries: HashSet<EntryId>,
}

impl ShardEntries {
    /// Fold one entry event into a new value. Unlike the coordinator
    /// fold this is total: re-starting a started entry and re-stopping a
    /// stopped one are no-ops, which keeps retried persists harmless.
    pub fn updated(&self, event: &EntryEvent) -> Self {
        let mut next = self.clone();
        match event {
            EntryEvent::EntryStarted { id } => {
                next.entries.insert(id.clone());
            }
            EntryEvent::EntryStopped { id } => {
                next.entries.remove(id);
            }
        }
        next
    }

    pub fn contains(&self, id: &EntryId) -> bool {
        self.entries.contains(id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntryId> {
        self.entries.iter()
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

    fn registered(regions: &[&str]) -> CoordinatorState {
        let mut state = CoordinatorState::default();
        for name in regions {
            state = state
                .updated(&CoordinatorEvent::RegionRegistered {
                    region: region(name),
                })
                .unwrap();
        }
        state
    }

    #[test]
    fn test_register_then_allocate() {
        let state = registered(&["r1", "r2"]);
        let state = state
            .updated(&CoordinatorEvent::ShardHomeAllocated {
                shard: shard("A"),
                region: region("r1"),
            })
            .unwrap();

        assert_eq!(state.home_of(&shard("A")), Some(&region("r1")));
        assert_eq!(state.shards_of(&region("r1")), &[shard("A")]);
        assert!(state.is_consistent());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let state = registered(&["r1"]);
        let err = state
            .updated(&CoordinatorEvent::RegionRegistered {
                region: region("r1"),
            })
            .unwrap_err();
        assert_eq!(err, StateError::RegionAlreadyRegistered(region("r1")));
    }

    #[test]
    fn test_allocate_to_unknown_region_rejected() {
        let state = registered(&["r1"]);
        let err = state
            .updated(&CoordinatorEvent::ShardHomeAllocated {
                shard: shard("A"),
                region: region("r9"),
            })
            .unwrap_err();
        assert_eq!(err, StateError::UnknownRegion(region("r9")));
    }

    #[test]
    fn test_double_allocation_rejected() {
        let state = registered(&["r1", "r2"]);
        let state = state
            .updated(&CoordinatorEvent::ShardHomeAllocated {
                shard: shard("A"),
                region: region("r1"),
            })
            .unwrap();
        let err = state
            .updated(&CoordinatorEvent::ShardHomeAllocated {
                shard: shard("A"),
                region: region("r2"),
            })
            .unwrap_err();
        assert_eq!(err, StateError::ShardAlreadyAllocated(shard("A")));
    }

    #[test]
    fn test_region_termination_unallocates_its_shards() {
        let mut state = registered(&["r1", "r2"]);
        for (name, home) in [("A", "r1"), ("B", "r1"), ("C", "r2")] {
            state = state
                .updated(&CoordinatorEvent::ShardHomeAllocated {
                    shard: shard(name),
                    region: region(home),
                })
                .unwrap();
        }

        let state = state
            .updated(&CoordinatorEvent::RegionTerminated {
                region: region("r1"),
            })
            .unwrap();

        assert!(state.home_of(&shard("A")).is_none());
        assert!(state.unallocated.contains(&shard("A")));
        assert!(state.unallocated.contains(&shard("B")));
        assert_eq!(state.home_of(&shard("C")), Some(&region("r2")));
        assert!(state.is_consistent());
    }

    #[test]
    fn test_deallocate_moves_shard_to_unallocated() {
        let state = registered(&["r1"]);
        let state = state
            .updated(&CoordinatorEvent::ShardHomeAllocated {
                shard: shard("A"),
                region: region("r1"),
            })
            .unwrap();
        let state = state
            .updated(&CoordinatorEvent::ShardHomeDeallocated { shard: shard("A") })
            .unwrap();

        assert!(state.home_of(&shard("A")).is_none());
        assert!(state.unallocated.contains(&shard("A")));
        assert!(state.shards_of(&region("r1")).is_empty());
        assert!(state.is_consistent());

        // Reallocation after deallocation clears the unallocated mark.
        let state = state
            .updated(&CoordinatorEvent::ShardHomeAllocated {
                shard: shard("A"),
                region: region("r1"),
            })
            .unwrap();
        assert!(!state.unallocated.contains(&shard("A")));
        assert!(state.is_consistent());
    }

    #[test]
    fn test_proxy_lifecycle() {
        let state = CoordinatorState::default();
        let state = state
            .updated(&CoordinatorEvent::RegionProxyRegistered {
                proxy: region("p1"),
            })
            .unwrap();
        assert!(state.proxies.contains(&region("p1")));

        let err = state
            .updated(&CoordinatorEvent::RegionProxyRegistered {
                proxy: region("p1"),
            })
            .unwrap_err();
        assert_eq!(err, StateError::ProxyAlreadyRegistered(region("p1")));

        let state = state
            .updated(&CoordinatorEvent::RegionProxyTerminated {
                proxy: region("p1"),
            })
            .unwrap();
        assert!(state.proxies.is_empty());
    }

    #[test]
    fn test_allocation_order_is_preserved() {
        let mut state = registered(&["r1"]);
        for name in ["B", "A", "C"] {
            state = state
                .updated(&CoordinatorEvent::ShardHomeAllocated {
                    shard: shard(name),
                    region: region("r1"),
                })
                .unwrap();
        }
        assert_eq!(
            state.shards_of(&region("r1")),
            &[shard("B"), shard("A"), shard("C")]
        );
    }

    #[test]
    fn test_shard_entries_fold() {
        let entries = ShardEntries::default();
        let entries = entries.updated(&EntryEvent::EntryStarted {
            id: EntryId::from("e1"),
        });
        let entries = entries.updated(&EntryEvent::EntryStarted {
            id: EntryId::from("e2"),
        });
        assert_eq!(entries.len(), 2);

        let entries = entries.updated(&EntryEvent::EntryStopped {
            id: EntryId::from("e1"),
        });
        assert!(!entries.contains(&EntryId::from("e1")));
        assert!(entries.contains(&EntryId::from("e2")));

        // Duplicate events are no-ops.
        let entries = entries.updated(&EntryEvent::EntryStarted {
            id: EntryId::from("e2"),
        });
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_snapshot_round_trip_equals_replay() {
        let mut state = registered(&["r1", "r2"]);
        let events = [
            CoordinatorEvent::ShardHomeAllocated {
                shard: shard("A"),
                region: region("r1"),
            },
            CoordinatorEvent::ShardHomeAllocated {
                shard: shard("B"),
                region: region("r2"),
            },
            CoordinatorEvent::ShardHomeDeallocated { shard: shard("A") },
        ];
        for event in &events {
            state = state.updated(event).unwrap();
        }

        let json = serde_json::to_string(&state).unwrap();
        let restored: CoordinatorState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, state);
        assert!(restored.is_consistent());
    }
}
