//! Persisted Domain Events
//!
//! The journaled vocabulary of the sharding protocol. Coordinator events
//! describe changes to the shard-to-region map; entry events describe the
//! remembered entry set of a single shard. Both are folded into state by
//! the pure functions in [`crate::state`].

use crate::ids::{EntryId, RegionKey, ShardId};
use serde::{Deserialize, Serialize};

/// Events persisted by the shard coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    RegionRegistered { region: RegionKey },
    RegionProxyRegistered { proxy: RegionKey },
    RegionTerminated { region: RegionKey },
    RegionProxyTerminated { proxy: RegionKey },
    ShardHomeAllocated { shard: ShardId, region: RegionKey },
    ShardHomeDeallocated { shard: ShardId },
}

/// Events persisted by a shard that remembers its entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryEvent {
    EntryStarted { id: EntryId },
    EntryStopped { id: EntryId },
}

impl EntryEvent {
    /// The entry this event concerns.
    pub fn entry_id(&self) -> &EntryId {
        match self {
            EntryEvent::EntryStarted { id } | EntryEvent::EntryStopped { id } => id,
        }
    }
}
