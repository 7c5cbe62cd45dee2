//! Shoal Sharding
//!
//! Location-transparent routing of stateful entry actors across a set of
//! cluster nodes. Messages are addressed by an application-defined entry
//! id; at most one live instance exists per id, and messages find it
//! wherever it currently runs.
//!
//! The moving parts:
//! - `guardian`: per-node registry; `ClusterSharding::start` wires an
//!   entry type and returns its region endpoint
//! - `region`: per-node router, buffering and shard host
//! - `shard`: per-(type, shard) entry supervisor with optional
//!   remembered entries
//! - `coordinator`: event-sourced singleton owning the shard map, its
//!   rebalance workers and its supervisor
//! - `entry`: the application-facing behavior and addressing traits
//! - `journal`, `membership`, `directory`, `dead_letter`: collaborator
//!   seams with in-process implementations

pub mod coordinator;
pub mod dead_letter;
pub mod directory;
pub mod entry;
pub mod guardian;
pub mod journal;
pub mod membership;
pub mod region;
pub mod shard;
mod timer;

pub use dead_letter::{DeadLetterSink, DropReason, LogDeadLetters};
pub use directory::PathDirectory;
pub use entry::{EntryAction, EntryBehavior, EntryFactory, EntryIdExtractor, ShardResolver};
pub use guardian::{ClusterSharding, EntryTypeSettings, StartError};
pub use journal::{FileJournal, Journal, JournalError, MemoryJournal};
pub use membership::{ClusterMembership, LocalCluster, Member, MemberEvent};
pub use region::messages::{Envelope, GetRegionStats, RegionStats};
pub use region::ShardRegion;

pub use shoal_core::{
    AllocationStrategy, CoordinatorEvent, CoordinatorState, EntryEvent, EntryId,
    LeastShardAllocation, LeastShardConfig, NodeName, RegionKey, ShardEntries, ShardId,
    ShardingConfig, TypeName,
};
