//! Shoal Core
//!
//! Runtime-free building blocks for shoal cluster sharding:
//! - `ids`: identifier newtypes (shard, entry, type name, node, region key)
//! - `config`: sharding configuration with environment overrides
//! - `strategy`: pluggable shard allocation and rebalance policies
//! - `event`: persisted domain events for coordinator and shard
//! - `state`: coordinator and shard persistent state as pure event folds
//!
//! Nothing in this crate spawns tasks or performs I/O; everything is
//! deterministic and unit-testable.

pub mod config;
pub mod error;
pub mod event;
pub mod ids;
pub mod state;
pub mod strategy;

pub use config::{LeastShardConfig, ShardingConfig};
pub use error::StateError;
pub use event::{CoordinatorEvent, EntryEvent};
pub use ids::{EntryId, NodeName, RegionKey, ShardId, TypeName};
pub use state::{CoordinatorState, ShardEntries};
pub use strategy::{Allocations, AllocationStrategy, LeastShardAllocation};
