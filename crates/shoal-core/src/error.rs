//! Core Error Types

use crate::ids::{RegionKey, ShardId};

/// Rejections from the coordinator state fold.
///
/// Any of these surfacing during live operation or recovery means the
/// event stream and the in-memory state have diverged, which is fatal for
/// the coordinator instance that observes it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("region {0} is already registered")]
    RegionAlreadyRegistered(RegionKey),

    #[error("region {0} is not registered")]
    UnknownRegion(RegionKey),

    #[error("proxy {0} is already registered")]
    ProxyAlreadyRegistered(RegionKey),

    #[error("proxy {0} is not registered")]
    UnknownProxy(RegionKey),

    #[error("shard {0} is already allocated")]
    ShardAlreadyAllocated(ShardId),

    #[error("shard {0} is not allocated")]
    ShardNotAllocated(ShardId),
}
