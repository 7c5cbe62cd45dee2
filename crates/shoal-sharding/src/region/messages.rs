//! Shard Region Message Types

use crate::coordinator::ShardCoordinator;
use crate::region::ShardRegion;
use kameo::actor::ActorRef;
use kameo::Reply;
use shoal_core::ShardId;

/// An application message entering the sharding layer. The region
/// resolves the target shard and either delivers, forwards or buffers.
pub struct Envelope<M>(pub M);

/// Coordinator order to host a shard locally.
pub struct HostShard<M: Send + Sync + 'static> {
    pub shard: ShardId,
    pub coordinator: ActorRef<ShardCoordinator<M>>,
}

/// Coordinator answer to a home request.
pub struct ShardHome<M: Send + Sync + 'static> {
    pub shard: ShardId,
    pub region: ActorRef<ShardRegion<M>>,
}

/// Registration acknowledgement carrying the coordinator to talk to.
pub struct RegisterAck<M: Send + Sync + 'static> {
    pub coordinator: ActorRef<ShardCoordinator<M>>,
}

/// Membership change forwarded from the subscription task.
pub(crate) struct ClusterEvent(pub crate::membership::MemberEvent);

/// Periodic retry of registration and buffered home requests.
pub(crate) struct RetryTick;

/// Termination notice from a locally hosted shard.
pub(crate) struct ShardTerminated {
    pub shard: ShardId,
}

/// Operational snapshot query.
pub struct GetRegionStats;

/// Region statistics.
#[derive(Debug, Clone, Reply)]
pub struct RegionStats {
    /// Shards hosted by this region right now.
    pub hosted_shards: Vec<ShardId>,
    /// Messages parked for shards with unknown homes.
    pub buffered_messages: usize,
    /// Distinct shards with a known home.
    pub known_shards: usize,
    /// Whether the coordinator is currently known.
    pub has_coordinator: bool,
}
