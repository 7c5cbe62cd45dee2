//! Shard Coordinator Message Types
//!
//! The coordinator half of the sharding protocol, plus the handoff
//! messages regions answer. Acknowledgements flow over explicit reply
//! refs and channels carried inside the messages.

use crate::region::ShardRegion;
use kameo::actor::ActorRef;
use shoal_core::{RegionKey, ShardId};
use tokio::sync::{mpsc, oneshot};

/// A region announcing itself as a shard host. Idempotent; answered
/// with a `RegisterAck` to the region.
pub struct Register<M: Send + Sync + 'static> {
    pub region: ActorRef<ShardRegion<M>>,
    pub key: RegionKey,
}

/// A proxy-only region announcing itself. Routes but never hosts.
pub struct RegisterProxy<M: Send + Sync + 'static> {
    pub proxy: ActorRef<ShardRegion<M>>,
    pub key: RegionKey,
}

/// Where does this shard live? Allocates on first touch. `requester` is
/// `None` when the coordinator drives reallocation itself.
pub struct GetShardHome<M: Send + Sync + 'static> {
    pub shard: ShardId,
    pub requester: Option<ActorRef<ShardRegion<M>>>,
    pub requester_key: Option<RegionKey>,
}

/// Region confirmation that a `HostShard` order was carried out.
pub struct ShardStarted {
    pub shard: ShardId,
}

/// A region is going away (graceful stop notification).
pub struct RegionStopped {
    pub key: RegionKey,
}

/// First phase of handoff: every region must drop its location mapping
/// for the shard and acknowledge over the channel.
pub struct BeginHandOff {
    pub shard: ShardId,
    pub ack: mpsc::UnboundedSender<BeginHandOffAck>,
}

/// Acknowledgement of [`BeginHandOff`].
pub struct BeginHandOffAck {
    pub shard: ShardId,
    pub from: RegionKey,
}

/// Second phase of handoff, sent to the owning region only: stop the
/// shard and all its entries, then report [`ShardStopped`].
pub struct HandOff {
    pub shard: ShardId,
    pub reply: oneshot::Sender<ShardStopped>,
}

/// The shard and all its entries are gone.
#[derive(Debug)]
pub struct ShardStopped {
    pub shard: ShardId,
}

/// Outcome of one rebalance worker.
pub(crate) struct RebalanceDone {
    pub shard: ShardId,
    pub ok: bool,
}

/// Periodic rebalance evaluation.
pub(crate) struct RebalanceTick;

/// Periodic snapshot trigger.
pub(crate) struct SnapshotTick;

/// Scheduled re-send of an unacknowledged `HostShard`.
pub(crate) struct ResendShardHost {
    pub shard: ShardId,
    pub region: RegionKey,
}

/// Membership change forwarded from the subscription task.
pub(crate) struct MemberChanged(pub crate::membership::MemberEvent);
