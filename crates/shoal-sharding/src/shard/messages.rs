//! Shard Message Types

use shoal_core::{EntryId, EntryEvent};

/// An application message routed to this shard by its region. The shard
/// splits it into entry id and payload with the type's extractor.
pub struct ShardEnvelope<M>(pub M);

/// Graceful shutdown request for one entry, sent by the entry itself
/// (via its wrapper) when it wants to leave memory. The shard diverts
/// new messages for the entry into a buffer and forwards `stop_message`
/// as the entry's final input.
pub struct Passivate<M> {
    pub id: EntryId,
    pub stop_message: M,
}

/// Termination notice from an entry wrapper.
pub(crate) struct EntryTerminated {
    pub id: EntryId,
}

/// Scheduled restart of a remembered entry that stopped without
/// passivating.
pub(crate) struct RestartEntry {
    pub id: EntryId,
}

/// Scheduled retry of a failed persistence operation.
pub(crate) struct RetryPersistence {
    pub event: EntryEvent,
}

/// Re-delivery of a message that was parked in an entry buffer.
pub(crate) struct BufferedDeliver<M> {
    pub id: EntryId,
    pub msg: M,
}

/// Periodic snapshot trigger.
pub(crate) struct SnapshotTick;
