//! Handoff Stopper
//!
//! Drives the graceful stop of a shard's entry set during handoff: sends
//! every entry its shutdown signal up front, then counts terminations
//! until none remain. Deliberately has no timeout; the rebalance worker
//! on the coordinator side owns the deadline and will fail the whole
//! handoff if this takes too long.

use crate::entry::EntryActor;
use kameo::actor::ActorRef;
use shoal_core::{EntryId, ShardId};
use std::collections::{HashMap, HashSet};
use tracing::debug;

pub(crate) struct HandoffStopper {
    shard_id: ShardId,
    remaining: HashSet<EntryId>,
}

impl HandoffStopper {
    /// Signal every entry to stop and start counting.
    pub(crate) async fn start<M: Send + Sync + 'static>(
        shard_id: ShardId,
        entries: &HashMap<EntryId, ActorRef<EntryActor<M>>>,
    ) -> Self {
        debug!(
            shard = %shard_id,
            entries = entries.len(),
            "Stopping entries for handoff"
        );
        for entry in entries.values() {
            let _ = entry.stop_gracefully().await;
        }
        Self {
            shard_id,
            remaining: entries.keys().cloned().collect(),
        }
    }

    /// Record one termination; true when every entry is gone.
    pub(crate) fn entry_terminated(&mut self, id: &EntryId) -> bool {
        self.remaining.remove(id);
        if self.remaining.is_empty() {
            debug!(shard = %self.shard_id, "All entries stopped");
            true
        } else {
            false
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.remaining.len()
    }
}
