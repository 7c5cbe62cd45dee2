//! Rebalance Worker
//!
//! Transient task driving the handoff of a single shard: gather
//! `BeginHandOffAck` from every region and proxy, order the owner to
//! hand off, await `ShardStopped`, and report the outcome to the
//! coordinator. One timeout covers the whole operation; on expiry the
//! shard simply stays where it was and a later tick may retry.

use super::messages::{BeginHandOff, HandOff, RebalanceDone};
use super::ShardCoordinator;
use crate::region::ShardRegion;
use kameo::request::MessageSend;
use kameo::actor::{ActorRef, WeakActorRef};
use shoal_core::{RegionKey, ShardId};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

pub(crate) fn spawn_rebalance_worker<M: Send + Sync + 'static>(
    coordinator: WeakActorRef<ShardCoordinator<M>>,
    shard: ShardId,
    from: ActorRef<ShardRegion<M>>,
    all_regions: Vec<ActorRef<ShardRegion<M>>>,
    hand_off_timeout: Duration,
) {
    tokio::spawn(async move {
        let ok = tokio::time::timeout(
            hand_off_timeout,
            run_handoff(shard.clone(), from, all_regions),
        )
        .await
        .unwrap_or(false);

        if !ok {
            info!(shard = %shard, "Rebalance did not complete");
        }
        if let Some(coordinator) = coordinator.upgrade() {
            let _ = coordinator.tell(RebalanceDone { shard, ok }).send().await;
        }
    });
}

async fn run_handoff<M: Send + Sync + 'static>(
    shard: ShardId,
    from: ActorRef<ShardRegion<M>>,
    all_regions: Vec<ActorRef<ShardRegion<M>>>,
) -> bool {
    // Phase 1: every region forgets the shard's location and confirms,
    // so no further traffic is forwarded to the old owner.
    let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
    let mut expected = 0usize;
    for region in &all_regions {
        let sent = region
            .tell(BeginHandOff {
                shard: shard.clone(),
                ack: ack_tx.clone(),
            })
            .send()
            .await;
        if sent.is_ok() {
            expected += 1;
        }
    }
    drop(ack_tx);

    let mut acked: HashSet<RegionKey> = HashSet::new();
    while acked.len() < expected {
        match ack_rx.recv().await {
            Some(ack) if ack.shard == shard => {
                acked.insert(ack.from);
            }
            Some(_) => {}
            // A region died holding its ack sender; give up early, the
            // timeout would catch it anyway.
            None => return false,
        }
    }
    debug!(shard = %shard, regions = expected, "All regions acknowledged handoff");

    // Phase 2: the owner stops the shard and its entries.
    let (stop_tx, stop_rx) = oneshot::channel();
    let sent = from
        .tell(HandOff {
            shard: shard.clone(),
            reply: stop_tx,
        })
        .send()
        .await;
    if sent.is_err() {
        return false;
    }

    match stop_rx.await {
        Ok(stopped) => stopped.shard == shard,
        Err(_) => false,
    }
}
