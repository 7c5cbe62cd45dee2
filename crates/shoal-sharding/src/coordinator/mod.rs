//! Shard Coordinator
//!
//! Event-sourced singleton owning the authoritative shard-to-region map
//! for one entry type. Every mutation is validated against the pure
//! state fold, appended to the journal, and only then applied, so a
//! restarted coordinator recovers exactly the map it last persisted.
//! Live actor refs are never persisted: events carry region keys, and
//! the runtime key-to-ref table is rebuilt from registrations.

pub mod messages;
pub(crate) mod rebalance;
pub mod supervisor;

use crate::journal::{Journal, SequenceNr};
use crate::membership::{ClusterMembership, MemberEvent};
use crate::region::messages::{HostShard, RegisterAck, ShardHome};
use crate::region::ShardRegion;
use crate::timer;
use kameo::request::MessageSend;
use kameo::actor::{ActorRef, WeakActorRef};
use kameo::error::{ActorStopReason, BoxError};
use kameo::mailbox::unbounded::UnboundedMailbox;
use kameo::message::{Context, Message};
use kameo::Actor;
use messages::{
    GetShardHome, MemberChanged, RebalanceDone, RebalanceTick, Register, RegionStopped,
    RegisterProxy, ResendShardHost, ShardStarted, SnapshotTick,
};
use shoal_core::{
    AllocationStrategy, CoordinatorEvent, CoordinatorState, RegionKey, ShardId, ShardingConfig,
    TypeName,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use supervisor::CoordinatorStopped;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Event-sourced allocation authority for one entry type.
pub struct ShardCoordinator<M: Send + Sync + 'static> {
    type_name: TypeName,
    config: Arc<ShardingConfig>,
    strategy: Arc<dyn AllocationStrategy>,
    journal: Arc<dyn Journal>,
    membership: Arc<dyn ClusterMembership>,
    persistence_id: String,
    supervisor: Option<ActorRef<supervisor::CoordinatorSupervisor<M>>>,

    state: CoordinatorState,
    last_seq: SequenceNr,

    /// Runtime resolution of persisted region keys to live refs,
    /// refreshed by every registration.
    live_regions: HashMap<RegionKey, ActorRef<ShardRegion<M>>>,
    live_proxies: HashMap<RegionKey, ActorRef<ShardRegion<M>>>,
    rebalance_in_progress: HashSet<ShardId>,
    /// Shards whose `HostShard` has not been confirmed by `ShardStarted`.
    unacked_hosts: HashSet<ShardId>,

    self_ref: Option<WeakActorRef<Self>>,
}

impl<M: Send + Sync + 'static> ShardCoordinator<M> {
    pub(crate) fn new(
        type_name: TypeName,
        config: Arc<ShardingConfig>,
        strategy: Arc<dyn AllocationStrategy>,
        journal: Arc<dyn Journal>,
        membership: Arc<dyn ClusterMembership>,
        supervisor: Option<ActorRef<supervisor::CoordinatorSupervisor<M>>>,
    ) -> Self {
        let persistence_id = crate::directory::coordinator_path(&config.guardian_name, &type_name);
        Self {
            type_name,
            config,
            strategy,
            journal,
            membership,
            persistence_id,
            supervisor,
            state: CoordinatorState::default(),
            last_seq: 0,
            live_regions: HashMap::new(),
            live_proxies: HashMap::new(),
            rebalance_in_progress: HashSet::new(),
            unacked_hosts: HashSet::new(),
            self_ref: None,
        }
    }

    fn me(&self) -> Option<ActorRef<Self>> {
        self.self_ref.as_ref().and_then(WeakActorRef::upgrade)
    }

    async fn stop_self(&self) {
        if let Some(self_ref) = self.me() {
            let _ = self_ref.stop_gracefully().await;
        }
    }

    /// Validate, append, apply. A fold rejection is a protocol bug and a
    /// failed append leaves the log in doubt; both stop the coordinator
    /// and let the supervisor recover it from the journal.
    async fn persist(&mut self, event: CoordinatorEvent) -> bool {
        let next = match self.state.updated(&event) {
            Ok(next) => next,
            Err(e) => {
                error!(
                    type_name = %self.type_name,
                    error = %e,
                    "Rejected coordinator event, stopping"
                );
                self.stop_self().await;
                return false;
            }
        };
        let bytes = match serde_json::to_vec(&event) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(type_name = %self.type_name, error = %e, "Event serialization failed");
                self.stop_self().await;
                return false;
            }
        };
        match self.journal.append(&self.persistence_id, &bytes).await {
            Ok(seq) => {
                self.state = next;
                self.last_seq = seq;
                debug_assert!(self.state.is_consistent());
                true
            }
            Err(e) => {
                error!(
                    type_name = %self.type_name,
                    error = %e,
                    "Coordinator persistence failed, stopping for recovery"
                );
                self.stop_self().await;
                false
            }
        }
    }

    /// Ask ourselves to find a home for every unallocated shard.
    async fn allocate_shard_homes(&mut self) {
        let Some(me) = self.me() else { return };
        for shard in self.state.unallocated.clone() {
            let _ = me
                .tell(GetShardHome::<M> {
                    shard,
                    requester: None,
                    requester_key: None,
                })
                .send()
                .await;
        }
    }

    /// Order the owning region to host `shard`, re-sending until the
    /// region confirms with `ShardStarted`.
    async fn send_host_shard(&mut self, shard: ShardId) {
        let Some(region_key) = self.state.home_of(&shard).cloned() else {
            return;
        };
        let Some(region) = self.live_regions.get(&region_key).cloned() else {
            debug!(shard = %shard, region = %region_key, "Owner not registered yet");
            return;
        };
        let Some(me) = self.me() else { return };

        self.unacked_hosts.insert(shard.clone());
        let sent = region
            .tell(HostShard {
                shard: shard.clone(),
                coordinator: me,
            })
            .send()
            .await;
        if sent.is_err() {
            warn!(shard = %shard, region = %region_key, "Owner unreachable for host order");
            self.region_terminated(region_key).await;
            return;
        }
        if let Some(weak) = self.self_ref.clone() {
            timer::schedule_once(
                weak,
                self.config.shard_start_timeout,
                ResendShardHost {
                    shard,
                    region: region_key,
                },
            );
        }
    }

    async fn region_terminated(&mut self, key: RegionKey) {
        if self.state.regions.contains_key(&key) {
            info!(type_name = %self.type_name, region = %key, "Shard region terminated");
            for shard in self.state.shards_of(&key).to_vec() {
                self.unacked_hosts.remove(&shard);
            }
            self.live_regions.remove(&key);
            if self
                .persist(CoordinatorEvent::RegionTerminated { region: key })
                .await
            {
                self.allocate_shard_homes().await;
            }
        } else if self.state.proxies.contains(&key) {
            info!(type_name = %self.type_name, proxy = %key, "Region proxy terminated");
            self.live_proxies.remove(&key);
            let _ = self
                .persist(CoordinatorEvent::RegionProxyTerminated { proxy: key })
                .await;
        }
    }

    /// Purge every known region and proxy hosted on `node`. Stands in
    /// for death watch on nodes the coordinator holds no live ref for,
    /// which is exactly the situation right after a failover recovery.
    async fn node_removed(&mut self, node: &shoal_core::NodeName) {
        let gone: Vec<RegionKey> = self
            .state
            .regions
            .keys()
            .chain(self.state.proxies.iter())
            .filter(|key| &key.node_name() == node)
            .cloned()
            .collect();
        for key in gone {
            self.region_terminated(key).await;
        }
    }

    async fn save_snapshot(&self) {
        let bytes = match serde_json::to_vec(&self.state) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(type_name = %self.type_name, error = %e, "Snapshot serialization failed");
                return;
            }
        };
        if let Err(e) = self
            .journal
            .save_snapshot(&self.persistence_id, self.last_seq, &bytes)
            .await
        {
            warn!(type_name = %self.type_name, error = %e, "Snapshot save failed");
        }
    }
}

impl<M: Send + Sync + 'static> Actor for ShardCoordinator<M> {
    type Mailbox = UnboundedMailbox<Self>;

    fn name() -> &'static str {
        "ShardCoordinator"
    }

    async fn on_start(&mut self, actor_ref: ActorRef<Self>) -> Result<(), BoxError> {
        self.self_ref = Some(actor_ref.downgrade());

        // Recovery: snapshot first, then the remaining events, both
        // through the same pure fold used during live operation.
        let (mut state, mut last_seq) =
            match self.journal.load_snapshot(&self.persistence_id).await? {
                Some((seq, bytes)) => (serde_json::from_slice(&bytes)?, seq),
                None => (CoordinatorState::default(), 0),
            };
        for (seq, bytes) in self.journal.replay(&self.persistence_id, last_seq).await? {
            let event: CoordinatorEvent = serde_json::from_slice(&bytes)?;
            state = state.updated(&event)?;
            last_seq = seq;
        }
        self.state = state;
        self.last_seq = last_seq;

        info!(
            type_name = %self.type_name,
            regions = self.state.regions.len(),
            shards = self.state.shards.len(),
            unallocated = self.state.unallocated.len(),
            "Coordinator recovered"
        );

        // Regions recovered from the journal whose node already left the
        // cluster will never re-register; purge them now so their shards
        // become allocatable.
        let up_nodes: HashSet<shoal_core::NodeName> = self
            .membership
            .members()
            .into_iter()
            .map(|m| m.node)
            .collect();
        let gone: Vec<shoal_core::NodeName> = self
            .state
            .regions
            .keys()
            .chain(self.state.proxies.iter())
            .map(RegionKey::node_name)
            .filter(|node| !up_nodes.contains(node))
            .collect();
        for node in gone {
            self.node_removed(&node).await;
        }

        // Forward membership events into the mailbox.
        let mut events = self.membership.subscribe();
        let weak = actor_ref.downgrade();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(coordinator) = weak.upgrade() else { break };
                        if coordinator.tell(MemberChanged(event)).send().await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Membership event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        // Known regions hold no live refs yet; their shards become
        // hostable again as they re-register. Unallocated shards can be
        // driven right away (they wait for the first registration).
        self.allocate_shard_homes().await;

        timer::schedule_interval(
            actor_ref.downgrade(),
            self.config.rebalance_interval,
            || RebalanceTick,
        );
        timer::schedule_interval(
            actor_ref.downgrade(),
            self.config.snapshot_interval,
            || SnapshotTick,
        );
        Ok(())
    }

    async fn on_stop(
        &mut self,
        actor_ref: WeakActorRef<Self>,
        _reason: ActorStopReason,
    ) -> Result<(), BoxError> {
        info!(type_name = %self.type_name, "Coordinator stopped");
        if let Some(supervisor) = self.supervisor.take() {
            let _ = supervisor
                .tell(CoordinatorStopped {
                    id: actor_ref.id(),
                })
                .send()
                .await;
        }
        Ok(())
    }
}

impl<M: Send + Sync + 'static> Message<Register<M>> for ShardCoordinator<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: Register<M>,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        let Some(me) = self.me() else { return };

        if self.state.regions.contains_key(&msg.key) {
            // Re-registration after a coordinator or region restart:
            // refresh the ref, ack, and re-issue host orders for
            // everything this region is supposed to own.
            debug!(region = %msg.key, "Region re-registered");
            self.live_regions.insert(msg.key.clone(), msg.region.clone());
            let _ = msg
                .region
                .tell(RegisterAck { coordinator: me })
                .send()
                .await;
            for shard in self.state.shards_of(&msg.key).to_vec() {
                self.send_host_shard(shard).await;
            }
            return;
        }

        if !self
            .persist(CoordinatorEvent::RegionRegistered {
                region: msg.key.clone(),
            })
            .await
        {
            return;
        }
        info!(type_name = %self.type_name, region = %msg.key, "Shard region registered");
        self.live_regions.insert(msg.key.clone(), msg.region.clone());
        let _ = msg
            .region
            .tell(RegisterAck { coordinator: me })
            .send()
            .await;

        // The first region makes previously stranded shards placeable.
        if self.state.regions.len() == 1 {
            self.allocate_shard_homes().await;
        }
    }
}

impl<M: Send + Sync + 'static> Message<RegisterProxy<M>> for ShardCoordinator<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: RegisterProxy<M>,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        let Some(me) = self.me() else { return };

        if self.state.proxies.contains(&msg.key) {
            debug!(proxy = %msg.key, "Proxy re-registered");
            self.live_proxies.insert(msg.key.clone(), msg.proxy.clone());
            let _ = msg.proxy.tell(RegisterAck { coordinator: me }).send().await;
            return;
        }

        if !self
            .persist(CoordinatorEvent::RegionProxyRegistered {
                proxy: msg.key.clone(),
            })
            .await
        {
            return;
        }
        info!(type_name = %self.type_name, proxy = %msg.key, "Region proxy registered");
        self.live_proxies.insert(msg.key.clone(), msg.proxy.clone());
        let _ = msg.proxy.tell(RegisterAck { coordinator: me }).send().await;
    }
}

impl<M: Send + Sync + 'static> Message<GetShardHome<M>> for ShardCoordinator<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: GetShardHome<M>,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        if self.rebalance_in_progress.contains(&msg.shard) {
            // The requester keeps its own retry timer; answering now
            // would hand out a home that is about to change.
            debug!(shard = %msg.shard, "Home request deferred during rebalance");
            return;
        }

        if let Some(region_key) = self.state.home_of(&msg.shard).cloned() {
            if let (Some(requester), Some(region)) =
                (msg.requester, self.live_regions.get(&region_key))
            {
                let _ = requester
                    .tell(ShardHome {
                        shard: msg.shard,
                        region: region.clone(),
                    })
                    .send()
                    .await;
            }
            return;
        }

        if self.state.regions.is_empty() {
            debug!(shard = %msg.shard, "No regions registered, cannot allocate");
            return;
        }

        let Some(chosen) =
            self.strategy
                .allocate(msg.requester_key.as_ref(), &msg.shard, &self.state.regions)
        else {
            return;
        };
        if !self
            .persist(CoordinatorEvent::ShardHomeAllocated {
                shard: msg.shard.clone(),
                region: chosen.clone(),
            })
            .await
        {
            return;
        }
        info!(
            type_name = %self.type_name,
            shard = %msg.shard,
            region = %chosen,
            "Shard home allocated"
        );

        self.send_host_shard(msg.shard.clone()).await;
        if let (Some(requester), Some(region)) = (msg.requester, self.live_regions.get(&chosen)) {
            let _ = requester
                .tell(ShardHome {
                    shard: msg.shard,
                    region: region.clone(),
                })
                .send()
                .await;
        }
    }
}

impl<M: Send + Sync + 'static> Message<ShardStarted> for ShardCoordinator<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: ShardStarted,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        debug!(shard = %msg.shard, "Shard start confirmed");
        self.unacked_hosts.remove(&msg.shard);
    }
}

impl<M: Send + Sync + 'static> Message<ResendShardHost> for ShardCoordinator<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: ResendShardHost,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        let still_owner = self.state.home_of(&msg.shard) == Some(&msg.region);
        if still_owner && self.unacked_hosts.contains(&msg.shard) {
            debug!(shard = %msg.shard, region = %msg.region, "Re-sending host order");
            self.send_host_shard(msg.shard).await;
        }
    }
}

impl<M: Send + Sync + 'static> Message<RegionStopped> for ShardCoordinator<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: RegionStopped,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        self.region_terminated(msg.key).await;
    }
}

impl<M: Send + Sync + 'static> Message<RebalanceTick> for ShardCoordinator<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        _msg: RebalanceTick,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        let picked = self
            .strategy
            .rebalance(&self.state.regions, &self.rebalance_in_progress);
        for shard in picked {
            let Some(weak) = self.self_ref.clone() else {
                break;
            };
            let Some(from_key) = self.state.home_of(&shard).cloned() else {
                continue;
            };
            let Some(from) = self.live_regions.get(&from_key).cloned() else {
                continue;
            };
            info!(
                type_name = %self.type_name,
                shard = %shard,
                from = %from_key,
                "Rebalancing shard"
            );
            self.rebalance_in_progress.insert(shard.clone());
            let all_regions = self
                .live_regions
                .values()
                .chain(self.live_proxies.values())
                .cloned()
                .collect();
            rebalance::spawn_rebalance_worker(
                weak,
                shard,
                from,
                all_regions,
                self.config.hand_off_timeout,
            );
        }
    }
}

impl<M: Send + Sync + 'static> Message<RebalanceDone> for ShardCoordinator<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: RebalanceDone,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        self.rebalance_in_progress.remove(&msg.shard);
        // A late or failed worker for a shard we no longer track is a
        // no-op; the shard stays where it is until the next tick.
        if msg.ok && self.state.home_of(&msg.shard).is_some() {
            info!(shard = %msg.shard, "Rebalance complete, deallocating");
            self.unacked_hosts.remove(&msg.shard);
            if self
                .persist(CoordinatorEvent::ShardHomeDeallocated {
                    shard: msg.shard,
                })
                .await
            {
                self.allocate_shard_homes().await;
            }
        }
    }
}

impl<M: Send + Sync + 'static> Message<MemberChanged> for ShardCoordinator<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: MemberChanged,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        if let MemberEvent::MemberRemoved(member) = msg.0 {
            self.node_removed(&member.node).await;
        }
    }
}

impl<M: Send + Sync + 'static> Message<SnapshotTick> for ShardCoordinator<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        _msg: SnapshotTick,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        self.save_snapshot().await;
    }
}
