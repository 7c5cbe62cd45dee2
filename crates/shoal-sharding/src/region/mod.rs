//! Shard Region
//!
//! Per-node router for one entry type. Resolves every incoming message
//! to a shard, delivers locally, forwards to the owning remote region,
//! or buffers while the home is unknown and the coordinator is being
//! asked. Also the coordinator's counterpart in the handoff protocol and
//! the host of local [`Shard`] actors.

pub mod messages;

use crate::coordinator::messages::{
    BeginHandOff, BeginHandOffAck, GetShardHome, HandOff, Register, RegionStopped, RegisterProxy,
    ShardStarted, ShardStopped,
};
use crate::dead_letter::{DeadLetterSink, DropReason};
use crate::directory::{coordinator_path, PathDirectory};
use crate::entry::{EntryFactory, EntryIdExtractor, ShardResolver};
use crate::journal::Journal;
use crate::membership::{ClusterMembership, Member, MemberEvent};
use crate::shard::messages::ShardEnvelope;
use crate::shard::Shard;
use crate::timer;
use kameo::request::MessageSend;
use kameo::actor::{ActorID, ActorRef, WeakActorRef};
use kameo::error::{ActorStopReason, BoxError, SendError};
use kameo::mailbox::unbounded::UnboundedMailbox;
use kameo::message::{Context, Message};
use kameo::Actor;
use messages::{
    ClusterEvent, Envelope, GetRegionStats, HostShard, RegionStats, RegisterAck, RetryTick,
    ShardHome, ShardTerminated,
};
use shoal_core::{NodeName, RegionKey, ShardId, ShardingConfig, TypeName};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Everything a region and its shards share for one entry type.
pub(crate) struct EntryTypeContext<M: Send + Sync + 'static> {
    pub type_name: TypeName,
    pub config: Arc<ShardingConfig>,
    pub remember_entries: bool,
    /// `None` makes the region proxy-only.
    pub factory: Option<Arc<dyn EntryFactory<M>>>,
    pub extractor: Arc<dyn EntryIdExtractor<M>>,
    pub resolver: Arc<dyn ShardResolver<M>>,
    pub journal: Arc<dyn Journal>,
    pub dead_letters: Arc<dyn DeadLetterSink<M>>,
}

/// Where a shard lives, from this region's point of view.
enum Home<M: Send + Sync + 'static> {
    Local,
    Remote(ActorRef<ShardRegion<M>>),
}

impl<M: Send + Sync + 'static> Clone for Home<M> {
    fn clone(&self) -> Self {
        match self {
            Home::Local => Home::Local,
            Home::Remote(region) => Home::Remote(region.clone()),
        }
    }
}

/// Per-node message router and shard host for one entry type.
pub struct ShardRegion<M: Send + Sync + 'static> {
    ctx: Arc<EntryTypeContext<M>>,
    key: RegionKey,
    proxy_only: bool,
    membership: Arc<dyn ClusterMembership>,
    directory: PathDirectory,

    coordinator: Option<ActorRef<crate::coordinator::ShardCoordinator<M>>>,
    /// Role-matching up-members ordered oldest first.
    members_by_age: BTreeMap<u64, Member>,
    current_oldest: Option<NodeName>,

    region_by_shard: HashMap<ShardId, Home<M>>,
    /// Remote regions we learned homes from, with the shards they own.
    remote_shards: HashMap<ActorID, (ActorRef<ShardRegion<M>>, HashSet<ShardId>)>,
    shards: HashMap<ShardId, ActorRef<Shard<M>>>,
    buffers: HashMap<ShardId, VecDeque<M>>,
    buffered_total: usize,
    handing_off: HashSet<ShardId>,

    self_ref: Option<WeakActorRef<Self>>,
    self_id: Option<ActorID>,
}

impl<M: Send + Sync + 'static> ShardRegion<M> {
    pub(crate) fn new(
        ctx: Arc<EntryTypeContext<M>>,
        key: RegionKey,
        proxy_only: bool,
        membership: Arc<dyn ClusterMembership>,
        directory: PathDirectory,
    ) -> Self {
        Self {
            ctx,
            key,
            proxy_only,
            membership,
            directory,
            coordinator: None,
            members_by_age: BTreeMap::new(),
            current_oldest: None,
            region_by_shard: HashMap::new(),
            remote_shards: HashMap::new(),
            shards: HashMap::new(),
            buffers: HashMap::new(),
            buffered_total: 0,
            handing_off: HashSet::new(),
            self_ref: None,
            self_id: None,
        }
    }

    async fn stop_self(&self) {
        if let Some(self_ref) = self.self_ref.as_ref().and_then(WeakActorRef::upgrade) {
            let _ = self_ref.stop_gracefully().await;
        }
    }

    fn oldest_node(&self) -> Option<NodeName> {
        self.members_by_age
            .values()
            .next()
            .map(|member| member.node.clone())
    }

    /// (Re-)send our registration to the coordinator at the oldest
    /// role-matching member, if one is selectable yet. Repeated by the
    /// retry tick until a `RegisterAck` arrives.
    async fn register(&mut self) {
        let Some(oldest) = self.oldest_node() else {
            debug!(region = %self.key, "No coordinator node known yet");
            return;
        };
        let path = coordinator_path(&self.ctx.config.guardian_name, &self.ctx.type_name);
        let Some(coordinator) = self
            .directory
            .select::<crate::coordinator::ShardCoordinator<M>>(&oldest, &path)
        else {
            debug!(region = %self.key, node = %oldest, "Coordinator not published yet");
            return;
        };
        let Some(me) = self.self_ref.as_ref().and_then(WeakActorRef::upgrade) else {
            return;
        };

        debug!(region = %self.key, node = %oldest, "Registering with coordinator");
        let sent = if self.proxy_only {
            coordinator
                .tell(RegisterProxy {
                    proxy: me,
                    key: self.key.clone(),
                })
                .send()
                .await
                .is_ok()
        } else {
            coordinator
                .tell(Register {
                    region: me,
                    key: self.key.clone(),
                })
                .send()
                .await
                .is_ok()
        };
        if !sent {
            debug!(region = %self.key, "Coordinator unreachable during registration");
        }
    }

    async fn request_home(&mut self, shard: ShardId) {
        let Some(coordinator) = self.coordinator.clone() else {
            return;
        };
        let Some(me) = self.self_ref.as_ref().and_then(WeakActorRef::upgrade) else {
            return;
        };
        let result = coordinator
            .tell(GetShardHome {
                shard,
                requester: Some(me),
                requester_key: Some(self.key.clone()),
            })
            .send()
            .await;
        if result.is_err() {
            debug!(region = %self.key, "Coordinator lost, re-registering on next tick");
            self.coordinator = None;
        }
    }

    /// Hosted shard for `shard`, created on first use. Fatal on a
    /// proxy-only region: a proxy was told to host, which means the
    /// coordinator and this region disagree about what it is.
    async fn local_shard(&mut self, shard: &ShardId) -> Option<ActorRef<Shard<M>>> {
        if let Some(existing) = self.shards.get(shard) {
            return Some(existing.clone());
        }
        let Some(factory) = self.ctx.factory.clone() else {
            error!(
                region = %self.key,
                shard = %shard,
                "Proxy-only region asked to host a shard"
            );
            self.stop_self().await;
            return None;
        };
        let me = self.self_ref.as_ref().and_then(WeakActorRef::upgrade)?;
        let shard_ref = kameo::spawn(Shard::new(
            self.ctx.clone(),
            shard.clone(),
            factory,
            me,
        ));
        info!(region = %self.key, shard = %shard, "Started local shard");
        self.shards.insert(shard.clone(), shard_ref.clone());
        Some(shard_ref)
    }

    /// Forget a dead remote region and all the shard homes it owned, so
    /// the next message for those shards re-resolves.
    fn drop_remote(&mut self, id: ActorID) {
        if let Some((_, shards)) = self.remote_shards.remove(&id) {
            warn!(
                region = %self.key,
                dropped_shards = shards.len(),
                "Remote region lost, forgetting its shard homes"
            );
            for shard in shards {
                self.region_by_shard.remove(&shard);
            }
        }
    }

    async fn buffer_message(&mut self, shard: ShardId, msg: M) {
        if !self.buffers.contains_key(&shard) {
            self.request_home(shard.clone()).await;
        }
        if self.buffered_total >= self.ctx.config.buffer_size {
            warn!(
                region = %self.key,
                shard = %shard,
                "Region buffer full, dropping message"
            );
            self.ctx.dead_letters.publish(msg, DropReason::BufferFull);
        } else {
            self.buffers.entry(shard).or_default().push_back(msg);
            self.buffered_total += 1;
        }
    }

    /// Deliver everything parked for `shard` to its now-known home, in
    /// arrival order.
    async fn flush_buffer(&mut self, shard: &ShardId) {
        let Some(buffer) = self.buffers.remove(shard) else {
            return;
        };
        self.buffered_total -= buffer.len();
        if buffer.is_empty() {
            return;
        }
        debug!(
            region = %self.key,
            shard = %shard,
            count = buffer.len(),
            "Delivering buffered messages"
        );

        match self.region_by_shard.get(shard).cloned() {
            Some(Home::Local) => {
                if let Some(shard_ref) = self.local_shard(shard).await {
                    for msg in buffer {
                        let _ = shard_ref.tell(ShardEnvelope(msg)).send().await;
                    }
                }
            }
            Some(Home::Remote(remote)) => {
                let mut undelivered = VecDeque::new();
                let mut remote_dead = false;
                for msg in buffer {
                    if remote_dead {
                        undelivered.push_back(msg);
                        continue;
                    }
                    if let Err(e) = remote.tell(Envelope(msg)).send().await {
                        remote_dead = true;
                        if let SendError::ActorNotRunning(Envelope(msg)) = e {
                            undelivered.push_back(msg);
                        }
                    }
                }
                if remote_dead {
                    self.drop_remote(remote.id());
                    self.buffered_total += undelivered.len();
                    self.buffers.insert(shard.clone(), undelivered);
                    self.request_home(shard.clone()).await;
                }
            }
            None => {
                // Home vanished between recording and flushing; park again.
                self.buffered_total += buffer.len();
                self.buffers.insert(shard.clone(), buffer);
            }
        }
    }
}

impl<M: Send + Sync + 'static> Actor for ShardRegion<M> {
    type Mailbox = UnboundedMailbox<Self>;

    fn name() -> &'static str {
        "ShardRegion"
    }

    async fn on_start(&mut self, actor_ref: ActorRef<Self>) -> Result<(), BoxError> {
        self.self_ref = Some(actor_ref.downgrade());
        self.self_id = Some(actor_ref.id());

        let role = self.ctx.config.role.clone();
        for member in self.membership.members() {
            if member.has_role(role.as_deref()) {
                self.members_by_age.insert(member.up_number, member);
            }
        }
        self.current_oldest = self.oldest_node();

        // Forward membership events into the mailbox for as long as the
        // region lives.
        let mut events = self.membership.subscribe();
        let weak = actor_ref.downgrade();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(region) = weak.upgrade() else { break };
                        if region.tell(ClusterEvent(event)).send().await.is_err() {
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

        info!(
            region = %self.key,
            proxy_only = self.proxy_only,
            "Shard region starting"
        );
        self.register().await;
        timer::schedule_interval(
            actor_ref.downgrade(),
            self.ctx.config.retry_interval,
            || RetryTick,
        );
        Ok(())
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        _reason: ActorStopReason,
    ) -> Result<(), BoxError> {
        for (_, shard) in self.shards.drain() {
            let _ = shard.stop_gracefully().await;
        }
        if let Some(coordinator) = self.coordinator.take() {
            let _ = coordinator
                .tell(RegionStopped {
                    key: self.key.clone(),
                })
                .send()
                .await;
        }
        info!(region = %self.key, "Shard region stopped");
        Ok(())
    }
}

impl<M: Send + Sync + 'static> Message<Envelope<M>> for ShardRegion<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: Envelope<M>,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        let shard = self.ctx.resolver.shard_id(&msg.0);
        if shard.is_empty() {
            self.ctx.dead_letters.publish(msg.0, DropReason::EmptyShardId);
            return;
        }

        match self.region_by_shard.get(&shard).cloned() {
            Some(Home::Local) => {
                if let Some(shard_ref) = self.local_shard(&shard).await {
                    let _ = shard_ref.tell(ShardEnvelope(msg.0)).send().await;
                }
            }
            Some(Home::Remote(remote)) => {
                if let Err(e) = remote.tell(msg).send().await {
                    debug!(
                        region = %self.key,
                        shard = %shard,
                        "Forward to remote region failed"
                    );
                    self.drop_remote(remote.id());
                    if let SendError::ActorNotRunning(envelope) = e {
                        self.buffer_message(shard, envelope.0).await;
                    }
                }
            }
            None => self.buffer_message(shard, msg.0).await,
        }
    }
}

impl<M: Send + Sync + 'static> Message<HostShard<M>> for ShardRegion<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: HostShard<M>,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        debug!(region = %self.key, shard = %msg.shard, "Hosting shard");
        self.region_by_shard.insert(msg.shard.clone(), Home::Local);
        if let Some(_shard_ref) = self.local_shard(&msg.shard).await {
            self.flush_buffer(&msg.shard).await;
            let _ = msg
                .coordinator
                .tell(ShardStarted {
                    shard: msg.shard,
                })
                .send()
                .await;
        }
    }
}

impl<M: Send + Sync + 'static> Message<ShardHome<M>> for ShardRegion<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: ShardHome<M>,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        let is_self = Some(msg.region.id()) == self.self_id;

        if let Some(Home::Local) = self.region_by_shard.get(&msg.shard) {
            if !is_self {
                // Ownership moved off this region without a handoff;
                // the maps here can no longer be trusted.
                error!(
                    region = %self.key,
                    shard = %msg.shard,
                    "Shard home moved away from this region without handoff"
                );
                self.stop_self().await;
                return;
            }
        }

        debug!(region = %self.key, shard = %msg.shard, "Shard home recorded");
        if is_self {
            self.region_by_shard.insert(msg.shard.clone(), Home::Local);
        } else {
            self.region_by_shard
                .insert(msg.shard.clone(), Home::Remote(msg.region.clone()));
            let entry = self
                .remote_shards
                .entry(msg.region.id())
                .or_insert_with(|| (msg.region.clone(), HashSet::new()));
            entry.1.insert(msg.shard.clone());
        }
        self.flush_buffer(&msg.shard).await;
    }
}

impl<M: Send + Sync + 'static> Message<RegisterAck<M>> for ShardRegion<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: RegisterAck<M>,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        info!(region = %self.key, "Registered with coordinator");
        self.coordinator = Some(msg.coordinator);
        let buffered: Vec<ShardId> = self.buffers.keys().cloned().collect();
        for shard in buffered {
            self.request_home(shard).await;
        }
    }
}

impl<M: Send + Sync + 'static> Message<BeginHandOff> for ShardRegion<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: BeginHandOff,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        debug!(region = %self.key, shard = %msg.shard, "Hand off beginning");
        if let Some(Home::Remote(remote)) = self.region_by_shard.remove(&msg.shard) {
            if let Some((_, shards)) = self.remote_shards.get_mut(&remote.id()) {
                shards.remove(&msg.shard);
            }
        }
        let _ = msg.ack.send(BeginHandOffAck {
            shard: msg.shard,
            from: self.key.clone(),
        });
    }
}

impl<M: Send + Sync + 'static> Message<HandOff> for ShardRegion<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: HandOff,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        // Messages buffered since BeginHandOff may have been forwarded
        // here by regions that already dropped their mapping; delivering
        // them now could reorder against the shard's next home.
        if let Some(buffer) = self.buffers.remove(&msg.shard) {
            self.buffered_total -= buffer.len();
            debug!(
                region = %self.key,
                shard = %msg.shard,
                purged = buffer.len(),
                "Purging buffered messages for shard being handed off"
            );
            for parked in buffer {
                self.ctx.dead_letters.publish(parked, DropReason::HandingOff);
            }
        }

        if let Some(shard_ref) = self.shards.get(&msg.shard).cloned() {
            info!(region = %self.key, shard = %msg.shard, "Handing off hosted shard");
            self.handing_off.insert(msg.shard.clone());
            let _ = shard_ref.tell(msg).send().await;
        } else {
            let _ = msg.reply.send(ShardStopped { shard: msg.shard });
        }
    }
}

impl<M: Send + Sync + 'static> Message<RetryTick> for ShardRegion<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        _msg: RetryTick,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        if self.coordinator.is_none() {
            self.register().await;
            return;
        }
        let buffered: Vec<ShardId> = self.buffers.keys().cloned().collect();
        for shard in buffered {
            self.request_home(shard).await;
        }
    }
}

impl<M: Send + Sync + 'static> Message<ClusterEvent> for ShardRegion<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: ClusterEvent,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        let role = self.ctx.config.role.clone();
        match msg.0 {
            MemberEvent::MemberUp(member) => {
                if member.has_role(role.as_deref()) {
                    self.members_by_age.insert(member.up_number, member);
                }
            }
            MemberEvent::MemberRemoved(member) => {
                self.members_by_age.remove(&member.up_number);
            }
        }

        let new_oldest = self.oldest_node();
        if new_oldest != self.current_oldest {
            info!(
                region = %self.key,
                oldest = ?new_oldest.as_ref().map(NodeName::as_str),
                "Coordinator node changed, re-registering"
            );
            self.current_oldest = new_oldest;
            self.coordinator = None;
            self.register().await;
        }
    }
}

impl<M: Send + Sync + 'static> Message<ShardTerminated> for ShardRegion<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: ShardTerminated,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        self.shards.remove(&msg.shard);
        if self.handing_off.remove(&msg.shard) {
            debug!(region = %self.key, shard = %msg.shard, "Shard stopped after handoff");
        } else {
            error!(
                region = %self.key,
                shard = %msg.shard,
                "Hosted shard terminated outside handoff"
            );
            self.stop_self().await;
        }
    }
}

impl<M: Send + Sync + 'static> Message<GetRegionStats> for ShardRegion<M> {
    type Reply = RegionStats;

    async fn handle(
        &mut self,
        _msg: GetRegionStats,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        RegionStats {
            hosted_shards: self.shards.keys().cloned().collect(),
            buffered_messages: self.buffered_total,
            known_shards: self.region_by_shard.len(),
            has_coordinator: self.coordinator.is_some(),
        }
    }
}
