//! Shard
//!
//! Supervisor of the entries belonging to one (type, shard id) on one
//! node. Routes payloads to live entries, creating them on demand;
//! persists entry membership when the type remembers entries; buffers
//! messages for entries that are mid-start or passivating; and executes
//! handoff by stopping its entry set and reporting back.

pub(crate) mod handoff;
pub(crate) mod messages;

use crate::coordinator::messages::{HandOff, ShardStopped};
use crate::dead_letter::DropReason;
use crate::entry::{Deliver, EntryActor, EntryFactory};
use crate::journal;
use crate::region::messages::ShardTerminated;
use crate::region::{EntryTypeContext, ShardRegion};
use crate::timer;
use handoff::HandoffStopper;
use kameo::request::MessageSend;
use kameo::actor::{ActorRef, WeakActorRef};
use kameo::error::{ActorStopReason, BoxError};
use kameo::mailbox::unbounded::UnboundedMailbox;
use kameo::message::{Context, Message};
use kameo::Actor;
use messages::{
    BufferedDeliver, EntryTerminated, Passivate, RestartEntry, RetryPersistence, ShardEnvelope,
    SnapshotTick,
};
use shoal_core::{EntryEvent, EntryId, ShardEntries, ShardId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

enum ShardMode {
    Running,
    HandingOff {
        stopper: HandoffStopper,
        reply: Option<tokio::sync::oneshot::Sender<ShardStopped>>,
    },
}

/// Entry supervisor for one shard id.
pub struct Shard<M: Send + Sync + 'static> {
    ctx: Arc<EntryTypeContext<M>>,
    shard_id: ShardId,
    factory: Arc<dyn EntryFactory<M>>,
    region: ActorRef<ShardRegion<M>>,
    persistence_id: String,

    state: ShardEntries,
    last_seq: journal::SequenceNr,
    entries: HashMap<EntryId, ActorRef<EntryActor<M>>>,
    passivating: HashSet<EntryId>,
    buffers: HashMap<EntryId, VecDeque<M>>,
    buffered_total: usize,
    mode: ShardMode,
    self_ref: Option<WeakActorRef<Self>>,
}

impl<M: Send + Sync + 'static> Shard<M> {
    pub(crate) fn new(
        ctx: Arc<EntryTypeContext<M>>,
        shard_id: ShardId,
        factory: Arc<dyn EntryFactory<M>>,
        region: ActorRef<ShardRegion<M>>,
    ) -> Self {
        let persistence_id = format!(
            "/{}/{}Shard/{}",
            ctx.config.guardian_name,
            ctx.type_name.as_str(),
            shard_id.as_str()
        );
        Self {
            ctx,
            shard_id,
            factory,
            region,
            persistence_id,
            state: ShardEntries::default(),
            last_seq: 0,
            entries: HashMap::new(),
            passivating: HashSet::new(),
            buffers: HashMap::new(),
            buffered_total: 0,
            mode: ShardMode::Running,
            self_ref: None,
        }
    }

    fn handing_off(&self) -> bool {
        matches!(self.mode, ShardMode::HandingOff { .. })
    }

    async fn stop_self(&self) {
        if let Some(self_ref) = self.self_ref.as_ref().and_then(WeakActorRef::upgrade) {
            let _ = self_ref.stop_gracefully().await;
        }
    }

    fn create_entry(&mut self, id: &EntryId) -> Option<ActorRef<EntryActor<M>>> {
        let shard_ref = self.self_ref.as_ref().and_then(WeakActorRef::upgrade)?;
        let behavior = self.factory.create(id);
        let entry = kameo::spawn(EntryActor::new(id.clone(), behavior, shard_ref));
        self.entries.insert(id.clone(), entry.clone());
        Some(entry)
    }

    /// Route one extracted payload per the shard delivery rules: park it
    /// if the entry has a buffer, hand it to the live entry otherwise,
    /// and start unknown entries (through the journal when remembering).
    async fn deliver_to(&mut self, id: EntryId, payload: M) {
        if id.is_empty() {
            self.ctx.dead_letters.publish(payload, DropReason::EmptyEntryId);
            return;
        }

        if let Some(buffer) = self.buffers.get_mut(&id) {
            if self.buffered_total >= self.ctx.config.buffer_size {
                warn!(
                    shard = %self.shard_id,
                    entry_id = %id,
                    "Entry buffer full, dropping message"
                );
                self.ctx.dead_letters.publish(payload, DropReason::BufferFull);
            } else {
                buffer.push_back(payload);
                self.buffered_total += 1;
            }
            return;
        }

        if let Some(entry) = self.entries.get(&id) {
            let _ = entry.tell(Deliver(payload)).send().await;
            return;
        }

        if self.ctx.remember_entries {
            let mut buffer = VecDeque::new();
            buffer.push_back(payload);
            self.buffers.insert(id.clone(), buffer);
            self.buffered_total += 1;
            self.persist(EntryEvent::EntryStarted { id }).await;
        } else if let Some(entry) = self.create_entry(&id) {
            let _ = entry.tell(Deliver(payload)).send().await;
        }
    }

    /// Append one entry event, folding it into state on success. On
    /// failure the entry keeps (or gains) a buffer so deliveries stay
    /// parked, and the exact same event is retried after the backoff.
    async fn persist(&mut self, event: EntryEvent) {
        let bytes = match serde_json::to_vec(&event) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(shard = %self.shard_id, error = %e, "Event serialization failed");
                self.persist_failed(event);
                return;
            }
        };
        match self.ctx.journal.append(&self.persistence_id, &bytes).await {
            Ok(seq) => {
                self.last_seq = seq;
                self.apply(event).await;
            }
            Err(e) => {
                warn!(
                    shard = %self.shard_id,
                    error = %e,
                    "Persistence failed, scheduling retry"
                );
                self.persist_failed(event);
            }
        }
    }

    fn persist_failed(&mut self, event: EntryEvent) {
        let id = event.entry_id().clone();
        self.buffers.entry(id).or_default();
        if let Some(self_ref) = self.self_ref.clone() {
            timer::schedule_once(
                self_ref,
                self.ctx.config.shard_failure_backoff,
                RetryPersistence { event },
            );
        }
    }

    async fn apply(&mut self, event: EntryEvent) {
        self.state = self.state.updated(&event);
        match event {
            EntryEvent::EntryStarted { id } => {
                let buffer = self.buffers.remove(&id).unwrap_or_default();
                self.buffered_total -= buffer.len();
                if let Some(entry) = self.create_entry(&id) {
                    for msg in buffer {
                        let _ = entry.tell(Deliver(msg)).send().await;
                    }
                }
            }
            EntryEvent::EntryStopped { id } => {
                self.passivating.remove(&id);
                let buffer = self.buffers.remove(&id).unwrap_or_default();
                self.buffered_total -= buffer.len();
                // Anything that raced in while the stop was persisting is
                // re-routed; the entry will be started fresh for it.
                if let Some(self_ref) = self.self_ref.as_ref().and_then(WeakActorRef::upgrade) {
                    for msg in buffer {
                        let _ = self_ref
                            .tell(BufferedDeliver {
                                id: id.clone(),
                                msg,
                            })
                            .send()
                            .await;
                    }
                }
            }
        }
    }

    async fn save_snapshot(&self) {
        let bytes = match serde_json::to_vec(&self.state) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(shard = %self.shard_id, error = %e, "Snapshot serialization failed");
                return;
            }
        };
        if let Err(e) = self
            .ctx
            .journal
            .save_snapshot(&self.persistence_id, self.last_seq, &bytes)
            .await
        {
            warn!(shard = %self.shard_id, error = %e, "Snapshot save failed");
        }
    }
}

impl<M: Send + Sync + 'static> Actor for Shard<M> {
    type Mailbox = UnboundedMailbox<Self>;

    fn name() -> &'static str {
        "Shard"
    }

    async fn on_start(&mut self, actor_ref: ActorRef<Self>) -> Result<(), BoxError> {
        self.self_ref = Some(actor_ref.downgrade());

        if self.ctx.remember_entries {
            let (state, last_seq) = journal::recover::<ShardEntries, EntryEvent, _>(
                self.ctx.journal.as_ref(),
                &self.persistence_id,
                ShardEntries::default(),
                |state, event| state.updated(&event),
            )
            .await?;
            self.state = state;
            self.last_seq = last_seq;

            let remembered: Vec<EntryId> = self.state.iter().cloned().collect();
            for id in &remembered {
                self.create_entry(id);
            }
            info!(
                shard = %self.shard_id,
                entries = remembered.len(),
                "Shard recovered remembered entries"
            );

            timer::schedule_interval(
                actor_ref.downgrade(),
                self.ctx.config.snapshot_interval,
                || SnapshotTick,
            );
        }
        Ok(())
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        _reason: ActorStopReason,
    ) -> Result<(), BoxError> {
        // Stop without persisting EntryStopped: remembered entries must
        // come back when the shard is next started.
        for (_, entry) in self.entries.drain() {
            let _ = entry.stop_gracefully().await;
        }
        let _ = self
            .region
            .tell(ShardTerminated {
                shard: self.shard_id.clone(),
            })
            .send()
            .await;
        Ok(())
    }
}

impl<M: Send + Sync + 'static> Message<ShardEnvelope<M>> for Shard<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: ShardEnvelope<M>,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        if self.handing_off() {
            self.ctx
                .dead_letters
                .publish(msg.0, DropReason::HandingOff);
            return;
        }
        match self.ctx.extractor.extract(msg.0) {
            Ok((id, payload)) => self.deliver_to(id, payload).await,
            Err(original) => self
                .ctx
                .dead_letters
                .publish(original, DropReason::Unroutable),
        }
    }
}

impl<M: Send + Sync + 'static> Message<BufferedDeliver<M>> for Shard<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: BufferedDeliver<M>,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        if self.handing_off() {
            self.ctx
                .dead_letters
                .publish(msg.msg, DropReason::HandingOff);
            return;
        }
        self.deliver_to(msg.id, msg.msg).await;
    }
}

impl<M: Send + Sync + 'static> Message<Passivate<M>> for Shard<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: Passivate<M>,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        if self.handing_off() {
            debug!(shard = %self.shard_id, entry_id = %msg.id, "Passivate during handoff ignored");
            return;
        }
        if self.buffers.contains_key(&msg.id) {
            debug!(
                shard = %self.shard_id,
                entry_id = %msg.id,
                "Entry already passivating or starting"
            );
            return;
        }
        let Some(entry) = self.entries.get(&msg.id) else {
            debug!(shard = %self.shard_id, entry_id = %msg.id, "Passivate for unknown entry");
            return;
        };
        debug!(shard = %self.shard_id, entry_id = %msg.id, "Passivating entry");
        self.passivating.insert(msg.id.clone());
        self.buffers.insert(msg.id.clone(), VecDeque::new());
        let _ = entry.tell(Deliver(msg.stop_message)).send().await;
    }
}

impl<M: Send + Sync + 'static> Message<EntryTerminated> for Shard<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: EntryTerminated,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        self.entries.remove(&msg.id);

        if let ShardMode::HandingOff { stopper, reply } = &mut self.mode {
            if stopper.entry_terminated(&msg.id) {
                if let Some(reply) = reply.take() {
                    let _ = reply.send(ShardStopped {
                        shard: self.shard_id.clone(),
                    });
                }
                info!(shard = %self.shard_id, "Handoff complete, stopping shard");
                self.stop_self().await;
            }
            return;
        }

        if self.passivating.remove(&msg.id) {
            let buffer = self.buffers.remove(&msg.id).unwrap_or_default();
            self.buffered_total -= buffer.len();
            if buffer.is_empty() {
                if self.ctx.remember_entries {
                    self.persist(EntryEvent::EntryStopped { id: msg.id }).await;
                }
            } else {
                // A message raced in during passivation: the entry never
                // reached the stopped state, restart it and drain.
                debug!(
                    shard = %self.shard_id,
                    entry_id = %msg.id,
                    buffered = buffer.len(),
                    "Messages arrived during passivation, restarting entry"
                );
                if let Some(entry) = self.create_entry(&msg.id) {
                    for payload in buffer {
                        let _ = entry.tell(Deliver(payload)).send().await;
                    }
                }
            }
        } else if self.ctx.remember_entries && self.state.contains(&msg.id) {
            debug!(
                shard = %self.shard_id,
                entry_id = %msg.id,
                "Remembered entry stopped unexpectedly, scheduling restart"
            );
            if let Some(self_ref) = self.self_ref.clone() {
                timer::schedule_once(
                    self_ref,
                    self.ctx.config.entry_restart_backoff,
                    RestartEntry { id: msg.id },
                );
            }
        }
    }
}

impl<M: Send + Sync + 'static> Message<RestartEntry> for Shard<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: RestartEntry,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        if self.handing_off()
            || self.entries.contains_key(&msg.id)
            || self.buffers.contains_key(&msg.id)
        {
            return;
        }
        if self.state.contains(&msg.id) {
            debug!(shard = %self.shard_id, entry_id = %msg.id, "Restarting remembered entry");
            self.create_entry(&msg.id);
        }
    }
}

impl<M: Send + Sync + 'static> Message<RetryPersistence> for Shard<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: RetryPersistence,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        if self.handing_off() {
            debug!(shard = %self.shard_id, "Dropping persistence retry during handoff");
            return;
        }
        self.persist(msg.event).await;
    }
}

impl<M: Send + Sync + 'static> Message<SnapshotTick> for Shard<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        _msg: SnapshotTick,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        if self.ctx.remember_entries && !self.handing_off() {
            self.save_snapshot().await;
        }
    }
}

impl<M: Send + Sync + 'static> Message<HandOff> for Shard<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: HandOff,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        if self.handing_off() {
            warn!(shard = %self.shard_id, "Handoff already in progress");
            return;
        }

        info!(
            shard = %self.shard_id,
            entries = self.entries.len(),
            "Shard handing off"
        );

        // Parked messages can no longer be delivered once ownership is
        // dropped; they fall to at-most-once semantics.
        for (_, buffer) in self.buffers.drain() {
            self.buffered_total -= buffer.len();
            for parked in buffer {
                self.ctx.dead_letters.publish(parked, DropReason::HandingOff);
            }
        }
        self.passivating.clear();

        if self.entries.is_empty() {
            let _ = msg.reply.send(ShardStopped {
                shard: self.shard_id.clone(),
            });
            self.stop_self().await;
        } else {
            let stopper = HandoffStopper::start(self.shard_id.clone(), &self.entries).await;
            self.mode = ShardMode::HandingOff {
                stopper,
                reply: Some(msg.reply),
            };
        }
    }
}
