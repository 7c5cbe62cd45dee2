//! Entry Hosting
//!
//! The application-facing seam of the sharding layer. Applications
//! implement [`EntryBehavior`] for their stateful workers and hand the
//! router an [`EntryIdExtractor`] and [`ShardResolver`] describing how
//! their messages are addressed. Each live entry runs inside an
//! [`EntryActor`], a thin wrapper that feeds the behavior and relays
//! passivation requests and termination notices to the owning shard.

use crate::shard::messages::{EntryTerminated, Passivate};
use crate::shard::Shard;
use async_trait::async_trait;
use kameo::request::MessageSend;
use kameo::actor::{ActorRef, WeakActorRef};
use kameo::error::{ActorStopReason, BoxError};
use kameo::mailbox::unbounded::UnboundedMailbox;
use kameo::message::{Context, Message};
use kameo::Actor;
use shoal_core::{EntryId, ShardId};
use tracing::{debug, trace};

/// What an entry wants to happen after handling a message.
pub enum EntryAction<M> {
    /// Keep running.
    Continue,
    /// Ask the shard to passivate this entry. The stop message is routed
    /// back through the shard so racing deliveries are buffered, then
    /// delivered to this entry as its final message.
    Passivate(M),
    /// Stop immediately without draining.
    Stop,
}

/// Application-defined entry logic, one instance per live entry id.
#[async_trait]
pub trait EntryBehavior<M: Send + Sync + 'static>: Send + Sync + 'static {
    async fn receive(&mut self, msg: M) -> EntryAction<M>;
}

/// Produces a fresh behavior for an entry id. Regions without a factory
/// are proxy-only: they route but never host.
pub trait EntryFactory<M: Send + Sync + 'static>: Send + Sync + 'static {
    fn create(&self, id: &EntryId) -> Box<dyn EntryBehavior<M>>;
}

impl<M, F> EntryFactory<M> for F
where
    M: Send + Sync + 'static,
    F: Fn(&EntryId) -> Box<dyn EntryBehavior<M>> + Send + Sync + 'static,
{
    fn create(&self, id: &EntryId) -> Box<dyn EntryBehavior<M>> {
        self(id)
    }
}

/// Splits an envelope into entry id and payload. Partial: messages the
/// application does not route through sharding come back as `Err` and go
/// to dead letters.
pub trait EntryIdExtractor<M: Send + Sync + 'static>: Send + Sync + 'static {
    fn extract(&self, msg: M) -> Result<(EntryId, M), M>;
}

impl<M, F> EntryIdExtractor<M> for F
where
    M: Send + Sync + 'static,
    F: Fn(M) -> Result<(EntryId, M), M> + Send + Sync + 'static,
{
    fn extract(&self, msg: M) -> Result<(EntryId, M), M> {
        self(msg)
    }
}

/// Maps a message to the shard that owns it. Only consulted after the
/// extractor recognized the message.
pub trait ShardResolver<M: Send + Sync + 'static>: Send + Sync + 'static {
    fn shard_id(&self, msg: &M) -> ShardId;
}

impl<M, F> ShardResolver<M> for F
where
    M: Send + Sync + 'static,
    F: Fn(&M) -> ShardId + Send + Sync + 'static,
{
    fn shard_id(&self, msg: &M) -> ShardId {
        self(msg)
    }
}

/// Payload delivery to a single entry.
pub(crate) struct Deliver<M>(pub M);

/// Wrapper actor hosting one application entry.
pub(crate) struct EntryActor<M: Send + Sync + 'static> {
    entry_id: EntryId,
    behavior: Box<dyn EntryBehavior<M>>,
    shard: ActorRef<Shard<M>>,
    self_ref: Option<WeakActorRef<Self>>,
}

impl<M: Send + Sync + 'static> EntryActor<M> {
    pub(crate) fn new(
        entry_id: EntryId,
        behavior: Box<dyn EntryBehavior<M>>,
        shard: ActorRef<Shard<M>>,
    ) -> Self {
        Self {
            entry_id,
            behavior,
            shard,
            self_ref: None,
        }
    }

    async fn stop_self(&self) {
        if let Some(self_ref) = self.self_ref.as_ref().and_then(WeakActorRef::upgrade) {
            let _ = self_ref.stop_gracefully().await;
        }
    }
}

impl<M: Send + Sync + 'static> Actor for EntryActor<M> {
    type Mailbox = UnboundedMailbox<Self>;

    fn name() -> &'static str {
        "EntryActor"
    }

    async fn on_start(&mut self, actor_ref: ActorRef<Self>) -> Result<(), BoxError> {
        self.self_ref = Some(actor_ref.downgrade());
        trace!(entry_id = %self.entry_id, "Entry started");
        Ok(())
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        _reason: ActorStopReason,
    ) -> Result<(), BoxError> {
        trace!(entry_id = %self.entry_id, "Entry stopped");
        // The shard distinguishes passivation, handoff and unexpected
        // stops from its own bookkeeping; we only report the fact.
        let _ = self
            .shard
            .tell(EntryTerminated {
                id: self.entry_id.clone(),
            })
            .send()
            .await;
        Ok(())
    }
}

impl<M: Send + Sync + 'static> Message<Deliver<M>> for EntryActor<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: Deliver<M>,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        match self.behavior.receive(msg.0).await {
            EntryAction::Continue => {}
            EntryAction::Passivate(stop_message) => {
                debug!(entry_id = %self.entry_id, "Entry requested passivation");
                let _ = self
                    .shard
                    .tell(Passivate {
                        id: self.entry_id.clone(),
                        stop_message,
                    })
                    .send()
                    .await;
            }
            EntryAction::Stop => {
                self.stop_self().await;
            }
        }
    }
}
