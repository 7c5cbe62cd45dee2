//! Coordinator Supervisor
//!
//! Singleton manager and restart supervisor in one: runs on every
//! role-matching node, activates the coordinator only while the local
//! node is the oldest such member, and respawns it after a backoff when
//! it stops on a persistence failure. No resume is attempted: once an
//! append fails it is unknown whether the event reached the log, so the
//! only safe path is stop, back off, and recover from the journal.

use super::ShardCoordinator;
use crate::directory::{coordinator_path, PathDirectory};
use crate::journal::Journal;
use crate::membership::{ClusterMembership, MemberEvent};
use crate::timer;
use kameo::request::MessageSend;
use kameo::actor::{ActorID, ActorRef, WeakActorRef};
use kameo::error::{ActorStopReason, BoxError};
use kameo::mailbox::unbounded::UnboundedMailbox;
use kameo::message::{Context, Message};
use kameo::Actor;
use shoal_core::{AllocationStrategy, NodeName, ShardingConfig, TypeName};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Restart budget within a sliding window. A coordinator that keeps
/// dying faster than this is left down until an operator intervenes.
struct RestartTracker {
    max_restarts: u32,
    window: Duration,
    restarts: VecDeque<Instant>,
}

impl RestartTracker {
    fn new(max_restarts: u32, window: Duration) -> Self {
        Self {
            max_restarts,
            window,
            restarts: VecDeque::new(),
        }
    }

    /// Record a restart attempt; false when the budget is exhausted.
    fn record_restart(&mut self) -> bool {
        let now = Instant::now();
        let cutoff = now - self.window;
        while let Some(front) = self.restarts.front() {
            if *front < cutoff {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
        if self.restarts.len() >= self.max_restarts as usize {
            return false;
        }
        self.restarts.push_back(now);
        true
    }
}

/// Notice from a stopping coordinator instance.
pub(crate) struct CoordinatorStopped {
    pub id: ActorID,
}

/// Scheduled restart attempt.
pub(crate) struct RestartCoordinator;

/// Membership change forwarded from the subscription task.
pub(crate) struct MembershipChanged(pub MemberEvent);

/// Hosts the coordinator singleton for one entry type on this node.
pub struct CoordinatorSupervisor<M: Send + Sync + 'static> {
    type_name: TypeName,
    node: NodeName,
    config: Arc<ShardingConfig>,
    strategy: Arc<dyn AllocationStrategy>,
    journal: Arc<dyn Journal>,
    membership: Arc<dyn ClusterMembership>,
    directory: PathDirectory,

    coordinator: Option<ActorRef<ShardCoordinator<M>>>,
    restarts: RestartTracker,
    self_ref: Option<WeakActorRef<Self>>,
}

impl<M: Send + Sync + 'static> CoordinatorSupervisor<M> {
    pub(crate) fn new(
        type_name: TypeName,
        node: NodeName,
        config: Arc<ShardingConfig>,
        strategy: Arc<dyn AllocationStrategy>,
        journal: Arc<dyn Journal>,
        membership: Arc<dyn ClusterMembership>,
        directory: PathDirectory,
    ) -> Self {
        Self {
            type_name,
            node,
            config,
            strategy,
            journal,
            membership,
            directory,
            coordinator: None,
            restarts: RestartTracker::new(10, Duration::from_secs(120)),
            self_ref: None,
        }
    }

    fn is_oldest(&self) -> bool {
        self.membership
            .oldest(self.config.role.as_deref())
            .map(|oldest| oldest.node == self.node)
            .unwrap_or(false)
    }

    /// Converge on the singleton contract: run the coordinator here
    /// exactly while this node is the oldest role-matching member.
    async fn evaluate(&mut self) {
        let should_host = self.is_oldest();
        match (&self.coordinator, should_host) {
            (None, true) => self.start_coordinator().await,
            (Some(_), false) => {
                info!(
                    type_name = %self.type_name,
                    node = %self.node,
                    "No longer oldest node, stopping coordinator"
                );
                self.stop_coordinator().await;
            }
            _ => {}
        }
    }

    async fn start_coordinator(&mut self) {
        let Some(me) = self.self_ref.as_ref().and_then(WeakActorRef::upgrade) else {
            return;
        };
        info!(
            type_name = %self.type_name,
            node = %self.node,
            "Starting coordinator on oldest node"
        );
        let coordinator = kameo::spawn(ShardCoordinator::new(
            self.type_name.clone(),
            self.config.clone(),
            self.strategy.clone(),
            self.journal.clone(),
            self.membership.clone(),
            Some(me),
        ));
        let path = coordinator_path(&self.config.guardian_name, &self.type_name);
        self.directory.publish(&self.node, &path, coordinator.clone());
        self.coordinator = Some(coordinator);
    }

    async fn stop_coordinator(&mut self) {
        let path = coordinator_path(&self.config.guardian_name, &self.type_name);
        self.directory.unpublish(&self.node, &path);
        if let Some(coordinator) = self.coordinator.take() {
            let _ = coordinator.stop_gracefully().await;
        }
    }
}

impl<M: Send + Sync + 'static> Actor for CoordinatorSupervisor<M> {
    type Mailbox = UnboundedMailbox<Self>;

    fn name() -> &'static str {
        "CoordinatorSupervisor"
    }

    async fn on_start(&mut self, actor_ref: ActorRef<Self>) -> Result<(), BoxError> {
        self.self_ref = Some(actor_ref.downgrade());

        let mut events = self.membership.subscribe();
        let weak = actor_ref.downgrade();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(supervisor) = weak.upgrade() else { break };
                        if supervisor
                            .tell(MembershipChanged(event))
                            .send()
                            .await
                            .is_err()
                        {
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

        self.evaluate().await;
        Ok(())
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        _reason: ActorStopReason,
    ) -> Result<(), BoxError> {
        self.stop_coordinator().await;
        Ok(())
    }
}

impl<M: Send + Sync + 'static> Message<CoordinatorStopped> for CoordinatorSupervisor<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: CoordinatorStopped,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        // Stale notice from an instance we already replaced or retired.
        let current = self.coordinator.as_ref().map(|c| c.id());
        if current != Some(msg.id) {
            return;
        }

        let path = coordinator_path(&self.config.guardian_name, &self.type_name);
        self.directory.unpublish(&self.node, &path);
        self.coordinator = None;

        if !self.is_oldest() {
            return;
        }
        if self.restarts.record_restart() {
            warn!(
                type_name = %self.type_name,
                backoff = ?self.config.coordinator_failure_backoff,
                "Coordinator stopped, restarting after backoff"
            );
            if let Some(weak) = self.self_ref.clone() {
                timer::schedule_once(
                    weak,
                    self.config.coordinator_failure_backoff,
                    RestartCoordinator,
                );
            }
        } else {
            error!(
                type_name = %self.type_name,
                "Coordinator restart budget exhausted, giving up"
            );
        }
    }
}

impl<M: Send + Sync + 'static> Message<RestartCoordinator> for CoordinatorSupervisor<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        _msg: RestartCoordinator,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        self.evaluate().await;
    }
}

impl<M: Send + Sync + 'static> Message<MembershipChanged> for CoordinatorSupervisor<M> {
    type Reply = ();

    async fn handle(
        &mut self,
        _msg: MembershipChanged,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        self.evaluate().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_budget() {
        let mut tracker = RestartTracker::new(3, Duration::from_secs(10));
        assert!(tracker.record_restart());
        assert!(tracker.record_restart());
        assert!(tracker.record_restart());
        assert!(!tracker.record_restart());
    }

    #[test]
    fn test_restart_window_expiry() {
        let mut tracker = RestartTracker::new(1, Duration::from_millis(10));
        assert!(tracker.record_restart());
        assert!(!tracker.record_restart());
        std::thread::sleep(Duration::from_millis(20));
        assert!(tracker.record_restart());
    }
}
