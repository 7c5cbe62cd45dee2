//! Sharding Guardian
//!
//! Per-node registry of entry types. `start` wires up the local region
//! (and, on role-matching nodes, the coordinator singleton supervisor)
//! for a type and hands back the region endpoint; calling it again for
//! the same type returns the existing endpoint. The registry is shared
//! freely across tasks; entry types can be started from any context
//! inside the runtime.

use crate::coordinator::supervisor::CoordinatorSupervisor;
use crate::dead_letter::{DeadLetterSink, LogDeadLetters};
use crate::directory::PathDirectory;
use crate::entry::{EntryFactory, EntryIdExtractor, ShardResolver};
use crate::journal::Journal;
use crate::membership::ClusterMembership;
use crate::region::{EntryTypeContext, ShardRegion};
use futures::future::BoxFuture;
use kameo::actor::ActorRef;
use kameo::Actor;
use shoal_core::{
    AllocationStrategy, LeastShardAllocation, NodeName, RegionKey, ShardingConfig, TypeName,
};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Everything needed to start one entry type.
pub struct EntryTypeSettings<M: Send + Sync + 'static> {
    pub type_name: TypeName,
    /// Entry construction; `None` makes this node a proxy for the type.
    pub factory: Option<Arc<dyn EntryFactory<M>>>,
    pub extractor: Arc<dyn EntryIdExtractor<M>>,
    pub resolver: Arc<dyn ShardResolver<M>>,
    /// Persist entry membership so restarts recreate entries.
    pub remember_entries: bool,
    /// Defaults to least-shard allocation tuned from the config.
    pub strategy: Option<Arc<dyn AllocationStrategy>>,
    pub dead_letters: Option<Arc<dyn DeadLetterSink<M>>>,
}

impl<M: Send + Sync + 'static> EntryTypeSettings<M> {
    pub fn new(
        type_name: impl Into<TypeName>,
        extractor: impl EntryIdExtractor<M>,
        resolver: impl ShardResolver<M>,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            factory: None,
            extractor: Arc::new(extractor),
            resolver: Arc::new(resolver),
            remember_entries: false,
            strategy: None,
            dead_letters: None,
        }
    }

    pub fn with_factory(mut self, factory: impl EntryFactory<M>) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    pub fn with_remember_entries(mut self, remember: bool) -> Self {
        self.remember_entries = remember;
        self
    }

    pub fn with_strategy(mut self, strategy: impl AllocationStrategy) -> Self {
        self.strategy = Some(Arc::new(strategy));
        self
    }

    pub fn with_dead_letters(mut self, sink: impl DeadLetterSink<M>) -> Self {
        self.dead_letters = Some(Arc::new(sink));
        self
    }
}

/// Failures starting an entry type.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("entry type {0} already started with a different message type")]
    TypeMismatch(TypeName),
}

struct StartedType {
    region: Box<dyn Any + Send + Sync>,
    stop: Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>,
}

/// Per-node entry point to the sharding layer.
pub struct ClusterSharding {
    node: NodeName,
    config: Arc<ShardingConfig>,
    membership: Arc<dyn ClusterMembership>,
    journal: Arc<dyn Journal>,
    directory: PathDirectory,
    started: Mutex<HashMap<TypeName, StartedType>>,
}

impl ClusterSharding {
    pub fn new(
        node: impl Into<NodeName>,
        config: ShardingConfig,
        membership: Arc<dyn ClusterMembership>,
        journal: Arc<dyn Journal>,
        directory: PathDirectory,
    ) -> Self {
        Self {
            node: node.into(),
            config: Arc::new(config),
            membership,
            journal,
            directory,
            started: Mutex::new(HashMap::new()),
        }
    }

    pub fn node(&self) -> &NodeName {
        &self.node
    }

    /// Register an entry type and return its region endpoint. Idempotent
    /// per type name. Hosting (entries and the coordinator singleton) is
    /// gated on the configured role; a region without a factory or on a
    /// non-matching node becomes proxy-only.
    pub fn start<M: Send + Sync + 'static>(
        &self,
        settings: EntryTypeSettings<M>,
    ) -> Result<ActorRef<ShardRegion<M>>, StartError> {
        let mut started = self.started.lock().expect("guardian lock poisoned");

        if let Some(existing) = started.get(&settings.type_name) {
            return existing
                .region
                .downcast_ref::<ActorRef<ShardRegion<M>>>()
                .cloned()
                .ok_or_else(|| StartError::TypeMismatch(settings.type_name.clone()));
        }

        let role = self.config.role.as_deref();
        let role_matched = self
            .membership
            .members()
            .iter()
            .find(|m| m.node == self.node)
            .map(|m| m.has_role(role))
            .unwrap_or(false);
        let hosts_entries = role_matched && settings.factory.is_some();

        let strategy = settings
            .strategy
            .unwrap_or_else(|| Arc::new(LeastShardAllocation::new(self.config.least_shard.clone())));
        let dead_letters = settings
            .dead_letters
            .unwrap_or_else(|| Arc::new(LogDeadLetters::new()));

        // The singleton supervisor runs wherever the coordinator may be
        // hosted; it stays passive until this node is the oldest.
        let supervisor = if role_matched {
            Some(kameo::spawn(CoordinatorSupervisor::<M>::new(
                settings.type_name.clone(),
                self.node.clone(),
                self.config.clone(),
                strategy,
                self.journal.clone(),
                self.membership.clone(),
                self.directory.clone(),
            )))
        } else {
            None
        };

        let key = if hosts_entries {
            RegionKey::of(&self.node, &self.config.guardian_name, &settings.type_name)
        } else {
            RegionKey::proxy_of(&self.node, &self.config.guardian_name, &settings.type_name)
        };

        let ctx = Arc::new(EntryTypeContext {
            type_name: settings.type_name.clone(),
            config: self.config.clone(),
            remember_entries: settings.remember_entries,
            factory: if hosts_entries { settings.factory } else { None },
            extractor: settings.extractor,
            resolver: settings.resolver,
            journal: self.journal.clone(),
            dead_letters,
        });
        let region = kameo::spawn(ShardRegion::new(
            ctx,
            key.clone(),
            !hosts_entries,
            self.membership.clone(),
            self.directory.clone(),
        ));

        info!(
            node = %self.node,
            type_name = %settings.type_name,
            region = %key,
            proxy_only = !hosts_entries,
            "Entry type started"
        );

        let stop = {
            let region = region.clone();
            let supervisor = supervisor.clone();
            Box::new(move || -> BoxFuture<'static, ()> {
                let region = region.clone();
                let supervisor = supervisor.clone();
                Box::pin(async move {
                    let _ = region.stop_gracefully().await;
                    if let Some(supervisor) = supervisor {
                        let _ = supervisor.stop_gracefully().await;
                    }
                })
            })
        };
        started.insert(
            settings.type_name,
            StartedType {
                region: Box::new(region.clone()),
                stop,
            },
        );
        Ok(region)
    }

    /// Region endpoint for a previously started type.
    pub fn region<M: Send + Sync + 'static>(
        &self,
        type_name: &TypeName,
    ) -> Option<ActorRef<ShardRegion<M>>> {
        self.started
            .lock()
            .expect("guardian lock poisoned")
            .get(type_name)
            .and_then(|s| s.region.downcast_ref::<ActorRef<ShardRegion<M>>>())
            .cloned()
    }

    /// Stop every region and supervisor started through this guardian.
    pub async fn shutdown(&self) {
        let stops: Vec<_> = {
            let mut started = self.started.lock().expect("guardian lock poisoned");
            started.drain().map(|(_, s)| s.stop).collect()
        };
        for stop in stops {
            stop().await;
        }
        info!(node = %self.node, "Sharding guardian shut down");
    }
}
