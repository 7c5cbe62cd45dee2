//! Logical Path Directory
//!
//! Process-wide selection of actors by `(node, path)`, standing in for a
//! location-transparent transport lookup. The coordinator singleton
//! publishes itself here; regions select it at the path derived from the
//! oldest role-matching member.

use kameo::actor::ActorRef;
use kameo::Actor;
use shoal_core::{NodeName, TypeName};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Canonical path of the coordinator for an entry type, relative to a
/// node. Also used (without the node) as the coordinator's persistence
/// id, so there is exactly one event stream per entry type.
pub fn coordinator_path(guardian_name: &str, type_name: &TypeName) -> String {
    format!("/{}/{}Coordinator", guardian_name, type_name.as_str())
}

type Entries = HashMap<(NodeName, String), Box<dyn Any + Send + Sync>>;

/// Concurrent directory of published actor endpoints.
#[derive(Clone, Default)]
pub struct PathDirectory {
    entries: Arc<RwLock<Entries>>,
}

impl PathDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an actor at a node-scoped path, replacing any previous
    /// occupant.
    pub fn publish<A: Actor>(&self, node: &NodeName, path: &str, actor: ActorRef<A>) {
        self.entries
            .write()
            .expect("directory lock poisoned")
            .insert((node.clone(), path.to_string()), Box::new(actor));
    }

    /// Remove a published endpoint.
    pub fn unpublish(&self, node: &NodeName, path: &str) {
        self.entries
            .write()
            .expect("directory lock poisoned")
            .remove(&(node.clone(), path.to_string()));
    }

    /// Select the actor published at a path, if its type matches.
    pub fn select<A: Actor>(&self, node: &NodeName, path: &str) -> Option<ActorRef<A>> {
        self.entries
            .read()
            .expect("directory lock poisoned")
            .get(&(node.clone(), path.to_string()))
            .and_then(|entry| entry.downcast_ref::<ActorRef<A>>())
            .cloned()
    }
}
