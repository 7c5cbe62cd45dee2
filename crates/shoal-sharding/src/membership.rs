//! Cluster Membership
//!
//! The membership collaborator: a snapshot of up-members, a stream of
//! member events, role queries and the age ordering that elects the
//! coordinator node. [`LocalCluster`] is the in-process implementation
//! used by tests and embedded deployments; nodes join and leave
//! programmatically.

use shoal_core::NodeName;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// A cluster member that has reached the up state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub node: NodeName,
    pub roles: HashSet<String>,
    /// Monotonic join ordinal; lower means older. Drives coordinator
    /// election: the oldest role-matching member hosts the singleton.
    pub up_number: u64,
}

impl Member {
    /// Whether this member satisfies a role requirement. `None` matches
    /// every member.
    pub fn has_role(&self, role: Option<&str>) -> bool {
        match role {
            Some(role) => self.roles.contains(role),
            None => true,
        }
    }

    pub fn is_older_than(&self, other: &Member) -> bool {
        self.up_number < other.up_number
    }
}

/// Membership change notifications.
#[derive(Debug, Clone)]
pub enum MemberEvent {
    MemberUp(Member),
    MemberRemoved(Member),
}

/// Read access to cluster membership plus an event stream.
pub trait ClusterMembership: Send + Sync + 'static {
    /// Snapshot of current up-members, unordered.
    fn members(&self) -> Vec<Member>;

    /// Subscribe to membership changes. Events published before the
    /// subscription are not replayed; callers combine this with a
    /// `members()` snapshot.
    fn subscribe(&self) -> broadcast::Receiver<MemberEvent>;

    /// The oldest up-member satisfying `role`, if any.
    fn oldest(&self, role: Option<&str>) -> Option<Member> {
        self.members()
            .into_iter()
            .filter(|m| m.has_role(role))
            .min_by_key(|m| m.up_number)
    }
}

struct ClusterInner {
    members: HashMap<NodeName, Member>,
    next_up_number: u64,
}

/// In-process membership service.
#[derive(Clone)]
pub struct LocalCluster {
    inner: Arc<Mutex<ClusterInner>>,
    events: broadcast::Sender<MemberEvent>,
}

impl Default for LocalCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalCluster {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Mutex::new(ClusterInner {
                members: HashMap::new(),
                next_up_number: 1,
            })),
            events,
        }
    }

    /// Bring a node up. Joining twice keeps the original age.
    pub fn member_up(&self, node: NodeName, roles: impl IntoIterator<Item = String>) -> Member {
        let mut inner = self.inner.lock().expect("membership lock poisoned");
        if let Some(existing) = inner.members.get(&node) {
            return existing.clone();
        }
        let member = Member {
            node: node.clone(),
            roles: roles.into_iter().collect(),
            up_number: inner.next_up_number,
        };
        inner.next_up_number += 1;
        inner.members.insert(node, member.clone());
        drop(inner);

        let _ = self.events.send(MemberEvent::MemberUp(member.clone()));
        member
    }

    /// Remove a node from the cluster.
    pub fn member_removed(&self, node: &NodeName) {
        let removed = {
            let mut inner = self.inner.lock().expect("membership lock poisoned");
            inner.members.remove(node)
        };
        if let Some(member) = removed {
            let _ = self.events.send(MemberEvent::MemberRemoved(member));
        }
    }
}

impl ClusterMembership for LocalCluster {
    fn members(&self) -> Vec<Member> {
        self.inner
            .lock()
            .expect("membership lock poisoned")
            .members
            .values()
            .cloned()
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<MemberEvent> {
        self.events.subscribe()
    }
}
