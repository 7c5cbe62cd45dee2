//! Sharding Identifiers
//!
//! Opaque string newtypes used throughout the sharding protocol. All of
//! them are cheap to clone and hash; validity (non-emptiness) is checked
//! at the routing boundary, not at construction, so extractors can return
//! whatever the application produced and let the router dead-letter the
//! bad ones.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a shard, the unit of relocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

/// Identifier of a single entry within a shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

/// Logical name of an entry type, e.g. `"counter"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeName(String);

/// Name of a cluster node as known to the membership service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeName(String);

/// Stable address of a shard region, safe to persist in domain events.
///
/// Formatted as `{node}/{guardian}/{type_name}`. The coordinator keeps a
/// separate runtime map from key to live actor ref, refreshed on every
/// registration, so persisted state never holds owning references.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionKey(String);

macro_rules! string_id {
    ($ty:ident) => {
        impl $ty {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $ty {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $ty {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(ShardId);
string_id!(EntryId);
string_id!(TypeName);
string_id!(NodeName);
string_id!(RegionKey);

impl RegionKey {
    /// Build the region key for an entry type hosted on a node.
    pub fn of(node: &NodeName, guardian: &str, type_name: &TypeName) -> Self {
        Self(format!("{}/{}/{}", node.as_str(), guardian, type_name.as_str()))
    }

    /// The node segment of the key. The coordinator uses this to purge
    /// regions whose node left the cluster.
    pub fn node_name(&self) -> NodeName {
        NodeName::from(self.0.split('/').next().unwrap_or(""))
    }

    /// Build the key for a proxy-only region on a node.
    pub fn proxy_of(node: &NodeName, guardian: &str, type_name: &TypeName) -> Self {
        Self(format!(
            "{}/{}/{}Proxy",
            node.as_str(),
            guardian,
            type_name.as_str()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_key_format() {
        let key = RegionKey::of(
            &NodeName::from("node-1"),
            "sharding",
            &TypeName::from("counter"),
        );
        assert_eq!(key.as_str(), "node-1/sharding/counter");

        let proxy = RegionKey::proxy_of(
            &NodeName::from("node-1"),
            "sharding",
            &TypeName::from("counter"),
        );
        assert_eq!(proxy.as_str(), "node-1/sharding/counterProxy");
    }

    #[test]
    fn test_empty_detection() {
        assert!(EntryId::from("").is_empty());
        assert!(!EntryId::from("e1").is_empty());
    }

    #[test]
    fn test_serde_transparent() {
        let shard = ShardId::from("A");
        let json = serde_json::to_string(&shard).unwrap();
        assert_eq!(json, "\"A\"");
        let back: ShardId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, shard);
    }
}
