//! Node alias cache.
//!
//! Segments reference nodes by a compact 32-bit alias. The mapping only ever
//! grows, so a cached snapshot stays valid until a miss; on a miss the
//! caller refreshes from the adapter.

use std::collections::HashMap;
use std::sync::Mutex;

use galaxy_core::NodeId;

use crate::types::{NodeAlias, NodeAliasEntry};

/// Bidirectional snapshot of the alias table.
#[derive(Debug, Default, Clone)]
pub struct NodeAliasMap {
    node_to_alias: HashMap<NodeId, NodeAlias>,
    alias_to_node: HashMap<NodeAlias, NodeId>,
}

impl NodeAliasMap {
    pub fn new(entries: &[NodeAliasEntry]) -> Self {
        let mut map = NodeAliasMap::default();
        for entry in entries {
            map.node_to_alias.insert(entry.id, entry.alias);
            map.alias_to_node.insert(entry.alias, entry.id);
        }
        map
    }

    pub fn alias(&self, node: &NodeId) -> Option<NodeAlias> {
        self.node_to_alias.get(node).copied()
    }

    pub fn node(&self, alias: NodeAlias) -> Option<NodeId> {
        self.alias_to_node.get(&alias).copied()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.node_to_alias.contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.node_to_alias.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_to_alias.is_empty()
    }
}

/// Shared cache of the latest alias snapshot.
#[derive(Default)]
pub struct AliasCache {
    latest: Mutex<Option<NodeAliasMap>>,
}

impl AliasCache {
    pub fn get(&self) -> Option<NodeAliasMap> {
        self.latest.lock().unwrap().clone()
    }

    pub fn set(&self, map: NodeAliasMap) {
        *self.latest.lock().unwrap() = Some(map);
    }

    pub fn reset(&self) {
        *self.latest.lock().unwrap() = None;
    }
}
