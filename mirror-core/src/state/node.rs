//! State-tree nodes.
//!
//! A node owns one slice of a client's application data plus the dirty
//! bookkeeping for it. Nodes live in the arena owned by
//! [`StateTree`](super::StateTree); tree edges are [`NodeId`]s, never a
//! second owner.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::schema::NodeSchema;
use crate::value::Value;

/// Identifier of a node within one [`StateTree`](super::StateTree) arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u64);

impl NodeId {
    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// One node of a client's state tree.
#[derive(Clone)]
pub struct StateNode {
    /// Name unique among siblings.
    pub(crate) name: String,

    /// Fully-qualified dotted path from the root, e.g. `app.child.leaf`.
    pub(crate) full_name: String,

    /// Non-owning back-reference; `None` for the root.
    pub(crate) parent: Option<NodeId>,

    /// Substates, exclusively owned through the arena.
    pub(crate) children: IndexMap<String, NodeId>,

    /// The immutable schema this node was instantiated from.
    pub(crate) schema: Arc<NodeSchema>,

    /// Stored (client-visible) field values.
    pub(crate) values: IndexMap<String, Value>,

    /// Per-instance backend field values, never serialized to the client.
    pub(crate) backend: IndexMap<String, Value>,

    /// Request metadata, kept consistent across the whole tree for a client.
    pub(crate) router_context: IndexMap<String, Value>,

    /// Fields changed since the last delta.
    pub(crate) dirty_fields: HashSet<String>,

    /// Names of children with changes since the last delta.
    pub(crate) dirty_children: HashSet<String>,
}

impl StateNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.children.iter().map(|(name, id)| (name.as_str(), *id))
    }

    pub fn schema(&self) -> &Arc<NodeSchema> {
        &self.schema
    }

    /// Raw stored value, if set. Does not evaluate computed fields or
    /// delegate to ancestors.
    pub fn stored(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// Raw backend value, if set.
    pub fn backend_value(&self, field: &str) -> Option<&Value> {
        self.backend.get(field)
    }

    pub fn dirty_fields(&self) -> &HashSet<String> {
        &self.dirty_fields
    }

    pub fn dirty_children(&self) -> &HashSet<String> {
        &self.dirty_children
    }

    pub fn router_context(&self) -> &IndexMap<String, Value> {
        &self.router_context
    }
}
