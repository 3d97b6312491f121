//! The state-tree arena: field access, dirty propagation, and deltas.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::trace;

use crate::error::{Error, Result, ValidationError};
use crate::schema::{FieldKind, NodeSchema, Schema};
use crate::serialize::{to_client_json, SerializerRegistry};
use crate::value::{Value, ValueProxy};

use super::node::{NodeId, StateNode};
use super::{route, Delta, ROUTER_DATA};

/// How a field name resolves on a node.
enum FieldClass {
    Stored,
    Backend,
    Computed,
}

/// One client's state tree.
///
/// The tree owns every node in an arena keyed by [`NodeId`]; parent links are
/// ids, so there is exactly one owner per node. All mutation goes through
/// [`set`](StateTree::set) or a [`ValueProxy`] from
/// [`get_mut`](StateTree::get_mut), which is what keeps the dirty sets
/// truthful.
#[derive(Clone)]
pub struct StateTree {
    schema: Arc<Schema>,
    serializers: Arc<SerializerRegistry>,
    nodes: HashMap<NodeId, StateNode>,
    root: NodeId,
    next_id: u64,
    /// Computed values memoized within a single delta pass (cache=true only),
    /// so dependency chains observe a consistent value.
    pass_memo: HashMap<(NodeId, String), Value>,
    in_delta_pass: bool,
}

impl StateTree {
    /// Instantiate a default-valued tree from a compiled schema. Every node
    /// gets a fresh deep copy of its backend defaults, so two trees never
    /// share backend values.
    pub fn new(schema: Arc<Schema>, serializers: Arc<SerializerRegistry>) -> Self {
        let mut tree = Self {
            schema: schema.clone(),
            serializers,
            nodes: HashMap::new(),
            root: NodeId(0),
            next_id: 0,
            pass_memo: HashMap::new(),
            in_delta_pass: false,
        };
        tree.root = tree.instantiate(schema.root().clone(), None, None);
        tree
    }

    fn instantiate(
        &mut self,
        schema: Arc<NodeSchema>,
        parent: Option<NodeId>,
        parent_path: Option<&str>,
    ) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;

        let full_name = match parent_path {
            Some(prefix) => format!("{prefix}.{}", schema.name()),
            None => schema.name().to_string(),
        };

        let mut values = IndexMap::new();
        let mut backend = IndexMap::new();
        for def in schema.fields() {
            match def.kind() {
                FieldKind::Stored { default } => {
                    values.insert(def.name().to_string(), default.clone());
                }
                FieldKind::BackendOnly { default } => {
                    backend.insert(def.name().to_string(), default.clone());
                }
                FieldKind::Computed { .. } => {}
            }
        }

        self.nodes.insert(
            id,
            StateNode {
                name: schema.name().to_string(),
                full_name: full_name.clone(),
                parent,
                children: IndexMap::new(),
                schema: schema.clone(),
                values,
                backend,
                router_context: IndexMap::new(),
                dirty_fields: HashSet::new(),
                dirty_children: HashSet::new(),
            },
        );

        let child_schemas: Vec<Arc<NodeSchema>> = schema.children().cloned().collect();
        for child_schema in child_schemas {
            let child_id = self.instantiate(child_schema.clone(), Some(id), Some(&full_name));
            self.node_mut(id)
                .children
                .insert(child_schema.name().to_string(), child_id);
        }
        id
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn serializers(&self) -> &Arc<SerializerRegistry> {
        &self.serializers
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Borrow a node. Panics on a foreign id; ids never escape the tree that
    /// minted them.
    pub fn node(&self, id: NodeId) -> &StateNode {
        self.nodes.get(&id).expect("node id belongs to this tree")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut StateNode {
        self.nodes.get_mut(&id).expect("node id belongs to this tree")
    }

    pub fn nodes(&self) -> impl Iterator<Item = &StateNode> {
        self.nodes.values()
    }

    /// Resolve a dotted path to a node. The leading segment may name the
    /// root itself; an empty path resolves to the root.
    pub fn resolve_path(&self, path: &str) -> Result<NodeId> {
        let mut segments = path.split('.').filter(|s| !s.is_empty());
        let mut current = self.root;
        if let Some(first) = segments.next() {
            if first != self.node(current).name {
                current = self
                    .node(current)
                    .children
                    .get(first)
                    .copied()
                    .ok_or_else(|| Error::UnknownPath(path.to_string()))?;
            }
        }
        for segment in segments {
            current = self
                .node(current)
                .children
                .get(segment)
                .copied()
                .ok_or_else(|| Error::UnknownPath(path.to_string()))?;
        }
        Ok(current)
    }

    /// The nearest node, starting at `id` and walking up, whose schema
    /// declares `field`.
    pub(crate) fn find_owner(&self, id: NodeId, field: &str) -> Option<NodeId> {
        let node = self.node(id);
        if node.schema.field(field).is_some() {
            return Some(id);
        }
        node.parent.and_then(|p| self.find_owner(p, field))
    }

    fn classify(&self, id: NodeId, field: &str) -> Option<FieldClass> {
        self.node(id).schema.field(field).map(|def| match def.kind() {
            FieldKind::Stored { .. } => FieldClass::Stored,
            FieldKind::BackendOnly { .. } => FieldClass::Backend,
            FieldKind::Computed { .. } => FieldClass::Computed,
        })
    }

    fn unknown_field(&self, id: NodeId, field: &str) -> Error {
        Error::UnknownField {
            state: self.node(id).name.clone(),
            field: field.to_string(),
        }
    }

    // ------------------------------------------------------------------
    // Field access
    // ------------------------------------------------------------------

    /// Read a field value. Inherited fields delegate to the nearest owning
    /// ancestor; computed fields evaluate on demand.
    pub fn get(&mut self, id: NodeId, field: &str) -> Result<Value> {
        let Some(class) = self.classify(id, field) else {
            let owner = self
                .node(id)
                .parent
                .and_then(|p| self.find_owner(p, field))
                .ok_or_else(|| self.unknown_field(id, field))?;
            return self.get(owner, field);
        };
        match class {
            FieldClass::Stored => Ok(self
                .node(id)
                .values
                .get(field)
                .cloned()
                .unwrap_or(Value::Null)),
            FieldClass::Backend => Ok(self
                .node(id)
                .backend
                .get(field)
                .cloned()
                .unwrap_or(Value::Null)),
            FieldClass::Computed => self.eval_computed(id, field),
        }
    }

    /// Mutate a stored or backend container field in place through a
    /// dirty-tracking proxy. Inherited fields bind the proxy to the owning
    /// ancestor, so nested mutations dirty the right node.
    pub fn get_mut(&mut self, id: NodeId, field: &str) -> Result<ValueProxy<'_>> {
        let owner = self
            .find_owner(id, field)
            .ok_or_else(|| self.unknown_field(id, field))?;
        match self.classify(owner, field) {
            Some(FieldClass::Stored) | Some(FieldClass::Backend) => {
                Ok(ValueProxy::new(self, owner, field))
            }
            Some(FieldClass::Computed) => Err(ValidationError::WrongKind {
                expected: "stored or backend field",
                found: "computed field",
            }
            .into()),
            None => Err(self.unknown_field(id, field)),
        }
    }

    /// Write a field value. Inherited fields delegate the write to the
    /// owning ancestor; writes to [`ROUTER_DATA`] overwrite the router
    /// context on every descendant.
    pub fn set(&mut self, id: NodeId, field: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        if field == ROUTER_DATA {
            let Value::Map(ctx) = value else {
                return Err(ValidationError::WrongKind {
                    expected: "map",
                    found: value.kind_str(),
                }
                .into());
            };
            self.set_router_context(id, ctx);
            return Ok(());
        }

        let Some(class) = self.classify(id, field) else {
            let owner = self
                .node(id)
                .parent
                .and_then(|p| self.find_owner(p, field))
                .ok_or_else(|| self.unknown_field(id, field))?;
            return self.set(owner, field, value);
        };

        match class {
            FieldClass::Computed => Err(ValidationError::AssignToComputed {
                field: field.to_string(),
            }
            .into()),
            FieldClass::Backend => {
                self.node_mut(id).backend.insert(field.to_string(), value);
                self.mark_field_dirty(id, field);
                Ok(())
            }
            FieldClass::Stored => {
                self.node_mut(id).values.insert(field.to_string(), value);
                self.mark_field_dirty(id, field);
                Ok(())
            }
        }
    }

    /// Add `field` to the node's dirty set and run propagation. Used by
    /// [`set`](StateTree::set) and by [`ValueProxy`] before each in-place
    /// mutation.
    pub(crate) fn mark_field_dirty(&mut self, id: NodeId, field: &str) {
        self.node_mut(id).dirty_fields.insert(field.to_string());
        self.mark_dirty(id);
    }

    /// Direct access to a field's backing slot, looking in the stored map
    /// first and the backend map second. Dirty tracking is the caller's job.
    pub(crate) fn raw_field_mut(&mut self, id: NodeId, field: &str) -> Result<&mut Value> {
        let node = self.nodes.get_mut(&id).expect("node id belongs to this tree");
        if node.values.contains_key(field) {
            Ok(&mut node.values[field])
        } else if node.backend.contains_key(field) {
            Ok(&mut node.backend[field])
        } else {
            Err(Error::UnknownField {
                state: node.name.clone(),
                field: field.to_string(),
            })
        }
    }

    // Snapshot-restore writes bypass dirty tracking; a restored tree starts
    // clean.

    pub(crate) fn restore_stored(&mut self, id: NodeId, field: &str, value: Value) {
        self.node_mut(id).values.insert(field.to_string(), value);
    }

    pub(crate) fn restore_backend(&mut self, id: NodeId, field: &str, value: Value) {
        self.node_mut(id).backend.insert(field.to_string(), value);
    }

    pub(crate) fn restore_router_context(&mut self, id: NodeId, ctx: IndexMap<String, Value>) {
        self.node_mut(id).router_context = ctx;
    }

    fn eval_computed(&mut self, id: NodeId, field: &str) -> Result<Value> {
        if let Some(value) = self.pass_memo.get(&(id, field.to_string())) {
            return Ok(value.clone());
        }
        let schema = self.node(id).schema.clone();
        let def = schema
            .field(field)
            .ok_or_else(|| self.unknown_field(id, field))?;
        let FieldKind::Computed { cache, compute, .. } = def.kind() else {
            return Err(self.unknown_field(id, field));
        };
        let cache = *cache;
        let compute = compute.clone();
        let value = compute(self, id)?;
        if cache && self.in_delta_pass {
            self.pass_memo
                .insert((id, field.to_string()), value.clone());
        }
        Ok(value)
    }

    // ------------------------------------------------------------------
    // Router context
    // ------------------------------------------------------------------

    /// Overwrite the router context on this node and every descendant. The
    /// context is request metadata and must stay globally consistent across
    /// the tree for one client.
    pub fn set_router_context(&mut self, id: NodeId, ctx: IndexMap<String, Value>) {
        self.node_mut(id).router_context = ctx.clone();
        self.node_mut(id)
            .dirty_fields
            .insert(ROUTER_DATA.to_string());
        self.mark_dirty(id);
        let children: Vec<NodeId> = self.node(id).children.values().copied().collect();
        for child in children {
            self.set_router_context(child, ctx.clone());
        }
    }

    fn router_str(&self, id: NodeId, key: &str) -> String {
        self.node(id)
            .router_context
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    }

    /// The client token this tree belongs to.
    pub fn client_token(&self, id: NodeId) -> String {
        self.router_str(id, route::CLIENT_TOKEN)
    }

    /// The session id of the connection that triggered the current event.
    pub fn session_id(&self, id: NodeId) -> String {
        self.router_str(id, route::SESSION_ID)
    }

    /// The IP of the client connection.
    pub fn client_ip(&self, id: NodeId) -> String {
        self.router_str(id, route::CLIENT_IP)
    }

    /// The request headers, empty if none were recorded.
    pub fn headers(&self, id: NodeId) -> IndexMap<String, Value> {
        self.node(id)
            .router_context
            .get(route::HEADERS)
            .and_then(|v| v.as_map().cloned())
            .unwrap_or_default()
    }

    /// The current page path; `origin` selects the route as shown in the
    /// browser rather than the matched pattern.
    pub fn current_page(&self, id: NodeId, origin: bool) -> String {
        let key = if origin { route::ORIGIN } else { route::PATH };
        self.router_str(id, key)
    }

    /// Query parameters of the current page.
    pub fn query_params(&self, id: NodeId) -> IndexMap<String, Value> {
        self.node(id)
            .router_context
            .get(route::QUERY)
            .and_then(|v| v.as_map().cloned())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Dirty propagation
    // ------------------------------------------------------------------

    /// Propagate dirtiness from `id`:
    ///
    /// 1. ancestors record the dirty child, stopping at the first hop that
    ///    already knew (idempotent fixed point)
    /// 2. computed fields on this node join the dirty set by transitive
    ///    closure over the schema's dependency edges
    /// 3. dirty inherited fields fan out into the descendant nodes whose
    ///    computed fields read them
    pub fn mark_dirty(&mut self, id: NodeId) {
        if let Some(parent) = self.node(id).parent {
            let name = self.node(id).name.clone();
            if self.node_mut(parent).dirty_children.insert(name) {
                self.mark_dirty(parent);
            }
        }

        self.mark_dirty_computed(id);

        let schema = self.node(id).schema.clone();
        let dirty: Vec<String> = self.node(id).dirty_fields.iter().cloned().collect();
        for field in dirty {
            let Some(dependents) = schema.dependent_children(&field) else {
                continue;
            };
            for child_name in dependents.clone() {
                let child_id = self.node(id).children[&child_name];
                self.node_mut(id).dirty_children.insert(child_name);
                self.node_mut(child_id).dirty_fields.insert(field.clone());
                self.mark_dirty(child_id);
            }
        }
    }

    /// Fixed-point closure: any computed field depending on an
    /// already-dirty field becomes dirty itself, until nothing new joins.
    fn mark_dirty_computed(&mut self, id: NodeId) {
        let schema = self.node(id).schema.clone();
        let mut frontier: HashSet<String> = self.node(id).dirty_fields.clone();
        while !frontier.is_empty() {
            let mut next = HashSet::new();
            for field in &frontier {
                let Some(readers) = schema.computed_readers(field) else {
                    continue;
                };
                for reader in readers {
                    if self.node_mut(id).dirty_fields.insert(reader.clone()) {
                        next.insert(reader.clone());
                    }
                }
            }
            frontier = next;
        }
    }

    // ------------------------------------------------------------------
    // Delta computation
    // ------------------------------------------------------------------

    /// Compute the delta for the whole tree since the last
    /// [`clean`](StateTree::clean).
    pub fn delta(&mut self) -> Result<Delta> {
        let root = self.root;
        self.in_delta_pass = true;
        self.pass_memo.clear();
        let mut out = Delta::new();
        let result = self.delta_inner(root, &mut out);
        self.in_delta_pass = false;
        self.pass_memo.clear();
        result?;
        trace!(nodes = out.len(), "computed delta");
        Ok(out)
    }

    fn delta_inner(&mut self, id: NodeId, out: &mut Delta) -> Result<()> {
        let schema = self.node(id).schema.clone();

        // Never-cached computed fields go into every delta for this node.
        for field in schema.always_dirty() {
            self.node_mut(id).dirty_fields.insert(field.clone());
        }
        // Re-propagate so late-discovered dependents are included.
        self.mark_dirty(id);

        let dirty = self.node(id).dirty_fields.clone();
        let mut entry: IndexMap<String, serde_json::Value> = IndexMap::new();
        for def in schema.fields() {
            if def.is_backend() || !dirty.contains(def.name()) {
                continue;
            }
            let value = if def.is_computed() {
                self.eval_computed(id, def.name())?
            } else {
                self.node(id)
                    .values
                    .get(def.name())
                    .cloned()
                    .unwrap_or(Value::Null)
            };
            let json = to_client_json(&value, &self.serializers)?;
            entry.insert(def.name().to_string(), json);
        }
        if !entry.is_empty() {
            out.insert(self.node(id).full_name.clone(), entry);
        }

        // Recurse into children flagged dirty plus children whose subtree
        // holds an always-dirty computed field, in declaration order.
        let dirty_children = self.node(id).dirty_children.clone();
        let children: Vec<(String, NodeId)> = self
            .node(id)
            .children
            .iter()
            .map(|(name, id)| (name.clone(), *id))
            .collect();
        for (name, child_id) in children {
            if dirty_children.contains(&name) || schema.always_dirty_children().contains(&name) {
                self.delta_inner(child_id, out)?;
            }
        }
        Ok(())
    }

    /// Render every client-visible field of every node, for initial
    /// hydration of a fresh client.
    pub fn render_full(&mut self) -> Result<Delta> {
        let mut out = Delta::new();
        let ids: Vec<NodeId> = {
            let mut ids = Vec::new();
            self.collect_ids(self.root, &mut ids);
            ids
        };
        for id in ids {
            let schema = self.node(id).schema.clone();
            let mut entry: IndexMap<String, serde_json::Value> = IndexMap::new();
            for def in schema.fields() {
                if def.is_backend() {
                    continue;
                }
                let value = if def.is_computed() {
                    self.eval_computed(id, def.name())?
                } else {
                    self.node(id)
                        .values
                        .get(def.name())
                        .cloned()
                        .unwrap_or(Value::Null)
                };
                entry.insert(def.name().to_string(), to_client_json(&value, &self.serializers)?);
            }
            if !entry.is_empty() {
                out.insert(self.node(id).full_name.clone(), entry);
            }
        }
        Ok(out)
    }

    fn collect_ids(&self, id: NodeId, out: &mut Vec<NodeId>) {
        out.push(id);
        for child in self.node(id).children.values() {
            self.collect_ids(*child, out);
        }
    }

    /// Clear every dirty set in the tree. Called after a delta is sent and
    /// before a new event cycle starts.
    pub fn clean(&mut self) {
        let root = self.root;
        self.clean_from(root);
    }

    fn clean_from(&mut self, id: NodeId) {
        let children: Vec<NodeId> = self.node(id).children.values().copied().collect();
        for child in children {
            self.clean_from(child);
        }
        let node = self.node_mut(id);
        node.dirty_fields.clear();
        node.dirty_children.clear();
    }

    /// Reset every stored field in the subtree to its schema default.
    pub fn reset(&mut self, id: NodeId) -> Result<()> {
        let schema = self.node(id).schema.clone();
        for def in schema.fields() {
            if let FieldKind::Stored { default } = def.kind() {
                self.set(id, def.name(), default.clone())?;
            }
        }
        let children: Vec<NodeId> = self.node(id).children.values().copied().collect();
        for child in children {
            self.reset(child)?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<SerializerRegistry> {
        Arc::new(SerializerRegistry::new())
    }

    fn counter_schema() -> Arc<Schema> {
        Schema::builder("app")
            .stored("count", 0)
            .computed("doubled", &["count"], |tree, id| {
                let count = tree.get(id, "count")?.as_int().unwrap_or(0);
                Ok(Value::Int(count * 2))
            })
            .compile()
            .unwrap()
    }

    #[test]
    fn set_marks_field_and_dependent_computed_dirty() {
        let mut tree = StateTree::new(counter_schema(), registry());
        let root = tree.root();
        tree.set(root, "count", 5).unwrap();
        assert!(tree.node(root).dirty_fields().contains("count"));
        assert!(tree.node(root).dirty_fields().contains("doubled"));
    }

    #[test]
    fn delta_includes_stored_and_computed_once() {
        let mut tree = StateTree::new(counter_schema(), registry());
        let root = tree.root();
        tree.set(root, "count", 5).unwrap();
        let delta = tree.delta().unwrap();
        let entry = &delta["app"];
        assert_eq!(entry["count"], serde_json::json!(5));
        assert_eq!(entry["doubled"], serde_json::json!(10));
        assert_eq!(entry.len(), 2);
    }

    #[test]
    fn second_delta_without_mutation_is_empty() {
        let mut tree = StateTree::new(counter_schema(), registry());
        let root = tree.root();
        tree.set(root, "count", 1).unwrap();
        let _ = tree.delta().unwrap();
        tree.clean();
        let second = tree.delta().unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn uncached_computed_appears_in_every_delta() {
        let schema = Schema::builder("app")
            .stored("x", 0)
            .computed_uncached("ticks", &[], |_, _| Ok(Value::Int(7)))
            .compile()
            .unwrap();
        let mut tree = StateTree::new(schema, registry());
        let delta = tree.delta().unwrap();
        assert_eq!(delta["app"]["ticks"], serde_json::json!(7));
        tree.clean();
        let again = tree.delta().unwrap();
        assert_eq!(again["app"]["ticks"], serde_json::json!(7));
    }

    #[test]
    fn uncached_computed_on_a_clean_child_is_still_visited() {
        let schema = Schema::builder("app")
            .child(
                Schema::builder("clock")
                    .computed_uncached("ticks", &[], |_, _| Ok(Value::Int(5))),
            )
            .compile()
            .unwrap();
        let mut tree = StateTree::new(schema, registry());
        let delta = tree.delta().unwrap();
        assert_eq!(delta["app.clock"]["ticks"], serde_json::json!(5));
    }

    #[test]
    fn inherited_set_lands_on_ancestor_path() {
        let schema = Schema::builder("app")
            .stored("shared", "a")
            .child(Schema::builder("child"))
            .compile()
            .unwrap();
        let mut tree = StateTree::new(schema, registry());
        let child = tree.resolve_path("app.child").unwrap();
        tree.set(child, "shared", "b").unwrap();

        let delta = tree.delta().unwrap();
        assert_eq!(delta["app"]["shared"], serde_json::json!("b"));
        assert!(!delta.contains_key("app.child"));
    }

    #[test]
    fn inherited_dependency_dirties_descendant_computed() {
        let schema = Schema::builder("app")
            .stored("base", 1)
            .child(Schema::builder("child").computed("tripled", &["base"], |tree, id| {
                let base = tree.get(id, "base")?.as_int().unwrap_or(0);
                Ok(Value::Int(base * 3))
            }))
            .compile()
            .unwrap();
        let mut tree = StateTree::new(schema, registry());
        let root = tree.root();
        tree.set(root, "base", 4).unwrap();

        let delta = tree.delta().unwrap();
        assert_eq!(delta["app"]["base"], serde_json::json!(4));
        assert_eq!(delta["app.child"]["tripled"], serde_json::json!(12));
    }

    #[test]
    fn backend_fields_never_reach_the_delta() {
        let schema = Schema::builder("app")
            .backend("secret", 0)
            .computed("visible", &["secret"], |tree, id| {
                let secret = tree.get(id, "secret")?.as_int().unwrap_or(0);
                Ok(Value::Int(secret + 1))
            })
            .compile()
            .unwrap();
        let mut tree = StateTree::new(schema, registry());
        let root = tree.root();
        tree.set(root, "secret", 41).unwrap();

        let delta = tree.delta().unwrap();
        let entry = &delta["app"];
        assert!(entry.get("secret").is_none());
        assert_eq!(entry["visible"], serde_json::json!(42));
    }

    #[test]
    fn backend_values_are_isolated_per_tree() {
        let schema = Schema::builder("app")
            .backend("bag", Value::list())
            .compile()
            .unwrap();
        let registry = registry();
        let mut a = StateTree::new(schema.clone(), registry.clone());
        let mut b = StateTree::new(schema, registry);
        let root_a = a.root();
        let root_b = b.root();

        a.set(root_a, "bag", vec![1i64]).unwrap();
        assert_eq!(a.get(root_a, "bag").unwrap(), Value::from(vec![1i64]));
        assert_eq!(b.get(root_b, "bag").unwrap(), Value::List(vec![]));
    }

    #[test]
    fn router_context_propagates_to_descendants() {
        let schema = Schema::builder("app")
            .child(Schema::builder("mid").child(Schema::builder("leaf")))
            .compile()
            .unwrap();
        let mut tree = StateTree::new(schema, registry());
        let root = tree.root();
        let ctx: IndexMap<String, Value> =
            [(route::CLIENT_TOKEN.to_string(), Value::from("tok-1"))]
                .into_iter()
                .collect();
        tree.set_router_context(root, ctx);

        let leaf = tree.resolve_path("app.mid.leaf").unwrap();
        assert_eq!(tree.client_token(leaf), "tok-1");
    }

    #[test]
    fn reset_restores_defaults_recursively() {
        let schema = Schema::builder("app")
            .stored("x", 1)
            .child(Schema::builder("child").stored("y", "default"))
            .compile()
            .unwrap();
        let mut tree = StateTree::new(schema, registry());
        let root = tree.root();
        let child = tree.resolve_path("app.child").unwrap();
        tree.set(root, "x", 99).unwrap();
        tree.set(child, "y", "changed").unwrap();

        tree.reset(root).unwrap();
        assert_eq!(tree.get(root, "x").unwrap(), Value::Int(1));
        assert_eq!(tree.get(child, "y").unwrap(), Value::from("default"));
    }

    #[test]
    fn assigning_a_computed_field_is_rejected() {
        let mut tree = StateTree::new(counter_schema(), registry());
        let root = tree.root();
        let err = tree.set(root, "doubled", 3).unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::AssignToComputed { .. })
        ));
    }

    #[test]
    fn unknown_path_is_rejected() {
        let tree = StateTree::new(counter_schema(), registry());
        assert!(matches!(
            tree.resolve_path("app.nope"),
            Err(Error::UnknownPath(_))
        ));
    }
}
