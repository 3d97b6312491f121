//! Static state-tree schema.
//!
//! The shape of the state tree (which nodes exist, which fields they carry,
//! which handlers they expose, and how computed fields depend on other
//! fields) is assembled once at startup through [`NodeBuilder`] and frozen
//! into an immutable [`Schema`]. Everything downstream (dirty propagation,
//! delta computation, handler dispatch) consumes this as read-only data, so
//! no runtime reflection is ever needed.
//!
//! Compiling a schema performs the definition-time checks:
//!
//! - duplicate field and substate names
//! - handlers shadowing built-in node operations
//! - computed dependencies naming fields that exist on the node or an
//!   ancestor
//! - cyclic computed dependency chains (rejected here rather than looping
//!   at runtime)
//!
//! It also derives the two dirty-propagation tables consumed on every
//! mutation: `field -> computed readers` per node, and
//! `inherited field -> dependent substates` per ancestor.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use crate::error::{DefinitionError, Error};
use crate::event::{HandlerOutcome, Payload};
use crate::state::{NodeId, StateTree, ROUTER_DATA};
use crate::value::Value;

/// Computed-field body. Takes the whole tree mutably because a computed
/// field is allowed to mutate state while evaluating; the value it returns
/// reflects the state after any such nested mutation.
pub type ComputeFn = Arc<dyn Fn(&mut StateTree, NodeId) -> Result<Value, Error> + Send + Sync>;

/// Event-handler body, bound to the node it was declared on.
pub type HandlerFn =
    Arc<dyn Fn(&mut StateTree, NodeId, &Payload) -> Result<HandlerOutcome, Error> + Send + Sync>;

/// Handler names that would shadow built-in node operations.
const RESERVED_HANDLER_NAMES: &[&str] = &[
    "process",
    "reset",
    "delta",
    "snapshot",
    "restore",
    "call_handler",
    "get_substate",
    "clean",
];

/// The kind of a declared field.
#[derive(Clone)]
pub enum FieldKind {
    /// Directly settable reactive value with a default.
    Stored { default: Value },

    /// Derived value. `cache: false` means the field is always considered
    /// dirty and recomputed on every delta pass.
    Computed {
        cache: bool,
        deps: Vec<String>,
        compute: ComputeFn,
    },

    /// Stored but never serialized to the client. Still participates in
    /// dirty tracking so dependent computed fields recalculate.
    BackendOnly { default: Value },
}

/// A named field declaration.
#[derive(Clone)]
pub struct FieldDef {
    name: String,
    kind: FieldKind,
}

impl FieldDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn is_stored(&self) -> bool {
        matches!(self.kind, FieldKind::Stored { .. })
    }

    pub fn is_computed(&self) -> bool {
        matches!(self.kind, FieldKind::Computed { .. })
    }

    pub fn is_backend(&self) -> bool {
        matches!(self.kind, FieldKind::BackendOnly { .. })
    }

    /// Whether this is a computed field with caching disabled.
    pub fn is_always_dirty(&self) -> bool {
        matches!(self.kind, FieldKind::Computed { cache: false, .. })
    }
}

/// The compiled, immutable schema for one node type in the state tree.
pub struct NodeSchema {
    name: String,
    fields: IndexMap<String, FieldDef>,
    handlers: IndexMap<String, HandlerFn>,
    children: IndexMap<String, Arc<NodeSchema>>,
    /// `field -> computed fields on this node that read it`. Transitive
    /// closure over these edges happens at dirty-propagation time.
    computed_deps: HashMap<String, HashSet<String>>,
    /// `field -> direct child names on the path to a descendant whose
    /// computed fields read this (inherited) field`.
    child_var_deps: HashMap<String, HashSet<String>>,
    /// Computed fields with `cache: false`, in declaration order.
    always_dirty: Vec<String>,
    /// Direct children whose subtrees contain an always-dirty computed
    /// field. Delta passes must visit these even when nothing changed.
    always_dirty_children: HashSet<String>,
}

impl NodeSchema {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.values()
    }

    pub fn handler(&self, name: &str) -> Option<&HandlerFn> {
        self.handlers.get(name)
    }

    pub fn children(&self) -> impl Iterator<Item = &Arc<NodeSchema>> {
        self.children.values()
    }

    pub fn child(&self, name: &str) -> Option<&Arc<NodeSchema>> {
        self.children.get(name)
    }

    /// Computed fields on this node that read `field`.
    pub fn computed_readers(&self, field: &str) -> Option<&HashSet<String>> {
        self.computed_deps.get(field)
    }

    /// Direct children through which a descendant depends on `field`.
    pub fn dependent_children(&self, field: &str) -> Option<&HashSet<String>> {
        self.child_var_deps.get(field)
    }

    /// Computed fields recomputed on every delta pass.
    pub fn always_dirty(&self) -> &[String] {
        &self.always_dirty
    }

    /// Children that must be visited on every delta pass.
    pub fn always_dirty_children(&self) -> &HashSet<String> {
        &self.always_dirty_children
    }

    /// Whether this subtree contains any always-dirty computed field.
    pub fn has_always_dirty(&self) -> bool {
        !self.always_dirty.is_empty() || !self.always_dirty_children.is_empty()
    }
}

// Field and handler bodies are closures; print names only.
impl fmt::Debug for NodeSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSchema")
            .field("name", &self.name)
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("children", &self.children.values().collect::<Vec<_>>())
            .finish()
    }
}

/// The compiled schema for a whole state tree.
pub struct Schema {
    root: Arc<NodeSchema>,
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema").field("root", &self.root).finish()
    }
}

impl Schema {
    /// Start declaring the root node of a state tree.
    pub fn builder(name: impl Into<String>) -> NodeBuilder {
        NodeBuilder::new(name)
    }

    pub fn root(&self) -> &Arc<NodeSchema> {
        &self.root
    }

    /// Resolve a node schema by path segments. The leading segment may name
    /// the root itself.
    pub fn node_at<'a>(
        &self,
        mut segments: impl Iterator<Item = &'a str>,
    ) -> Option<&Arc<NodeSchema>> {
        let mut current = &self.root;
        if let Some(first) = segments.next() {
            if first != current.name() {
                current = current.child(first)?;
            }
        }
        for segment in segments {
            current = current.child(segment)?;
        }
        Some(current)
    }
}

/// Declares one node of the state tree. Nest via [`NodeBuilder::child`] and
/// compile the root with [`NodeBuilder::compile`].
pub struct NodeBuilder {
    name: String,
    fields: Vec<FieldDef>,
    handlers: Vec<(String, HandlerFn)>,
    children: Vec<NodeBuilder>,
}

impl NodeBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            handlers: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Declare a stored reactive field with a default value.
    pub fn stored(mut self, name: impl Into<String>, default: impl Into<Value>) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            kind: FieldKind::Stored {
                default: default.into(),
            },
        });
        self
    }

    /// Declare a backend-only field: stored, dirty-tracked, never sent to
    /// the client.
    pub fn backend(mut self, name: impl Into<String>, default: impl Into<Value>) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            kind: FieldKind::BackendOnly {
                default: default.into(),
            },
        });
        self
    }

    /// Declare a cached computed field with its declared dependencies.
    pub fn computed<F>(self, name: impl Into<String>, deps: &[&str], compute: F) -> Self
    where
        F: Fn(&mut StateTree, NodeId) -> Result<Value, Error> + Send + Sync + 'static,
    {
        self.computed_field(name, deps, true, compute)
    }

    /// Declare a computed field that is recomputed on every delta pass.
    pub fn computed_uncached<F>(self, name: impl Into<String>, deps: &[&str], compute: F) -> Self
    where
        F: Fn(&mut StateTree, NodeId) -> Result<Value, Error> + Send + Sync + 'static,
    {
        self.computed_field(name, deps, false, compute)
    }

    fn computed_field<F>(
        mut self,
        name: impl Into<String>,
        deps: &[&str],
        cache: bool,
        compute: F,
    ) -> Self
    where
        F: Fn(&mut StateTree, NodeId) -> Result<Value, Error> + Send + Sync + 'static,
    {
        self.fields.push(FieldDef {
            name: name.into(),
            kind: FieldKind::Computed {
                cache,
                deps: deps.iter().map(|d| d.to_string()).collect(),
                compute: Arc::new(compute),
            },
        });
        self
    }

    /// Bind an event handler to this node. An explicit handler named
    /// `set_<field>` replaces the auto-generated setter for that field.
    pub fn handler<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut StateTree, NodeId, &Payload) -> Result<HandlerOutcome, Error>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.push((name.into(), Arc::new(handler)));
        self
    }

    /// Attach a substate.
    pub fn child(mut self, child: NodeBuilder) -> Self {
        self.children.push(child);
        self
    }

    /// Compile this node as the root of a state tree.
    pub fn compile(self) -> Result<Arc<Schema>, DefinitionError> {
        let mut root = collect(self)?;
        wire_inherited_deps(&mut root)?;
        check_cycles(&root)?;
        let root = freeze(root);
        debug!(root = %root.name(), "compiled state schema");
        Ok(Arc::new(Schema { root }))
    }
}

/// Intermediate node used while compiling; mutable until derived tables are
/// filled in.
struct TempNode {
    name: String,
    fields: IndexMap<String, FieldDef>,
    handlers: IndexMap<String, HandlerFn>,
    children: Vec<TempNode>,
    computed_deps: HashMap<String, HashSet<String>>,
    child_var_deps: HashMap<String, HashSet<String>>,
}

/// Per-node validation: duplicate names, reserved handlers, auto setters,
/// and the local `field -> computed readers` table.
fn collect(builder: NodeBuilder) -> Result<TempNode, DefinitionError> {
    let state = builder.name.clone();

    let mut fields: IndexMap<String, FieldDef> = IndexMap::new();
    for field in builder.fields {
        if fields.contains_key(&field.name) {
            return Err(DefinitionError::DuplicateField {
                state,
                field: field.name,
            });
        }
        fields.insert(field.name.clone(), field);
    }

    let mut handlers: IndexMap<String, HandlerFn> = IndexMap::new();
    for (name, handler) in builder.handlers {
        if RESERVED_HANDLER_NAMES.contains(&name.as_str()) {
            return Err(DefinitionError::ReservedHandlerName { state, name });
        }
        handlers.insert(name, handler);
    }

    // Auto-generate `set_<field>` for stored fields without an explicit
    // handler of that name.
    for def in fields.values() {
        if !def.is_stored() {
            continue;
        }
        let setter = format!("set_{}", def.name);
        if handlers.contains_key(&setter) {
            continue;
        }
        let field_name = def.name.clone();
        let handler: HandlerFn = Arc::new(move |tree: &mut StateTree, node: NodeId, payload: &Payload| {
            let value = payload.get("value").cloned().unwrap_or(Value::Null);
            tree.set(node, &field_name, value)?;
            Ok(HandlerOutcome::done())
        });
        handlers.insert(setter, handler);
    }

    let mut computed_deps: HashMap<String, HashSet<String>> = HashMap::new();
    for def in fields.values() {
        if let FieldKind::Computed { deps, .. } = &def.kind {
            for dep in deps {
                computed_deps
                    .entry(dep.clone())
                    .or_default()
                    .insert(def.name.clone());
            }
        }
    }

    let mut children = Vec::new();
    let mut seen = HashSet::new();
    for child in builder.children {
        if !seen.insert(child.name.clone()) {
            return Err(DefinitionError::DuplicateChild {
                state,
                child: child.name,
            });
        }
        children.push(collect(child)?);
    }

    Ok(TempNode {
        name: builder.name,
        fields,
        handlers,
        children,
        computed_deps,
        child_var_deps: HashMap::new(),
    })
}

/// Validate computed dependencies against the ancestor chain and record, on
/// each ancestor between the dependent node and the declaring node, which
/// direct child leads to the dependent.
fn wire_inherited_deps(root: &mut TempNode) -> Result<(), DefinitionError> {
    // (ancestor path, field, direct child name)
    let mut records: Vec<(Vec<String>, String, String)> = Vec::new();

    fn walk(
        node: &TempNode,
        ancestors: &mut Vec<(String, HashSet<String>)>,
        path: &mut Vec<String>,
        records: &mut Vec<(Vec<String>, String, String)>,
    ) -> Result<(), DefinitionError> {
        path.push(node.name.clone());
        for def in node.fields.values() {
            let FieldKind::Computed { deps, .. } = &def.kind else {
                continue;
            };
            for dep in deps {
                if dep == ROUTER_DATA || node.fields.contains_key(dep) {
                    continue;
                }
                // Inherited: walk up until the declaring ancestor, recording
                // the hop taken at each level.
                let mut hop = node.name.clone();
                let mut found = false;
                for (idx, (ancestor_name, ancestor_fields)) in
                    ancestors.iter().enumerate().rev()
                {
                    records.push((path[..=idx].to_vec(), dep.clone(), hop.clone()));
                    if ancestor_fields.contains(dep) {
                        found = true;
                        break;
                    }
                    hop = ancestor_name.clone();
                }
                if !found {
                    return Err(DefinitionError::UnknownDependency {
                        state: node.name.clone(),
                        field: def.name.clone(),
                        dep: dep.clone(),
                    });
                }
            }
        }
        ancestors.push((
            node.name.clone(),
            node.fields.keys().cloned().collect(),
        ));
        for child in &node.children {
            walk(child, ancestors, path, records)?;
        }
        ancestors.pop();
        path.pop();
        Ok(())
    }

    let mut ancestors = Vec::new();
    let mut path = Vec::new();
    walk(root, &mut ancestors, &mut path, &mut records)?;

    for (path, field, child) in records {
        let node = node_at_path_mut(root, &path);
        node.child_var_deps.entry(field).or_default().insert(child);
    }
    Ok(())
}

fn node_at_path_mut<'a>(root: &'a mut TempNode, path: &[String]) -> &'a mut TempNode {
    let mut current = root;
    for segment in &path[1..] {
        current = current
            .children
            .iter_mut()
            .find(|c| &c.name == segment)
            .expect("schema path resolved during compilation");
    }
    current
}

/// Reject cyclic computed dependency chains with a DFS over the global
/// `(node, computed field)` graph.
fn check_cycles(root: &TempNode) -> Result<(), DefinitionError> {
    type Key = (Vec<String>, String);

    // Adjacency: computed field -> the computed fields it reads (resolving
    // inherited deps to the declaring ancestor).
    let mut edges: HashMap<Key, Vec<Key>> = HashMap::new();

    // (ancestor path, field name -> is computed)
    type Frame = (Vec<String>, HashMap<String, bool>);

    fn build(
        node: &TempNode,
        ancestors: &mut Vec<Frame>,
        path: Vec<String>,
        edges: &mut HashMap<(Vec<String>, String), Vec<(Vec<String>, String)>>,
    ) {
        for def in node.fields.values() {
            let FieldKind::Computed { deps, .. } = &def.kind else {
                continue;
            };
            let key = (path.clone(), def.name.clone());
            let mut targets = Vec::new();
            for dep in deps {
                if let Some(target) = node.fields.get(dep) {
                    if target.is_computed() {
                        targets.push((path.clone(), dep.clone()));
                    }
                    continue;
                }
                // Nearest declaring ancestor.
                for (ancestor_path, ancestor_fields) in ancestors.iter().rev() {
                    if let Some(&computed) = ancestor_fields.get(dep) {
                        if computed {
                            targets.push((ancestor_path.clone(), dep.clone()));
                        }
                        break;
                    }
                }
            }
            edges.insert(key, targets);
        }
        ancestors.push((
            path.clone(),
            node.fields
                .iter()
                .map(|(name, def)| (name.clone(), def.is_computed()))
                .collect(),
        ));
        for child in &node.children {
            let mut child_path = path.clone();
            child_path.push(child.name.clone());
            build(child, ancestors, child_path, edges);
        }
        ancestors.pop();
    }

    build(root, &mut Vec::new(), vec![root.name.clone()], &mut edges);

    // Three-color DFS.
    let mut state: HashMap<&Key, u8> = HashMap::new();
    fn visit<'a>(
        key: &'a Key,
        edges: &'a HashMap<Key, Vec<Key>>,
        state: &mut HashMap<&'a Key, u8>,
        stack: &mut Vec<String>,
    ) -> Result<(), DefinitionError> {
        match state.get(key) {
            Some(1) => {
                let mut chain: Vec<String> = stack.clone();
                chain.push(format!("{}.{}", key.0.join("."), key.1));
                let start = chain
                    .iter()
                    .position(|s| s == chain.last().unwrap())
                    .unwrap_or(0);
                return Err(DefinitionError::CyclicDependency {
                    chain: chain[start..].join(" -> "),
                });
            }
            Some(2) => return Ok(()),
            _ => {}
        }
        state.insert(key, 1);
        stack.push(format!("{}.{}", key.0.join("."), key.1));
        if let Some(targets) = edges.get(key) {
            for target in targets {
                if let Some((target_key, _)) = edges.get_key_value(target) {
                    visit(target_key, edges, state, stack)?;
                }
            }
        }
        stack.pop();
        state.insert(key, 2);
        Ok(())
    }

    let keys: Vec<&Key> = edges.keys().collect();
    for key in keys {
        visit(key, &edges, &mut state, &mut Vec::new())?;
    }
    Ok(())
}

fn freeze(node: TempNode) -> Arc<NodeSchema> {
    let always_dirty = node
        .fields
        .values()
        .filter(|d| d.is_always_dirty())
        .map(|d| d.name.clone())
        .collect();
    let children: IndexMap<String, Arc<NodeSchema>> = node
        .children
        .into_iter()
        .map(|c| (c.name.clone(), freeze(c)))
        .collect();
    let always_dirty_children = children
        .values()
        .filter(|c| c.has_always_dirty())
        .map(|c| c.name.clone())
        .collect();
    Arc::new(NodeSchema {
        name: node.name,
        fields: node.fields,
        handlers: node.handlers,
        children,
        computed_deps: node.computed_deps,
        child_var_deps: node.child_var_deps,
        always_dirty,
        always_dirty_children,
    })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_compute(_: &mut StateTree, _: NodeId) -> Result<Value, Error> {
        Ok(Value::Null)
    }

    #[test]
    fn duplicate_field_is_rejected() {
        let err = Schema::builder("app")
            .stored("x", 0)
            .stored("x", 1)
            .compile()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateField { .. }));
    }

    #[test]
    fn duplicate_child_is_rejected() {
        let err = Schema::builder("app")
            .child(Schema::builder("sub"))
            .child(Schema::builder("sub"))
            .compile()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateChild { .. }));
    }

    #[test]
    fn reserved_handler_name_is_rejected() {
        let err = Schema::builder("app")
            .handler("reset", |_, _, _| Ok(HandlerOutcome::done()))
            .compile()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::ReservedHandlerName { .. }));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = Schema::builder("app")
            .computed("c", &["missing"], noop_compute)
            .compile()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::UnknownDependency { .. }));
    }

    #[test]
    fn dependency_on_router_context_is_allowed() {
        Schema::builder("app")
            .computed("page", &[ROUTER_DATA], noop_compute)
            .compile()
            .unwrap();
    }

    #[test]
    fn cyclic_computed_dependency_is_rejected() {
        let err = Schema::builder("app")
            .computed("a", &["b"], noop_compute)
            .computed("b", &["a"], noop_compute)
            .compile()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::CyclicDependency { .. }));
    }

    #[test]
    fn inherited_computed_chain_is_not_a_cycle() {
        Schema::builder("app")
            .stored("base", 1)
            .computed("total", &["base"], noop_compute)
            .child(Schema::builder("sub").computed("display", &["total"], noop_compute))
            .compile()
            .unwrap();
    }

    #[test]
    fn self_dependency_is_rejected() {
        let err = Schema::builder("app")
            .computed("a", &["a"], noop_compute)
            .compile()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::CyclicDependency { .. }));
    }

    #[test]
    fn schema_debug_lists_names_without_bodies() {
        let schema = Schema::builder("app")
            .stored("count", 0)
            .child(Schema::builder("sub"))
            .compile()
            .unwrap();
        let rendered = format!("{schema:?}");
        assert!(rendered.contains("\"app\""));
        assert!(rendered.contains("\"count\""));
        assert!(rendered.contains("\"sub\""));
    }

    #[test]
    fn stored_fields_get_auto_setters() {
        let schema = Schema::builder("app").stored("count", 0).compile().unwrap();
        assert!(schema.root().handler("set_count").is_some());
    }

    #[test]
    fn inherited_dependency_records_child_hops() {
        let schema = Schema::builder("app")
            .stored("shared", 0)
            .child(
                Schema::builder("mid").child(
                    Schema::builder("leaf").computed("doubled", &["shared"], noop_compute),
                ),
            )
            .compile()
            .unwrap();

        let root = schema.root();
        assert!(root.dependent_children("shared").unwrap().contains("mid"));
        let mid = root.child("mid").unwrap();
        assert!(mid.dependent_children("shared").unwrap().contains("leaf"));
    }

    #[test]
    fn node_at_resolves_paths_with_and_without_root() {
        let schema = Schema::builder("app")
            .child(Schema::builder("sub"))
            .compile()
            .unwrap();
        assert!(schema.node_at(["app", "sub"].into_iter()).is_some());
        assert!(schema.node_at(["sub"].into_iter()).is_some());
        assert!(schema.node_at(["nope"].into_iter()).is_none());
    }
}
