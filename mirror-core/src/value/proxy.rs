//! Dirty-tracking mutation proxy for container fields.

use smallvec::SmallVec;

use crate::error::{Result, ValidationError};
use crate::state::{NodeId, StateTree};

use super::Value;

/// One step into a nested container.
#[derive(Clone, Debug, PartialEq)]
pub enum PathSeg {
    /// Map key.
    Key(String),
    /// List or set position.
    Index(usize),
}

/// A mutable view into a stored or backend container field (or a position
/// nested inside one). Every mutating operation marks the owning field dirty
/// before it touches the value, so reactive tracking survives in-place edits
/// to lists, maps, and sets.
///
/// The proxy holds the path, not a borrow of the value itself; each operation
/// re-navigates from the tree. Descending with [`key`](ValueProxy::key) or
/// [`index`](ValueProxy::index) keeps dirtying the same owning field.
pub struct ValueProxy<'a> {
    tree: &'a mut StateTree,
    node: NodeId,
    field: String,
    // Paths into nested containers are almost always shallow.
    path: SmallVec<[PathSeg; 4]>,
}

impl<'a> ValueProxy<'a> {
    pub(crate) fn new(tree: &'a mut StateTree, node: NodeId, field: &str) -> Self {
        Self {
            tree,
            node,
            field: field.to_string(),
            path: SmallVec::new(),
        }
    }

    /// Descend into a map entry.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.path.push(PathSeg::Key(key.into()));
        self
    }

    /// Descend into a list position.
    pub fn index(mut self, index: usize) -> Self {
        self.path.push(PathSeg::Index(index));
        self
    }

    fn target(&mut self) -> Result<&mut Value> {
        let mut current = self.tree.raw_field_mut(self.node, &self.field)?;
        for seg in &self.path {
            current = match (seg, current) {
                (PathSeg::Key(key), Value::Map(entries)) => entries
                    .get_mut(key)
                    .ok_or_else(|| ValidationError::BadIndex {
                        kind: "map",
                        index: key.clone(),
                    })?,
                (PathSeg::Index(i), Value::List(items)) => {
                    items.get_mut(*i).ok_or(ValidationError::BadIndex {
                        kind: "list",
                        index: i.to_string(),
                    })?
                }
                (PathSeg::Index(i), Value::Set(items)) => {
                    items.get_mut(*i).ok_or(ValidationError::BadIndex {
                        kind: "set",
                        index: i.to_string(),
                    })?
                }
                (PathSeg::Key(key), other) => {
                    return Err(ValidationError::BadIndex {
                        kind: other.kind_str(),
                        index: key.clone(),
                    }
                    .into())
                }
                (PathSeg::Index(i), other) => {
                    return Err(ValidationError::BadIndex {
                        kind: other.kind_str(),
                        index: i.to_string(),
                    }
                    .into())
                }
            };
        }
        Ok(current)
    }

    fn touch(&mut self) {
        let node = self.node;
        let field = self.field.clone();
        self.tree.mark_field_dirty(node, &field);
    }

    /// Clone the value at the current position.
    pub fn get(&mut self) -> Result<Value> {
        self.target().cloned()
    }

    /// Replace the value at the current position.
    pub fn assign(&mut self, value: impl Into<Value>) -> Result<()> {
        self.touch();
        *self.target()? = value.into();
        Ok(())
    }

    /// Append to a list, or add to a set (no-op on duplicates).
    pub fn push(&mut self, value: impl Into<Value>) -> Result<()> {
        self.touch();
        let value = value.into();
        match self.target()? {
            Value::List(items) => {
                items.push(value);
                Ok(())
            }
            Value::Set(items) => {
                if !items.contains(&value) {
                    items.push(value);
                }
                Ok(())
            }
            other => Err(ValidationError::WrongKind {
                expected: "list or set",
                found: other.kind_str(),
            }
            .into()),
        }
    }

    /// Remove and return the last list element, if any.
    pub fn pop(&mut self) -> Result<Option<Value>> {
        self.touch();
        match self.target()? {
            Value::List(items) => Ok(items.pop()),
            other => Err(ValidationError::WrongKind {
                expected: "list",
                found: other.kind_str(),
            }
            .into()),
        }
    }

    /// Insert or replace a map entry.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        self.touch();
        match self.target()? {
            Value::Map(entries) => {
                entries.insert(key.into(), value.into());
                Ok(())
            }
            other => Err(ValidationError::WrongKind {
                expected: "map",
                found: other.kind_str(),
            }
            .into()),
        }
    }

    /// Remove a map entry, returning it if present.
    pub fn remove_key(&mut self, key: &str) -> Result<Option<Value>> {
        self.touch();
        match self.target()? {
            Value::Map(entries) => Ok(entries.shift_remove(key)),
            other => Err(ValidationError::WrongKind {
                expected: "map",
                found: other.kind_str(),
            }
            .into()),
        }
    }

    /// Remove a list or set element by position.
    pub fn remove_index(&mut self, index: usize) -> Result<Value> {
        self.touch();
        match self.target()? {
            Value::List(items) | Value::Set(items) => {
                if index < items.len() {
                    Ok(items.remove(index))
                } else {
                    Err(ValidationError::BadIndex {
                        kind: "list",
                        index: index.to_string(),
                    }
                    .into())
                }
            }
            other => Err(ValidationError::WrongKind {
                expected: "list or set",
                found: other.kind_str(),
            }
            .into()),
        }
    }

    /// Remove a matching element from a set, if present.
    pub fn remove_value(&mut self, value: &Value) -> Result<bool> {
        self.touch();
        match self.target()? {
            Value::Set(items) | Value::List(items) => {
                match items.iter().position(|v| v == value) {
                    Some(pos) => {
                        items.remove(pos);
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            other => Err(ValidationError::WrongKind {
                expected: "list or set",
                found: other.kind_str(),
            }
            .into()),
        }
    }

    /// Append every element to a list, or add each to a set with
    /// deduplication.
    pub fn extend<I, V>(&mut self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.touch();
        match self.target()? {
            Value::List(items) => {
                items.extend(values.into_iter().map(Into::into));
                Ok(())
            }
            Value::Set(items) => {
                for value in values {
                    let value = value.into();
                    if !items.contains(&value) {
                        items.push(value);
                    }
                }
                Ok(())
            }
            other => Err(ValidationError::WrongKind {
                expected: "list or set",
                found: other.kind_str(),
            }
            .into()),
        }
    }

    /// Reverse a list in place.
    pub fn reverse(&mut self) -> Result<()> {
        self.touch();
        match self.target()? {
            Value::List(items) => {
                items.reverse();
                Ok(())
            }
            other => Err(ValidationError::WrongKind {
                expected: "list",
                found: other.kind_str(),
            }
            .into()),
        }
    }

    /// Sort a list in place. Elements group by kind; numbers compare
    /// numerically across `Int` and `Float`.
    pub fn sort(&mut self) -> Result<()> {
        self.touch();
        match self.target()? {
            Value::List(items) => {
                items.sort_by(value_order);
                Ok(())
            }
            other => Err(ValidationError::WrongKind {
                expected: "list",
                found: other.kind_str(),
            }
            .into()),
        }
    }

    /// Empty the container at the current position.
    pub fn clear(&mut self) -> Result<()> {
        self.touch();
        match self.target()? {
            Value::List(items) | Value::Set(items) => {
                items.clear();
                Ok(())
            }
            Value::Map(entries) => {
                entries.clear();
                Ok(())
            }
            other => Err(ValidationError::WrongKind {
                expected: "container",
                found: other.kind_str(),
            }
            .into()),
        }
    }

    /// Number of elements in the container at the current position.
    pub fn len(&mut self) -> Result<usize> {
        match self.target()? {
            Value::List(items) | Value::Set(items) => Ok(items.len()),
            Value::Map(entries) => Ok(entries.len()),
            Value::Str(s) => Ok(s.chars().count()),
            other => Err(ValidationError::WrongKind {
                expected: "container",
                found: other.kind_str(),
            }
            .into()),
        }
    }

    pub fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Total order over values for [`ValueProxy::sort`]: kind rank first, then
/// the natural order within the kind. Non-orderable kinds compare equal.
fn value_order(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::Str(_) => 3,
            Value::DateTime(_) => 4,
            Value::List(_) => 5,
            Value::Set(_) => 6,
            Value::Map(_) => 7,
            Value::Custom(_) => 8,
        }
    }

    rank(a).cmp(&rank(b)).then_with(|| match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        (Value::DateTime(x), Value::DateTime(y)) => x.cmp(y),
        _ => match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
    })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::error::Error;
    use crate::schema::Schema;
    use crate::serialize::SerializerRegistry;

    use super::*;

    fn tree_with_list() -> StateTree {
        let schema = Schema::builder("app")
            .stored("items", Value::list())
            .stored("tags", Value::set())
            .stored(
                "config",
                Value::Map(
                    [("inner".to_string(), Value::list())].into_iter().collect(),
                ),
            )
            .compile()
            .unwrap();
        StateTree::new(schema, Arc::new(SerializerRegistry::new()))
    }

    #[test]
    fn push_marks_field_dirty() {
        let mut tree = tree_with_list();
        let root = tree.root();
        tree.get_mut(root, "items").unwrap().push("a").unwrap();
        assert!(tree.node(root).dirty_fields().contains("items"));
        assert_eq!(
            tree.get(root, "items").unwrap(),
            Value::from(vec!["a"])
        );
    }

    #[test]
    fn nested_mutation_marks_owning_field_dirty() {
        let mut tree = tree_with_list();
        let root = tree.root();
        tree.get_mut(root, "config")
            .unwrap()
            .key("inner")
            .push(1)
            .unwrap();
        assert!(tree.node(root).dirty_fields().contains("config"));
        let config = tree.get(root, "config").unwrap();
        let inner = config.as_map().unwrap().get("inner").unwrap();
        assert_eq!(inner, &Value::from(vec![1i64]));
    }

    #[test]
    fn set_push_deduplicates() {
        let mut tree = tree_with_list();
        let root = tree.root();
        let mut proxy = tree.get_mut(root, "tags").unwrap();
        proxy.push("x").unwrap();
        proxy.push("x").unwrap();
        assert_eq!(proxy.len().unwrap(), 1);
    }

    #[test]
    fn sort_orders_numbers_across_int_and_float() {
        let mut tree = tree_with_list();
        let root = tree.root();
        let mut proxy = tree.get_mut(root, "items").unwrap();
        proxy
            .extend([Value::Float(2.5), Value::Int(1), Value::Int(3)])
            .unwrap();
        proxy.sort().unwrap();
        assert_eq!(
            proxy.get().unwrap(),
            Value::List(vec![Value::Int(1), Value::Float(2.5), Value::Int(3)])
        );
        proxy.reverse().unwrap();
        assert_eq!(
            proxy.get().unwrap(),
            Value::List(vec![Value::Int(3), Value::Float(2.5), Value::Int(1)])
        );
    }

    #[test]
    fn bad_index_reports_kind_and_position() {
        let mut tree = tree_with_list();
        let root = tree.root();
        let err = tree
            .get_mut(root, "items")
            .unwrap()
            .index(3)
            .assign(1)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::BadIndex { .. })
        ));
    }

    #[test]
    fn backend_container_mutates_in_place_and_dirties() {
        let schema = Schema::builder("app")
            .stored("visible", 0)
            .backend("audit_log", Value::list())
            .compile()
            .unwrap();
        let mut tree = StateTree::new(schema, Arc::new(SerializerRegistry::new()));
        let root = tree.root();

        tree.get_mut(root, "audit_log").unwrap().push("login").unwrap();
        assert!(tree.node(root).dirty_fields().contains("audit_log"));
        assert_eq!(
            tree.get(root, "audit_log").unwrap(),
            Value::from(vec!["login"])
        );
        // Dirty or not, backend fields stay off the wire.
        let delta = tree.delta().unwrap();
        assert!(!delta.get("app").is_some_and(|f| f.contains_key("audit_log")));
    }

    #[test]
    fn proxy_on_computed_field_is_rejected() {
        let schema = Schema::builder("app")
            .computed("c", &[], |_, _| Ok(Value::Null))
            .compile()
            .unwrap();
        let mut tree = StateTree::new(schema, Arc::new(SerializerRegistry::new()));
        let root = tree.root();
        assert!(tree.get_mut(root, "c").is_err());
    }
}
