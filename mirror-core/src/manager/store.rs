//! Snapshots and the key-value store backing externalized state.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::serialize::SerializerRegistry;
use crate::state::{NodeId, StateTree};
use crate::value::Value;

// ----------------------------------------------------------------------------
// Snapshots
// ----------------------------------------------------------------------------

/// Persisted form of one node.
#[derive(Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub values: IndexMap<String, Value>,
    pub backend: IndexMap<String, Value>,
    pub router_context: IndexMap<String, Value>,
}

/// Persisted form of a whole state tree, keyed by node full name. Dirty sets
/// are not captured; a restored tree starts clean.
#[derive(Serialize, Deserialize)]
pub struct Snapshot {
    /// Root schema name, checked on restore.
    pub root: String,
    pub nodes: IndexMap<String, NodeSnapshot>,
}

/// Custom values cannot round-trip through a snapshot; they degrade to the
/// plain value of their registered client serialization. Containers recurse.
fn degrade(value: &Value, registry: &SerializerRegistry) -> Result<Value> {
    Ok(match value {
        Value::Custom(custom) => Value::from_json(&registry.serialize(custom)?),
        Value::List(items) => Value::List(
            items
                .iter()
                .map(|v| degrade(v, registry))
                .collect::<Result<_>>()?,
        ),
        Value::Set(items) => Value::Set(
            items
                .iter()
                .map(|v| degrade(v, registry))
                .collect::<Result<_>>()?,
        ),
        Value::Map(entries) => Value::Map(
            entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), degrade(v, registry)?)))
                .collect::<Result<_>>()?,
        ),
        other => other.clone(),
    })
}

impl Snapshot {
    /// Capture the full tree.
    pub fn capture(tree: &StateTree) -> Result<Self> {
        let registry = tree.serializers().clone();
        let mut nodes = IndexMap::new();
        fn walk(
            tree: &StateTree,
            registry: &SerializerRegistry,
            id: NodeId,
            out: &mut IndexMap<String, NodeSnapshot>,
        ) -> Result<()> {
            let node = tree.node(id);
            let mut values = IndexMap::new();
            for def in node.schema().fields() {
                if !def.is_stored() {
                    continue;
                }
                if let Some(value) = tree.node(id).stored(def.name()) {
                    values.insert(def.name().to_string(), degrade(value, registry)?);
                }
            }
            let mut backend = IndexMap::new();
            for def in node.schema().fields() {
                if !def.is_backend() {
                    continue;
                }
                if let Some(value) = tree.node(id).backend_value(def.name()) {
                    backend.insert(def.name().to_string(), degrade(value, registry)?);
                }
            }
            out.insert(
                node.full_name().to_string(),
                NodeSnapshot {
                    values,
                    backend,
                    router_context: node.router_context().clone(),
                },
            );
            for (_, child) in node.children() {
                walk(tree, registry, child, out)?;
            }
            Ok(())
        }
        walk(tree, &registry, tree.root(), &mut nodes)?;
        Ok(Self {
            root: tree.node(tree.root()).name().to_string(),
            nodes,
        })
    }

    /// Apply this snapshot onto a fresh tree built from the same schema.
    /// Fields the snapshot knows but the schema no longer declares are
    /// dropped silently, so old snapshots survive schema evolution. The
    /// restored tree is clean.
    pub fn restore_into(self, tree: &mut StateTree) -> Result<()> {
        let ids: Vec<NodeId> = {
            fn collect(tree: &StateTree, id: NodeId, out: &mut Vec<NodeId>) {
                out.push(id);
                for (_, child) in tree.node(id).children() {
                    collect(tree, child, out);
                }
            }
            let mut ids = Vec::new();
            collect(tree, tree.root(), &mut ids);
            ids
        };
        for id in ids {
            let full_name = tree.node(id).full_name().to_string();
            let Some(snapshot) = self.nodes.get(&full_name) else {
                continue;
            };
            for (field, value) in &snapshot.values {
                if tree
                    .node(id)
                    .schema()
                    .field(field)
                    .is_some_and(|d| d.is_stored())
                {
                    tree.restore_stored(id, field, value.clone());
                }
            }
            for (field, value) in &snapshot.backend {
                if tree
                    .node(id)
                    .schema()
                    .field(field)
                    .is_some_and(|d| d.is_backend())
                {
                    tree.restore_backend(id, field, value.clone());
                }
            }
            tree.restore_router_context(id, snapshot.router_context.clone());
        }
        tree.clean();
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        rmp_serde::to_vec_named(self).map_err(|e| StoreError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| StoreError::Decode(e.to_string()))
    }
}

// ----------------------------------------------------------------------------
// Key-value backing
// ----------------------------------------------------------------------------

/// A key-value store holding encoded snapshots, one per client token. An
/// expired or missing entry reads as `None`.
pub trait KvStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreError>>;

    fn put<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StoreError>>;
}

/// In-process [`KvStore`] with lazy TTL expiry. Stands in for an external
/// store in tests and single-process deployments.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, (Vec<u8>, Option<Instant>)>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreError>> {
        Box::pin(async move {
            let expired = match self.entries.get(key) {
                Some(entry) => match entry.value().1 {
                    Some(deadline) => Instant::now() >= deadline,
                    None => false,
                },
                None => return Ok(None),
            };
            if expired {
                self.entries.remove(key);
                return Ok(None);
            }
            Ok(self.entries.get(key).map(|entry| entry.value().0.clone()))
        })
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let deadline = ttl.map(|ttl| Instant::now() + ttl);
            self.entries.insert(key.to_string(), (value, deadline));
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.entries.remove(key);
            Ok(())
        })
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::schema::Schema;
    use crate::value::Value;

    use super::*;

    fn sample_tree() -> StateTree {
        let schema = Schema::builder("app")
            .stored("count", 0)
            .backend("secrets", Value::list())
            .child(Schema::builder("child").stored("name", "anon"))
            .compile()
            .unwrap();
        StateTree::new(schema, Arc::new(SerializerRegistry::new()))
    }

    #[test]
    fn snapshot_round_trips_values_and_backend() {
        let mut tree = sample_tree();
        let root = tree.root();
        let child = tree.resolve_path("app.child").unwrap();
        tree.set(root, "count", 7).unwrap();
        tree.set(root, "secrets", vec!["k1"]).unwrap();
        tree.set(child, "name", "ada").unwrap();

        let bytes = Snapshot::capture(&tree).unwrap().encode().unwrap();
        let mut restored = sample_tree();
        Snapshot::decode(&bytes)
            .unwrap()
            .restore_into(&mut restored)
            .unwrap();

        let root = restored.root();
        let child = restored.resolve_path("app.child").unwrap();
        assert_eq!(restored.get(root, "count").unwrap(), Value::Int(7));
        assert_eq!(
            restored.get(root, "secrets").unwrap(),
            Value::from(vec!["k1"])
        );
        assert_eq!(restored.get(child, "name").unwrap(), Value::from("ada"));
    }

    #[test]
    fn restored_tree_starts_clean() {
        let mut tree = sample_tree();
        let root = tree.root();
        tree.set(root, "count", 3).unwrap();

        let snapshot = Snapshot::capture(&tree).unwrap();
        let mut restored = sample_tree();
        snapshot.restore_into(&mut restored).unwrap();
        assert!(restored.delta().unwrap().is_empty());
    }

    #[test]
    fn custom_values_degrade_through_their_serializer() {
        struct Money {
            cents: i64,
        }
        let registry = SerializerRegistry::new();
        registry
            .register::<Money, _>(|m| serde_json::json!(m.cents))
            .unwrap();
        let schema = Schema::builder("app")
            .stored("price", Value::Null)
            .compile()
            .unwrap();
        let mut tree = StateTree::new(schema, Arc::new(registry));
        let root = tree.root();
        tree.set(root, "price", Value::custom(Money { cents: 150 }))
            .unwrap();

        let snapshot = Snapshot::capture(&tree).unwrap();
        assert_eq!(
            snapshot.nodes["app"].values["price"],
            Value::Int(150)
        );
    }

    #[tokio::test]
    async fn memory_store_honors_ttl() {
        let store = MemoryKvStore::new();
        store
            .put("k", vec![1], Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert!(store.get("k").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_delete_removes_entries() {
        let store = MemoryKvStore::new();
        store.put("k", vec![1], None).await.unwrap();
        store.delete("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }
}
