//! Client-facing value formatting.
//!
//! Deltas carry plain JSON. Most [`Value`] shapes map directly; two need
//! help:
//!
//! - Datetimes render as a fixed human-readable string (the frontend shows
//!   them verbatim).
//! - Custom application types go through the [`SerializerRegistry`], a
//!   process-wide `TypeId -> function` table with explicit registration.
//!   A non-JSON value with no registered serializer is an error, never a
//!   silent placeholder.
//!
//! Registration happens explicitly at startup and the table is safe to
//! share across tasks afterwards.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::ValidationError;
use crate::value::{CustomValue, Value};

type SerializeFn = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> serde_json::Value + Send + Sync>;

struct RegisteredSerializer {
    type_name: &'static str,
    serialize: SerializeFn,
}

/// Process-wide table mapping custom value types to their JSON renderings.
#[derive(Default)]
pub struct SerializerRegistry {
    entries: RwLock<HashMap<TypeId, RegisteredSerializer>>,
}

impl SerializerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a serializer for `T`. Registering the same type twice is an
    /// error so overlapping registrations are caught at startup.
    pub fn register<T, F>(&self, serialize: F) -> Result<(), ValidationError>
    where
        T: Any + Send + Sync,
        F: Fn(&T) -> serde_json::Value + Send + Sync + 'static,
    {
        let mut entries = self.entries.write();
        let type_id = TypeId::of::<T>();
        if entries.contains_key(&type_id) {
            return Err(ValidationError::DuplicateSerializer {
                type_name: std::any::type_name::<T>(),
            });
        }
        entries.insert(
            type_id,
            RegisteredSerializer {
                type_name: std::any::type_name::<T>(),
                serialize: Arc::new(move |any| {
                    let value = any
                        .downcast_ref::<T>()
                        .expect("serializer invoked with mismatched TypeId");
                    serialize(value)
                }),
            },
        );
        Ok(())
    }

    /// Whether a serializer is registered for `T`.
    pub fn has<T: Any>(&self) -> bool {
        self.entries.read().contains_key(&TypeId::of::<T>())
    }

    /// Serialize a custom value through its registered function.
    pub fn serialize(&self, custom: &CustomValue) -> Result<serde_json::Value, ValidationError> {
        let entries = self.entries.read();
        let entry = entries
            .get(&custom.type_id())
            .ok_or(ValidationError::NoSerializer {
                type_name: custom.type_name(),
            })?;
        debug_assert_eq!(entry.type_name, custom.type_name());
        Ok((entry.serialize)(custom.data()))
    }
}

/// Render a value for the client, resolving custom types through `registry`.
pub fn to_client_json(
    value: &Value,
    registry: &SerializerRegistry,
) -> Result<serde_json::Value, ValidationError> {
    match value {
        Value::Custom(custom) => registry.serialize(custom),
        Value::List(items) | Value::Set(items) => Ok(serde_json::Value::Array(
            items
                .iter()
                .map(|v| to_client_json(v, registry))
                .collect::<Result<_, _>>()?,
        )),
        Value::Map(entries) => {
            let mut out = serde_json::Map::with_capacity(entries.len());
            for (k, v) in entries {
                out.insert(k.clone(), to_client_json(v, registry)?);
            }
            Ok(serde_json::Value::Object(out))
        }
        other => other.to_plain_json(),
    }
}
