//! Reactive value model.
//!
//! Every field in the state tree holds a [`Value`]: a JSON-like enum extended
//! with a few shapes the frontend protocol needs (sets, datetimes, and
//! type-erased custom payloads serialized through the
//! [`SerializerRegistry`](crate::serialize::SerializerRegistry)).
//!
//! Mutable containers (lists, maps, sets) are never handed out as raw
//! `&mut Value` from a state node. In-place mutation goes through a
//! [`ValueProxy`](proxy::ValueProxy) so the owning field is marked dirty
//! before the mutation lands.

mod proxy;

pub use proxy::{PathSeg, ValueProxy};

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ValidationError;

/// The client-facing rendering of a datetime, matching Python's
/// `str(datetime)` output so frontend formatting code sees one shape.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// A reactive field value.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(IndexMap<String, Value>),
    /// Set semantics over an insertion-ordered vec; [`ValueProxy`] keeps
    /// elements unique.
    Set(Vec<Value>),
    DateTime(DateTime<Utc>),
    /// A type-erased application value. Rendered to JSON through the
    /// serializer registry; compared by identity.
    Custom(CustomValue),
}

/// A type-erased custom payload held by a [`Value::Custom`].
#[derive(Clone)]
pub struct CustomValue {
    type_id: TypeId,
    type_name: &'static str,
    data: Arc<dyn Any + Send + Sync>,
}

impl CustomValue {
    /// The `TypeId` of the wrapped value.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// The Rust type name of the wrapped value.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Downcast to the wrapped type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.data.downcast_ref::<T>()
    }

    pub(crate) fn data(&self) -> &(dyn Any + Send + Sync) {
        &*self.data
    }
}

impl fmt::Debug for CustomValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomValue")
            .field("type_name", &self.type_name)
            .finish()
    }
}

impl Value {
    /// Wrap an arbitrary application value.
    pub fn custom<T: Any + Send + Sync>(value: T) -> Self {
        Value::Custom(CustomValue {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            data: Arc::new(value),
        })
    }

    /// An empty list value.
    pub fn list() -> Self {
        Value::List(Vec::new())
    }

    /// An empty map value.
    pub fn map() -> Self {
        Value::Map(IndexMap::new())
    }

    /// An empty set value.
    pub fn set() -> Self {
        Value::Set(Vec::new())
    }

    /// A short name for the value's kind, used in error messages.
    pub fn kind_str(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Set(_) => "set",
            Value::DateTime(_) => "datetime",
            Value::Custom(_) => "custom",
        }
    }

    /// Whether in-place mutation of this value is observable (and therefore
    /// must go through a [`ValueProxy`]).
    pub fn is_mutable_container(&self) -> bool {
        matches!(self, Value::List(_) | Value::Map(_) | Value::Set(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric coercion across `Int` and `Float`.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Convert an inbound JSON payload value. Never produces `Set`,
    /// `DateTime`, or `Custom`; those only arise server-side.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(entries) => Value::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Render to plain JSON without a serializer registry. Datetimes format
    /// as fixed human-readable strings, sets render as arrays, and custom
    /// values fail with [`ValidationError::NoSerializer`].
    pub fn to_plain_json(&self) -> Result<serde_json::Value, ValidationError> {
        match self {
            Value::Null => Ok(serde_json::Value::Null),
            Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
            Value::Int(i) => Ok(serde_json::Value::from(*i)),
            Value::Float(f) => Ok(serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null)),
            Value::Str(s) => Ok(serde_json::Value::String(s.clone())),
            Value::List(items) | Value::Set(items) => Ok(serde_json::Value::Array(
                items
                    .iter()
                    .map(Value::to_plain_json)
                    .collect::<Result<_, _>>()?,
            )),
            Value::Map(entries) => {
                let mut out = serde_json::Map::with_capacity(entries.len());
                for (k, v) in entries {
                    out.insert(k.clone(), v.to_plain_json()?);
                }
                Ok(serde_json::Value::Object(out))
            }
            Value::DateTime(dt) => Ok(serde_json::Value::String(
                dt.format(DATETIME_FORMAT).to_string(),
            )),
            Value::Custom(custom) => Err(ValidationError::NoSerializer {
                type_name: custom.type_name,
            }),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::Custom(a), Value::Custom(b)) => Arc::ptr_eq(&a.data, &b.data),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(i) => write!(f, "Int({i})"),
            Value::Float(x) => write!(f, "Float({x})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::List(items) => f.debug_tuple("List").field(items).finish(),
            Value::Map(entries) => f.debug_tuple("Map").field(entries).finish(),
            Value::Set(items) => f.debug_tuple("Set").field(items).finish(),
            Value::DateTime(dt) => write!(f, "DateTime({dt})"),
            Value::Custom(c) => c.fmt(f),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::DateTime(v)
    }
}

impl<V: Into<Value>> From<Vec<V>> for Value {
    fn from(items: Vec<V>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

// ----------------------------------------------------------------------------
// Snapshot representation
// ----------------------------------------------------------------------------

/// Tagged serde mirror of [`Value`], used for store snapshots. `Custom`
/// values have no representation here; the snapshot layer degrades them to
/// their registered JSON rendering before encoding.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ValueRepr {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ValueRepr>),
    Map(IndexMap<String, ValueRepr>),
    Set(Vec<ValueRepr>),
    DateTime(DateTime<Utc>),
}

impl TryFrom<&Value> for ValueRepr {
    type Error = ValidationError;

    fn try_from(value: &Value) -> Result<Self, ValidationError> {
        Ok(match value {
            Value::Null => ValueRepr::Null,
            Value::Bool(b) => ValueRepr::Bool(*b),
            Value::Int(i) => ValueRepr::Int(*i),
            Value::Float(f) => ValueRepr::Float(*f),
            Value::Str(s) => ValueRepr::Str(s.clone()),
            Value::List(items) => ValueRepr::List(
                items.iter().map(ValueRepr::try_from).collect::<Result<_, _>>()?,
            ),
            Value::Map(entries) => ValueRepr::Map(
                entries
                    .iter()
                    .map(|(k, v)| ValueRepr::try_from(v).map(|v| (k.clone(), v)))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Set(items) => ValueRepr::Set(
                items.iter().map(ValueRepr::try_from).collect::<Result<_, _>>()?,
            ),
            Value::DateTime(dt) => ValueRepr::DateTime(*dt),
            Value::Custom(_) => return Err(ValidationError::NotSnapshotable("custom")),
        })
    }
}

impl From<ValueRepr> for Value {
    fn from(repr: ValueRepr) -> Self {
        match repr {
            ValueRepr::Null => Value::Null,
            ValueRepr::Bool(b) => Value::Bool(b),
            ValueRepr::Int(i) => Value::Int(i),
            ValueRepr::Float(f) => Value::Float(f),
            ValueRepr::Str(s) => Value::Str(s),
            ValueRepr::List(items) => Value::List(items.into_iter().map(Into::into).collect()),
            ValueRepr::Map(entries) => {
                Value::Map(entries.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
            ValueRepr::Set(items) => Value::Set(items.into_iter().map(Into::into).collect()),
            ValueRepr::DateTime(dt) => Value::DateTime(dt),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ValueRepr::try_from(self)
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        ValueRepr::deserialize(deserializer).map(Into::into)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_equality_coerces_int_and_float() {
        assert_eq!(Value::Int(3), Value::Float(3.0));
        assert_ne!(Value::Int(3), Value::Float(3.5));
    }

    #[test]
    fn from_json_preserves_integer_shape() {
        let v = Value::from_json(&serde_json::json!({"a": 1, "b": 1.5}));
        let map = v.as_map().unwrap();
        assert_eq!(map["a"], Value::Int(1));
        assert_eq!(map["b"], Value::Float(1.5));
    }

    #[test]
    fn plain_json_formats_datetime() {
        let dt: DateTime<Utc> = "2023-10-10T03:30:00Z".parse().unwrap();
        let json = Value::DateTime(dt).to_plain_json().unwrap();
        assert_eq!(json, serde_json::json!("2023-10-10 03:30:00.000000"));
    }

    #[test]
    fn plain_json_rejects_unregistered_custom() {
        struct Opaque;
        let err = Value::custom(Opaque).to_plain_json().unwrap_err();
        assert!(matches!(err, ValidationError::NoSerializer { .. }));
    }

    #[test]
    fn snapshot_repr_round_trips() {
        let value = Value::Map(
            [
                ("k".to_string(), Value::List(vec![Value::Int(1), Value::Int(2)])),
                ("s".to_string(), Value::Set(vec![Value::Str("x".into())])),
            ]
            .into_iter()
            .collect(),
        );
        let bytes = rmp_serde::to_vec(&value).unwrap();
        let back: Value = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(value, back);
    }

    #[test]
    fn custom_values_compare_by_identity() {
        #[derive(Debug)]
        struct Marker(u8);
        let a = Value::custom(Marker(1));
        let b = a.clone();
        assert_eq!(a, b);
        assert_ne!(a, Value::custom(Marker(1)));
    }
}
