use std::collections::BTreeMap;
use std::convert::Infallible;

use bytes::Bytes;
use serde_json::Number;

use crate::descriptor::StreamDescriptor;

/// A node in an event argument graph.
///
/// `S` is how streams are represented: live handles on the application side,
/// [`StreamDescriptor`] placeholders on the wire ([`WireValue`]) and
/// [`Infallible`] for values that cannot hold a stream at all ([`PlainValue`]).
///
/// `Absent` models a missing argument and stays distinct from `Null` through
/// every encode/decode pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Value<S> {
    Absent,
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Bytes(Bytes),
    Array(Vec<Value<S>>),
    Object(BTreeMap<String, Value<S>>),
    Stream(S),
}

/// A value as it travels on the message channel.
pub type WireValue = Value<StreamDescriptor>;

/// A value that statically contains no stream.
///
/// Object-mode chunks and frame payloads use this type.
pub type PlainValue = Value<Infallible>;

impl<S> Value<S> {
    /// Rebuild the graph, replacing every stream through `f`.
    ///
    /// Traversal is depth-first in array order and key order. The first error
    /// returned by `f` aborts the walk.
    pub fn try_map_streams<T, E, F>(&self, f: &mut F) -> Result<Value<T>, E>
    where
        F: FnMut(&S) -> Result<T, E>,
    {
        Ok(match self {
            Value::Absent => Value::Absent,
            Value::Null => Value::Null,
            Value::Bool(b) => Value::Bool(*b),
            Value::Number(n) => Value::Number(n.clone()),
            Value::String(s) => Value::String(s.clone()),
            Value::Bytes(b) => Value::Bytes(b.clone()),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(item.try_map_streams(f)?);
                }
                Value::Array(out)
            }
            Value::Object(map) => {
                let mut out = BTreeMap::new();
                for (key, item) in map {
                    out.insert(key.clone(), item.try_map_streams(f)?);
                }
                Value::Object(out)
            }
            Value::Stream(stream) => Value::Stream(f(stream)?),
        })
    }

    /// Visit every embedded stream without rebuilding the graph.
    pub fn for_each_stream<F>(&self, f: &mut F)
    where
        F: FnMut(&S),
    {
        match self {
            Value::Array(items) => items.iter().for_each(|item| item.for_each_stream(f)),
            Value::Object(map) => map.values().for_each(|item| item.for_each_stream(f)),
            Value::Stream(stream) => f(stream),
            _ => {}
        }
    }

    /// Copy this value into a [`PlainValue`], or `None` if it embeds a stream.
    pub fn to_plain(&self) -> Option<PlainValue> {
        self.try_map_streams(&mut |_| Err(())).ok()
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Value::Absent)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value<S>]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value<S>>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_stream(&self) -> Option<&S> {
        match self {
            Value::Stream(stream) => Some(stream),
            _ => None,
        }
    }

    /// Look up a key in an object value.
    pub fn get(&self, key: &str) -> Option<&Value<S>> {
        self.as_object().and_then(|map| map.get(key))
    }

    /// Build an object from key/value pairs.
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value<S>)>,
    {
        Value::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl PlainValue {
    /// Widen into a value graph of any stream representation.
    pub fn widen<S>(&self) -> Value<S> {
        match self.try_map_streams::<S, Infallible, _>(&mut |never| match *never {}) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Size of this value for buffer accounting in byte mode.
    pub fn byte_len(&self) -> usize {
        match self {
            Value::Bytes(b) => b.len(),
            Value::String(s) => s.len(),
            _ => 0,
        }
    }
}

impl<S> From<bool> for Value<S> {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl<S> From<i64> for Value<S> {
    fn from(value: i64) -> Self {
        Value::Number(value.into())
    }
}

impl<S> From<u64> for Value<S> {
    fn from(value: u64) -> Self {
        Value::Number(value.into())
    }
}

impl<S> From<i32> for Value<S> {
    fn from(value: i32) -> Self {
        Value::Number(value.into())
    }
}

impl<S> From<f64> for Value<S> {
    fn from(value: f64) -> Self {
        Number::from_f64(value).map_or(Value::Null, Value::Number)
    }
}

impl<S> From<&str> for Value<S> {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl<S> From<String> for Value<S> {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl<S> From<Bytes> for Value<S> {
    fn from(value: Bytes) -> Self {
        Value::Bytes(value)
    }
}

impl<S> From<Vec<u8>> for Value<S> {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(Bytes::from(value))
    }
}

impl<S> From<&[u8]> for Value<S> {
    fn from(value: &[u8]) -> Self {
        Value::Bytes(Bytes::copy_from_slice(value))
    }
}

impl<S> From<Vec<Value<S>>> for Value<S> {
    fn from(value: Vec<Value<S>>) -> Self {
        Value::Array(value)
    }
}

impl<S> From<Option<Value<S>>> for Value<S> {
    fn from(value: Option<Value<S>>) -> Self {
        value.unwrap_or(Value::Absent)
    }
}

impl<S> From<serde_json::Value> for Value<S> {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}
