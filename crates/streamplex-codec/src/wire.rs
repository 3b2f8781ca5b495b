//! Serde form of wire values.
//!
//! This is what a text transport puts on the wire:
//! - a descriptor is the object `{"id": "<id>", "options": {...}}` with the
//!   camelCase option keys that were set
//! - frames are plain objects, so they keep their `streamId`/`type`/`payload`/
//!   `encoding` keys
//! - `Absent` is left out of objects and written as `null` everywhere else
//! - `Bytes` use `serialize_bytes`: native binary where the format has it,
//!   an array of numbers in JSON
//!
//! Reading back, an object with exactly the keys `id` (a string) and
//! `options` (valid stream options) is taken for a descriptor.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use serde_json::Number;

use crate::descriptor::{StreamDescriptor, StreamOptions};
use crate::value::{Value, WireValue};

const KEY_ID: &str = "id";
const KEY_OPTIONS: &str = "options";

impl<T: Serialize> Serialize for Value<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Absent | Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => n.serialize(serializer),
            Value::String(s) => serializer.serialize_str(s),
            Value::Bytes(b) => serializer.serialize_bytes(b),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Object(map) => {
                let present = map.values().filter(|item| !item.is_absent()).count();
                let mut out = serializer.serialize_map(Some(present))?;
                for (key, item) in map.iter().filter(|(_, item)| !item.is_absent()) {
                    out.serialize_entry(key, item)?;
                }
                out.end()
            }
            Value::Stream(stream) => stream.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for WireValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(WireValueVisitor)
    }
}

struct WireValueVisitor;

impl<'de> Visitor<'de> for WireValueVisitor {
    type Value = WireValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an event argument")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<WireValue, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<WireValue, E> {
        Ok(Value::Number(v.into()))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<WireValue, E> {
        Ok(Value::Number(v.into()))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<WireValue, E> {
        Number::from_f64(v)
            .map(Value::Number)
            .ok_or_else(|| E::custom("non-finite number"))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<WireValue, E> {
        Ok(Value::String(v.to_owned()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<WireValue, E> {
        Ok(Value::String(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<WireValue, E> {
        Ok(Value::Bytes(Bytes::copy_from_slice(v)))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<WireValue, E> {
        Ok(Value::Bytes(Bytes::from(v)))
    }

    fn visit_unit<E: de::Error>(self) -> Result<WireValue, E> {
        Ok(Value::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<WireValue, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<WireValue, D::Error> {
        WireValue::deserialize(deserializer)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<WireValue, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(1024));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<WireValue, A::Error> {
        let mut map = BTreeMap::new();
        while let Some((key, item)) = access.next_entry::<String, WireValue>()? {
            map.insert(key, item);
        }
        Ok(match descriptor(&map) {
            Some(descriptor) => Value::Stream(descriptor),
            None => Value::Object(map),
        })
    }
}

fn descriptor(map: &BTreeMap<String, WireValue>) -> Option<StreamDescriptor> {
    if map.len() != 2 {
        return None;
    }
    let id = map.get(KEY_ID)?.as_str()?;
    let options = stream_options(map.get(KEY_OPTIONS)?.as_object()?)?;
    Some(StreamDescriptor::new(id, options))
}

fn stream_options(map: &BTreeMap<String, WireValue>) -> Option<StreamOptions> {
    let mut options = StreamOptions::new();
    for (key, value) in map {
        match (key.as_str(), value) {
            ("highWaterMark", Value::Number(n)) => {
                options.high_water_mark = Some(usize::try_from(n.as_u64()?).ok()?);
            }
            ("objectMode", Value::Bool(b)) => options.object_mode = Some(*b),
            ("allowHalfOpen", Value::Bool(b)) => options.allow_half_open = Some(*b),
            _ => return None,
        }
    }
    Some(options)
}
