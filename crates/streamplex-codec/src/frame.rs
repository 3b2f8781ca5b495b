//! Multiplex sub-protocol frames.
//!
//! Every per-stream control or data message travels as the single argument
//! of the reserved [`MUX_EVENT`]:
//!
//! ```text
//! { "streamId": "<id>", "type": "DATA" | "END" | "ERROR" | "PAUSE" | "RESUME",
//!   "payload": <chunk or error message>,   // DATA and ERROR only
//!   "encoding": "base64" }                 // DATA only, when base64 encoded
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;

use crate::error::{CodecError, Result};
use crate::value::{PlainValue, Value, WireValue};

/// Reserved event name carrying all multiplex frames.
pub const MUX_EVENT: &str = "$stream";

/// Marker placed in the `encoding` field of base64 DATA frames.
pub const BASE64_ENCODING: &str = "base64";

const KEY_STREAM_ID: &str = "streamId";
const KEY_TYPE: &str = "type";
const KEY_PAYLOAD: &str = "payload";
const KEY_ENCODING: &str = "encoding";

/// Frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// A chunk of stream data.
    Data,
    /// The sender finished its writable side.
    End,
    /// The sender's side failed; payload is the message.
    Error,
    /// The receiver's read buffer is full; stop sending DATA.
    Pause,
    /// The receiver's read buffer drained; DATA may flow again.
    Resume,
}

impl FrameKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameKind::Data => "DATA",
            FrameKind::End => "END",
            FrameKind::Error => "ERROR",
            FrameKind::Pause => "PAUSE",
            FrameKind::Resume => "RESUME",
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FrameKind {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DATA" => Ok(FrameKind::Data),
            "END" => Ok(FrameKind::End),
            "ERROR" => Ok(FrameKind::Error),
            "PAUSE" => Ok(FrameKind::Pause),
            "RESUME" => Ok(FrameKind::Resume),
            other => Err(CodecError::UnknownFrameKind(other.to_string())),
        }
    }
}

/// A per-stream frame of the multiplex sub-protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct MuxFrame {
    pub stream_id: String,
    pub kind: FrameKind,
    pub payload: Option<PlainValue>,
}

impl MuxFrame {
    pub fn data(stream_id: impl Into<String>, chunk: PlainValue) -> Self {
        Self {
            stream_id: stream_id.into(),
            kind: FrameKind::Data,
            payload: Some(chunk),
        }
    }

    pub fn end(stream_id: impl Into<String>) -> Self {
        Self::control(stream_id, FrameKind::End)
    }

    pub fn error(stream_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            kind: FrameKind::Error,
            payload: Some(Value::String(message.into())),
        }
    }

    pub fn pause(stream_id: impl Into<String>) -> Self {
        Self::control(stream_id, FrameKind::Pause)
    }

    pub fn resume(stream_id: impl Into<String>) -> Self {
        Self::control(stream_id, FrameKind::Resume)
    }

    fn control(stream_id: impl Into<String>, kind: FrameKind) -> Self {
        Self {
            stream_id: stream_id.into(),
            kind,
            payload: None,
        }
    }

    /// Message of an ERROR frame. Non-string payloads yield a generic message.
    pub fn error_message(&self) -> Option<&str> {
        if self.kind != FrameKind::Error {
            return None;
        }
        Some(
            self.payload
                .as_ref()
                .and_then(Value::as_str)
                .unwrap_or("remote stream error"),
        )
    }

    /// Build the wire argument for this frame.
    ///
    /// With `force_base64`, a binary DATA payload is sent as a base64 string
    /// and tagged with `"encoding": "base64"`.
    pub fn into_value(self, force_base64: bool) -> WireValue {
        let mut map = BTreeMap::new();
        map.insert(KEY_STREAM_ID.to_string(), Value::String(self.stream_id));
        map.insert(
            KEY_TYPE.to_string(),
            Value::String(self.kind.as_str().to_string()),
        );
        if let Some(payload) = self.payload {
            let payload = match payload {
                Value::Bytes(bytes) if force_base64 && self.kind == FrameKind::Data => {
                    map.insert(
                        KEY_ENCODING.to_string(),
                        Value::String(BASE64_ENCODING.to_string()),
                    );
                    Value::String(STANDARD.encode(&bytes))
                }
                other => other,
            };
            map.insert(KEY_PAYLOAD.to_string(), payload.widen());
        }
        Value::Object(map)
    }

    /// Parse a wire argument into a frame, decoding base64 DATA payloads.
    pub fn from_value(value: &WireValue) -> Result<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| CodecError::MalformedFrame("frame is not an object".to_string()))?;

        let stream_id = map
            .get(KEY_STREAM_ID)
            .and_then(Value::as_str)
            .ok_or_else(|| CodecError::MalformedFrame("missing streamId".to_string()))?;
        let kind: FrameKind = map
            .get(KEY_TYPE)
            .and_then(Value::as_str)
            .ok_or_else(|| CodecError::MalformedFrame("missing type".to_string()))?
            .parse()?;

        let payload = match map.get(KEY_PAYLOAD) {
            None | Some(Value::Absent) => None,
            Some(payload) => Some(payload.to_plain().ok_or_else(|| {
                CodecError::MalformedFrame("payload embeds a stream".to_string())
            })?),
        };

        let payload = match (map.get(KEY_ENCODING).and_then(Value::as_str), payload) {
            (Some(BASE64_ENCODING), Some(Value::String(text))) => {
                Some(Value::Bytes(Bytes::from(STANDARD.decode(text.as_bytes())?)))
            }
            (Some(other), _) if other != BASE64_ENCODING => {
                return Err(CodecError::MalformedFrame(format!(
                    "unsupported encoding '{other}'"
                )));
            }
            (_, payload) => payload,
        };

        if kind == FrameKind::Data && payload.is_none() {
            return Err(CodecError::MalformedFrame(
                "DATA frame without payload".to_string(),
            ));
        }

        Ok(Self {
            stream_id: stream_id.to_string(),
            kind,
            payload,
        })
    }
}
