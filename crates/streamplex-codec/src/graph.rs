use std::collections::HashSet;
use std::convert::Infallible;

use crate::descriptor::StreamDescriptor;
use crate::error::{CodecError, Result};
use crate::value::{Value, WireValue};

/// What the encoder needs to know about a live stream.
pub trait StreamHandle {
    /// Stable identifier of the stream.
    fn id(&self) -> &str;

    /// Placeholder sent in place of the stream.
    fn descriptor(&self) -> StreamDescriptor;

    fn is_destroyed(&self) -> bool;

    /// True once a locally created stream has been handed to a session.
    ///
    /// Streams materialized from a remote descriptor always return false.
    fn is_sent(&self) -> bool;
}

/// Turns descriptors back into streams during decoding.
pub trait StreamResolver {
    type Stream;

    /// Stream already known under `id`, if any.
    fn lookup(&mut self, id: &str) -> Option<Self::Stream>;

    /// Build (and register) a new stream for a descriptor that was not found.
    fn materialize(&mut self, descriptor: &StreamDescriptor) -> Self::Stream;
}

/// Replaces live streams with descriptors.
///
/// Stateless between calls. Within one call each distinct stream is
/// announced exactly once, even if it appears several times in the graph.
#[derive(Debug, Default, Clone, Copy)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a single value.
    pub fn encode<S: StreamHandle>(&self, value: &Value<S>) -> Result<WireValue> {
        self.encode_with(value, |_| {})
    }

    /// Encode a single value, calling `on_stream` for each discovered stream.
    pub fn encode_with<S, F>(&self, value: &Value<S>, mut on_stream: F) -> Result<WireValue>
    where
        S: StreamHandle,
        F: FnMut(&S),
    {
        let mut seen = HashSet::new();
        encode_value(value, &mut seen, &mut on_stream)
    }

    /// Encode a list of event arguments as one unit.
    ///
    /// Fails on the first destroyed or already sent stream; `on_stream` may
    /// have been called for streams found earlier in the walk.
    pub fn encode_all<S, F>(
        &self,
        values: &[Value<S>],
        mut on_stream: F,
    ) -> Result<Vec<WireValue>>
    where
        S: StreamHandle,
        F: FnMut(&S),
    {
        let mut seen = HashSet::new();
        values
            .iter()
            .map(|value| encode_value(value, &mut seen, &mut on_stream))
            .collect()
    }
}

fn encode_value<S, F>(
    value: &Value<S>,
    seen: &mut HashSet<String>,
    on_stream: &mut F,
) -> Result<WireValue>
where
    S: StreamHandle,
    F: FnMut(&S),
{
    value.try_map_streams(&mut |stream: &S| {
        if stream.is_destroyed() {
            return Err(CodecError::DestroyedStream {
                id: stream.id().to_string(),
            });
        }
        if stream.is_sent() {
            return Err(CodecError::AlreadySent {
                id: stream.id().to_string(),
            });
        }
        if seen.insert(stream.id().to_string()) {
            tracing::trace!(stream_id = stream.id(), "encoder discovered stream");
            on_stream(stream);
        }
        Ok(stream.descriptor())
    })
}

/// Replaces descriptors with streams obtained from a [`StreamResolver`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Decoder;

impl Decoder {
    pub fn new() -> Self {
        Self
    }

    /// Decode a single value.
    pub fn decode<R: StreamResolver>(
        &self,
        value: &WireValue,
        resolver: &mut R,
    ) -> Value<R::Stream> {
        self.decode_with(value, resolver, |_| {})
    }

    /// Decode a single value, calling `on_stream` for each newly materialized stream.
    pub fn decode_with<R, F>(
        &self,
        value: &WireValue,
        resolver: &mut R,
        mut on_stream: F,
    ) -> Value<R::Stream>
    where
        R: StreamResolver,
        F: FnMut(&R::Stream),
    {
        decode_value(value, resolver, &mut on_stream)
    }

    /// Decode a list of event arguments.
    pub fn decode_all<R, F>(
        &self,
        values: &[WireValue],
        resolver: &mut R,
        mut on_stream: F,
    ) -> Vec<Value<R::Stream>>
    where
        R: StreamResolver,
        F: FnMut(&R::Stream),
    {
        values
            .iter()
            .map(|value| decode_value(value, &mut *resolver, &mut on_stream))
            .collect()
    }
}

fn decode_value<R, F>(value: &WireValue, resolver: &mut R, on_stream: &mut F) -> Value<R::Stream>
where
    R: StreamResolver,
    F: FnMut(&R::Stream),
{
    let decoded = value.try_map_streams::<_, Infallible, _>(&mut |descriptor| {
        if let Some(existing) = resolver.lookup(&descriptor.id) {
            return Ok(existing);
        }
        let stream = resolver.materialize(descriptor);
        tracing::trace!(stream_id = %descriptor.id, "decoder materialized stream");
        on_stream(&stream);
        Ok(stream)
    });
    match decoded {
        Ok(value) => value,
        Err(never) => match never {},
    }
}
