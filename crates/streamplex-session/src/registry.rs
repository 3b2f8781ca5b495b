use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::stream::DuplexStream;

/// Streams of one session, keyed by stream id.
///
/// The lock is only held for the duration of a single map operation and is
/// never taken while a stream's own state is locked.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: Mutex<HashMap<String, DuplexStream>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, DuplexStream>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a stream. Returns false if the id was already taken.
    pub fn insert(&self, stream: DuplexStream) -> bool {
        let mut map = self.map();
        if map.contains_key(stream.id()) {
            return false;
        }
        tracing::debug!(stream_id = stream.id(), "stream registered");
        map.insert(stream.id().to_string(), stream);
        true
    }

    pub fn get(&self, id: &str) -> Option<DuplexStream> {
        self.map().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<DuplexStream> {
        let removed = self.map().remove(id);
        if removed.is_some() {
            tracing::debug!(stream_id = id, "stream deregistered");
        }
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.map().contains_key(id)
    }

    /// Remove and return every registered stream.
    pub fn drain(&self) -> Vec<DuplexStream> {
        self.map().drain().map(|(_, stream)| stream).collect()
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    /// Registered ids in sorted order.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.map().keys().cloned().collect();
        ids.sort();
        ids
    }
}
