use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use streamplex_channel::{AckCallback, ERROR};

use crate::error::{MuxError, Result};
use crate::mux::MuxInner;
use crate::stream::DuplexStream;
use crate::SessionValue;

pub(crate) type EventCallback = Arc<dyn Fn(IncomingEvent) + Send + Sync + 'static>;
pub(crate) type ErrorCallback = Arc<dyn Fn(&MuxError) + Send + Sync + 'static>;

/// Handle returned when registering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// An application event received from the peer, with streams materialized.
#[derive(Clone)]
pub struct IncomingEvent {
    pub event: String,
    pub args: Vec<SessionValue>,
    /// Present when the peer asked for an acknowledgment.
    pub ack: Option<Acknowledger>,
}

impl IncomingEvent {
    pub fn arg(&self, index: usize) -> Option<&SessionValue> {
        self.args.get(index)
    }

    /// The stream passed directly as argument `index`.
    pub fn stream(&self, index: usize) -> Option<DuplexStream> {
        self.arg(index).and_then(|value| value.as_stream()).cloned()
    }

    /// Every stream embedded anywhere in the arguments.
    pub fn streams(&self) -> Vec<DuplexStream> {
        let mut streams = Vec::new();
        for arg in &self.args {
            arg.for_each_stream(&mut |stream: &DuplexStream| streams.push(stream.clone()));
        }
        streams
    }
}

impl fmt::Debug for IncomingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingEvent")
            .field("event", &self.event)
            .field("args", &self.args)
            .field("ack", &self.ack.is_some())
            .finish()
    }
}

/// Replies to an acknowledgment request.
///
/// Clones share the reply slot: only the first reply is sent.
#[derive(Clone)]
pub struct Acknowledger {
    mux: Weak<MuxInner>,
    callback: Arc<Mutex<Option<AckCallback>>>,
}

impl Acknowledger {
    pub(crate) fn new(mux: Weak<MuxInner>, callback: AckCallback) -> Self {
        Self {
            mux,
            callback: Arc::new(Mutex::new(Some(callback))),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<AckCallback>> {
        self.callback.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send the reply. Streams in `args` are announced like in an emit.
    ///
    /// Returns `Ok(false)` if a reply was already sent.
    pub fn send(&self, args: Vec<SessionValue>) -> Result<bool> {
        let mux = self
            .mux
            .upgrade()
            .ok_or_else(|| MuxError::Disconnected("session dropped".to_string()))?;
        let Some(callback) = self.slot().take() else {
            return Ok(false);
        };

        let mut pending = Some(callback);
        let result = mux.dispatch_outgoing(&args, |wire| {
            if let Some(callback) = pending.take() {
                callback(wire);
            }
            Ok(())
        });
        if let Some(callback) = pending {
            *self.slot() = Some(callback);
        }
        result.map(|()| true)
    }

    pub fn is_answered(&self) -> bool {
        self.slot().is_none()
    }
}

impl fmt::Debug for Acknowledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acknowledger")
            .field("answered", &self.is_answered())
            .finish()
    }
}

struct Entry {
    id: ListenerId,
    once: bool,
    callback: EventCallback,
}

/// Listener table of a session. `"error"` listeners take the session error.
#[derive(Default)]
pub(crate) struct Listeners {
    events: Mutex<HashMap<String, Vec<Entry>>>,
    errors: Mutex<Vec<(ListenerId, ErrorCallback)>>,
}

impl Listeners {
    fn events(&self) -> MutexGuard<'_, HashMap<String, Vec<Entry>>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn errors(&self) -> MutexGuard<'_, Vec<(ListenerId, ErrorCallback)>> {
        self.errors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add(&self, event: &str, once: bool, callback: EventCallback) -> ListenerId {
        let id = ListenerId::next();
        self.events()
            .entry(event.to_string())
            .or_default()
            .push(Entry { id, once, callback });
        id
    }

    pub(crate) fn add_error(&self, callback: ErrorCallback) -> ListenerId {
        let id = ListenerId::next();
        self.errors().push((id, callback));
        id
    }

    pub(crate) fn remove(&self, event: &str, id: ListenerId) -> bool {
        if event == ERROR {
            let mut errors = self.errors();
            let before = errors.len();
            errors.retain(|(entry, _)| *entry != id);
            return errors.len() != before;
        }
        let mut events = self.events();
        let Some(entries) = events.get_mut(event) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            events.remove(event);
        }
        removed
    }

    pub(crate) fn remove_all(&self, event: Option<&str>) {
        match event {
            None => {
                self.events().clear();
                self.errors().clear();
            }
            Some(ERROR) => self.errors().clear(),
            Some(event) => {
                self.events().remove(event);
            }
        }
    }

    /// Callbacks to run for `event`; once-listeners are removed.
    pub(crate) fn take_for(&self, event: &str) -> Vec<EventCallback> {
        let mut events = self.events();
        let Some(entries) = events.get_mut(event) else {
            return Vec::new();
        };
        let callbacks = entries.iter().map(|entry| Arc::clone(&entry.callback)).collect();
        entries.retain(|entry| !entry.once);
        if entries.is_empty() {
            events.remove(event);
        }
        callbacks
    }

    pub(crate) fn error_callbacks(&self) -> Vec<ErrorCallback> {
        self.errors()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect()
    }

    pub(crate) fn count(&self, event: &str) -> usize {
        if event == ERROR {
            return self.errors().len();
        }
        self.events().get(event).map_or(0, Vec::len)
    }
}
