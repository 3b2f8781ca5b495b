//! The per-channel session.
//!
//! A session owns the stream registry of one channel and a driver task that
//! consumes the channel's events in order:
//! - frames on the reserved event are routed to the matching stream
//! - application events are decoded (materializing remote streams) and
//!   handed to listeners
//! - acknowledgment replies run their callback
//! - `connect-error` goes to error listeners, `disconnect` tears everything down

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError, Weak};

use streamplex_channel::{
    AckCallback, ChannelError, ChannelEvent, ChannelId, MessageChannel, DISCONNECT,
};
use streamplex_codec::{
    Decoder, Direction, Encoder, MuxFrame, StreamDescriptor, StreamResolver, Value, WireValue,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::config::MuxConfig;
use crate::error::{MuxError, Result, StreamError};
use crate::listener::{Acknowledger, IncomingEvent, ListenerId, Listeners};
use crate::registry::StreamRegistry;
use crate::stream::DuplexStream;
use crate::SessionValue;

type SessionCache = HashMap<ChannelId, Weak<MuxInner>>;

static SESSIONS: LazyLock<Mutex<SessionCache>> = LazyLock::new(Mutex::default);

fn sessions() -> MutexGuard<'static, SessionCache> {
    SESSIONS.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct MuxInner {
    channel: Arc<dyn MessageChannel>,
    config: MuxConfig,
    force_base64: bool,
    pub(crate) registry: StreamRegistry,
    listeners: Listeners,
    emit_lock: Mutex<()>,
    disconnected: AtomicBool,
}

impl MuxInner {
    pub(crate) fn send_frame(&self, frame: MuxFrame) -> std::result::Result<(), ChannelError> {
        let value = frame.into_value(self.force_base64);
        self.channel
            .send(&self.config.reserved_event, vec![value], None)
    }

    /// Encode `args`, register and bind newly discovered local streams, hand
    /// the encoded arguments to `send` and mark the streams as sent.
    ///
    /// Runs under the emit lock, so a stream can never be sent twice by
    /// concurrent emits.
    pub(crate) fn dispatch_outgoing<F>(
        self: &Arc<Self>,
        args: &[SessionValue],
        send: F,
    ) -> Result<()>
    where
        F: FnOnce(Vec<WireValue>) -> Result<()>,
    {
        let _guard = self.emit_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut discovered = Vec::new();
        let wire = Encoder::new().encode_all(args, |stream: &DuplexStream| {
            if stream.direction() == Direction::Local {
                discovered.push(stream.clone());
            }
        })?;

        let mux = Arc::downgrade(self);
        for stream in &discovered {
            self.registry.insert(stream.clone());
            stream.bind(mux.clone());
        }
        if let Err(err) = send(wire) {
            for stream in &discovered {
                stream.unbind();
                self.registry.remove(stream.id());
            }
            return Err(err);
        }

        for stream in discovered {
            stream.attach();
        }
        Ok(())
    }

    pub(crate) fn decode_args(self: &Arc<Self>, args: &[WireValue]) -> Vec<SessionValue> {
        let mut resolver = RegistryResolver { mux: self };
        Decoder::new().decode_all(args, &mut resolver, |stream: &DuplexStream| {
            debug!(stream_id = stream.id(), "remote stream opened");
        })
    }

    fn dispatch(self: &Arc<Self>, event: String, args: Vec<WireValue>, ack: Option<AckCallback>) {
        if event == self.config.reserved_event {
            match args.first() {
                Some(frame) => self.route_frame(frame),
                None => debug!("empty stream frame dropped"),
            }
            return;
        }

        let args = self.decode_args(&args);
        let ack = ack.map(|callback| Acknowledger::new(Arc::downgrade(self), callback));
        let incoming = IncomingEvent { event, args, ack };

        let callbacks = self.listeners.take_for(&incoming.event);
        if callbacks.is_empty() {
            trace!(event = %incoming.event, "no listener for event");
        }
        for callback in callbacks {
            callback(incoming.clone());
        }
    }

    fn route_frame(&self, value: &WireValue) {
        let frame = match MuxFrame::from_value(value) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(error = %err, "malformed stream frame dropped");
                return;
            }
        };
        match self.registry.get(&frame.stream_id) {
            Some(stream) => stream.handle_frame(frame),
            None => debug!(
                stream_id = %frame.stream_id,
                frame = %frame.kind,
                "frame for unknown stream dropped"
            ),
        }
    }

    fn connect_failed(&self, reason: String) {
        warn!(channel = %self.channel.id(), reason = %reason, "channel failed to connect");
        let err = MuxError::Connection(reason);
        for callback in self.listeners.error_callbacks() {
            callback(&err);
        }
    }

    /// Destroy every registered stream and drop the cache entry.
    fn teardown(self: &Arc<Self>, reason: &str) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }

        let id = self.channel.id();
        {
            let mut sessions = sessions();
            let cached = sessions
                .get(&id)
                .is_some_and(|entry| entry.as_ptr() == Arc::as_ptr(self));
            if cached {
                sessions.remove(&id);
            }
        }

        let streams = self.registry.drain();
        info!(channel = %id, streams = streams.len(), reason, "session disconnected");
        for stream in streams {
            stream.abort(StreamError::Disconnected(reason.to_string()));
        }

        let incoming = IncomingEvent {
            event: DISCONNECT.to_string(),
            args: vec![Value::from(reason)],
            ack: None,
        };
        for callback in self.listeners.take_for(DISCONNECT) {
            callback(incoming.clone());
        }
    }
}

struct RegistryResolver<'a> {
    mux: &'a Arc<MuxInner>,
}

impl StreamResolver for RegistryResolver<'_> {
    type Stream = DuplexStream;

    fn lookup(&mut self, id: &str) -> Option<DuplexStream> {
        self.mux.registry.get(id)
    }

    fn materialize(&mut self, descriptor: &StreamDescriptor) -> DuplexStream {
        let stream = DuplexStream::remote(descriptor, Arc::downgrade(self.mux));
        self.mux.registry.insert(stream.clone());
        stream
    }
}

async fn drive(mux: Arc<MuxInner>, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Message { event, args, ack } => mux.dispatch(event, args, ack),
            ChannelEvent::Ack { callback, args } => callback(args),
            ChannelEvent::ConnectError(reason) => mux.connect_failed(reason),
            ChannelEvent::Disconnect(reason) => {
                mux.teardown(&reason);
                break;
            }
        }
    }
    mux.teardown("channel closed");
    debug!(channel = %mux.channel.id(), "session driver stopped");
}

/// Stream multiplexer for one message channel.
///
/// Handles are cheap to clone. Looking up the same channel again returns the
/// same session until the channel disconnects.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MuxInner>,
}

impl Multiplexer {
    /// Session for `channel` with the default configuration.
    pub fn lookup<C: MessageChannel>(channel: &Arc<C>) -> Result<Self> {
        Self::lookup_with_config(channel, MuxConfig::default())
    }

    /// Session for `channel`, created with `config` if none exists yet.
    ///
    /// Must be called from within a tokio runtime, which runs the session's
    /// driver task.
    pub fn lookup_with_config<C: MessageChannel>(
        channel: &Arc<C>,
        config: MuxConfig,
    ) -> Result<Self> {
        config.validate()?;
        let id = channel.id();

        let mut sessions = sessions();
        if let Some(inner) = sessions.get(&id).and_then(Weak::upgrade) {
            if inner.config != config {
                debug!(channel = %id, "session already exists, configuration ignored");
            }
            return Ok(Self { inner });
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| MuxError::NoRuntime)?;
        let events = channel.take_events().ok_or(ChannelError::EventsTaken)?;
        let channel: Arc<dyn MessageChannel> = channel.clone();
        let force_base64 = config.force_base64 || !channel.supports_binary();

        let inner = Arc::new(MuxInner {
            channel,
            config,
            force_base64,
            registry: StreamRegistry::new(),
            listeners: Listeners::default(),
            emit_lock: Mutex::new(()),
            disconnected: AtomicBool::new(false),
        });
        sessions.insert(id, Arc::downgrade(&inner));
        runtime.spawn(drive(Arc::clone(&inner), events));

        info!(channel = %id, force_base64, "session started");
        Ok(Self { inner })
    }

    fn check_event(&self, event: &str) -> Result<()> {
        if event == self.inner.config.reserved_event {
            return Err(MuxError::ReservedEvent(event.to_string()));
        }
        if self.is_disconnected() {
            return Err(MuxError::Disconnected("channel dropped".to_string()));
        }
        Ok(())
    }

    /// Send an event. Streams anywhere in `args` become live on the peer.
    ///
    /// Fails without sending anything if a stream is destroyed or was already
    /// sent, or if `event` is the reserved frame event.
    pub fn emit(&self, event: &str, args: Vec<SessionValue>) -> Result<()> {
        self.check_event(event)?;
        let channel = &self.inner.channel;
        self.inner.dispatch_outgoing(&args, |wire| {
            channel.send(event, wire, None).map_err(MuxError::from)
        })?;
        debug!(event, "event emitted");
        Ok(())
    }

    /// Send an event and wait for the peer's acknowledgment.
    ///
    /// The returned future resolves to the decoded reply arguments.
    pub fn emit_with_ack(
        &self,
        event: &str,
        args: Vec<SessionValue>,
    ) -> Result<impl Future<Output = Result<Vec<SessionValue>>> + Send + 'static> {
        self.check_event(event)?;
        let (tx, rx) = oneshot::channel();
        let mux = Arc::downgrade(&self.inner);
        let callback: AckCallback = Box::new(move |args| {
            if let Some(mux) = mux.upgrade() {
                let _ = tx.send(mux.decode_args(&args));
            }
        });

        let channel = &self.inner.channel;
        self.inner.dispatch_outgoing(&args, |wire| {
            channel
                .send(event, wire, Some(callback))
                .map_err(MuxError::from)
        })?;
        debug!(event, "event emitted, awaiting acknowledgment");
        Ok(async move { rx.await.map_err(|_| MuxError::AckDropped) })
    }

    /// Listen for an application event (or `"disconnect"`).
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(IncomingEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.add(event, false, Arc::new(listener))
    }

    /// Listen for the next occurrence of an event only.
    pub fn once<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(IncomingEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.add(event, true, Arc::new(listener))
    }

    /// Listen for session errors such as a failed connect.
    pub fn on_error<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&MuxError) + Send + Sync + 'static,
    {
        self.inner.listeners.add_error(Arc::new(listener))
    }

    pub fn remove_listener(&self, event: &str, id: ListenerId) -> bool {
        self.inner.listeners.remove(event, id)
    }

    /// Remove the listeners of `event`, or of every event with `None`.
    pub fn remove_all_listeners(&self, event: Option<&str>) {
        self.inner.listeners.remove_all(event);
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.inner.listeners.count(event)
    }

    /// Drop a stream from the registry without touching its state.
    pub fn cleanup(&self, id: &str) -> bool {
        self.inner.registry.remove(id).is_some()
    }

    pub fn stream(&self, id: &str) -> Option<DuplexStream> {
        self.inner.registry.get(id)
    }

    pub fn stream_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn stream_ids(&self) -> Vec<String> {
        self.inner.registry.ids()
    }

    pub fn config(&self) -> &MuxConfig {
        &self.inner.config
    }

    pub fn channel_id(&self) -> ChannelId {
        self.inner.channel.id()
    }

    /// True when DATA payloads are base64 encoded on this session.
    pub fn uses_base64(&self) -> bool {
        self.inner.force_base64
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.disconnected.load(Ordering::SeqCst)
    }
}

impl PartialEq for Multiplexer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Multiplexer {}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("channel", &self.inner.channel.id())
            .field("config", &self.inner.config)
            .field("streams", &self.inner.registry.len())
            .finish()
    }
}
