//! An in-process client/server session pair used by the loopback commands.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use streamplex_channel::{AckCallback, ChannelEvent, ChannelId, MemoryChannel, MessageChannel};
use streamplex_codec::{StreamOptions, Value, WireValue};
use streamplex_session::{pipe, DuplexStream, Multiplexer, MuxConfig, SessionValue};
use tokio::sync::mpsc;

use crate::cmd::LoopbackArgs;
use crate::exit::{mux_error, CliResult};

/// Event answered by the loopback server.
pub const ECHO_EVENT: &str = "echo";

/// Channel wrapper counting what a session sends.
pub struct CountingChannel {
    inner: Arc<MemoryChannel>,
    reserved_event: String,
    frames: AtomicU64,
    events: AtomicU64,
}

impl CountingChannel {
    fn new(inner: Arc<MemoryChannel>, reserved_event: &str) -> Arc<Self> {
        Arc::new(Self {
            inner,
            reserved_event: reserved_event.to_string(),
            frames: AtomicU64::new(0),
            events: AtomicU64::new(0),
        })
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }
}

impl MessageChannel for CountingChannel {
    fn id(&self) -> ChannelId {
        self.inner.id()
    }

    fn send(
        &self,
        event: &str,
        args: Vec<WireValue>,
        ack: Option<AckCallback>,
    ) -> streamplex_channel::Result<()> {
        self.inner.send(event, args, ack)?;
        if event == self.reserved_event {
            self.frames.fetch_add(1, Ordering::Relaxed);
        } else {
            self.events.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.inner.take_events()
    }

    fn supports_binary(&self) -> bool {
        self.inner.supports_binary()
    }
}

/// Client and server sessions joined by a memory channel pair.
pub struct Loopback {
    pub client: Multiplexer,
    pub server: Multiplexer,
    client_link: Arc<CountingChannel>,
    server_link: Arc<CountingChannel>,
    memory: Arc<MemoryChannel>,
    options: StreamOptions,
}

impl Loopback {
    /// Start both sessions. Must run inside a tokio runtime.
    pub fn start(args: &LoopbackArgs) -> CliResult<Self> {
        let (a, b) = MemoryChannel::pair_with_binary(!args.text_only);
        let config = MuxConfig::default().with_force_base64(args.force_base64);

        let client_link = CountingChannel::new(Arc::clone(&a), &config.reserved_event);
        let server_link = CountingChannel::new(b, &config.reserved_event);
        let client = Multiplexer::lookup_with_config(&client_link, config.clone())
            .map_err(|err| mux_error("client session failed", err))?;
        let server = Multiplexer::lookup_with_config(&server_link, config)
            .map_err(|err| mux_error("server session failed", err))?;

        let replies = server.clone();
        server.on(ECHO_EVENT, move |incoming| {
            let args: Vec<SessionValue> = incoming.args.iter().map(echo_value).collect();
            let sent = match incoming.ack {
                Some(ack) => ack.send(args).map(|_| ()),
                None => replies.emit(ECHO_EVENT, args),
            };
            if let Err(err) = sent {
                tracing::warn!(error = %err, "echo reply failed");
            }
        });

        let mut options = StreamOptions::default();
        if let Some(hwm) = args.high_water_mark {
            options = options.with_high_water_mark(hwm);
        }

        tracing::debug!(
            channel = %client.channel_id(),
            base64 = client.uses_base64(),
            "loopback sessions started"
        );
        Ok(Self {
            client,
            server,
            client_link,
            server_link,
            memory: a,
            options,
        })
    }

    /// A new stream carrying the configured options.
    pub fn stream(&self) -> DuplexStream {
        DuplexStream::with_options(self.options)
    }

    /// Multiplex frames sent by both sides.
    pub fn frames(&self) -> u64 {
        self.client_link.frames() + self.server_link.frames()
    }

    /// Application events sent by both sides. Acknowledgment replies travel
    /// through the channel's callback and are not counted.
    pub fn events(&self) -> u64 {
        self.client_link.events() + self.server_link.events()
    }

    pub fn uses_base64(&self) -> bool {
        self.client.uses_base64()
    }

    /// Streams still registered on either side.
    pub fn open_streams(&self) -> usize {
        self.client.stream_count() + self.server.stream_count()
    }

    /// Wait until both registries are empty.
    pub async fn settled(&self) {
        while self.open_streams() > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    /// Drop the channel, tearing down both sessions.
    pub fn shutdown(&self) {
        self.memory.disconnect();
    }
}

/// Replace every stream in `value` with a fresh stream fed from it.
fn echo_value(value: &SessionValue) -> SessionValue {
    match value {
        Value::Stream(src) => {
            let dst = DuplexStream::with_options(src.options());
            let (from, to) = (src.clone(), dst.clone());
            tokio::spawn(async move {
                if let Err(err) = pipe(&from, &to).await {
                    tracing::debug!(stream_id = from.id(), error = %err, "echo pipe failed");
                }
            });
            Value::Stream(dst)
        }
        Value::Array(items) => Value::Array(items.iter().map(echo_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), echo_value(item)))
                .collect(),
        ),
        other => other.clone(),
    }
}
