#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use streamplex_channel::{ChannelEvent, MemoryChannel, MessageChannel};
use streamplex_codec::{MuxFrame, Value, WireValue, MUX_EVENT};
use streamplex_session::{
    pipe, pipe_reader, DuplexStream, IncomingEvent, Multiplexer, SessionValue, StreamEvent,
};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Await `fut`, failing the test if it takes too long.
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(TIMEOUT, fut)
        .await
        .expect("operation should finish before the timeout")
}

pub async fn wait_until(cond: impl Fn() -> bool) {
    within(async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

/// Collect every occurrence of `event` on `mux`.
pub fn events(mux: &Multiplexer, event: &str) -> mpsc::UnboundedReceiver<IncomingEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    mux.on(event, move |incoming| {
        let _ = tx.send(incoming);
    });
    rx
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<IncomingEvent>) -> IncomingEvent {
    within(rx.recv())
        .await
        .expect("listener channel should stay open")
}

pub async fn read_all(stream: &DuplexStream) -> Vec<u8> {
    let mut reader = stream.clone();
    let mut buf = Vec::new();
    within(reader.read_to_end(&mut buf))
        .await
        .expect("stream should read to end");
    buf
}

pub async fn read_string(stream: &DuplexStream) -> String {
    String::from_utf8(read_all(stream).await).expect("stream data should be utf-8")
}

/// SHA-256 of `data`, hex encoded.
pub fn digest(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Replace every stream with a fresh one fed from it.
pub fn echo(value: &SessionValue) -> SessionValue {
    match value {
        Value::Stream(src) => {
            let dst = DuplexStream::with_options(src.options());
            let (from, to) = (src.clone(), dst.clone());
            tokio::spawn(async move {
                let _ = pipe(&from, &to).await;
            });
            Value::Stream(dst)
        }
        Value::Array(items) => Value::Array(items.iter().map(echo).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), echo(item)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Pipe every stream into itself.
pub fn send_back(value: &SessionValue) {
    value.for_each_stream(&mut |stream: &DuplexStream| {
        let stream = stream.clone();
        tokio::spawn(async move {
            let _ = pipe(&stream, &stream).await;
        });
    });
}

/// A session answering the test events on `channel`.
pub fn serve(channel: &Arc<MemoryChannel>) -> Multiplexer {
    let server = Multiplexer::lookup(channel).expect("server session should start");

    let echo_session = server.clone();
    server.on("echo", move |incoming| {
        let args = incoming.args.iter().map(echo).collect();
        echo_session
            .emit("echo", args)
            .expect("echo emit should succeed");
    });

    server.on("sendBack", |incoming| {
        incoming.args.iter().for_each(send_back);
    });

    server.on("multi", |incoming| {
        let (Some(first), Some(second)) = (incoming.stream(0), incoming.stream(1)) else {
            return;
        };
        tokio::spawn(async move {
            let _ = pipe(&first, &second).await;
        });
    });

    server.on("ack", |incoming| {
        let args = incoming.args.iter().map(echo).collect();
        if let Some(ack) = incoming.ack {
            ack.send(args).expect("ack should be sent");
        }
    });

    server.on("clientError", |incoming| {
        let (Some(stream), Some(ack)) = (incoming.stream(0), incoming.ack) else {
            return;
        };
        let mut events = stream.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let StreamEvent::Error(err) = event {
                    let _ = ack.send(vec![Value::from(err.message())]);
                    break;
                }
            }
        });
    });

    server.on("serverError", |incoming| {
        let message = incoming
            .arg(1)
            .and_then(Value::as_str)
            .unwrap_or("server error")
            .to_string();
        if let Some(stream) = incoming.stream(0) {
            stream.fail(message);
        }
    });

    server.on("read", |incoming| {
        let (Some(stream), Some(path), Some(ack)) = (
            incoming.stream(0),
            incoming.arg(1).and_then(Value::as_str).map(str::to_string),
            incoming.ack,
        ) else {
            return;
        };
        tokio::spawn(async move {
            let data = tokio::fs::read(&path).await.expect("file should be readable");
            pipe_reader(&data[..], &stream)
                .await
                .expect("file should be piped");
            let _ = ack.send(vec![Value::from(digest(&data))]);
        });
    });

    server.on("checksum", |incoming| {
        let (Some(stream), Some(ack)) = (incoming.stream(0), incoming.ack) else {
            return;
        };
        tokio::spawn(async move {
            let data = read_all(&stream).await;
            let _ = ack.send(vec![Value::from(digest(&data))]);
        });
    });

    server
}

/// The far end of a channel, speaking raw frames.
pub struct RawPeer {
    pub channel: Arc<MemoryChannel>,
    inbox: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl RawPeer {
    pub fn new(channel: Arc<MemoryChannel>) -> Self {
        let inbox = channel
            .take_events()
            .expect("raw peer should own the channel events");
        Self { channel, inbox }
    }

    pub fn emit(&self, event: &str, args: Vec<WireValue>) {
        self.channel
            .send(event, args, None)
            .expect("raw send should succeed");
    }

    pub fn send_frame(&self, frame: MuxFrame) {
        self.emit(MUX_EVENT, vec![frame.into_value(false)]);
    }

    pub async fn next_message(&mut self) -> (String, Vec<WireValue>) {
        match within(self.inbox.recv()).await {
            Some(ChannelEvent::Message { event, args, .. }) => (event, args),
            other => panic!("expected a message, got {other:?}"),
        }
    }

    /// Next frame, with the raw wire value it was parsed from.
    pub async fn next_raw_frame(&mut self) -> (MuxFrame, WireValue) {
        let (event, mut args) = self.next_message().await;
        assert_eq!(event, MUX_EVENT);
        let value = args.remove(0);
        let frame = MuxFrame::from_value(&value).expect("frame should parse");
        (frame, value)
    }

    pub async fn next_frame(&mut self) -> MuxFrame {
        self.next_raw_frame().await.0
    }

    /// A message already waiting, if any.
    pub fn try_message(&mut self) -> Option<(String, Vec<WireValue>)> {
        match self.inbox.try_recv() {
            Ok(ChannelEvent::Message { event, args, .. }) => Some((event, args)),
            _ => None,
        }
    }
}

/// Wait until `mux` has processed everything `peer` sent so far.
pub async fn sync(mux: &Multiplexer, peer: &RawPeer) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    mux.once("sync", move |_| {
        let _ = tx.send(());
    });
    peer.emit("sync", Vec::new());
    within(rx.recv()).await;
}
