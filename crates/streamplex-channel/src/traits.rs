use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use streamplex_codec::WireValue;
use tokio::sync::mpsc;

use crate::error::Result;

/// Lifecycle event: the connection attempt failed.
pub const CONNECT_ERROR: &str = "connect-error";
/// Lifecycle event: the connection dropped.
pub const DISCONNECT: &str = "disconnect";
/// Lifecycle event: the connection was established.
pub const CONNECT: &str = "connect";
/// Local error event of a session.
pub const ERROR: &str = "error";

/// Returns true if `event` is handled by the channel or session itself.
pub fn is_lifecycle_event(event: &str) -> bool {
    matches!(event, CONNECT_ERROR | DISCONNECT | CONNECT | ERROR)
}

/// Callback answering an acknowledgment request.
pub type AckCallback = Box<dyn FnOnce(Vec<WireValue>) + Send + 'static>;

/// Process-unique identity of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Allocate a fresh identity.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

/// Something that happened on the channel.
pub enum ChannelEvent {
    /// A named event sent by the peer.
    ///
    /// `ack` is present when the peer asked for an acknowledgment; calling it
    /// sends the reply.
    Message {
        event: String,
        args: Vec<WireValue>,
        ack: Option<AckCallback>,
    },

    /// The peer answered one of our acknowledgment requests.
    ///
    /// `callback` is the one passed to [`MessageChannel::send`]; the consumer
    /// of the event stream must call it with `args`.
    Ack {
        callback: AckCallback,
        args: Vec<WireValue>,
    },

    /// Connecting failed.
    ConnectError(String),

    /// The connection dropped. No further events follow.
    Disconnect(String),
}

impl fmt::Debug for ChannelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelEvent::Message { event, args, ack } => f
                .debug_struct("Message")
                .field("event", event)
                .field("args", args)
                .field("ack", &ack.is_some())
                .finish(),
            ChannelEvent::Ack { args, .. } => f.debug_struct("Ack").field("args", args).finish(),
            ChannelEvent::ConnectError(reason) => {
                f.debug_tuple("ConnectError").field(reason).finish()
            }
            ChannelEvent::Disconnect(reason) => f.debug_tuple("Disconnect").field(reason).finish(),
        }
    }
}

/// A bidirectional, event-based message channel.
///
/// Implementations must deliver events in send order and must not call back
/// into the caller from inside [`send`](MessageChannel::send).
pub trait MessageChannel: Send + Sync + 'static {
    /// Identity used to cache one session per channel.
    fn id(&self) -> ChannelId;

    /// Send a named event with arguments and an optional acknowledgment callback.
    fn send(&self, event: &str, args: Vec<WireValue>, ack: Option<AckCallback>) -> Result<()>;

    /// Hand out the inbound event receiver. Only the first call returns `Some`.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;

    /// Whether binary values travel as-is. Text-only channels get base64 DATA.
    fn supports_binary(&self) -> bool {
        true
    }
}
