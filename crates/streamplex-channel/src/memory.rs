use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use streamplex_codec::{Value, WireValue};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{ChannelError, Result};
use crate::traits::{AckCallback, ChannelEvent, ChannelId, MessageChannel};

/// Shared state of a connected pair.
struct Link {
    inboxes: [mpsc::UnboundedSender<ChannelEvent>; 2],
    connected: AtomicBool,
}

impl Link {
    fn deliver(&self, side: usize, event: ChannelEvent) -> Result<()> {
        self.inboxes[side]
            .send(event)
            .map_err(|_| ChannelError::Disconnected)
    }
}

/// One end of an in-process message channel pair.
///
/// Events sent on one end arrive on the other in send order. Acknowledgment
/// replies travel back through the sender's own event queue, so they are
/// ordered with respect to every other event the sender receives.
///
/// A text-only pair carries every argument list as JSON text, the way a
/// string transport would.
pub struct MemoryChannel {
    id: ChannelId,
    side: usize,
    link: Arc<Link>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    binary: bool,
}

impl MemoryChannel {
    /// Create a connected, binary-capable pair.
    pub fn pair() -> (Arc<MemoryChannel>, Arc<MemoryChannel>) {
        Self::pair_with_binary(true)
    }

    /// Create a connected pair; with `binary == false` both ends reject binary values.
    pub fn pair_with_binary(binary: bool) -> (Arc<MemoryChannel>, Arc<MemoryChannel>) {
        let (tx0, rx0) = mpsc::unbounded_channel();
        let (tx1, rx1) = mpsc::unbounded_channel();
        let link = Arc::new(Link {
            inboxes: [tx0, tx1],
            connected: AtomicBool::new(true),
        });

        let left = Arc::new(MemoryChannel {
            id: ChannelId::next(),
            side: 0,
            link: Arc::clone(&link),
            events: Mutex::new(Some(rx0)),
            binary,
        });
        let right = Arc::new(MemoryChannel {
            id: ChannelId::next(),
            side: 1,
            link,
            events: Mutex::new(Some(rx1)),
            binary,
        });
        (left, right)
    }

    fn peer_side(&self) -> usize {
        1 - self.side
    }

    pub fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::SeqCst)
    }

    /// Drop the connection. Both ends receive a `Disconnect` event once.
    pub fn disconnect(&self) {
        if !self.link.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!(channel = %self.id, "memory channel disconnected");
        for side in [self.side, self.peer_side()] {
            let _ = self.link.deliver(
                side,
                ChannelEvent::Disconnect("transport close".to_string()),
            );
        }
    }

    /// Report a connection failure to this end only.
    pub fn fail_connect(&self, reason: impl Into<String>) {
        let _ = self
            .link
            .deliver(self.side, ChannelEvent::ConnectError(reason.into()));
    }

    fn wrap_ack(&self, callback: AckCallback) -> AckCallback {
        let link = Arc::clone(&self.link);
        let origin = self.side;
        let binary = self.binary;
        Box::new(move |args| {
            if !link.connected.load(Ordering::SeqCst) {
                debug!("dropping acknowledgment on disconnected memory channel");
                return;
            }
            let args = if binary {
                args
            } else {
                match through_text(&args) {
                    Ok(args) => args,
                    Err(err) => {
                        debug!(error = %err, "dropping acknowledgment the text channel cannot carry");
                        return;
                    }
                }
            };
            let _ = link.deliver(origin, ChannelEvent::Ack { callback, args });
        })
    }
}

impl MessageChannel for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn send(&self, event: &str, args: Vec<WireValue>, ack: Option<AckCallback>) -> Result<()> {
        if !self.is_connected() {
            return Err(ChannelError::Disconnected);
        }
        let args = if self.binary {
            args
        } else {
            through_text(&args)?
        };
        let ack = ack.map(|callback| self.wrap_ack(callback));
        self.link.deliver(
            self.peer_side(),
            ChannelEvent::Message {
                event: event.to_string(),
                args,
                ack,
            },
        )
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn supports_binary(&self) -> bool {
        self.binary
    }
}

/// Serialize to JSON and parse back, refusing binary values.
fn through_text(args: &[WireValue]) -> Result<Vec<WireValue>> {
    if args.iter().any(contains_bytes) {
        return Err(ChannelError::BinaryUnsupported);
    }
    let text =
        serde_json::to_string(args).map_err(|err| ChannelError::Encoding(err.to_string()))?;
    serde_json::from_str(&text).map_err(|err| ChannelError::Encoding(err.to_string()))
}

fn contains_bytes(value: &WireValue) -> bool {
    match value {
        Value::Bytes(_) => true,
        Value::Array(items) => items.iter().any(contains_bytes),
        Value::Object(map) => map.values().any(contains_bytes),
        _ => false,
    }
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("id", &self.id)
            .field("side", &self.side)
            .field("binary", &self.binary)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(event: Option<ChannelEvent>) -> (String, Vec<WireValue>, Option<AckCallback>) {
        match event {
            Some(ChannelEvent::Message { event, args, ack }) => (event, args, ack),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delivers_in_send_order() {
        let (left, right) = MemoryChannel::pair();
        let mut inbox = right.take_events().unwrap();

        left.send("one", vec![Value::from("a")], None).unwrap();
        left.send("two", vec![Value::Null, Value::Absent], None).unwrap();

        let (event, args, _) = message(inbox.recv().await);
        assert_eq!(event, "one");
        assert_eq!(args, vec![Value::from("a")]);

        let (event, args, _) = message(inbox.recv().await);
        assert_eq!(event, "two");
        assert_eq!(args, vec![Value::Null, Value::Absent]);
    }

    #[tokio::test]
    async fn ack_reply_returns_through_sender_queue() {
        let (left, right) = MemoryChannel::pair();
        let mut left_inbox = left.take_events().unwrap();
        let mut right_inbox = right.take_events().unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        left.send(
            "ask",
            Vec::new(),
            Some(Box::new(move |args| {
                let _ = tx.send(args);
            })),
        )
        .unwrap();

        let (_, _, ack) = message(right_inbox.recv().await);
        ack.expect("ack callback should be present")(vec![Value::from("yes")]);

        match left_inbox.recv().await {
            Some(ChannelEvent::Ack { callback, args }) => callback(args),
            other => panic!("expected ack, got {other:?}"),
        }
        assert_eq!(rx.await.unwrap(), vec![Value::from("yes")]);
    }

    #[tokio::test]
    async fn disconnect_notifies_both_ends_once() {
        let (left, right) = MemoryChannel::pair();
        let mut left_inbox = left.take_events().unwrap();
        let mut right_inbox = right.take_events().unwrap();

        right.disconnect();
        right.disconnect();

        assert!(matches!(
            left_inbox.recv().await,
            Some(ChannelEvent::Disconnect(_))
        ));
        assert!(matches!(
            right_inbox.recv().await,
            Some(ChannelEvent::Disconnect(_))
        ));
        assert!(left_inbox.try_recv().is_err());
        assert_eq!(
            left.send("late", Vec::new(), None),
            Err(ChannelError::Disconnected)
        );
    }

    #[tokio::test]
    async fn fail_connect_reaches_only_local_end() {
        let (left, right) = MemoryChannel::pair();
        let mut left_inbox = left.take_events().unwrap();
        let mut right_inbox = right.take_events().unwrap();

        left.fail_connect("refused");

        assert!(matches!(
            left_inbox.recv().await,
            Some(ChannelEvent::ConnectError(reason)) if reason == "refused"
        ));
        assert!(right_inbox.try_recv().is_err());
        assert!(left.is_connected());
    }

    #[test]
    fn text_only_channel_rejects_binary() {
        let (left, _right) = MemoryChannel::pair_with_binary(false);
        let nested = Value::Array(vec![Value::object([("b", Value::from(vec![1u8]))])]);
        assert_eq!(
            left.send("bin", vec![nested], None),
            Err(ChannelError::BinaryUnsupported)
        );
        assert!(left.send("text", vec![Value::from("ok")], None).is_ok());
    }

    #[tokio::test]
    async fn text_only_channel_carries_json() {
        use streamplex_codec::{StreamDescriptor, StreamOptions};

        let (left, right) = MemoryChannel::pair_with_binary(false);
        let mut inbox = right.take_events().unwrap();
        let descriptor = StreamDescriptor::new("s1", StreamOptions::new().with_object_mode(true));

        left.send(
            "text",
            vec![
                Value::object([("stream", Value::Stream(descriptor.clone()))]),
                Value::Absent,
            ],
            None,
        )
        .unwrap();

        let (_, args, _) = message(inbox.recv().await);
        assert_eq!(args[0].get("stream"), Some(&Value::Stream(descriptor)));
        // JSON has no "missing" value.
        assert_eq!(args[1], Value::Null);
    }

    #[test]
    fn events_can_only_be_taken_once() {
        let (left, _right) = MemoryChannel::pair();
        assert!(left.take_events().is_some());
        assert!(left.take_events().is_none());
    }
}
