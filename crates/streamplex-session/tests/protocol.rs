mod common;

use bytes::Bytes;
use common::{events, next_event, sync, within, RawPeer};
use streamplex_channel::{ChannelError, MemoryChannel};
use streamplex_codec::{
    FrameKind, MuxFrame, PlainValue, StreamDescriptor, StreamOptions, Value, WireValue, MUX_EVENT,
};
use streamplex_session::{
    DuplexStream, MuxConfig, Multiplexer, ReadState, SessionValue, StreamError, StreamEvent,
    WriteState,
};

fn descriptor(id: &str, options: StreamOptions) -> WireValue {
    Value::Stream(StreamDescriptor::new(id, options))
}

/// Emit a local stream to the raw peer and return its descriptor id.
async fn send_stream(client: &Multiplexer, peer: &mut RawPeer, stream: &DuplexStream) -> String {
    client
        .emit("take", vec![SessionValue::Stream(stream.clone())])
        .unwrap();
    let (event, args) = peer.next_message().await;
    assert_eq!(event, "take");
    let descriptor = args[0].as_stream().expect("stream should travel as a descriptor");
    assert_eq!(descriptor.options, stream.options());
    descriptor.id.clone()
}

/// Have the raw peer open a stream on the client and return it.
async fn receive_stream(
    client: &Multiplexer,
    peer: &RawPeer,
    id: &str,
    options: StreamOptions,
) -> DuplexStream {
    let mut opened = events(client, "open");
    peer.emit("open", vec![descriptor(id, options)]);
    let stream = next_event(&mut opened)
        .await
        .stream(0)
        .expect("descriptor should become a stream");
    client.remove_all_listeners(Some("open"));
    stream
}

#[tokio::test]
async fn frames_follow_the_event_in_write_order() {
    let (left, right) = MemoryChannel::pair();
    let client = Multiplexer::lookup(&left).unwrap();
    let mut peer = RawPeer::new(right);

    let stream = DuplexStream::new();
    stream.write_now("foo").unwrap();
    let id = send_stream(&client, &mut peer, &stream).await;
    assert_eq!(id, stream.id());
    stream.write("bar").await.unwrap();
    stream.end().unwrap();

    let (frame, raw) = peer.next_raw_frame().await;
    assert_eq!(frame, MuxFrame::data(id.as_str(), Value::from(&b"foo"[..])));
    assert_eq!(raw.get("streamId").and_then(Value::as_str), Some(id.as_str()));
    assert_eq!(raw.get("type").and_then(Value::as_str), Some("DATA"));
    assert_eq!(
        peer.next_frame().await,
        MuxFrame::data(id.as_str(), Value::from(&b"bar"[..]))
    );
    assert_eq!(peer.next_frame().await, MuxFrame::end(id.as_str()));
    assert_eq!(stream.write_state(), WriteState::Finished);
}

#[tokio::test]
async fn pause_and_resume_are_edge_triggered() {
    let (left, right) = MemoryChannel::pair();
    let client = Multiplexer::lookup(&left).unwrap();
    let mut peer = RawPeer::new(right);

    let stream = receive_stream(
        &client,
        &peer,
        "inbound",
        StreamOptions::new().with_high_water_mark(4),
    )
    .await;

    for chunk in ["abc", "de", "f", "gh"] {
        peer.send_frame(MuxFrame::data("inbound", Value::from(chunk)));
    }
    sync(&client, &peer).await;

    // 3 bytes, then 5 > 4: one PAUSE, nothing more while still above.
    assert_eq!(stream.buffered_len(), 8);
    assert_eq!(peer.next_frame().await, MuxFrame::pause("inbound"));
    assert!(peer.try_message().is_none());

    // 8 -> 5 -> 3: RESUME once when dropping below the mark.
    within(stream.read_chunk()).await.unwrap().unwrap();
    assert!(peer.try_message().is_none());
    within(stream.read_chunk()).await.unwrap().unwrap();
    assert_eq!(peer.next_frame().await, MuxFrame::resume("inbound"));
    within(stream.read_chunk()).await.unwrap().unwrap();
    within(stream.read_chunk()).await.unwrap().unwrap();
    assert!(peer.try_message().is_none());
}

#[tokio::test]
async fn pause_holds_data_until_resume() {
    let (left, right) = MemoryChannel::pair();
    let client = Multiplexer::lookup(&left).unwrap();
    let mut peer = RawPeer::new(right);

    let stream = DuplexStream::with_options(StreamOptions::new().with_high_water_mark(4));
    let id = send_stream(&client, &mut peer, &stream).await;

    peer.send_frame(MuxFrame::pause(id.as_str()));
    sync(&client, &peer).await;

    assert!(stream.write_now("foo").unwrap());
    assert!(!stream.write_now("bar").unwrap());
    stream.end().unwrap();
    assert_eq!(stream.write_state(), WriteState::Ending);
    assert!(peer.try_message().is_none());

    let blocked = stream.clone();
    let mut late_write = tokio::spawn(async move { blocked.write("baz").await });
    tokio::task::yield_now().await;
    assert!(!late_write.is_finished());

    peer.send_frame(MuxFrame::resume(id.as_str()));
    assert_eq!(
        peer.next_frame().await,
        MuxFrame::data(id.as_str(), Value::from(&b"foo"[..]))
    );
    assert_eq!(
        peer.next_frame().await,
        MuxFrame::data(id.as_str(), Value::from(&b"bar"[..]))
    );
    assert_eq!(peer.next_frame().await, MuxFrame::end(id.as_str()));

    // The blocked write wakes up to a finished stream.
    let result = within(&mut late_write).await.unwrap();
    assert_eq!(result, Err(StreamError::Closed));
}

#[tokio::test]
async fn forced_base64_encodes_binary_data() {
    let (left, right) = MemoryChannel::pair();
    let client =
        Multiplexer::lookup_with_config(&left, MuxConfig::default().with_force_base64(true))
            .unwrap();
    let mut peer = RawPeer::new(right);

    let stream = DuplexStream::new();
    let id = send_stream(&client, &mut peer, &stream).await;
    stream.write(vec![0u8, 1, 2, 3]).await.unwrap();

    let (frame, raw) = peer.next_raw_frame().await;
    assert_eq!(raw.get("payload").and_then(Value::as_str), Some("AAECAw=="));
    assert_eq!(raw.get("encoding").and_then(Value::as_str), Some("base64"));
    assert_eq!(frame.payload, Some(Value::Bytes(Bytes::from_static(&[0, 1, 2, 3]))));

    peer.emit(
        MUX_EVENT,
        vec![MuxFrame::data(id.as_str(), Value::from(vec![9u8, 8])).into_value(true)],
    );
    let chunk = within(stream.read_chunk()).await.unwrap().unwrap();
    assert_eq!(chunk, Value::Bytes(Bytes::from_static(&[9, 8])));
}

#[tokio::test]
async fn unknown_and_malformed_frames_are_dropped() {
    let (left, right) = MemoryChannel::pair();
    let client = Multiplexer::lookup(&left).unwrap();
    let mut peer = RawPeer::new(right);

    peer.send_frame(MuxFrame::data("nobody", Value::from("lost")));
    peer.send_frame(MuxFrame::error("nobody", "lost"));
    peer.emit(MUX_EVENT, vec![Value::from("not a frame")]);
    peer.emit(MUX_EVENT, Vec::new());
    sync(&client, &peer).await;

    assert_eq!(client.stream_count(), 0);
    assert!(peer.try_message().is_none());
}

#[tokio::test]
async fn remote_end_without_half_open_cleans_up() {
    let (left, right) = MemoryChannel::pair();
    let client = Multiplexer::lookup(&left).unwrap();
    let mut peer = RawPeer::new(right);

    let stream = receive_stream(&client, &peer, "r", StreamOptions::default()).await;
    assert_eq!(client.stream_ids(), vec!["r".to_string()]);

    peer.send_frame(MuxFrame::data("r", Value::from("last")));
    peer.send_frame(MuxFrame::end("r"));
    sync(&client, &peer).await;

    // Nothing goes back until the reader reached the end.
    assert_eq!(stream.read_state(), ReadState::Ended);
    assert_eq!(stream.write_state(), WriteState::Open);
    assert!(peer.try_message().is_none());

    let chunk = within(stream.read_chunk()).await.unwrap().unwrap();
    stream.write(chunk).await.unwrap();
    assert!(within(stream.read_chunk()).await.is_none());

    assert_eq!(
        peer.next_frame().await,
        MuxFrame::data("r", Value::from(&b"last"[..]))
    );
    assert_eq!(peer.next_frame().await, MuxFrame::end("r"));
    assert_eq!(stream.read_state(), ReadState::Ended);
    assert_eq!(stream.write_state(), WriteState::Finished);
    assert!(stream.is_closed());
    assert_eq!(client.stream_count(), 0);
}

#[tokio::test]
async fn refused_frame_fails_the_stream_and_tells_the_peer() {
    let (left, right) = MemoryChannel::pair_with_binary(false);
    let client = Multiplexer::lookup(&left).unwrap();
    let mut peer = RawPeer::new(right);

    let stream = DuplexStream::with_options(StreamOptions::new().with_object_mode(true));
    send_stream(&client, &mut peer, &stream).await;
    let mut lifecycle = stream.subscribe();

    let blob: PlainValue = Value::object([("blob", Value::Bytes(Bytes::from_static(&[0, 1])))]);
    let refused = StreamError::Channel(ChannelError::BinaryUnsupported);
    assert_eq!(stream.write(blob).await, Err(refused.clone()));
    assert_eq!(stream.end(), Err(refused.clone()));
    assert!(stream.is_destroyed());
    assert_eq!(client.stream_count(), 0);
    assert_eq!(lifecycle.try_recv().unwrap(), StreamEvent::Error(refused));

    let frame = peer.next_frame().await;
    assert_eq!(frame.kind, FrameKind::Error);
    assert_eq!(
        frame.error_message(),
        Some("channel does not accept binary payloads")
    );
    assert!(peer.try_message().is_none());
}

#[tokio::test]
async fn half_open_remote_stream_waits_for_both_sides() {
    let (left, right) = MemoryChannel::pair();
    let client = Multiplexer::lookup(&left).unwrap();
    let mut peer = RawPeer::new(right);

    let stream = receive_stream(
        &client,
        &peer,
        "half",
        StreamOptions::new().with_allow_half_open(true),
    )
    .await;

    peer.send_frame(MuxFrame::end("half"));
    sync(&client, &peer).await;
    assert_eq!(stream.read_state(), ReadState::Ended);
    assert_eq!(stream.write_state(), WriteState::Open);
    assert_eq!(client.stream_count(), 1);
    assert!(peer.try_message().is_none());

    stream.write("reply").await.unwrap();
    stream.end().unwrap();
    assert_eq!(
        peer.next_frame().await,
        MuxFrame::data("half", Value::from(&b"reply"[..]))
    );
    assert_eq!(peer.next_frame().await, MuxFrame::end("half"));
    assert_eq!(client.stream_count(), 0);
}

#[tokio::test]
async fn half_open_local_stream_waits_for_both_sides() {
    let (left, right) = MemoryChannel::pair();
    let client = Multiplexer::lookup(&left).unwrap();
    let mut peer = RawPeer::new(right);

    let stream = DuplexStream::with_options(StreamOptions::new().with_allow_half_open(true));
    let id = send_stream(&client, &mut peer, &stream).await;
    let mut lifecycle = stream.subscribe();

    stream.end().unwrap();
    assert_eq!(peer.next_frame().await, MuxFrame::end(id.as_str()));
    assert_eq!(lifecycle.try_recv().unwrap(), StreamEvent::Finish);
    assert_eq!(client.stream_count(), 1);

    peer.send_frame(MuxFrame::end(id.as_str()));
    within(stream.closed()).await;
    assert_eq!(client.stream_count(), 0);
    assert_eq!(lifecycle.try_recv().unwrap(), StreamEvent::Close);
}

#[tokio::test]
async fn local_error_is_mirrored_once() {
    let (left, right) = MemoryChannel::pair();
    let client = Multiplexer::lookup(&left).unwrap();
    let mut peer = RawPeer::new(right);

    let stream = DuplexStream::new();
    let id = send_stream(&client, &mut peer, &stream).await;
    stream.fail("error on the client");
    stream.fail("second failure");

    let frame = peer.next_frame().await;
    assert_eq!(frame.kind, FrameKind::Error);
    assert_eq!(frame.error_message(), Some("error on the client"));
    assert!(peer.try_message().is_none());
    assert_eq!(client.stream_count(), 0);

    // Frames racing with the teardown are ignored.
    peer.send_frame(MuxFrame::end(id.as_str()));
    sync(&client, &peer).await;
    assert!(peer.try_message().is_none());
}

#[tokio::test]
async fn remote_error_is_not_echoed() {
    let (left, right) = MemoryChannel::pair();
    let client = Multiplexer::lookup(&left).unwrap();
    let mut peer = RawPeer::new(right);

    let stream = receive_stream(&client, &peer, "e", StreamOptions::default()).await;
    let mut lifecycle = stream.subscribe();

    peer.send_frame(MuxFrame::data("e", Value::from("partial")));
    peer.send_frame(MuxFrame::error("e", "boom"));
    sync(&client, &peer).await;

    assert_eq!(
        lifecycle.try_recv().unwrap(),
        StreamEvent::Error(StreamError::Remote("boom".to_string()))
    );
    assert_eq!(lifecycle.try_recv().unwrap(), StreamEvent::Close);
    assert!(peer.try_message().is_none());
    assert_eq!(client.stream_count(), 0);
    assert_eq!(stream.write_now("x"), Err(StreamError::Remote("boom".to_string())));
}

#[tokio::test]
async fn destroy_does_not_notify_the_peer() {
    let (left, right) = MemoryChannel::pair();
    let client = Multiplexer::lookup(&left).unwrap();
    let mut peer = RawPeer::new(right);

    let stream = DuplexStream::new();
    send_stream(&client, &mut peer, &stream).await;
    stream.destroy();

    assert!(peer.try_message().is_none());
    assert_eq!(client.stream_count(), 0);
    assert!(stream.is_closed());
}

#[tokio::test]
async fn same_descriptor_twice_yields_one_stream() {
    let (left, right) = MemoryChannel::pair();
    let client = Multiplexer::lookup(&left).unwrap();
    let peer = RawPeer::new(right);
    let mut twice = events(&client, "twice");

    let options = StreamOptions::new().with_object_mode(true);
    peer.emit(
        "twice",
        vec![
            descriptor("dup", options),
            Value::object([("again", descriptor("dup", options))]),
            Value::Null,
            Value::Absent,
        ],
    );

    let incoming = next_event(&mut twice).await;
    let first = incoming.stream(0).unwrap();
    let second = incoming.args[1].get("again").unwrap().as_stream().unwrap();
    assert_eq!(&first, second);
    assert_eq!(first.options(), options);
    assert!(incoming.args[2].is_null());
    assert!(incoming.args[3].is_absent());
    assert_eq!(client.stream_count(), 1);
}

#[tokio::test]
async fn acknowledger_replies_once() {
    let (left, right) = MemoryChannel::pair();
    let client = Multiplexer::lookup(&left).unwrap();
    let server = Multiplexer::lookup(&right).unwrap();

    server.on("question", |incoming| {
        let ack = incoming.ack.expect("question should ask for an ack");
        assert!(ack.send(vec![SessionValue::from("first")]).unwrap());
        assert!(!ack.clone().send(vec![SessionValue::from("second")]).unwrap());
        assert!(ack.is_answered());
    });

    let reply = client.emit_with_ack("question", Vec::new()).unwrap();
    assert_eq!(within(reply).await.unwrap(), vec![SessionValue::from("first")]);
}
