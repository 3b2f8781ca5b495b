//! Flow-controlled duplex streams.
//!
//! Each side of a stream closes independently:
//! - the read side is `Open` until the peer's END frame arrives
//! - the write side is `Open`, then `Ending` while END waits behind queued
//!   DATA, then `Finished` once END went out
//!
//! A stream leaves its session's registry when it is destroyed, or when the
//! read side has ended and the write side has finished. Without
//! `allowHalfOpen`, the write side ends on its own once a reader has consumed
//! everything up to the peer's END.
//!
//! A frame the channel refuses destroys the stream with
//! [`StreamError::Channel`] and tells the peer with an ERROR frame.
//!
//! Backpressure is edge-triggered: one PAUSE frame when the read buffer rises
//! above the high-water mark, one RESUME frame when it drains below it again.

use std::collections::VecDeque;
use std::fmt;
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{ready, Context, Poll, Waker};

use bytes::Bytes;
use futures_core::Stream;
use streamplex_channel::ChannelError;
use streamplex_codec::{
    Direction, FrameKind, MuxFrame, PlainValue, StreamDescriptor, StreamHandle, StreamOptions,
    Value,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace, warn};

use crate::error::StreamError;
use crate::mux::MuxInner;

const EVENT_CAPACITY: usize = 64;

/// Read side state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    Open,
    /// The peer sent END.
    Ended,
}

/// Write side state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Open,
    /// END is queued behind pending DATA.
    Ending,
    /// END was sent.
    Finished,
}

/// Lifecycle notification of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Error(StreamError),
    /// A reader consumed all data up to the peer's END.
    End,
    /// The END frame went out.
    Finish,
    /// The stream left its session. Fires once.
    Close,
}

enum Outbound {
    Data(PlainValue),
    End,
}

/// Work to do once the state lock is released.
#[derive(Default)]
struct Followup {
    events: Vec<StreamEvent>,
    release: bool,
    failure: Option<ChannelError>,
}

struct State {
    mux: Option<Weak<MuxInner>>,
    sent: bool,
    read: ReadState,
    write: WriteState,
    destroyed: bool,
    released: bool,
    end_emitted: bool,
    failure: Option<StreamError>,
    failure_reported: bool,
    inbound: VecDeque<PlainValue>,
    inbound_len: usize,
    read_rest: Option<Bytes>,
    pause_sent: bool,
    peer_paused: bool,
    outbound: VecDeque<Outbound>,
    outbound_len: usize,
    read_wakers: Vec<Waker>,
    write_wakers: Vec<Waker>,
}

impl State {
    fn new(mux: Option<Weak<MuxInner>>) -> Self {
        Self {
            mux,
            sent: false,
            read: ReadState::Open,
            write: WriteState::Open,
            destroyed: false,
            released: false,
            end_emitted: false,
            failure: None,
            failure_reported: false,
            inbound: VecDeque::new(),
            inbound_len: 0,
            read_rest: None,
            pause_sent: false,
            peer_paused: false,
            outbound: VecDeque::new(),
            outbound_len: 0,
            read_wakers: Vec::new(),
            write_wakers: Vec::new(),
        }
    }

    fn closed_error(&self) -> StreamError {
        self.failure.clone().unwrap_or(StreamError::Closed)
    }
}

struct Shared {
    id: String,
    options: StreamOptions,
    direction: Direction,
    high_water_mark: usize,
    state: Mutex<State>,
    events: broadcast::Sender<StreamEvent>,
    closed: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn chunk_size(&self, chunk: &PlainValue) -> usize {
        if self.options.is_object_mode() {
            1
        } else {
            chunk.byte_len()
        }
    }

    /// Byte-mode streams carry bytes; strings are converted.
    fn normalize(&self, chunk: PlainValue) -> Result<PlainValue, StreamError> {
        if self.options.is_object_mode() {
            return Ok(chunk);
        }
        match chunk {
            Value::Bytes(bytes) => Ok(Value::Bytes(bytes)),
            Value::String(text) => Ok(Value::Bytes(Bytes::from(text.into_bytes()))),
            _ => Err(StreamError::InvalidChunk(
                "byte-mode streams accept bytes or strings".to_string(),
            )),
        }
    }

    fn above_high_water_mark(&self, len: usize) -> bool {
        len > 0 && len >= self.high_water_mark
    }

    fn send_frame(&self, state: &State, frame: MuxFrame) -> Result<(), ChannelError> {
        let kind = frame.kind;
        let Some(mux) = state.mux.as_ref().and_then(Weak::upgrade) else {
            debug!(stream_id = %self.id, frame = %kind, "no session, frame dropped");
            return Ok(());
        };
        mux.send_frame(frame)
    }

    /// Send a control frame, recording a refusal for [`Shared::apply`].
    fn send_control(&self, state: &State, frame: MuxFrame, out: &mut Followup) {
        if let Err(err) = self.send_frame(state, frame) {
            out.failure.get_or_insert(err);
        }
    }

    /// Local streams stay silent until the event carrying them went out.
    fn can_send(&self, state: &State) -> bool {
        state.mux.is_some() && (self.direction == Direction::Remote || state.sent)
    }

    /// Send queued frames while the peer accepts DATA.
    fn flush(&self, state: &mut State, out: &mut Followup) {
        if !self.can_send(state) {
            return;
        }
        while let Some(front) = state.outbound.front() {
            if matches!(front, Outbound::Data(_)) && state.peer_paused {
                trace!(stream_id = %self.id, queued = state.outbound.len(), "peer paused, holding data");
                break;
            }
            match state.outbound.pop_front() {
                Some(Outbound::Data(chunk)) => {
                    state.outbound_len -= self.chunk_size(&chunk);
                    trace!(stream_id = %self.id, size = chunk.byte_len(), "sending data");
                    let frame = MuxFrame::data(self.id.as_str(), chunk);
                    if let Err(err) = self.send_frame(state, frame) {
                        out.failure = Some(err);
                        return;
                    }
                }
                Some(Outbound::End) => {
                    if let Err(err) = self.send_frame(state, MuxFrame::end(self.id.as_str())) {
                        out.failure = Some(err);
                        return;
                    }
                    state.write = WriteState::Finished;
                    out.events.push(StreamEvent::Finish);
                    self.settle(state, out);
                }
                None => break,
            }
        }
        wake_all(&mut state.write_wakers);
    }

    fn begin_end(&self, state: &mut State, out: &mut Followup) {
        state.write = WriteState::Ending;
        state.outbound.push_back(Outbound::End);
        self.flush(state, out);
    }

    /// Release the stream once both sides are done.
    fn settle(&self, state: &mut State, out: &mut Followup) {
        if !state.released && state.read == ReadState::Ended && state.write == WriteState::Finished
        {
            state.released = true;
            out.release = true;
        }
    }

    /// Emit queued events, then release or destroy the stream.
    ///
    /// Returns the error the stream was destroyed with when the channel
    /// refused one of its frames.
    fn apply(&self, out: Followup) -> Result<(), StreamError> {
        for event in out.events {
            let _ = self.events.send(event);
        }
        if let Some(err) = out.failure {
            warn!(stream_id = %self.id, error = %err, "channel refused frame, destroying stream");
            let notify = MuxFrame::error(self.id.as_str(), err.to_string());
            let err = StreamError::Channel(err);
            self.terminate(Some(err.clone()), Some(notify));
            return Err(err);
        }
        if out.release {
            self.release();
        }
        Ok(())
    }

    fn release(&self) {
        let mux = self.lock().mux.as_ref().and_then(Weak::upgrade);
        if let Some(mux) = mux {
            mux.registry.remove(&self.id);
        }
        debug!(stream_id = %self.id, "stream closed");
        let _ = self.events.send(StreamEvent::Close);
        self.closed.send_replace(true);
    }

    /// Destroy the stream, optionally telling the peer first.
    fn terminate(&self, error: Option<StreamError>, notify: Option<MuxFrame>) {
        let release = {
            let mut state = self.lock();
            if state.destroyed {
                return;
            }
            if let Some(frame) = notify {
                if let Err(err) = self.send_frame(&state, frame) {
                    debug!(stream_id = %self.id, error = %err, "error frame not delivered");
                }
            }
            state.destroyed = true;
            state.failure = error.clone();
            state.inbound.clear();
            state.inbound_len = 0;
            state.read_rest = None;
            state.outbound.clear();
            state.outbound_len = 0;
            wake_all(&mut state.read_wakers);
            wake_all(&mut state.write_wakers);
            !std::mem::replace(&mut state.released, true)
        };

        if let Some(err) = error {
            debug!(stream_id = %self.id, error = %err, "stream failed");
            let _ = self.events.send(StreamEvent::Error(err));
        }
        if release {
            self.release();
        }
    }
}

/// One logical stream multiplexed over a session.
///
/// Handles are cheap to clone; all clones refer to the same stream.
#[derive(Clone)]
pub struct DuplexStream {
    shared: Arc<Shared>,
}

impl DuplexStream {
    /// Create a local byte-mode stream with default options.
    pub fn new() -> Self {
        Self::with_options(StreamOptions::default())
    }

    /// Create a local stream. It is bound to a session when first emitted.
    pub fn with_options(options: StreamOptions) -> Self {
        Self::build(
            uuid::Uuid::new_v4().to_string(),
            options,
            Direction::Local,
            None,
        )
    }

    pub(crate) fn remote(descriptor: &StreamDescriptor, mux: Weak<MuxInner>) -> Self {
        Self::build(
            descriptor.id.clone(),
            descriptor.options,
            Direction::Remote,
            Some(mux),
        )
    }

    fn build(
        id: String,
        options: StreamOptions,
        direction: Direction,
        mux: Option<Weak<MuxInner>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (closed, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                id,
                options,
                direction,
                high_water_mark: options.effective_high_water_mark(),
                state: Mutex::new(State::new(mux)),
                events,
                closed,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn options(&self) -> StreamOptions {
        self.shared.options
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    /// Buffer limit in bytes, or in chunks for object-mode streams.
    pub fn high_water_mark(&self) -> usize {
        self.shared.high_water_mark
    }

    pub fn read_state(&self) -> ReadState {
        self.shared.lock().read
    }

    pub fn write_state(&self) -> WriteState {
        self.shared.lock().write
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.lock().destroyed
    }

    /// True once a local stream was handed to a session.
    pub fn is_sent(&self) -> bool {
        self.shared.direction == Direction::Local && self.shared.lock().sent
    }

    /// True once the stream left its session (or was destroyed).
    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Size of the unread inbound buffer.
    pub fn buffered_len(&self) -> usize {
        self.shared.lock().inbound_len
    }

    /// Subscribe to lifecycle events. Only events after this call are seen.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.shared.events.subscribe()
    }

    /// Wait until the stream is closed.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Write a chunk, waiting while the outbound buffer is full.
    pub async fn write(&self, chunk: impl Into<PlainValue>) -> Result<(), StreamError> {
        let chunk = self.shared.normalize(chunk.into())?;
        poll_fn(|cx| self.poll_write_ready(cx)).await?;
        self.push_chunk(chunk).map(|_| ())
    }

    /// Queue a chunk without waiting.
    ///
    /// Returns false when the outbound buffer is at or above the high-water
    /// mark; the chunk is queued either way.
    pub fn write_now(&self, chunk: impl Into<PlainValue>) -> Result<bool, StreamError> {
        let chunk = self.shared.normalize(chunk.into())?;
        self.push_chunk(chunk)
    }

    fn push_chunk(&self, chunk: PlainValue) -> Result<bool, StreamError> {
        let mut out = Followup::default();
        let below = {
            let mut state = self.shared.lock();
            if state.destroyed {
                return Err(state.closed_error());
            }
            if state.write != WriteState::Open {
                return Err(StreamError::Closed);
            }
            state.outbound_len += self.shared.chunk_size(&chunk);
            state.outbound.push_back(Outbound::Data(chunk));
            self.shared.flush(&mut state, &mut out);
            !self.shared.above_high_water_mark(state.outbound_len)
        };
        self.shared.apply(out)?;
        Ok(below)
    }

    fn poll_write_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), StreamError>> {
        let mut state = self.shared.lock();
        if state.destroyed {
            return Poll::Ready(Err(state.closed_error()));
        }
        if state.write != WriteState::Open {
            return Poll::Ready(Err(StreamError::Closed));
        }
        if self.shared.above_high_water_mark(state.outbound_len) {
            register(&mut state.write_wakers, cx.waker());
            return Poll::Pending;
        }
        Poll::Ready(Ok(()))
    }

    /// Finish the write side. Idempotent.
    pub fn end(&self) -> Result<(), StreamError> {
        let mut out = Followup::default();
        {
            let mut state = self.shared.lock();
            if state.destroyed {
                return Err(state.closed_error());
            }
            if state.write != WriteState::Open {
                return Ok(());
            }
            self.shared.begin_end(&mut state, &mut out);
        }
        self.shared.apply(out)
    }

    /// Destroy the stream without notifying the peer. Idempotent.
    pub fn destroy(&self) {
        self.shared.terminate(None, None);
    }

    /// Fail the stream: raise the error locally, send it to the peer as an
    /// ERROR frame and destroy the stream.
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        let frame = MuxFrame::error(self.shared.id.as_str(), message.as_str());
        self.shared
            .terminate(Some(StreamError::Local(message)), Some(frame));
    }

    /// Destroy with an error that must not be echoed to the peer.
    pub(crate) fn abort(&self, error: StreamError) {
        self.shared.terminate(Some(error), None);
    }

    /// Bind a local stream to the session about to send it, so control
    /// frames for it can go out as soon as the peer knows the stream.
    pub(crate) fn bind(&self, mux: Weak<MuxInner>) {
        let mut state = self.shared.lock();
        if !state.sent && !state.destroyed {
            state.mux = Some(mux);
        }
    }

    /// Undo [`DuplexStream::bind`] after the carrying event was refused.
    pub(crate) fn unbind(&self) {
        let mut state = self.shared.lock();
        if !state.sent {
            state.mux = None;
            state.pause_sent = false;
        }
    }

    /// Mark a bound local stream as sent and flush anything written before.
    pub(crate) fn attach(&self) {
        let mut out = Followup::default();
        {
            let mut state = self.shared.lock();
            if state.sent {
                warn!(stream_id = %self.shared.id, "stream attached twice");
                return;
            }
            state.sent = true;
            if state.destroyed {
                return;
            }
            self.shared.flush(&mut state, &mut out);
        }
        let _ = self.shared.apply(out);
    }

    /// Apply a frame received from the peer.
    pub(crate) fn handle_frame(&self, frame: MuxFrame) {
        trace!(stream_id = %self.shared.id, frame = %frame.kind, "frame received");
        match frame.kind {
            FrameKind::Data => {
                if let Some(chunk) = frame.payload {
                    self.receive_data(chunk);
                }
            }
            FrameKind::End => self.receive_end(),
            FrameKind::Error => {
                let message = frame.error_message().unwrap_or_default().to_string();
                self.abort(StreamError::Remote(message));
            }
            FrameKind::Pause => {
                self.shared.lock().peer_paused = true;
            }
            FrameKind::Resume => {
                let mut out = Followup::default();
                {
                    let mut state = self.shared.lock();
                    state.peer_paused = false;
                    self.shared.flush(&mut state, &mut out);
                }
                let _ = self.shared.apply(out);
            }
        }
    }

    fn receive_data(&self, chunk: PlainValue) {
        let chunk = match self.shared.normalize(chunk) {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!(stream_id = %self.shared.id, error = %err, "dropping inbound chunk");
                return;
            }
        };
        let mut out = Followup::default();
        {
            let mut state = self.shared.lock();
            if state.destroyed || state.read == ReadState::Ended {
                debug!(stream_id = %self.shared.id, "data after end, dropped");
                return;
            }
            state.inbound_len += self.shared.chunk_size(&chunk);
            state.inbound.push_back(chunk);
            if !state.pause_sent && state.inbound_len > self.shared.high_water_mark {
                state.pause_sent = true;
                debug!(stream_id = %self.shared.id, buffered = state.inbound_len, "pausing peer");
                self.shared.send_control(
                    &state,
                    MuxFrame::pause(self.shared.id.as_str()),
                    &mut out,
                );
            }
            wake_all(&mut state.read_wakers);
        }
        let _ = self.shared.apply(out);
    }

    fn receive_end(&self) {
        let mut out = Followup::default();
        {
            let mut state = self.shared.lock();
            if state.destroyed || state.read == ReadState::Ended {
                return;
            }
            state.read = ReadState::Ended;
            wake_all(&mut state.read_wakers);
            self.shared.settle(&mut state, &mut out);
        }
        let _ = self.shared.apply(out);
    }

    /// Poll for the next inbound chunk.
    ///
    /// Yields `None` after the peer's END once the buffer is drained, or after
    /// destruction; a failure is reported once before that.
    pub fn poll_read_chunk(
        &self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<PlainValue, StreamError>>> {
        let mut out = Followup::default();
        let poll = {
            let mut state = self.shared.lock();
            if let Some(chunk) = state.inbound.pop_front() {
                state.inbound_len -= self.shared.chunk_size(&chunk);
                if state.pause_sent
                    && (state.inbound_len == 0 || state.inbound_len < self.shared.high_water_mark)
                {
                    state.pause_sent = false;
                    if state.read == ReadState::Open {
                        debug!(stream_id = %self.shared.id, buffered = state.inbound_len, "resuming peer");
                        self.shared.send_control(
                            &state,
                            MuxFrame::resume(self.shared.id.as_str()),
                            &mut out,
                        );
                    }
                }
                Poll::Ready(Some(Ok(chunk)))
            } else if state.destroyed {
                match state.failure.clone() {
                    Some(err) if !state.failure_reported => {
                        state.failure_reported = true;
                        Poll::Ready(Some(Err(err)))
                    }
                    _ => Poll::Ready(None),
                }
            } else if state.read == ReadState::Ended {
                if !state.end_emitted {
                    state.end_emitted = true;
                    out.events.push(StreamEvent::End);
                    if !self.shared.options.is_half_open() && state.write == WriteState::Open {
                        self.shared.begin_end(&mut state, &mut out);
                    }
                    self.shared.settle(&mut state, &mut out);
                }
                Poll::Ready(None)
            } else {
                register(&mut state.read_wakers, cx.waker());
                Poll::Pending
            }
        };
        let _ = self.shared.apply(out);
        poll
    }

    /// Read the next inbound chunk.
    pub async fn read_chunk(&self) -> Option<Result<PlainValue, StreamError>> {
        poll_fn(|cx| self.poll_read_chunk(cx)).await
    }
}

impl Default for DuplexStream {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for DuplexStream {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for DuplexStream {}

impl fmt::Debug for DuplexStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexStream")
            .field("id", &self.shared.id)
            .field("direction", &self.shared.direction)
            .field("options", &self.shared.options)
            .finish()
    }
}

impl StreamHandle for DuplexStream {
    fn id(&self) -> &str {
        &self.shared.id
    }

    fn descriptor(&self) -> StreamDescriptor {
        StreamDescriptor::new(self.shared.id.clone(), self.shared.options)
    }

    fn is_destroyed(&self) -> bool {
        DuplexStream::is_destroyed(self)
    }

    fn is_sent(&self) -> bool {
        DuplexStream::is_sent(self)
    }
}

impl Stream for DuplexStream {
    type Item = Result<PlainValue, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.poll_read_chunk(cx)
    }
}

impl AsyncRead for DuplexStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let rest = self.shared.lock().read_rest.take();
            let bytes = match rest {
                Some(bytes) => bytes,
                None => match ready!(self.poll_read_chunk(cx)) {
                    None => return Poll::Ready(Ok(())),
                    Some(Err(err)) => return Poll::Ready(Err(err.into())),
                    Some(Ok(chunk)) => chunk_bytes(chunk)?,
                },
            };
            if bytes.is_empty() {
                continue;
            }
            let n = bytes.len().min(buf.remaining());
            buf.put_slice(&bytes[..n]);
            if n < bytes.len() {
                self.shared.lock().read_rest = Some(bytes.slice(n..));
            }
            return Poll::Ready(Ok(()));
        }
    }
}

impl AsyncWrite for DuplexStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        ready!(self.poll_write_ready(cx))?;
        self.push_chunk(Value::Bytes(Bytes::copy_from_slice(buf)))?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut state = self.shared.lock();
        if state.destroyed {
            return Poll::Ready(Err(state.closed_error().into()));
        }
        if state.outbound.is_empty() {
            return Poll::Ready(Ok(()));
        }
        register(&mut state.write_wakers, cx.waker());
        Poll::Pending
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Err(err) = self.end() {
            return Poll::Ready(Err(err.into()));
        }
        let mut state = self.shared.lock();
        if state.write == WriteState::Finished {
            return Poll::Ready(Ok(()));
        }
        if state.destroyed {
            return Poll::Ready(Err(state.closed_error().into()));
        }
        register(&mut state.write_wakers, cx.waker());
        Poll::Pending
    }
}

fn chunk_bytes(chunk: PlainValue) -> io::Result<Bytes> {
    match chunk {
        Value::Bytes(bytes) => Ok(bytes),
        Value::String(text) => Ok(Bytes::from(text.into_bytes())),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "object chunk read through a byte reader",
        )),
    }
}

fn register(wakers: &mut Vec<Waker>, waker: &Waker) {
    if !wakers.iter().any(|w| w.will_wake(waker)) {
        wakers.push(waker.clone());
    }
}

fn wake_all(wakers: &mut Vec<Waker>) {
    for waker in wakers.drain(..) {
        waker.wake();
    }
}
