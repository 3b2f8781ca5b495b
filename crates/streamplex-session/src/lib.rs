//! Stream multiplexer sessions.
//!
//! A [`Multiplexer`] wraps one [`MessageChannel`](streamplex_channel::MessageChannel)
//! and lets application events carry live [`DuplexStream`]s anywhere in their
//! arguments. Each embedded stream becomes an independent, flow-controlled
//! duplex channel multiplexed over the single connection.
//!
//! ```no_run
//! use streamplex_channel::MemoryChannel;
//! use streamplex_session::{DuplexStream, Multiplexer, SessionValue};
//!
//! # async fn demo() -> streamplex_session::Result<()> {
//! let (client, _server) = MemoryChannel::pair();
//! let session = Multiplexer::lookup(&client)?;
//!
//! let upload = DuplexStream::new();
//! session.emit("upload", vec![SessionValue::Stream(upload.clone())])?;
//! upload.write("hello").await?;
//! upload.end()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod listener;
pub mod mux;
pub mod pipe;
pub mod registry;
pub mod stream;

pub use config::MuxConfig;
pub use error::{MuxError, Result, StreamError};
pub use listener::{Acknowledger, IncomingEvent, ListenerId};
pub use mux::Multiplexer;
pub use pipe::{pipe, pipe_reader};
pub use registry::StreamRegistry;
pub use stream::{DuplexStream, ReadState, StreamEvent, WriteState};

/// A value graph holding live streams.
pub type SessionValue = streamplex_codec::Value<DuplexStream>;
