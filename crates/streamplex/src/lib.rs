//! Multiplexed duplex streams over event-based message channels.
//!
//! streamplex lets two peers connected by a bidirectional event channel pass
//! stream objects as ordinary event arguments. Each stream becomes a live,
//! flow-controlled duplex pipe between the peers, multiplexed over the one
//! channel.
//!
//! # Crate Structure
//!
//! - [`codec`]: value model, stream descriptors, graph encoding and the
//!   multiplex frame layout
//! - [`channel`]: the message channel abstraction and an in-memory pair
//! - [`session`]: per-channel multiplexer sessions and duplex streams
//!
//! The most used session types are re-exported at the crate root.

/// Re-export codec types.
pub mod codec {
    pub use streamplex_codec::*;
}

/// Re-export channel types.
pub mod channel {
    pub use streamplex_channel::*;
}

/// Re-export session types.
pub mod session {
    pub use streamplex_session::*;
}

pub use streamplex_channel::{MemoryChannel, MessageChannel};
pub use streamplex_codec::{StreamOptions, Value};
pub use streamplex_session::{
    pipe, pipe_reader, DuplexStream, IncomingEvent, Multiplexer, MuxConfig, MuxError,
    SessionValue, StreamError,
};
