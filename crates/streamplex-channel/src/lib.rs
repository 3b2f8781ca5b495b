//! Event message channel abstraction.
//!
//! A message channel delivers named events with ordered, variadic arguments
//! and an optional acknowledgment callback, plus lifecycle notifications.
//! This is the lowest layer of streamplex: sessions only ever talk to a
//! [`MessageChannel`].
//!
//! [`MemoryChannel`] is an in-process channel pair with FIFO delivery, used
//! for tests and loopback tooling.

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{ChannelError, Result};
pub use memory::MemoryChannel;
pub use traits::{
    is_lifecycle_event, AckCallback, ChannelEvent, ChannelId, MessageChannel, CONNECT,
    CONNECT_ERROR, DISCONNECT, ERROR,
};
