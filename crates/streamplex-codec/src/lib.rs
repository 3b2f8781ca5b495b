//! Stream-aware value graph codec and multiplex frame layout.
//!
//! This is the wire layer of streamplex. Event arguments are value graphs
//! that may embed live streams anywhere inside arrays and objects:
//! - [`Encoder`] swaps every embedded stream for a [`StreamDescriptor`]
//! - [`Decoder`] turns descriptors back into streams through a [`StreamResolver`]
//! - [`MuxFrame`] is the per-stream DATA/END/ERROR/PAUSE/RESUME control frame
//!
//! Descriptors and frames are the only bit-exact contracts between peers;
//! [`wire`] gives wire values their serde form for text transports.

pub mod descriptor;
pub mod error;
pub mod frame;
pub mod graph;
pub mod value;
pub mod wire;

pub use descriptor::{Direction, StreamDescriptor, StreamOptions};
pub use error::{CodecError, Result};
pub use frame::{FrameKind, MuxFrame, BASE64_ENCODING, MUX_EVENT};
pub use graph::{Decoder, Encoder, StreamHandle, StreamResolver};
pub use value::{PlainValue, Value, WireValue};
