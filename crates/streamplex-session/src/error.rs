use streamplex_channel::ChannelError;
use streamplex_codec::CodecError;

/// Errors that can occur in session operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MuxError {
    /// A stream in the outgoing arguments was destroyed or already sent.
    #[error("protocol misuse: {0}")]
    ProtocolMisuse(#[from] CodecError),

    /// The application tried to emit the reserved stream frame event.
    #[error("event name '{0}' is reserved for stream frames")]
    ReservedEvent(String),

    /// Channel-level error while sending.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// The session configuration is invalid.
    #[error("invalid session configuration: {0}")]
    Config(String),

    /// The underlying channel failed to connect.
    #[error("connection error: {0}")]
    Connection(String),

    /// The underlying channel dropped.
    #[error("session disconnected: {0}")]
    Disconnected(String),

    /// Sessions must be created from within a tokio runtime.
    #[error("no tokio runtime available to drive the session")]
    NoRuntime,

    /// The peer never answered an acknowledgment request.
    #[error("acknowledgment dropped before a reply arrived")]
    AckDropped,

    /// A stream operation failed.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
}

pub type Result<T> = std::result::Result<T, MuxError>;

/// Errors reported by a single duplex stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Write after end or destroy.
    #[error("stream closed")]
    Closed,

    /// The chunk does not fit the stream mode.
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    /// The local side failed.
    #[error("{0}")]
    Local(String),

    /// The remote side sent an ERROR frame.
    #[error("remote stream error: {0}")]
    Remote(String),

    /// The session's channel dropped while the stream was active.
    #[error("connection lost: {0}")]
    Disconnected(String),

    /// A frame of this stream could not be handed to the channel.
    #[error("frame send failed: {0}")]
    Channel(ChannelError),
}

impl StreamError {
    /// Message carried by the error, without the variant prefix.
    pub fn message(&self) -> String {
        match self {
            StreamError::Local(msg) | StreamError::Remote(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

impl From<StreamError> for std::io::Error {
    fn from(err: StreamError) -> Self {
        let kind = match err {
            StreamError::Closed => std::io::ErrorKind::BrokenPipe,
            StreamError::InvalidChunk(_) => std::io::ErrorKind::InvalidData,
            StreamError::Disconnected(_) | StreamError::Channel(ChannelError::Disconnected) => {
                std::io::ErrorKind::ConnectionAborted
            }
            StreamError::Channel(_) => std::io::ErrorKind::Unsupported,
            StreamError::Local(_) | StreamError::Remote(_) => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_strips_prefix() {
        assert_eq!(StreamError::Remote("boom".into()).message(), "boom");
        assert_eq!(StreamError::Local("boom".into()).to_string(), "boom");
        assert_eq!(StreamError::Closed.message(), "stream closed");
    }

    #[test]
    fn codec_errors_are_protocol_misuse() {
        let err: MuxError = CodecError::AlreadySent { id: "s".into() }.into();
        assert!(matches!(err, MuxError::ProtocolMisuse(_)));
        assert_eq!(err.to_string(), "protocol misuse: stream s has already been sent");
    }

    #[test]
    fn stream_errors_map_to_io_kinds() {
        let io: std::io::Error = StreamError::Closed.into();
        assert_eq!(io.kind(), std::io::ErrorKind::BrokenPipe);
        let io: std::io::Error = StreamError::Disconnected("gone".into()).into();
        assert_eq!(io.kind(), std::io::ErrorKind::ConnectionAborted);
        let io: std::io::Error = StreamError::Channel(ChannelError::BinaryUnsupported).into();
        assert_eq!(io.kind(), std::io::ErrorKind::Unsupported);
    }

    #[test]
    fn stream_errors_propagate_as_session_errors() {
        fn write_then_fail() -> Result<()> {
            Err(StreamError::Closed)?;
            Ok(())
        }
        assert_eq!(write_then_fail(), Err(MuxError::Stream(StreamError::Closed)));
        assert_eq!(
            MuxError::from(StreamError::Closed).to_string(),
            "stream error: stream closed"
        );
    }
}
