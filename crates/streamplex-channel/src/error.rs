/// Errors that can occur when sending over a message channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The channel is no longer connected.
    #[error("channel disconnected")]
    Disconnected,

    /// The channel only carries text and a binary value was sent.
    #[error("channel does not accept binary payloads")]
    BinaryUnsupported,

    /// The arguments could not be carried as text.
    #[error("payload not representable as text: {0}")]
    Encoding(String),

    /// The inbound event receiver was already handed out.
    #[error("channel events already taken")]
    EventsTaken,
}

pub type Result<T> = std::result::Result<T, ChannelError>;
