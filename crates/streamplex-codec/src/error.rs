/// Errors that can occur while encoding value graphs or parsing frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// A destroyed stream was embedded in an outgoing value.
    #[error("cannot send destroyed stream {id}")]
    DestroyedStream { id: String },

    /// A locally created stream was embedded after it had already been sent.
    #[error("stream {id} has already been sent")]
    AlreadySent { id: String },

    /// A multiplex frame is missing a field or has the wrong shape.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A multiplex frame carries an unrecognized `type`.
    #[error("unknown frame type '{0}'")]
    UnknownFrameKind(String),

    /// A base64 DATA payload could not be decoded.
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

pub type Result<T> = std::result::Result<T, CodecError>;
