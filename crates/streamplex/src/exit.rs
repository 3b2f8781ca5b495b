use std::fmt;
use std::io;

use streamplex_channel::ChannelError;
use streamplex_session::{MuxError, StreamError};

// Process exit codes; 124 matches timeout(1).
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound | io::ErrorKind::BrokenPipe => FAILURE,
        io::ErrorKind::InvalidData => DATA_INVALID,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn mux_error(context: &str, err: MuxError) -> CliError {
    let code = match &err {
        MuxError::Config(_) | MuxError::ReservedEvent(_) => USAGE,
        MuxError::ProtocolMisuse(_) => DATA_INVALID,
        MuxError::Channel(ChannelError::BinaryUnsupported | ChannelError::Encoding(_)) => {
            DATA_INVALID
        }
        MuxError::Channel(ChannelError::Disconnected)
        | MuxError::Connection(_)
        | MuxError::Disconnected(_)
        | MuxError::AckDropped => FAILURE,
        MuxError::Channel(ChannelError::EventsTaken) | MuxError::NoRuntime => INTERNAL,
        MuxError::Stream(stream) => stream_code(stream),
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn stream_error(context: &str, err: StreamError) -> CliError {
    CliError::new(stream_code(&err), format!("{context}: {err}"))
}

fn stream_code(err: &StreamError) -> i32 {
    match err {
        StreamError::InvalidChunk(_)
        | StreamError::Channel(ChannelError::BinaryUnsupported | ChannelError::Encoding(_)) => {
            DATA_INVALID
        }
        StreamError::Closed
        | StreamError::Local(_)
        | StreamError::Remote(_)
        | StreamError::Disconnected(_)
        | StreamError::Channel(_) => FAILURE,
    }
}
