//! Forwarding helpers between streams and plain readers.

use futures_util::StreamExt;
use streamplex_codec::Value;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::error::StreamError;
use crate::stream::DuplexStream;

/// Forward every chunk of `src` into `dst`, then end `dst`.
///
/// A failure on `src` fails `dst` with the same message. `src` and `dst` may
/// be the same stream, which echoes the peer's data back to it. Returns the
/// number of chunks forwarded.
pub async fn pipe(src: &DuplexStream, dst: &DuplexStream) -> Result<u64, StreamError> {
    let mut chunks = 0u64;
    while let Some(chunk) = src.read_chunk().await {
        match chunk {
            Ok(chunk) => {
                dst.write(chunk).await?;
                chunks += 1;
            }
            Err(err) => {
                debug!(src = src.id(), dst = dst.id(), error = %err, "pipe source failed");
                dst.fail(err.message());
                return Err(err);
            }
        }
    }
    if src.is_destroyed() && !dst.is_destroyed() {
        dst.destroy();
        return Err(StreamError::Closed);
    }
    dst.end()?;
    debug!(src = src.id(), dst = dst.id(), chunks, "pipe finished");
    Ok(chunks)
}

/// Copy a plain reader (file, socket, buffer) into `dst`, then end it.
///
/// A read error fails `dst`. Returns the number of bytes copied.
pub async fn pipe_reader<R>(reader: R, dst: &DuplexStream) -> Result<u64, StreamError>
where
    R: AsyncRead + Unpin,
{
    let mut source = ReaderStream::new(reader);
    let mut bytes = 0u64;
    while let Some(chunk) = source.next().await {
        match chunk {
            Ok(chunk) => {
                bytes += chunk.len() as u64;
                dst.write(Value::Bytes(chunk)).await?;
            }
            Err(err) => {
                let message = err.to_string();
                debug!(dst = dst.id(), error = %message, "pipe reader failed");
                dst.fail(message.as_str());
                return Err(StreamError::Local(message));
            }
        }
    }
    dst.end()?;
    Ok(bytes)
}
