//! Two sessions over an in-memory channel pair: the client sends a stream,
//! the server pipes it back on a stream of its own.
//!
//! Run with:
//!   cargo run -p streamplex --example echo

use streamplex::{pipe, DuplexStream, MemoryChannel, Multiplexer, Value};
use tokio::io::AsyncReadExt;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (client_side, server_side) = MemoryChannel::pair();
    let client = Multiplexer::lookup(&client_side)?;
    let server = Multiplexer::lookup(&server_side)?;

    server.on("upper", |incoming| {
        let (Some(src), Some(ack)) = (incoming.stream(0), incoming.ack) else {
            return;
        };
        let dst = DuplexStream::with_options(src.options());
        let out = dst.clone();
        tokio::spawn(async move {
            while let Some(Ok(chunk)) = src.read_chunk().await {
                let bytes = chunk.as_bytes().map(|b| b.to_vec()).unwrap_or_default();
                let text = String::from_utf8_lossy(&bytes).to_uppercase();
                if out.write(text).await.is_err() {
                    return;
                }
            }
            let _ = out.end();
        });
        if let Err(err) = ack.send(vec![Value::Stream(dst)]) {
            eprintln!("reply failed: {err}");
        }
    });

    let upload = DuplexStream::new();
    let reply = client.emit_with_ack("upper", vec![Value::Stream(upload.clone())])?;
    for word in ["hello ", "from ", "streamplex"] {
        upload.write(word).await?;
    }
    upload.end()?;

    let args = reply.await?;
    let Some(download) = args.first().and_then(|value| value.as_stream()) else {
        return Err("server replied without a stream".into());
    };
    let mut reader = download.clone();
    let mut text = String::new();
    reader.read_to_string(&mut text).await?;
    println!("{text}");

    // Streams can also be echoed back on themselves.
    server.on("loop", |incoming| {
        for stream in incoming.streams() {
            tokio::spawn(async move {
                let _ = pipe(&stream, &stream).await;
            });
        }
    });
    let looped = DuplexStream::new();
    client.emit("loop", vec![Value::Stream(looped.clone())])?;
    looped.write("round trip").await?;
    looped.end()?;
    let mut reader = looped.clone();
    let mut text = String::new();
    reader.read_to_string(&mut text).await?;
    println!("{text}");

    client_side.disconnect();
    Ok(())
}
