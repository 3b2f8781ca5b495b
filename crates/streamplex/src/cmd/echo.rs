use serde::Serialize;
use streamplex_codec::Value;
use streamplex_session::DuplexStream;
use tokio::io::AsyncReadExt;

use crate::cmd::loopback::{Loopback, ECHO_EVENT};
use crate::cmd::{block_on_with_timeout, parse_duration, EchoArgs};
use crate::exit::{
    io_error, mux_error, stream_error, CliError, CliResult, DATA_INVALID, INTERNAL, SUCCESS,
    USAGE,
};
use crate::output::{print_report, OutputFormat, Report};

#[derive(Debug, Serialize)]
pub struct EchoReport {
    pub streams: usize,
    pub bytes_sent: u64,
    pub bytes_echoed: u64,
    pub frames: u64,
    pub events: u64,
    pub base64: bool,
    pub open_streams: usize,
    pub matched: bool,
    #[serde(skip)]
    echoed: Vec<u8>,
}

impl Report for EchoReport {
    fn rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("streams", self.streams.to_string()),
            ("bytes_sent", self.bytes_sent.to_string()),
            ("bytes_echoed", self.bytes_echoed.to_string()),
            ("frames", self.frames.to_string()),
            ("events", self.events.to_string()),
            ("base64", self.base64.to_string()),
            ("open_streams", self.open_streams.to_string()),
            ("matched", self.matched.to_string()),
        ]
    }

    fn raw(&self) -> &[u8] {
        &self.echoed
    }
}

pub fn run(args: EchoArgs, format: OutputFormat) -> CliResult<i32> {
    if args.streams == 0 {
        return Err(CliError::new(USAGE, "--streams must be at least 1"));
    }
    let timeout = parse_duration(&args.loopback.timeout)?;
    let report = block_on_with_timeout(timeout, exchange(&args))?;

    print_report(&report, format);
    if report.matched {
        Ok(SUCCESS)
    } else {
        Err(CliError::new(DATA_INVALID, "echoed bytes differ from sent bytes"))
    }
}

async fn exchange(args: &EchoArgs) -> CliResult<EchoReport> {
    let loopback = Loopback::start(&args.loopback)?;
    let payload = args.data.as_bytes().repeat(args.repeat);

    let streams: Vec<DuplexStream> = (0..args.streams).map(|_| loopback.stream()).collect();
    let reply = loopback
        .client
        .emit_with_ack(
            ECHO_EVENT,
            streams.iter().cloned().map(Value::Stream).collect(),
        )
        .map_err(|err| mux_error("echo emit failed", err))?;

    // Writers run beside the readers so backpressure can release them.
    let mut writers = Vec::with_capacity(streams.len());
    for stream in streams {
        let data = args.data.clone();
        let repeat = args.repeat;
        writers.push(tokio::spawn(async move {
            for _ in 0..repeat {
                stream.write(data.as_bytes()).await?;
            }
            stream.end()
        }));
    }

    let echoed_streams = reply
        .await
        .map_err(|err| mux_error("echo reply failed", err))?;

    let mut echoed = Vec::new();
    let mut matched = echoed_streams.len() == args.streams;
    for value in &echoed_streams {
        let Some(stream) = value.as_stream() else {
            matched = false;
            continue;
        };
        let mut reader = stream.clone();
        let mut received = Vec::new();
        reader
            .read_to_end(&mut received)
            .await
            .map_err(|err| io_error("echo read failed", err))?;
        tracing::info!(stream_id = stream.id(), bytes = received.len(), "stream echoed");
        matched &= received == payload;
        echoed.extend_from_slice(&received);
    }

    for writer in writers {
        writer
            .await
            .map_err(|err| CliError::new(INTERNAL, format!("writer task failed: {err}")))?
            .map_err(|err| stream_error("echo write failed", err))?;
    }

    loopback.settled().await;
    let report = EchoReport {
        streams: args.streams,
        bytes_sent: (payload.len() * args.streams) as u64,
        bytes_echoed: echoed.len() as u64,
        frames: loopback.frames(),
        events: loopback.events(),
        base64: loopback.uses_base64(),
        open_streams: loopback.open_streams(),
        matched,
        echoed,
    };
    loopback.shutdown();
    Ok(report)
}
