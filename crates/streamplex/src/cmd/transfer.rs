use std::path::Path;
use std::time::Instant;

use serde::Serialize;
use streamplex_codec::Value;
use streamplex_session::pipe_reader;
use tokio::io::AsyncReadExt;

use crate::cmd::loopback::{Loopback, ECHO_EVENT};
use crate::cmd::{block_on_with_timeout, parse_duration, TransferArgs};
use crate::exit::{
    io_error, mux_error, stream_error, CliError, CliResult, DATA_INVALID, FAILURE, INTERNAL,
    SUCCESS,
};
use crate::output::{digest, print_report, OutputFormat, Report};

#[derive(Debug, Serialize)]
pub struct TransferReport {
    pub path: String,
    pub bytes_sent: u64,
    pub bytes_echoed: u64,
    pub digest_sent: String,
    pub digest_echoed: String,
    pub frames: u64,
    pub base64: bool,
    pub elapsed_ms: u64,
    pub matched: bool,
    #[serde(skip)]
    echoed: Vec<u8>,
}

impl Report for TransferReport {
    fn rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("path", self.path.clone()),
            ("bytes_sent", self.bytes_sent.to_string()),
            ("bytes_echoed", self.bytes_echoed.to_string()),
            ("digest_sent", self.digest_sent.clone()),
            ("digest_echoed", self.digest_echoed.clone()),
            ("frames", self.frames.to_string()),
            ("base64", self.base64.to_string()),
            ("elapsed_ms", self.elapsed_ms.to_string()),
            ("matched", self.matched.to_string()),
        ]
    }

    fn raw(&self) -> &[u8] {
        &self.echoed
    }
}

pub fn run(args: TransferArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.loopback.timeout)?;
    let report = block_on_with_timeout(timeout, transfer(&args))?;

    print_report(&report, format);
    if report.matched {
        Ok(SUCCESS)
    } else {
        Err(CliError::new(
            DATA_INVALID,
            format!(
                "echoed digest {} differs from sent digest {}",
                report.digest_echoed, report.digest_sent
            ),
        ))
    }
}

async fn transfer(args: &TransferArgs) -> CliResult<TransferReport> {
    let started = Instant::now();
    let expected = read_source(&args.path).await?;
    let file = tokio::fs::File::open(&args.path)
        .await
        .map_err(|err| io_error("open failed", err))?;

    let loopback = Loopback::start(&args.loopback)?;
    let upload = loopback.stream();
    let reply = loopback
        .client
        .emit_with_ack(ECHO_EVENT, vec![Value::Stream(upload.clone())])
        .map_err(|err| mux_error("transfer emit failed", err))?;
    let writer = tokio::spawn(async move { pipe_reader(file, &upload).await });

    let args_back = reply
        .await
        .map_err(|err| mux_error("transfer reply failed", err))?;
    let Some(download) = args_back.first().and_then(|value| value.as_stream()).cloned() else {
        return Err(CliError::new(FAILURE, "peer replied without a stream"));
    };

    let mut reader = download.clone();
    let mut echoed = Vec::with_capacity(expected.len());
    reader
        .read_to_end(&mut echoed)
        .await
        .map_err(|err| io_error("transfer read failed", err))?;

    let bytes_sent = writer
        .await
        .map_err(|err| CliError::new(INTERNAL, format!("writer task failed: {err}")))?
        .map_err(|err| stream_error("transfer write failed", err))?;

    let report = TransferReport {
        path: args.path.display().to_string(),
        bytes_sent,
        bytes_echoed: echoed.len() as u64,
        digest_sent: digest(&expected),
        digest_echoed: digest(&echoed),
        frames: loopback.frames(),
        base64: loopback.uses_base64(),
        elapsed_ms: started.elapsed().as_millis() as u64,
        matched: echoed == expected,
        echoed,
    };
    tracing::info!(
        bytes = report.bytes_echoed,
        frames = report.frames,
        matched = report.matched,
        "transfer finished"
    );
    loopback.shutdown();
    Ok(report)
}

async fn read_source(path: &Path) -> CliResult<Vec<u8>> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|err| io_error("open failed", err))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .await
        .map_err(|err| io_error("read failed", err))?;
    Ok(data)
}
