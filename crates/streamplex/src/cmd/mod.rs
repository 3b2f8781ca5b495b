use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};

use crate::exit::{io_error, CliError, CliResult, TIMEOUT, USAGE};
use crate::output::OutputFormat;

pub mod echo;
pub mod loopback;
pub mod transfer;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Echo payloads through streams over an in-memory channel pair.
    Echo(EchoArgs),
    /// Stream a file to a loopback peer and verify the echoed bytes.
    Transfer(TransferArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Echo(args) => echo::run(args, format),
        Command::Transfer(args) => transfer::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

/// Session and channel settings shared by the loopback commands.
#[derive(Args, Debug, Clone)]
pub struct LoopbackArgs {
    /// Send DATA payloads base64-encoded.
    #[arg(long, env = "STREAMPLEX_FORCE_BASE64")]
    pub force_base64: bool,
    /// Simulate a channel that only carries text.
    #[arg(long)]
    pub text_only: bool,
    /// Per-stream high-water mark in bytes.
    #[arg(long, value_name = "BYTES")]
    pub high_water_mark: Option<usize>,
    /// Give up after this long (e.g. 5s, 500ms).
    #[arg(long, default_value = "10s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct EchoArgs {
    /// Payload written to each stream.
    #[arg(long, default_value = "foobar")]
    pub data: String,
    /// Number of streams carried by the echo event.
    #[arg(long, default_value = "1")]
    pub streams: usize,
    /// How many times the payload is written per stream.
    #[arg(long, default_value = "1")]
    pub repeat: usize,
    #[command(flatten)]
    pub loopback: LoopbackArgs,
}

#[derive(Args, Debug)]
pub struct TransferArgs {
    /// File to stream.
    pub path: PathBuf,
    #[command(flatten)]
    pub loopback: LoopbackArgs,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}

/// Run `work` on a fresh runtime, bounded by `timeout`.
pub(crate) fn block_on_with_timeout<F, T>(timeout: Duration, work: F) -> CliResult<T>
where
    F: std::future::Future<Output = CliResult<T>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| io_error("runtime start failed", err))?;

    runtime.block_on(async {
        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(CliError::new(
                TIMEOUT,
                format!("timed out after {}ms", timeout.as_millis()),
            )),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2").unwrap(), Duration::from_secs(2));
    }

    #[test]
    fn parse_duration_millis() {
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
    }

    #[test]
    fn parse_duration_invalid() {
        assert_eq!(parse_duration("0s").unwrap_err().code, USAGE);
        assert_eq!(parse_duration("bad").unwrap_err().code, USAGE);
        assert_eq!(parse_duration(" ").unwrap_err().code, USAGE);
    }

    #[test]
    fn timeout_maps_to_124() {
        let err = block_on_with_timeout(Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .unwrap_err();
        assert_eq!(err.code, TIMEOUT);
    }
}
