use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Crates logging at the level chosen on the command line.
const STREAMPLEX_TARGETS: [&str; 4] = [
    "streamplex",
    "streamplex_codec",
    "streamplex_channel",
    "streamplex_session",
];

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// `level` for the streamplex crates; everything else (tokio, ...) is capped
/// at warn.
pub fn targets(level: LogLevel) -> Targets {
    let level = level.as_filter();
    STREAMPLEX_TARGETS.iter().fold(
        Targets::new().with_default(level.min(LevelFilter::WARN)),
        |targets, crate_name| targets.with_target(*crate_name, level),
    )
}

/// Session and stream logs go to stderr so stdout stays machine readable.
pub fn init_logging(format: LogFormat, level: LogLevel) {
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true);
    let registry = tracing_subscriber::registry().with(targets(level));

    let _ = match format {
        LogFormat::Text => registry.with(layer).try_init(),
        LogFormat::Json => registry.with(layer.json()).try_init(),
    };
}
