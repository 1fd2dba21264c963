use std::io::{self, IsTerminal};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, prelude::*};

#[derive(Default, Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    Silent,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl From<Level> for LevelFilter {
    fn from(level: Level) -> LevelFilter {
        match level {
            Level::Silent => LevelFilter::OFF,
            Level::Error => LevelFilter::ERROR,
            Level::Warn => LevelFilter::WARN,
            Level::Info => LevelFilter::INFO,
            Level::Debug => LevelFilter::DEBUG,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LogFormat {
    /// Compact human-readable lines (default).
    #[default]
    Full,
    /// A pretty multi-line format used for debugging.
    Pretty,
    /// A JSON log format used for machine consumption.
    Json,
}

/// Install the global subscriber. Logs always go to stderr so that stdout
/// carries only command output.
///
/// `RUST_LOG` overrides `level`.
pub fn init_tracing(level: Level, log_format: LogFormat) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(level).into())
        .from_env_lossy();

    let stderr = io::stderr;
    let ansi = stderr().is_terminal();

    match log_format {
        LogFormat::Full => {
            let stderr_layer = tracing_subscriber::fmt::layer()
                .with_writer(stderr)
                .with_ansi(ansi)
                .with_target(false);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
        }
        LogFormat::Pretty => {
            let stderr_layer = tracing_subscriber::fmt::layer()
                .with_writer(stderr)
                .with_ansi(ansi)
                .pretty();
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
        }
        LogFormat::Json => {
            let stderr_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(stderr)
                .with_current_span(false);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
        }
    }
}
