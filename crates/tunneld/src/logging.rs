//! Logger construction: console and file sinks built from the `[log]`
//! configuration section.
//!
//! The console sink honors `log.severity.console` (overridable through the
//! `RUST_LOG` environment variable); the file sink honors
//! `log.severity.file` independently. With rotation enabled the file sink
//! rolls daily under `log.directory`; otherwise it appends to a single
//! `log.filename`.

use anyhow::{bail, Context, Result};
use time::format_description::{self, OwnedFormatItem};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LogConfig;

/// Keeps the file sink's background writer alive; dropping it flushes and
/// stops the writer thread.
pub struct LogGuard {
    _file_writer: Option<WorkerGuard>,
}

/// Map a configured severity name onto a tracing level filter.
///
/// `fatal` collapses onto `error`, the most severe level tracing has.
fn severity_filter(name: &str) -> Result<LevelFilter> {
    Ok(match name {
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warning" => LevelFilter::WARN,
        "error" | "fatal" => LevelFilter::ERROR,
        other => bail!("unknown log severity {other:?}"),
    })
}

/// Install the global subscriber described by `config`.
///
/// Must be called at most once per process; returns the guard keeping the
/// file writer alive for the life of the program.
pub fn init(config: &LogConfig) -> Result<LogGuard> {
    let timer_format: OwnedFormatItem = format_description::parse_owned::<2>(&config.format)
        .with_context(|| format!("invalid log.format {:?}", config.format))?;

    let console = if config.silent {
        None
    } else {
        let level = severity_filter(&config.severity.console)?;
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
        Some(
            fmt::layer()
                .with_timer(UtcTime::new(timer_format.clone()))
                .with_filter(filter),
        )
    };

    let (file, guard) = if config.nofile {
        (None, None)
    } else {
        let level = severity_filter(&config.severity.file)?;
        let (rotation, file_name) = if config.rotate.enabled {
            (Rotation::DAILY, &config.rotate.filename)
        } else {
            (Rotation::NEVER, &config.filename)
        };
        let appender = RollingFileAppender::builder()
            .rotation(rotation)
            .filename_prefix(file_name.clone())
            .build(&config.directory)
            .with_context(|| format!("could not open log directory {:?}", config.directory))?;
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .with_timer(UtcTime::new(timer_format))
            .with_filter(level);
        (Some(layer), Some(guard))
    };

    tracing_subscriber::registry().with(console).with(file).init();

    Ok(LogGuard {
        _file_writer: guard,
    })
}
